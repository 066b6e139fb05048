use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use irvm::{assemble, init_gc_logging, init_logging, stdlib_registry, ExecConfig, Executor};

#[derive(Parser)]
#[command(name = "irvm")]
#[command(about = "Assemble and run an irvm bytecode program")]
struct Cli {
    file: String,

    /// Chunk to start in
    #[arg(long, default_value = "main")]
    chunk: String,

    /// Label to start at
    #[arg(long, default_value = "entry")]
    entry: String,

    /// Print the disassembly of every chunk before running
    #[arg(long)]
    disasm: bool,

    /// Print the operand stack and variables after the run
    #[arg(long)]
    dump: bool,

    /// Size of each heap arena in bytes
    #[arg(long, default_value_t = irvm::DEFAULT_MEMORY_MAX)]
    memory: usize,

    /// Maximum guest call depth
    #[arg(long, default_value_t = irvm::DEFAULT_MAX_CALL_DEPTH)]
    max_depth: usize,

    /// Leave the inactive arena accessible
    #[arg(long)]
    no_guard: bool,

    /// Log every garbage collection
    #[arg(long)]
    trace_gc: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.trace_gc {
        init_gc_logging();
    } else {
        init_logging();
    }

    let source = fs::read_to_string(&cli.file)
        .with_context(|| format!("Failed to read file: {}", cli.file))?;
    let chunks = assemble(&source).context("Assembler error")?;

    if cli.disasm {
        for chunk in &chunks {
            print!("{}", chunk.disassemble());
        }
    }

    let config = ExecConfig {
        memory_max: cli.memory,
        max_call_depth: cli.max_depth,
        guard_inactive: !cli.no_guard,
        ..ExecConfig::default()
    };
    let mut exec = Executor::new(config).context("Exec create error")?;
    exec.set_resolver(stdlib_registry().into_resolver());
    for chunk in chunks {
        exec.add_bytecode(chunk);
    }

    let result = exec.run(&cli.chunk, &cli.entry);
    if cli.dump {
        print!("{}{}", exec.dump_stack(), exec.dump_variables());
    }
    if result.is_err() {
        println!("Runtime error: {}", exec.last_error());
        std::process::exit(1);
    }

    Ok(())
}
