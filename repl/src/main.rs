use anyhow::Result;
use irvm::{assemble_chunk, format_value, init_logging, stdlib_registry, Executor};
use rustyline::{error::ReadlineError, Editor};

const LINE_CHUNK: &str = "line";

const HELP: &str = r"Each line is assembled as its own chunk and run against the same executor.
The chunk replaces the previous line's, while the stack and heap carry over.
Separate instructions on one line with '|', e.g. 'pushi 2 | pushi 3 | addi'.
Meta-commands:
    :stack   dump the operand stack
    :vars    dump the variable frames
    :gc      run a collection
    :dis     disassemble the last line
    :help    show this message";

fn main() -> Result<()> {
    init_logging();
    println!(
        r"
Welcome to the irvm REPL!
You may type bytecode instructions below for execution.
Enter ':help' for commands, 'exit' or press 'CTRL+C' to exit the REPL.
    "
    );

    let mut rl = Editor::<()>::new();
    if rl.load_history("history.txt").is_err() {
        println!("No previous history.");
    }

    let mut exec = Executor::with_memory(irvm::DEFAULT_MEMORY_MAX)?;
    exec.set_resolver(stdlib_registry().into_resolver());

    loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) => match line.trim() {
                "exit" => break,
                "" => continue,
                line => {
                    rl.add_history_entry(line);
                    match line {
                        ":stack" => print!("{}", exec.dump_stack()),
                        ":vars" => print!("{}", exec.dump_variables()),
                        ":help" => println!("{}", HELP),
                        ":gc" => match exec.collect() {
                            Ok(stats) => println!(
                                "freed {} bytes ({} chunks), {} bytes live",
                                stats.freed_bytes, stats.chunks_deleted, stats.live_bytes
                            ),
                            Err(error) => eprintln!("Error collecting: {}", error),
                        },
                        ":dis" => match exec.chunks().last() {
                            Some(chunk) => print!("{}", chunk.disassemble()),
                            None => println!("Nothing assembled yet."),
                        },
                        line => run_line(&mut exec, line),
                    }
                }
            },
            Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history("history.txt")?;
    Ok(())
}

fn run_line(exec: &mut Executor, line: &str) {
    let source = format!("entry:\n{}", line.replace('|', "\n"));

    let chunk = match assemble_chunk(LINE_CHUNK, &source) {
        Ok(chunk) => chunk,
        Err(error) => {
            eprintln!("Error assembling: {:#}", error);
            return;
        }
    };
    exec.remove_bytecode(LINE_CHUNK);
    exec.add_bytecode(chunk);

    if exec.run(LINE_CHUNK, "entry").is_err() {
        eprintln!("Error running: {}", exec.last_error());
    }
    print_stack(exec);
}

fn print_stack(exec: &Executor) {
    let values = exec
        .stack()
        .iter()
        .map(|value| format_value(exec, value).unwrap_or_else(|error| error.to_string()))
        .collect::<Vec<_>>();
    println!("[{}]", values.join(", "));
}
