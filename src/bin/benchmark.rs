use anyhow::{anyhow, Result};
use irvm::{assemble, init_logging, stdlib_registry, ExecConfig, Executor};
use std::thread;
use std::time::{Duration, Instant};

const ARITHMETIC: &str = r#"
entry:
    pushi 0
    store 0
    pushi 0
    store 1
loop:
    load 1
    pushi 100000
    moreeqi
    if <done>
    load 0
    load 1
    addi
    store 0
    load 1
    pushi 1
    addi
    store 1
    jmp <loop>
done:
    load 0
"#;

const LIST_BUILDING: &str = r#"
entry:
    pushl
loop:
    dup
    dup
    lenl
    addl
    dup
    lenl
    pushi 10000
    lessi
    if <loop>
"#;

const GC_PRESSURE: &str = r#"
entry:
    pushi 0
    store 0
loop:
    load 0
    itoa
    pop
    load 0
    tof
    ftoa
    pop
    load 0
    pushi 1
    addi
    dup
    store 0
    pushi 20000
    lessi
    if <loop>
"#;

const RECURSION: &str = r#"
entry:
    pushi 20
    call <fib>
    ret
fib:
    store 0
    load 0
    pushi 2
    lessi
    if <small>
    load 0
    pushi 1
    subi
    call <fib>
    load 0
    pushi 2
    subi
    call <fib>
    addi
    ret
small:
    load 0
"#;

const NATIVE_CALLS: &str = r#"
entry:
    pushi 0
loop:
    pushi 3
    run "square"
    addi
    dup
    pushi 1000000
    lessi
    if <loop>
"#;

const ITERATIONS: u32 = 20;

fn run_program(source: &str, memory: usize, iterations: u32) -> Result<Duration> {
    let chunks = assemble(source)?;

    let mut total_time = Duration::ZERO;
    for _ in 0..iterations {
        let mut exec = Executor::new(ExecConfig::with_memory(memory))?;
        exec.set_resolver(stdlib_registry().into_resolver());
        for chunk in chunks.iter().cloned() {
            exec.add_bytecode(chunk);
        }
        let start = Instant::now();
        exec.run("main", "entry")?;
        total_time += start.elapsed();
    }
    Ok(total_time)
}

fn benchmark(name: &str, source: &str, memory: usize) {
    println!("{}:", name);
    match run_program(source, memory, ITERATIONS) {
        Ok(time) => {
            let per_iter = time.as_secs_f64() / ITERATIONS as f64 * 1000.0;
            println!("  {:.3}ms/iter", per_iter);
        }
        Err(error) => eprintln!("  Error: {:#}", error),
    }
    println!();
}

fn run_benchmarks() {
    println!("=== irvm executor benchmarks ===");
    println!("({} iterations per benchmark)\n", ITERATIONS);

    benchmark("Arithmetic loop (100k iterations)", ARITHMETIC, 1024 * 1024);
    benchmark("List building (10k appends)", LIST_BUILDING, 4 * 1024 * 1024);
    benchmark("Collection pressure (40k strings, 64 KiB arenas)", GC_PRESSURE, 64 * 1024);
    benchmark("Recursion (fib 20)", RECURSION, 1024 * 1024);
    benchmark("Native calls (111k run)", NATIVE_CALLS, 1024 * 1024);
}

fn main() -> Result<()> {
    init_logging();
    let builder = thread::Builder::new().stack_size(32 * 1024 * 1024);
    let handler = builder.spawn(run_benchmarks)?;
    handler
        .join()
        .map_err(|_| anyhow!("benchmark thread panicked"))
}
