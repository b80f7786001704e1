use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::exit;

use anyhow::Context;
use blang::{InterpretResult, VM};

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.len() {
        1 => repl(),
        _ => {
            if let Err(error) = run_file(&args[1]) {
                eprintln!("{:#}", error);
                exit(1);
            }
        }
    }
}

fn run_file(path: &str) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("could not read script '{}'", path))?;

    let module_name = Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("main")
        .to_string();

    let script_dir = Path::new(path)
        .parent()
        .map(|dir| dir.to_path_buf())
        .unwrap_or_default();

    let mut vm = VM::new();
    // Imports resolve relative to the script's directory.
    vm.set_module_resolver(move |name| {
        let file = script_dir.join(format!("{}.bl", name.replace('.', "/")));
        std::fs::read_to_string(file).ok()
    });

    match vm.evaluate(&module_name, &source) {
        InterpretResult::InterpretOk => Ok(()),
        InterpretResult::InterpretCompileError => exit(EXIT_COMPILE_ERROR),
        InterpretResult::InterpretRuntimeError => exit(EXIT_RUNTIME_ERROR),
    }
}

fn repl() {
    let mut vm = VM::new();
    let stdin = io::stdin();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            continue;
        }

        vm.evaluate("main", &line);
    }
}
