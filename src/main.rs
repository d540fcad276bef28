use std::{
    fs,
    io::{self, Write},
};

use anyhow::{anyhow, bail};
use clap::{crate_version, App, Arg, ArgMatches};
use kaleidoscope_jit::{
    codegen::Backend,
    driver::{Driver, DriverOptions},
    ir::Module,
    lexer::{CharSource, ReadChars},
};

const MODULE_NAME: &str = "kaleidoscope";

fn options(matches: &ArgMatches) -> DriverOptions {
    let defaults = DriverOptions::default();
    DriverOptions {
        prompt: if matches.is_present("quiet") {
            None
        } else {
            defaults.prompt
        },
        print_ir: matches.is_present("print-ir"),
        evaluate: !matches.is_present("no-eval"),
    }
}

/// Runs the loop over `chars` and returns the number of failed constructs.
fn drive<B: Backend>(
    backend: B,
    chars: impl CharSource,
    options: DriverOptions,
) -> anyhow::Result<usize> {
    let print_ir = options.print_ir;
    let mut driver = Driver::new(backend, chars, options, io::stdout(), io::stderr());
    let failures = driver.run()?;

    if print_ir {
        let mut stdout = io::stdout();
        writeln!(stdout, "{}", driver.backend().print_module())?;
    }
    if driver.input_failed() {
        bail!("input ended early on a read error");
    }
    Ok(failures)
}

#[cfg(feature = "llvm")]
fn drive_llvm(
    chars: impl CharSource,
    options: DriverOptions,
) -> anyhow::Result<usize> {
    let context = inkwell::context::Context::create();
    let backend = kaleidoscope_jit::llvm::LlvmBackend::new(&context, MODULE_NAME);
    drive(backend, chars, options)
}

#[cfg(not(feature = "llvm"))]
fn drive_llvm(
    _chars: impl CharSource,
    _options: DriverOptions,
) -> anyhow::Result<usize> {
    bail!("this build does not include the llvm backend, rebuild with --features llvm")
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("kaleidoscope")
        .version(crate_version!())
        .about("Lower and run programs in a tiny expression language")
        .arg(
            Arg::with_name("FILE")
                .help("Source file to read, or - for stdin (the default)")
                .index(1),
        )
        .arg(
            Arg::with_name("print-ir")
                .long("print-ir")
                .help("Print the IR of each lowered function and the final module"),
        )
        .arg(
            Arg::with_name("no-eval")
                .long("no-eval")
                .help("Lower top-level expressions without running them"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Do not print the ready> prompt"),
        )
        .arg(
            Arg::with_name("backend")
                .long("backend")
                .takes_value(true)
                .possible_values(&["memory", "llvm"])
                .default_value("memory")
                .help("IR library to lower into"),
        )
        .get_matches();

    let options = options(&matches);
    let from_file = matches.value_of("FILE").filter(|path| *path != "-");

    let failures = match from_file {
        Some(path) => {
            let source = fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read {}: {}", path, e))?;
            let chars = source.chars();
            match matches.value_of("backend") {
                Some("llvm") => drive_llvm(chars, options)?,
                _ => drive(Module::new(MODULE_NAME), chars, options)?,
            }
        }
        None => {
            let stdin = io::stdin();
            let chars = ReadChars::new(stdin.lock());
            match matches.value_of("backend") {
                Some("llvm") => drive_llvm(chars, options)?,
                _ => drive(Module::new(MODULE_NAME), chars, options)?,
            }
        }
    };

    if from_file.is_some() && failures > 0 {
        bail!("{} top-level constructs failed", failures);
    }

    Ok(())
}
