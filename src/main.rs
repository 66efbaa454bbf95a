// File: src/main.rs
//
// Main entry point for the depyc decompiler.
// Reads one .pyc file, reconstructs source, and prints it to stdout;
// --disassemble and --info expose the lower pipeline stages instead.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use depyc::engine::Decompiler;
use depyc::errors::DecompileError;
use depyc::marshal;
use depyc::opcode;
use depyc::printer;

#[derive(Parser)]
#[command(
    name = "depyc",
    about = "depyc: a CPython bytecode decompiler",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .pyc file
    file: PathBuf,

    /// Print the raw instruction listing instead of source
    #[arg(long)]
    disassemble: bool,

    /// Print code-object metadata as JSON instead of source
    #[arg(long)]
    info: bool,

    /// Enable debug logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data = match fs::read(&cli.file) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("depyc: cannot read {}: {}", cli.file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &data) {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                // Output was produced, but parts of it are guesses.
                ExitCode::from(2)
            }
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, data: &[u8]) -> Result<bool, DecompileError> {
    let (version, code) = marshal::load_pyc(data)?;

    if cli.info {
        let info = code.info();
        match serde_json::to_string_pretty(&info) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("depyc: cannot serialize metadata: {}", err),
        }
        return Ok(true);
    }

    if cli.disassemble {
        print!("{}", opcode::disassemble(&code, version)?);
        return Ok(true);
    }

    let mut decompiler = Decompiler::new(version);
    let module = decompiler.decompile_module(&code)?;
    print!("{}", printer::print_source(&module, version, decompiler.clean_build));
    Ok(decompiler.clean_build)
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "depyc=warn",
        1 => "depyc=debug",
        _ => "depyc=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
