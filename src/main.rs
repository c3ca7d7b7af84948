// File: src/main.rs
//
// Main entry point for the Strand command-line tool.
// Handles command-line argument parsing and dispatches to the appropriate
// subcommand (run, disasm, compile or exec).

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use strand::bytecode::{self, Function};
use strand::config::VmConfig;
use strand::debug::PrintInspector;
use strand::errors::StrandError;
use strand::value::Value;
use strand::vm::Vm;
use tracing_subscriber::EnvFilter;

const EXIT_COMPILE: u8 = 65;
const EXIT_FAULT: u8 = 70;
const EXIT_IO: u8 = 74;

#[derive(ClapParser)]
#[command(
    name = "strand",
    about = "Strand: a small scripting language on a fiber-based bytecode VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run a Strand script
    Run {
        /// Path to the .sd file
        file: PathBuf,

        /// Release mode: ignore `// @break` markers
        #[arg(short = 'r', long = "release")]
        release: bool,

        /// TOML file with VM settings
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the bytecode listing of a script
    Disasm {
        file: PathBuf,
    },

    /// Compile a script to a bytecode file
    Compile {
        file: PathBuf,

        /// Output path for the serialized bytecode
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// Run a previously compiled bytecode file
    Exec {
        file: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("STRAND_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { file, release, config } => load_config(config.as_deref()).and_then(|mut config| {
            if release {
                config.breakpoints = false;
            }
            let source = read_script(&file)?;
            let mut vm = new_vm(config);
            let function = strand::compile_source(&file.display().to_string(), &source, vm.context(), vm.config())?;
            execute(&mut vm, function)
        }),
        Commands::Disasm { file } => compile_file(&file).map(|function| {
            print!("{}", bytecode::disassemble(&function));
            ExitCode::SUCCESS
        }),
        Commands::Compile { file, output } => compile_file(&file).and_then(|function| {
            fs::write(&output, bytecode::serialize(&function)?)?;
            tracing::info!(output = %output.display(), "bytecode written");
            Ok(ExitCode::SUCCESS)
        }),
        Commands::Exec { file, config } => load_config(config.as_deref()).and_then(|config| {
            let text = read_script(&file)?;
            let function = bytecode::deserialize(&text)?;
            execute(&mut new_vm(config), function)
        }),
    };

    result.unwrap_or_else(|err| {
        eprintln!("{}", err);
        ExitCode::from(match err {
            StrandError::Compile(_) => EXIT_COMPILE,
            StrandError::Fault(_) | StrandError::Load(_) => EXIT_FAULT,
            StrandError::Io(_) => EXIT_IO,
        })
    })
}

fn load_config(path: Option<&Path>) -> Result<VmConfig, StrandError> {
    let config = match path {
        Some(path) => VmConfig::load(path),
        None => Ok(VmConfig::default()),
    };
    config
        .and_then(VmConfig::with_env_overrides)
        .map_err(|err| StrandError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())))
}

fn read_script(path: &Path) -> Result<String, StrandError> {
    fs::read_to_string(path).map_err(|err| {
        StrandError::Io(std::io::Error::new(err.kind(), format!("cannot read {}: {}", path.display(), err)))
    })
}

fn compile_file(path: &Path) -> Result<std::rc::Rc<Function>, StrandError> {
    let source = read_script(path)?;
    let vm = new_vm(VmConfig::default());
    Ok(strand::compile_source(&path.display().to_string(), &source, vm.context(), vm.config())?)
}

fn new_vm(config: VmConfig) -> Vm {
    let mut vm = Vm::new(config);
    vm.set_inspector(Box::new(PrintInspector::new(std::io::stderr())));
    vm
}

/// Runs to completion. A script that ends on an error value exits as a
/// runtime failure.
fn execute(vm: &mut Vm, function: std::rc::Rc<Function>) -> Result<ExitCode, StrandError> {
    let result = vm.interpret(function)?;
    if let Value::Instance(inst) = &result {
        if inst.borrow().is_error() {
            eprintln!("uncaught error: {}", result);
            return Ok(ExitCode::from(EXIT_FAULT));
        }
    }
    Ok(ExitCode::SUCCESS)
}
