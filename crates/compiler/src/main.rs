//! Transputer backend CLI
//!
//! Compiles IR files (JSON) to transputer assembly and reports the block
//! generation order.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tpc::{BackendConfig, ErrorMode};

#[derive(ClapParser)]
#[command(name = "tpc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transputer backend - lower stack IR to transputer assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an IR file to assembly
    Build {
        /// Input IR file (JSON)
        input: PathBuf,

        /// Output assembly path (defaults to the input with a .s extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Backend configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Replace unsupported constructs with placeholders instead of failing
        #[arg(long)]
        suppress_errors: bool,

        /// Word size of the target in bytes
        #[arg(long)]
        word_bytes: Option<u32>,
    },

    /// Print the order in which blocks are generated
    Order {
        /// Input IR file (JSON)
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            config,
            suppress_errors,
            word_bytes,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension("s"));
            run_build(&input, &output, config.as_deref(), suppress_errors, word_bytes);
        }
        Commands::Order { input } => {
            run_order(&input);
        }
        Commands::Completions { shell } => {
            run_completions(shell);
        }
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "tpc", &mut io::stdout());
}

fn run_build(
    input: &Path,
    output: &Path,
    config_path: Option<&Path>,
    suppress_errors: bool,
    word_bytes: Option<u32>,
) {
    let mut config = match config_path {
        Some(path) => match BackendConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        },
        None => BackendConfig::default(),
    };

    // Flags override the file
    if suppress_errors {
        config = config.with_error_mode(ErrorMode::Suppress);
    }
    if let Some(bytes) = word_bytes {
        config = config.with_word_bytes(bytes);
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    match tpc::compile_file(input, output, &config) {
        Ok(()) => {
            println!("Compiled {} -> {}", input.display(), output.display());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_order(input: &Path) {
    let json = match fs::read_to_string(input) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error reading {}: {}", input.display(), e);
            process::exit(1);
        }
    };
    match tpc::order_json(&json) {
        Ok(names) => {
            for name in names {
                println!("{}", name);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
