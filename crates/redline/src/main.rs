//! `redline` command-line entry point.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use redline::config::load_config;
use redline::logging::{init_logging, LogFormat};
use redline::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "redline")]
#[command(about = "Proofread documents through a staged correction pipeline", version)]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Keep the database and storage under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log line format: text or json
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correct a document, streaming progress as JSON lines
    Process {
        /// The .docx, .txt or .md file to correct
        input: PathBuf,

        /// Where to write the corrected document (default: next to the input)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Delete expired files and the jobs that referenced them
    Sweep,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("Error initializing logging: {}", e);
        process::exit(1);
    }

    let config = match build_config(cli.config.as_deref(), cli.data_dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Process { input, output } => run_process(config, &input, output),
        Commands::Sweep => run_sweep(config),
    };
    process::exit(code);
}

fn build_config(
    path: Option<&Path>,
    data_dir: Option<PathBuf>,
) -> Result<EngineConfig, redline::ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = data_dir {
        let rooted = EngineConfig::with_data_dir(dir);
        config.storage_root = rooted.storage_root;
        config.database_path = rooted.database_path;
    }
    Ok(config)
}

fn open_engine(config: EngineConfig) -> Option<Engine> {
    match Engine::open(config) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("Error starting engine: {}", e.public_message());
            None
        }
    }
}

fn run_process(config: EngineConfig, input: &Path, output: Option<PathBuf>) -> i32 {
    let bytes = match std::fs::read(input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error reading {}: {}", input.display(), e);
            return 1;
        }
    };
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());

    let Some(engine) = open_engine(config) else {
        return 1;
    };

    let job = match engine.upload(&bytes, &name).and_then(|f| engine.submit(&f.id)) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("Error: {}", e.public_message());
            return 1;
        }
    };

    let mut subscription = match engine.subscribe(&job.id) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e.public_message());
            return 1;
        }
    };
    while let Some(event) = subscription.blocking_next() {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error encoding event: {}", e),
        }
    }

    let code = match engine.output(&job.id) {
        Ok((record, corrected)) => {
            let target = output.unwrap_or_else(|| input.with_file_name(&record.original_name));
            match std::fs::write(&target, corrected) {
                Ok(()) => {
                    eprintln!("Wrote {}", target.display());
                    0
                }
                Err(e) => {
                    eprintln!("Error writing {}: {}", target.display(), e);
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e.public_message());
            1
        }
    };

    engine.shutdown();
    code
}

fn run_sweep(config: EngineConfig) -> i32 {
    let Some(engine) = open_engine(config) else {
        return 1;
    };
    let code = match engine.sweep() {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(line) => {
                println!("{}", line);
                0
            }
            Err(e) => {
                eprintln!("Error encoding report: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e.public_message());
            1
        }
    };
    engine.shutdown();
    code
}
