//! testgen binary.
//!
//! Command-line entry point for the React test generation fine-tuning pipeline.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use testgen_core::export::{DryRunRunner, ProcessRunner, ToolRunner};
use testgen_core::pipeline::{ollama_hint, render_sample};
use testgen_core::{Pipeline, TuneConfig};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, env = "TESTGEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Command-line overrides applied on top of the layered configuration
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Base model id or local directory
    #[arg(long, global = true)]
    model: Option<String>,

    /// Training JSONL file
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Adapter output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Merged model directory
    #[arg(long, global = true)]
    merged_dir: Option<PathBuf>,

    /// Device: auto, cpu, cuda or cuda:N
    #[arg(long, global = true)]
    device: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut TuneConfig) {
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(data) = &self.data {
            config.data.training_file = data.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.training.output_dir = dir.clone();
        }
        if let Some(dir) = &self.merged_dir {
            config.export.merged_dir = dir.clone();
        }
        if let Some(device) = &self.device {
            config.model.device = device.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and flatten the training data
    Prepare {
        /// Write the formatted records as JSONL
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Train LoRA adapters over the 4-bit base model
    Train {
        #[arg(long)]
        epochs: Option<usize>,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Merge the trained adapter into a half-precision base
    Merge,
    /// Generate one test file with the merged model
    SmokeTest {
        /// File whose contents replace the built-in component request
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
    /// Convert the merged model to GGUF with llama.cpp
    Convert {
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Write an Ollama Modelfile next to the GGUF file
    Modelfile,
    /// Run every stage in order
    Run {
        #[arg(long)]
        epochs: Option<usize>,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args, Debug)]
struct ToolArgs {
    /// GGUF output type (f16, q8_0, q4_k_m, ...)
    #[arg(long)]
    outtype: Option<String>,
    /// llama.cpp checkout
    #[arg(long)]
    llama_cpp: Option<PathBuf>,
    /// Log the conversion commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

impl ToolArgs {
    fn apply(&self, config: &mut TuneConfig) {
        if let Some(outtype) = &self.outtype {
            config.export.gguf_outtype = outtype.clone();
        }
        if let Some(dir) = &self.llama_cpp {
            config.export.llama_cpp_dir = dir.clone();
        }
    }

    fn runner(&self) -> Box<dyn ToolRunner> {
        if self.dry_run {
            Box::new(DryRunRunner::new())
        } else {
            Box::new(ProcessRunner)
        }
    }
}

/// Route `log` records into tracing and install the subscriber.
///
/// `TESTGEN_LOG_DIR` switches output to a daily rolling file.
fn init_logging() -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let filter = || {
        EnvFilter::builder()
            .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned()))
    };

    if let Ok(log_dir) = std::env::var("TESTGEN_LOG_DIR") {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "testgen.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(non_blocking)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to install tracing subscriber")?;
        info!("File logging enabled to {}/testgen.log", log_dir);
        Ok(Some(guard))
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to install tracing subscriber")?;
        Ok(None)
    }
}

#[tokio::main]
async fn main() {
    // Keep the guard alive so the background writer flushes on exit
    let _log_guard = match init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = TuneConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.overrides.apply(&mut config);

    match &cli.command {
        Commands::Train { epochs, .. } | Commands::Run { epochs, .. } => {
            if let Some(epochs) = epochs {
                config.training.epochs = *epochs;
            }
        }
        Commands::SmokeTest {
            prompt_file,
            max_new_tokens,
        } => {
            if let Some(path) = prompt_file {
                config.generation.prompt_file = Some(path.clone());
            }
            if let Some(n) = max_new_tokens {
                config.generation.max_new_tokens = *n;
            }
        }
        _ => {}
    }
    if let Commands::Convert { tool } | Commands::Run { tool, .. } = &cli.command {
        tool.apply(&mut config);
    }

    let show_progress = !matches!(cli.command, Commands::Train { no_progress: true, .. });
    let pipeline = Pipeline::new(config)?.with_progress(show_progress);
    let config = pipeline.config();

    match cli.command {
        Commands::Prepare { out } => {
            let examples = pipeline.prepare(out.as_deref())?;
            println!("{} training examples", examples.len());
        }
        Commands::Train { .. } => {
            let outcome = pipeline.train().await?;
            println!(
                "Training complete: {} steps, final loss {:.4}, adapter saved to {}",
                outcome.state.global_step,
                outcome.final_loss,
                config.training.output_dir.display()
            );
        }
        Commands::Merge => {
            let summary = pipeline.merge().await?;
            println!("Merged model saved to {}", summary.merged_dir.display());
        }
        Commands::SmokeTest { .. } => {
            let generation = pipeline.smoke_test()?;
            println!("{}", render_sample(&generation, config.generation.preview_chars));
        }
        Commands::Convert { tool } => {
            let gguf = pipeline.convert(tool.runner().as_ref()).await?;
            println!("GGUF written to {}", gguf.display());
        }
        Commands::Modelfile => {
            let path = pipeline.modelfile()?;
            println!("{}", ollama_hint(&config.export.ollama_model_name, &path));
        }
        Commands::Run { tool, .. } => {
            let summary = pipeline.run(tool.runner().as_ref()).await?;
            println!("{}", render_sample(&summary.generation, config.generation.preview_chars));
            println!("GGUF written to {}", summary.gguf.display());
            println!("{}", ollama_hint(&config.export.ollama_model_name, &summary.modelfile));
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(config)?);
        }
    }

    Ok(())
}
