//! Operation worker process: consumes the job broker and drives each
//! delivery through `job_processor::process`, alongside a keep-alive
//! cycle that refreshes sessions for accounts no job currently holds.

mod app;

use clap::{Parser, Subcommand};
use worker_core::{init_logging, Config};

#[derive(Parser)]
#[command(name = "dealer-worker")]
#[command(about = "Dealer account automation worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker
    Start {
        /// Log to stderr in addition to the central JSONL file
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop a running worker
    Stop,
    /// Report whether a worker is running
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    config.log_level = cli.log_level;

    match cli.command {
        Some(Commands::Stop) => {
            init_logging("job-processor", &config.log_level, true);
            app::stop(&config)?;
        }
        Some(Commands::Status) => {
            init_logging("job-processor", &config.log_level, true);
            app::status(&config)?;
        }
        Some(Commands::Start { foreground }) => {
            init_logging("job-processor", &config.log_level, foreground);
            app::run(config).await?;
        }
        None => {
            init_logging("job-processor", &config.log_level, true);
            app::run(config).await?;
        }
    }

    Ok(())
}
