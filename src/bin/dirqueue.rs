//! dirqueue CLI: operator interface for producing jobs into a queue root.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use dirqueue::config::Config;
use dirqueue::telemetry::{TelemetryConfig, init_telemetry};
use dirqueue::{DirQueue, Options};

#[derive(Parser)]
#[command(name = "dirqueue", about = "Enqueue jobs into a filesystem work queue")]
struct Cli {
    /// Queue root directory (overrides DIRQUEUE_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue directory layout
    Init,
    /// Enqueue a file, or stdin when no file is given
    Enqueue {
        /// Payload file; `-` or absent reads stdin
        file: Option<PathBuf>,
        /// Priority 0-99, lower sorts first (overrides DIRQUEUE_PRIORITY)
        #[arg(long)]
        priority: Option<u8>,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::with_root(cli.root)?;
    let root = config.queue_root.clone();

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dirqueue".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Init => cmd_init(root).await,
        Command::Enqueue {
            file,
            priority,
            meta,
        } => {
            let mut options = Options::default().priority(priority.unwrap_or(config.priority));
            for (key, value) in meta {
                options = options.metadata(key, value);
            }
            cmd_enqueue(root, file, options).await
        }
    }
}

async fn cmd_init(root: PathBuf) -> anyhow::Result<()> {
    let queue = tokio::task::spawn_blocking(move || DirQueue::open(root)).await??;
    println!("{}", queue.layout().root.display());
    Ok(())
}

async fn cmd_enqueue(root: PathBuf, file: Option<PathBuf>, options: Options) -> anyhow::Result<()> {
    let job = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let queue = DirQueue::open(&root)
            .with_context(|| format!("opening queue at {}", root.display()))?;
        let job = match file.filter(|p| p.as_os_str() != "-") {
            Some(path) => queue
                .enqueue_file(&path, &options)
                .with_context(|| format!("enqueueing {}", path.display()))?,
            None => queue.enqueue_reader(std::io::stdin().lock(), &options)?,
        };
        Ok(job)
    })
    .await??;

    tracing::info!(name = %job.name, size = job.size, "enqueued");
    println!("{}", job.control_path.display());
    Ok(())
}
