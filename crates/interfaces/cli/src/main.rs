mod interactive;
mod memory_cmds;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use hearth_config::AppConfig;
use hearth_memory::MemoryManager;
use hearth_memory::lore::seed_lore_files;
use hearth_runtime::{TimeKeeper, embedder_from_config};

const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "hearth",
    version,
    about = "A conversational companion with long-term memory"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a chat session (the default).
    Chat {
        /// Print the reply as it is generated.
        #[arg(long)]
        stream: bool,
    },
    /// Write the default config, lore files and state file where missing.
    Init,
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// List every stored episode.
    List,
    /// Delete one episode and realign the vector index.
    Delete {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
    Stats,
    /// Rebuild the vector index from lore files and episodes.
    Rebuild,
    /// Delete every episode.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Import `---`-separated episodes from every .txt file in a directory.
    Ingest { dir: String },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    /// Drop every cached response.
    Clear,
}

fn setup_logging(config: &AppConfig) -> Result<WorkerGuard> {
    let log_dir = config.system_log_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log dir {}", log_dir.display()))?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "hearth.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let level = config.telemetry.log_level.as_str();
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();
    Ok(guard)
}

fn open_memory(config: &AppConfig) -> Result<MemoryManager> {
    MemoryManager::open(config, embedder_from_config(config))
}

fn run_init(config: &AppConfig) -> Result<()> {
    if !Path::new(CONFIG_PATH).exists() {
        config.save_to(CONFIG_PATH)?;
        println!("wrote {CONFIG_PATH}");
    }
    let written = seed_lore_files(&config.lore_paths(), &config.agent.name, &config.agent.user_name)?;
    println!("lore files written: {written}");
    if TimeKeeper::new(config.timestamp_path()).seed()? {
        println!("state file written: {}", config.timestamp_path().display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load_from(CONFIG_PATH)?;
    let _guard = setup_logging(&config)?;
    info!(provider = %config.llm.provider, model = %config.active_model(), "hearth starting");

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Chat { stream: false }) {
        Commands::Chat { stream } => {
            interactive::run_chat_session(&config, stream || config.llm.stream).await?;
        }
        Commands::Init => run_init(&config)?,
        Commands::Memory { command } => {
            let memory = open_memory(&config)?;
            match command {
                MemoryCommands::List => memory_cmds::run_memory_list(&memory)?,
                MemoryCommands::Delete { id, yes } => {
                    memory_cmds::run_memory_delete(&memory, id, yes).await?
                }
                MemoryCommands::Stats => memory_cmds::run_memory_stats(&memory)?,
                MemoryCommands::Rebuild => memory_cmds::run_memory_rebuild(&memory).await?,
                MemoryCommands::Clear { yes } => memory_cmds::run_memory_clear(&memory, yes).await?,
                MemoryCommands::Ingest { dir } => memory_cmds::run_memory_ingest(&memory, &dir).await?,
            }
        }
        Commands::Cache { command } => match command {
            CacheCommands::Clear => {
                let memory = open_memory(&config)?;
                let removed = memory.cache().clear()?;
                println!("cache cleared: removed {removed} responses");
            }
        },
    }

    Ok(())
}
