//! galq: command-line front end for galcache
//!
//! Runs one gateway command and prints the result.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use galcache::{Config, Gateway};

/// Query the YMGal archive through galcache
#[derive(Parser)]
#[command(name = "galq")]
#[command(version)]
#[command(about = "Cached, rate-limited YMGal archive client")]
struct Args {
    /// Config file (default: <cache dir>/galcache/config.json, if present)
    #[arg(short, long, env = "GALQ_CONFIG")]
    config: Option<PathBuf>,

    /// User identity for cooldowns
    #[arg(short, long, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Exact title search
    Search {
        /// Game title
        query: String,
    },

    /// Ranked fuzzy search
    Fuzzy {
        /// Partial or approximate title
        query: String,
    },

    /// Show the archive record for a game
    Info {
        /// Game id
        gid: u64,
    },

    /// Show the developer of a game
    Developer {
        /// Game id
        gid: u64,
        /// Treat the id as a developer (organisation) id instead
        #[arg(long)]
        org: bool,
    },

    /// Download a game's cover image
    Image {
        /// Game id
        gid: u64,
        /// Output file (default: <gid>.<format> in the current directory)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Remove expired cache entries now
    Sweep,

    /// Write a config file containing every default
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let env: Vec<(String, String)> = std::env::vars().collect();

    // Commands that don't need a gateway
    if let Command::InitConfig { force } = args.command {
        let path = args
            .config
            .unwrap_or_else(|| Config::default_path(env.iter().cloned()));
        if path.exists() && !force {
            return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
        }
        Config::write_default(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config_path = match args.config {
        Some(path) => Some(path),
        None => Some(Config::default_path(env.iter().cloned())).filter(|path| path.exists()),
    };
    let config = Config::load(config_path.as_deref(), env)?;
    let gateway = Gateway::builder(Arc::new(config)).build().await?;

    match args.command {
        Command::Search { query } => {
            let hit = gateway.search(&args.user, &query).await?;
            let game = &hit.record;
            println!("{}  (score {})", hit.title, hit.score);
            if let Some(gid) = game.game_id() {
                println!("  id:       {gid}");
            }
            if hit.title != game.name {
                println!("  original: {}", game.name);
            }
            if let Some(date) = &game.release_date {
                println!("  released: {date}");
            }
        }
        Command::Fuzzy { query } => {
            for hit in gateway.fuzzy_lookup(&args.user, &query).await? {
                let gid = hit
                    .record
                    .game_id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>3}  {:>8}  {}", hit.score, gid, hit.title);
            }
        }
        Command::Info { gid } => {
            let data = gateway.info(&args.user, gid).await?;
            println!("{}", serde_json::to_string_pretty(&*data)?);
        }
        Command::Developer { gid, org } => {
            let developer = if org {
                gateway.developer(&args.user, gid).await?
            } else {
                gateway.developer_of(&args.user, gid).await?
            };
            println!("{}", developer.title());
            if developer.title() != developer.name {
                println!("  original: {}", developer.name);
            }
            if let Some(country) = &developer.country {
                println!("  country:  {country}");
            }
            if let Some(intro) = developer.introduction.as_deref().filter(|s| !s.is_empty()) {
                println!();
                println!("{intro}");
            }
        }
        Command::Image { gid, out } => {
            let image = gateway.fetch_image(&args.user, gid).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(format!("{gid}.{}", image.format)));
            std::fs::write(&path, &image.bytes)?;
            println!("Saved {} ({} bytes)", path.display(), image.bytes.len());
        }
        Command::Sweep => {
            let report = gateway.sweep().await;
            let images = gateway.images().stats();
            println!(
                "Removed {} responses and {} images; {} images ({} bytes) remain",
                report.responses, report.images, images.entries, images.bytes
            );
        }
        Command::InitConfig { .. } => unreachable!("handled above"),
    }

    Ok(())
}
