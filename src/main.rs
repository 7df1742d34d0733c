use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llmgate::config::ConfigLoader;
use llmgate::{CompletionRequest, Gateway, Message};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llmgate", about = "Route LLM calls across providers and rotating API keys")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file layered over the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached models
    Models {
        /// Only this provider
        #[arg(short, long)]
        provider: Option<String>,
        /// Group by category, optionally a single one
        #[arg(long)]
        category: Option<Option<String>>,
        /// Keyword matched against id, name and description
        #[arg(short, long)]
        search: Option<String>,
    },
    /// List model categories with counts
    Categories,
    /// Fetch fresh model catalogs
    Refresh {
        provider: Option<String>,
    },
    /// Show key and catalog health per provider
    Status {
        provider: Option<String>,
    },
    /// Show usage statistics
    Stats {
        /// Clear all counters
        #[arg(long)]
        reset: bool,
    },
    /// Send a chat completion
    Complete {
        /// Model id or provider/model
        model: String,
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::from_path(path),
        None => ConfigLoader::new(),
    }
    .context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&loader.config().logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(sources = ?loader.sources(), "configuration loaded");

    let gateway = Gateway::from_config(loader.into_config())?;
    gateway.restore().await;

    match cli.command {
        Commands::Models {
            provider,
            category,
            search,
        } => {
            gateway.refresh_stale().await;
            if let Some(query) = search {
                print_json(&gateway.search_models(&query, provider.as_deref())?)?;
            } else if let Some(category) = category {
                print_json(&gateway.models_by_category(category.as_deref()))?;
            } else {
                print_json(&gateway.models_by_provider(provider.as_deref())?)?;
            }
        }
        Commands::Categories => {
            gateway.refresh_stale().await;
            print_json(&gateway.categories())?;
        }
        Commands::Refresh { provider } => {
            let report = gateway.refresh_models(provider.as_deref()).await?;
            print_json(&report)?;
        }
        Commands::Status { provider } => {
            print_json(&gateway.provider_status(provider.as_deref())?)?;
        }
        Commands::Stats { reset } => {
            if reset {
                gateway.reset_statistics();
            }
            print_json(&gateway.statistics())?;
        }
        Commands::Complete {
            model,
            prompt,
            system,
            max_tokens,
            temperature,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let mut request = CompletionRequest::new(model, messages);
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            if let Some(temperature) = temperature {
                request = request.with_temperature(temperature);
            }

            let response = gateway.complete(request).await;
            gateway.flush_statistics().await;
            print_json(&response?)?;
            return Ok(());
        }
    }

    gateway.flush_statistics().await;
    Ok(())
}
