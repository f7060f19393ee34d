use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegraph_store::{GraphStore, IdentityAttrs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;

#[derive(Parser)]
#[command(name = "facegraph", about = "Face identification and identity graph CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a photo
    Enroll {
        /// First name
        #[arg(long)]
        first: String,
        /// Last name
        #[arg(long)]
        last: String,
        /// Display color (hex)
        #[arg(long, default_value = "#ffffff")]
        color: String,
        /// Path to the photo
        image: PathBuf,
    },
    /// Identify the person in a photo
    Identify {
        /// Path to the photo
        image: PathBuf,
        /// Show the ranked candidate list instead of only the decision
        #[arg(long)]
        ranked: bool,
        /// Number of ranked candidates
        #[arg(long)]
        top: Option<usize>,
    },
    /// Create a confirmed link between two identities
    Connect {
        a: i64,
        b: i64,
        /// Edge weight
        #[arg(long, default_value_t = 1.0)]
        value: f64,
    },
    /// List identities directly linked to one identity
    Neighbors { id: i64 },
    /// Show one identity
    Show { id: i64 },
    /// Dump the whole graph (identities and edges)
    Graph,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = Arc::new(GraphStore::open(&config.db_path, config.embedding_dim)?);

    match cli.command {
        Commands::Enroll { first, last, color, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading image {}", image.display()))?;
            let attrs = IdentityAttrs {
                first_name: first,
                last_name: last,
                color,
                image_ref: Some(image.display().to_string()),
            };

            let handle = engine::spawn_engine(&config, Arc::clone(&store))?;
            let id = handle.enroll(attrs, bytes).await?;
            println!("{}", serde_json::json!({ "id": id }));
        }
        Commands::Identify { image, ranked, top } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading image {}", image.display()))?;
            let top_k = top.unwrap_or(config.top_k);

            let handle = engine::spawn_engine(&config, Arc::clone(&store))?;
            let result = handle.identify(bytes, top_k).await?;

            if ranked {
                println!("{}", serde_json::to_string_pretty(&result.candidates)?);
            } else {
                println!("{}", serde_json::json!({ "match_id": result.match_id }));
            }
        }
        Commands::Connect { a, b, value } => {
            store.connect(a, b, value)?;
            println!("{}", serde_json::json!({ "connected": [a, b] }));
        }
        Commands::Neighbors { id } => {
            let neighbors = store.neighbors(id)?;
            println!("{}", serde_json::to_string(&neighbors)?);
        }
        Commands::Show { id } => match store.identity(id)? {
            Some(row) => println!(
                "{}",
                serde_json::json!({
                    "id": row.id,
                    "name": format!("{} {}", row.first_name, row.last_name),
                    "color": row.color,
                })
            ),
            None => anyhow::bail!("identity {id} not found"),
        },
        Commands::Graph => {
            let (identities, edges) = store.full_graph()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "identities": identities,
                    "edges": edges,
                }))?
            );
        }
    }

    Ok(())
}
