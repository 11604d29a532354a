//! Shard node binary

use clap::{Parser, Subcommand};
use minishard::{
    node::server::STORE_DIR,
    sharding::{LocalMetadataStore, ShardIdentity},
    Config, ShardNode,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "minishard")]
#[command(about = "minishard shard node: chunk splits, migrations and orphaned range cleanup")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist this shard's identity
    Init {
        /// Shard name within the cluster
        #[arg(long)]
        shard_name: String,

        /// Cluster id (generated when omitted)
        #[arg(long)]
        cluster_id: Option<Uuid>,

        /// Config service connection string
        #[arg(long, default_value = "local")]
        config_server: String,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Start the shard node
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the HTTP admin API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then override with CLI arguments
    let mut config = Config::load();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Init {
            shard_name,
            cluster_id,
            config_server,
            data,
        } => {
            let data_dir = data.unwrap_or(config.server.data_dir);
            std::fs::create_dir_all(&data_dir)?;
            let store = LocalMetadataStore::open(data_dir.join(STORE_DIR))?;

            if let Some(existing) = store.get_identity()? {
                anyhow::bail!(
                    "{} is already initialized as shard {} of cluster {}",
                    data_dir.display(),
                    existing.shard_name,
                    existing.cluster_id
                );
            }

            let identity = ShardIdentity {
                shard_name,
                cluster_id: cluster_id.unwrap_or_else(Uuid::new_v4),
                config_server,
            };
            store.put_identity(&identity)?;
            store.flush()?;
            tracing::info!(
                shard = %identity.shard_name,
                cluster_id = %identity.cluster_id,
                "Persisted shard identity in {}",
                data_dir.display()
            );
        }
        Commands::Serve { id, bind, data } => {
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(data) = data {
                config.server.data_dir = data;
            }
            config.validate()?;
            std::fs::create_dir_all(&config.server.data_dir)?;

            ShardNode::new(config).serve().await?;
        }
    }

    Ok(())
}
