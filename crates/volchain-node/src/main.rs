// volchain-node/src/main.rs
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volchain_core::{GroundTruth, Reason, Transaction, TxRequest};
use volchain_crypto::{resolve_key, KeyPair, SecretKey};
use volchain_node::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "volchain-node")]
#[command(about = "Single-validator Volchain ledger node", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to <data-dir>/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override data directory
    #[arg(short = 'D', long, global = true)]
    data_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and a default config
    Init,

    /// Run the block producer until Ctrl-C
    Start,

    /// Show chain height and tip
    Head,

    /// Replay sealed history against the snapshot
    Verify,

    /// Show one account
    Balance {
        /// Hex or base64 public key, or bech32 address
        key: String,
    },

    /// Top accounts by balance
    Holders {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Recent block headers, newest first
    Blocks {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only blocks below this height
        #[arg(short, long)]
        before: Option<u64>,
    },

    /// Seal one block from the mempool
    Seal,

    /// Enqueue a transaction from a JSON file and seal it
    Submit {
        /// Transaction JSON
        file: PathBuf,
    },

    /// Generate an account keypair
    Keygen {
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build and sign a user transaction, printing its JSON
    Sign {
        /// Key file written by `keygen`
        #[arg(short, long)]
        key: PathBuf,

        #[arg(value_enum)]
        kind: SignKind,

        #[arg(short, long)]
        amount: Option<u64>,

        /// Recipient (transfer) or defender (attack)
        #[arg(long)]
        to: Option<String>,

        #[arg(short, long, default_value = "0")]
        nonce: u64,

        #[arg(long)]
        op_id: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Check the ledger against ground-truth counts
    Guard {
        /// Ground truth JSON: {"accounts": {"<pubkey>": {"mined": n, "used": n}}}
        truth: PathBuf,

        /// Rewrite balances from the ground truth (destructive)
        #[arg(long)]
        correct: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignKind {
    Transfer,
    Stake,
    Unstake,
    Attack,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: String,
    secret_key: String,
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "volchain_node={level},volchain_core={level},volchain_storage={level}",
                    level = log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Init => init_node(cli.config, cli.data_dir)?,
        Commands::Keygen { output } => keygen(&output)?,
        Commands::Sign { key, kind, amount, to, nonce, op_id, reason } => {
            sign(&key, kind, amount, to.as_deref(), nonce, op_id, reason.as_deref())?
        }
        command => {
            let config = load_config(cli.config.as_deref(), cli.data_dir)?;
            run(command, config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, data_dir: Option<String>) -> anyhow::Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::from_file(path)?,
        None => {
            let dir = data_dir.clone().unwrap_or_else(|| NodeConfig::default().data_dir);
            let default_path = Path::new(&dir).join("config.toml");
            if default_path.exists() {
                NodeConfig::from_file(&default_path)?
            } else {
                NodeConfig::default()
            }
        }
    };
    config.apply_env();
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, config: NodeConfig) -> anyhow::Result<()> {
    let node = Arc::new(Node::new(config)?);

    match command {
        Commands::Start => {
            tracing::info!("Starting node with data directory: {}", node.config().data_dir);
            node.clone().start().await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Received shutdown signal");

            node.stop().await?;
            tracing::info!("Node stopped gracefully");
        }
        Commands::Head => print_json(&node.head().await)?,
        Commands::Verify => {
            let report = node.verify().await?;
            print_json(&report)?;
            if !report.ok {
                anyhow::bail!("replay verification failed");
            }
        }
        Commands::Balance { key } => print_json(&node.account(&key).await?)?,
        Commands::Holders { limit } => print_json(&node.holders(limit).await)?,
        Commands::Blocks { limit, before } => print_json(&node.blocks(limit, before)?)?,
        Commands::Seal => {
            let outcome = node.seal_now(None).await?;
            tracing::info!("Seal outcome: {:?}", outcome);
            print_json(&node.head().await)?;
        }
        Commands::Submit { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let request: TxRequest = serde_json::from_str(&raw)?;
            let receipt = node.submit_request(request).await?;
            node.seal_now(None).await?;
            print_json(&receipt)?;
        }
        Commands::Guard { truth, correct } => {
            let truth: GroundTruth = serde_json::from_str(&std::fs::read_to_string(&truth)?)?;
            if correct {
                tracing::warn!("Rewriting balances from ground truth");
                print_json(&node.guard_correct(&truth).await?)?;
            } else {
                print_json(&node.guard_check(&truth).await)?;
            }
        }
        Commands::Init | Commands::Keygen { .. } | Commands::Sign { .. } => {}
    }

    Ok(())
}

fn init_node(config_path: Option<PathBuf>, data_dir: Option<String>) -> anyhow::Result<()> {
    let mut config = NodeConfig::default();
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    tracing::info!("Initializing node at {}", config.data_dir);

    volchain_storage::FileStore::open(&config.data_dir)?;

    let path = config_path.unwrap_or_else(|| Path::new(&config.data_dir).join("config.toml"));
    config.to_file(&path)?;

    tracing::info!("Node initialized successfully at {}", config.data_dir);
    tracing::info!("Edit {} to configure your node", path.display());
    Ok(())
}

fn keygen(output: &Path) -> anyhow::Result<()> {
    tracing::info!("Generating account keypair");
    let keypair = KeyPair::generate();

    let key_file = KeyFile {
        public_key: keypair.public_key().to_hex(),
        secret_key: keypair.secret_key().to_hex(),
        address: keypair.address()?.to_string(),
    };
    std::fs::write(output, serde_json::to_string_pretty(&key_file)?)?;

    tracing::info!("Keypair saved to {}", output.display());
    tracing::warn!("Keep this file secure!");
    Ok(())
}

fn sign(
    key: &Path,
    kind: SignKind,
    amount: Option<u64>,
    to: Option<&str>,
    nonce: u64,
    op_id: Option<String>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let key_file: KeyFile = serde_json::from_str(&std::fs::read_to_string(key)?)?;
    let keypair = KeyPair::from_secret(SecretKey::from_hex(&key_file.secret_key)?);
    let sender = keypair.public_key();
    let need_amount = || amount.ok_or_else(|| anyhow::anyhow!("--amount is required"));
    let target = || -> anyhow::Result<_> {
        let to = to.ok_or_else(|| anyhow::anyhow!("--to is required"))?;
        Ok(resolve_key(to)?)
    };

    let mut tx = match kind {
        SignKind::Transfer => Transaction::transfer(sender, &target()?, need_amount()?, nonce)?,
        SignKind::Stake => Transaction::stake(sender, need_amount()?)?.with_nonce(nonce),
        SignKind::Unstake => Transaction::unstake(sender, need_amount()?)?.with_nonce(nonce),
        SignKind::Attack => Transaction::attack(sender, &target()?)?.with_nonce(nonce),
    };
    if let Some(op_id) = op_id {
        tx = tx.with_op_id(op_id);
    }
    if let Some(reason) = reason {
        let reason: Reason = serde_json::from_value(serde_json::Value::String(reason.to_string()))?;
        tx = tx.with_reason(reason);
    }

    let tx = tx.signed(&keypair)?;
    print_json(&tx)
}
