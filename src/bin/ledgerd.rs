#![forbid(unsafe_code)]
//! Full-node daemon for ledgerd

use clap::{Parser, Subcommand};
use ledgerd::accounts::{AccountManager, KeystoreWallet, Wallet};
use ledgerd::config::{default_data_dir, load_config};
use ledgerd::crypto::address_to_hex;
use ledgerd::service::{ServerContext, Service, ServiceContext};
use ledgerd::NodeService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "ledgerd.toml")]
    config: PathBuf,
    /// Data directory for the databases and keystore
    #[arg(long)]
    datadir: Option<PathBuf>,
    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    verbosity: Level,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the node (default)
    Run {
        /// Start mining once the node is up
        #[arg(long)]
        mine: bool,
    },
    /// Manages local accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Creates a new account in the keystore
    New,
    /// Lists keystore accounts
    List,
}

fn open_keystore(data_dir: &Path) -> Result<Arc<KeystoreWallet>, Box<dyn std::error::Error>> {
    Ok(Arc::new(KeystoreWallet::open(&data_dir.join("keystore"))?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.verbosity).init();

    let data_dir = cli.datadir.unwrap_or_else(default_data_dir);
    match cli.command.unwrap_or(Commands::Run { mine: false }) {
        Commands::Account { action } => {
            let keystore = open_keystore(&data_dir)?;
            match action {
                AccountAction::New => {
                    let account = keystore.new_account()?;
                    println!("Address: {}", address_to_hex(&account.address));
                }
                AccountAction::List => {
                    for (i, account) in keystore.accounts().iter().enumerate() {
                        println!("Account #{}: {} {}", i, address_to_hex(&account.address), account.url);
                    }
                }
            }
            Ok(())
        }
        Commands::Run { mine } => run(&cli.config, data_dir, mine).await,
    }
}

async fn run(config_path: &Path, data_dir: PathBuf, mine: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    info!(datadir = %data_dir.display(), "Starting ledgerd");

    let accounts = Arc::new(AccountManager::new());
    accounts.add_wallet(open_keystore(&data_dir)?);
    let ctx = ServiceContext::new(data_dir, accounts);

    let node = NodeService::new(&ctx, config)?;
    node.start(&ServerContext {
        name: "ledgerd".to_string(),
    })?;

    if mine {
        if let Err(e) = node.start_mining(true) {
            error!(error = %e, "Failed to start mining");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");
    node.shutdown().await?;
    Ok(())
}
