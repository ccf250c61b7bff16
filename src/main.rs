//! Elohim Custodian daemon and owner CLI
//!
//! ## Usage
//!
//! ```bash
//! # Run the custodian daemon
//! elohim-custodian serve --listen 127.0.0.1:8787
//!
//! # Manage keys in the local vault
//! elohim-custodian keys generate --alias laptop
//! elohim-custodian keys list
//!
//! # Move keys between devices
//! CUSTODIAN_PASSPHRASE=... elohim-custodian backup export --out keys.backup
//! CUSTODIAN_PASSPHRASE=... elohim-custodian backup import --file keys.backup
//!
//! # Talk to a running daemon as an app would
//! elohim-custodian call --url ws://127.0.0.1:8787 --origin https://elohim.host sign hello
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elohim_custodian::{
    serve_websocket, write_owner_only, Config, Custodian, CustodianClient, CustodyError,
    FileVault, Vault, WebSocketLauncher,
};

#[derive(Parser, Debug)]
#[command(name = "elohim-custodian")]
#[command(about = "Origin-gated key custodian for Elohim apps")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "CUSTODIAN_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory (vault lives under it)
    #[arg(long, env = "CUSTODIAN_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Log level for this crate when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket custodian daemon
    Serve {
        /// Listen address
        #[arg(long, env = "CUSTODIAN_LISTEN")]
        listen: Option<SocketAddr>,
    },

    /// Manage custodied keys
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Export or import an encrypted backup
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Manage allowed caller origins
    #[command(subcommand)]
    Allowlist(AllowlistCommand),

    /// Call a running daemon through the client stub
    Call {
        /// Daemon WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:8787")]
        url: String,

        /// Origin to present in the handshake
        #[arg(long)]
        origin: String,

        #[command(subcommand)]
        op: CallCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// List keys, marking the active one
    List,
    /// Generate a key
    Generate {
        #[arg(long, default_value = "default")]
        alias: String,
        /// Make it active even if another key is
        #[arg(long)]
        activate: bool,
    },
    /// Import a hex-encoded private key
    Import {
        #[arg(long, env = "CUSTODIAN_SECRET_HEX", hide_env_values = true)]
        secret_hex: String,
        #[arg(long)]
        alias: String,
    },
    /// Make a key active
    Activate { id: String },
    /// Delete a key
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "CUSTODIAN_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, env = "CUSTODIAN_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
}

#[derive(Subcommand, Debug)]
enum AllowlistCommand {
    List,
    Add { origin: String },
    Remove { origin: String },
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    Import {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CallCommand {
    Ping,
    /// Print the active did:key
    Did,
    Sign { message: String },
    Verify {
        did_key: String,
        message: String,
        signature: String,
    },
    /// Generate and activate a key
    Generate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("elohim_custodian={},info", cli.log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }

    match cli.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            serve(config).await
        }
        Command::Keys(cmd) => keys(&open_custodian(&config)?, cmd).await,
        Command::Backup(cmd) => backup(&open_custodian(&config)?, cmd).await,
        Command::Allowlist(cmd) => allowlist(&open_custodian(&config)?, cmd).await,
        Command::Call { url, origin, op } => call(&config, url, origin, op).await,
    }
}

fn open_custodian(config: &Config) -> anyhow::Result<Custodian> {
    let dir = config.vault_dir();
    let vault: Arc<dyn Vault> = match FileVault::open(&dir) {
        Ok(vault) => Arc::new(vault),
        Err(CustodyError::VaultBusy(_)) => bail!(
            "vault {} is held by another custodian; stop `elohim-custodian serve` \
             or use `elohim-custodian call` against it",
            dir.display()
        ),
        Err(e) => return Err(e).with_context(|| format!("opening vault {}", dir.display())),
    };
    Ok(Custodian::open(vault, config)?)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("======================================");
    info!("  Elohim Custodian");
    info!("======================================");
    info!("Storage: {}", config.storage_dir.display());
    info!("Listen: {}", config.listen);
    info!("Default origins: {}", config.default_origins.join(", "));
    info!("======================================");

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let config_path = config.storage_dir.join("config.toml");
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let custodian = Arc::new(open_custodian(&config)?);
    if custodian.active_key().await.is_none() {
        warn!("No active key; getDIDKey and signMessage will fail until one is set");
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    tokio::select! {
        result = serve_websocket(listener, custodian) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn keys(custodian: &Custodian, cmd: KeysCommand) -> anyhow::Result<()> {
    match cmd {
        KeysCommand::List => {
            let active = custodian.active_key().await.map(|k| k.id);
            for key in custodian.list_keys().await {
                let marker = if Some(&key.id) == active.as_ref() { "*" } else { " " };
                println!(
                    "{marker} {}  {}  {}  {}",
                    key.id,
                    key.did_key,
                    key.created_at.to_rfc3339(),
                    key.alias
                );
            }
        }
        KeysCommand::Generate { alias, activate } => {
            let key = if activate {
                custodian.generate_and_activate(&alias).await?
            } else {
                custodian.generate_key(&alias).await?
            };
            println!("{}  {}", key.id, key.did_key);
        }
        KeysCommand::Import { secret_hex, alias } => {
            let key = custodian.import_key(&secret_hex, &alias).await?;
            println!("{}  {}", key.id, key.did_key);
        }
        KeysCommand::Activate { id } => {
            if !custodian.set_active(&id).await? {
                bail!("no key with id {id}");
            }
        }
        KeysCommand::Delete { id } => {
            if custodian.delete_key(&id).await?.is_none() {
                bail!("no key with id {id}");
            }
        }
    }
    Ok(())
}

async fn backup(custodian: &Custodian, cmd: BackupCommand) -> anyhow::Result<()> {
    match cmd {
        BackupCommand::Export { out, passphrase } => {
            let archive = custodian.export_backup(&passphrase).await?;
            write_private(&out, &archive)?;
            println!("Backup written to {}", out.display());
        }
        BackupCommand::Import { file, passphrase } => {
            let archive = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let summary = custodian.import_backup(&archive, &passphrase).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

async fn allowlist(custodian: &Custodian, cmd: AllowlistCommand) -> anyhow::Result<()> {
    match cmd {
        AllowlistCommand::List => {
            let snapshot = custodian.allowed_origins().await;
            for origin in &snapshot.defaults {
                println!("default  {origin}");
            }
            for origin in &snapshot.user {
                println!("user     {origin}");
            }
        }
        AllowlistCommand::Add { origin } => {
            if !custodian.add_origin(&origin).await? {
                println!("{origin} already allowed");
            }
        }
        AllowlistCommand::Remove { origin } => {
            if !custodian.remove_origin(&origin).await? {
                println!("{origin} is not a user origin");
            }
        }
        AllowlistCommand::Export { out } => {
            std::fs::write(&out, custodian.export_allowlist().await?)?;
        }
        AllowlistCommand::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let outcome = custodian.import_allowlist(&text).await?;
            println!("added {}, skipped {}", outcome.added, outcome.skipped);
        }
    }
    Ok(())
}

async fn call(config: &Config, url: String, origin: String, op: CallCommand) -> anyhow::Result<()> {
    let launcher = WebSocketLauncher::new(url, origin);
    let client = CustodianClient::connect(&launcher, config.client_config())
        .await
        .with_context(|| format!("connecting to {}", launcher.url()))?;

    let result = match op {
        CallCommand::Ping => client.ping().await.map(|()| "PONG".to_string()),
        CallCommand::Did => client.get_active_identifier().await,
        CallCommand::Sign { message } => client.sign(&message).await,
        CallCommand::Verify {
            did_key,
            message,
            signature,
        } => client
            .verify(&did_key, &message, &signature)
            .await
            .map(|valid| valid.to_string()),
        CallCommand::Generate => client.generate_and_activate().await,
    };
    client.disconnect().await;

    println!("{}", result?);
    Ok(())
}

fn write_private(path: &Path, contents: &str) -> anyhow::Result<()> {
    write_owner_only(path, contents.as_bytes())
        .with_context(|| format!("writing {}", path.display()))
}
