//! Smart Fidget CLI: connect to a device, manage keys, decrypt payloads.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fidget_common::LinkConfig;
use fidget_core::payload::{self, PayloadScan};
use fidget_core::{DailySummary, LinkState};
use fidget_crypto::{DecryptedBatch, PayloadDecryptor};
use fidget_link::{KeyStore, LinkSession, PayloadStatus, SerialOpener};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fidget")]
#[command(about = "Smart Fidget device tools")]
struct Args {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true, env = "FIDGET_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the persisted key store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the device, run the handshake and print its sessions
    Connect {
        /// Wallet address to authenticate the device against
        #[arg(short, long, env = "FIDGET_WALLET")]
        wallet: Option<String>,

        /// Serial port (first USB serial port when omitted)
        #[arg(short, long)]
        port: Option<String>,

        #[arg(short, long)]
        baud_rate: Option<u32>,

        /// Fail instead of assuming success on unrecognized acknowledgements
        #[arg(long)]
        strict: bool,
    },

    /// List serial ports
    Ports,

    /// Inspect or create the symmetric key shared with the device
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Forget the remembered device wallet
    Reset {
        /// Also delete the symmetric key
        #[arg(long)]
        keys: bool,
    },

    /// Decrypt a saved device payload with the stored key
    Decrypt {
        /// File holding the raw device output
        file: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Show the stored key's fingerprint
    Show {
        /// Print the full key
        #[arg(long)]
        reveal: bool,
    },
    /// Create the key if none exists
    Create,
}

fn main() -> Result<()> {
    let args = Args::parse();
    fidget_common::init_tracing_with_default(if args.verbose { "debug" } else { "info" });

    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?
            .apply_env_overrides()?,
        None => LinkConfig::from_env()?,
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    match args.command {
        Command::Connect {
            wallet,
            port,
            baud_rate,
            strict,
        } => {
            if port.is_some() {
                config.port = port;
            }
            if let Some(baud_rate) = baud_rate {
                config.baud_rate = baud_rate;
            }
            config.strict_acknowledgements |= strict;

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(connect(config, wallet))?;
        }
        Command::Ports => {
            let ports = fidget_link::available_ports().context("failed to list serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                let kind = if port.usb { "usb" } else { "other" };
                match port.description {
                    Some(description) => println!("{} ({}, {})", port.name, kind, description),
                    None => println!("{} ({})", port.name, kind),
                }
            }
        }
        Command::Key { action } => {
            let keys = open_key_store(&config)?;
            match action {
                KeyAction::Show { reveal } => match keys.symmetric_key()? {
                    Some(key) if reveal => println!("{}", key.to_hex()),
                    Some(key) => println!("{}", key.fingerprint()),
                    None => println!("No symmetric key stored"),
                },
                KeyAction::Create => {
                    let key = keys.get_or_create_symmetric_key()?;
                    println!("{}", key.fingerprint());
                }
            }
        }
        Command::Reset { keys: all } => {
            let keys = open_key_store(&config)?;
            if all {
                keys.reset()?;
                println!("Forgot the device wallet and deleted the symmetric key");
            } else {
                keys.forget_device_identity()?;
                println!("Forgot the device wallet");
            }
        }
        Command::Decrypt { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let keys = open_key_store(&config)?;
            decrypt_file(&raw, &keys, &config)?;
        }
        Command::Version => {
            println!("fidget {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn open_key_store(config: &LinkConfig) -> Result<KeyStore> {
    let dir = config
        .resolved_data_dir()
        .context("no data directory for the key store")?;
    Ok(KeyStore::open(&dir))
}

async fn connect(config: LinkConfig, wallet: Option<String>) -> Result<()> {
    let keys = open_key_store(&config)?;
    let opener = SerialOpener::new(config.port.clone(), config.baud_rate);
    let mut session = LinkSession::new(opener, keys, config);

    let cancel = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            cancel.cancel();
        }
    });

    let state = match session.connect(wallet.as_deref()).await {
        Ok(state) => state,
        Err(e) => bail!("{}", e.diagnostic()),
    };

    match state {
        LinkState::Connected => {
            println!(
                "Connected to device bound to {}",
                session.device_wallet().unwrap_or("unknown wallet")
            );
            let printed = match session.wait_for_payload().await {
                Ok(PayloadStatus::NoData) => {
                    // The session has already disconnected itself.
                    println!("No data available on the device");
                    return Ok(());
                }
                Ok(PayloadStatus::Decrypted { batch, .. }) => {
                    print_batch(&batch, session.decryption_error())
                }
                Ok(PayloadStatus::Opaque(raw)) => {
                    println!("{}", raw.trim());
                    Ok(())
                }
                Err(e) => {
                    warn!("no payload received: {}", e);
                    Ok(())
                }
            };
            session.disconnect().await;
            printed?;
        }
        LinkState::Initialized => {
            println!(
                "Device initialized for {}",
                session.device_wallet().unwrap_or("unknown wallet")
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
            session.close_after_init().await;
        }
        LinkState::WalletMismatch => {
            bail!(
                "device is bound to {}, not the connected wallet",
                session.device_wallet().unwrap_or("another wallet")
            );
        }
        other => bail!("unexpected link state {}", other),
    }
    Ok(())
}

fn decrypt_file(raw: &str, keys: &KeyStore, config: &LinkConfig) -> Result<()> {
    match payload::scan(raw) {
        PayloadScan::Document(document) => {
            let key = keys.symmetric_key()?;
            let decryptor = PayloadDecryptor::new(key, config.secret_phrase.as_str());
            let batch = decryptor.decrypt_entries(document.entries());
            print_batch(&batch, batch.diagnostic())
        }
        PayloadScan::Opaque => {
            println!("{}", raw.trim());
            Ok(())
        }
        PayloadScan::Pending { malformed } => match malformed {
            Some(reason) => bail!("payload is not valid JSON: {}", reason),
            None => bail!("no JSON object found"),
        },
    }
}

fn print_batch(batch: &DecryptedBatch, diagnostic: Option<&str>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&batch.to_values())?);
    if let Some(message) = diagnostic {
        warn!("{}", message);
    }
    if let Some(summary) = DailySummary::from_records(&batch.records) {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}
