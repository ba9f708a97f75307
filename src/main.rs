use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use panel_vault::{ClearTarget, Conversation, NewMessage, Role, Store, StoreConfig};
use serde_json::Value;
use tracing::info;

#[derive(Parser)]
#[command(name = "panel-vault")]
#[command(about = "Inspect and maintain the panel's settings and chat history store.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory (defaults to the per-user application data location)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which backend is in use and where data lives
    Where,
    /// Read a setting
    Get {
        key: String,
    },
    /// Write a setting (value parsed as JSON, falling back to a plain string)
    Set {
        key: String,
        value: String,
    },
    /// Append a message to a conversation
    Append {
        /// Conversation id (generated when omitted)
        #[arg(short = 'i', long)]
        conversation: Option<String>,
        /// user, assistant or system
        #[arg(short, long, default_value = "user")]
        role: String,
        text: String,
    },
    /// List conversations
    List,
    /// Print a conversation
    Show {
        conversation: String,
    },
    /// Export a redacted conversation
    Export {
        conversation: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a setting or a conversation
    Clear {
        #[command(subcommand)]
        target: ClearCommand,
    },
}

#[derive(Subcommand)]
enum ClearCommand {
    Setting { key: String },
    Conversation { id: String },
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let base = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let mut config = base.overlay_env().context("reading PANEL_VAULT_* variables")?;
    if let Some(dir) = &cli.dir {
        config.base_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = Store::open(config).context("opening store")?;
    info!(backend = %store.backend_kind(), "store ready");

    match cli.command {
        Commands::Where => {
            println!("backend:  {}", store.backend_kind());
            println!("mode:     {}", store.seal_mode());
            println!("chain:    {:?}", store.chain());
            println!("base dir: {}", store.base_dir().display());
            if let Some(status) = store.key_status() {
                println!("key:      {:?}", status);
            }
        }
        Commands::Get { key } => {
            let value = store.get(&key, Value::Null).await;
            let shown = if panel_vault::model::is_credential(&key) && !value.is_null() {
                Value::String(panel_vault::redact::PLACEHOLDER.to_string())
            } else {
                panel_vault::redact::redact_value(&value)
            };
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        Commands::Set { key, value } => {
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
            store.set(&key, parsed).await.context("writing setting")?;
            println!("✅ {} saved", key);
        }
        Commands::Append {
            conversation,
            role,
            text,
        } => {
            let id = conversation.unwrap_or_else(Conversation::generate_id);
            let role: Role = role.parse()?;
            let outcome = store
                .append_message(&id, NewMessage::new(role, text))
                .await
                .context("appending message")?;
            if let Some(archive) = outcome.archived {
                info!(conversation = %id, %archive, "log rotated");
            }
            println!("{}", id);
        }
        Commands::List => {
            for id in store.list_conversations().await? {
                println!("{}", id);
            }
        }
        Commands::Show { conversation } => {
            let conversation = store.read_conversation(&conversation).await?;
            println!(
                "{} ({} messages, started {})",
                conversation.id,
                conversation.messages.len(),
                conversation.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!("{}", "─".repeat(50));
            for message in &conversation.messages {
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.role,
                    panel_vault::redact::redact(&message.text)
                );
            }
        }
        Commands::Export {
            conversation,
            output,
        } => match output {
            Some(path) => {
                store
                    .export_conversation_to_file(&conversation, &path)
                    .await
                    .with_context(|| format!("exporting to {}", path.display()))?;
                println!("✅ exported to {}", path.display());
            }
            None => {
                let bytes = store.export_conversation(&conversation).await?;
                println!("{}", String::from_utf8_lossy(&bytes));
            }
        },
        Commands::Clear { target } => {
            let target = match target {
                ClearCommand::Setting { key } => ClearTarget::Setting(key),
                ClearCommand::Conversation { id } => ClearTarget::Conversation(id),
            };
            store.clear(target.clone()).await.context("clearing")?;
            println!("✅ cleared {:?}", target);
        }
    }

    Ok(())
}
