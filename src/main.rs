//! Neolink CLI - talk to characters from the terminal.
//!
//! See the `neolink` library for the session core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neolink::{Config, SessionManager};

#[derive(Parser)]
#[command(name = "neolink")]
#[command(version)]
#[command(about = "Chat session client over the character WebSocket service")]
struct Cli {
    /// Session token (overrides NEOLINK_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new one-on-one chat and print the greeting turn
    NewChat {
        /// Character to chat with
        character: String,
    },
    /// Send a message and print the final reply
    Send {
        /// Character the chat belongs to
        character: String,
        /// Chat to post in
        chat: String,
        /// Message text
        message: String,
    },
    /// Print one page of chat history
    History {
        /// Chat to read
        chat: String,
        /// Paging token from a previous page
        #[arg(long)]
        next_token: Option<String>,
    },
    /// Print every unsolicited frame until Ctrl-C
    Listen,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(token) = cli.token {
        config.token = token;
    }
    if config.token.is_empty() {
        anyhow::bail!("No session token. Pass --token or set NEOLINK_TOKEN.");
    }

    let token = config.token.clone();
    let manager = SessionManager::new(config)?;
    manager
        .authenticate(&token)
        .await
        .context("Authentication failed")?;

    let outcome = run(&manager, cli.command).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &SessionManager, command: Commands) -> Result<()> {
    match command {
        Commands::NewChat { character } => {
            let reply = manager.create_conversation(&character).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Send {
            character,
            chat,
            message,
        } => {
            let reply = manager.send_message(&message, &character, &chat).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::History { chat, next_token } => {
            let page = manager.get_messages(&chat, next_token.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Commands::Listen => {
            let listener = manager.on_frame(|frame| {
                if let Some(text) = frame.as_text() {
                    println!("[{}] {}", frame.endpoint(), text);
                }
                Ok(())
            });
            log::info!("Listening; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            manager.remove_listener(listener);
        }
    }
    Ok(())
}
