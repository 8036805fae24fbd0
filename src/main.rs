//! Chat channel terminal client.
//!
//! Joins one application's chat channel and bridges stdin lines to outbound
//! answers. Useful for exercising a backend without the web frontend.
//!
//! Usage:
//!   hirebot-chat --application-id 42 [--token <chat-token>]
//!
//! Environment Variables:
//!   API_BASE_URL - REST base URL (default: http://localhost:8001)
//!   WS_BASE_URL  - Socket base URL (default: derived from API_BASE_URL)

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hirebot_chat::chat::{ChatClient, ChatPhase, ChatUpdate};
use hirebot_chat::models::{ws_base_from_api, ChatConfig, Sender};

#[derive(Parser, Debug)]
#[command(name = "hirebot-chat")]
#[command(about = "Terminal client for the application chat channel")]
struct Args {
    /// Application id whose channel to join
    #[arg(short, long)]
    application_id: u64,

    /// Chat token appended to the socket URL
    #[arg(short, long)]
    token: Option<String>,

    /// REST base URL (overrides API_BASE_URL)
    #[arg(long)]
    api_base: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hirebot_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = ChatConfig::from_env();
    if let Some(api_base) = args.api_base {
        config.ws_base_url = ws_base_from_api(&api_base);
        config.api_base_url = api_base;
    }

    println!("Joining chat for application {}...", args.application_id);
    let (handle, mut updates) = ChatClient::connect(config, args.application_id, args.token)?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    // Binding finished.
                    break;
                };
                render(&update);
                if let ChatUpdate::Phase(phase) = update {
                    if phase.is_terminal() {
                        handle.close();
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) if !text.trim().is_empty() => handle.send_answer(text),
                    Ok(Some(_)) => {}
                    // Stdin closed: leave the channel.
                    Ok(None) | Err(_) => handle.close(),
                }
            }
        }
    }

    println!("Chat closed.");
    Ok(())
}

fn render(update: &ChatUpdate) {
    match update {
        ChatUpdate::HistoryLoaded { message_count } => {
            println!("-- history loaded ({message_count} messages)");
        }
        ChatUpdate::SessionId(session_id) => {
            println!("-- session {session_id}");
        }
        ChatUpdate::Phase(phase) => match phase {
            ChatPhase::Connecting => println!("-- connecting..."),
            ChatPhase::ConnectedIdle => println!("-- connected"),
            ChatPhase::Reconnecting { attempt } => {
                println!("-- reconnecting (attempt {attempt})");
            }
            ChatPhase::Ended => println!("-- chat ended"),
            ChatPhase::Failed => println!("-- connection lost for good"),
            _ => {}
        },
        ChatUpdate::Status(Some(status)) => println!("   [{status}]"),
        ChatUpdate::Status(None) => {}
        ChatUpdate::Typing(true) => println!("   [assistant is typing...]"),
        ChatUpdate::Typing(false) => {}
        ChatUpdate::Message(message) => {
            let who = match message.sender {
                Sender::Me => "you",
                Sender::Them => "assistant",
            };
            println!("[{who}] {}", message.text);
        }
    }
}
