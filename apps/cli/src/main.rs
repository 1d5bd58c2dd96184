use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, prepare_database_url},
    AttachmentUpload, ChatClient, ClientError, DeliveryState, FeedMessage, NoticeLevel,
    SyncEvent,
};
use shared::{
    attachment::MessageBody,
    domain::{ConversationId, MessageId},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pulse", about = "Terminal client for pulse chat")]
struct Args {
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    cache_db: Option<String>,
    /// Bearer token; falls back to PULSE_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Signed-in user.
    Whoami,
    /// Conversation list, cached entries first.
    Conversations,
    Search {
        query: String,
    },
    Presence {
        username: String,
    },
    /// Interactive session for one conversation.
    Open {
        conversation_id: String,
        recipient: String,
    },
    Upload {
        conversation_id: String,
        recipient: String,
        path: PathBuf,
    },
    /// Drops credentials and wipes the local cache.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(url) = args.api_url {
        settings.api_base_url = url;
    }
    if let Some(url) = args.push_url {
        settings.push_url = Some(url);
    }
    if let Some(url) = args.cache_db {
        settings.cache_database_url = prepare_database_url(&url);
    }
    let token = args.token.or_else(|| std::env::var("PULSE_TOKEN").ok());

    let client = ChatClient::connect(settings, token).await?;

    match args.command {
        Command::Whoami => {
            let user = client.load_profile().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Conversations => {
            for conversation in client.conversations().refresh().await {
                let unread = if conversation.has_seen { " " } else { "*" };
                println!(
                    "{unread} {:<12} {:<20} {}  {}",
                    conversation.id,
                    conversation.username,
                    conversation.last_activity.format("%Y-%m-%d %H:%M"),
                    conversation.last_message
                );
            }
        }
        Command::Search { query } => {
            for user in client.conversations().search_users(&query).await? {
                println!("{:<20} {}", user.username, user.full_name);
            }
        }
        Command::Presence { username } => {
            let presence = client.presence(&username).await?;
            println!("{}", serde_json::to_string_pretty(&presence)?);
        }
        Command::Open {
            conversation_id,
            recipient,
        } => {
            if let Err(err) = client.load_profile().await {
                warn!(error = %err, "could not load profile; messages will lack a sender");
            }
            run_conversation(&client, ConversationId::new(conversation_id), recipient).await?;
        }
        Command::Upload {
            conversation_id,
            recipient,
            path,
        } => {
            client.load_profile().await?;
            let sync = client.sync();
            sync.open(ConversationId::new(conversation_id), recipient)
                .await?;
            match sync.send_attachment(read_upload(&path).await?).await? {
                Some(id) => println!("sent {id}"),
                None => println!("upload failed"),
            }
            sync.close().await;
        }
        Command::Logout => {
            client.logout().await;
            println!("logged out; local cache cleared");
        }
    }

    Ok(())
}

async fn run_conversation(
    client: &ChatClient,
    conversation_id: ConversationId,
    recipient: String,
) -> Result<()> {
    let sync = client.sync().clone();
    let mut events = sync.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    sync.open(conversation_id, recipient).await?;
    println!("commands: /more  /delete <id>  /upload <path>  /call  /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/more", _) => sync.load_more().await,
            ("/call", _) => sync.start_video_call().await.map(|_| ()),
            ("/delete", id) => sync.delete_message(&MessageId::new(id.trim())).await,
            ("/upload", path) => match read_upload(Path::new(path.trim())).await {
                Ok(upload) => sync.send_attachment(upload).await.map(|_| ()),
                Err(err) => Err(err),
            },
            _ => {
                sync.keystroke().await;
                sync.send_text(line).await.map(|_| ())
            }
        };
        if let Err(err) = result {
            if ClientError::is_validation(&err) {
                eprintln!("! {err}");
            } else {
                return Err(err);
            }
        }
    }

    sync.close().await;
    printer.abort();
    Ok(())
}

async fn read_upload(path: &Path) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(AttachmentUpload {
        mime_type: mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string()),
        filename,
        bytes,
    })
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::FeedUpdated { messages, .. } => {
            println!("---");
            for entry in messages.iter().rev().take(20).rev() {
                println!("{}", render(entry));
            }
        }
        SyncEvent::StateChanged { state, .. } => println!("[{state:?}]"),
        SyncEvent::TypingChanged { typing_users, .. } if !typing_users.is_empty() => {
            println!("({} typing...)", typing_users.join(", "));
        }
        SyncEvent::TypingChanged { .. } | SyncEvent::ConversationsUpdated { .. } => {}
        SyncEvent::UploadProgress { filename, progress } => {
            println!("uploading {filename}: {progress:.0}%");
        }
        SyncEvent::Notice(notice) => {
            let marker = match notice.level {
                NoticeLevel::Error => "!",
                NoticeLevel::Success => "+",
                NoticeLevel::Info => "i",
            };
            println!("{marker} {}", notice.message);
        }
    }
}

fn render(entry: &FeedMessage) -> String {
    let message = &entry.message;
    let body = match MessageBody::classify(&message.content) {
        MessageBody::Attachment(file) => format!("[{} {}] {}", file.kind, file.name, file.url),
        MessageBody::VideoCall { url } => format!("[video call] {url}"),
        MessageBody::Image { url } => format!("[image] {url}"),
        MessageBody::Video { url } => format!("[video] {url}"),
        MessageBody::Link { url } => format!("[link] {url}"),
        MessageBody::Text => message.content.clone(),
    };
    let status = match entry.delivery {
        DeliveryState::Confirmed => "",
        DeliveryState::Sending => " (sending)",
        DeliveryState::Sent => " (sent)",
        DeliveryState::Failed => " (not sent)",
    };
    format!(
        "{} {:<12} {:<10} {}{}",
        message.sent_at.format("%H:%M"),
        message.id,
        message.sender_username,
        body,
        status
    )
}
