use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, MessageId};
use storage::CacheStore;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/cache.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Check,
    Conversations,
    Messages { conversation_id: String },
    RemoveMessage { message_id: String },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = CacheStore::new(&cli.database_url).await?;

    match cli.command {
        Command::Check => {
            store.health_check().await?;
            println!("cache ok: {}", cli.database_url);
        }
        Command::Conversations => {
            let conversations = store.get_conversation_list().await?;
            println!("{}", serde_json::to_string_pretty(&conversations)?);
        }
        Command::Messages { conversation_id } => {
            let messages = store
                .get_conversation_messages(&ConversationId::new(conversation_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Command::RemoveMessage { message_id } => {
            store.remove_message(&MessageId::new(message_id)).await?;
            println!("removed");
        }
        Command::Clear => {
            store.clear_all().await?;
            println!("cache cleared");
        }
    }

    Ok(())
}
