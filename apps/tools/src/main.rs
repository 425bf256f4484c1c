use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{domain::RecordId, model::Message};
use storage::{CursorStore, MemoryRecordStore, RecordStore, SqliteCursorStore};
use sync_core::{load_settings, SyncClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Cursor database; defaults to the configured `cursor_database_url`.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted notification cursor.
    ShowCursor,
    /// Forget the persisted cursor so the next fetch starts from the beginning.
    ResetCursor,
    /// Run a conversation end to end against an in-memory store.
    Demo {
        #[arg(long, default_value = "Hello from the demo!")]
        body: String,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.cursor_database_url = database_url;
    }

    match cli.command {
        Command::ShowCursor => {
            let database_url = settings.cursor_store_url();
            let cursors = SqliteCursorStore::new(&database_url).await?;
            cursors.health_check().await?;
            let cursor = cursors.load_cursor().await?;
            println!(
                "{}",
                serde_json::json!({
                    "database_url": database_url,
                    "cursor": cursor.map(|c| hex(c.as_bytes())),
                })
            );
        }
        Command::ResetCursor => {
            let database_url = settings.cursor_store_url();
            let cursors = SqliteCursorStore::new(&database_url).await?;
            cursors.clear_cursor().await?;
            println!("cursor reset in {database_url}");
        }
        Command::Demo { body } => run_demo(settings, &body).await?,
    }

    Ok(())
}

async fn run_demo(settings: sync_core::SyncSettings, body: &str) -> Result<()> {
    let alice = RecordId::from("alice");
    let bob = RecordId::from("bob");

    let store = Arc::new(MemoryRecordStore::new());
    store.set_current_user(alice.clone()).await;
    store.set_discoverable_name(alice.clone(), "Alice").await;
    store.set_current_user(bob.clone()).await;
    store.set_discoverable_name(bob.clone(), "Bob").await;
    store.add_contact(bob.clone(), Some("bob@example.com")).await;

    // Bob signs in once so his record carries a name, then Alice takes over.
    let bob_client = SyncClient::new(
        store.clone(),
        Arc::new(storage::MemoryCursorStore::new()),
        settings.clone(),
    )
    .await?;
    bob_client.login(true).await?;
    store.set_current_user(alice.clone()).await;

    let client = SyncClient::connect(store.clone(), settings).await?;
    // The in-memory store starts a fresh notification log on every run.
    client.reset_change_cursor().await?;
    let user = client.login(true).await?;
    info!(user_id = %user.id, "demo: signed in");

    let contacts = client.discover_contacts().await?.into_value();
    let conversation = client.create_conversation("Demo", &contacts).await?;
    client.subscribe_to_changes().await?;

    let reply = Message::compose(bob, conversation.id.clone(), body, Utc::now());
    store
        .save_records(vec![reply.to_record()?])
        .await
        .context("bob's reply")?;

    let report = client.fetch_notification_changes().await?;
    println!("{}", serde_json::to_string_pretty(&report.messages)?);

    let ids: Vec<RecordId> = report.messages.iter().map(|m| m.id.clone()).collect();
    client.mark_messages_processed(&ids).await;

    let subscriptions = client.list_subscriptions().await?;
    println!("{}", serde_json::to_string_pretty(&subscriptions)?);
    Ok(())
}
