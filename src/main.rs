use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use futures::future;
use pairchat::config::{self, AppConfig};
use pairchat::session::attachment;
use pairchat::storage::ensure_parent_dir;
use pairchat::{
    BlobStore, ChatBackend, ChatDatabase, ChatSession, HttpBlobStore, LocalBlobStore, Message,
    PendingFile, RealtimeBus, SessionEvent, StaticAuthProvider,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Parser)]
#[command(
    name = "pairchat",
    version,
    about = "One-to-one realtime chat core"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a user's chats, most recent activity first
    Chats {
        #[arg(long)]
        user: String,
    },
    /// Print a chat's history as seen by a participant
    History {
        #[arg(long)]
        chat: String,
        #[arg(long)]
        user: String,
    },
    /// Send a message, starting the chat if needed
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "")]
        text: String,
        /// File to attach
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Recompute every chat's unread counters from its messages
    RepairUnread,
    /// Run two in-process sessions against a scratch database
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);

    run_command(cli.command, &app_config).await
}

fn open_backend(app_config: &AppConfig) -> Result<ChatBackend, Box<dyn Error>> {
    ensure_parent_dir(&app_config.database_path)?;
    let db = ChatDatabase::with_path(&app_config.database_path, app_config.store_limits())?;
    Ok(ChatBackend::new(
        db,
        RealtimeBus::new(app_config.channel_capacity),
    ))
}

fn blob_store(app_config: &AppConfig) -> Arc<dyn BlobStore> {
    match &app_config.blob_endpoint {
        Some(endpoint) => Arc::new(HttpBlobStore::new(
            endpoint.clone(),
            app_config.blob_bucket.clone(),
            app_config.blob_token.clone(),
            app_config.public_base_url.clone(),
            app_config.store_max_attachment_bytes,
        )),
        None => Arc::new(LocalBlobStore::new(
            &app_config.blob_dir,
            app_config.public_base_url.clone(),
            app_config.store_max_attachment_bytes,
        )),
    }
}

async fn run_command(command: Command, app_config: &AppConfig) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Chats { user } => {
            let backend = open_backend(app_config)?;
            let chats = backend.list_chats(&user).await?;
            if chats.is_empty() {
                println!("No chats for {user}");
            }
            for chat in chats {
                println!(
                    "{}  with {:<16} unread {:>3}  {}",
                    chat.id,
                    chat.other_participant(&user).unwrap_or("?"),
                    chat.unread_for(&user).unwrap_or(0),
                    chat.last_message_text.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::History { chat, user } => {
            let backend = open_backend(app_config)?;
            for message in backend.get_messages(&chat, &user).await? {
                print_message(&message);
            }
        }
        Command::Send {
            from,
            to,
            text,
            file,
        } => {
            let pending = match file {
                Some(path) => Some(attachment::read_pending_file(&path)?),
                None => None,
            };
            let auth = StaticAuthProvider::new(from.clone(), from.clone());
            let (session, _events) = ChatSession::spawn(
                open_backend(app_config)?,
                blob_store(app_config),
                &auth,
                app_config.session_config(),
            )?;

            session.start_chat(&to).await?;
            let message = session.send_message(&text, pending).await?;
            session.close().await?;
            print_message(&message);
        }
        Command::RepairUnread => {
            let backend = open_backend(app_config)?;
            let repaired = backend.repair_all_unread().await?;
            println!("Repaired unread counters on {repaired} chats");
        }
        Command::Demo => run_demo(app_config).await?,
    }
    Ok(())
}

async fn run_demo(app_config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let backend = ChatBackend::new(ChatDatabase::in_memory()?, RealtimeBus::default());
    let scratch = std::env::temp_dir().join("pairchat-demo-blobs");
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        scratch,
        app_config.public_base_url.clone(),
        app_config.store_max_attachment_bytes,
    ));
    let session_config = app_config.session_config();

    let (alice, _alice_events) = ChatSession::spawn(
        backend.clone(),
        Arc::clone(&blobs),
        &StaticAuthProvider::new("alice", "Alice"),
        session_config.clone(),
    )?;
    let (bob, mut bob_events) = ChatSession::spawn(
        backend.clone(),
        blobs,
        &StaticAuthProvider::new("bob", "Bob"),
        session_config,
    )?;

    let (chat, same) = future::try_join(alice.start_chat("bob"), bob.start_chat("alice")).await?;
    println!("alice and bob share chat {} ({})", chat.id, chat.id == same.id);

    let watcher = bob.on_typing_change(|typing| {
        if typing.is_empty() {
            println!("bob sees: nobody typing");
        } else {
            println!("bob sees: {} typing", typing.join(", "));
        }
    });

    alice.keystroke().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.send_message("hello bob", None).await?;
    wait_for_message(&mut bob_events).await;

    let photo = PendingFile::new("beach.JPG", "image/jpeg", vec![0xFF; 64 * 1024]);
    alice.send_message("", Some(photo)).await?;
    wait_for_message(&mut bob_events).await;

    bob.send_message("hi alice", None).await?;

    for message in alice.messages().await? {
        print_message(&message);
    }
    println!(
        "bob unread: {}",
        backend.unread_count(&chat.id, "bob").await?
    );
    let read = bob.mark_read(&chat.id).await?;
    println!(
        "bob read {read} messages, unread now {}",
        backend.unread_count(&chat.id, "bob").await?
    );

    alice.close().await?;
    bob.close().await?;
    watcher.await?;
    Ok(())
}

async fn wait_for_message(events: &mut mpsc::Receiver<SessionEvent>) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::MessageMerged(message) = event {
                return Some(message);
            }
        }
        None
    };
    match timeout(Duration::from_secs(2), wait).await {
        Ok(Some(message)) => log::debug!("Live delivery of {}", message.id),
        Ok(None) => log::warn!("Session event stream ended"),
        Err(_) => log::warn!("No live delivery within 2s"),
    }
}

fn print_message(message: &Message) {
    let attachment = match (&message.attachment_type, &message.attachment_url) {
        (Some(kind), Some(url)) => format!(" [{kind}: {url}]"),
        _ => String::new(),
    };
    println!(
        "{} {:<12} {}{}",
        message.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        message.sender_id,
        message.content,
        attachment
    );
}
