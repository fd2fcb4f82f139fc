mod commands;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use client_core::{
    load_settings, load_settings_from, normalize_base_url, ChatSession, HttpChatBackend,
    InMemoryPreviewStore, LocalFile, SessionEvent, SubmitOutcome,
};
use commands::{Command, HELP};
use futures::future::try_join_all;
use shared::{
    domain::{ChatId, Role, UserId},
    protocol::MessagePayload,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the document chat backend")]
struct Args {
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    /// Config file to load instead of ./client.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(url) = &args.api_base_url {
        settings.api_base_url = normalize_base_url(url);
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = Some(user_id);
    }
    tracing::info!(api_base_url = %settings.api_base_url, "starting chat client");

    let backend = Arc::new(HttpChatBackend::new(settings.api_base_url.clone()));
    let previews = Arc::new(InMemoryPreviewStore::new());
    let session = ChatSession::with_previews(backend, &settings, previews.clone());
    tokio::spawn(print_events(session.subscribe_events()));

    println!("{HELP}");
    if let Some(user_id) = settings.user_id {
        match session.switch_user(UserId(user_id)).await {
            Ok(()) => print_chats(&session).await,
            Err(err) => eprintln!("{err}"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err:#}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(err) = run_command(&session, &previews, command).await {
            eprintln!("{err:#}");
        }
    }
    Ok(())
}

async fn run_command(
    session: &Arc<ChatSession>,
    previews: &InMemoryPreviewStore,
    command: Command,
) -> Result<()> {
    match command {
        Command::Users => {
            for user in session.list_users().await? {
                println!("{:>5}  {}", user.id.0, user.name);
            }
        }
        Command::User(user_id) => {
            session.switch_user(UserId(user_id)).await?;
            print_chats(session).await;
        }
        Command::Chats => print_chats(session).await,
        Command::Open(chat_id) => {
            session.select_chat(Some(ChatId(chat_id))).await?;
            print_history(session).await;
        }
        Command::New => {
            session.start_new_chat().await;
            println!("new chat: type a message to start it");
        }
        Command::Delete(chat_id) => {
            session.delete_chat(ChatId(chat_id)).await?;
            println!("deleted chat {chat_id}");
        }
        Command::Attach(paths) => {
            let files =
                try_join_all(paths.iter().map(|path| LocalFile::from_path(path))).await?;
            let staged = session.stage_files(files).await;
            println!("staged {} file(s)", staged.len());
        }
        Command::Link(raw) => {
            session.stage_url(&raw).await?;
            println!("staged link");
        }
        Command::Detach(position) => {
            let staged = session.snapshot().await.staged;
            let attachment = staged
                .get(position - 1)
                .with_context(|| format!("nothing staged at position {position}"))?;
            session.unstage(attachment.id).await;
            println!("removed {}", attachment.label());
        }
        Command::Staged => {
            let staged = session.snapshot().await.staged;
            if staged.is_empty() {
                println!("nothing staged");
            }
            for (index, attachment) in staged.iter().enumerate() {
                let preview = attachment
                    .preview()
                    .and_then(|handle| previews.get(handle))
                    .map(|bytes| format!(" (preview, {} bytes)", bytes.len()))
                    .unwrap_or_default();
                println!("{:>3}. {}{preview}", index + 1, attachment.label());
            }
        }
        Command::History => print_history(session).await,
        Command::Force(text) => spawn_send(session, text, true),
        Command::Send(text) => spawn_send(session, text, false),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

/// Sends run in the background so the prompt stays usable for navigation.
fn spawn_send(session: &Arc<ChatSession>, text: String, supersede: bool) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let outcome = if supersede {
            session.submit_superseding(&text).await
        } else {
            session.submit(&text).await
        };
        match outcome {
            SubmitOutcome::Rejected(reason) => eprintln!("not sent: {reason:?}"),
            SubmitOutcome::Failed(failure) => eprintln!(
                "send failed during {}: {}",
                failure.stage.as_str(),
                failure.message
            ),
            SubmitOutcome::Completed { .. } | SubmitOutcome::Superseded => {}
        }
    });
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageAppended { message }) if message.role == Role::Assistant => {
                print_message(&message);
            }
            Ok(SessionEvent::ThinkingChanged {
                target: Some(target),
            }) => match target.chat_id() {
                Some(chat_id) => println!("(thinking in chat {chat_id})"),
                None => println!("(thinking)"),
            },
            Ok(SessionEvent::ChatCreated { chat }) => {
                println!("created chat {}: {}", chat.id, chat.title());
            }
            Ok(SessionEvent::ChatSummaryUpdated { chat_id, summary }) => {
                tracing::debug!(chat_id = chat_id.0, %summary, "summary updated");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &MessagePayload) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    println!("{speaker}> {}", message.text);
    for attachment in &message.attachments {
        println!("    [attachment] {}", attachment.label());
    }
    let sources = message.display_context();
    if !sources.is_empty() {
        println!("    sources: {}", sources.join(", "));
    }
}

async fn print_chats(session: &ChatSession) {
    let snapshot = session.snapshot().await;
    if snapshot.chats.is_empty() {
        println!("no chats yet");
        return;
    }
    for (age, chats) in session.chats_by_age(Utc::now()).await {
        println!("{}", age.label());
        for chat in chats {
            let marker = if snapshot.selected == Some(chat.id) {
                '*'
            } else {
                ' '
            };
            println!(" {marker}{:>5}  {}", chat.id.0, chat.title());
        }
    }
}

async fn print_history(session: &ChatSession) {
    let snapshot = session.snapshot().await;
    match snapshot.selected {
        Some(chat_id) => println!("-- chat {chat_id} --"),
        None => println!("-- new chat --"),
    }
    for message in &snapshot.messages {
        print_message(message);
    }
}
