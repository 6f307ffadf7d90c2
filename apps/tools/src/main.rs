use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_config, AttachmentDraft, Author, ChatCore, CoreError, MessageDisplay, RoomView,
};
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::ApiError,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatctl", about = "Operate a local chat store from the command line")]
struct Cli {
    /// Config file; `chat.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateRoom {
        name: String,
        #[arg(long)]
        photo: Option<String>,
    },
    Room {
        room_id: i64,
    },
    Recent {
        user_id: i64,
    },
    Send {
        room_id: i64,
        user_id: i64,
        #[arg(default_value = "")]
        text: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "audio")]
        image: Option<PathBuf>,
        #[arg(long)]
        audio: Option<PathBuf>,
    },
    Edit {
        message_id: i64,
        text: String,
    },
    Delete {
        message_id: i64,
    },
    DeleteRoom {
        room_id: i64,
        user_id: i64,
    },
    List {
        room_id: i64,
        #[arg(long, default_value_t = 0)]
        viewer: i64,
        #[arg(long)]
        lang: Option<String>,
    },
    Translate {
        room_id: i64,
        message_id: i64,
        #[arg(long)]
        lang: Option<String>,
    },
    Transcribe {
        message_id: i64,
    },
    Watch {
        room_id: i64,
        #[arg(long, default_value_t = 0)]
        viewer: i64,
    },
    Reconcile,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<CoreError>() {
                Some(core) => {
                    let api = ApiError::from(core);
                    match serde_json::to_string(&api) {
                        Ok(json) => eprintln!("{json}"),
                        Err(_) => eprintln!("{core}"),
                    }
                }
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let default_lang = config.default_target_language.clone();
    let core = ChatCore::open(config).await?;

    match cli.command {
        Command::CreateRoom { name, photo } => {
            let room = core.rooms.create_room(&name, photo.as_deref()).await?;
            println!("created room_id={}", room.id);
        }
        Command::Room { room_id } => {
            let profile = core.rooms.room_profile(RoomId(room_id)).await?;
            print_json(&profile)?;
        }
        Command::Recent { user_id } => {
            let rooms = core.rooms.recent_rooms(UserId(user_id)).await?;
            print_json(&rooms)?;
        }
        Command::Send {
            room_id,
            user_id,
            text,
            name,
            image,
            audio,
        } => {
            let draft = match (image, audio) {
                (Some(path), _) => Some(AttachmentDraft::image(read_file(&path).await?)),
                (None, Some(path)) => Some(AttachmentDraft::audio(read_file(&path).await?)),
                (None, None) => None,
            };
            let author = match name {
                Some(name) => Author::new(UserId(user_id), name),
                None => Author::from(UserId(user_id)),
            };
            let receipt = core
                .messages
                .send(RoomId(room_id), &author, &text, draft)
                .await?;
            let message_id = receipt.message_id();
            println!("sent message_id={message_id}");
            if let Some(state) = receipt.attachment_settled().await {
                println!("attachment {}", state.as_str());
            }
        }
        Command::Edit { message_id, text } => {
            let record = core
                .messages
                .edit_commit(MessageId(message_id), &text)
                .await?;
            print_json(&record)?;
        }
        Command::Delete { message_id } => {
            core.messages.delete_message(MessageId(message_id)).await?;
            println!("deleted message_id={message_id}");
        }
        Command::DeleteRoom { room_id, user_id } => {
            let report = core
                .rooms
                .delete_room(RoomId(room_id), UserId(user_id))
                .await;
            println!(
                "deleted room_id={room_id} messages={} blobs={}",
                report.messages_deleted, report.blobs_deleted
            );
            for failure in &report.failures {
                println!("  failed {}: {}", failure.target, failure.error);
            }
        }
        Command::List {
            room_id,
            viewer,
            lang,
        } => {
            let snapshot = core.messages.snapshot(RoomId(room_id)).await?;
            let mut view = RoomView::new(RoomId(room_id), UserId(viewer));
            view.apply(&shared::protocol::FeedEvent::RoomChanged { snapshot });
            let lang = lang.unwrap_or_else(|| default_lang.clone());
            print_rows(&view.render(&core.messages, &lang).await)?;
        }
        Command::Translate {
            room_id,
            message_id,
            lang,
        } => {
            let snapshot = core.messages.snapshot(RoomId(room_id)).await?;
            let message = snapshot
                .messages
                .iter()
                .find(|m| m.id == MessageId(message_id))
                .ok_or(CoreError::MessageNotFound(MessageId(message_id)))?;
            let text = message
                .correction
                .as_ref()
                .map_or(message.text.as_str(), |c| c.corrected_text.as_str());
            let lang = lang.unwrap_or(default_lang);
            match core
                .messages
                .request_translation(message.id, text, &lang)
                .await
            {
                Some(translated) => println!("{translated}"),
                None => println!("no translation available"),
            }
        }
        Command::Transcribe { message_id } => {
            match core
                .messages
                .request_transcription(MessageId(message_id))
                .await
            {
                Some(transcript) => println!("{transcript}"),
                None => println!("no transcription available"),
            }
        }
        Command::Watch { room_id, viewer } => {
            let handle = core.watch_room(RoomId(room_id), UserId(viewer)).await?;
            let mut updates = handle.updates.clone();
            info!(room_id, "watching room; ctrl-c to stop");
            loop {
                let view = updates.borrow_and_update().clone();
                if view.is_deleted() {
                    println!("room {room_id} was deleted");
                    break;
                }
                print_rows(&view.render(&core.messages, &default_lang).await)?;
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            handle.stop();
        }
        Command::Reconcile => {
            let settled = core.messages.reconcile_stale_uploads().await?;
            for (message_id, state) in &settled {
                println!("message_id={message_id} attachment {}", state.as_str());
            }
            println!("settled {} stale attachment(s)", settled.len());
        }
    }

    Ok(())
}

async fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))
}

fn print_rows(rows: &[MessageDisplay]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
