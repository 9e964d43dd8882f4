use std::path::PathBuf;

use anonchat_core::MessageCategory;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use anonchat_client::{
    config::{self, ClientConfig},
    identity,
    runtime::{SessionCommand, SessionEvent, run_session},
    session::Session,
};

/// Terminal front-end for the anonymous chat session coordinator.
#[derive(Debug, Parser)]
#[command(name = "anonchat", version, about)]
struct Args {
    /// WebSocket base URL, e.g. ws://127.0.0.1:8000
    #[arg(long)]
    server: Option<String>,
    /// HTTP base URL for history and uploads, e.g. http://127.0.0.1:8000
    #[arg(long)]
    api: Option<String>,
    /// Directory for identity and config files
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Discard the persisted identity and generate a fresh one
    #[arg(long)]
    new_identity: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(config::data_dir);

    let config_path = config::config_path(&data_dir);
    let mut config: ClientConfig = config::load_or_default(&config_path);
    let flags_given = args.server.is_some() || args.api.is_some();
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(api) = args.api {
        config.api_url = api;
    }
    if flags_given {
        if let Err(err) = config::save(&config_path, &config) {
            warn!(path = %config_path.display(), "config not saved: {err}");
        }
    }

    let identity_path = identity::identity_path(&data_dir);
    if args.new_identity {
        if let Err(err) = identity::reset(&identity_path) {
            warn!(path = %identity_path.display(), "identity reset failed: {err}");
        }
    }
    let me = identity::resolve(&identity_path);
    println!("you are {} ({})", me.user_name, me.user_id);
    println!("commands: /image <path>, /older, /users, /connect, /quit");

    let session = Session::new(Some(me.clone()));
    let (command_tx, command_rx) = mpsc::unbounded_channel::<SessionCommand>();
    let (event_tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    tokio::spawn(run_session(config, session, command_rx, event_tx));
    let _ = command_tx.send(SessionCommand::Connect);

    let mut input_lines = spawn_stdin_reader();
    let mut online: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                render_event(event, &me.user_id, &mut online);
            }
            line = input_lines.recv() => {
                let Some(line) = line else {
                    let _ = command_tx.send(SessionCommand::Disconnect);
                    break;
                };
                let line = line.trim().to_owned();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    let _ = command_tx.send(SessionCommand::Disconnect);
                    break;
                } else if line == "/older" {
                    let _ = command_tx.send(SessionCommand::LoadOlder);
                } else if line == "/connect" {
                    let _ = command_tx.send(SessionCommand::Connect);
                } else if line == "/users" {
                    println!("online ({}): {}", online.len(), online.join(", "));
                } else if let Some(path) = line.strip_prefix("/image ") {
                    let _ = command_tx.send(SessionCommand::UploadImage(PathBuf::from(
                        path.trim(),
                    )));
                } else {
                    let _ = command_tx.send(SessionCommand::SendText(line));
                }
            }
        }
    }
}

fn render_event(event: SessionEvent, my_id: &str, online: &mut Vec<String>) {
    match event {
        SessionEvent::StateChanged(state) => println!("* connection: {state:?}"),
        SessionEvent::MessageAppended(item) => match item.category {
            MessageCategory::System => println!("* {}", item.message.content),
            MessageCategory::Chat => {
                let who = item
                    .message
                    .sender
                    .as_ref()
                    .map(|sender| {
                        if sender.id == my_id {
                            format!("{} (you)", sender.name)
                        } else {
                            sender.name.clone()
                        }
                    })
                    .unwrap_or_else(|| "?".to_owned());
                println!("{who}: {}", item.message.content);
            }
        },
        SessionEvent::HistoryPrepended { count, initial } => {
            if initial {
                println!("* loaded {count} recent messages");
            } else {
                println!("* loaded {count} older messages");
            }
        }
        SessionEvent::PresenceReplaced(users) => {
            *online = users.into_iter().map(|user| user.name).collect();
            println!("* online now: {}", online.join(", "));
        }
        SessionEvent::ErrorSurfaced(err) => println!("! {err}"),
    }
}

/// Forward stdin lines into the async loop; stdin has no async story in
/// the runtime feature set this binary carries.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut buf = String::new();
        loop {
            buf.clear();
            match stdin.read_line(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(buf.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
