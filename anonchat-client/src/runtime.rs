use std::{path::PathBuf, time::Duration};

use anonchat_core::{TimelineItem, UserInfo};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::ChatError,
    history::HistoryClient,
    session::{ConnectionState, FrameOutcome, HistoryRequest, Session, UploadTicket},
    upload::Uploader,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

/// Commands the embedder (UI or CLI) feeds into the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Connect,
    SendText(String),
    UploadImage(PathBuf),
    /// Scroll report: distance of the viewport from the top of the list.
    ScrollTopDistance(f32),
    /// Manual request for the next older page (also the retry path after a
    /// failed fetch).
    LoadOlder,
    Disconnect,
}

/// State changes the embedder renders.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    MessageAppended(TimelineItem),
    HistoryPrepended {
        count: usize,
        /// The initial load scrolls to the bottom; later pages keep the
        /// reading position.
        initial: bool,
    },
    PresenceReplaced(Vec<UserInfo>),
    ErrorSurfaced(ChatError),
}

/// Completions of work the session task farmed out, tagged with the
/// generation that requested them so stale results can be dropped.
#[derive(Debug)]
enum AsyncOutcome {
    SocketText {
        generation: u64,
        text: String,
    },
    SocketClosed {
        generation: u64,
        code: Option<u16>,
    },
    HistoryPage {
        generation: u64,
        result: Result<Vec<anonchat_core::ChatMessage>, ChatError>,
    },
    Upload {
        generation: u64,
        result: Result<String, ChatError>,
    },
}

/// Drive one session: owns the `Session` coordinator and the socket
/// handle, serializes every event (socket frame, HTTP completion, command)
/// through a single loop, and reports changes to the embedder.
pub async fn run_session(
    config: ClientConfig,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let http = reqwest::Client::new();
    let api_base = match config.api_base() {
        Ok(url) => url,
        Err(err) => {
            let _ = events.send(SessionEvent::ErrorSurfaced(err));
            return;
        }
    };
    let history = HistoryClient::new(http.clone(), api_base.clone());
    let uploader = Uploader::new(http, api_base);

    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel::<AsyncOutcome>();
    // Write half of the current socket, owned exclusively by this loop.
    let mut socket_tx: Option<mpsc::UnboundedSender<Message>> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    SessionCommand::Connect => {
                        connect(&config, &mut session, &events, &outcome_tx, &mut socket_tx).await;
                        if session.state() == ConnectionState::Open {
                            dispatch_history(session.begin_history_fetch(), &history, &outcome_tx);
                        }
                    }
                    SessionCommand::SendText(text) => {
                        match session.prepare_send(&text, anonchat_core::MessageKind::Text) {
                            Ok(frame) => transmit(&mut socket_tx, frame),
                            Err(err) => {
                                let _ = events.send(SessionEvent::ErrorSurfaced(err));
                            }
                        }
                    }
                    SessionCommand::UploadImage(path) => {
                        match session.begin_upload() {
                            Ok(ticket) => dispatch_upload(ticket, path, &uploader, &outcome_tx),
                            Err(err) => {
                                let _ = events.send(SessionEvent::ErrorSurfaced(err));
                            }
                        }
                    }
                    SessionCommand::ScrollTopDistance(distance) => {
                        dispatch_history(session.note_scroll(distance), &history, &outcome_tx);
                    }
                    SessionCommand::LoadOlder => {
                        dispatch_history(session.begin_history_fetch(), &history, &outcome_tx);
                    }
                    SessionCommand::Disconnect => {
                        if let Some(tx) = socket_tx.take() {
                            let _ = tx.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnect".into(),
                            })));
                        }
                        session.disconnect();
                        let _ = events.send(SessionEvent::StateChanged(session.state()));
                    }
                }
            }
            outcome = outcomes.recv() => {
                // The loop holds a sender for its own tasks, so this arm
                // never yields None while the loop is alive.
                let Some(outcome) = outcome else { break };
                match outcome {
                    AsyncOutcome::SocketText { generation, text } => {
                        if generation != session.generation() {
                            debug!(stale = generation, "dropping frame from stale socket");
                            continue;
                        }
                        match session.on_frame(&text) {
                            FrameOutcome::Appended(item) => {
                                let _ = events.send(SessionEvent::MessageAppended(item));
                            }
                            FrameOutcome::PresenceReplaced(users) => {
                                let _ = events.send(SessionEvent::PresenceReplaced(users));
                            }
                            FrameOutcome::Ignored => {}
                        }
                    }
                    AsyncOutcome::SocketClosed { generation, code } => {
                        if generation != session.generation() {
                            debug!(stale = generation, "ignoring close of stale socket");
                            continue;
                        }
                        socket_tx = None;
                        let state_before = session.state();
                        session.on_disconnect(code);
                        if session.state() != state_before {
                            let _ = events.send(SessionEvent::StateChanged(session.state()));
                            if let Some(err) = session.last_error() {
                                let _ = events.send(SessionEvent::ErrorSurfaced(err.clone()));
                            }
                        }
                    }
                    AsyncOutcome::HistoryPage { generation, result } => match result {
                        Ok(page) => {
                            if let Some(applied) = session.apply_history_page(generation, page) {
                                let _ = events.send(SessionEvent::HistoryPrepended {
                                    count: applied.prepended,
                                    initial: applied.initial,
                                });
                            }
                        }
                        Err(err) => {
                            if let Some(err) = session.history_fetch_failed(generation, err) {
                                let _ = events.send(SessionEvent::ErrorSurfaced(err));
                            }
                        }
                    },
                    AsyncOutcome::Upload { generation, result } => match result {
                        Ok(url) => {
                            if let Some(frame) = session.upload_succeeded(generation, &url) {
                                transmit(&mut socket_tx, frame);
                            }
                        }
                        Err(err) => {
                            if let Some(err) = session.upload_failed(generation, err) {
                                let _ = events.send(SessionEvent::ErrorSurfaced(err));
                            }
                        }
                    },
                }
            }
        }
    }

    info!("session task finished");
}

/// One connect attempt, no automatic retry: a failure surfaces and waits
/// for a manual reconnect command.
async fn connect(
    config: &ClientConfig,
    session: &mut Session,
    events: &mpsc::UnboundedSender<SessionEvent>,
    outcome_tx: &mpsc::UnboundedSender<AsyncOutcome>,
    socket_tx: &mut Option<mpsc::UnboundedSender<Message>>,
) {
    if !session.begin_connect() {
        return;
    }
    let _ = events.send(SessionEvent::StateChanged(session.state()));

    // begin_connect verified the identity exists.
    let Some(identity) = session.identity() else {
        return;
    };
    let endpoint = match config.ws_endpoint(identity) {
        Ok(url) => url,
        Err(err) => {
            session.on_connect_failed(err.to_string());
            let _ = events.send(SessionEvent::StateChanged(session.state()));
            let _ = events.send(SessionEvent::ErrorSurfaced(err));
            return;
        }
    };

    info!(endpoint = %endpoint, "connecting");
    let ws_stream = match timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            session.on_connect_failed(format!("connect failed: {err}"));
            let _ = events.send(SessionEvent::StateChanged(session.state()));
            if let Some(err) = session.last_error() {
                let _ = events.send(SessionEvent::ErrorSurfaced(err.clone()));
            }
            return;
        }
        Err(_) => {
            session.on_connect_failed(format!("connect timed out after {CONNECT_TIMEOUT:?}"));
            let _ = events.send(SessionEvent::StateChanged(session.state()));
            if let Some(err) = session.last_error() {
                let _ = events.send(SessionEvent::ErrorSurfaced(err.clone()));
            }
            return;
        }
    };

    session.on_open();
    let _ = events.send(SessionEvent::StateChanged(session.state()));

    let (write_half, read_half) = ws_stream.split();
    let (send_tx, send_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(socket_send_task(write_half, send_rx));
    tokio::spawn(socket_read_task(
        session.generation(),
        read_half,
        outcome_tx.clone(),
    ));
    *socket_tx = Some(send_tx);
}

fn transmit(socket_tx: &mut Option<mpsc::UnboundedSender<Message>>, frame: String) {
    let delivered = socket_tx
        .as_ref()
        .is_some_and(|tx| tx.send(Message::Text(frame.into())).is_ok());
    if !delivered {
        warn!("outbound frame dropped: socket writer is gone");
    }
}

fn dispatch_history(
    request: Option<HistoryRequest>,
    history: &HistoryClient,
    outcome_tx: &mpsc::UnboundedSender<AsyncOutcome>,
) {
    let Some(request) = request else { return };
    let history = history.clone();
    let outcome_tx = outcome_tx.clone();
    tokio::spawn(async move {
        let result = history
            .fetch_page(request.page.limit, request.page.before.as_deref())
            .await;
        let _ = outcome_tx.send(AsyncOutcome::HistoryPage {
            generation: request.generation,
            result,
        });
    });
}

fn dispatch_upload(
    ticket: UploadTicket,
    path: PathBuf,
    uploader: &Uploader,
    outcome_tx: &mpsc::UnboundedSender<AsyncOutcome>,
) {
    let uploader = uploader.clone();
    let outcome_tx = outcome_tx.clone();
    tokio::spawn(async move {
        let generation = ticket.generation;
        let result = read_and_upload(ticket, path, uploader).await;
        let _ = outcome_tx.send(AsyncOutcome::Upload { generation, result });
    });
}

async fn read_and_upload(
    ticket: UploadTicket,
    path: PathBuf,
    uploader: Uploader,
) -> Result<String, ChatError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_owned());
    let read_path = path.clone();
    let bytes = tokio::task::spawn_blocking(move || std::fs::read(&read_path))
        .await
        .map_err(|err| ChatError::UploadFailed(format!("read task failed: {err}")))?
        .map_err(|err| ChatError::UploadFailed(format!("cannot read {}: {err}", path.display())))?;
    uploader.upload(&ticket.user_id, &file_name, bytes).await
}

async fn socket_send_task(mut write: WsWrite, mut outgoing: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outgoing.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if write.send(message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
}

async fn socket_read_task(
    generation: u64,
    mut read: WsRead,
    outcome_tx: mpsc::UnboundedSender<AsyncOutcome>,
) {
    let mut close_code: Option<u16> = None;
    while let Some(next) = read.next().await {
        match next {
            Ok(Message::Text(text)) => {
                let _ = outcome_tx.send(AsyncOutcome::SocketText {
                    generation,
                    text: text.to_string(),
                });
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|frame| u16::from(frame.code));
                break;
            }
            Ok(_) => {} // ping/pong/binary are not part of this protocol
            Err(err) => {
                warn!("socket read failed: {err}");
                break;
            }
        }
    }
    let _ = outcome_tx.send(AsyncOutcome::SocketClosed {
        generation,
        code: close_code,
    });
}
