use anonchat_core::{
    ChatMessage, InboundFrame, MessageKind, OutboundFrame, Timeline, TimelineItem, UserInfo,
    close_is_normal, decode_frame, encode_frame,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ChatError, ErrorKind},
    history::{HistoryPager, PageRequest, should_fetch_older},
    identity::Identity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

/// What a dispatched inbound frame did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Appended(TimelineItem),
    PresenceReplaced(Vec<UserInfo>),
    Ignored,
}

/// A history fetch the runtime should perform, tagged with the generation
/// that requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub generation: u64,
    pub page: PageRequest,
}

/// Permission to run one upload attempt for the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub generation: u64,
    pub user_id: String,
}

/// Result of applying a completed history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageApplied {
    pub prepended: usize,
    /// Only the first load after open scrolls the view to the bottom;
    /// later pages must preserve the reading position.
    pub initial: bool,
}

/// The connection lifecycle and history-pagination coordinator.
///
/// Owns the connection state machine, the generation counter, the merged
/// timeline, the presence list, the pager, and the latest-error slot. All
/// methods are synchronous; the async runtime feeds socket and HTTP
/// completions in and performs the I/O the returned values ask for.
#[derive(Debug)]
pub struct Session {
    identity: Option<Identity>,
    state: ConnectionState,
    generation: u64,
    timeline: Timeline,
    presence: Vec<UserInfo>,
    pager: HistoryPager,
    last_error: Option<ChatError>,
}

impl Session {
    pub fn new(identity: Option<Identity>) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            generation: 0,
            timeline: Timeline::new(),
            presence: Vec::new(),
            pager: HistoryPager::new(),
            last_error: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Swap identities after an explicit reset. Only allowed while no
    /// connection exists; the caller disconnects first.
    pub fn replace_identity(&mut self, identity: Identity) {
        debug_assert!(!matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ));
        self.identity = Some(identity);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn presence(&self) -> &[UserInfo] {
        &self.presence
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn pager(&self) -> &HistoryPager {
        &self.pager
    }

    fn surface(&mut self, err: ChatError) -> ChatError {
        self.last_error = Some(err.clone());
        err
    }

    fn clear_error_of_kind(&mut self, kind: ErrorKind) {
        if self.last_error.as_ref().is_some_and(|e| e.kind() == kind) {
            self.last_error = None;
        }
    }

    /// Start connecting. A no-op when identity is missing or a connection
    /// handle already exists (Connecting/Open), which prevents duplicate
    /// sockets. Each accepted call bumps the generation so async results
    /// belonging to an earlier connection can be discarded.
    pub fn begin_connect(&mut self) -> bool {
        if self.identity.is_none() {
            warn!("connect ignored: no identity resolved");
            return false;
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            debug!(state = ?self.state, "connect ignored: connection already exists");
            return false;
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        info!(generation = self.generation, "connecting");
        true
    }

    /// The socket opened: clear any prior error, reset pagination, and
    /// start the session's message sequence from scratch. The runtime
    /// follows up with the initial history fetch.
    pub fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.last_error = None;
        self.pager.reset();
        self.timeline.clear();
        self.presence.clear();
        info!(generation = self.generation, "connection open");
    }

    /// The connect attempt itself failed before the socket opened.
    pub fn on_connect_failed(&mut self, detail: String) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.state = ConnectionState::Errored;
        self.surface(ChatError::Connection(detail));
    }

    /// The socket went away. Code 1000 is a clean shutdown; anything else
    /// (or no close frame at all) surfaces a connection error. Either way
    /// the handle is considered released and `begin_connect` works again.
    pub fn on_disconnect(&mut self, code: Option<u16>) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return;
        }
        if close_is_normal(code) {
            self.state = ConnectionState::Closed;
            info!(generation = self.generation, "connection closed normally");
        } else {
            self.state = ConnectionState::Errored;
            let detail = match code {
                Some(code) => format!("connection closed abnormally (code {code})"),
                None => "connection lost without close handshake".to_owned(),
            };
            warn!(generation = self.generation, "{detail}");
            self.surface(ChatError::Connection(detail));
        }
    }

    /// Client-initiated shutdown (identity change, teardown). Marks the
    /// session Closed without surfacing an error; the runtime sends the
    /// normal-code close frame.
    pub fn disconnect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.state = ConnectionState::Closed;
            info!(generation = self.generation, "disconnecting");
        }
    }

    /// Dispatch one inbound text frame by its `type` discriminant.
    /// Malformed or unrecognized frames are dropped with a diagnostic and
    /// never tear down the connection.
    pub fn on_frame(&mut self, text: &str) -> FrameOutcome {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping inbound frame: {err}");
                return FrameOutcome::Ignored;
            }
        };

        match frame {
            InboundFrame::Message(message) => {
                let item = self.timeline.push_live(message).clone();
                FrameOutcome::Appended(item)
            }
            InboundFrame::UserListUpdate { users } => {
                self.presence = users.clone();
                FrameOutcome::PresenceReplaced(users)
            }
            InboundFrame::System { content } => {
                let item = self.timeline.push_system(content).clone();
                FrameOutcome::Appended(item)
            }
        }
    }

    /// Validate and encode an outbound message. Rejected unless the
    /// connection is Open and the content is non-empty; a rejection is
    /// surfaced and nothing is transmitted.
    pub fn prepare_send(&mut self, content: &str, kind: MessageKind) -> Result<String, ChatError> {
        if self.state != ConnectionState::Open {
            return Err(self.surface(ChatError::SendRejected(
                "connection is not open".to_owned(),
            )));
        }
        if content.trim().is_empty() {
            return Err(self.surface(ChatError::SendRejected("empty message".to_owned())));
        }
        let frame = OutboundFrame::Message {
            content: content.to_owned(),
            message_type: kind,
        };
        match encode_frame(&frame) {
            Ok(text) => {
                self.clear_error_of_kind(ErrorKind::Send);
                Ok(text)
            }
            Err(err) => Err(self.surface(ChatError::SendRejected(err.to_string()))),
        }
    }

    /// Start a history fetch if the connection is open and the pager
    /// allows one (nothing in flight, not exhausted).
    pub fn begin_history_fetch(&mut self) -> Option<HistoryRequest> {
        if self.state != ConnectionState::Open {
            return None;
        }
        let page = self.pager.begin_fetch()?;
        Some(HistoryRequest {
            generation: self.generation,
            page,
        })
    }

    /// Scroll report from the rendering layer; may trigger the next older
    /// page per the edge-triggered policy.
    pub fn note_scroll(&mut self, distance_from_top: f32) -> Option<HistoryRequest> {
        if !should_fetch_older(distance_from_top, &self.pager) {
            return None;
        }
        self.begin_history_fetch()
    }

    /// Apply a completed history page. Pages from a stale generation are
    /// discarded untouched; the pager that requested them was already
    /// reset when the newer connection opened.
    pub fn apply_history_page(
        &mut self,
        generation: u64,
        page: Vec<ChatMessage>,
    ) -> Option<PageApplied> {
        if generation != self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                "discarding history page from stale generation"
            );
            return None;
        }
        let initial = !self.pager.initial_loaded();
        let oldest = page
            .first()
            .and_then(|message| message.timestamp.clone());
        self.pager.complete(oldest, page.len());
        let prepended = self.timeline.prepend_page(page);
        self.clear_error_of_kind(ErrorKind::History);
        Some(PageApplied { prepended, initial })
    }

    /// A history fetch failed: cursor and exhaustion stay unchanged and a
    /// retry is permitted. Returns the surfaced error, or `None` when the
    /// failure belonged to a stale generation and was dropped silently.
    pub fn history_fetch_failed(&mut self, generation: u64, err: ChatError) -> Option<ChatError> {
        if generation != self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                "discarding history failure from stale generation"
            );
            return None;
        }
        self.pager.fail();
        Some(self.surface(err))
    }

    /// Admit one upload attempt. Rejected locally, with no network call,
    /// when the connection is not open or identity is unset.
    pub fn begin_upload(&mut self) -> Result<UploadTicket, ChatError> {
        if self.state != ConnectionState::Open {
            return Err(self.surface(ChatError::UploadFailed(
                "connection is not open".to_owned(),
            )));
        }
        let Some(identity) = self.identity.as_ref() else {
            return Err(self.surface(ChatError::UploadFailed("identity unset".to_owned())));
        };
        Ok(UploadTicket {
            generation: self.generation,
            user_id: identity.user_id.clone(),
        })
    }

    /// The upload returned a URL: transmit exactly one IMAGE message,
    /// unless the result belongs to an earlier connection.
    pub fn upload_succeeded(&mut self, generation: u64, url: &str) -> Option<String> {
        if generation != self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                "discarding upload result from stale generation"
            );
            return None;
        }
        self.clear_error_of_kind(ErrorKind::Upload);
        self.prepare_send(url, MessageKind::Image).ok()
    }

    pub fn upload_failed(&mut self, generation: u64, err: ChatError) -> Option<ChatError> {
        if generation != self.generation {
            return None;
        }
        Some(self.surface(err))
    }
}

#[cfg(test)]
mod tests {
    use anonchat_core::HISTORY_PAGE_SIZE;

    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: "ab12cd34".to_owned(),
            user_name: "快乐的猫咪".to_owned(),
        }
    }

    fn open_session() -> Session {
        let mut session = Session::new(Some(identity()));
        assert!(session.begin_connect());
        session.on_open();
        session
    }

    fn page(start: usize, count: usize) -> Vec<ChatMessage> {
        (start..start + count)
            .map(|i| ChatMessage {
                sender: Some(UserInfo {
                    id: "peer0001".to_owned(),
                    name: "神秘的狐狸".to_owned(),
                }),
                content: format!("msg-{i}"),
                kind: MessageKind::Text,
                timestamp: Some(format!("2025-03-01T09:{:02}:{:02}", i / 60, i % 60)),
            })
            .collect()
    }

    #[test]
    fn connect_is_a_no_op_without_identity_or_with_live_handle() {
        let mut session = Session::new(None);
        assert!(!session.begin_connect());
        assert_eq!(session.state(), ConnectionState::Idle);

        let mut session = Session::new(Some(identity()));
        assert!(session.begin_connect());
        assert!(!session.begin_connect(), "already connecting");
        session.on_open();
        assert!(!session.begin_connect(), "already open");
    }

    #[test]
    fn generation_increments_per_connection() {
        let mut session = Session::new(Some(identity()));
        assert!(session.begin_connect());
        assert_eq!(session.generation(), 1);
        session.on_open();
        session.on_disconnect(Some(1006));
        assert!(session.begin_connect());
        assert_eq!(session.generation(), 2);
    }

    #[test]
    fn open_resets_pagination_and_clears_session_state() {
        let mut session = open_session();
        let request = session.begin_history_fetch().expect("initial fetch");
        session.apply_history_page(request.generation, page(0, 3));
        session.on_frame(r#"{"type":"user_list_update","users":[{"id":"a","name":"A"}]}"#);
        session.on_disconnect(Some(1006));
        assert!(session.last_error().is_some());

        assert!(session.begin_connect());
        session.on_open();
        assert!(session.timeline().is_empty());
        assert!(session.presence().is_empty());
        assert!(session.last_error().is_none());
        assert_eq!(session.pager().cursor(), None);
        assert!(!session.pager().exhausted());
    }

    #[test]
    fn inbound_frames_preserve_arrival_order() {
        let mut session = open_session();
        session.on_frame(r#"{"type":"message","content":"one"}"#);
        session.on_frame(r#"{"type":"system","content":"joined"}"#);
        session.on_frame(r#"{"type":"message","content":"two"}"#);

        let contents: Vec<&str> = session
            .timeline()
            .items()
            .iter()
            .map(|item| item.message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["one", "joined", "two"]);
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped_not_fatal() {
        let mut session = open_session();
        assert_eq!(
            session.on_frame(r#"{"type":"typing_indicator"}"#),
            FrameOutcome::Ignored
        );
        assert_eq!(session.on_frame("{broken"), FrameOutcome::Ignored);
        assert_eq!(session.state(), ConnectionState::Open);
        assert!(session.timeline().is_empty());
    }

    #[test]
    fn presence_is_replaced_not_merged() {
        let mut session = open_session();
        session.on_frame(
            r#"{"type":"user_list_update","users":[{"id":"a","name":"A"},{"id":"b","name":"B"}]}"#,
        );
        session.on_frame(r#"{"type":"user_list_update","users":[{"id":"c","name":"C"}]}"#);
        assert_eq!(session.presence().len(), 1);
        assert_eq!(session.presence()[0].id, "c");
    }

    #[test]
    fn send_requires_open_connection_and_content() {
        let mut session = Session::new(Some(identity()));
        let err = session.prepare_send("hello", MessageKind::Text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Send);
        assert_eq!(session.last_error(), Some(&err));

        let mut session = open_session();
        assert!(session.prepare_send("   ", MessageKind::Text).is_err());
        let frame = session.prepare_send("hello", MessageKind::Text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["messageType"], "TEXT");
        assert!(
            session.last_error().is_none(),
            "successful send clears the rejection"
        );
    }

    #[test]
    fn pagination_scenario_from_initial_page_to_exhaustion() {
        let mut session = open_session();

        let request = session.begin_history_fetch().expect("initial fetch");
        assert!(request.page.initial);
        assert_eq!(request.page.before, None);

        // Full page of 30; the oldest timestamp becomes the cursor.
        let first_page = page(100, HISTORY_PAGE_SIZE);
        let t0 = first_page[0].timestamp.clone().unwrap();
        let applied = session
            .apply_history_page(request.generation, first_page)
            .expect("page applies");
        assert!(applied.initial);
        assert_eq!(applied.prepended, HISTORY_PAGE_SIZE);
        assert_eq!(session.pager().cursor(), Some(t0.as_str()));

        // Scrolling near the top triggers the older fetch with the cursor.
        let older = session.note_scroll(10.0).expect("scroll triggers fetch");
        assert!(!older.page.initial);
        assert_eq!(older.page.before.as_deref(), Some(t0.as_str()));

        // While it is outstanding, further scroll events do nothing.
        assert!(session.note_scroll(0.0).is_none());

        // Short page: cursor updates and exhaustion latches.
        let short_page = page(40, 5);
        let t1 = short_page[0].timestamp.clone().unwrap();
        let applied = session
            .apply_history_page(older.generation, short_page)
            .expect("short page applies");
        assert!(!applied.initial);
        assert_eq!(session.pager().cursor(), Some(t1.as_str()));
        assert!(session.pager().exhausted());

        // No further network calls for the rest of this session.
        assert!(session.note_scroll(0.0).is_none());
        assert!(session.begin_history_fetch().is_none());
    }

    #[test]
    fn history_pages_from_stale_generations_are_discarded() {
        let mut session = open_session();
        let request = session.begin_history_fetch().expect("fetch on gen 1");

        // The connection dies and a new one opens before the page lands.
        session.on_disconnect(None);
        assert!(session.begin_connect());
        session.on_open();

        assert!(
            session
                .apply_history_page(request.generation, page(0, 5))
                .is_none()
        );
        assert!(session.timeline().is_empty());
        assert_eq!(session.pager().cursor(), None);
        assert!(
            session
                .history_fetch_failed(
                    request.generation,
                    ChatError::HistoryFetchFailed("late failure".to_owned())
                )
                .is_none()
        );
        assert!(session.last_error().is_none());
    }

    #[test]
    fn live_messages_during_a_fetch_compose_with_the_prepend() {
        let mut session = open_session();
        let request = session.begin_history_fetch().expect("initial fetch");

        session.on_frame(r#"{"type":"message","content":"live","timestamp":"2025-03-01T10:00:00"}"#);
        session
            .apply_history_page(request.generation, page(0, 2))
            .expect("page applies");

        let contents: Vec<&str> = session
            .timeline()
            .items()
            .iter()
            .map(|item| item.message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["msg-0", "msg-1", "live"]);
    }

    #[test]
    fn live_messages_never_seed_the_cursor() {
        let mut session = open_session();
        session.on_frame(r#"{"type":"message","content":"live","timestamp":"2025-03-01T10:00:00"}"#);
        assert_eq!(session.pager().cursor(), None);
    }

    #[test]
    fn failed_history_fetch_is_surfaced_and_retryable() {
        let mut session = open_session();
        let request = session.begin_history_fetch().expect("initial fetch");
        let err = session
            .history_fetch_failed(
                request.generation,
                ChatError::HistoryFetchFailed("HTTP 500".to_owned()),
            )
            .expect("failure surfaces");
        assert_eq!(err.kind(), ErrorKind::History);
        assert_eq!(session.last_error(), Some(&err));

        let retry = session.begin_history_fetch().expect("retry allowed");
        session
            .apply_history_page(retry.generation, page(0, 4))
            .expect("retry applies");
        assert!(session.last_error().is_none(), "success clears the error");
    }

    #[test]
    fn close_codes_map_to_states_and_errors() {
        let mut session = open_session();
        session.on_disconnect(Some(1006));
        assert_eq!(session.state(), ConnectionState::Errored);
        assert!(matches!(
            session.last_error(),
            Some(ChatError::Connection(_))
        ));

        let mut session = open_session();
        session.on_disconnect(Some(1000));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.last_error().is_none());

        let mut session = open_session();
        session.on_disconnect(None);
        assert_eq!(session.state(), ConnectionState::Errored);
    }

    #[test]
    fn upload_is_rejected_unless_open_with_identity() {
        let mut session = Session::new(Some(identity()));
        let err = session.begin_upload().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upload);

        let mut session = Session::new(None);
        assert!(!session.begin_connect());
        assert!(session.begin_upload().is_err());

        let mut session = open_session();
        let ticket = session.begin_upload().expect("upload admitted");
        assert_eq!(ticket.user_id, "ab12cd34");
    }

    #[test]
    fn successful_upload_transmits_one_image_frame() {
        let mut session = open_session();
        let ticket = session.begin_upload().expect("upload admitted");
        let frame = session
            .upload_succeeded(ticket.generation, "/uploads/abc.png")
            .expect("image frame produced");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"], "/uploads/abc.png");
        assert_eq!(value["messageType"], "IMAGE");
    }

    #[test]
    fn stale_upload_results_do_not_send_or_surface() {
        let mut session = open_session();
        let ticket = session.begin_upload().expect("upload admitted");

        session.on_disconnect(None);
        assert!(session.begin_connect());
        session.on_open();

        assert!(
            session
                .upload_succeeded(ticket.generation, "/uploads/late.png")
                .is_none()
        );
        assert!(
            session
                .upload_failed(
                    ticket.generation,
                    ChatError::UploadFailed("late".to_owned())
                )
                .is_none()
        );
        assert!(session.last_error().is_none());
    }
}
