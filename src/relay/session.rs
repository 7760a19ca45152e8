//! # Relay Session State Machine
//!
//! Tracks one browser ↔ vendor relay connection and decides what happens to
//! each inbound frame. It performs no I/O: every method returns the
//! [`RelayAction`]s the WebSocket actor has to carry out, in order.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: browser socket accepted, vendor not dialled yet
//! 2. **Handshaking**: authenticated upgrade towards the vendor in flight
//! 3. **AwaitingSessionStart**: `StartSession` sent, waiting for `SessionStarted`
//! 4. **Active**: frames relayed in both directions
//! 5. **Closing**: terminal, both sockets being torn down
//! 6. **Closed**: terminal, nothing left to do
//!
//! Any frame arriving in a terminal state is discarded.

use crate::relay::frame::{Event, Frame, FrameError, MessageType, Serialization};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Handshaking,
    AwaitingSessionStart,
    Active,
    Closing,
    Closed,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::Connecting => "connecting",
            RelayState::Handshaking => "handshaking",
            RelayState::AwaitingSessionStart => "awaiting_session_start",
            RelayState::Active => "active",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: RelayState },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Where a relay-detected failure came from. Sent to the client inside the
/// synthetic error frame so it can tell these apart from vendor errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transport,
    Protocol,
    Handshake,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Transport => "transport",
            FaultKind::Protocol => "protocol",
            FaultKind::Handshake => "handshake",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    Error,
    Protocol,
    Unsupported,
}

/// How the browser socket should be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDirective {
    pub kind: CloseKind,
    pub reason: String,
}

impl CloseDirective {
    pub fn new(kind: CloseKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    SendToVendor(Frame),
    SendToClient(Frame),
    CloseVendor,
    CloseClient(CloseDirective),
}

/// Per-session relay counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_to_vendor: u64,
    pub frames_to_client: u64,
    pub bytes_to_vendor: u64,
    pub bytes_to_client: u64,
    pub frames_discarded: u64,
}

pub struct RelaySession {
    session_id: String,
    state: RelayState,
    stats: RelayStats,
}

impl RelaySession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: RelayState::Connecting,
            stats: RelayStats::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RelayState::Closing | RelayState::Closed)
    }

    /// Connecting → Handshaking
    pub fn begin_handshake(&mut self) -> Result<(), RelayError> {
        self.expect(RelayState::Connecting, "begin handshake")?;
        self.state = RelayState::Handshaking;
        Ok(())
    }

    /// Handshaking → AwaitingSessionStart. Returns the `StartSession` frame
    /// that must be sent to the vendor.
    pub fn handshake_completed(&mut self, start_payload: &Value) -> Result<Frame, RelayError> {
        self.expect(RelayState::Handshaking, "complete handshake")?;
        let frame = Frame::full_client_json(Event::StartSession, Some(&self.session_id), start_payload)?;
        self.state = RelayState::AwaitingSessionStart;
        self.count_to_vendor(&frame);
        Ok(frame)
    }

    /// A failed handshake is fatal and never retried.
    pub fn handshake_failed(&mut self, reason: &str) -> Vec<RelayAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.state = RelayState::Closing;
        let notice = self.to_client(synthetic_error(FaultKind::Handshake, reason));
        vec![
            notice,
            RelayAction::CloseClient(CloseDirective::new(
                CloseKind::Error,
                format!("vendor handshake failed: {}", reason),
            )),
        ]
    }

    pub fn on_vendor_frame(&mut self, frame: Frame) -> Vec<RelayAction> {
        match self.state {
            RelayState::Closing | RelayState::Closed => return self.discard(&frame, "vendor", "session closing"),
            RelayState::Connecting | RelayState::Handshaking => {
                return self.discard(&frame, "vendor", "handshake not complete")
            }
            RelayState::AwaitingSessionStart | RelayState::Active => {}
        }

        if !frame.message_type.is_server() {
            return self.fail(
                FaultKind::Protocol,
                &format!("vendor sent unexpected {} frame", frame.message_type.as_str()),
            );
        }

        if frame.message_type == MessageType::Error {
            let reason = vendor_error_message(&frame);
            warn!(session_id = %self.session_id, state = %self.state, reason = %reason, "Vendor reported an error");
            self.state = RelayState::Closing;
            let forwarded = self.to_client(frame);
            return vec![
                forwarded,
                RelayAction::CloseVendor,
                RelayAction::CloseClient(CloseDirective::new(CloseKind::Error, reason)),
            ];
        }

        if frame.is_event(Event::EndSession) {
            return self.end_session(frame, "session ended by vendor", |session, frame| session.to_client(frame));
        }

        match self.state {
            RelayState::AwaitingSessionStart if frame.is_event(Event::SessionStarted) => {
                debug!(session_id = %self.session_id, "Vendor session started");
                self.state = RelayState::Active;
                vec![self.to_client(frame)]
            }
            RelayState::AwaitingSessionStart => self.discard(&frame, "vendor", "session not started"),
            _ => vec![self.to_client(frame)],
        }
    }

    pub fn on_client_frame(&mut self, frame: Frame) -> Vec<RelayAction> {
        if self.is_terminal() {
            return self.discard(&frame, "client", "session closing");
        }

        if !frame.message_type.is_client() {
            return self.fail(
                FaultKind::Protocol,
                &format!("client sent unexpected {} frame", frame.message_type.as_str()),
            );
        }

        if frame.is_event(Event::StartSession) {
            return self.fail(FaultKind::Protocol, "session start is issued by the relay");
        }

        if frame.is_event(Event::EndSession) {
            if self.state == RelayState::Active {
                return self.end_session(frame, "session ended by client", |session, frame| {
                    session.to_vendor(frame)
                });
            }
            self.state = RelayState::Closing;
            return vec![
                RelayAction::CloseVendor,
                RelayAction::CloseClient(CloseDirective::new(CloseKind::Normal, "session ended by client")),
            ];
        }

        if self.state != RelayState::Active {
            return self.discard(&frame, "client", "session not active");
        }
        vec![self.to_vendor(frame)]
    }

    pub fn on_client_malformed(&mut self, err: &FrameError) -> Vec<RelayAction> {
        self.fail(FaultKind::Protocol, &format!("malformed client frame: {}", err))
    }

    pub fn on_vendor_malformed(&mut self, err: &FrameError) -> Vec<RelayAction> {
        self.fail(FaultKind::Protocol, &format!("malformed vendor frame: {}", err))
    }

    pub fn on_vendor_transport_error(&mut self, message: &str) -> Vec<RelayAction> {
        self.fail(FaultKind::Transport, message)
    }

    /// Vendor socket closed without an `EndSession`.
    pub fn on_vendor_closed(&mut self, reason: Option<&str>) -> Vec<RelayAction> {
        let message = match reason {
            Some(reason) if !reason.is_empty() => format!("vendor connection closed: {}", reason),
            _ => "vendor connection closed".to_string(),
        };
        self.fail(FaultKind::Transport, &message)
    }

    /// Browser socket went away; the vendor side must follow.
    pub fn on_client_closed(&mut self) -> Vec<RelayAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.state = RelayState::Closing;
        vec![RelayAction::CloseVendor]
    }

    pub fn finish(&mut self) {
        self.state = RelayState::Closed;
    }

    fn end_session<F>(&mut self, frame: Frame, reason: &str, forward: F) -> Vec<RelayAction>
    where
        F: FnOnce(&mut Self, Frame) -> RelayAction,
    {
        debug!(session_id = %self.session_id, reason = %reason, "Relay session ending");
        self.state = RelayState::Closing;
        let forwarded = forward(self, frame);
        vec![
            forwarded,
            RelayAction::CloseVendor,
            RelayAction::CloseClient(CloseDirective::new(CloseKind::Normal, reason)),
        ]
    }

    fn fail(&mut self, kind: FaultKind, message: &str) -> Vec<RelayAction> {
        if self.is_terminal() {
            return Vec::new();
        }
        warn!(session_id = %self.session_id, state = %self.state, kind = kind.as_str(), "{}", message);
        self.state = RelayState::Closing;

        let close_kind = match kind {
            FaultKind::Protocol => CloseKind::Protocol,
            FaultKind::Transport | FaultKind::Handshake => CloseKind::Error,
        };
        let notice = self.to_client(synthetic_error(kind, message));
        vec![
            notice,
            RelayAction::CloseVendor,
            RelayAction::CloseClient(CloseDirective::new(close_kind, message)),
        ]
    }

    fn discard(&mut self, frame: &Frame, from: &str, why: &str) -> Vec<RelayAction> {
        debug!(session_id = %self.session_id, from = %from, frame = %frame, why = %why, "Discarding frame");
        self.stats.frames_discarded += 1;
        Vec::new()
    }

    fn to_client(&mut self, frame: Frame) -> RelayAction {
        self.stats.frames_to_client += 1;
        self.stats.bytes_to_client += frame.payload.len() as u64;
        RelayAction::SendToClient(frame)
    }

    fn to_vendor(&mut self, frame: Frame) -> RelayAction {
        self.count_to_vendor(&frame);
        RelayAction::SendToVendor(frame)
    }

    fn count_to_vendor(&mut self, frame: &Frame) {
        self.stats.frames_to_vendor += 1;
        self.stats.bytes_to_vendor += frame.payload.len() as u64;
    }

    fn expect(&self, expected: RelayState, action: &'static str) -> Result<(), RelayError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RelayError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }
}

/// Error frame the relay generates itself.
pub fn synthetic_error(kind: FaultKind, message: &str) -> Frame {
    let body = json!({
        "error": {
            "kind": kind.as_str(),
            "message": message,
        }
    });
    Frame::new(MessageType::Error, Serialization::Json, body.to_string().into_bytes())
}

fn vendor_error_message(frame: &Frame) -> String {
    frame
        .payload_json::<Value>()
        .ok()
        .and_then(|body| {
            ["message", "error"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| "vendor reported an error".to_string())
}
