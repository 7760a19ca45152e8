//! # Realtime Relay WebSocket
//!
//! Browser-facing endpoint of the relay. Each connection to `/ws/realtime`
//! becomes one [`RelayWebSocket`] actor that owns a [`RelaySession`] and a
//! vendor connection.
//!
//! ## Connection Flow:
//! 1. **Upgrade**: credentials, voice lock and capacity are checked before
//!    the socket is accepted
//! 2. **Handshake**: the actor dials the vendor in the background
//! 3. **Session start**: a `StartSession` frame is sent on the client's behalf
//! 4. **Relay**: binary frames flow both ways until either side ends
//! 5. **Teardown**: both sockets closed, slot and voice lock given back
//!
//! Browser messages must be binary frames in the vendor framing. Text
//! messages are refused with close code 1003.

use crate::config::{AppConfig, VendorConfig};
use crate::error::AppError;
use crate::relay::frame::Frame;
use crate::relay::session::{CloseDirective, CloseKind, RelayAction, RelaySession};
use crate::relay::vendor::{self, HandshakeError, HandshakeInfo, VendorEvent, VendorLink, VendorStream};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{http::header, web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Close reasons longer than this do not fit a control frame.
const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// System prompt for the dialogue model.
    #[serde(default)]
    pub instructions: String,
    /// Voice lock session this relay runs under; released on teardown.
    pub voice_session_id: Option<String>,
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

fn default_mode() -> String {
    "emotion".to_string()
}

pub struct RelayWebSocket {
    session: RelaySession,
    app_state: web::Data<AppState>,
    vendor_config: VendorConfig,
    start_payload: Value,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    vendor: Option<VendorLink>,
    voice_session_id: Option<String>,
    handshake_failed: bool,
}

impl RelayWebSocket {
    pub fn new(
        app_state: web::Data<AppState>,
        config: &AppConfig,
        query: RelayQuery,
    ) -> Self {
        Self {
            session: RelaySession::new(Uuid::new_v4().to_string()),
            app_state,
            vendor_config: config.vendor.clone(),
            start_payload: vendor::start_session_payload(&config.relay, &query.user_id, &query.instructions),
            heartbeat_interval: Duration::from_secs(config.relay.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.relay.client_timeout_secs),
            last_heartbeat: Instant::now(),
            vendor: None,
            voice_session_id: query.voice_session_id,
            handshake_failed: false,
        }
    }

    fn connect_vendor(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(err) = self.session.begin_handshake() {
            error!(relay_id = %self.session.session_id(), "Cannot start vendor handshake: {}", err);
            ctx.stop();
            return;
        }

        let vendor_config = self.vendor_config.clone();
        let connect_id = Uuid::new_v4().to_string();
        debug!(relay_id = %self.session.session_id(), connect_id = %connect_id, "Dialling vendor");

        let handshake = async move { vendor::connect(&vendor_config, &connect_id).await };
        ctx.spawn(
            handshake
                .into_actor(self)
                .map(|result, act, ctx| act.on_handshake(result, ctx)),
        );
    }

    fn on_handshake(
        &mut self,
        result: Result<(VendorStream, HandshakeInfo), HandshakeError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        match result {
            Ok((stream, info)) => match self.session.handshake_completed(&self.start_payload) {
                Ok(start) => {
                    info!(
                        relay_id = %self.session.session_id(),
                        connect_id = %info.connect_id,
                        status = info.status,
                        log_id = info.log_id.as_deref().unwrap_or("-"),
                        "Vendor connected, starting session"
                    );
                    let (link, events) = vendor::spawn_pumps(stream);
                    link.send(start);
                    ctx.add_stream(UnboundedReceiverStream::new(events));
                    self.vendor = Some(link);
                }
                Err(err) => {
                    // Client left while we were dialling; dropping the stream closes it.
                    debug!(relay_id = %self.session.session_id(), "Discarding vendor connection: {}", err);
                }
            },
            Err(err) => {
                self.handshake_failed = true;
                warn!(
                    relay_id = %self.session.session_id(),
                    auth_failure = err.is_auth_failure(),
                    "Vendor handshake failed: {}",
                    err
                );
                let actions = self.session.handshake_failed(&err.to_string());
                self.apply(actions, ctx);
            }
        }
    }

    /// Carry out what the session decided, in order.
    fn apply(&mut self, actions: Vec<RelayAction>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                RelayAction::SendToVendor(frame) => {
                    let delivered = self.vendor.as_ref().map(|link| link.send(frame)).unwrap_or(false);
                    if !delivered {
                        debug!(relay_id = %self.session.session_id(), "Vendor link gone, frame dropped");
                    }
                }
                RelayAction::SendToClient(frame) => self.send_to_client(frame, ctx),
                RelayAction::CloseVendor => {
                    if let Some(link) = self.vendor.take() {
                        link.shutdown();
                    }
                }
                RelayAction::CloseClient(directive) => {
                    info!(
                        relay_id = %self.session.session_id(),
                        reason = %directive.reason,
                        "Closing client connection"
                    );
                    ctx.close(Some(close_reason(&directive)));
                    ctx.stop();
                }
            }
        }
    }

    fn send_to_client(&self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame.encode() {
            Ok(bytes) => ctx.binary(bytes),
            Err(err) => warn!(relay_id = %self.session.session_id(), "Dropping frame for client: {}", err),
        }
    }

    /// Tear down the vendor side and close the client with `directive`.
    fn close_with(&mut self, directive: CloseDirective, ctx: &mut ws::WebsocketContext<Self>) {
        let mut actions = self.session.on_client_closed();
        actions.push(RelayAction::CloseClient(directive));
        self.apply(actions, ctx);
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(relay_id = %self.session.session_id(), "Relay connection started");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(relay_id = %act.session.session_id(), "Client heartbeat timeout, closing connection");
                act.close_with(CloseDirective::new(CloseKind::Normal, "heartbeat timeout"), ctx);
            } else {
                ctx.ping(b"");
            }
        });

        self.connect_vendor(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(link) = self.vendor.take() {
            link.shutdown();
        }
        self.session.finish();

        let stats = self.session.stats();
        self.app_state.close_relay_session(stats, self.handshake_failed);

        if let Some(voice_session_id) = self.voice_session_id.take() {
            self.app_state.voice_lock.release(&voice_session_id);
        }

        info!(
            relay_id = %self.session.session_id(),
            frames_to_vendor = stats.frames_to_vendor,
            frames_to_client = stats.frames_to_client,
            bytes_to_vendor = stats.bytes_to_vendor,
            bytes_to_client = stats.bytes_to_client,
            frames_discarded = stats.frames_discarded,
            "Relay connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                let actions = match Frame::decode(&data) {
                    Ok(frame) => self.session.on_client_frame(frame),
                    Err(err) => self.session.on_client_malformed(&err),
                };
                self.apply(actions, ctx);
            }
            Ok(ws::Message::Text(_)) => {
                warn!(relay_id = %self.session.session_id(), "Text message from client, closing");
                self.close_with(
                    CloseDirective::new(CloseKind::Unsupported, "only binary frames are accepted"),
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(relay_id = %self.session.session_id(), "Client closed connection: {:?}", reason);
                let actions = self.session.on_client_closed();
                self.apply(actions, ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.close_with(
                    CloseDirective::new(CloseKind::Unsupported, "fragmented messages are not supported"),
                    ctx,
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(relay_id = %self.session.session_id(), "Client protocol error: {}", err);
                let kind = match err {
                    ws::ProtocolError::Overflow => CloseKind::Protocol,
                    _ => CloseKind::Error,
                };
                self.close_with(CloseDirective::new(kind, err.to_string()), ctx);
            }
        }
    }
}

impl StreamHandler<VendorEvent> for RelayWebSocket {
    fn handle(&mut self, event: VendorEvent, ctx: &mut Self::Context) {
        let actions = match event {
            VendorEvent::Frame(frame) => self.session.on_vendor_frame(frame),
            VendorEvent::Malformed(err) => self.session.on_vendor_malformed(&err),
            VendorEvent::TransportError(message) => self.session.on_vendor_transport_error(&message),
            VendorEvent::Closed(reason) => self.session.on_vendor_closed(reason.as_deref()),
        };
        self.apply(actions, ctx);
    }

    /// The terminal vendor event already decided what happens to the client.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(relay_id = %self.session.session_id(), "Vendor event stream finished");
    }
}

fn close_reason(directive: &CloseDirective) -> ws::CloseReason {
    let code = match directive.kind {
        CloseKind::Normal => ws::CloseCode::Normal,
        CloseKind::Error => ws::CloseCode::Error,
        CloseKind::Protocol => ws::CloseCode::Protocol,
        CloseKind::Unsupported => ws::CloseCode::Unsupported,
    };
    ws::CloseReason {
        code,
        description: Some(truncate_reason(&directive.reason)),
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// WebSocket endpoint handler.
///
/// ## Pre-upgrade checks (answered with a plain HTTP error):
/// - the request asks for a WebSocket upgrade, else 426
/// - vendor credentials configured, else 500
/// - `voice_session_id`, when given, is the current lock holder, else 409
/// - a relay slot is free, else 503
pub async fn realtime_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<RelayQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();
    let query = query.into_inner();

    info!(
        user_id = %query.user_id,
        mode = %query.mode,
        has_instructions = !query.instructions.is_empty(),
        peer = ?req.connection_info().peer_addr(),
        "New relay connection request"
    );

    if !is_websocket_upgrade(&req) {
        debug!("Relay request refused: no WebSocket upgrade requested");
        return Err(AppError::UpgradeRequired("Expected WebSocket upgrade".to_string()).into());
    }

    if !config.vendor.has_credentials() {
        error!("Relay request refused: vendor credentials are not configured");
        return Err(AppError::ConfigError("Vendor credentials are not configured".to_string()).into());
    }

    if let Some(voice_session_id) = &query.voice_session_id {
        let holds_lock = app_state
            .voice_lock
            .holder()
            .map(|holder| &holder.session_id == voice_session_id)
            .unwrap_or(false);
        if !holds_lock {
            return Err(AppError::Conflict(format!(
                "Voice session {} is not the active lock holder",
                voice_session_id
            ))
            .into());
        }
    }

    if !app_state.try_open_relay_session(config.relay.max_concurrent_sessions) {
        warn!(
            max_sessions = config.relay.max_concurrent_sessions,
            "Relay request refused: at capacity"
        );
        return Err(AppError::ServiceUnavailable("Relay is at capacity".to_string()).into());
    }

    let relay = RelayWebSocket::new(app_state.clone(), &config, query);
    let started = ws::WsResponseBuilder::new(relay, &req, stream)
        .frame_size(config.relay.max_frame_bytes)
        .start();

    if started.is_err() {
        // The actor never ran, so its slot must be given back here.
        app_state.close_relay_session(Default::default(), false);
    }
    started
}
