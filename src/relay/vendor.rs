//! # Vendor Connection
//!
//! Opens the authenticated WebSocket towards the vendor speech service and
//! pumps frames across it.
//!
//! The vendor authenticates the upgrade request itself through `X-Api-*`
//! headers, so the request is assembled by hand from
//! [`IntoClientRequest`] and then handed to `tokio-tungstenite`.
//!
//! After the upgrade the socket is split in two tasks:
//! - **writer**: encodes [`Frame`]s queued through [`VendorLink`]
//! - **reader**: decodes vendor messages into [`VendorEvent`]s
//!
//! The reader stops at the first event that ends the stream (malformed frame,
//! transport error, close), so at most one terminal event is ever emitted.

use crate::config::{RelayConfig, VendorConfig};
use crate::relay::frame::{Frame, FrameError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

pub const APP_ID_HEADER: &str = "x-api-app-id";
pub const ACCESS_KEY_HEADER: &str = "x-api-access-key";
pub const RESOURCE_ID_HEADER: &str = "x-api-resource-id";
pub const APP_KEY_HEADER: &str = "x-api-app-key";
pub const CONNECT_ID_HEADER: &str = "x-api-connect-id";
/// Response header carrying the vendor's request log id.
pub const LOG_ID_HEADER: &str = "x-tt-logid";

pub type VendorStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("vendor credentials are not configured")]
    MissingCredentials,

    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),

    #[error("vendor rejected the upgrade with HTTP {status}{}", describe_rejection(*status, body))]
    Rejected { status: u16, body: String },

    #[error("vendor answered for connect id {actual}, expected {expected}")]
    ConnectIdMismatch { expected: String, actual: String },

    #[error("vendor connection failed: {0}")]
    Transport(String),

    #[error("vendor did not complete the handshake within {0}s")]
    Timeout(u64),
}

impl HandshakeError {
    /// `true` when the vendor refused the credentials themselves.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, HandshakeError::Rejected { status: 401 | 403, .. })
    }
}

fn describe_rejection(status: u16, body: &str) -> String {
    let mut text = match status {
        401 | 403 => " (credentials rejected)".to_string(),
        _ => String::new(),
    };
    if !body.is_empty() {
        text.push_str(": ");
        text.push_str(body);
    }
    text
}

impl From<tungstenite::Error> for HandshakeError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
                    .unwrap_or_default();
                HandshakeError::Rejected {
                    status: response.status().as_u16(),
                    body,
                }
            }
            tungstenite::Error::Url(err) => HandshakeError::InvalidRequest(err.to_string()),
            other => HandshakeError::Transport(other.to_string()),
        }
    }
}

/// What the vendor told us during the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub connect_id: String,
    pub status: u16,
    pub log_id: Option<String>,
}

/// Build the upgrade request with the vendor's authentication headers.
///
/// The standard upgrade headers are set explicitly; tungstenite refuses a
/// hand-built request that lacks any of them.
pub fn build_handshake_request(config: &VendorConfig, connect_id: &str) -> Result<Request, HandshakeError> {
    let uri: Uri = config
        .url
        .parse()
        .map_err(|e| HandshakeError::InvalidRequest(format!("{}: {}", config.url, e)))?;
    let host = uri
        .authority()
        .map(|authority| authority.as_str().to_string())
        .ok_or_else(|| HandshakeError::InvalidRequest(format!("{} has no host", config.url)))?;

    let mut request = Request::builder()
        .uri(uri)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());

    let headers = [
        (APP_ID_HEADER, config.app_id.as_str()),
        (ACCESS_KEY_HEADER, config.access_key.as_str()),
        (RESOURCE_ID_HEADER, config.resource_id.as_str()),
        (APP_KEY_HEADER, config.app_key.as_str()),
        (CONNECT_ID_HEADER, connect_id),
    ];
    for (name, value) in headers {
        let value = HeaderValue::from_str(value)
            .map_err(|_| HandshakeError::InvalidRequest(format!("{} is not a valid header value", name)))?;
        request = request.header(name, value);
    }

    request
        .body(())
        .map_err(|e| HandshakeError::InvalidRequest(e.to_string()))
}

/// Dial the vendor and complete the authenticated upgrade.
pub async fn connect(
    config: &VendorConfig,
    connect_id: &str,
) -> Result<(VendorStream, HandshakeInfo), HandshakeError> {
    if !config.has_credentials() {
        return Err(HandshakeError::MissingCredentials);
    }

    let request = build_handshake_request(config, connect_id)?;
    let timeout = Duration::from_secs(config.connect_timeout_secs);

    debug!(url = %config.url, connect_id = %connect_id, "Connecting to vendor");

    let (stream, response) = match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(HandshakeError::Timeout(config.connect_timeout_secs)),
    };

    let info = verify_response(&response, connect_id)?;
    info!(
        connect_id = %info.connect_id,
        log_id = info.log_id.as_deref().unwrap_or("-"),
        "Vendor handshake completed"
    );
    Ok((stream, info))
}

/// Check the upgrade response. The vendor may echo the connect id; when it
/// does it must be ours.
pub fn verify_response(response: &Response, connect_id: &str) -> Result<HandshakeInfo, HandshakeError> {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    if let Some(echoed) = header(CONNECT_ID_HEADER) {
        if echoed != connect_id {
            return Err(HandshakeError::ConnectIdMismatch {
                expected: connect_id.to_string(),
                actual: echoed,
            });
        }
    }

    Ok(HandshakeInfo {
        connect_id: connect_id.to_string(),
        status: response.status().as_u16(),
        log_id: header(LOG_ID_HEADER),
    })
}

/// Body of the `StartSession` request.
///
/// `instructions` is the system prompt handed to the dialogue model; an empty
/// string leaves the model's default behaviour.
pub fn start_session_payload(relay: &RelayConfig, user_id: &str, instructions: &str) -> Value {
    json!({
        "user": {
            "uid": user_id,
        },
        "audio": {
            "format": relay.audio_format,
            "sample_rate": relay.sample_rate,
            "bits": relay.bits_per_sample,
            "channel": relay.channels,
        },
        "request": {
            "model_name": relay.model_name,
            "enable_vad": relay.enable_vad,
            "vad_stop_time": relay.vad_stop_time_ms,
            "text": instructions,
        },
    })
}

/// Events surfaced by the reader task.
#[derive(Debug)]
pub enum VendorEvent {
    Frame(Frame),
    Malformed(FrameError),
    TransportError(String),
    Closed(Option<String>),
}

enum VendorCommand {
    Send(Frame),
    Close,
}

/// Handle on a running vendor connection.
pub struct VendorLink {
    commands: mpsc::UnboundedSender<VendorCommand>,
    reader: JoinHandle<()>,
}

impl VendorLink {
    /// Queue a frame for the vendor. Returns `false` once the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.commands.send(VendorCommand::Send(frame)).is_ok()
    }

    /// Send a close frame after anything already queued and stop reading.
    pub fn shutdown(&self) {
        let _ = self.commands.send(VendorCommand::Close);
        self.reader.abort();
    }
}

impl Drop for VendorLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Split the socket and start the writer and reader tasks.
pub fn spawn_pumps<S>(stream: WebSocketStream<S>) -> (VendorLink, mpsc::UnboundedReceiver<VendorEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_pump(sink, command_rx, event_tx.clone()));
    let reader = tokio::spawn(read_pump(source, event_tx));

    (
        VendorLink {
            commands: command_tx,
            reader,
        },
        event_rx,
    )
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut commands: mpsc::UnboundedReceiver<VendorCommand>,
    events: mpsc::UnboundedSender<VendorEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            VendorCommand::Send(frame) => {
                trace!(frame = %frame, "Sending frame to vendor");
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = events.send(VendorEvent::TransportError(format!(
                            "failed to encode frame: {}",
                            err
                        )));
                        break;
                    }
                };
                if let Err(err) = sink.send(Message::Binary(bytes)).await {
                    let _ = events.send(VendorEvent::TransportError(err.to_string()));
                    break;
                }
            }
            VendorCommand::Close => {
                debug!("Closing vendor connection");
                if let Err(err) = sink.send(Message::Close(None)).await {
                    debug!("Vendor close frame not delivered: {}", err);
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
}

async fn read_pump<S>(mut source: SplitStream<WebSocketStream<S>>, events: mpsc::UnboundedSender<VendorEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let terminal = loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                Ok(frame) => {
                    trace!(frame = %frame, "Received frame from vendor");
                    if events.send(VendorEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Err(err) => break VendorEvent::Malformed(err),
            },
            Some(Ok(Message::Text(_))) => break VendorEvent::Malformed(FrameError::NotBinary("text")),
            Some(Ok(Message::Close(frame))) => {
                break VendorEvent::Closed(frame.map(|frame| frame.reason.to_string()))
            }
            // ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!("Vendor socket error: {}", err);
                break VendorEvent::TransportError(err.to_string());
            }
            None => break VendorEvent::Closed(None),
        }
    };

    let _ = events.send(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::frame::{Event, MessageType, Serialization};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };
    use tokio_tungstenite::tungstenite::http::{self, HeaderMap};

    fn vendor_config(addr: SocketAddr) -> VendorConfig {
        VendorConfig {
            url: format!("ws://{}/api/v3/realtime/dialogue", addr),
            app_id: "app-123".to_string(),
            access_key: "secret-token".to_string(),
            connect_timeout_secs: 2,
            ..VendorConfig::default()
        }
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_handshake_request_carries_auth_headers() {
        let config = VendorConfig {
            app_id: "app-123".to_string(),
            access_key: "secret-token".to_string(),
            ..VendorConfig::default()
        };
        let request = build_handshake_request(&config, "conn-1").unwrap();
        let headers = request.headers();

        assert_eq!(request.uri().host(), Some("openspeech.bytedance.com"));
        assert_eq!(headers[APP_ID_HEADER], "app-123");
        assert_eq!(headers[ACCESS_KEY_HEADER], "secret-token");
        assert_eq!(headers[RESOURCE_ID_HEADER], config.resource_id.as_str());
        assert_eq!(headers[APP_KEY_HEADER], config.app_key.as_str());
        assert_eq!(headers[CONNECT_ID_HEADER], "conn-1");
        assert!(headers.contains_key("sec-websocket-key"));
        assert_eq!(headers["host"], "openspeech.bytedance.com");
        assert_eq!(headers["upgrade"], "websocket");
    }

    #[test]
    fn test_handshake_request_rejects_bad_values() {
        let config = VendorConfig {
            app_id: "app\n123".to_string(),
            access_key: "secret".to_string(),
            ..VendorConfig::default()
        };
        assert!(matches!(
            build_handshake_request(&config, "conn-1"),
            Err(HandshakeError::InvalidRequest(_))
        ));

        let config = VendorConfig {
            url: "not a url".to_string(),
            ..config
        };
        assert!(matches!(
            build_handshake_request(&config, "conn-1"),
            Err(HandshakeError::InvalidRequest(_))
        ));

        let config = VendorConfig {
            url: "/api/v3/realtime/dialogue".to_string(),
            ..config
        };
        assert!(matches!(
            build_handshake_request(&config, "conn-1"),
            Err(HandshakeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_start_session_payload() {
        let payload = start_session_payload(&RelayConfig::default(), "user-7", "You are a calm coach.");
        assert_eq!(payload["user"]["uid"], "user-7");
        assert_eq!(payload["audio"]["format"], "pcm");
        assert_eq!(payload["audio"]["sample_rate"], 16000);
        assert_eq!(payload["audio"]["bits"], 16);
        assert_eq!(payload["audio"]["channel"], 1);
        assert_eq!(payload["request"]["model_name"], "doubao-speech-vision-pro-250515");
        assert_eq!(payload["request"]["enable_vad"], true);
        assert_eq!(payload["request"]["vad_stop_time"], 800);
        assert_eq!(payload["request"]["text"], "You are a calm coach.");
        assert!(payload.get("dialog").is_none());

        let relay = RelayConfig {
            enable_vad: false,
            vad_stop_time_ms: 1500,
            ..RelayConfig::default()
        };
        let payload = start_session_payload(&relay, "anonymous", "");
        assert_eq!(payload["request"]["enable_vad"], false);
        assert_eq!(payload["request"]["vad_stop_time"], 1500);
        assert_eq!(payload["request"]["text"], "");
    }

    #[test]
    fn test_rejection_message() {
        let err = HandshakeError::Rejected {
            status: 401,
            body: "invalid token".to_string(),
        };
        assert!(err.is_auth_failure());
        assert_eq!(
            err.to_string(),
            "vendor rejected the upgrade with HTTP 401 (credentials rejected): invalid token"
        );

        let err = HandshakeError::Rejected {
            status: 502,
            body: String::new(),
        };
        assert!(!err.is_auth_failure());
        assert_eq!(err.to_string(), "vendor rejected the upgrade with HTTP 502");
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_dialling() {
        let config = VendorConfig::default();
        let err = connect(&config, "conn-1").await.unwrap_err();
        assert!(matches!(err, HandshakeError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_connect_sends_headers_and_records_log_id() {
        let (listener, addr) = listener().await;
        let (headers_tx, headers_rx) = oneshot::channel::<HeaderMap>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &ServerRequest, mut resp: ServerResponse| {
                let _ = headers_tx.send(req.headers().clone());
                let connect_id = req.headers()[CONNECT_ID_HEADER].clone();
                resp.headers_mut().insert(CONNECT_ID_HEADER, connect_id);
                resp.headers_mut()
                    .insert(LOG_ID_HEADER, HeaderValue::from_static("20261019-abc"));
                Ok::<_, ErrorResponse>(resp)
            };
            let _ws = accept_hdr_async(tcp, callback).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = vendor_config(addr);
        let (_stream, info) = connect(&config, "conn-42").await.unwrap();
        assert_eq!(info.connect_id, "conn-42");
        assert_eq!(info.status, 101);
        assert_eq!(info.log_id.as_deref(), Some("20261019-abc"));

        let headers = headers_rx.await.unwrap();
        assert_eq!(headers[APP_ID_HEADER], "app-123");
        assert_eq!(headers[ACCESS_KEY_HEADER], "secret-token");
        assert_eq!(headers[CONNECT_ID_HEADER], "conn-42");
    }

    #[tokio::test]
    async fn test_connect_reports_rejection_status() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |_req: &ServerRequest, _resp: ServerResponse| {
                let rejection: ErrorResponse = http::Response::builder()
                    .status(401)
                    .body(Some("invalid access key".to_string()))
                    .unwrap();
                Err::<ServerResponse, ErrorResponse>(rejection)
            };
            let _ = accept_hdr_async(tcp, callback).await;
        });

        let err = connect(&vendor_config(addr), "conn-1").await.unwrap_err();
        match err {
            HandshakeError::Rejected { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_id_mismatch_is_rejected() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |_req: &ServerRequest, mut resp: ServerResponse| {
                resp.headers_mut()
                    .insert(CONNECT_ID_HEADER, HeaderValue::from_static("someone-else"));
                Ok::<_, ErrorResponse>(resp)
            };
            let _ws = accept_hdr_async(tcp, callback).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = connect(&vendor_config(addr), "conn-1").await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::ConnectIdMismatch { ref actual, .. } if actual == "someone-else"
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_vendor() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = VendorConfig {
            connect_timeout_secs: 1,
            ..vendor_config(addr)
        };
        let err = connect(&config, "conn-1").await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let (listener, addr) = listener().await;
        drop(listener);

        let err = connect(&vendor_config(addr), "conn-1").await.unwrap_err();
        assert!(matches!(err, HandshakeError::Transport(_)));
    }

    #[tokio::test]
    async fn test_pumps_relay_frames_and_stop_on_text() {
        let (listener, addr) = listener().await;
        let (received_tx, received_rx) = oneshot::channel::<Frame>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            if let Some(Ok(Message::Binary(data))) = ws.next().await {
                let _ = received_tx.send(Frame::decode(&data).unwrap());
            }

            let started = Frame::new(MessageType::FullServer, Serialization::Json, b"{}".to_vec())
                .with_event(Event::SessionStarted);
            ws.send(Message::Binary(started.encode().unwrap())).await.unwrap();
            ws.send(Message::Text("not a frame".into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (stream, _) = connect(&vendor_config(addr), "conn-1").await.unwrap();
        let (link, mut events) = spawn_pumps(stream);

        let audio = Frame::audio_only(Event::AudioUpload, Some("relay-1"), vec![7; 64]).with_sequence(1);
        assert!(link.send(audio.clone()));
        assert_eq!(received_rx.await.unwrap(), audio);

        match events.recv().await {
            Some(VendorEvent::Frame(frame)) => assert!(frame.is_event(Event::SessionStarted)),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(VendorEvent::Malformed(FrameError::NotBinary("text"))) => {}
            other => panic!("unexpected event {:?}", other),
        }

        link.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_sends_close_after_queued_frames() {
        let (listener, addr) = listener().await;
        let (done_tx, done_rx) = oneshot::channel::<(usize, bool)>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut frames = 0;
            let mut closed = false;
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(_) => frames += 1,
                    Message::Close(_) => {
                        closed = true;
                        break;
                    }
                    _ => {}
                }
            }
            let _ = done_tx.send((frames, closed));
        });

        let (stream, _) = connect(&vendor_config(addr), "conn-1").await.unwrap();
        let (link, _events) = spawn_pumps(stream);
        for seq in 0..3 {
            link.send(Frame::audio_only(Event::AudioUpload, None, vec![0; 16]).with_sequence(seq));
        }
        link.shutdown();

        assert_eq!(done_rx.await.unwrap(), (3, true));
    }

    #[tokio::test]
    async fn test_vendor_close_is_reported() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (stream, _) = connect(&vendor_config(addr), "conn-1").await.unwrap();
        let (_link, mut events) = spawn_pumps(stream);

        match events.recv().await {
            Some(VendorEvent::Closed(_)) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
}
