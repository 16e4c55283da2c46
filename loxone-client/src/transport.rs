//! WebSocket transport seam and its tokio-tungstenite implementation.
//!
//! The session controller owns one transport per connection and recreates
//! it on reconnect. The transport's inbound pump pairs every 8-byte
//! header frame with the payload frame that follows it and hands both to
//! the controller; header-only kinds (keep-alive, out-of-service) are
//! consumed in place. Closing is best effort: a `Close` frame is sent and
//! failures beyond that are not retried.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::Error;
use crate::codec::{self, MessageHeader};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Callbacks from the transport into the session controller.
///
/// All of these run on the transport's inbound pump; implementations must
/// never block it on user input and never let an error escape back into
/// it.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// The socket finished connecting.
    async fn connection_opened(&self);

    /// A text payload (JSON control message) arrived.
    async fn process_message(&self, text: &str);

    /// A binary payload arrived, paired with the header announcing it.
    async fn process_events(&self, header: &MessageHeader, payload: &[u8]);

    /// The socket closed; `remote` distinguishes who initiated it.
    async fn connection_closed(&self, code: u16, remote: bool);

    /// Terminal cleanup after the socket closed.
    async fn ws_closed(&self);
}

/// One WebSocket connection to the miniserver.
#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    /// Establishes the connection and starts the inbound pump.
    async fn connect(&self) -> Result<(), Error>;

    /// `true` while the socket is usable for sending.
    fn is_open(&self) -> bool;

    /// Writes one text command to the wire. Thread-safe.
    async fn send(&self, text: &str) -> Result<(), Error>;

    /// Closes the socket, waiting for the close frame to be written.
    async fn close(&self) -> Result<(), Error>;
}

/// Creates transports bound to the controller's callbacks.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport for `uri` reporting into `events`.
    fn create(&self, events: Weak<dyn TransportEvents>, uri: String) -> Arc<dyn WebSocketTransport>;
}

struct Shared {
    uri: String,
    events: Weak<dyn TransportEvents>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    open: AtomicBool,
    local_close: AtomicBool,
}

/// Production transport over tokio-tungstenite.
pub struct TungsteniteTransport {
    shared: Arc<Shared>,
}

impl TungsteniteTransport {
    fn new(events: Weak<dyn TransportEvents>, uri: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                uri,
                events,
                sink: tokio::sync::Mutex::new(None),
                open: AtomicBool::new(false),
                local_close: AtomicBool::new(false),
            }),
        }
    }

    async fn pump(shared: Arc<Shared>, mut stream: WsStream) {
        let mut pending: Option<MessageHeader> = None;
        // abnormal closure until a Close frame says otherwise
        let mut close_code: u16 = 1006;
        while let Some(frame) = stream.next().await {
            let Some(events) = shared.events.upgrade() else {
                return;
            };
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    pending = None;
                    events.process_message(text.as_str()).await;
                }
                Ok(tungstenite::Message::Binary(bytes)) => match pending.take() {
                    Some(header) => events.process_events(&header, &bytes).await,
                    None => match codec::parse_header(&bytes) {
                        Ok(header) if header.kind.has_payload() => pending = Some(header),
                        Ok(header) => {
                            tracing::trace!(kind = ?header.kind, "header-only frame");
                        }
                        Err(err) => {
                            tracing::warn!("dropping malformed header frame: {err}");
                        }
                    },
                },
                Ok(tungstenite::Message::Close(frame)) => {
                    tracing::trace!("received close frame: {frame:?}");
                    close_code = frame.map_or(1000, |frame| u16::from(frame.code));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!("websocket stream error: {err}");
                    break;
                }
            }
        }
        shared.open.store(false, Ordering::SeqCst);
        *shared.sink.lock().await = None;
        let remote = !shared.local_close.load(Ordering::SeqCst);
        if let Some(events) = shared.events.upgrade() {
            events.connection_closed(close_code, remote).await;
            events.ws_closed().await;
        }
    }
}

#[async_trait]
impl WebSocketTransport for TungsteniteTransport {
    async fn connect(&self) -> Result<(), Error> {
        tracing::debug!("connecting to {}", self.shared.uri);
        let (ws, _) = tokio_tungstenite::connect_async(self.shared.uri.as_str()).await?;
        let (sink, stream) = ws.split();
        *self.shared.sink.lock().await = Some(sink);
        self.shared.open.store(true, Ordering::SeqCst);
        tokio::spawn(Self::pump(Arc::clone(&self.shared), stream));
        if let Some(events) = self.shared.events.upgrade() {
            events.connection_opened().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<(), Error> {
        let mut guard = self.shared.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::ConnectionFailure);
        };
        tracing::trace!("> {text}");
        if let Err(err) = sink.send(tungstenite::Message::text(text)).await {
            self.shared.open.store(false, Ordering::SeqCst);
            return Err(Error::Ws(err));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.shared.local_close.store(true, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        let sink = self.shared.sink.lock().await.take();
        if let Some(mut sink) = sink {
            sink.send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "closing".into(),
            })))
            .await?;
            let _ = sink.flush().await;
        }
        Ok(())
    }
}

/// Default [`TransportFactory`] producing [`TungsteniteTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

impl TransportFactory for TungsteniteFactory {
    fn create(&self, events: Weak<dyn TransportEvents>, uri: String) -> Arc<dyn WebSocketTransport> {
        Arc::new(TungsteniteTransport::new(events, uri))
    }
}
