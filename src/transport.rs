//! Carriers for STOMP frames.
//!
//! A [`Transport`] moves whole STOMP messages: each inbound
//! [`TransportEvent::Message`] holds exactly one frame or one heart-beat EOL,
//! and each `send` writes exactly one. Stream carriers such as TCP split the
//! byte stream with [`RawFrameCodec`]; message carriers such as WebSocket get
//! the boundaries for free.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::{self, RawFrameCodec, StompItem};
use crate::error::{Result, StompError};
use crate::frame::Frame;

/// Notifications a transport delivers to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// One complete STOMP message.
    Message(Bytes),
    /// The peer or the carrier closed the connection.
    Closed {
        code: Option<u16>,
        reason: String,
        clean: bool,
    },
    /// The carrier failed; no further events follow.
    Failed(String),
}

/// The contract the session needs from a carrier.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self) -> Result<()>;

    async fn send(&mut self, message: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Next event, or `None` once the transport has nothing more to report.
    ///
    /// Must be cancel-safe: the session polls it inside `tokio::select!`
    /// and drops the future whenever another branch wins.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// STOMP over a plain TCP connection.
pub struct TcpTransport {
    addr: String,
    framed: Option<Framed<TcpStream, RawFrameCodec>>,
    announce_open: bool,
}

impl TcpTransport {
    /// Transport that connects to `addr` (host:port) on `open`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            framed: None,
            announce_open: false,
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self {
            addr,
            framed: Some(Framed::new(stream, RawFrameCodec::new())),
            announce_open: true,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %self.addr, "tcp transport connected");
        self.framed = Some(Framed::new(stream, RawFrameCodec::new()));
        self.announce_open = true;
        Ok(())
    }

    async fn send(&mut self, message: Bytes) -> Result<()> {
        match self.framed.as_mut() {
            Some(framed) => framed.send(message).await.map_err(StompError::from),
            None => Err(StompError::lost("tcp transport is not open")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            framed.close().await?;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.announce_open {
            self.announce_open = false;
            return Some(TransportEvent::Opened);
        }
        let framed = self.framed.as_mut()?;
        match framed.next().await {
            Some(Ok(message)) => Some(TransportEvent::Message(message)),
            Some(Err(e)) => {
                self.framed = None;
                Some(TransportEvent::Failed(e.to_string()))
            }
            None => {
                self.framed = None;
                Some(TransportEvent::Closed {
                    code: None,
                    reason: "connection closed by peer".to_string(),
                    clean: true,
                })
            }
        }
    }
}

/// In-process transport whose other end is a [`MemoryPeer`].
///
/// Useful for embedding a session behind a custom carrier and for driving a
/// session deterministically in tests.
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    open: bool,
    announce_open: bool,
}

/// The broker side of a [`MemoryTransport`].
pub struct MemoryPeer {
    sent: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                outbound: out_tx,
                inbound: ev_rx,
                open: false,
                announce_open: false,
            },
            MemoryPeer {
                sent: out_rx,
                events: ev_tx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        if self.outbound.is_closed() {
            return Err(StompError::lost("memory peer is gone"));
        }
        self.open = true;
        self.announce_open = true;
        Ok(())
    }

    async fn send(&mut self, message: Bytes) -> Result<()> {
        if !self.open {
            return Err(StompError::lost("memory transport is not open"));
        }
        self.outbound
            .send(message)
            .map_err(|_| StompError::lost("memory peer is gone"))
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.announce_open = false;
        self.inbound.close();
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.announce_open {
            self.announce_open = false;
            return Some(TransportEvent::Opened);
        }
        self.inbound.recv().await
    }
}

impl MemoryPeer {
    /// Next message the session wrote, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.sent.try_recv().ok()
    }

    /// Next message the session wrote, decoded.
    pub async fn recv_item(&mut self) -> Option<Result<StompItem>> {
        self.sent.recv().await.map(|b| codec::decode(&b))
    }

    /// Next frame the session wrote, skipping heart-beats.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.recv_item().await? {
                Ok(StompItem::Frame(f)) => return Some(f),
                Ok(StompItem::Heartbeat) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "memory peer read an undecodable message");
                    return None;
                }
            }
        }
    }

    /// Deliver raw bytes as one inbound message. Returns `false` if the
    /// transport is gone.
    pub fn send_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        self.events
            .send(TransportEvent::Message(bytes.into()))
            .is_ok()
    }

    /// Encode and deliver `frame`.
    pub fn send_frame(&self, frame: Frame) -> bool {
        match codec::encode(&StompItem::Frame(frame)) {
            Ok(bytes) => self.send_bytes(bytes),
            Err(_) => false,
        }
    }

    pub fn send_heartbeat(&self) -> bool {
        self.send_bytes(Bytes::from_static(b"\n"))
    }

    pub fn close(&self, code: Option<u16>, reason: &str, clean: bool) -> bool {
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
                clean,
            })
            .is_ok()
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.events
            .send(TransportEvent::Failed(reason.to_string()))
            .is_ok()
    }
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use super::*;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// STOMP over WebSocket. Each STOMP frame travels as one WebSocket
    /// message: text when it is valid UTF-8, binary otherwise.
    pub struct WebSocketTransport {
        url: String,
        ws: Option<Ws>,
        announce_open: bool,
    }

    impl WebSocketTransport {
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                ws: None,
                announce_open: false,
            }
        }
    }

    fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> StompError {
        StompError::lost(format!("websocket: {}", e))
    }

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn open(&mut self) -> Result<()> {
            if self.ws.is_some() {
                return Ok(());
            }
            let (ws, response) = connect_async(self.url.as_str()).await.map_err(ws_error)?;
            tracing::debug!(url = %self.url, status = %response.status(), "websocket transport connected");
            self.ws = Some(ws);
            self.announce_open = true;
            Ok(())
        }

        async fn send(&mut self, message: Bytes) -> Result<()> {
            let Some(ws) = self.ws.as_mut() else {
                return Err(StompError::lost("websocket transport is not open"));
            };
            let msg = match String::from_utf8(message.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Binary(e.into_bytes()),
            };
            ws.send(msg).await.map_err(ws_error)
        }

        async fn close(&mut self) -> Result<()> {
            if let Some(mut ws) = self.ws.take() {
                ws.close(None).await.map_err(ws_error)?;
            }
            Ok(())
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            if self.announce_open {
                self.announce_open = false;
                return Some(TransportEvent::Opened);
            }
            loop {
                let ws = self.ws.as_mut()?;
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some(TransportEvent::Message(Bytes::from(text)));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        return Some(TransportEvent::Message(Bytes::from(data)));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        self.ws = None;
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        return Some(TransportEvent::Closed {
                            code,
                            reason,
                            clean: true,
                        });
                    }
                    // ping/pong are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        self.ws = None;
                        return Some(TransportEvent::Failed(e.to_string()));
                    }
                    None => {
                        self.ws = None;
                        return Some(TransportEvent::Closed {
                            code: None,
                            reason: "websocket stream ended".to_string(),
                            clean: false,
                        });
                    }
                }
            }
        }
    }
}
