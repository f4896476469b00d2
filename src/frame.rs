use std::fmt;
use std::str::FromStr;

use crate::error::StompError;
use crate::heartbeat::Heartbeat;
use crate::subscription::AckMode;

/// Protocol version spoken by this client.
pub const STOMP_VERSION: &str = "1.2";

/// STOMP commands understood by the client, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Error,
    Receipt,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Error => "ERROR",
            Command::Receipt => "RECEIPT",
        }
    }

    /// CONNECT and CONNECTED are exchanged before a version is agreed, so
    /// their headers are never escaped.
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cmd = match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "ERROR" => Command::Error,
            "RECEIPT" => Command::Receipt,
            other => {
                return Err(StompError::malformed(format!(
                    "unknown command '{}'",
                    other
                )));
            }
        };
        Ok(cmd)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
///
/// `Frame` contains the command, an ordered list of headers (key/value pairs;
/// duplicates are kept but only the first is visible through `get_header`)
/// and the raw body bytes. An empty body means "no body".
///
/// Frames are value objects: the builder methods consume and return `self`,
/// and nothing in the crate mutates a frame once it has been handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command
    pub command: Command,
    /// Ordered headers as (key, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style).
    ///
    /// Parameters
    /// - `key`: header name (converted to `String`).
    /// - `value`: header value (converted to `String`).
    ///
    /// Returns the mutated `Frame` allowing builder-style chaining.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    ///
    /// Any existing `content-length` header is replaced by one matching the
    /// new body; an empty body removes it.
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        if !self.body.is_empty() {
            self.headers
                .push(("content-length".to_string(), self.body.len().to_string()));
        }
        self
    }

    /// Request a RECEIPT from the broker for this frame.
    pub fn receipt(self, receipt_id: impl Into<String>) -> Self {
        self.header("receipt", receipt_id)
    }

    /// Get the value of a header by name.
    ///
    /// Returns the first header value matching the given key (case-sensitive),
    /// or `None` if no such header exists.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values carried for `key`, in wire order.
    pub fn get_headers<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    /// CONNECT frame with the headers every session needs.
    ///
    /// Header order: `accept-version`, `host`, `heart-beat` (when given),
    /// `login`, `passcode` (when given).
    pub fn connect(
        host: &str,
        login: Option<&str>,
        passcode: Option<&str>,
        heartbeat: Option<Heartbeat>,
    ) -> Self {
        let mut f = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host);
        if let Some(hb) = heartbeat {
            f = f.header("heart-beat", hb.to_string());
        }
        if let Some(login) = login {
            f = f.header("login", login);
        }
        if let Some(passcode) = passcode {
            f = f.header("passcode", passcode);
        }
        f
    }

    /// CONNECTED frame, as a broker would send it.
    pub fn connected(version: &str, heartbeat: Option<Heartbeat>) -> Self {
        let mut f = Frame::new(Command::Connected).header("version", version);
        if let Some(hb) = heartbeat {
            f = f.header("heart-beat", hb.to_string());
        }
        f
    }

    /// SEND frame. `content-length` is derived from `body`.
    pub fn send(destination: &str, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        let mut f = Frame::new(Command::Send).header("destination", destination);
        if let Some(ct) = content_type {
            f = f.header("content-type", ct);
        }
        f.set_body(body)
    }

    /// MESSAGE frame, as a broker would deliver it to `subscription`.
    pub fn message(
        destination: &str,
        subscription: &str,
        message_id: &str,
        content_type: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let mut f = Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", subscription)
            .header("message-id", message_id);
        if let Some(ct) = content_type {
            f = f.header("content-type", ct);
        }
        f.set_body(body)
    }

    pub fn subscribe(destination: &str, id: &str, ack: AckMode) -> Self {
        Frame::new(Command::Subscribe)
            .header("destination", destination)
            .header("id", id)
            .header("ack", ack.as_str())
    }

    pub fn unsubscribe(destination: &str, id: &str) -> Self {
        Frame::new(Command::Unsubscribe)
            .header("destination", destination)
            .header("id", id)
    }

    /// ACK for the message whose `ack` header (1.2) or `message-id` was `id`.
    pub fn ack(id: &str) -> Self {
        Frame::new(Command::Ack).header("id", id)
    }

    pub fn nack(id: &str) -> Self {
        Frame::new(Command::Nack).header("id", id)
    }

    pub fn begin(transaction: &str) -> Self {
        Frame::new(Command::Begin).header("transaction", transaction)
    }

    pub fn commit(transaction: &str) -> Self {
        Frame::new(Command::Commit).header("transaction", transaction)
    }

    pub fn abort(transaction: &str) -> Self {
        Frame::new(Command::Abort).header("transaction", transaction)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// RECEIPT frame acknowledging `receipt_id`.
    pub fn receipt_frame(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header("receipt-id", receipt_id)
    }

    /// ERROR frame with a short `message` header and optional detail body.
    pub fn error(message: &str, body: Option<&str>) -> Self {
        let f = Frame::new(Command::Error).header("message", message);
        match body {
            Some(b) => f
                .header("content-type", "text/plain")
                .set_body(b.as_bytes().to_vec()),
            None => f,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_str() {
        for cmd in [
            Command::Connect,
            Command::Connected,
            Command::Send,
            Command::Subscribe,
            Command::Unsubscribe,
            Command::Message,
            Command::Ack,
            Command::Nack,
            Command::Begin,
            Command::Commit,
            Command::Abort,
            Command::Disconnect,
            Command::Error,
            Command::Receipt,
        ] {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
    }

    #[test]
    fn stomp_is_connect() {
        assert_eq!("STOMP".parse::<Command>().unwrap(), Command::Connect);
    }

    #[test]
    fn unknown_command_is_malformed() {
        let err = "PUBLISH".parse::<Command>().unwrap_err();
        assert!(matches!(err, StompError::MalformedFrame(_)));
    }

    #[test]
    fn set_body_replaces_content_length() {
        let f = Frame::new(Command::Send)
            .header("content-length", "99")
            .set_body(b"abc".to_vec());
        assert_eq!(f.get_header("content-length"), Some("3"));
        assert_eq!(f.get_headers("content-length").count(), 1);
    }

    #[test]
    fn set_empty_body_drops_content_length() {
        let f = Frame::send("/queue/a", None, b"x".to_vec()).set_body(Vec::new());
        assert!(f.get_header("content-length").is_none());
    }

    #[test]
    fn smoke_frame_display() {
        let f = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .set_body(b"hello".to_vec());
        let s = format!("{}", f);
        assert!(s.contains("CONNECT"));
        assert!(s.contains("Body (5 bytes)"));
    }
}
