use crate::frame::{Frame, STOMP_VERSION};
use crate::heartbeat::Heartbeat;

/// Options for the CONNECT frame.
///
/// Use the builder methods to customise what the session sends:
///
/// ```ignore
/// let opts = ConnectOptions::new()
///     .host("broker")
///     .login("u")
///     .passcode("p")
///     .heartbeat(Heartbeat::new(10_000, 10_000));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// `accept-version` header; `1.2` when unset.
    pub accept_version: Option<String>,
    /// Virtual host; `/` when unset.
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Local heart-beat capability. `None` omits the header, which the broker
    /// reads as `0,0`.
    pub heartbeat: Option<Heartbeat>,
    /// `client-id` header, used by some brokers for durable subscriptions.
    pub client_id: Option<String>,
    /// Extra headers appended after the standard ones.
    pub headers: Vec<(String, String)>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_version(mut self, version: impl Into<String>) -> Self {
        self.accept_version = Some(version.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = Some(passcode.into());
        self
    }

    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// The local heart-beat advertised by this CONNECT.
    pub fn local_heartbeat(&self) -> Heartbeat {
        self.heartbeat.unwrap_or_else(Heartbeat::disabled)
    }

    /// Build the CONNECT frame these options describe.
    pub fn to_frame(&self) -> Frame {
        let mut f = Frame::connect(
            self.host.as_deref().unwrap_or("/"),
            self.login.as_deref(),
            self.passcode.as_deref(),
            self.heartbeat,
        );
        let accept = self.accept_version.as_deref().unwrap_or(STOMP_VERSION);
        for h in f.headers.iter_mut().filter(|(k, _)| k == "accept-version") {
            h.1 = accept.to_string();
        }
        if let Some(id) = &self.client_id {
            f = f.header("client-id", id);
        }
        for (k, v) in &self.headers {
            f = f.header(k, v);
        }
        f
    }
}

/// Heart-beat timing knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatPolicy {
    /// Fraction of the outgoing interval that must pass without any outbound
    /// frame before a heart-beat is emitted at a tick. Clamped to `(0, 1]`.
    pub send_threshold: f64,
    /// Number of incoming intervals the peer may stay silent before the
    /// connection is declared dead.
    pub liveness_grace: u32,
}

impl HeartbeatPolicy {
    pub fn new(send_threshold: f64, liveness_grace: u32) -> Self {
        let send_threshold = if send_threshold.is_finite() && send_threshold > 0.0 {
            send_threshold.min(1.0)
        } else {
            1.0
        };
        Self {
            send_threshold,
            liveness_grace: liveness_grace.max(1),
        }
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::new(0.9, 2)
    }
}

/// Session-wide settings that are not part of the CONNECT frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub heartbeat_policy: HeartbeatPolicy,
    /// Capacity of the queue between callers and the transport writer.
    pub outbound_capacity: usize,
    /// Capacity of the session event broadcast; slow listeners lag.
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn heartbeat_policy(mut self, policy: HeartbeatPolicy) -> Self {
        self.heartbeat_policy = policy;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_policy: HeartbeatPolicy::default(),
            outbound_capacity: 64,
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_clamps_out_of_range_values() {
        let p = HeartbeatPolicy::new(3.0, 0);
        assert_eq!(p.send_threshold, 1.0);
        assert_eq!(p.liveness_grace, 1);
        assert_eq!(HeartbeatPolicy::new(f64::NAN, 2).send_threshold, 1.0);
    }

    #[test]
    fn custom_accept_version_replaces_default() {
        let f = ConnectOptions::new().accept_version("1.1,1.2").to_frame();
        assert_eq!(f.get_header("accept-version"), Some("1.1,1.2"));
        assert_eq!(f.get_headers("accept-version").count(), 1);
    }
}
