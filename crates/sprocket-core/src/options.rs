//! Option names and values shared by endpoints, streams, and pipes.

/// A typed option value.
///
/// Durations travel as signed milliseconds so that out-of-range input
/// (negative timeouts) can be observed and rejected rather than made
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    Size(usize),
    Ms(i64),
    Bool(bool),
    Str(String),
}

impl OptValue {
    pub fn as_size(&self) -> Option<usize> {
        match self {
            OptValue::Size(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ms(&self) -> Option<i64> {
        match self {
            OptValue::Ms(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Well-known option names.
pub mod names {
    /// Per-pipe receive ceiling in bytes; 0 means unbounded.
    pub const RECV_MAX_SIZE: &str = "recv-max-size";
    /// Read-only resolved URL, including the bound port after listen.
    pub const URL: &str = "url";
    /// Peer address of a pipe's stream.
    pub const REMOTE_ADDR: &str = "remote-addr";
    /// Local address of a pipe's stream.
    pub const LOCAL_ADDR: &str = "local-addr";
    /// TCP_NODELAY on new streams.
    pub const TCP_NODELAY: &str = "tcp-nodelay";
    /// SO_KEEPALIVE on new streams.
    pub const TCP_KEEPALIVE: &str = "tcp-keepalive";
    /// Default send deadline (ms) applied to pipe sends.
    pub const SEND_TIMEOUT: &str = "send-timeout";
    /// Default receive deadline (ms) applied to pipe receives.
    pub const RECV_TIMEOUT: &str = "recv-timeout";
    /// Minimum redial backoff (ms).
    pub const RECONNECT_MIN: &str = "reconnect-time-min";
    /// Maximum redial backoff (ms).
    pub const RECONNECT_MAX: &str = "reconnect-time-max";
}
