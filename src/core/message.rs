use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Header attached to every published envelope with its priority level.
pub const PRIORITY_HEADER: &str = "x-priority";

/// A single header value, modelled on the AMQP field-table types callers actually use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

impl From<Bytes> for HeaderValue {
    fn from(b: Bytes) -> Self {
        HeaderValue::Bytes(b)
    }
}

/// Header table (string → value). Ordered so envelopes compare and print stably.
pub type Headers = BTreeMap<String, HeaderValue>;

/// What actually goes over the wire: opaque body, headers and the persistence flag.
///
/// Built by the logical queue on publish and handed to the broker; nothing keeps it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Bytes,
    pub headers: Headers,
    pub persistent: bool,
}

impl Envelope {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
            persistent: true,
        }
    }
}

/// Per-publish options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub headers: Headers,
    /// `None` keeps the configured message persistence default.
    pub persistent: Option<bool>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }
}
