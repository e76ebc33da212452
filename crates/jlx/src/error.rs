//! 💀 Error taxonomy: the two kinds of bad news the retry controller cares about.
//!
//! Everything in jlx speaks `anyhow`. That's fine for humans reading a cause chain at 3am,
//! but the retry controller needs to know one thing without reading poetry:
//! "should I try that again?" So we smuggle two small typed errors inside the anyhow chain
//! and sniff for them with `downcast_ref`. Everything else is fatal by default. 🦆
//!
//! 🧠 Knowledge graph:
//! - `TransientError` → the cluster said "not now" (429, 5xx). Retry with backoff + shrink.
//! - `Cancelled` → somebody pulled the cord. Stop. Do not retry. Do not pass go.
//! - `reqwest` connect/timeout errors → transient too, the network is allowed to have a bad day.
//! - decode failures, 4xx that aren't 429 → fatal. Protocol violations don't get better with time.

use std::fmt;

/// 📡 The cluster is alive but overwhelmed. Try again later. Maybe with a smaller ask.
#[derive(Debug, Clone)]
pub struct TransientError {
    /// HTTP status when there was one. `None` for "the socket just gave up".
    pub status: Option<u16>,
    pub message: String,
}

impl TransientError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "⏳ transient cluster failure (HTTP {}): {}", status, self.message),
            None => write!(f, "⏳ transient cluster failure: {}", self.message),
        }
    }
}

impl std::error::Error for TransientError {}

/// 🛑 The run's cancellation token fired. Not a failure of this role, just the end of the road.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "🛑 run cancelled before it could finish")
    }
}

impl std::error::Error for Cancelled {}

/// 🔁 Statuses the cluster uses to say "back off". 429 is the breaker/queue-full classic.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// 🕵️ Walks the cause chain looking for anything worth retrying.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<TransientError>().is_some() {
            return true;
        }
        match cause.downcast_ref::<reqwest::Error>() {
            Some(http_err) => http_err.is_timeout() || http_err.is_connect(),
            None => false,
        }
    })
}

/// 🛑 True when the chain bottoms out in a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}
