use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

const UNKNOWN: u8 = 0;
const DOWN: u8 = 1;
const UP: u8 = 2;

/// Reachability gauge and retry counter for one remote host.
///
/// Observability only; nothing in the client reads these values back.
#[derive(Debug)]
pub struct ConnectionHealth {
    host: String,
    state: AtomicU8,
    connection_retries: AtomicU64,
}

impl ConnectionHealth {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: AtomicU8::new(UNKNOWN),
            connection_retries: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Record the outcome of a connection attempt or health probe.
    pub fn record<T, E>(&self, res: &Result<T, E>) {
        let next = if res.is_ok() { UP } else { DOWN };
        let prev = self.state.swap(next, Ordering::SeqCst);
        if prev != next {
            tracing::debug!("[sftp] host={} up={}", self.host, next == UP);
        }
    }

    /// `None` until the first attempt has been recorded.
    pub fn is_up(&self) -> Option<bool> {
        match self.state.load(Ordering::SeqCst) {
            UP => Some(true),
            DOWN => Some(false),
            _ => None,
        }
    }

    pub fn add_retry(&self) {
        self.connection_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_retries(&self) -> u64 {
        self.connection_retries.load(Ordering::SeqCst)
    }
}
