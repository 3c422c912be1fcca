//! Server identity validation.
//!
//! Trusted keys are configured as text: an authorized-keys line, a
//! known-hosts line (leading host patterns are skipped), or a bare base64
//! wire blob, optionally wrapped in one more layer of base64. Validation
//! compares the exact wire encoding presented during the handshake.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::ClientConfig;
use crate::error::ClientError;

const KEY_TYPE_PREFIXES: [&str; 4] = ["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"];

fn is_key_type(s: &str) -> bool {
    KEY_TYPE_PREFIXES.iter().any(|p| s.starts_with(p))
}

/// Algorithm name at the head of an SSH wire-format public key, if the blob
/// looks like one.
fn wire_algorithm(blob: &[u8]) -> Option<&str> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    let name = std::str::from_utf8(blob.get(4..4usize.checked_add(len)?)?).ok()?;
    is_key_type(name).then_some(name)
}

/// Parse configured key text into its SSH wire encoding.
pub fn parse_public_key(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty key".to_string());
    }
    if let Ok(decoded) = STANDARD.decode(trimmed)
        && !decoded.is_empty()
    {
        if wire_algorithm(&decoded).is_some() {
            return Ok(decoded);
        }
        return match String::from_utf8(decoded) {
            Ok(text) => parse_key_line(&text),
            Err(_) => Err("unrecognised key encoding".to_string()),
        };
    }
    parse_key_line(trimmed)
}

fn parse_key_line(line: &str) -> Result<Vec<u8>, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let idx = tokens
        .iter()
        .position(|t| is_key_type(t))
        .ok_or_else(|| "expected \"<type> <base64> [comment]\"".to_string())?;
    let data = tokens
        .get(idx + 1)
        .ok_or_else(|| "missing key data".to_string())?;
    let blob = STANDARD
        .decode(data)
        .map_err(|e| format!("invalid base64 key data: {}", e))?;
    match wire_algorithm(&blob) {
        Some(alg) if alg == tokens[idx] => Ok(blob),
        Some(alg) => Err(format!(
            "key type {} does not match key data ({})",
            tokens[idx], alg
        )),
        None => Err("malformed key data".to_string()),
    }
}

/// Ordered, deduplicated set of accepted server keys.
#[derive(Debug, Clone, Default)]
pub struct HostKeyMatcher {
    keys: Vec<Vec<u8>>,
}

impl HostKeyMatcher {
    pub fn new<S: AsRef<str>>(keys: &[S]) -> Result<Self, ClientError> {
        let mut matcher = HostKeyMatcher::default();
        for (index, key) in keys.iter().enumerate() {
            let blob = parse_public_key(key.as_ref())
                .map_err(|reason| ClientError::HostKeyParse { index, reason })?;
            if !matcher.keys.contains(&blob) {
                matcher.keys.push(blob);
            }
        }
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn check(&self, presented: &[u8]) -> Result<(), ClientError> {
        if self.keys.iter().any(|k| k.as_slice() == presented) {
            Ok(())
        } else {
            Err(ClientError::HostKeyMismatch)
        }
    }
}

/// One-shot warning that host key validation is disabled.
#[derive(Debug, Default)]
pub struct InsecureHostKeyNotice {
    fired: AtomicBool,
    emitted: AtomicUsize,
}

impl InsecureHostKeyNotice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance shared by clients built with `SftpClient::new`.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<InsecureHostKeyNotice>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(InsecureHostKeyNotice::new()))
            .clone()
    }

    pub fn emit(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "sftp: WARNING!!! Insecure default of skipping SFTP host key validation. Please set host_public_keys"
            );
            self.emitted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// How many times the warning has been logged (0 or 1).
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

/// How a presented server key is judged during the handshake.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    Trusted(HostKeyMatcher),
    /// No keys configured: accept anything, warn once through the notice.
    AcceptAny(Arc<InsecureHostKeyNotice>),
}

impl HostKeyPolicy {
    pub fn from_config(
        cfg: &ClientConfig,
        notice: &Arc<InsecureHostKeyNotice>,
    ) -> Result<Self, ClientError> {
        let keys = cfg.host_keys();
        if keys.is_empty() {
            return Ok(HostKeyPolicy::AcceptAny(notice.clone()));
        }
        Ok(HostKeyPolicy::Trusted(HostKeyMatcher::new(&keys)?))
    }

    pub fn verify(&self, presented: &[u8]) -> Result<(), ClientError> {
        match self {
            HostKeyPolicy::Trusted(matcher) => matcher.check(presented),
            HostKeyPolicy::AcceptAny(notice) => {
                notice.emit();
                Ok(())
            }
        }
    }
}
