use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Connection settings for an [`SftpClient`](crate::SftpClient).
///
/// When neither `host_public_key` nor `host_public_keys` is set the client
/// accepts any server identity and logs a warning. That default is insecure;
/// production configs should always pin at least one host key.
#[derive(Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the remote server.
    pub hostname: String,
    pub username: String,
    pub password: String,

    /// Connect-phase timeout (TCP dial and handshake). Zero disables it.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_connections: usize,
    pub packet_size: usize,

    /// Deprecated: merged into `host_public_keys`.
    pub host_public_key: String,
    pub host_public_keys: Vec<String>,

    /// Base64-encoded (or raw) PEM/OpenSSH private key.
    pub client_private_key: String,
    /// Passphrase for `client_private_key`, not base64 encoded.
    pub client_private_key_password: String,

    pub skip_chmod_after_upload: bool,
    pub skip_directory_creation: bool,
    pub skip_sync_after_upload: bool,
}

impl ClientConfig {
    /// Host keys used for server identity validation: `host_public_keys`
    /// followed by the deprecated `host_public_key`, deduplicated in
    /// first-seen order.
    pub fn host_keys(&self) -> Vec<String> {
        let mut keys = self.host_public_keys.clone();
        if !self.host_public_key.is_empty() {
            keys.push(self.host_public_key.clone());
        }
        dedupe(keys)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("parsing sftp client config")
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading sftp client config {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(s: &str) -> &'static str {
            if s.is_empty() { "" } else { "<redacted>" }
        }
        f.debug_struct("ClientConfig")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("timeout", &self.timeout)
            .field("max_connections", &self.max_connections)
            .field("packet_size", &self.packet_size)
            .field("host_public_keys", &self.host_keys().len())
            .field("client_private_key", &redact(&self.client_private_key))
            .field("client_private_key_password", &redact(&self.client_private_key_password))
            .field("skip_chmod_after_upload", &self.skip_chmod_after_upload)
            .field("skip_directory_creation", &self.skip_directory_creation)
            .field("skip_sync_after_upload", &self.skip_sync_after_upload)
            .finish()
    }
}

fn dedupe<T: Eq + std::hash::Hash + Clone>(vals: Vec<T>) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    vals.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(single: &str, many: &[&str]) -> ClientConfig {
        ClientConfig {
            host_public_key: single.to_string(),
            host_public_keys: many.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn no_host_keys() {
        assert!(ClientConfig::default().host_keys().is_empty());
    }

    #[test]
    fn only_deprecated_key() {
        assert_eq!(cfg("public-key", &[]).host_keys(), vec!["public-key"]);
    }

    #[test]
    fn only_key_list() {
        assert_eq!(
            cfg("", &["public-key-1", "public-key-2"]).host_keys(),
            vec!["public-key-1", "public-key-2"]
        );
    }

    #[test]
    fn combined_and_unique() {
        assert_eq!(
            cfg("public-key", &["public-key", "public-key-1", "public-key-1"]).host_keys(),
            vec!["public-key", "public-key-1"]
        );
    }

    #[test]
    fn parses_json_with_humantime_timeout() {
        let c = ClientConfig::from_json_str(
            r#"{"hostname":"sftp:22","username":"demo","password":"password",
                "timeout":"5s","max_connections":1,"packet_size":32000,
                "skip_sync_after_upload":true}"#,
        )
        .unwrap();
        assert_eq!(c.hostname, "sftp:22");
        assert_eq!(c.timeout, Duration::from_secs(5));
        assert_eq!(c.packet_size, 32000);
        assert!(c.skip_sync_after_upload);
        assert!(!c.skip_chmod_after_upload);
    }

    #[test]
    fn debug_redacts_secrets() {
        let c = ClientConfig {
            password: "hunter2".to_string(),
            client_private_key: "KEY".to_string(),
            ..Default::default()
        };
        let s = format!("{:?}", c);
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("KEY\""));
        assert!(s.contains("<redacted>"));
    }
}
