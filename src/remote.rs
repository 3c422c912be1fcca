//! Capabilities the client needs from the protocol/transport layer.
//!
//! The production implementation lives in [`libssh2`]; tests plug in their
//! own `Connector` producing sessions over a local directory.

pub mod libssh2;

use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::RemoteError;
use crate::hostkeys::HostKeyPolicy;
use crate::metrics::ConnectionHealth;
use crate::ClientConfig;

/// Attributes of a remote file or directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: Option<u64>,
    pub perm: Option<u32>,
    /// Seconds since the unix epoch.
    pub mtime: Option<u64>,
    pub is_dir: bool,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.mtime?).ok()?;
        DateTime::from_timestamp(secs, 0)
    }
}

/// One entry returned by [`RemoteFs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// An open remote file.
pub trait RemoteStream: Read + Write + Send {
    fn stat(&mut self) -> Result<FileStat, RemoteError>;
    fn sync(&mut self) -> Result<(), RemoteError>;
    fn chmod(&mut self, mode: u32) -> Result<(), RemoteError>;
    fn close(&mut self) -> Result<(), RemoteError>;
}

/// The protocol-level session multiplexing file operations over a transport.
pub trait RemoteFs: Send {
    fn getwd(&self) -> Result<String, RemoteError>;
    fn stat(&self, path: &str) -> Result<FileStat, RemoteError>;
    /// Entries of `path` sorted by name, without `.` and `..`.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError>;
    fn open(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError>;
    /// Open for writing only, creating or truncating the file.
    fn open_write(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError>;
    fn remove(&self, path: &str) -> Result<(), RemoteError>;
    fn mkdir_all(&self, path: &str) -> Result<(), RemoteError>;
}

/// The authenticated channel a session runs over.
pub trait Transport: Send {
    fn close(&mut self) -> anyhow::Result<()>;
}

/// A transport and the session bound to it. They are only ever dropped or
/// closed together.
pub struct Connection {
    session: Box<dyn RemoteFs>,
    transport: Box<dyn Transport>,
}

impl Connection {
    pub fn new(session: Box<dyn RemoteFs>, transport: Box<dyn Transport>) -> Self {
        Self { session, transport }
    }

    pub fn session(&self) -> &dyn RemoteFs {
        self.session.as_ref()
    }

    /// Drop the session, then close the transport. Errors are discarded.
    pub fn release(self) {
        let Connection {
            session,
            mut transport,
        } = self;
        drop(session);
        if let Err(e) = transport.close() {
            tracing::debug!("[sftp] closing transport: {:#}", e);
        }
    }

    /// Like [`release`](Self::release) but on a detached thread, for channels
    /// that are already broken and may block on teardown. The outcome is
    /// never observed.
    pub fn release_in_background(self) {
        let spawned = std::thread::Builder::new()
            .name("sftp-release".to_string())
            .spawn(move || self.release());
        if let Err(e) = spawned {
            tracing::debug!("[sftp] unable to spawn release thread: {}", e);
        }
    }
}

/// Close a transport on a detached thread, discarding the outcome. Used on
/// connect failure paths once the transport exists but no session does.
pub fn close_in_background(mut transport: Box<dyn Transport>) {
    let spawned = std::thread::Builder::new()
        .name("sftp-release".to_string())
        .spawn(move || {
            if let Err(e) = transport.close() {
                tracing::debug!("[sftp] closing transport: {:#}", e);
            }
        });
    if let Err(e) = spawned {
        tracing::debug!("[sftp] unable to spawn release thread: {}", e);
    }
}

/// Everything a connector needs for one connection attempt.
pub struct ConnectContext<'a> {
    pub config: &'a ClientConfig,
    pub host_keys: &'a HostKeyPolicy,
    pub health: &'a Arc<ConnectionHealth>,
}

/// Establishes connections. Called with the client's instance lock held.
pub trait Connector: Send {
    fn connect(&self, ctx: &ConnectContext<'_>) -> anyhow::Result<Connection>;
}
