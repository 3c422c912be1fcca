mod listing;
mod upload;

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

use crate::ClientConfig;
use crate::connection::{ConnectionManager, Recovery};
use crate::file::RemoteFile;
use crate::hostkeys::InsecureHostKeyNotice;
use crate::metrics::ConnectionHealth;
use crate::remote::libssh2::Ssh2Connector;
use crate::remote::{Connector, FileStat, RemoteStream};
use crate::walk::{WalkControl, WalkEntry};

/// Chunk size for copies when `packet_size` is unset.
pub const DEFAULT_PACKET_SIZE: usize = 32 * 1024;

/// Callback invoked for every entry visited by [`Client::walk`].
pub type WalkFn<'a> = dyn FnMut(&WalkEntry<'_>) -> Result<WalkControl> + 'a;

/// File operations offered by both the remote-backed [`SftpClient`] and the
/// local-directory [`MockClient`](crate::MockClient).
pub trait Client: Send + Sync {
    fn ping(&self) -> Result<()>;

    /// Release any open connection. Always succeeds for the remote client.
    fn close(&self) -> Result<()>;

    /// Read the whole file at `path` into memory. Large files are held in
    /// full; use [`reader`](Self::reader) to stream instead.
    fn open(&self, path: &str) -> Result<RemoteFile>;

    /// Open `path` for streaming reads. Network errors can surface on any
    /// later read, and the caller must close the returned file.
    fn reader(&self, path: &str) -> Result<RemoteFile>;

    /// Remove the file at `path`. A path that does not exist is not an error.
    fn delete(&self, path: &str) -> Result<()>;

    /// Write `contents` to `path`, creating parent directories as needed.
    /// `contents` is dropped before returning, whatever the outcome.
    fn upload_file(&self, path: &str, contents: Box<dyn Read + Send>) -> Result<()>;

    /// Paths of the files directly inside `dir`, matched without regard to
    /// case but spelled as the server stores them. Absolute `dir` gives
    /// absolute results, relative gives relative.
    fn list_files(&self, dir: &str) -> Result<Vec<String>>;

    /// Visit every entry under `dir`, directories included, depth first.
    /// Returning [`WalkControl::SkipDir`] prunes the current directory; an
    /// error from the callback stops the walk and is returned as is.
    fn walk(&self, dir: &str, f: &mut WalkFn<'_>) -> Result<()>;
}

/// [`Client`] over a single SFTP connection that re-establishes itself after
/// connection failures.
///
/// All operations share one connection and are serialised behind one lock;
/// use several clients for parallel transfers.
pub struct SftpClient<C: Connector = Ssh2Connector> {
    inner: Mutex<ConnectionManager<C>>,
    health: Arc<ConnectionHealth>,
}

impl SftpClient<Ssh2Connector> {
    /// Create a client without connecting. The first operation connects.
    ///
    /// With no trusted host keys configured any server key is accepted and a
    /// warning is logged once per process. That default is insecure.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Ssh2Connector, InsecureHostKeyNotice::global())
    }

    /// Create a client and connect right away.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config);
        client.ensure_connected()?;
        Ok(client)
    }
}

impl<C: Connector> SftpClient<C> {
    pub fn with_connector(
        config: ClientConfig,
        connector: C,
        notice: Arc<InsecureHostKeyNotice>,
    ) -> Self {
        let manager = ConnectionManager::new(config, connector, notice);
        let health = manager.health().clone();
        Self {
            inner: Mutex::new(manager),
            health,
        }
    }

    /// Connect if needed and return the server's working directory.
    pub fn ensure_connected(&self) -> Result<String> {
        let mut mgr = self.lock();
        let wd = mgr.run(|fs| Ok(fs.getwd()?))?;
        tracing::info!("[sftp] connected to {} (wd={})", mgr.config().hostname, wd);
        Ok(wd)
    }

    pub fn health(&self) -> &Arc<ConnectionHealth> {
        &self.health
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    pub fn config(&self) -> ClientConfig {
        self.lock().config().clone()
    }

    // The guarded state is consistent between calls, so a panic while
    // holding the lock leaves nothing to repair.
    fn lock(&self) -> MutexGuard<'_, ConnectionManager<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_stream<C: Connector>(
    mgr: &mut ConnectionManager<C>,
    path: &str,
) -> Result<(Box<dyn RemoteStream>, Option<FileStat>)> {
    let mut stream = mgr
        .run(|fs| Ok(fs.open(path)?))
        .with_context(|| format!("sftp: open {}", path))?;
    let metadata = match stream.stat() {
        Ok(st) => Some(st),
        Err(e) => {
            tracing::debug!("[sftp] stat {} after open: {}", path, e);
            None
        }
    };
    Ok((stream, metadata))
}

impl<C: Connector> Client for SftpClient<C> {
    fn ping(&self) -> Result<()> {
        let mut mgr = self.lock();
        match mgr.try_run(|fs| Ok(fs.read_dir(".")?)) {
            Ok(_) => {
                self.health.record::<(), ()>(&Ok(()));
                Ok(())
            }
            // The reconnect itself proved the server reachable.
            Err(Recovery::Reconnected(e)) => {
                tracing::debug!("[sftp] ping recovered after: {:#}", e);
                Ok(())
            }
            Err(Recovery::Failed(e)) => {
                self.health.record::<(), ()>(&Err(()));
                Err(e.context("sftp: ping"))
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.lock().close();
        Ok(())
    }

    fn open(&self, path: &str) -> Result<RemoteFile> {
        let mut mgr = self.lock();
        let chunk = chunk_size(mgr.config());
        let (mut stream, metadata) = open_stream(&mut *mgr, path)?;

        let mut buf = Vec::new();
        let (n, drained) = copy_chunked(&mut stream, &mut buf, chunk);
        let closed = stream.close();
        if let Err(e) = drained {
            let err = mgr.clear_on_error(e.into()).into_error();
            return Err(err.context(format!("sftp: read (n={}) {}", n, path)));
        }
        if let Err(e) = closed {
            tracing::debug!("[sftp] closing {} after read: {}", path, e);
        }
        Ok(RemoteFile::from_bytes(path, buf, metadata))
    }

    fn reader(&self, path: &str) -> Result<RemoteFile> {
        let mut mgr = self.lock();
        let (stream, metadata) = open_stream(&mut *mgr, path)?;
        Ok(RemoteFile::from_stream(path, stream, metadata))
    }

    fn delete(&self, path: &str) -> Result<()> {
        upload::delete(&mut *self.lock(), path)
    }

    fn upload_file(&self, path: &str, contents: Box<dyn Read + Send>) -> Result<()> {
        let mut mgr = self.lock();
        upload::upload(&mut *mgr, path, contents)
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        listing::list_files(&mut *self.lock(), dir)
    }

    fn walk(&self, dir: &str, f: &mut WalkFn<'_>) -> Result<()> {
        listing::walk(&mut *self.lock(), dir, f)
    }
}

pub(crate) fn chunk_size(config: &ClientConfig) -> usize {
    if config.packet_size > 0 {
        config.packet_size
    } else {
        DEFAULT_PACKET_SIZE
    }
}

/// Copy `src` into `dst` in chunks of `chunk` bytes, returning the number of
/// bytes written alongside the outcome so failures can report progress.
pub(crate) fn copy_chunked<R, W>(
    src: &mut R,
    dst: &mut W,
    chunk: usize,
) -> (u64, std::io::Result<()>)
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; chunk.max(1)];
    let mut n: u64 = 0;
    loop {
        let read = match src.read(&mut buf) {
            Ok(0) => return (n, Ok(())),
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return (n, Err(e)),
        };
        if let Err(e) = dst.write_all(&buf[..read]) {
            return (n, Err(e));
        }
        n += read as u64;
    }
}
