#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sturdy_sftp::error::RemoteErrorKind;
use sturdy_sftp::hostkeys::parse_public_key;
use sturdy_sftp::{
    ClientConfig, ClientError, ConnectContext, Connection, Connector, DirEntry, FileStat,
    InsecureHostKeyNotice, RemoteError, RemoteFs, RemoteStream, SftpClient, Transport, paths,
};

pub const SERVER_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPZ3WQItO2r2wfGrjedz9LGwlLFgIUM6GbIpBKvaxiSz";
pub const OTHER_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINnH6Geq7YNlClxNhCMN0IVt1f0XsPyMYqlW5htNYLpy";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A pretend server exporting a local directory as `/`. Connections made
/// through [`FakeConnector`] can be dropped, refused or fed one-off errors.
pub struct FakeNetwork {
    root: PathBuf,
    server_key: Vec<u8>,
    generation: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    refuse: AtomicBool,
    sync_unsupported: AtomicBool,
    stream_closes: AtomicUsize,
    syncs: AtomicUsize,
    fail_next: Mutex<Option<RemoteError>>,
    fail_read: Mutex<Option<RemoteError>>,
    fail_sync: Mutex<Option<RemoteError>>,
}

impl FakeNetwork {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            server_key: parse_public_key(SERVER_KEY).unwrap(),
            generation: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            sync_unsupported: AtomicBool::new(false),
            stream_closes: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            fail_read: Mutex::new(None),
            fail_sync: Mutex::new(None),
        })
    }

    /// Break every session made so far.
    pub fn drop_connection(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next file operation (anything but the `getwd` probe).
    pub fn fail_next(&self, err: RemoteError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Fail the next read from an open file stream.
    pub fn fail_next_read(&self, err: RemoteError) {
        *self.fail_read.lock().unwrap() = Some(err);
    }

    /// Fail the next fsync of a written file.
    pub fn fail_next_sync(&self, err: RemoteError) {
        *self.fail_sync.lock().unwrap() = Some(err);
    }

    pub fn set_sync_unsupported(&self, on: bool) {
        self.sync_unsupported.store(on, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// File streams closed so far.
    pub fn stream_closes(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }

    /// Sync requests that reached the server.
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn local(&self, path: &str) -> PathBuf {
        let rel = paths::clean(path.trim_start_matches('/'));
        if rel == "." {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

#[derive(Clone)]
pub struct FakeConnector(pub Arc<FakeNetwork>);

impl Connector for FakeConnector {
    fn connect(&self, ctx: &ConnectContext<'_>) -> anyhow::Result<Connection> {
        let net = &self.0;
        if net.refuse.load(Ordering::SeqCst) {
            let host = ctx.config.hostname.clone();
            return Err(ClientError::Dial(host, "connection refused".into()).into());
        }
        ctx.host_keys.verify(&net.server_key)?;
        net.connects.fetch_add(1, Ordering::SeqCst);
        let generation = net.generation.load(Ordering::SeqCst);
        Ok(Connection::new(
            Box::new(LocalFs {
                net: net.clone(),
                generation,
            }),
            Box::new(FakeTransport(net.clone())),
        ))
    }
}

struct FakeTransport(Arc<FakeNetwork>);

impl Transport for FakeTransport {
    fn close(&mut self) -> anyhow::Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct LocalFs {
    net: Arc<FakeNetwork>,
    generation: usize,
}

fn io_to_remote(path: &str, e: std::io::Error) -> RemoteError {
    match e.kind() {
        std::io::ErrorKind::NotFound => RemoteError::not_found(path),
        std::io::ErrorKind::PermissionDenied => RemoteError::new(
            RemoteErrorKind::PermissionDenied,
            format!("{}: permission denied", path),
        ),
        _ => RemoteError::new(RemoteErrorKind::Other(-1), format!("{}: {}", path, e)),
    }
}

fn local_stat(md: &std::fs::Metadata) -> FileStat {
    #[cfg(unix)]
    let perm = {
        use std::os::unix::fs::PermissionsExt;
        Some(md.permissions().mode())
    };
    #[cfg(not(unix))]
    let perm = None;
    let mtime = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    FileStat {
        size: Some(md.len()),
        perm,
        mtime,
        is_dir: md.is_dir(),
    }
}

impl LocalFs {
    fn alive(&self) -> Result<(), RemoteError> {
        if self.net.generation.load(Ordering::SeqCst) != self.generation {
            return Err(RemoteError::connection_lost());
        }
        Ok(())
    }

    fn check(&self) -> Result<(), RemoteError> {
        self.alive()?;
        match self.net.fail_next.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stream(&self, file: File) -> Box<dyn RemoteStream> {
        Box::new(LocalStream {
            file,
            net: self.net.clone(),
            generation: self.generation,
        })
    }
}

impl RemoteFs for LocalFs {
    fn getwd(&self) -> Result<String, RemoteError> {
        self.alive()?;
        Ok("/".to_string())
    }

    fn stat(&self, path: &str) -> Result<FileStat, RemoteError> {
        self.check()?;
        std::fs::metadata(self.net.local(path))
            .map(|md| local_stat(&md))
            .map_err(|e| io_to_remote(path, e))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError> {
        self.check()?;
        let rd = std::fs::read_dir(self.net.local(path)).map_err(|e| io_to_remote(path, e))?;
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| io_to_remote(path, e))?;
            let md = entry.metadata().map_err(|e| io_to_remote(path, e))?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                stat: local_stat(&md),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
        self.check()?;
        let file = File::open(self.net.local(path)).map_err(|e| io_to_remote(path, e))?;
        Ok(self.stream(file))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
        self.check()?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.net.local(path))
            .map_err(|e| io_to_remote(path, e))?;
        Ok(self.stream(file))
    }

    fn remove(&self, path: &str) -> Result<(), RemoteError> {
        self.check()?;
        let local = self.net.local(path);
        let res = if local.is_dir() {
            std::fs::remove_dir(&local)
        } else {
            std::fs::remove_file(&local)
        };
        res.map_err(|e| io_to_remote(path, e))
    }

    fn mkdir_all(&self, path: &str) -> Result<(), RemoteError> {
        self.check()?;
        std::fs::create_dir_all(self.net.local(path)).map_err(|e| io_to_remote(path, e))
    }
}

struct LocalStream {
    file: File,
    net: Arc<FakeNetwork>,
    generation: usize,
}

impl LocalStream {
    fn alive(&self) -> Result<(), RemoteError> {
        if self.net.generation.load(Ordering::SeqCst) != self.generation {
            return Err(RemoteError::connection_lost());
        }
        Ok(())
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.alive()?;
        if let Some(e) = self.net.fail_read.lock().unwrap().take() {
            return Err(e.into());
        }
        self.file.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.alive()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl RemoteStream for LocalStream {
    fn stat(&mut self) -> Result<FileStat, RemoteError> {
        self.alive()?;
        self.file
            .metadata()
            .map(|md| local_stat(&md))
            .map_err(|e| io_to_remote("stream", e))
    }

    fn sync(&mut self) -> Result<(), RemoteError> {
        self.alive()?;
        self.net.syncs.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.net.fail_sync.lock().unwrap().take() {
            return Err(e);
        }
        if self.net.sync_unsupported.load(Ordering::SeqCst) {
            return Err(RemoteError::new(
                RemoteErrorKind::OpUnsupported,
                "fsync: SSH_FX_OP_UNSUPPORTED",
            ));
        }
        self.file.sync_all().map_err(|e| io_to_remote("stream", e))
    }

    fn chmod(&mut self, mode: u32) -> Result<(), RemoteError> {
        self.alive()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            self.file
                .set_permissions(std::fs::Permissions::from_mode(mode))
                .map_err(|e| io_to_remote("stream", e))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.net.stream_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        hostname: "sftp.test:22".to_string(),
        username: "demo".to_string(),
        ..Default::default()
    }
}

/// A client over `net` with its own insecure-default notice.
pub fn client(
    net: &Arc<FakeNetwork>,
    cfg: ClientConfig,
) -> (SftpClient<FakeConnector>, Arc<InsecureHostKeyNotice>) {
    let notice = Arc::new(InsecureHostKeyNotice::new());
    let client = SftpClient::with_connector(cfg, FakeConnector(net.clone()), notice.clone());
    (client, notice)
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let p = root.join(rel);
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(p, contents).unwrap();
}
