//! `ssh2` (libssh2) backed connector and session.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};

use super::{
    ConnectContext, Connection, Connector, DirEntry, FileStat, RemoteFs, RemoteStream, Transport,
    close_in_background,
};
use crate::ClientConfig;
use crate::error::{ClientError, RemoteError, RemoteErrorKind};
use crate::metrics::ConnectionHealth;

const DIAL_ATTEMPTS: usize = 3;
const DIAL_SPACING: Duration = Duration::from_millis(250);

// libssh2 session errors raised once the socket is gone
const SOCKET_GONE: [i32; 5] = [
    -7,  // LIBSSH2_ERROR_SOCKET_SEND
    -9,  // LIBSSH2_ERROR_TIMEOUT
    -13, // LIBSSH2_ERROR_SOCKET_DISCONNECT
    -30, // LIBSSH2_ERROR_SOCKET_TIMEOUT
    -43, // LIBSSH2_ERROR_SOCKET_RECV
];

pub(crate) fn remote_error(e: ssh2::Error) -> RemoteError {
    classify(&e)
}

fn classify(e: &ssh2::Error) -> RemoteError {
    let kind = match e.code() {
        ErrorCode::SFTP(code) => RemoteErrorKind::from_status(code),
        ErrorCode::Session(code) if SOCKET_GONE.contains(&code) => RemoteErrorKind::ConnectionLost,
        ErrorCode::Session(code) => RemoteErrorKind::Other(code),
    };
    RemoteError::new(kind, e.message())
}

// Stream reads and writes surface ssh2 failures as io::Error; re-wrap them so
// the connection classifier can see the remote cause.
fn stream_error(e: std::io::Error) -> std::io::Error {
    let remote = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ssh2::Error>())
        .map(classify);
    match remote {
        Some(re) => re.into(),
        None => e,
    }
}

fn file_stat(st: &ssh2::FileStat) -> FileStat {
    FileStat {
        size: st.size,
        perm: st.perm,
        mtime: st.mtime,
        is_dir: st.is_dir(),
    }
}

/// Production [`Connector`]: TCP dial with retries, SSH handshake, host key
/// validation, password and/or private key auth, then the sftp subsystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Connector for Ssh2Connector {
    fn connect(&self, ctx: &ConnectContext<'_>) -> anyhow::Result<Connection> {
        let cfg = ctx.config;
        let addr = cfg.hostname.as_str();
        let private_key = decode_private_key(&cfg.client_private_key)?;

        let tcp = dial(addr, cfg.timeout, ctx.health)?;
        let mut sess =
            Session::new().map_err(|_| ClientError::SessionCreateFailed(addr.to_string()))?;
        sess.set_tcp_stream(tcp);
        if !cfg.timeout.is_zero() {
            sess.set_timeout(u32::try_from(cfg.timeout.as_millis()).unwrap_or(u32::MAX));
        }
        sess.handshake()
            .map_err(|e| ClientError::HandshakeFailed(addr.to_string(), e.to_string()))?;

        let established = (|| -> anyhow::Result<Sftp> {
            let (key, _) = sess
                .host_key()
                .ok_or_else(|| ClientError::NoHostKey(addr.to_string()))?;
            ctx.host_keys.verify(key)?;
            authenticate(&sess, cfg, private_key.as_deref())?;
            // the timeout only covers connection setup
            sess.set_timeout(0);
            let sftp = sess
                .sftp()
                .map_err(|e| ClientError::SftpCreateFailed(e.to_string()))?;
            Ok(sftp)
        })();

        match established {
            Ok(sftp) => {
                tracing::debug!(
                    "[sftp] connected to {} (max_connections={} packet_size={})",
                    addr,
                    cfg.max_connections,
                    cfg.packet_size
                );
                Ok(Connection::new(
                    Box::new(Ssh2Session { sftp }),
                    Box::new(Ssh2Transport(sess)),
                ))
            }
            Err(e) => {
                close_in_background(Box::new(Ssh2Transport(sess)));
                Err(e)
            }
        }
    }
}

fn dial(
    addr: &str,
    timeout: Duration,
    health: &ConnectionHealth,
) -> Result<TcpStream, ClientError> {
    let mut last_err = ClientError::NoAddress(addr.to_string());
    for attempt in 0..DIAL_ATTEMPTS {
        if attempt > 0 {
            health.add_retry();
            std::thread::sleep(DIAL_SPACING);
        }
        match create_tcp_connection(addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                tracing::debug!("[sftp] dial attempt={} addr={} failed: {}", attempt + 1, addr, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

fn create_tcp_connection(addr: &str, timeout: Duration) -> Result<TcpStream, ClientError> {
    let sock = addr
        .to_socket_addrs()
        .map_err(|e| ClientError::Dial(addr.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| ClientError::NoAddress(addr.to_string()))?;
    let tcp = if timeout.is_zero() {
        TcpStream::connect(sock)
    } else {
        TcpStream::connect_timeout(&sock, timeout)
    };
    tcp.map_err(|e| ClientError::Dial(addr.to_string(), e.to_string()))
}

/// Accept the key either base64 encoded or as raw PEM/OpenSSH text.
fn decode_private_key(raw: &str) -> Result<Option<String>, ClientError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let text = match STANDARD.decode(raw.trim()) {
        Ok(decoded) if !decoded.is_empty() => String::from_utf8(decoded)
            .map_err(|_| ClientError::PrivateKey("decoded key is not text".to_string()))?,
        _ => raw.to_string(),
    };
    if !text.contains("PRIVATE KEY") {
        return Err(ClientError::PrivateKey("unrecognised private key format".to_string()));
    }
    Ok(Some(text))
}

fn authenticate(
    sess: &Session,
    cfg: &ClientConfig,
    private_key: Option<&str>,
) -> Result<(), ClientError> {
    if !cfg.password.is_empty()
        && let Err(e) = sess.userauth_password(&cfg.username, &cfg.password)
    {
        tracing::debug!("[sftp] password auth for {} failed: {}", cfg.username, e);
    }
    if !sess.authenticated()
        && let Some(pem) = private_key
    {
        let passphrase = Some(cfg.client_private_key_password.as_str()).filter(|p| !p.is_empty());
        if let Err(e) = sess.userauth_pubkey_memory(&cfg.username, None, pem, passphrase) {
            tracing::debug!("[sftp] key auth for {} failed: {}", cfg.username, e);
        }
    }
    if sess.authenticated() {
        Ok(())
    } else {
        Err(ClientError::AuthFailed(cfg.hostname.clone()))
    }
}

struct Ssh2Transport(Session);

impl Transport for Ssh2Transport {
    fn close(&mut self) -> anyhow::Result<()> {
        self.0.disconnect(None, "closing", None)?;
        Ok(())
    }
}

struct Ssh2Session {
    sftp: Sftp,
}

impl RemoteFs for Ssh2Session {
    fn getwd(&self) -> Result<String, RemoteError> {
        let wd = self.sftp.realpath(Path::new(".")).map_err(remote_error)?;
        Ok(wd.to_string_lossy().to_string())
    }

    fn stat(&self, path: &str) -> Result<FileStat, RemoteError> {
        self.sftp.stat(Path::new(path)).map(|st| file_stat(&st)).map_err(remote_error)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(remote_error)?;
        let mut out: Vec<DirEntry> = entries
            .iter()
            .filter_map(|(p, st)| {
                let name = p.file_name()?.to_string_lossy().to_string();
                if matches!(name.as_str(), "." | "..") {
                    return None;
                }
                Some(DirEntry {
                    name,
                    stat: file_stat(st),
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
        let f = self.sftp.open(Path::new(path)).map_err(remote_error)?;
        Ok(Box::new(Ssh2Stream(f)))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
        // Some servers refuse combined read/write access, so open write-only.
        let f = self
            .sftp
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(remote_error)?;
        Ok(Box::new(Ssh2Stream(f)))
    }

    fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let p = Path::new(path);
        match self.sftp.unlink(p) {
            Ok(()) => Ok(()),
            Err(e) => match self.sftp.stat(p) {
                Ok(st) if st.is_dir() => self.sftp.rmdir(p).map_err(remote_error),
                _ => Err(remote_error(e)),
            },
        }
    }

    /// mkdir -p: existing directories are skipped, an existing file in the
    /// way is an error, and a failed mkdir is re-checked in case another
    /// client created the directory concurrently.
    fn mkdir_all(&self, path: &str) -> Result<(), RemoteError> {
        let mut accum = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for seg in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if !accum.is_empty() && !accum.ends_with('/') {
                accum.push('/');
            }
            accum.push_str(seg);
            let p = Path::new(&accum);
            match self.sftp.stat(p) {
                Ok(st) if st.is_dir() => {}
                Ok(_) => {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Other(-1),
                        format!("{}: exists and is not a directory", accum),
                    ));
                }
                Err(_) => {
                    if let Err(e) = self.sftp.mkdir(p, 0o755) {
                        match self.sftp.stat(p) {
                            Ok(st) if st.is_dir() => {}
                            _ => return Err(remote_error(e)),
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

struct Ssh2Stream(ssh2::File);

impl Read for Ssh2Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).map_err(stream_error)
    }
}

impl Write for Ssh2Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf).map_err(stream_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush().map_err(stream_error)
    }
}

impl RemoteStream for Ssh2Stream {
    fn stat(&mut self) -> Result<FileStat, RemoteError> {
        self.0.stat().map(|st| file_stat(&st)).map_err(remote_error)
    }

    fn sync(&mut self) -> Result<(), RemoteError> {
        self.0.fsync().map_err(remote_error)
    }

    fn chmod(&mut self, mode: u32) -> Result<(), RemoteError> {
        let attrs = ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.0.setstat(attrs).map_err(remote_error)
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.0.close().map_err(remote_error)
    }
}
