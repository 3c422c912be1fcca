/// Failure category reported by the remote session.
///
/// The named variants mirror the SFTP status codes (`SSH_FX_*`) the client
/// reacts to; everything else is kept as `Other` with the raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Other(i32),
}

impl RemoteErrorKind {
    /// Map an SFTP status code onto a kind.
    pub fn from_status(code: i32) -> Self {
        use RemoteErrorKind::*;
        match code {
            1 => Eof,
            2 => NoSuchFile,
            3 => PermissionDenied,
            4 => Failure,
            5 => BadMessage,
            6 => NoConnection,
            7 => ConnectionLost,
            8 => OpUnsupported,
            other => Other(other),
        }
    }

    fn label(&self) -> &'static str {
        use RemoteErrorKind::*;
        match self {
            Eof => "SSH_FX_EOF",
            NoSuchFile => "SSH_FX_NO_SUCH_FILE",
            PermissionDenied => "SSH_FX_PERMISSION_DENIED",
            Failure => "SSH_FX_FAILURE",
            BadMessage => "SSH_FX_BAD_MESSAGE",
            NoConnection => "SSH_FX_NO_CONNECTION",
            ConnectionLost => "SSH_FX_CONNECTION_LOST",
            OpUnsupported => "SSH_FX_OP_UNSUPPORTED",
            Other(_) => "SSH_FX_UNKNOWN",
        }
    }
}

/// Error returned by a remote-session primitive (stat, open, readdir, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        let message = format!("{}: file does not exist", path);
        Self::new(RemoteErrorKind::NoSuchFile, message)
    }

    pub fn connection_lost() -> Self {
        Self::new(RemoteErrorKind::ConnectionLost, "connection lost")
    }

    /// Whether the session or its transport must be considered unusable.
    pub fn is_connection_error(&self) -> bool {
        use RemoteErrorKind::*;
        matches!(self.kind, Eof | Failure | BadMessage | NoConnection | ConnectionLost)
    }

    /// Not every server answers a missing path with a typed status, so the
    /// message is checked as well.
    pub fn is_not_found(&self) -> bool {
        if self.kind == RemoteErrorKind::NoSuchFile {
            return true;
        }
        let msg = self.message.to_ascii_lowercase();
        msg.contains("does not exist") || msg.contains("no such file")
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == RemoteErrorKind::OpUnsupported
            || self.message.contains("SSH_FX_OP_UNSUPPORTED")
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RemoteErrorKind::Other(code) => write!(f, "{} (status {})", self.message, code),
            _ if self.message.is_empty() => f.write_str(self.kind.label()),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for std::io::Error {
    fn from(e: RemoteError) -> Self {
        let kind = match e.kind {
            RemoteErrorKind::NoSuchFile => std::io::ErrorKind::NotFound,
            RemoteErrorKind::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            RemoteErrorKind::Eof => std::io::ErrorKind::UnexpectedEof,
            RemoteErrorKind::ConnectionLost | RemoteErrorKind::NoConnection => {
                std::io::ErrorKind::ConnectionAborted
            }
            RemoteErrorKind::OpUnsupported => std::io::ErrorKind::Unsupported,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

/// Client-level failures raised while establishing a connection, matching
/// listing patterns, or by the mock client.
#[derive(Debug, Clone)]
pub enum ClientError {
    NoAddress(String),
    Dial(String, String),
    SessionCreateFailed(String),
    HandshakeFailed(String, String),
    NoHostKey(String),
    HostKeyParse { index: usize, reason: String },
    HostKeyMismatch,
    PrivateKey(String),
    AuthFailed(String),
    SftpCreateFailed(String),
    NotConnected,
    BadPattern(String),
    Injected(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ClientError::*;
        match self {
            NoAddress(addr) => write!(f, "sftp: unable to resolve address {}", addr),
            Dial(addr, msg) => write!(f, "sftp: dial {} failed: {}", addr, msg),
            SessionCreateFailed(addr) => {
                write!(f, "sftp: unable to create ssh session for {}", addr)
            }
            HandshakeFailed(addr, msg) => {
                write!(f, "sftp: ssh handshake with {} failed: {}", addr, msg)
            }
            NoHostKey(addr) => write!(f, "sftp: {} did not present a host key", addr),
            HostKeyParse { index, reason } => {
                write!(f, "sftp: reading host key at index {}: {}", index, reason)
            }
            HostKeyMismatch => f.write_str("sftp: no matching host keys"),
            PrivateKey(msg) => write!(f, "sftp: failed to read client private key: {}", msg),
            AuthFailed(addr) => write!(f, "sftp: authentication with {} failed", addr),
            SftpCreateFailed(msg) => write!(f, "sftp: sftp connect: {}", msg),
            NotConnected => f.write_str("sftp: no active connection"),
            BadPattern(pattern) => write!(f, "syntax error in pattern {}", pattern),
            Injected(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Every [`RemoteError`] in the chain, including ones carried inside an
/// `io::Error` by a stream read or write.
pub fn remote_causes<'a>(err: &'a anyhow::Error) -> impl Iterator<Item = &'a RemoteError> + 'a {
    err.chain().filter_map(|cause| {
        cause.downcast_ref::<RemoteError>().or_else(|| {
            cause
                .downcast_ref::<std::io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<RemoteError>())
        })
    })
}

/// Whether any error in the chain says the path does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    if remote_causes(err).any(RemoteError::is_not_found) {
        return true;
    }
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Whether any error in the chain is a classified (connection-breaking) remote error.
pub fn is_connection_error(err: &anyhow::Error) -> bool {
    remote_causes(err).any(RemoteError::is_connection_error)
}
