pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod file;
pub mod hostkeys;
pub mod metrics;
pub mod mock;
pub mod paths;
pub mod remote;
pub mod resolve;
pub mod walk;

pub use client::{Client, SftpClient, WalkFn};
pub use config::ClientConfig;
pub use error::{ClientError, RemoteError, RemoteErrorKind, is_connection_error, is_not_found};
pub use file::RemoteFile;
pub use hostkeys::{HostKeyMatcher, HostKeyPolicy, InsecureHostKeyNotice};
pub use metrics::ConnectionHealth;
pub use mock::MockClient;
pub use remote::libssh2::Ssh2Connector;
pub use remote::{
    ConnectContext, Connection, Connector, DirEntry, FileStat, RemoteFs, RemoteStream, Transport,
};
pub use walk::{WalkControl, WalkEntry};
