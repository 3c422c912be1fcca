use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::remote::{FileStat, RemoteStream};

enum Contents {
    Memory(Cursor<Vec<u8>>),
    Remote(Box<dyn RemoteStream>),
    Local(std::fs::File),
}

/// A file returned by `open` or `reader`. Reading yields its contents;
/// the caller owns it and should [`close`](Self::close) it when done.
pub struct RemoteFile {
    pub filename: String,
    /// Taken from the server's metadata, or the time the file was opened
    /// when no metadata was available.
    pub mod_time: DateTime<Utc>,
    metadata: Option<FileStat>,
    contents: Option<Contents>,
}

impl RemoteFile {
    /// A file whose contents were already read in full.
    pub fn from_bytes(
        filename: impl Into<String>,
        bytes: Vec<u8>,
        metadata: Option<FileStat>,
    ) -> Self {
        Self::with_contents(filename.into(), metadata, Contents::Memory(Cursor::new(bytes)))
    }

    /// A file streaming from a live remote handle.
    pub fn from_stream(
        filename: impl Into<String>,
        stream: Box<dyn RemoteStream>,
        metadata: Option<FileStat>,
    ) -> Self {
        Self::with_contents(filename.into(), metadata, Contents::Remote(stream))
    }

    /// A file streaming from the local filesystem.
    pub fn from_local(
        filename: impl Into<String>,
        file: std::fs::File,
        metadata: Option<FileStat>,
    ) -> Self {
        Self::with_contents(filename.into(), metadata, Contents::Local(file))
    }

    fn with_contents(filename: String, metadata: Option<FileStat>, contents: Contents) -> Self {
        let mod_time = metadata
            .as_ref()
            .and_then(FileStat::mod_time)
            .unwrap_or_else(Utc::now);
        Self {
            filename,
            mod_time,
            metadata,
            contents: Some(contents),
        }
    }

    /// Metadata captured when the file was opened, if the server returned any.
    pub fn stat(&self) -> Option<&FileStat> {
        self.metadata.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.contents.is_none()
    }

    /// Release the underlying stream. Safe to call more than once; reads
    /// after closing return end-of-file.
    pub fn close(&mut self) -> Result<()> {
        match self.contents.take() {
            Some(Contents::Remote(mut stream)) => {
                stream.close().with_context(|| format!("sftp: closing {}", self.filename))
            }
            Some(Contents::Memory(_)) | Some(Contents::Local(_)) | None => Ok(()),
        }
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.contents.as_mut() {
            Some(Contents::Memory(c)) => c.read(buf),
            Some(Contents::Remote(s)) => s.read(buf),
            Some(Contents::Local(f)) => f.read(buf),
            None => Ok(0),
        }
    }
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &self.contents {
            Some(Contents::Memory(_)) => "memory",
            Some(Contents::Remote(_)) => "remote",
            Some(Contents::Local(_)) => "local",
            None => "closed",
        };
        f.debug_struct("RemoteFile")
            .field("filename", &self.filename)
            .field("mod_time", &self.mod_time)
            .field("metadata", &self.metadata)
            .field("contents", &backing)
            .finish()
    }
}
