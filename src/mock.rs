//! Local-directory stand-in for [`SftpClient`](crate::SftpClient), for tests
//! of code that consumes a [`Client`].

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::client::{Client, WalkFn};
use crate::error::ClientError;
use crate::file::RemoteFile;
use crate::paths;
use crate::remote::FileStat;
use crate::walk::{WalkControl, WalkEntry};

#[derive(Default)]
struct Injected {
    message: String,
    remaining: usize,
}

/// [`Client`] backed by a directory on the local filesystem. Remote paths,
/// absolute or relative, resolve under [`dir`](Self::dir).
///
/// Listing is case-sensitive, as the local filesystem usually is.
pub struct MockClient {
    root: PathBuf,
    calls: AtomicUsize,
    injected: Mutex<Injected>,
}

impl MockClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            calls: AtomicUsize::new(0),
            injected: Mutex::new(Injected::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    /// Calls made to open, reader, delete, upload_file, list_files and walk,
    /// failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail with `message` until `times` deletes or uploads have used it up.
    /// Open, reader, list_files and walk fail without using it; ping and
    /// close fail while any remain.
    pub fn fail_with(&self, message: impl Into<String>, times: usize) {
        let mut inj = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        *inj = Injected {
            message: message.into(),
            remaining: times,
        };
    }

    fn pending(&self) -> Result<()> {
        let inj = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        if inj.remaining > 0 {
            return Err(ClientError::Injected(inj.message.clone()).into());
        }
        Ok(())
    }

    fn count(&self, consume: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut inj = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        if inj.remaining > 0 {
            if consume {
                inj.remaining -= 1;
            }
            return Err(ClientError::Injected(inj.message.clone()).into());
        }
        Ok(())
    }

    fn local(&self, path: &str) -> PathBuf {
        let rel = paths::clean(path.trim_start_matches('/'));
        if rel == "." {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
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

impl Client for MockClient {
    fn ping(&self) -> Result<()> {
        self.pending()
    }

    fn close(&self) -> Result<()> {
        self.pending()
    }

    fn open(&self, path: &str) -> Result<RemoteFile> {
        self.count(false)?;
        let local = self.local(path);
        let file = std::fs::File::open(&local).with_context(|| format!("open {}", path))?;
        let metadata = file.metadata().ok().map(|md| local_stat(&md));
        Ok(RemoteFile::from_local(paths::base(path), file, metadata))
    }

    fn reader(&self, path: &str) -> Result<RemoteFile> {
        self.open(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.count(true)?;
        match std::fs::remove_file(self.local(path)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(anyhow::Error::new(e).context(format!("delete {}", path)))
            }
            _ => Ok(()),
        }
    }

    fn upload_file(&self, path: &str, mut contents: Box<dyn Read + Send>) -> Result<()> {
        self.count(true)?;
        let local = self.local(path);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent of {}", path))?;
        }
        let mut buf = Vec::new();
        contents
            .read_to_end(&mut buf)
            .with_context(|| format!("reading contents for {}", path))?;
        drop(contents);
        std::fs::write(&local, &buf).with_context(|| format!("writing {}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("chmod {}", path))?;
        }
        Ok(())
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        self.count(false)?;
        let local = self.local(dir);
        std::fs::create_dir_all(&local).with_context(|| format!("creating {}", dir))?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&local).with_context(|| format!("listing {}", dir))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names.iter().map(|n| paths::join(dir, n)).collect())
    }

    fn walk(&self, dir: &str, f: &mut WalkFn<'_>) -> Result<()> {
        self.count(false)?;
        let base = self.local(dir);
        std::fs::create_dir_all(&base).with_context(|| format!("creating {}", dir))?;

        let mut it = WalkDir::new(&base).sort_by_file_name().into_iter();
        while let Some(next) = it.next() {
            let control = match next {
                Ok(entry) => {
                    let path = relative(&base, entry.path());
                    let stat = entry.metadata().ok().map(|md| local_stat(&md));
                    f(&WalkEntry {
                        path: &path,
                        stat: stat.as_ref(),
                        error: None,
                    })?
                }
                Err(err) => {
                    let path = err
                        .path()
                        .map_or_else(|| ".".to_string(), |p| relative(&base, p));
                    f(&WalkEntry {
                        path: &path,
                        stat: None,
                        error: Some(&err),
                    })?
                }
            };
            if control == WalkControl::SkipDir {
                it.skip_current_dir();
            }
        }
        Ok(())
    }
}

/// `p` relative to `base` with '/' separators; `base` itself is `"."`.
fn relative(base: &Path, p: &Path) -> String {
    let rel = p.strip_prefix(base).unwrap_or(p);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn relative_paths_use_slashes() {
        let base = Path::new("/tmp/root");
        assert_eq!(relative(base, Path::new("/tmp/root")), ".");
        assert_eq!(relative(base, Path::new("/tmp/root/a/b.txt")), "a/b.txt");
    }

    #[test]
    fn local_paths_stay_under_root() {
        let m = MockClient::new("/srv/mock");
        assert_eq!(m.local("/outbox/a.txt"), Path::new("/srv/mock/outbox/a.txt"));
        assert_eq!(m.local("outbox/"), Path::new("/srv/mock/outbox"));
        assert_eq!(m.local("/"), Path::new("/srv/mock"));
        assert_eq!(m.local(""), Path::new("/srv/mock"));
    }

    #[test]
    fn injected_failures_run_out() {
        let m = MockClient::new("/srv/mock");
        m.fail_with("boom", 1);
        assert_eq!(m.ping().unwrap_err().to_string(), "boom");
        assert_eq!(m.open("/nothing").unwrap_err().to_string(), "boom");
        assert_eq!(m.delete("/nothing").unwrap_err().to_string(), "boom");
        assert!(m.ping().is_ok());
        assert_eq!(m.calls(), 2);
    }
}
