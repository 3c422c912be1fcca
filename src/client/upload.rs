use std::io::Read;

use anyhow::{Context, Result};

use super::{chunk_size, copy_chunked};
use crate::connection::ConnectionManager;
use crate::error::is_not_found;
use crate::paths;
use crate::remote::Connector;

/// Owner read/write only.
const UPLOAD_MODE: u32 = 0o600;

pub(super) fn upload<C: Connector>(
    mgr: &mut ConnectionManager<C>,
    path: &str,
    mut contents: Box<dyn Read + Send>,
) -> Result<()> {
    let cfg = mgr.config();
    let (skip_dirs, skip_sync, skip_chmod) =
        (cfg.skip_directory_creation, cfg.skip_sync_after_upload, cfg.skip_chmod_after_upload);
    let chunk = chunk_size(cfg);

    mgr.run(|_| Ok(()))?;

    if !skip_dirs {
        let (dir, _) = paths::split(path);
        if !dir.is_empty() {
            ensure_parent(mgr, dir)?;
        }
    }

    // Write-only: some servers refuse files opened for reading and writing.
    let mut fd = mgr
        .call(|fs| fs.open_write(path))
        .with_context(|| format!("sftp: problem creating remote file {}", path))?;

    let (n, copied) = copy_chunked(&mut contents, &mut fd, chunk);
    drop(contents);
    mgr.classify(copied).with_context(|| format!("sftp: problem copying (n={}) {}", n, path))?;
    tracing::debug!("[sftp][upload] wrote {} bytes to {}", n, path);

    if !skip_sync {
        match fd.sync() {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {
                tracing::debug!("[sftp][upload] server does not support fsync on {}", path);
            }
            Err(e) => {
                mgr.classify(Err::<(), _>(e))
                    .with_context(|| format!("sftp: problem with sync on {}", path))?;
            }
        }
    }

    if !skip_chmod {
        let res = fd.chmod(UPLOAD_MODE);
        mgr.classify(res).with_context(|| format!("sftp: problem chmod {}", path))?;
    }

    let res = fd.close();
    mgr.classify(res).with_context(|| format!("sftp: closing {} after writing failed", path))
}

fn ensure_parent<C: Connector>(mgr: &mut ConnectionManager<C>, dir: &str) -> Result<()> {
    let err = match mgr.call(|fs| fs.stat(dir)) {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };
    if !is_not_found(&err) {
        return Err(err.context(format!("problem checking if {} exists", dir)));
    }
    tracing::debug!("[sftp][upload] creating parent dir {}", dir);
    mgr.call(|fs| fs.mkdir_all(dir))
        .with_context(|| format!("sftp: problem creating {} as parent dir", dir))
}

pub(super) fn delete<C: Connector>(mgr: &mut ConnectionManager<C>, path: &str) -> Result<()> {
    match mgr.run(|fs| Ok(fs.stat(path)?)) {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.context(format!("sftp: delete stat {}", path))),
    }
    mgr.call(|fs| fs.remove(path)).with_context(|| format!("sftp: delete {}", path))
}
