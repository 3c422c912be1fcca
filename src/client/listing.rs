use anyhow::{Context, Result};

use super::WalkFn;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::paths;
use crate::remote::{Connector, RemoteFs};
use crate::resolve::{Glob, ListPattern, WalkStart};
use crate::walk::{Skipped, WalkControl, WalkEntry, Walker};

pub(super) fn list_files<C: Connector>(
    mgr: &mut ConnectionManager<C>,
    dir: &str,
) -> Result<Vec<String>> {
    let pattern = ListPattern::derive(dir);
    let glob = Glob::new(&pattern.pattern);
    tracing::debug!("[sftp][list] dir={} pattern={}", dir, pattern.pattern);

    let mut found = Vec::new();
    mgr.run(|fs| {
        let start = match pattern.start {
            WalkStart::Relative => ".".to_string(),
            WalkStart::WorkingDir => fs.getwd()?,
        };
        walk_tree(fs, &start, &mut |entry| {
            if entry.is_dir() {
                return Ok(WalkControl::Continue);
            }
            // A malformed pattern only fails once there is a file to match.
            let Some(g) = &glob else {
                return Err(ClientError::BadPattern(pattern.pattern.clone()).into());
            };
            if g.is_match(entry.path) {
                found.push(pattern.reconstruct(dir, entry.path));
            }
            Ok(WalkControl::Continue)
        })
    })
    .and_then(|visited| visited)
    .with_context(|| format!("listing {} failed", dir))?;
    Ok(found)
}

/// Walker and session failures pass through the connection classifier;
/// errors from `f` are returned untouched.
pub(super) fn walk<C: Connector>(
    mgr: &mut ConnectionManager<C>,
    dir: &str,
    f: &mut WalkFn<'_>,
) -> Result<()> {
    mgr.run(|fs| walk_tree(fs, dir, f))?
}

/// Drive a [`Walker`] over `root`, feeding entries to `f` and applying the
/// skips it asks for. A skip on a file ends its directory; on a file in the
/// root directory (or the root itself) it ends the walk.
///
/// The outer error is a walker failure; the inner result is whatever `f`
/// stopped the walk with.
fn walk_tree(fs: &dyn RemoteFs, root: &str, f: &mut WalkFn<'_>) -> Result<Result<()>> {
    let root_clean = paths::clean(root);
    let mut w = Walker::new(fs, root);
    let mut skipped = Skipped::default();

    while w.step() {
        if let Some(e) = w.take_err() {
            return Err(anyhow::Error::new(e).context(format!("walking {}", w.path())));
        }
        if skipped.covers(w.path()) {
            w.skip_dir();
            continue;
        }
        let Some(is_dir) = w.stat().map(|st| st.is_dir()) else {
            continue;
        };
        let entry = WalkEntry {
            path: w.path(),
            stat: w.stat(),
            error: None,
        };
        let control = match f(&entry) {
            Ok(control) => control,
            Err(e) => return Ok(Err(e)),
        };
        if control == WalkControl::Continue {
            continue;
        }

        let path = w.path().to_string();
        if is_dir {
            w.skip_dir();
            skipped.push(path);
            continue;
        }
        let parent = paths::parent(&path);
        if paths::clean(&path) == root_clean || parent == root_clean {
            return Ok(Ok(()));
        }
        skipped.push(parent);
    }
    Ok(Ok(()))
}
