//! Depth-first pre-order traversal of a remote tree.

use crate::error::RemoteError;
use crate::paths;
use crate::remote::{FileStat, RemoteFs};

/// What a walk callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkControl {
    #[default]
    Continue,
    /// On a directory: do not descend into it. On a file: skip the remaining
    /// entries of the file's directory.
    SkipDir,
}

/// One visited entry, handed to a walk callback.
#[derive(Debug, Clone, Copy)]
pub struct WalkEntry<'a> {
    /// Path as reported by the server, possibly cased differently from the
    /// caller's input.
    pub path: &'a str,
    pub stat: Option<&'a FileStat>,
    pub error: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
}

impl WalkEntry<'_> {
    pub fn is_dir(&self) -> bool {
        self.stat.is_some_and(FileStat::is_dir)
    }
}

struct Item {
    path: String,
    stat: Option<FileStat>,
    err: Option<RemoteError>,
}

/// Steppable cursor over a tree rooted at one path. Children are listed
/// lazily, right before the cursor moves past their parent, so
/// [`skip_dir`](Self::skip_dir) on the current directory prevents the
/// listing entirely.
pub struct Walker<'a> {
    fs: &'a dyn RemoteFs,
    cur: Option<Item>,
    stack: Vec<Item>,
    descend: bool,
}

impl<'a> Walker<'a> {
    pub fn new(fs: &'a dyn RemoteFs, root: &str) -> Self {
        let root_item = match fs.stat(root) {
            Ok(stat) => Item {
                path: root.to_string(),
                stat: Some(stat),
                err: None,
            },
            Err(e) => Item {
                path: root.to_string(),
                stat: None,
                err: Some(e),
            },
        };
        Self {
            fs,
            cur: None,
            stack: vec![root_item],
            descend: false,
        }
    }

    /// Advance to the next entry. Returns `false` once the tree is exhausted.
    pub fn step(&mut self) -> bool {
        if self.descend
            && let Some(cur) = self.cur.take()
        {
            let expand = cur.err.is_none() && cur.stat.as_ref().is_some_and(FileStat::is_dir);
            if expand {
                match self.fs.read_dir(&cur.path) {
                    Ok(list) => {
                        for entry in list.into_iter().rev() {
                            let path = paths::join(&cur.path, &entry.name);
                            self.stack.push(Item {
                                path,
                                stat: Some(entry.stat),
                                err: None,
                            });
                        }
                    }
                    // Revisit the directory carrying the listing error.
                    Err(e) => self.stack.push(Item {
                        err: Some(e),
                        ..cur
                    }),
                }
            }
        }
        match self.stack.pop() {
            Some(item) => {
                self.cur = Some(item);
                self.descend = true;
                true
            }
            None => {
                self.cur = None;
                false
            }
        }
    }

    pub fn path(&self) -> &str {
        self.cur.as_ref().map_or("", |c| c.path.as_str())
    }

    pub fn stat(&self) -> Option<&FileStat> {
        self.cur.as_ref().and_then(|c| c.stat.as_ref())
    }

    pub fn err(&self) -> Option<&RemoteError> {
        self.cur.as_ref().and_then(|c| c.err.as_ref())
    }

    /// Do not descend into the current entry.
    pub fn skip_dir(&mut self) {
        self.descend = false;
    }

    pub(crate) fn take_err(&mut self) -> Option<RemoteError> {
        self.cur.as_mut().and_then(|c| c.err.take())
    }
}

/// Prefixes the caller asked to skip during one walk.
#[derive(Debug, Default)]
pub(crate) struct Skipped {
    prefixes: Vec<String>,
}

impl Skipped {
    pub(crate) fn push(&mut self, prefix: String) {
        self.prefixes.push(prefix);
    }

    pub(crate) fn covers(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| paths::is_within(path, p))
    }
}
