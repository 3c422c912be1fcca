//! Turning a caller's directory argument into a listing pattern, matching
//! server paths against it without regard to case, and handing back the
//! server's own spelling of each match.

use regex::{Regex, RegexBuilder};

use crate::paths;

/// Where the walk behind a listing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStart {
    /// The session-relative `"."`.
    Relative,
    /// The absolute working directory reported by the live session.
    WorkingDir,
}

/// Leading class accepting either separator position left behind by
/// cleaning the caller's directory.
const SEPARATOR_CLASS: &str = "[/?]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPattern {
    pub pattern: String,
    pub start: WalkStart,
}

impl ListPattern {
    pub fn derive(dir: &str) -> Self {
        let cleaned = paths::clean(dir.strip_prefix('/').unwrap_or(dir));
        if dir == "/" {
            return Self {
                pattern: "*".to_string(),
                start: WalkStart::Relative,
            };
        }
        if cleaned == "." {
            let pattern = if dir.is_empty() {
                "*".to_string()
            } else {
                paths::join(dir, "*")
            };
            return Self {
                pattern,
                start: WalkStart::Relative,
            };
        }
        Self {
            pattern: format!("{}{}/*", SEPARATOR_CLASS, cleaned),
            start: WalkStart::WorkingDir,
        }
    }

    /// The literal part of the pattern used to locate a match in a server
    /// path: one trailing `*` and the leading separator class removed.
    pub fn literal_prefix(&self) -> &str {
        let p = self.pattern.strip_suffix('*').unwrap_or(&self.pattern);
        p.strip_prefix(SEPARATOR_CLASS).unwrap_or(p)
    }

    /// Rewrite a matched server path relative to the caller's `dir`, keeping
    /// the server's casing. When the literal prefix cannot be found in
    /// `path` the result is `dir` joined with the base name of `path`.
    pub fn reconstruct(&self, dir: &str, path: &str) -> String {
        match find_ignore_case(path, self.literal_prefix()) {
            Some(idx) => {
                let found = &path[idx..];
                if dir.starts_with('/') && !found.starts_with('/') {
                    format!("/{}", found)
                } else {
                    found.to_string()
                }
            }
            None => paths::join(dir, &paths::base(path)),
        }
    }
}

/// A shell pattern compiled for case-insensitive whole-path matching.
///
/// Syntax follows the usual `filepath` rules: `*` is any run of non-`/`
/// characters, `?` a single non-`/` character, `[...]` a character class
/// (optionally negated with `^`, ranges with `-`) that may also match `/`,
/// and `\` quotes the next character.
#[derive(Debug, Clone)]
pub struct Glob {
    re: Regex,
}

impl Glob {
    /// `None` when the pattern is malformed.
    pub fn new(pattern: &str) -> Option<Self> {
        let source = translate(pattern)?;
        let re = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .ok()?;
        Some(Self { re })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.re.is_match(path)
    }
}

fn translate(pattern: &str) -> Option<String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => push_literal(&mut out, chars.next()?),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut items = 0;
                loop {
                    if chars.peek() == Some(&']') && items > 0 {
                        chars.next();
                        break;
                    }
                    let lo = class_char(&mut chars)?;
                    push_class_char(&mut out, lo);
                    if chars.peek() == Some(&'-') {
                        chars.next();
                        let hi = class_char(&mut chars)?;
                        if hi < lo {
                            return None;
                        }
                        out.push('-');
                        push_class_char(&mut out, hi);
                    }
                    items += 1;
                }
                out.push(']');
            }
            other => push_literal(&mut out, other),
        }
    }
    out.push('$');
    Some(out)
}

fn class_char(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<char> {
    match chars.next()? {
        '-' | ']' => None,
        '\\' => chars.next(),
        c => Some(c),
    }
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn push_class_char(out: &mut String, c: char) {
    out.push_str(&format!("\\x{{{:x}}}", c as u32));
}

/// Byte offset of the first case-insensitive occurrence of `needle` in
/// `haystack`, as an index into `haystack` itself.
pub fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let re = RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(true)
        .build()
        .ok()?;
    re.find(haystack).map(|m| m.start())
}
