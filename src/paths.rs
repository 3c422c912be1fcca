// Remote paths are always '/'-separated regardless of the local platform, so
// these helpers work on plain strings rather than std::path.

/// Lexically clean a slash path: collapse repeated separators, drop `.`
/// segments, resolve `..` where possible and strip trailing slashes. An empty
/// result becomes `"."`.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join two slash paths and clean the result; empty elements are ignored.
pub fn join(base: &str, elem: &str) -> String {
    match (base.is_empty(), elem.is_empty()) {
        (true, true) => String::new(),
        (true, false) => clean(elem),
        (false, true) => clean(base),
        (false, false) => clean(&format!("{}/{}", base, elem)),
    }
}

/// Split after the final separator: `("/a/b/", "c.txt")`. The directory part
/// keeps its trailing slash and is empty when `path` has no separator.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Last element of `path`, ignoring trailing slashes.
pub fn base(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Everything but the last element, cleaned.
pub fn parent(path: &str) -> String {
    let (dir, _) = split(path);
    clean(dir)
}

/// Whether `path` is `prefix` itself or lies below it, compared per element
/// (`/a/bc` is not within `/a/b`).
pub fn is_within(path: &str, prefix: &str) -> bool {
    if path == prefix {
        return true;
    }
    if prefix == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}
