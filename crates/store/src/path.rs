//! Helpers for `/`-separated absolute remote paths.

/// Returns true if `path` starts with `/`.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Collapses repeated separators and `.` components and strips a trailing `/`.
///
/// `..` components are kept verbatim; stores reject them.
pub fn clean(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let joined = parts.join("/");
    if is_absolute(path) {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Joins `rel` onto `base`.
pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return clean(base);
    }
    clean(&format!("{base}/{rel}"))
}

/// Returns the parent directory; the parent of `/` is `/`.
pub fn parent(path: &str) -> String {
    let path = clean(path);
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Returns the last path component (empty for `/`).
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Number of components: `/` is 0, `/zone` is 1, `/zone/home/alice` is 3.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|p| !p.is_empty()).count()
}
