//! Lexical path handling for container mount paths.

/// Clean a slash-separated path without touching the filesystem: collapse
/// repeated separators, drop `.` segments and resolve `..` against the
/// preceding segment.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join `path` onto `base` unless it is already absolute, then clean it.
pub fn resolve(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        clean_path(path)
    } else {
        clean_path(&format!("{}/{}", base, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/tmp/build/"), "/tmp/build");
        assert_eq!(clean_path("/tmp//build/./src"), "/tmp/build/src");
        assert_eq!(clean_path("/tmp/build/../out"), "/tmp/out");
        assert_eq!(clean_path("/.."), "/");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("./"), ".");
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("/workdir", "cache"), "/workdir/cache");
        assert_eq!(resolve("/workdir", "./cache/"), "/workdir/cache");
        assert_eq!(resolve("/workdir", "/abs/cache"), "/abs/cache");
    }
}
