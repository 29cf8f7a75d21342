use std::path::Path;

/// Normalizes a manifest-relative path to forward slashes without a leading
/// separator, so paths compare equal across platforms and manifest versions.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

pub fn join_relative(dir: &str, name: &str) -> String {
    let dir = normalize_relative_path(dir);
    let name = normalize_relative_path(name);
    if dir.is_empty() {
        name
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Rejects absolute paths and parent-directory escapes before anything from
/// a manifest or archive touches the instance directory.
pub fn is_safe_relative_path(path: &Path) -> bool {
    use std::path::Component;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}
