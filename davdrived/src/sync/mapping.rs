use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{} is outside the sync root", .0.display())]
    OutsideRoot(PathBuf),
    #[error("remote path {0} is outside the remote root")]
    OutsideRemoteRoot(String),
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is not valid UTF-8")]
    NonUtf8,
    #[error("the sync root has no records of its own")]
    Root,
}

/// Translates between local paths under the sync root and remote store paths
/// under the remote root. Both directions go through the namespace-relative
/// path, so they are inverse for every valid input.
#[derive(Debug, Clone)]
pub struct Mapping {
    local_root: PathBuf,
    // "" for the store root, otherwise "/a/b" without trailing slash.
    remote_root: String,
}

impl Mapping {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        let trimmed = remote_root.trim_matches('/');
        let remote_root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self {
            local_root: local_root.into(),
            remote_root,
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        if self.remote_root.is_empty() {
            "/"
        } else {
            &self.remote_root
        }
    }

    pub fn relative(&self, local: &Path) -> Result<PathBuf, PathError> {
        let rest = local
            .strip_prefix(&self.local_root)
            .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
        normalize_relative(rest)
    }

    pub fn relative_from_remote(&self, remote: &str) -> Result<PathBuf, PathError> {
        let remote = remote.trim_end_matches('/');
        let rest = if self.remote_root.is_empty() {
            remote
        } else {
            match remote.strip_prefix(self.remote_root.as_str()) {
                Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
                _ => return Err(PathError::OutsideRemoteRoot(remote.to_string())),
            }
        };
        from_slash(rest)
    }

    pub fn remote_for_relative(&self, relative: &Path) -> Result<String, PathError> {
        let mut out = self.remote_root.clone();
        let tail = to_slash(relative)?;
        if !tail.is_empty() {
            out.push('/');
            out.push_str(&tail);
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }

    pub fn local_for_relative(&self, relative: &Path) -> PathBuf {
        self.local_root.join(relative)
    }

    pub fn to_remote(&self, local: &Path) -> Result<String, PathError> {
        self.remote_for_relative(&self.relative(local)?)
    }

    pub fn to_local(&self, remote: &str) -> Result<PathBuf, PathError> {
        Ok(self.local_for_relative(&self.relative_from_remote(remote)?))
    }

    pub fn is_in_scope(&self, remote: &str) -> bool {
        self.relative_from_remote(remote).is_ok()
    }
}

/// Joins the components of a namespace-relative path with '/'.
pub fn to_slash(relative: &Path) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or(PathError::NonUtf8)?),
            Component::CurDir => {}
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(parts.join("/"))
}

pub fn from_slash(value: &str) -> Result<PathBuf, PathError> {
    let mut out = PathBuf::new();
    for part in value.split('/').filter(|part| !part.is_empty()) {
        if part == "." || part == ".." {
            return Err(PathError::UnsupportedComponent);
        }
        out.push(part);
    }
    Ok(out)
}

fn normalize_relative(path: &Path) -> Result<PathBuf, PathError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                part.to_str().ok_or(PathError::NonUtf8)?;
                out.push(part);
            }
            Component::CurDir => {}
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(out)
}

/// Case-insensitive comparison that ignores separator style and trailing
/// separators.
pub fn paths_equal(left: &str, right: &str) -> bool {
    normalize_for_compare(left) == normalize_for_compare(right)
}

fn normalize_for_compare(value: &str) -> String {
    value
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_local_to_remote_under_remote_root() {
        let mapping = Mapping::new("/home/u/Drive", "/team/");
        assert_eq!(
            mapping
                .to_remote(Path::new("/home/u/Drive/Docs/a.txt"))
                .unwrap(),
            "/team/Docs/a.txt"
        );
        assert_eq!(
            mapping.to_remote(Path::new("/home/u/Drive")).unwrap(),
            "/team"
        );
    }

    #[test]
    fn maps_remote_to_local_with_trailing_separator() {
        let mapping = Mapping::new("/home/u/Drive", "/team");
        assert_eq!(
            mapping.to_local("/team/Docs/").unwrap(),
            PathBuf::from("/home/u/Drive/Docs")
        );
        assert_eq!(
            mapping.to_local("/team").unwrap(),
            PathBuf::from("/home/u/Drive")
        );
    }

    #[test]
    fn store_root_maps_to_slash() {
        let mapping = Mapping::new("/d", "/");
        assert_eq!(mapping.to_remote(Path::new("/d")).unwrap(), "/");
        assert_eq!(mapping.to_remote(Path::new("/d/x")).unwrap(), "/x");
        assert_eq!(mapping.to_local("/x").unwrap(), PathBuf::from("/d/x"));
    }

    #[test]
    fn round_trips_in_both_directions() {
        let mapping = Mapping::new("/d", "/root");
        for remote in ["/root/a", "/root/a/b c/d.txt"] {
            let local = mapping.to_local(remote).unwrap();
            assert_eq!(mapping.to_remote(&local).unwrap(), remote);
        }
    }

    #[test]
    fn rejects_paths_outside_roots() {
        let mapping = Mapping::new("/d", "/root");
        assert!(matches!(
            mapping.to_local("/rootless/a"),
            Err(PathError::OutsideRemoteRoot(_))
        ));
        assert!(matches!(
            mapping.to_remote(Path::new("/elsewhere/a")),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            mapping.to_local("/root/../etc"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(!mapping.is_in_scope("/other"));
    }

    #[test]
    fn compares_paths_loosely() {
        assert!(paths_equal("Docs/A.txt", "docs/a.txt/"));
        assert!(paths_equal("Docs\\A.txt", "Docs/A.txt"));
        assert!(!paths_equal("Docs/A.txt", "Docs/B.txt"));
    }
}
