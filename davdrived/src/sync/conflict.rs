/// Version token recorded for remote items that carry no ETag (folders, mostly).
pub const ANY_VERSION: &str = "*";

pub fn version_or_any(etag: Option<&str>) -> &str {
    etag.filter(|etag| !etag.is_empty()).unwrap_or(ANY_VERSION)
}

pub fn versions_match(local: Option<&str>, remote: Option<&str>) -> bool {
    version_or_any(local) == version_or_any(remote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    NoOp,
    UploadLocal,
    DownloadRemote,
    Conflict,
}

/// Decides how to reconcile one item given the last common version (`base`),
/// whether the local copy changed since, and the current remote version.
pub fn resolve_conflict(
    base: Option<&str>,
    local_modified: bool,
    remote: Option<&str>,
) -> ConflictDecision {
    let remote_changed = !versions_match(base, remote);
    match (local_modified, remote_changed) {
        (false, false) => ConflictDecision::NoOp,
        (true, false) => ConflictDecision::UploadLocal,
        (false, true) => ConflictDecision::DownloadRemote,
        (true, true) => ConflictDecision::Conflict,
    }
}
