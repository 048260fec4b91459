use std::path::{Path, PathBuf};

use super::placeholder::PlaceholderFs;

const OFFICE_LOCK_PREFIX: &str = "~$";

/// True for items that must never be synced: editor lock files, editor temp
/// files, documents currently held open by an office editor, and hidden or
/// temporary items.
pub async fn avoid_sync(fs: &dyn PlaceholderFs, path: &Path) -> bool {
    is_office_lock_file(path)
        || is_office_locked(fs, path).await
        || is_office_temp(fs, path).await
        || is_hidden_or_temp(fs, path).await
}

/// Like [`avoid_sync`] but still allows documents that an editor holds open,
/// since those are exactly the files worth locking.
pub async fn avoid_auto_lock(fs: &dyn PlaceholderFs, path: &Path) -> bool {
    is_office_lock_file(path)
        || is_office_temp(fs, path).await
        || is_hidden_or_temp(fs, path).await
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn is_office_lock_file(path: &Path) -> bool {
    file_name(path).is_some_and(|name| name.starts_with(OFFICE_LOCK_PREFIX))
}

/// Office editors drop `~$<name>` next to an open document, trimming the
/// first one or two characters of longer names.
async fn is_office_locked(fs: &dyn PlaceholderFs, path: &Path) -> bool {
    let Some(name) = file_name(path) else {
        return false;
    };
    if name.starts_with(OFFICE_LOCK_PREFIX) {
        return false;
    }
    for candidate in office_lock_candidates(path, name) {
        if fs.exists(&candidate).await {
            return true;
        }
    }
    false
}

fn office_lock_candidates(path: &Path, name: &str) -> Vec<PathBuf> {
    let Some(parent) = path.parent() else {
        return Vec::new();
    };
    let mut candidates = vec![parent.join(format!("{OFFICE_LOCK_PREFIX}{name}"))];
    let stem_len = stem(name).chars().count();
    let skip = match stem_len {
        7 => 1,
        len if len >= 8 => 2,
        _ => 0,
    };
    if skip > 0 {
        let trimmed: String = name.chars().skip(skip).collect();
        candidates.push(parent.join(format!("{OFFICE_LOCK_PREFIX}{trimmed}")));
    }
    candidates
}

async fn is_office_temp(fs: &dyn PlaceholderFs, path: &Path) -> bool {
    let Some(name) = file_name(path) else {
        return false;
    };
    let lower = name.to_lowercase();
    if lower.ends_with(".tmp") && (lower.starts_with('~') || lower.starts_with("ppt")) {
        return true;
    }
    let (stem, extension) = split_extension(&lower);
    let stem_len = stem.chars().count();
    // Word saves through 8-character names without an extension.
    if extension.is_none() && stem_len == 8 && fs.is_folder(path).await.is_ok_and(|dir| !dir) {
        return true;
    }
    extension == Some("tmp") && matches!(stem_len, 7 | 8)
}

async fn is_hidden_or_temp(fs: &dyn PlaceholderFs, path: &Path) -> bool {
    if file_name(path).is_some_and(|name| name.starts_with('.')) {
        return true;
    }
    if !fs.exists(path).await {
        return false;
    }
    fs.attributes(path)
        .await
        .is_ok_and(|attributes| attributes.hidden || attributes.temporary)
}

fn stem(name: &str) -> &str {
    split_extension(name).0
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (name, None),
    }
}
