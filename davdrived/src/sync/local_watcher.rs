use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A local file-system change, with absolute paths under the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: PathBuf },
    Removed { path: PathBuf },
    Renamed { from: PathBuf, to: PathBuf },
    /// Old half of a rename reported on its own. `tracker` links it to the
    /// matching `MovedIn` when the backend provides one.
    MovedAway { path: PathBuf, tracker: Option<usize> },
    MovedIn { path: PathBuf, tracker: Option<usize> },
    OpenedForWrite { path: PathBuf },
    Closed { path: PathBuf },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let tracker = event.attrs.tracker();
    let paths: Vec<PathBuf> = event
        .paths
        .into_iter()
        .filter(|path| path.starts_with(root) && path != root)
        .collect();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .into_iter()
            .map(|path| LocalEvent::MovedAway { path, tracker })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .map(|path| LocalEvent::MovedIn { path, tracker })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => match <[PathBuf; 2]>::try_from(paths) {
            Ok([from, to]) => vec![LocalEvent::Renamed { from, to }],
            Err(paths) => paths
                .into_iter()
                .map(|path| LocalEvent::Changed { path })
                .collect(),
        },
        EventKind::Create(_) | EventKind::Modify(_) => paths
            .into_iter()
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        EventKind::Access(AccessKind::Open(AccessMode::Write)) => paths
            .into_iter()
            .map(|path| LocalEvent::OpenedForWrite { path })
            .collect(),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => paths
            .into_iter()
            .map(|path| LocalEvent::Closed { path })
            .collect(),
        _ => Vec::new(),
    }
}

/// Some backends report a rename three times: the old path, the new path,
/// then both. Drops the halves that a full rename in the same batch covers.
pub fn coalesce_renames(batch: Vec<LocalEvent>) -> Vec<LocalEvent> {
    let renames: Vec<(PathBuf, PathBuf)> = batch
        .iter()
        .filter_map(|event| match event {
            LocalEvent::Renamed { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    if renames.is_empty() {
        return batch;
    }
    batch
        .into_iter()
        .filter(|event| match event {
            LocalEvent::Removed { path } => !renames.iter().any(|(from, _)| from == path),
            LocalEvent::Changed { path } => !renames.iter().any(|(_, to)| to == path),
            _ => true,
        })
        .collect()
}

#[derive(Debug)]
struct HeldHalf {
    path: PathBuf,
    tracker: Option<usize>,
    since: Instant,
}

/// Joins rename halves that arrive in different batches. A `MovedAway` is
/// held until its `MovedIn` or a full rename shows up; only once the window
/// passes without one does it become a `Removed`.
#[derive(Debug)]
pub struct RenamePairing {
    window: Duration,
    held: Vec<HeldHalf>,
}

impl RenamePairing {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            held: Vec::new(),
        }
    }

    pub fn push(&mut self, batch: Vec<LocalEvent>, now: Instant) -> Vec<LocalEvent> {
        let mut resolved = Vec::with_capacity(batch.len());
        for event in batch {
            match event {
                LocalEvent::MovedAway { path, tracker } => self.held.push(HeldHalf {
                    path,
                    tracker,
                    since: now,
                }),
                LocalEvent::MovedIn { path, tracker } => match self.take(tracker) {
                    Some(from) => resolved.push(LocalEvent::Renamed { from, to: path }),
                    // Moved in from outside the tree.
                    None => resolved.push(LocalEvent::Changed { path }),
                },
                LocalEvent::Renamed { from, to } => {
                    self.held.retain(|half| half.path != from);
                    resolved.push(LocalEvent::Renamed { from, to });
                }
                other => resolved.push(other),
            }
        }
        coalesce_renames(resolved)
    }

    fn take(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let tracker = tracker?;
        let index = self
            .held
            .iter()
            .position(|half| half.tracker == Some(tracker))?;
        Some(self.held.remove(index).path)
    }

    /// When the oldest held half runs out of time.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.held.iter().map(|half| half.since + self.window).min()
    }

    pub fn expire(&mut self, now: Instant) -> Vec<LocalEvent> {
        let (expired, held): (Vec<HeldHalf>, Vec<HeldHalf>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|half| half.since + self.window <= now);
        self.held = held;
        expired
            .into_iter()
            .map(|half| LocalEvent::Removed { path: half.path })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<LocalEvent> {
        self.held
            .drain(..)
            .map(|half| LocalEvent::Removed { path: half.path })
            .collect()
    }
}
