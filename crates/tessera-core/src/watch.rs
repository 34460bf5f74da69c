//! Watched files and directories.
//!
//! A cell obtains a handle with [`Runtime::watch_file`] or
//! [`Runtime::watch_directory`] and binds it to a global name. Changes on
//! disk re-run the cells that reference that name. Reading through a handle
//! from the cell that created it is refused: that cell would otherwise
//! re-trigger itself every time the file changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::graph::CellId;
use crate::kernel::KernelEvent;
use crate::runtime::Runtime;

/// Identifier of a watched handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(u64);

impl WatchId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    File,
    Directory,
}

/// Shared part of both handle types.
#[derive(Clone)]
struct Watched {
    id: WatchId,
    path: PathBuf,
    creator: CellId,
    runtime: Runtime,
}

impl Watched {
    fn guard(&self) -> Result<()> {
        if self.runtime.current_cell() == Some(self.creator) {
            return Err(Error::ReentrantWatchAccess {
                cell: self.creator,
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

/// Handle to a watched file.
#[derive(Clone)]
pub struct WatchedFile(Watched);

impl WatchedFile {
    pub(crate) fn new(id: WatchId, path: PathBuf, creator: CellId, runtime: Runtime) -> Self {
        Self(Watched {
            id,
            path,
            creator,
            runtime,
        })
    }

    pub fn id(&self) -> WatchId {
        self.0.id
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// The cell that created this handle.
    pub fn creator(&self) -> CellId {
        self.0.creator
    }

    pub fn read_text(&self) -> Result<String> {
        self.0.guard()?;
        Ok(std::fs::read_to_string(&self.0.path)?)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.0.guard()?;
        Ok(std::fs::read(&self.0.path)?)
    }

    /// Replace the file's contents.
    pub fn write_text(&self, contents: &str) -> Result<()> {
        std::fs::write(&self.0.path, contents)?;
        Ok(())
    }

    pub fn exists(&self) -> Result<bool> {
        self.0.guard()?;
        Ok(self.0.path.is_file())
    }
}

/// Handle to a watched directory.
#[derive(Clone)]
pub struct WatchedDirectory(Watched);

impl WatchedDirectory {
    pub(crate) fn new(id: WatchId, path: PathBuf, creator: CellId, runtime: Runtime) -> Self {
        Self(Watched {
            id,
            path,
            creator,
            runtime,
        })
    }

    pub fn id(&self) -> WatchId {
        self.0.id
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn creator(&self) -> CellId {
        self.0.creator
    }

    /// Immediate children, sorted.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        self.0.guard()?;
        let mut entries = std::fs::read_dir(&self.0.path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    /// Every file below the directory, sorted. Symlinks are not followed.
    pub fn walk(&self) -> Result<Vec<PathBuf>> {
        self.0.guard()?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.0.path).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Watch(e.to_string()))?;
            if entry.path().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn exists(&self) -> Result<bool> {
        self.0.guard()?;
        Ok(self.0.path.is_dir())
    }
}

#[derive(Debug, Clone)]
struct Target {
    path: PathBuf,
    kind: WatchKind,
}

impl Target {
    fn matches(&self, event_path: &Path) -> bool {
        match self.kind {
            WatchKind::File => event_path == self.path,
            WatchKind::Directory => event_path.starts_with(&self.path),
        }
    }

    /// What the OS watcher is pointed at: files are watched through their
    /// parent so that atomic replace-by-rename is still seen.
    fn watch_root(&self) -> (PathBuf, RecursiveMode) {
        match self.kind {
            WatchKind::File => (
                self.path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
                RecursiveMode::NonRecursive,
            ),
            WatchKind::Directory => (self.path.clone(), RecursiveMode::Recursive),
        }
    }
}

/// OS file watcher feeding [`KernelEvent::WatchTriggered`] into the kernel.
pub struct WatchService {
    debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    targets: Arc<Mutex<FxHashMap<WatchId, Target>>>,
    /// Reference counts of OS-level watch roots
    roots: FxHashMap<PathBuf, usize>,
}

impl WatchService {
    pub fn new(debounce: Duration, events: mpsc::UnboundedSender<KernelEvent>) -> Result<Self> {
        let targets: Arc<Mutex<FxHashMap<WatchId, Target>>> = Arc::default();
        let seen = Arc::clone(&targets);

        let debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let events_batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!("file watch error: {}", e);
                    return;
                }
            };

            let mut triggered: FxHashSet<WatchId> = FxHashSet::default();
            {
                let targets = seen.lock();
                for event in &events_batch {
                    for (id, target) in targets.iter() {
                        if target.matches(&event.path) {
                            triggered.insert(*id);
                        }
                    }
                }
            }

            let mut triggered: Vec<WatchId> = triggered.into_iter().collect();
            triggered.sort();
            for id in triggered {
                tracing::debug!(watch = %id, "watched path changed");
                if events.send(KernelEvent::WatchTriggered(id)).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| Error::Watch(e.to_string()))?;

        Ok(Self {
            debouncer,
            targets,
            roots: FxHashMap::default(),
        })
    }

    /// Start watching `path` on behalf of handle `id`.
    pub fn watch(&mut self, id: WatchId, path: &Path, kind: WatchKind) -> Result<()> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let target = Target { path, kind };
        let (root, mode) = target.watch_root();

        let count = self.roots.entry(root.clone()).or_insert(0);
        if *count == 0 {
            self.debouncer
                .watcher()
                .watch(&root, mode)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }
        *count += 1;

        self.targets.lock().insert(id, target);
        Ok(())
    }

    /// Stop watching for handle `id`. Unknown ids are ignored.
    pub fn unwatch(&mut self, id: WatchId) {
        let Some(target) = self.targets.lock().remove(&id) else {
            return;
        };
        let (root, _) = target.watch_root();
        if let Some(count) = self.roots.get_mut(&root) {
            *count -= 1;
            if *count == 0 {
                self.roots.remove(&root);
                if let Err(e) = self.debouncer.watcher().unwatch(&root) {
                    tracing::debug!(path = %root.display(), "unwatch failed: {}", e);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.lock().is_empty()
    }
}
