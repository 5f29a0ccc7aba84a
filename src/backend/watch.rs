// Shader hot reload
//
// Watches the compiled SPIR-V files and reports when any of them changed.
// The scheduler answers a change the same way it answers a stale swapchain:
// a full recreation, which reloads the shaders from disk.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

pub struct ShaderWatcher {
    files: Vec<PathBuf>,
    events: Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl ShaderWatcher {
    pub fn new(files: &[&Path]) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(tx).context("Failed to start shader watcher")?;

        // Watch directories: compilers usually replace the file rather than edit it
        let mut dirs: Vec<PathBuf> = Vec::new();
        for file in files {
            let dir = match file.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !dirs.contains(&dir) {
                watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .with_context(|| format!("Failed to watch {:?}", dir))?;
                dirs.push(dir);
            }
        }

        log::info!("Watching {} shader file(s) for changes", files.len());
        Ok(Self {
            files: files.iter().map(|f| normalize(f)).collect(),
            events,
            _watcher: watcher,
        })
    }

    /// Drain pending events; true if any watched shader was written.
    pub fn poll_changed(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            match event {
                Ok(event) if is_write(&event.kind) => {
                    if event.paths.iter().any(|p| self.files.contains(&normalize(p))) {
                        changed = true;
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        if changed {
            log::info!("Shader change detected, reloading");
        }
        changed
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
