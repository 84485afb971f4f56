// SPDX-License-Identifier: Apache-2.0

//! OS notifications (inotify, FSEvents, ReadDirectoryChangesW) used as
//! wake-up hints for the scan loop.

use std::path::PathBuf;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use super::WatchMode;
use crate::bounded_channel::{BoundedSender, TrySendError};
use crate::input::{Error, Result};

pub struct NativeWatcher {
    // dropping the watcher stops notifications
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl NativeWatcher {
    /// Watch `roots` non-recursively. Roots that do not exist yet are skipped
    /// and left to the periodic scan.
    pub fn new(roots: &[PathBuf], hint_tx: BoundedSender<()>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if is_discovery_event(&event.kind) {
                        // a full channel already holds a pending wake-up
                        if let Err(TrySendError::Disconnected(_)) = hint_tx.try_send(()) {
                            debug!("Scan loop gone, dropping file system event");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "File system watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;

        let mut watched = Vec::new();
        for root in roots {
            match watcher.watch(root, RecursiveMode::NonRecursive) {
                Ok(()) => watched.push(root.clone()),
                Err(e) => {
                    warn!(path = ?root, error = %e, "Unable to watch directory, relying on periodic scans")
                }
            }
        }

        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

/// Content changes are picked up by the harvesters; only changes to the set
/// of files need a scan.
fn is_discovery_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Set up notifications for `mode`. `Auto` falls back to scan-only when the
/// native backend cannot be initialised; `Native` treats that as an error.
pub fn create_notifier(
    mode: WatchMode,
    roots: &[PathBuf],
    hint_tx: BoundedSender<()>,
) -> Result<Option<NativeWatcher>> {
    match mode {
        WatchMode::Poll => {
            info!("Using periodic scans only");
            Ok(None)
        }
        WatchMode::Native => NativeWatcher::new(roots, hint_tx).map(Some),
        WatchMode::Auto => match NativeWatcher::new(roots, hint_tx) {
            Ok(w) => {
                info!(directories = w.watched().len(), "Using native file system watcher");
                Ok(Some(w))
            }
            Err(e) => {
                warn!(error = %e, "Native file watching unavailable, falling back to periodic scans");
                Ok(None)
            }
        },
    }
}
