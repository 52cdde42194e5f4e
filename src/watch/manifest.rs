//! Manifest watcher.
//!
//! The compiler produces the manifest with a multi-step write (temp file,
//! several flushes, rename); parsing on the first modify event races the
//! writer. This actor instead waits for the file to go quiet: any event
//! naming the manifest arms (or re-arms) a quiesce timer, and only a full
//! idle window with no further relevant event fires one `manifestReady`.
//!
//! ```text
//! idle --manifest event--> pending --idle window elapsed--> fire, idle
//!                             ^  \--manifest event--/ (timer re-arms)
//! ```
//!
//! Bursts of any length coalesce into exactly one signal as long as the
//! gaps stay below the window.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::WatchError;
use crate::config::ProjectConfig;
use crate::engine::EngineMsg;
use crate::{debug, log};

/// Manifest watcher actor.
pub struct ManifestWatcher {
    /// Channel to receive notify events (sync -> async bridge)
    notify_rx: Option<std::sync::mpsc::Receiver<notify::Result<notify::Event>>>,
    /// Watcher handle (must be kept alive)
    _watcher: notify::RecommendedWatcher,
    engine_tx: mpsc::Sender<EngineMsg>,
    manifest_name: String,
    timer: QuiesceTimer,
}

impl ManifestWatcher {
    /// Watch the generated directory. Registration failure is fatal to
    /// opening the project; the directory is created first if missing (the
    /// compiler may not have run yet).
    pub fn new(
        engine_tx: mpsc::Sender<EngineMsg>,
        config: Arc<ProjectConfig>,
    ) -> Result<Self, WatchError> {
        let generated = config.generated_dir();
        let _ = std::fs::create_dir_all(&generated);

        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;
        watcher
            .watch(&generated, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: generated.clone(),
                source,
            })?;

        Ok(Self {
            notify_rx: Some(notify_rx),
            _watcher: watcher,
            engine_tx,
            manifest_name: config.project.manifest_name.clone(),
            timer: QuiesceTimer::new(Duration::from_millis(config.sync.manifest_idle_ms)),
        })
    }

    /// Run the actor event loop.
    pub async fn run(mut self) {
        let Some(notify_rx) = self.notify_rx.take() else {
            return;
        };

        let (async_tx, mut async_rx) = tokio::sync::mpsc::channel::<notify::Event>(64);

        // Spawn a thread to poll notify events and send to async channel
        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if async_tx.blocking_send(event).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => log!("manifest"; "notify error: {}", e),
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                event = async_rx.recv() => {
                    let Some(event) = event else { break };
                    self.note_event(&event);
                }
                _ = tokio::time::sleep(self.timer.sleep_duration()) => {
                    if self.timer.take_if_ready() {
                        debug!("manifest"; "manifest stabilized, requesting reload");
                        if self.engine_tx.send(EngineMsg::ManifestReady).await.is_err() {
                            break; // engine shut down
                        }
                    }
                }
            }
        }
    }

    fn note_event(&mut self, event: &notify::Event) {
        let manifest_name = std::ffi::OsStr::new(&self.manifest_name);
        let relevant = event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(manifest_name));

        if relevant {
            self.timer.note();
        } else if self.timer.pending() {
            // Other files written mid-episode are unexpected, but they must
            // not stretch the episode.
            log!("manifest"; "unrelated write while pending: {:?}", event.paths);
        }
    }
}

// =============================================================================
// QuiesceTimer - pure timing, no filesystem access
// =============================================================================

/// Two-state quiesce timer: `idle` until a relevant event arms it,
/// `pending` until a full idle window passes with no further event.
struct QuiesceTimer {
    last_relevant: Option<Instant>,
    idle: Duration,
}

impl QuiesceTimer {
    fn new(idle: Duration) -> Self {
        Self {
            last_relevant: None,
            idle,
        }
    }

    /// A relevant event arrived: arm, or re-arm, the window.
    fn note(&mut self) {
        self.last_relevant = Some(Instant::now());
    }

    fn pending(&self) -> bool {
        self.last_relevant.is_some()
    }

    /// Fire once when the window elapsed; returns to idle.
    fn take_if_ready(&mut self) -> bool {
        match self.last_relevant {
            Some(last) if last.elapsed() >= self.idle => {
                self.last_relevant = None;
                true
            }
            _ => false,
        }
    }

    /// Precise sleep duration until the next possible fire time.
    fn sleep_duration(&self) -> Duration {
        let Some(last) = self.last_relevant else {
            return Duration::from_secs(86400);
        };
        self.idle
            .saturating_sub(last.elapsed())
            .max(Duration::from_millis(1))
    }
}
