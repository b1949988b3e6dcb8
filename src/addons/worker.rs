//! Background engine worker.
//!
//! Runs an [`AddonEngine`] on a dedicated thread so callers never block on
//! disk or network work. Requests go in over one channel; every engine
//! event comes back over another, followed by [`EngineEvent::Idle`] once
//! the request is done.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::engine::{AddonEngine, EngineEvent, EventSink};
use super::types::{AddonId, InstallOptions};

/// Request for the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Scan,
    ResolveConflict { folder: String, id: AddonId },
    Install { id: AddonId, options: InstallOptions },
    Delete { folder: String, keep_ids: BTreeSet<AddonId> },
    UpdateAll,
}

/// What the worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Scanning,
    Resolving,
    Installing,
    Deleting,
    Updating,
}

/// Handle to an engine running on its own thread.
pub struct BackgroundEngine {
    /// Sender for requests to the background thread.
    request_tx: Sender<EngineRequest>,
    /// Receiver for events from the background thread.
    event_rx: Receiver<EngineEvent>,
    status: Arc<Mutex<WorkerStatus>>,
    _thread_handle: JoinHandle<()>,
}

impl BackgroundEngine {
    /// Moves `engine` onto a worker thread.
    ///
    /// The engine's event sink is replaced by this handle's channel.
    #[must_use]
    pub fn spawn(mut engine: AddonEngine) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<EngineRequest>();
        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>();
        let status = Arc::new(Mutex::new(WorkerStatus::Idle));
        let status_clone = Arc::clone(&status);

        let sink: Arc<dyn EventSink> = Arc::new(event_tx.clone());
        engine.set_sink(sink);

        let thread_handle = thread::spawn(move || {
            info!("[ENGINE] Worker thread started");
            Self::run_loop(engine, request_rx, event_tx, status_clone);
            info!("[ENGINE] Worker thread exiting");
        });

        Self {
            request_tx,
            event_rx,
            status,
            _thread_handle: thread_handle,
        }
    }

    fn run_loop(
        mut engine: AddonEngine,
        request_rx: Receiver<EngineRequest>,
        event_tx: Sender<EngineEvent>,
        status: Arc<Mutex<WorkerStatus>>,
    ) {
        while let Ok(request) = request_rx.recv() {
            debug!("[ENGINE] Received request: {:?}", request);

            let busy = match request {
                EngineRequest::Scan => WorkerStatus::Scanning,
                EngineRequest::ResolveConflict { .. } => WorkerStatus::Resolving,
                EngineRequest::Install { .. } => WorkerStatus::Installing,
                EngineRequest::Delete { .. } => WorkerStatus::Deleting,
                EngineRequest::UpdateAll => WorkerStatus::Updating,
            };
            if let Ok(mut s) = status.lock() {
                *s = busy;
            }

            // Install reports its own failures as events.
            let result = match request {
                EngineRequest::Scan => engine.scan().map(|_| ()),
                EngineRequest::ResolveConflict { folder, id } => engine.resolve_conflict(&folder, id),
                EngineRequest::Install { id, options } => {
                    if let Err(e) = engine.install(id, options) {
                        debug!("[ENGINE] Install of {} failed: {}", id, e);
                    }
                    Ok(())
                }
                EngineRequest::Delete { folder, keep_ids } => engine.delete(&folder, &keep_ids).map(|_| ()),
                EngineRequest::UpdateAll => engine.update_all().map(|_| ()),
            };

            if let Err(e) = result {
                warn!("[ENGINE] Request failed: {}", e);
                event_tx.emit(EngineEvent::Error(e.to_string()));
            }

            if let Ok(mut s) = status.lock() {
                *s = WorkerStatus::Idle;
            }

            if event_tx.send(EngineEvent::Idle).is_err() {
                warn!("[ENGINE] Event channel closed, exiting");
                break;
            }
        }
    }

    fn send(&self, request: EngineRequest) {
        if let Err(e) = self.request_tx.send(request) {
            warn!("[ENGINE] Failed to send request: {}", e);
        }
    }

    pub fn request_scan(&self) {
        self.send(EngineRequest::Scan);
    }

    pub fn request_resolve_conflict(&self, folder: &str, id: AddonId) {
        self.send(EngineRequest::ResolveConflict {
            folder: folder.to_string(),
            id,
        });
    }

    pub fn request_install(&self, id: AddonId, options: InstallOptions) {
        self.send(EngineRequest::Install { id, options });
    }

    pub fn request_delete(&self, folder: &str, keep_ids: BTreeSet<AddonId>) {
        self.send(EngineRequest::Delete {
            folder: folder.to_string(),
            keep_ids,
        });
    }

    pub fn request_update_all(&self) {
        self.send(EngineRequest::UpdateAll);
    }

    /// Polls for an event without blocking.
    pub fn poll_event(&self) -> Option<EngineEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                warn!("[ENGINE] Event channel disconnected");
                None
            }
        }
    }

    /// Waits up to `timeout` for the next event.
    pub fn wait_event(&self, timeout: Duration) -> Option<EngineEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().map(|s| *s).unwrap_or(WorkerStatus::Idle)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.status() != WorkerStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::catalog::CatalogIndex;
    use crate::addons::download::HttpDownloader;
    use crate::addons::gateway::LocalFs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_request_round_trip() {
        let dir = TempDir::new().unwrap();
        let gw = LocalFs::new(dir.path()).unwrap();
        let engine = AddonEngine::new(Arc::new(gw), CatalogIndex::default(), Arc::new(HttpDownloader::new()));
        let worker = BackgroundEngine::spawn(engine);

        worker.request_scan();
        let first = worker.wait_event(Duration::from_secs(10)).unwrap();
        assert!(matches!(first, EngineEvent::ScanFinished { .. }));
        let second = worker.wait_event(Duration::from_secs(10)).unwrap();
        assert_eq!(second, EngineEvent::Idle);
    }

    #[test]
    fn test_failed_install_reported_once() {
        let dir = TempDir::new().unwrap();
        let gw = LocalFs::new(dir.path()).unwrap();
        let engine = AddonEngine::new(Arc::new(gw), CatalogIndex::default(), Arc::new(HttpDownloader::new()));
        let worker = BackgroundEngine::spawn(engine);

        worker.request_install(99, InstallOptions::default());
        let mut events = Vec::new();
        while let Some(event) = worker.wait_event(Duration::from_secs(10)) {
            if event == EngineEvent::Idle {
                break;
            }
            events.push(event);
        }

        let errors = events.iter().filter(|e| matches!(e, EngineEvent::Error(_))).count();
        assert_eq!(errors, 1);

        worker.request_scan();
        let next = worker.wait_event(Duration::from_secs(10)).unwrap();
        assert!(matches!(next, EngineEvent::ScanFinished { .. }));
    }
}
