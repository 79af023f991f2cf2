// SPDX-License-Identifier: MPL-2.0

//! Shared async runtime for hosts that drive the engine from synchronous
//! code (UI event loops, the replay binary).
//!
//! Every engine operation is async, and change events are only applied
//! while something polls [`SyncEngine::run_until`]. A host without its own
//! executor calls operations through [`block_on`] and keeps the change
//! stream flowing with [`spawn_event_loop`].

use crate::engine::SyncEngine;
use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Two workers: the engine is I/O bound and serializes on its state lock.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("ecoquest-sync")
        .build()
        .expect("failed to create async runtime")
});

/// Execute a future on the shared runtime, blocking until completion.
///
/// Panics when called from inside an async context.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}

/// Spawn a future on the shared runtime without blocking.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    RUNTIME.spawn(future)
}

/// The engine's change handling running in the background.
///
/// Dropping it stops the loop without waiting for it.
pub struct EventLoop {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop handling events and wait for the loop to return.
    pub fn shutdown(mut self) {
        self.signal();
        if let Some(handle) = self.handle.take()
            && let Err(e) = block_on(handle)
        {
            warn!(error = %e, "event loop task failed");
        }
    }

    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Apply change events for `engine` on the shared runtime until the
/// returned handle is shut down or the engine stops.
pub fn spawn_event_loop(engine: Arc<SyncEngine>) -> EventLoop {
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = spawn(async move {
        engine
            .run_until(async move {
                let _ = stopped.await;
            })
            .await;
        debug!("background event loop exited");
    });
    EventLoop {
        stop: Some(stop),
        handle: Some(handle),
    }
}
