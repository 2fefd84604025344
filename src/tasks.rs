//! Background task registry.
//!
//! Every fire-and-forget task in the process — memory extraction, log
//! persistence, timers, the HTTP surface — is spawned through the registry
//! so shutdown is deterministic: `shutdown_all` cancels every task and
//! awaits them before any shared resource is torn down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct TaskEntry {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    next_id: AtomicU64,
}

/// Cancellation handle for a single registered task.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Request cancellation of this task only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Registry id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Tracks all background tasks for the lifetime of the process.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn a cancellation-aware task. The closure receives the task's
    /// token and must observe it at its suspension points.
    ///
    /// The entry removes itself when the task finishes for any reason;
    /// insertion and removal serialize on the registry lock, so the
    /// self-removal cannot race the insert.
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let fut = f(cancel.clone());

        let Ok(mut tasks) = self.inner.tasks.lock() else {
            warn!(name, "task registry lock poisoned; running unregistered");
            let handle = TaskHandle {
                id,
                cancel: cancel.clone(),
            };
            tokio::spawn(fut);
            return handle;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            fut.await;
            if let Ok(mut tasks) = inner.tasks.lock() {
                tasks.remove(&id);
            }
        });
        tasks.insert(
            id,
            TaskEntry {
                name: name.to_owned(),
                cancel: cancel.clone(),
                handle,
            },
        );
        TaskHandle { id, cancel }
    }

    /// Spawn a future that does not inspect its token: it is raced against
    /// cancellation and dropped at its next suspension point.
    pub fn spawn_detached<Fut>(&self, name: &str, fut: Fut) -> TaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, move |token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = fut => {}
            }
        })
    }

    /// Number of live background tasks.
    pub fn count(&self) -> usize {
        self.inner.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Cancel every task and await them all, suppressing errors. After
    /// this returns the registry is empty and no registered task will
    /// touch shared resources again.
    pub async fn shutdown_all(&self) {
        let entries: Vec<TaskEntry> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };

        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            let name = entry.name;
            if let Err(e) = entry.handle.await
                && !e.is_cancelled()
            {
                warn!(name, "background task ended with error: {e}");
            }
            debug!(name, "background task reaped");
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn completed_task_removes_itself() {
        let registry = TaskRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.spawn_detached("quick", async move {
            let _ = tx.send(());
        });

        rx.await.unwrap();
        // Give the wrapper a beat to run its removal.
        tokio::task::yield_now().await;
        for _ in 0..100 {
            if registry.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_empties() {
        let registry = TaskRegistry::new();
        for i in 0..4 {
            registry.spawn(&format!("sleeper-{i}"), |token| async move {
                token.cancelled().await;
            });
        }
        assert_eq!(registry.count(), 4);

        tokio::time::timeout(Duration::from_millis(200), registry.shutdown_all())
            .await
            .expect("shutdown must finish promptly");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn detached_future_dropped_on_cancel() {
        let registry = TaskRegistry::new();
        let (_tx, rx) = oneshot::channel::<()>();
        registry.spawn_detached("forever", async move {
            // Never resolves on its own; only cancellation ends it.
            let _ = rx.await;
        });

        tokio::time::timeout(Duration::from_millis(200), registry.shutdown_all())
            .await
            .expect("detached task must be droppable");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn individual_handle_cancels_one_task() {
        let registry = TaskRegistry::new();
        let keeper = registry.spawn("keeper", |token| async move {
            token.cancelled().await;
        });
        let victim = registry.spawn("victim", |token| async move {
            token.cancelled().await;
        });

        victim.cancel();
        for _ in 0..100 {
            if registry.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(registry.count(), 1);

        keeper.cancel();
        registry.shutdown_all().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn panicking_task_is_suppressed() {
        let registry = TaskRegistry::new();
        registry.spawn_detached("bad", async {
            panic!("background failure");
        });
        // Must not propagate the panic.
        registry.shutdown_all().await;
        assert_eq!(registry.count(), 0);
    }
}
