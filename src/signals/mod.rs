//! Signal-driven cleanup registry
//!
//! SIGINT/SIGTERM are intercepted once per process and dispatched to an
//! ordered handler list. Handlers run newest-first (LIFO); a handler
//! returning `true` consumes the signal and stops the walk. Cleanup
//! handlers registered last therefore run first, and the box-cleanup
//! handler exits the process when it is done.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// An async signal handler; returns true to consume the signal
pub type SignalHandler = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Entry {
    id: u64,
    handler: SignalHandler,
}

/// Ordered, mutex-protected handler list.
///
/// The process-global instance is reached through [`SignalRegistry::global`];
/// tests construct their own instances and fire them directly.
#[derive(Clone)]
pub struct SignalRegistry {
    entries: Arc<Mutex<Vec<Entry>>>,
    next_id: Arc<AtomicU64>,
    installed: Arc<AtomicBool>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            installed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static SignalRegistry {
        static GLOBAL: OnceLock<SignalRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SignalRegistry::new)
    }

    /// Register a handler; the returned guard deregisters on drop
    pub fn add<F>(&self, handler: F) -> SignalGuard
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(Entry {
            id,
            handler: Arc::new(handler),
        });
        SignalGuard {
            registry: self.clone(),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Run handlers LIFO until one consumes the signal
    pub async fn fire(&self) {
        let handlers: Vec<SignalHandler> = {
            let entries = self.entries.lock();
            entries.iter().rev().map(|e| e.handler.clone()).collect()
        };

        for handler in handlers {
            if handler().await {
                debug!("Signal consumed by handler");
                return;
            }
        }
        warn!("Signal fell through all handlers");
    }

    /// Start the SIGINT/SIGTERM listener task; idempotent
    pub fn install(&self) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGINT handler: {}", e);
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = interrupt.recv() => {
                        warn!("Interrupt received, running cleanup handlers");
                        registry.fire().await;
                    }
                    _ = terminate.recv() => {
                        warn!("Termination requested, running cleanup handlers");
                        registry.fire().await;
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregisters its handler when dropped
pub struct SignalGuard {
    registry: SignalRegistry,
    id: u64,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_handlers_run_lifo_until_consumed() {
        let registry = SignalRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _first = registry.add(move || {
            let o = o.clone();
            Box::pin(async move {
                o.lock().push("first");
                false
            })
        });

        let o = order.clone();
        let _second = registry.add(move || {
            let o = o.clone();
            Box::pin(async move {
                o.lock().push("second");
                true
            })
        });

        let o = order.clone();
        let _third = registry.add(move || {
            let o = o.clone();
            Box::pin(async move {
                o.lock().push("third");
                false
            })
        });

        registry.fire().await;

        // third (newest) ran first, second consumed, first never ran
        assert_eq!(*order.lock(), vec!["third", "second"]);
    }

    #[tokio::test]
    async fn test_guard_removes_handler() {
        let registry = SignalRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            let _guard = registry.add(move || {
                let count = count.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    true
                })
            });
            assert_eq!(registry.len(), 1);
        }

        assert_eq!(registry.len(), 0);
        registry.fire().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
