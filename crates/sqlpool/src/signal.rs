//! One-shot callback lists backing `on_close`, `on_commit` and `on_rollback`.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

// `None` once completed.
type Entries = Mutex<Option<Vec<Entry>>>;

enum Entry {
    Callback(Callback),
    // Completes another signal if it is still around.
    Forward(Weak<Entries>),
}

impl Entry {
    /// Whether running this entry could still have an effect.
    fn is_live(&self) -> bool {
        match self {
            Self::Callback(_) => true,
            Self::Forward(target) => target
                .upgrade()
                .is_some_and(|target| target.lock().is_some()),
        }
    }

    fn run(self) {
        match self {
            Self::Callback(callback) => callback(),
            Self::Forward(target) => {
                if let Some(callbacks) = target.upgrade() {
                    Signal { callbacks }.complete();
                }
            }
        }
    }
}

/// A one-shot event with registered callbacks.
///
/// Callbacks registered before [`complete`](Self::complete) run when it is
/// called; callbacks registered afterwards run immediately. Clones share the
/// same event.
#[derive(Clone)]
pub struct Signal {
    callbacks: Arc<Entries>,
}

impl Signal {
    /// Create a pending signal.
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Whether the signal has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.callbacks.lock().is_none()
    }

    /// Register a callback.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        self.register(Entry::Callback(Box::new(callback)));
    }

    /// Complete `target` when this signal completes.
    ///
    /// `target` is held weakly: the registration is dropped once `target`
    /// completes on its own or is dropped, so short-lived targets do not
    /// accumulate on a long-lived signal.
    pub fn forward_to(&self, target: &Signal) {
        self.register(Entry::Forward(Arc::downgrade(&target.callbacks)));
    }

    fn register(&self, entry: Entry) {
        let mut callbacks = self.callbacks.lock();
        match callbacks.as_mut() {
            Some(pending) => {
                pending.retain(Entry::is_live);
                pending.push(entry);
            }
            None => {
                drop(callbacks);
                entry.run();
            }
        }
    }

    /// Complete the signal, running every registered callback.
    ///
    /// Returns `false` if the signal had already completed.
    pub fn complete(&self) -> bool {
        let Some(pending) = self.callbacks.lock().take() else {
            return false;
        };
        for entry in pending {
            entry.run();
        }
        true
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.callbacks.lock().as_ref().map_or(0, Vec::len)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("complete", &self.is_complete())
            .finish()
    }
}
