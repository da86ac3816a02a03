//! Subscription tables shared by the event, data and debug dispatchers.
//!
//! Register/unregister take the table lock briefly. Dispatch snapshots the
//! matching entries under that lock and invokes them after releasing it, so a
//! callback may register or unregister (itself included) without deadlocking.
//!
//! Each entry carries its own mutex and an `active` flag. The flag is checked
//! while holding the entry's mutex, which gives unregister its guarantee:
//! once it returns, the callback will not be entered again.
//!
//! Callbacks run on whichever thread dispatches (debug callbacks also run on
//! the sending thread). A per-thread list of the entries being invoked keeps
//! re-entrant dispatch and unregister from relocking an entry the same thread
//! already holds.

use core::cell::RefCell;
use core::fmt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

thread_local! {
    /// Addresses of the entries this thread is invoking, innermost last.
    static INVOKING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// `true` while the current thread is inside any registered callback.
pub(crate) fn in_callback() -> bool {
    INVOKING.with(|invoking| !invoking.borrow().is_empty())
}

fn entry_key<T>(callback: &Arc<T>) -> usize {
    Arc::as_ptr(callback) as usize
}

fn invoking_on_this_thread(key: usize) -> bool {
    INVOKING.with(|invoking| invoking.borrow().contains(&key))
}

/// Marks an entry as running on this thread until dropped.
struct InvocationGuard(usize);

impl InvocationGuard {
    fn enter(key: usize) -> Self {
        INVOKING.with(|invoking| invoking.borrow_mut().push(key));
        Self(key)
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        INVOKING.with(|invoking| {
            let mut invoking = invoking.borrow_mut();
            if let Some(pos) = invoking.iter().rposition(|&k| k == self.0) {
                invoking.remove(pos);
            }
        });
    }
}

/// Handle returned by every `register_*` call.
///
/// Identifiers come from one counter per [`crate::Stack`], so an id names
/// exactly one subscription regardless of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u32);

impl CallbackId {
    /// Numeric value, unique within one stack.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source. Starts at 1.
#[derive(Debug)]
pub(crate) struct CallbackIds(AtomicU32);

impl CallbackIds {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub(crate) fn next(&self) -> CallbackId {
        CallbackId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry<C: ?Sized, F> {
    id: CallbackId,
    filter: F,
    callback: Arc<Mutex<Box<C>>>,
    active: Arc<AtomicBool>,
}

/// Snapshot of one matching entry, taken under the table lock.
struct Armed<C: ?Sized> {
    id: CallbackId,
    callback: Arc<Mutex<Box<C>>>,
    active: Arc<AtomicBool>,
}

/// Ordered table of `(id, filter, callback)` entries.
pub(crate) struct CallbackRegistry<C: ?Sized, F> {
    kind: &'static str,
    entries: Mutex<Vec<Entry<C, F>>>,
}

impl<C: ?Sized, F> CallbackRegistry<C, F> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append a subscription; dispatch order is registration order.
    pub(crate) fn register(&self, id: CallbackId, filter: F, callback: Box<C>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                id,
                filter,
                callback: Arc::new(Mutex::new(callback)),
                active: Arc::new(AtomicBool::new(true)),
            });
        tracing::debug!(kind = self.kind, %id, "callback registered");
    }

    /// Remove `id`. Returns `false` when this table does not hold it.
    ///
    /// With `wait_for_invocation`, blocks until an invocation running on
    /// another thread has returned. Callers on the dispatch thread pass
    /// `false`: any invocation in progress there is their own caller. The
    /// wait is also skipped when the current thread is itself inside a
    /// callback.
    pub(crate) fn unregister(&self, id: CallbackId, wait_for_invocation: bool) -> bool {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .position(|e| e.id == id)
                .map(|idx| entries.remove(idx))
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.active.store(false, Ordering::Release);
        if wait_for_invocation && !in_callback() {
            drop(entry.callback.lock().unwrap_or_else(PoisonError::into_inner));
        }
        tracing::debug!(kind = self.kind, %id, "callback unregistered");
        true
    }

    /// Remove every subscription.
    pub(crate) fn clear(&self) {
        let drained: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for entry in &drained {
            entry.active.store(false, Ordering::Release);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Invoke every active entry whose filter satisfies `matches`, in order.
    ///
    /// Panics escaping a callback are caught and logged. Returns the number
    /// of callbacks that ran.
    pub(crate) fn dispatch(
        &self,
        mut matches: impl FnMut(&F) -> bool,
        mut invoke: impl FnMut(&mut C),
    ) -> usize {
        let armed: Vec<Armed<C>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| matches(&e.filter))
            .map(|e| Armed {
                id: e.id,
                callback: Arc::clone(&e.callback),
                active: Arc::clone(&e.active),
            })
            .collect();

        let mut ran = 0usize;
        for entry in armed {
            let key = entry_key(&entry.callback);
            if invoking_on_this_thread(key) {
                tracing::trace!(kind = self.kind, id = %entry.id, "skipping re-entrant invocation");
                continue;
            }
            let mut callback = entry.callback.lock().unwrap_or_else(PoisonError::into_inner);
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = {
                let _running = InvocationGuard::enter(key);
                panic::catch_unwind(AssertUnwindSafe(|| invoke(&mut **callback)))
            };
            ran = ran.saturating_add(1);
            if let Err(payload) = outcome {
                tracing::error!(
                    kind = self.kind,
                    id = %entry.id,
                    panic = panic_message(payload.as_ref()),
                    "callback panicked; dispatch continues"
                );
            }
        }
        ran
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
#[allow(clippy::panic)] // a panicking callback is the case under test
mod tests {
    use super::*;

    type Probe = dyn FnMut(u32) + Send;

    fn counter() -> (Arc<AtomicU32>, Box<Probe>) {
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        (
            hits,
            Box::new(move |n: u32| {
                seen.fetch_add(n, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn ids_are_monotonic() {
        let ids = CallbackIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a.raw(), 1);
        assert!(b > a);
    }

    #[test]
    fn dispatch_respects_filter() {
        let ids = CallbackIds::new();
        let registry: CallbackRegistry<Probe, u8> = CallbackRegistry::new("test");
        let (hits_a, a) = counter();
        let (hits_b, b) = counter();
        registry.register(ids.next(), 1, a);
        registry.register(ids.next(), 2, b);

        let ran = registry.dispatch(|f| *f == 1, |cb| cb(1));
        assert_eq!(ran, 1);
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_entry_is_skipped() {
        let ids = CallbackIds::new();
        let registry: CallbackRegistry<Probe, ()> = CallbackRegistry::new("test");
        let (hits, cb) = counter();
        let id = ids.next();
        registry.register(id, (), cb);
        assert!(registry.unregister(id, true));
        assert!(!registry.unregister(id, true));
        assert_eq!(registry.dispatch(|()| true, |cb| cb(1)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_stop_dispatch() {
        let ids = CallbackIds::new();
        let registry: CallbackRegistry<Probe, ()> = CallbackRegistry::new("test");
        registry.register(ids.next(), (), Box::new(|_: u32| panic!("boom")));
        let (hits, cb) = counter();
        registry.register(ids.next(), (), cb);

        assert_eq!(registry.dispatch(|()| true, |cb| cb(1)), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_dispatch_skips_the_running_entry() {
        let ids = CallbackIds::new();
        let registry: Arc<CallbackRegistry<Probe, ()>> = Arc::new(CallbackRegistry::new("test"));
        let inner_runs = Arc::new(AtomicU32::new(0));
        {
            let weak = Arc::downgrade(&registry);
            let inner_runs = Arc::clone(&inner_runs);
            registry.register(
                ids.next(),
                (),
                Box::new(move |depth: u32| {
                    if depth == 0 {
                        if let Some(registry) = weak.upgrade() {
                            let ran = registry.dispatch(|()| true, |cb| cb(1));
                            inner_runs.store(u32::try_from(ran).unwrap_or(u32::MAX), Ordering::SeqCst);
                        }
                    }
                }),
            );
        }
        assert_eq!(registry.dispatch(|()| true, |cb| cb(0)), 1);
        assert_eq!(inner_runs.load(Ordering::SeqCst), 0);
        assert!(!in_callback());
    }

    #[test]
    fn unregister_inside_a_callback_does_not_wait_for_itself() {
        let ids = CallbackIds::new();
        let registry: Arc<CallbackRegistry<Probe, ()>> = Arc::new(CallbackRegistry::new("test"));
        let id = ids.next();
        let weak = Arc::downgrade(&registry);
        registry.register(
            id,
            (),
            Box::new(move |_: u32| {
                if let Some(registry) = weak.upgrade() {
                    assert!(registry.unregister(id, true));
                }
            }),
        );
        assert_eq!(registry.dispatch(|()| true, |cb| cb(0)), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn clear_empties_table() {
        let ids = CallbackIds::new();
        let registry: CallbackRegistry<Probe, ()> = CallbackRegistry::new("test");
        let (_, cb) = counter();
        registry.register(ids.next(), (), cb);
        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
