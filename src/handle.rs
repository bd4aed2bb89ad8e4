//! The binding between registered I/O sources and their managed owners.
//!
//! Readiness events surface from the poll as a bare [`Token`]. The handle
//! table is the explicit cross-reference that resolves a token back to the
//! object that owns the source: an owner is pinned into the table when its
//! source is registered and unpinned exactly once, at close confirmation.
//! Close is a two-phase protocol, `mark_closing` (requested, any thread)
//! followed by `unpin` (confirmed, loop thread), because a source is not
//! free for reuse until the loop has stopped dispatching to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::Token;

/// A managed owner reachable from readiness events.
///
/// Implementations must tolerate being invoked only from the owning
/// reactor's loop thread; the table never dispatches from anywhere else.
pub(crate) trait EventSink: Send + Sync {
    /// A readiness event arrived for the owner's source.
    fn on_ready(&self, readable: bool, writable: bool);

    /// The owner's entry has been unpinned; the binding is gone. Invoked at
    /// most once, after the last `on_ready`.
    fn close_completed(&self) {}
}

struct Entry {
    sink: Arc<dyn EventSink>,
    /// Whether this handle holds the loop open. Internal handles (the
    /// wakeup source, dispatcher pipe endpoints) do not.
    keep_alive: bool,
    closing: bool,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    entries: Mutex<HashMap<usize, Entry>>,
    next_token: AtomicUsize,
}

impl HandleTable {
    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Pins `sink` under `token`. The caller registers the source with the
    /// poll afterwards and must unpin again if that registration fails.
    pub(crate) fn pin(&self, token: Token, sink: Arc<dyn EventSink>, keep_alive: bool) {
        let mut entries = self.entries.lock().unwrap();
        let previous = entries.insert(
            token.0,
            Entry {
                sink,
                keep_alive,
                closing: false,
            },
        );
        debug_assert!(previous.is_none(), "token {} pinned twice", token.0);
    }

    /// Resolves a token to its pinned owner. Entries with a close request
    /// pending no longer receive events.
    pub(crate) fn get(&self, token: Token) -> Option<Arc<dyn EventSink>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&token.0)
            .filter(|e| !e.closing)
            .map(|e| Arc::clone(&e.sink))
    }

    /// Phase one of close. Returns `false` if the entry is gone or a close
    /// was already requested, making close requests idempotent.
    pub(crate) fn mark_closing(&self, token: Token) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&token.0) {
            Some(entry) if !entry.closing => {
                entry.closing = true;
                true
            }
            _ => false,
        }
    }

    /// Phase two of close: releases the pin. The entry can only be removed
    /// once; a second call returns `None`.
    pub(crate) fn unpin(&self, token: Token) -> Option<Arc<dyn EventSink>> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&token.0).map(|e| e.sink)
    }

    /// Flips whether a handle keeps the loop alive. Used for handles that
    /// should stop holding the loop open once no further events are expected.
    pub(crate) fn set_keep_alive(&self, token: Token, keep_alive: bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&token.0) {
            entry.keep_alive = keep_alive;
        }
    }

    /// Number of handles currently holding the loop open.
    pub(crate) fn active_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.keep_alive).count()
    }

    /// Removes every entry, returning the owners so the loop can notify them
    /// during terminal teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn EventSink>> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain().map(|(_, e)| e.sink).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Recorder {
        ready: AtomicUsize,
        closed: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl EventSink for Recorder {
        fn on_ready(&self, _readable: bool, _writable: bool) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn close_completed(&self) {
            assert!(!self.closed.swap(true, Ordering::SeqCst));
        }
    }

    #[test]
    fn tokens_are_unique() {
        let table = HandleTable::default();
        let a = table.next_token();
        let b = table.next_token();
        assert_ne!(a, b);
    }

    #[test]
    fn close_is_two_phase_and_idempotent() {
        let table = HandleTable::default();
        let token = table.next_token();
        let sink = Recorder::new();
        table.pin(token, sink.clone(), true);

        assert!(table.get(token).is_some());
        assert!(table.mark_closing(token));
        // A second request is a no-op.
        assert!(!table.mark_closing(token));
        // No more events reach a closing entry.
        assert!(table.get(token).is_none());

        let owner = table.unpin(token).expect("still pinned");
        owner.close_completed();
        assert!(table.unpin(token).is_none());
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn keep_alive_toggles_active_count() {
        let table = HandleTable::default();
        let token = table.next_token();
        table.pin(token, Recorder::new(), true);
        assert_eq!(table.active_count(), 1);

        table.set_keep_alive(token, false);
        assert_eq!(table.active_count(), 0);

        let internal = table.next_token();
        table.pin(internal, Recorder::new(), false);
        assert_eq!(table.active_count(), 0);
    }
}
