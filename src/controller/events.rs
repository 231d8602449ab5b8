//! Stream lifecycle events and the listener registry.
//!
//! The controller dispatches a `650 STREAM` line to every registered
//! listener as soon as the background reader thread decodes it. Ting
//! relies on this to steer a freshly opened SOCKS stream onto a specific
//! circuit before the daemon auto-attaches it anywhere.

use std::sync::Arc;
use crate::utils::sync::Mutex;

/// The subset of stream status values the engine cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    New,
    SentConnect,
    RemapAddr,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Other,
}

impl StreamStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" | "NEWRESOLVE" => StreamStatus::New,
            "SENTCONNECT" | "SENTRESOLVE" => StreamStatus::SentConnect,
            "REMAP" => StreamStatus::RemapAddr,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            "DETACHED" => StreamStatus::Detached,
            _ => StreamStatus::Other,
        }
    }
}

/// A decoded `650 STREAM` event.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub stream_id: u64,
    pub status: StreamStatus,
    pub purpose_is_user: bool,
}

type Listener = dyn Fn(&StreamEvent) + Send + Sync;

struct Entry {
    id: u64,
    listener: Arc<Listener>,
}

/// Holds the set of currently registered stream listeners.
#[derive(Default)]
pub struct StreamListeners {
    entries: Mutex<Vec<Entry>>,
    next_id: Mutex<u64>,
}

/// A registration handle. Dropping it does *not* remove the listener;
/// callers must explicitly call
/// [`Controller::remove_stream_listener`][crate::controller::Controller::remove_stream_listener].
#[derive(Clone, Copy, Debug)]
pub struct ListenerHandle(u64);

impl StreamListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self, listener: impl Fn(&StreamEvent) + Send + Sync + 'static
    ) -> ListenerHandle {
        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        self.entries.lock().push(Entry { id, listener: Arc::new(listener) });
        ListenerHandle(id)
    }

    pub fn remove(&self, handle: ListenerHandle) {
        self.entries.lock().retain(|entry| entry.id != handle.0);
    }

    /// Calls every registered listener with the event, in registration
    /// order. Listeners must not block for long: they run on the
    /// controller's background reader thread.
    pub fn dispatch(&self, event: &StreamEvent) {
        let listeners: Vec<_> = self.entries.lock().iter()
            .map(|entry| entry.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_reaches_all_listeners_until_removed() {
        let listeners = StreamListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handle = listeners.add(move |_| { calls2.fetch_add(1, Ordering::SeqCst); });

        let event = StreamEvent {
            stream_id: 1, status: StreamStatus::New, purpose_is_user: true
        };
        listeners.dispatch(&event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        listeners.remove(handle);
        listeners.dispatch(&event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
