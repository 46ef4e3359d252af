//! Registry for device-originated message handlers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Whether a handler consumed the message. Recorded for diagnostics
/// only; routing is decided by registration order alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Handled,
    NotHandled,
}

/// Token returned by [`Dispatcher::register`]; pass it back to
/// [`Dispatcher::unregister`] to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHandle(u64);

/// Handler for one device-originated message id. Receives the payload
/// words after the id.
pub type ActionFn = dyn Fn(&[u16]) -> ActionOutcome + Send + Sync;

struct Entry {
    id: u16,
    handle: ActionHandle,
    action: Arc<ActionFn>,
}

/// Routes device-originated messages to registered handlers by id.
///
/// The first handler registered for an id owns it; later registrations
/// for the same id only take over once the earlier one unregisters.
/// Handlers run outside the registry lock, so a handler may register or
/// unregister freely.
#[derive(Default)]
pub struct Dispatcher {
    entries: Mutex<Vec<Entry>>,
    next_handle: Mutex<u64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, id: u16, action: F) -> ActionHandle
    where
        F: Fn(&[u16]) -> ActionOutcome + Send + Sync + 'static,
    {
        let handle = {
            let mut next = self.next_handle.lock();
            *next += 1;
            ActionHandle(*next)
        };
        self.entries.lock().push(Entry {
            id,
            handle,
            action: Arc::new(action),
        });
        handle
    }

    pub fn unregister(&self, handle: ActionHandle) {
        self.entries.lock().retain(|e| e.handle != handle);
    }

    /// Deliver a message to the handler owning `id`.
    pub fn dispatch(&self, id: u16, payload: &[u16]) -> ActionOutcome {
        // Clone the action out so the handler runs unlocked.
        let action = self
            .entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.action));

        match action {
            Some(action) => {
                let outcome = action(payload);
                if outcome == ActionOutcome::NotHandled {
                    warn!(id = format_args!("{id:#06x}"), "handler declined device message");
                }
                outcome
            }
            None => {
                trace!(id = format_args!("{id:#06x}"), "unhandled device message");
                ActionOutcome::NotHandled
            }
        }
    }
}
