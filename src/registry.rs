use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::error::{PDError, PDResult};
use crate::io_struct::PDResponse;

pub type ResponseReceiver = mpsc::UnboundedReceiver<PDResponse>;

struct RegistryEntry {
    generation: u64,
    queue: mpsc::UnboundedSender<PDResponse>,
}

/// Why a response could not be delivered.
#[derive(Debug)]
pub enum RouteError {
    /// No in-flight request with this id (finished, abandoned, never sent).
    UnknownRequest(PDResponse),
    /// The entry exists but its consumer is gone.
    Abandoned(PDResponse),
}

/// Maps request ids to the response queue of the in-flight `generate` call.
pub struct RequestRegistry {
    queues: DashMap<String, RegistryEntry>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl RequestRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Create the entry for `request_id`. The entry lives as long as the
    /// returned guard.
    pub fn register(
        self: &Arc<Self>,
        request_id: &str,
    ) -> PDResult<(RegistrationGuard, ResponseReceiver)> {
        if self.is_closed() {
            return Err(PDError::ShutDown);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        match self.queues.entry(request_id.to_string()) {
            Entry::Occupied(_) => return Err(PDError::DuplicateRequest(request_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    generation,
                    queue: tx,
                });
            }
        }
        let guard = RegistrationGuard {
            registry: self.clone(),
            request_id: request_id.to_string(),
            generation,
        };
        // Lost a race with close_all(); the guard drops the entry again.
        if self.is_closed() {
            return Err(PDError::ShutDown);
        }
        Ok((guard, rx))
    }

    /// Push a response onto its request's queue without blocking.
    pub fn route(&self, response: PDResponse) -> Result<(), RouteError> {
        let Some(entry) = self.queues.get(&response.request_id) else {
            return Err(RouteError::UnknownRequest(response));
        };
        entry
            .queue
            .send(response)
            .map_err(|e| RouteError::Abandoned(e.0))
    }

    /// Drop every entry and refuse new registrations. Waiting consumers see
    /// their queue close. Returns how many requests were still registered.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let pending = self.queues.len();
        self.queues.clear();
        pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.queues.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Removes the registry entry it was created with when dropped.
pub struct RegistrationGuard {
    registry: Arc<RequestRegistry>,
    request_id: String,
    generation: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        // Only our own entry: the id may have been re-registered after close_all().
        self.registry
            .queues
            .remove_if(&self.request_id, |_, entry| entry.generation == self.generation);
    }
}
