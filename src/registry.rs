use crate::client::{ClientCommand, ClientSession};
use crate::frame::OpCode;
use crate::worker::WorkerCommand;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Unique per-process client identifier, assigned monotonically from 1.
pub type ClientId = u32;

pub(crate) struct ClientEntry {
    pub worker: usize,
    pub control: UnboundedSender<ClientCommand>,
    /// The session itself, parked here between registration and the owning
    /// worker claiming it. Commands carry only the client ID; the worker
    /// resolves the ID through the registry, so no session state ever
    /// travels through a channel.
    pub pending: Option<Box<ClientSession>>,
}

struct RegistryInner {
    clients: HashMap<ClientId, ClientEntry>,
    client_id_counter: ClientId,
    active_clients: usize,
    /// Clients currently assigned to each worker. Lives under the same
    /// lock as the registry so least-loaded selection and the counter
    /// pre-increment are one atomic step.
    worker_load: Vec<usize>,
}

/// The global client registry: ID allocation, ID -> client resolution and
/// worker load accounting, all under one lock. It also fans broadcasts out
/// to the workers, so both the server handle and protocol handlers can
/// reach every open client.
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    broadcasters: Mutex<Vec<UnboundedSender<WorkerCommand>>>,
}

impl Registry {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                clients: HashMap::new(),
                client_id_counter: 0,
                active_clients: 0,
                worker_load: vec![0; workers],
            }),
            broadcasters: Mutex::new(Vec::new()),
        }
    }

    /// Wire up the worker command channels once the pool is running.
    pub fn set_broadcasters(&self, senders: Vec<UnboundedSender<WorkerCommand>>) {
        *self.broadcasters.lock().unwrap() = senders;
    }

    /// Deliver a message to every open client on every worker.
    pub fn broadcast(&self, payload: Vec<u8>, opcode: OpCode) {
        for sender in self.broadcasters.lock().unwrap().iter() {
            let _ = sender.send(WorkerCommand::Broadcast {
                opcode,
                payload: payload.clone(),
            });
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        let mut inner = self.inner.lock().unwrap();
        inner.client_id_counter += 1;
        inner.client_id_counter
    }

    /// Pick the least-loaded worker and pre-increment its count, so
    /// concurrent assignments spread out instead of herding onto the same
    /// worker.
    pub fn assign_worker(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .worker_load
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(index, _)| index)
            .unwrap_or(0);
        inner.worker_load[slot] += 1;
        slot
    }

    /// Roll back a pre-incremented worker count after a failed assignment.
    pub fn release_worker_slot(&self, worker: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.worker_load[worker] > 0 {
            inner.worker_load[worker] -= 1;
        }
    }

    pub fn register(&self, id: ClientId, entry: ClientEntry) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.clients.contains_key(&id) {
            return false;
        }
        inner.clients.insert(id, entry);
        inner.active_clients += 1;
        debug!(
            "client {id} registered, total clients: {}",
            inner.active_clients
        );
        true
    }

    /// Remove a client and release its worker slot. Safe to call more than
    /// once; only the first call has an effect.
    pub fn unregister(&self, id: ClientId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.clients.remove(&id) {
            if inner.active_clients > 0 {
                inner.active_clients -= 1;
            }
            if inner.worker_load[entry.worker] > 0 {
                inner.worker_load[entry.worker] -= 1;
            }
            debug!(
                "client {id} unregistered, total clients: {}",
                inner.active_clients
            );
        }
    }

    /// Claim the parked session for a client, done by the owning worker
    /// when it processes the AddClient command.
    pub fn take_pending(&self, id: ClientId) -> Option<Box<ClientSession>> {
        let mut inner = self.inner.lock().unwrap();
        inner.clients.get_mut(&id).and_then(|entry| entry.pending.take())
    }

    /// Control channel for a client, if it is still registered.
    pub fn control(&self, id: ClientId) -> Option<UnboundedSender<ClientCommand>> {
        let inner = self.inner.lock().unwrap();
        inner.clients.get(&id).map(|entry| entry.control.clone())
    }

    pub fn worker_of(&self, id: ClientId) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.clients.get(&id).map(|entry| entry.worker)
    }

    pub fn active_clients(&self) -> usize {
        self.inner.lock().unwrap().active_clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn entry(worker: usize) -> ClientEntry {
        let (control, _rx) = unbounded_channel();
        ClientEntry {
            worker,
            control,
            pending: None,
        }
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let registry = Registry::new(2);
        assert_eq!(registry.next_client_id(), 1);
        assert_eq!(registry.next_client_id(), 2);
        assert_eq!(registry.next_client_id(), 3);
    }

    #[test]
    fn test_least_loaded_assignment() {
        let registry = Registry::new(2);
        assert_eq!(registry.assign_worker(), 0);
        assert_eq!(registry.assign_worker(), 1);
        // both loaded equally, first wins again
        assert_eq!(registry.assign_worker(), 0);

        registry.release_worker_slot(1);
        assert_eq!(registry.assign_worker(), 1);
    }

    #[test]
    fn test_register_unregister_accounting() {
        let registry = Registry::new(2);
        let worker = registry.assign_worker();
        let id = registry.next_client_id();

        assert!(registry.register(id, entry(worker)));
        assert!(!registry.register(id, entry(worker)));
        assert_eq!(registry.active_clients(), 1);
        assert!(registry.control(id).is_some());
        assert_eq!(registry.worker_of(id), Some(worker));

        registry.unregister(id);
        assert_eq!(registry.active_clients(), 0);
        assert!(registry.control(id).is_none());
        // idempotent
        registry.unregister(id);
        assert_eq!(registry.active_clients(), 0);

        // the slot freed by unregister is reused
        assert_eq!(registry.assign_worker(), worker);
    }
}
