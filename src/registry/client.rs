use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::{Epoch, RegistrationStatus};
use crate::control::ClientUid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub uid: ClientUid,
    pub status: RegistrationStatus,
}

#[derive(Debug)]
struct ClientEntry {
    client: Client,
    epoch: Epoch,
}

#[derive(Debug, Default)]
struct ClientState {
    clients: HashMap<ClientUid, ClientEntry>,
    next_epoch: Epoch,
}

/// Registered clients. Clients carry no configuration of their own.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    state: Mutex<ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `uid`, replacing any existing record.
    pub fn register(&self, uid: &str) -> Epoch {
        let mut state = self.state.lock();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let previous = state.clients.insert(
            uid.to_string(),
            ClientEntry {
                client: Client {
                    uid: uid.to_string(),
                    status: RegistrationStatus::Registered,
                },
                epoch,
            },
        );
        if previous.is_some() {
            error!(client_uid = %uid, "reregistering an already registered client");
        } else {
            debug!(client_uid = %uid, "client registered");
        }
        epoch
    }

    /// Removes `uid`; unknown clients are ignored.
    pub fn deregister(&self, uid: &str) {
        if self.state.lock().clients.remove(uid).is_none() {
            debug!(client_uid = %uid, "deregistering unknown client");
        }
    }

    /// Removes `uid` only if `epoch` is still its latest registration.
    pub fn release(&self, uid: &str, epoch: Epoch) -> bool {
        let mut state = self.state.lock();
        match state.clients.get(uid) {
            Some(entry) if entry.epoch == epoch => {
                state.clients.remove(uid);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, uid: &str) -> Option<Client> {
        self.state
            .lock()
            .clients
            .get(uid)
            .map(|entry| entry.client.clone())
    }

    pub fn clients(&self) -> Vec<Client> {
        self.state
            .lock()
            .clients
            .values()
            .map(|entry| entry.client.clone())
            .collect()
    }
}
