use parking_lot::Mutex;
use std::collections::HashMap;

use crate::client::FlagsClient;
use crate::error::Result;

/// Shared flags clients keyed by publishable key.
///
/// Pass one registry through the application instead of relying on a
/// process-wide singleton, so tests can start from an empty registry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, FlagsClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client registered for `publishable_key`, creating it with
    /// `factory` if there is none. A factory error leaves the registry
    /// unchanged.
    pub fn get_or_insert_with<F>(&self, publishable_key: &str, factory: F) -> Result<FlagsClient>
    where
        F: FnOnce() -> Result<FlagsClient>,
    {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(publishable_key) {
            return Ok(client.clone());
        }

        let client = factory()?;
        clients.insert(publishable_key.to_string(), client.clone());
        Ok(client)
    }

    pub fn get(&self, publishable_key: &str) -> Option<FlagsClient> {
        self.clients.lock().get(publishable_key).cloned()
    }

    /// Remove and stop the client for `publishable_key`.
    pub fn remove(&self, publishable_key: &str) -> Option<FlagsClient> {
        let client = self.clients.lock().remove(publishable_key)?;
        client.stop();
        Some(client)
    }

    /// Stop and drop every registered client.
    pub fn clear(&self) {
        let clients: Vec<FlagsClient> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
