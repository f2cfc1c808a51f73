use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{info, warn};

use crate::backend::BackendProvider;
use crate::{
    Address, CallbackContext, ConnectionState, GattSession, Result, SessionConfig, SharedWorker,
};

/// Keeps one [`GattSession`] per device address on top of a shared worker
///
/// Asking for the same address twice gives back the same session, so every
/// request for a device goes through that device's one queue.
pub struct Gateway {
    provider: Arc<dyn BackendProvider>,
    shared: SharedWorker,
    owns_worker: bool,
    context: Arc<dyn CallbackContext>,
    config: SessionConfig,
    sessions: DashMap<Address, GattSession>,

    // Native stacks tend to misbehave if several links are brought up at once
    connect_lock: Mutex<()>,
}

impl Gateway {
    /// Creates a gateway with its own shared worker
    pub fn new(provider: Arc<dyn BackendProvider>, context: Arc<dyn CallbackContext>,
               config: SessionConfig) -> Result<Self> {
        let mut gateway = Self::with_worker(provider, SharedWorker::start()?, context, config);
        gateway.owns_worker = true;
        Ok(gateway)
    }

    /// Creates a gateway on an existing shared worker, which it won't shut down
    pub fn with_worker(provider: Arc<dyn BackendProvider>, shared: SharedWorker,
                       context: Arc<dyn CallbackContext>, config: SessionConfig) -> Self {
        Gateway {
            provider,
            shared,
            owns_worker: false,
            context,
            config,
            sessions: DashMap::new(),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn worker(&self) -> &SharedWorker {
        &self.shared
    }

    /// The session for `address`, opening one if there isn't one yet
    pub fn session(&self, address: &Address) -> Result<GattSession> {
        match self.sessions.entry(address.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let device = self.provider.device(address)?;
                let session = GattSession::open(address.clone(), device, &self.shared,
                                                self.context.clone(), self.config.clone())?;
                info!("Opened session for {}", address);
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get(&self, address: &Address) -> Option<GattSession> {
        self.sessions.get(address).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<GattSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Connects to `address`, one device at a time
    ///
    /// Blocks, so mustn't be called from a callback running on the shared
    /// worker.
    pub fn connect(&self, address: &Address) -> Result<GattSession> {
        let _guard = self.connect_lock.lock().unwrap_or_else(|e| e.into_inner());
        let session = self.session(address)?;
        let state = session.connect().wait()?;
        if state != ConnectionState::Connected {
            warn!("Connecting to {} ended {}", address, state);
        }
        Ok(session)
    }

    /// Disconnects every session that has been connected, returning how
    /// many disconnected cleanly
    ///
    /// Failures are logged and skipped. Blocks like [`connect`](Self::connect).
    pub fn disconnect_all(&self) -> usize {
        let _guard = self.connect_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut disconnected = 0;
        for session in self.sessions() {
            if matches!(session.state(), ConnectionState::Init | ConnectionState::Disconnected) {
                continue;
            }
            match session.disconnect().wait() {
                Ok(_) => disconnected += 1,
                Err(err) => warn!("Failed to disconnect {}: {}", session.address(), err),
            }
        }
        disconnected
    }

    /// Shuts down every session, and the shared worker if the gateway
    /// started it
    pub fn shutdown(&self) {
        let sessions = self.sessions();
        self.sessions.clear();
        for session in sessions {
            session.shutdown();
        }
        if self.owns_worker {
            self.shared.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakePeripheral, FakeProvider};
    use crate::Inline;

    #[test]
    fn one_session_per_address() {
        let provider = Arc::new(FakeProvider::new());
        let a: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        provider.add(a.clone(), FakePeripheral::new());

        let gateway = Gateway::new(provider, Arc::new(Inline), SessionConfig::default()).unwrap();
        let first = gateway.session(&a).unwrap();
        let second = gateway.session(&a).unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.sessions().len(), 1);

        let unknown: Address = "AA:BB:CC:DD:EE:02".parse().unwrap();
        assert!(gateway.session(&unknown).is_err());
        assert!(gateway.get(&unknown).is_none());

        gateway.shutdown();
        assert!(gateway.sessions().is_empty());
    }
}
