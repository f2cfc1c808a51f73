//! Adapts BLE stacks whose calls are awaitable, rather than callback driven,
//! to the [`NativeGatt`] interface
//!
//! Each native call is spawned onto the shared worker's event loop and its
//! outcome is posted to the session's event bridge, exactly the way a
//! callback driven stack would deliver it.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::backend::{CharacteristicHandle, DiscoveredCharacteristic, NativeDevice, NativeGatt, WriteType};
use crate::bridge::BridgeSender;
use crate::{Error, GattError, GattStatus, NativeConnectionState, Result};

#[async_trait]
pub trait AsyncGattStack: Send + Sync + Debug + 'static {
    /// Resolves once the link is up
    ///
    /// `events` stays valid for the connection's lifetime; stacks post
    /// unsolicited link loss and characteristic notifications to it.
    async fn connect(&self, events: BridgeSender) -> Result<()>;

    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>>;

    async fn read(&self, characteristic: &DiscoveredCharacteristic) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: &DiscoveredCharacteristic, value: Vec<u8>,
                   write_type: WriteType) -> Result<()>;

    async fn set_notify(&self, characteristic: &DiscoveredCharacteristic, enable: bool) -> Result<()>;

    async fn read_descriptor(&self, characteristic: &DiscoveredCharacteristic, descriptor: Uuid)
                             -> Result<Vec<u8>>;

    async fn write_descriptor(&self, characteristic: &DiscoveredCharacteristic, descriptor: Uuid,
                              value: Vec<u8>) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

fn status_for(err: &Error) -> GattStatus {
    match err {
        Error::Gatt(GattError::ReadNotPermitted) => GattStatus::READ_NOT_PERMITTED,
        Error::Gatt(GattError::WriteNotPermitted) => GattStatus::WRITE_NOT_PERMITTED,
        Error::Gatt(GattError::InsufficientAuthentication) => GattStatus::INSUFFICIENT_AUTHENTICATION,
        Error::Gatt(GattError::InsufficientEncryption) => GattStatus::INSUFFICIENT_ENCRYPTION,
        Error::Gatt(GattError::Unsupported) => GattStatus::REQUEST_NOT_SUPPORTED,
        Error::Gatt(GattError::InvalidOffset) => GattStatus::INVALID_OFFSET,
        Error::Gatt(GattError::InvalidAttributeLength) => GattStatus::INVALID_ATTRIBUTE_LENGTH,
        Error::Gatt(GattError::Congested) => GattStatus::CONNECTION_CONGESTED,
        _ => GattStatus::FAILURE,
    }
}

/// A [`NativeDevice`] backed by an [`AsyncGattStack`]
///
/// `runtime` should be the [`SharedWorker`](crate::SharedWorker)'s handle so
/// the stack's calls are serialized with everything else.
///
/// Characteristics found by discovery are kept on the device, so a session
/// that reconnects without discovering again can still address them.
#[derive(Debug)]
pub struct AsyncStackDevice<S> {
    stack: Arc<S>,
    runtime: Handle,
    characteristics: Arc<Mutex<Vec<DiscoveredCharacteristic>>>,
}

impl<S: AsyncGattStack> AsyncStackDevice<S> {
    pub fn new(stack: S, runtime: Handle) -> Self {
        AsyncStackDevice {
            stack: Arc::new(stack),
            runtime,
            characteristics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stack(&self) -> &Arc<S> {
        &self.stack
    }
}

impl<S: AsyncGattStack> NativeDevice for AsyncStackDevice<S> {
    fn connect(&self, events: BridgeSender) -> Result<Arc<dyn NativeGatt>> {
        let connection = Arc::new(AsyncStackConnection {
            stack: self.stack.clone(),
            runtime: self.runtime.clone(),
            events: events.clone(),
            characteristics: self.characteristics.clone(),
            closed: AtomicBool::new(false),
        });

        let stack = self.stack.clone();
        self.runtime.spawn(async move {
            match stack.connect(events.clone()).await {
                Ok(()) => events.connection_state_changed(GattStatus::SUCCESS, NativeConnectionState::Connected),
                Err(err) => {
                    warn!("Async stack failed to connect: {}", err);
                    events.connection_state_changed(status_for(&err), NativeConnectionState::Disconnected);
                }
            }
        });
        Ok(connection)
    }
}

#[derive(Debug)]
struct AsyncStackConnection<S> {
    stack: Arc<S>,
    runtime: Handle,
    events: BridgeSender,
    characteristics: Arc<Mutex<Vec<DiscoveredCharacteristic>>>,
    closed: AtomicBool,
}

impl<S: AsyncGattStack> AsyncStackConnection<S> {
    fn lookup(&self, handle: CharacteristicHandle) -> Option<DiscoveredCharacteristic> {
        let characteristics = self.characteristics.lock().unwrap_or_else(|e| e.into_inner());
        characteristics.iter().find(|c| c.handle == handle).cloned()
    }

    fn issue<F>(&self, call: F) -> bool
        where F: Future<Output = ()> + Send + 'static
    {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Refusing request on a closed async stack connection");
            return false;
        }
        self.runtime.spawn(call);
        true
    }
}

impl<S: AsyncGattStack> NativeGatt for AsyncStackConnection<S> {
    fn discover_services(&self) -> bool {
        let stack = self.stack.clone();
        let events = self.events.clone();
        let characteristics = self.characteristics.clone();
        self.issue(async move {
            match stack.discover().await {
                Ok(found) => {
                    *characteristics.lock().unwrap_or_else(|e| e.into_inner()) = found;
                    events.services_discovered(GattStatus::SUCCESS);
                }
                Err(err) => {
                    warn!("Async stack service discovery failed: {}", err);
                    events.services_discovered(status_for(&err));
                }
            }
        })
    }

    fn services(&self) -> Vec<DiscoveredCharacteristic> {
        self.characteristics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> bool {
        let characteristic = match self.lookup(handle) {
            Some(characteristic) => characteristic,
            None => return false,
        };
        let stack = self.stack.clone();
        let events = self.events.clone();
        self.issue(async move {
            match stack.read(&characteristic).await {
                Ok(value) => events.characteristic_read(characteristic.uuid, GattStatus::SUCCESS, value),
                Err(err) => events.characteristic_read(characteristic.uuid, status_for(&err), Vec::new()),
            }
        })
    }

    fn write_characteristic(&self, handle: CharacteristicHandle, value: &[u8], write_type: WriteType) -> bool {
        let characteristic = match self.lookup(handle) {
            Some(characteristic) => characteristic,
            None => return false,
        };
        let stack = self.stack.clone();
        let events = self.events.clone();
        let value = value.to_vec();
        self.issue(async move {
            let status = match stack.write(&characteristic, value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(err) => status_for(&err),
            };
            events.characteristic_written(characteristic.uuid, status);
        })
    }

    fn set_characteristic_notification(&self, handle: CharacteristicHandle, enable: bool) -> bool {
        let characteristic = match self.lookup(handle) {
            Some(characteristic) => characteristic,
            None => return false,
        };
        let stack = self.stack.clone();
        self.issue(async move {
            if let Err(err) = stack.set_notify(&characteristic, enable).await {
                warn!("Async stack failed to set notify for {}: {}", characteristic.uuid, err);
            }
        })
    }

    fn read_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid) -> bool {
        let characteristic = match self.lookup(handle) {
            Some(characteristic) => characteristic,
            None => return false,
        };
        let stack = self.stack.clone();
        let events = self.events.clone();
        self.issue(async move {
            match stack.read_descriptor(&characteristic, descriptor).await {
                Ok(value) => events.descriptor_read(descriptor, GattStatus::SUCCESS, value),
                Err(err) => events.descriptor_read(descriptor, status_for(&err), Vec::new()),
            }
        })
    }

    fn write_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid, value: &[u8]) -> bool {
        let characteristic = match self.lookup(handle) {
            Some(characteristic) => characteristic,
            None => return false,
        };
        let stack = self.stack.clone();
        let events = self.events.clone();
        let value = value.to_vec();
        self.issue(async move {
            let status = match stack.write_descriptor(&characteristic, descriptor, value).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(err) => status_for(&err),
            };
            events.descriptor_written(descriptor, status);
        })
    }

    fn disconnect(&self) {
        let stack = self.stack.clone();
        self.issue(async move {
            if let Err(err) = stack.disconnect().await {
                warn!("Async stack failed to disconnect: {}", err);
            }
        });
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
