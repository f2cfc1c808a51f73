use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

use crate::bridge::BridgeSender;
use crate::{Address, Result};

pub mod async_stack;

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    pub fn from_require_response(require_response: bool) -> Self {
        if require_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        }
    }
}

/// Opaque reference to a characteristic, only meaningful to the native
/// stack that handed it out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub properties: CharacteristicProperties,
}

/// A remote device as seen by a native BLE stack
pub trait NativeDevice: Send + Sync + Debug {
    /// Starts connecting to the device and returns the native connection
    ///
    /// This doesn't wait for the link to come up: the outcome is posted to
    /// `events` as a connection-state change, and every later completion
    /// for this connection arrives through `events` too.
    fn connect(&self, events: BridgeSender) -> Result<Arc<dyn NativeGatt>>;
}

/// The native GATT calls made on behalf of one connection
///
/// Methods returning `bool` report whether the stack accepted the request.
/// Acceptance says nothing about success: the completion is always posted
/// to the connection's [`BridgeSender`] later, possibly from another thread.
pub trait NativeGatt: Send + Sync + Debug {
    fn discover_services(&self) -> bool;

    /// The characteristics found by the last completed discovery
    fn services(&self) -> Vec<DiscoveredCharacteristic>;

    fn read_characteristic(&self, handle: CharacteristicHandle) -> bool;

    fn write_characteristic(&self, handle: CharacteristicHandle, value: &[u8], write_type: WriteType) -> bool;

    /// Enables or disables local delivery of notifications; this doesn't
    /// write the device's configuration descriptor
    fn set_characteristic_notification(&self, handle: CharacteristicHandle, enable: bool) -> bool;

    fn read_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid) -> bool;

    fn write_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid, value: &[u8]) -> bool;

    fn disconnect(&self);

    /// Releases the native connection; nothing may be called afterwards
    fn close(&self);
}

/// Builds the native device for an address
pub trait BackendProvider: Send + Sync {
    fn device(&self, address: &Address) -> Result<Arc<dyn NativeDevice>>;
}
