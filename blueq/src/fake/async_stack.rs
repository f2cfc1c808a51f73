use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::backend::async_stack::AsyncGattStack;
use crate::backend::{CharacteristicHandle, CharacteristicProperties, DiscoveredCharacteristic, WriteType};
use crate::bridge::BridgeSender;
use crate::fake::FakeCall;
use crate::{Error, GattError, GattStatus, NativeConnectionState, Result};

#[derive(Debug, Default)]
struct StackState {
    characteristics: Vec<(DiscoveredCharacteristic, Vec<u8>)>,
    calls: Vec<FakeCall>,
    events: Option<BridgeSender>,
    connected: bool,
}

/// An awaitable BLE stack that lives in memory
///
/// Every call takes `latency` to complete, which gives a test time to
/// observe requests queueing up behind each other.
#[derive(Clone, Debug, Default)]
pub struct FakeAsyncStack {
    state: Arc<Mutex<StackState>>,
    latency: Duration,
}

impl FakeAsyncStack {
    pub fn new(latency: Duration) -> Self {
        FakeAsyncStack { latency, ..Default::default() }
    }

    pub fn with_characteristic(self, uuid: Uuid, properties: CharacteristicProperties, value: &[u8]) -> Self {
        {
            let mut state = self.lock();
            let handle = CharacteristicHandle(state.characteristics.len() as u32 + 1);
            let info = DiscoveredCharacteristic {
                service: crate::uuid::uuid_from_u16(0x180a),
                uuid,
                handle,
                properties,
            };
            state.characteristics.push((info, value.to_vec()));
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: FakeCall) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.connected {
            Ok(())
        } else {
            Err(Error::not_connected())
        }
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        self.lock().characteristics.iter().find(|(c, _)| c.uuid == uuid).map(|(_, v)| v.clone())
    }

    pub fn drop_connection(&self) {
        let events = {
            let mut state = self.lock();
            state.connected = false;
            state.events.clone()
        };
        if let Some(events) = events {
            events.connection_state_changed(GattStatus(8), NativeConnectionState::Disconnected);
        }
    }

    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        if let Some(events) = self.lock().events.clone() {
            events.characteristic_changed(uuid, value.to_vec());
        }
    }
}

#[async_trait]
impl AsyncGattStack for FakeAsyncStack {
    async fn connect(&self, events: BridgeSender) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        state.calls.push(FakeCall::Connect);
        state.events = Some(events);
        state.connected = true;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        tokio::time::sleep(self.latency).await;
        self.record(FakeCall::DiscoverServices)?;
        Ok(self.lock().characteristics.iter().map(|(c, _)| c.clone()).collect())
    }

    async fn read(&self, characteristic: &DiscoveredCharacteristic) -> Result<Vec<u8>> {
        tokio::time::sleep(self.latency).await;
        self.record(FakeCall::Read(characteristic.uuid))?;
        if !characteristic.properties.contains(CharacteristicProperties::READ) {
            return Err(GattError::ReadNotPermitted.into());
        }
        Ok(self.value(characteristic.uuid).unwrap_or_default())
    }

    async fn write(&self, characteristic: &DiscoveredCharacteristic, value: Vec<u8>,
                   write_type: WriteType) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        self.record(FakeCall::Write(characteristic.uuid, value.clone(), write_type))?;
        let mut state = self.lock();
        if let Some((_, stored)) = state.characteristics.iter_mut().find(|(c, _)| c.uuid == characteristic.uuid) {
            *stored = value;
        }
        Ok(())
    }

    async fn set_notify(&self, characteristic: &DiscoveredCharacteristic, enable: bool) -> Result<()> {
        self.record(FakeCall::SetNotification(characteristic.uuid, enable))
    }

    async fn read_descriptor(&self, characteristic: &DiscoveredCharacteristic, descriptor: Uuid)
                             -> Result<Vec<u8>> {
        tokio::time::sleep(self.latency).await;
        self.record(FakeCall::ReadDescriptor(characteristic.uuid, descriptor))?;
        Ok(vec![0x00, 0x00])
    }

    async fn write_descriptor(&self, characteristic: &DiscoveredCharacteristic, descriptor: Uuid,
                              value: Vec<u8>) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        self.record(FakeCall::WriteDescriptor(characteristic.uuid, descriptor, value))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(FakeCall::Disconnect);
        state.connected = false;
        Ok(())
    }
}
