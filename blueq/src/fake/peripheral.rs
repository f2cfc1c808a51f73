use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::trace;
use uuid::Uuid;

use crate::backend::{
    CharacteristicHandle, CharacteristicProperties, DiscoveredCharacteristic, NativeDevice, NativeGatt,
    WriteType,
};
use crate::bridge::BridgeSender;
use crate::{GattStatus, NativeConnectionState, Result};

/// A native call as received by a fake device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeCall {
    Connect,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteType),
    SetNotification(Uuid, bool),
    ReadDescriptor(Uuid, Uuid),
    WriteDescriptor(Uuid, Uuid, Vec<u8>),
    Disconnect,
    Close,
}

#[derive(Debug)]
struct FakeCharacteristic {
    info: DiscoveredCharacteristic,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct FakeState {
    characteristics: Vec<FakeCharacteristic>,
    calls: Vec<FakeCall>,
    events: Option<BridgeSender>,

    manual: bool,
    refuse_connection: bool,
    refuse_reads: usize,
    refuse_writes: usize,
    swallow_reads: bool,
    swallow_writes: bool,
    read_status: Option<GattStatus>,
    descriptor_answer: Option<Uuid>,
}

impl FakeState {
    fn lookup(&self, handle: CharacteristicHandle) -> Option<&FakeCharacteristic> {
        self.characteristics.iter().find(|c| c.info.handle == handle)
    }

    fn lookup_mut(&mut self, handle: CharacteristicHandle) -> Option<&mut FakeCharacteristic> {
        self.characteristics.iter_mut().find(|c| c.info.handle == handle)
    }
}

#[derive(Debug, Default)]
struct FakeShared {
    state: Mutex<FakeState>,
    calls_changed: Condvar,
}

impl FakeShared {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, state: &mut FakeState, call: FakeCall) {
        trace!("Fake peripheral got {:?}", call);
        state.calls.push(call);
        self.calls_changed.notify_all();
    }
}

/// A callback driven device that lives in memory
///
/// In automatic mode (the default) every accepted request is completed
/// straight away, from the thread that made it. In manual mode requests are
/// only recorded, and the test posts completions itself through
/// [`events`](Self::events).
///
/// Clones share the same device.
#[derive(Clone, Debug, Default)]
pub struct FakePeripheral {
    shared: Arc<FakeShared>,
}

impl FakePeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        let peripheral = Self::new();
        peripheral.shared.lock().manual = true;
        peripheral
    }

    /// Adds a characteristic to the device's (single) service
    pub fn with_characteristic(self, uuid: Uuid, properties: CharacteristicProperties, value: &[u8]) -> Self {
        {
            let mut state = self.shared.lock();
            let handle = CharacteristicHandle(state.characteristics.len() as u32 + 1);
            state.characteristics.push(FakeCharacteristic {
                info: DiscoveredCharacteristic {
                    service: crate::uuid::uuid_from_u16(0x180a),
                    uuid,
                    handle,
                    properties,
                },
                value: value.to_vec(),
            });
        }
        self
    }

    pub fn value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        self.shared.lock().characteristics.iter().find(|c| c.info.uuid == uuid).map(|c| c.value.clone())
    }

    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        let mut state = self.shared.lock();
        if let Some(characteristic) = state.characteristics.iter_mut().find(|c| c.info.uuid == uuid) {
            characteristic.value = value.to_vec();
        }
    }

    /// Reports the next connection attempts as failed rather than connected
    pub fn refuse_connection(&self, refuse: bool) {
        self.shared.lock().refuse_connection = refuse;
    }

    /// Makes the next `count` characteristic reads fail to issue
    pub fn refuse_next_reads(&self, count: usize) {
        self.shared.lock().refuse_reads = count;
    }

    pub fn refuse_next_writes(&self, count: usize) {
        self.shared.lock().refuse_writes = count;
    }

    /// Accepts reads but never completes them
    pub fn swallow_reads(&self, swallow: bool) {
        self.shared.lock().swallow_reads = swallow;
    }

    /// Accepts writes but never completes them
    pub fn swallow_writes(&self, swallow: bool) {
        self.shared.lock().swallow_writes = swallow;
    }

    pub fn fail_reads_with(&self, status: Option<GattStatus>) {
        self.shared.lock().read_status = status;
    }

    /// Completes descriptor requests as if they were for `descriptor`
    pub fn answer_descriptors_with(&self, descriptor: Option<Uuid>) {
        self.shared.lock().descriptor_answer = descriptor;
    }

    /// The event sender of the current (or last) connection
    pub fn events(&self) -> Option<BridgeSender> {
        self.shared.lock().events.clone()
    }

    /// Drops the link as if the device went out of range
    pub fn drop_connection(&self) {
        if let Some(events) = self.events() {
            events.connection_state_changed(GattStatus(8), NativeConnectionState::Disconnected);
        }
    }

    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        self.set_value(uuid, value);
        if let Some(events) = self.events() {
            events.characteristic_changed(uuid, value.to_vec());
        }
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.shared.lock().calls.clone()
    }

    pub fn count_calls<P: Fn(&FakeCall) -> bool>(&self, predicate: P) -> usize {
        self.shared.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Blocks until a recorded call matches `predicate`
    pub fn wait_for<P: Fn(&FakeCall) -> bool>(&self, predicate: P, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _timeout) = self.shared.calls_changed
            .wait_timeout_while(state, timeout, |s| !s.calls.iter().any(|call| predicate(call)))
            .unwrap_or_else(|e| e.into_inner());
        state.calls.iter().any(|call| predicate(call))
    }
}

impl NativeDevice for FakePeripheral {
    fn connect(&self, events: BridgeSender) -> Result<Arc<dyn NativeGatt>> {
        let mut state = self.shared.lock();
        self.shared.record(&mut state, FakeCall::Connect);
        state.events = Some(events.clone());

        if !state.manual {
            if state.refuse_connection {
                events.connection_state_changed(GattStatus(133), NativeConnectionState::Disconnected);
            } else {
                events.connection_state_changed(GattStatus::SUCCESS, NativeConnectionState::Connected);
            }
        }

        Ok(Arc::new(FakeConnection {
            shared: self.shared.clone(),
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    shared: Arc<FakeShared>,
    events: BridgeSender,
    closed: AtomicBool,
}

impl FakeConnection {
    // Records the call unless the connection was closed
    fn begin(&self, call: FakeCall) -> Option<MutexGuard<'_, FakeState>> {
        if self.closed.load(Ordering::SeqCst) {
            trace!("Fake connection closed, ignoring {:?}", call);
            return None;
        }
        let mut state = self.shared.lock();
        self.shared.record(&mut state, call);
        Some(state)
    }

    fn uuid_of(&self, handle: CharacteristicHandle) -> Option<Uuid> {
        self.shared.lock().lookup(handle).map(|c| c.info.uuid)
    }
}

impl NativeGatt for FakeConnection {
    fn discover_services(&self) -> bool {
        let state = match self.begin(FakeCall::DiscoverServices) {
            Some(state) => state,
            None => return false,
        };
        if !state.manual {
            self.events.services_discovered(GattStatus::SUCCESS);
        }
        true
    }

    fn services(&self) -> Vec<DiscoveredCharacteristic> {
        self.shared.lock().characteristics.iter().map(|c| c.info.clone()).collect()
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> bool {
        let uuid = match self.uuid_of(handle) {
            Some(uuid) => uuid,
            None => return false,
        };
        let mut state = match self.begin(FakeCall::Read(uuid)) {
            Some(state) => state,
            None => return false,
        };
        if state.refuse_reads > 0 {
            state.refuse_reads -= 1;
            return false;
        }
        if !state.manual && !state.swallow_reads {
            match state.read_status {
                Some(status) => self.events.characteristic_read(uuid, status, Vec::new()),
                None => {
                    let value = state.lookup(handle).map(|c| c.value.clone()).unwrap_or_default();
                    self.events.characteristic_read(uuid, GattStatus::SUCCESS, value);
                }
            }
        }
        true
    }

    fn write_characteristic(&self, handle: CharacteristicHandle, value: &[u8], write_type: WriteType) -> bool {
        let uuid = match self.uuid_of(handle) {
            Some(uuid) => uuid,
            None => return false,
        };
        let mut state = match self.begin(FakeCall::Write(uuid, value.to_vec(), write_type)) {
            Some(state) => state,
            None => return false,
        };
        if state.refuse_writes > 0 {
            state.refuse_writes -= 1;
            return false;
        }
        if let Some(characteristic) = state.lookup_mut(handle) {
            characteristic.value = value.to_vec();
        }
        if !state.manual && !state.swallow_writes {
            self.events.characteristic_written(uuid, GattStatus::SUCCESS);
        }
        true
    }

    fn set_characteristic_notification(&self, handle: CharacteristicHandle, enable: bool) -> bool {
        let uuid = match self.uuid_of(handle) {
            Some(uuid) => uuid,
            None => return false,
        };
        self.begin(FakeCall::SetNotification(uuid, enable)).is_some()
    }

    fn read_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid) -> bool {
        let uuid = match self.uuid_of(handle) {
            Some(uuid) => uuid,
            None => return false,
        };
        let state = match self.begin(FakeCall::ReadDescriptor(uuid, descriptor)) {
            Some(state) => state,
            None => return false,
        };
        if !state.manual {
            let answer = state.descriptor_answer.unwrap_or(descriptor);
            self.events.descriptor_read(answer, GattStatus::SUCCESS, vec![0x00, 0x00]);
        }
        true
    }

    fn write_descriptor(&self, handle: CharacteristicHandle, descriptor: Uuid, value: &[u8]) -> bool {
        let uuid = match self.uuid_of(handle) {
            Some(uuid) => uuid,
            None => return false,
        };
        let state = match self.begin(FakeCall::WriteDescriptor(uuid, descriptor, value.to_vec())) {
            Some(state) => state,
            None => return false,
        };
        if !state.manual {
            let answer = state.descriptor_answer.unwrap_or(descriptor);
            self.events.descriptor_written(answer, GattStatus::SUCCESS);
        }
        true
    }

    // Sessions always close right after disconnecting, and a closed native
    // connection doesn't report the link going down
    fn disconnect(&self) {
        self.begin(FakeCall::Disconnect);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.shared.lock();
            self.shared.record(&mut state, FakeCall::Close);
        }
    }
}
