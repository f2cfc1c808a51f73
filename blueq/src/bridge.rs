use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use log::{trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::{Error, GattStatus, NativeConnectionState, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStateChanged {
    pub status: GattStatus,
    pub state: NativeConnectionState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicesDiscovered {
    pub status: GattStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicRead {
    pub uuid: Uuid,
    pub status: GattStatus,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicWritten {
    pub uuid: Uuid,
    pub status: GattStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicChanged {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// `uuid` identifies the descriptor, not its characteristic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorRead {
    pub uuid: Uuid,
    pub status: GattStatus,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWritten {
    pub uuid: Uuid,
    pub status: GattStatus,
}

/// The posting side of a [`NativeEventBridge`]
///
/// Native stacks call these from whatever thread they deliver callbacks on.
/// Posting never blocks, and events for a session that has gone away are
/// dropped.
#[derive(Clone, Debug)]
pub struct BridgeSender {
    connection_state: UnboundedSender<ConnectionStateChanged>,
    services_discovered: UnboundedSender<ServicesDiscovered>,
    characteristic_read: UnboundedSender<CharacteristicRead>,
    characteristic_write: UnboundedSender<CharacteristicWritten>,
    characteristic_changed: UnboundedSender<CharacteristicChanged>,
    descriptor_read: UnboundedSender<DescriptorRead>,
    descriptor_write: UnboundedSender<DescriptorWritten>,
}

fn post<E: Debug>(tx: &UnboundedSender<E>, event: E) {
    if let Err(err) = tx.send(event) {
        trace!("Dropping native event for a closed bridge: {:?}", err.0);
    }
}

impl BridgeSender {
    pub fn connection_state_changed(&self, status: GattStatus, state: NativeConnectionState) {
        post(&self.connection_state, ConnectionStateChanged { status, state });
    }

    pub fn services_discovered(&self, status: GattStatus) {
        post(&self.services_discovered, ServicesDiscovered { status });
    }

    pub fn characteristic_read(&self, uuid: Uuid, status: GattStatus, value: Vec<u8>) {
        post(&self.characteristic_read, CharacteristicRead { uuid, status, value });
    }

    pub fn characteristic_written(&self, uuid: Uuid, status: GattStatus) {
        post(&self.characteristic_write, CharacteristicWritten { uuid, status });
    }

    pub fn characteristic_changed(&self, uuid: Uuid, value: Vec<u8>) {
        post(&self.characteristic_changed, CharacteristicChanged { uuid, value });
    }

    pub fn descriptor_read(&self, uuid: Uuid, status: GattStatus, value: Vec<u8>) {
        post(&self.descriptor_read, DescriptorRead { uuid, status, value });
    }

    pub fn descriptor_written(&self, uuid: Uuid, status: GattStatus) {
        post(&self.descriptor_write, DescriptorWritten { uuid, status });
    }
}

/// The receiving end for one kind of native completion event
///
/// Every posted event is received exactly once. Only the operation that is
/// currently running for a device waits on its slots.
#[derive(Debug)]
pub struct Slot<E> {
    kind: &'static str,
    rx: tokio::sync::Mutex<UnboundedReceiver<E>>,
}

impl<E: Debug> Slot<E> {
    fn new(kind: &'static str, rx: UnboundedReceiver<E>) -> Self {
        Slot { kind, rx: tokio::sync::Mutex::new(rx) }
    }

    /// Waits for the next event, failing with `OperationTimedOut` if none
    /// arrives within `timeout`; `None` waits indefinitely
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<E> {
        match timeout {
            Some(limit) => match self.poll(limit).await? {
                Some(event) => Ok(event),
                None => Err(Error::OperationTimedOut(
                    format!("no {} event within {:?}", self.kind, limit))),
            },
            None => self.recv().await,
        }
    }

    /// Waits up to `step` for the next event
    pub async fn poll(&self, step: Duration) -> Result<Option<E>> {
        match tokio::time::timeout(step, self.recv()).await {
            Ok(event) => event.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn recv(&self) -> Result<E> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
            .ok_or_else(|| Error::ConnectionError(format!("{} event source closed", self.kind)))
    }

    /// Discards anything left over from an earlier request that gave up
    /// waiting, returning how many events were dropped
    pub fn drain(&self) -> usize {
        let mut rx = match self.rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => return 0,
        };
        let mut dropped = 0;
        while let Ok(event) = rx.try_recv() {
            warn!("Discarding stale {} event: {:?}", self.kind, event);
            dropped += 1;
        }
        dropped
    }
}

/// Per-device handoff between native callback threads and the operation
/// that is waiting for them, with one channel per native event kind
///
/// Connection-state changes and characteristic-changed notifications are
/// consumed by the session's background monitors rather than by operations,
/// so their receivers are taken out once when the session starts.
#[derive(Debug)]
pub struct NativeEventBridge {
    sender: BridgeSender,
    connection_state: Mutex<Option<UnboundedReceiver<ConnectionStateChanged>>>,
    characteristic_changed: Mutex<Option<UnboundedReceiver<CharacteristicChanged>>>,
    pub services_discovered: Slot<ServicesDiscovered>,
    pub characteristic_read: Slot<CharacteristicRead>,
    pub characteristic_write: Slot<CharacteristicWritten>,
    pub descriptor_read: Slot<DescriptorRead>,
    pub descriptor_write: Slot<DescriptorWritten>,
}

impl NativeEventBridge {
    pub fn new() -> Self {
        let (connection_state_tx, connection_state_rx) = mpsc::unbounded_channel();
        let (services_tx, services_rx) = mpsc::unbounded_channel();
        let (char_read_tx, char_read_rx) = mpsc::unbounded_channel();
        let (char_write_tx, char_write_rx) = mpsc::unbounded_channel();
        let (char_changed_tx, char_changed_rx) = mpsc::unbounded_channel();
        let (desc_read_tx, desc_read_rx) = mpsc::unbounded_channel();
        let (desc_write_tx, desc_write_rx) = mpsc::unbounded_channel();

        NativeEventBridge {
            sender: BridgeSender {
                connection_state: connection_state_tx,
                services_discovered: services_tx,
                characteristic_read: char_read_tx,
                characteristic_write: char_write_tx,
                characteristic_changed: char_changed_tx,
                descriptor_read: desc_read_tx,
                descriptor_write: desc_write_tx,
            },
            connection_state: Mutex::new(Some(connection_state_rx)),
            characteristic_changed: Mutex::new(Some(char_changed_rx)),
            services_discovered: Slot::new("services discovered", services_rx),
            characteristic_read: Slot::new("characteristic read", char_read_rx),
            characteristic_write: Slot::new("characteristic write", char_write_rx),
            descriptor_read: Slot::new("descriptor read", desc_read_rx),
            descriptor_write: Slot::new("descriptor write", desc_write_rx),
        }
    }

    pub fn sender(&self) -> BridgeSender {
        self.sender.clone()
    }

    pub(crate) fn take_connection_events(&self) -> Option<UnboundedReceiver<ConnectionStateChanged>> {
        self.connection_state.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn take_notifications(&self) -> Option<UnboundedReceiver<CharacteristicChanged>> {
        self.characteristic_changed.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Default for NativeEventBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    #[tokio::test]
    async fn one_event_per_post() {
        let bridge = NativeEventBridge::new();
        let sender = bridge.sender();
        let uuid = uuid_from_u16(0xa001);

        // posted from another thread, the way native callbacks arrive
        std::thread::spawn(move || {
            sender.characteristic_read(uuid, GattStatus::SUCCESS, vec![1]);
            sender.characteristic_read(uuid, GattStatus::SUCCESS, vec![2]);
        }).join().unwrap();

        let first = bridge.characteristic_read.wait(None).await.unwrap();
        let second = bridge.characteristic_read.wait(None).await.unwrap();
        assert_eq!((first.value, second.value), (vec![1], vec![2]));

        let nothing = bridge.characteristic_read.poll(Duration::from_millis(5)).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let bridge = NativeEventBridge::new();
        let err = bridge.characteristic_write.wait(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, Error::OperationTimedOut(_)));
    }

    #[tokio::test]
    async fn drain_drops_stale_events() {
        let bridge = NativeEventBridge::new();
        let uuid = uuid_from_u16(0x2902);
        bridge.sender().descriptor_written(uuid, GattStatus::SUCCESS);
        bridge.sender().descriptor_written(uuid, GattStatus::FAILURE);
        assert_eq!(bridge.descriptor_write.drain(), 2);
        assert!(bridge.descriptor_write.poll(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[test]
    fn monitor_receivers_are_taken_once() {
        let bridge = NativeEventBridge::new();
        assert!(bridge.take_connection_events().is_some());
        assert!(bridge.take_connection_events().is_none());
        assert!(bridge.take_notifications().is_some());
        assert!(bridge.take_notifications().is_none());
    }
}
