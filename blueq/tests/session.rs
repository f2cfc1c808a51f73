use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use blueq::backend::async_stack::AsyncStackDevice;
use blueq::fake::{FakeAsyncStack, FakeCall, FakePeripheral};
use blueq::uuid::{uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIGURATION};
use blueq::{
    CharacteristicProperties, ConnectionState, Error, GattError, GattRequest, GattSession, GattStatus,
    Inline, SessionConfig, SharedWorker, TokioContext,
};

const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);
const CONTROL_POINT: Uuid = uuid_from_u16(0x2a39);
const HEART_RATE: Uuid = uuid_from_u16(0x2a37);
const SERVICE_CHANGED: Uuid = uuid_from_u16(0x2a05);

const LONG: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = pretty_env_logger::formatted_builder().is_test(true).try_init();
}

fn heart_rate_monitor(peripheral: FakePeripheral) -> FakePeripheral {
    peripheral
        .with_characteristic(BATTERY_LEVEL, CharacteristicProperties::READ, &[87])
        .with_characteristic(CONTROL_POINT, CharacteristicProperties::WRITE, &[])
        .with_characteristic(HEART_RATE, CharacteristicProperties::NOTIFY, &[])
        .with_characteristic(SERVICE_CHANGED, CharacteristicProperties::INDICATE, &[])
}

struct Rig {
    shared: SharedWorker,
    session: GattSession,
    peripheral: FakePeripheral,
}

impl Rig {
    fn new(peripheral: FakePeripheral, config: SessionConfig) -> Self {
        init_logging();
        let shared = SharedWorker::start().unwrap();
        let session = GattSession::open("C0:FF:EE:00:00:01".parse().unwrap(),
                                        Arc::new(peripheral.clone()),
                                        &shared,
                                        Arc::new(Inline),
                                        config).unwrap();
        Rig { shared, session, peripheral }
    }

    fn connected(peripheral: FakePeripheral, config: SessionConfig) -> Self {
        let rig = Self::new(peripheral, config);
        assert_eq!(rig.session.connect().wait().unwrap(), ConnectionState::Connected);
        rig
    }

    fn count(&self, predicate: impl Fn(&FakeCall) -> bool) -> usize {
        self.peripheral.count_calls(predicate)
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.session.shutdown();
        self.shared.shutdown();
    }
}

/// Enqueues a request with a callback and hands back where its result lands
fn later<T: Send + 'static>(request: GattRequest<T>) -> mpsc::Receiver<blueq::Result<T>> {
    let (tx, rx) = mpsc::channel();
    request.then(move |result| {
        let _ = tx.send(result.get());
    });
    rx
}

fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + LONG;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn connect_discovers_then_reads() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    assert!(rig.session.is_connected());
    let mut expected = vec![BATTERY_LEVEL, CONTROL_POINT, HEART_RATE, SERVICE_CHANGED];
    expected.sort();
    assert_eq!(rig.session.characteristic_uuids(), expected);
    assert_eq!(rig.session.characteristic_properties(HEART_RATE), Some(CharacteristicProperties::NOTIFY));

    assert_eq!(rig.session.char_read(BATTERY_LEVEL).wait().unwrap(), vec![87]);
    assert_eq!(rig.peripheral.calls(),
               vec![FakeCall::Connect, FakeCall::DiscoverServices, FakeCall::Read(BATTERY_LEVEL)]);
}

#[test]
fn manual_completions_drive_requests() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), SessionConfig::default());

    let connected = later(rig.session.connect());
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Connect, LONG));
    let events = rig.peripheral.events().unwrap();
    events.connection_state_changed(GattStatus::SUCCESS, blueq::NativeConnectionState::Connected);

    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::DiscoverServices, LONG));
    events.services_discovered(GattStatus::SUCCESS);
    assert_eq!(connected.recv_timeout(LONG).unwrap().unwrap(), ConnectionState::Connected);

    // Left over from some earlier request; must not be taken as the answer
    events.characteristic_read(BATTERY_LEVEL, GattStatus::SUCCESS, vec![1]);

    let read = later(rig.session.char_read(BATTERY_LEVEL));
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Read(BATTERY_LEVEL), LONG));
    events.characteristic_read(BATTERY_LEVEL, GattStatus::SUCCESS, vec![2]);
    assert_eq!(read.recv_timeout(LONG).unwrap().unwrap(), vec![2]);
}

#[test]
fn read_queued_behind_connect_runs_once_discovery_finishes() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), SessionConfig::default());

    let connected = later(rig.session.connect());
    let read = later(rig.session.char_read(BATTERY_LEVEL));
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Connect, LONG));
    assert_eq!(rig.session.pending_requests(), 1);

    let events = rig.peripheral.events().unwrap();
    events.connection_state_changed(GattStatus::SUCCESS, blueq::NativeConnectionState::Connected);
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::DiscoverServices, LONG));
    events.services_discovered(GattStatus::SUCCESS);
    assert_eq!(connected.recv_timeout(LONG).unwrap().unwrap(), ConnectionState::Connected);

    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Read(BATTERY_LEVEL), LONG));
    events.characteristic_read(BATTERY_LEVEL, GattStatus::SUCCESS, vec![64]);
    assert_eq!(read.recv_timeout(LONG).unwrap().unwrap(), vec![64]);
    assert_eq!(rig.peripheral.calls(),
               vec![FakeCall::Connect, FakeCall::DiscoverServices, FakeCall::Read(BATTERY_LEVEL)]);
}

#[test]
fn failed_discovery_drops_the_connection() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), SessionConfig::default());
    let discoveries = |call: &FakeCall| *call == FakeCall::DiscoverServices;

    let connected = later(rig.session.connect());
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Connect, LONG));
    let events = rig.peripheral.events().unwrap();
    events.connection_state_changed(GattStatus::SUCCESS, blueq::NativeConnectionState::Connected);
    assert!(rig.peripheral.wait_for(discoveries, LONG));
    events.services_discovered(GattStatus::FAILURE);

    let err = connected.recv_timeout(LONG).unwrap().unwrap_err();
    assert!(matches!(err, Error::CouldNotDiscoverServices(_)), "{}", err);
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert!(rig.session.characteristic_uuids().is_empty());
    assert!(rig.peripheral.calls().ends_with(&[FakeCall::Disconnect, FakeCall::Close]));

    // Connecting again has to discover again
    let connected = later(rig.session.connect());
    assert!(eventually(|| rig.count(|call| *call == FakeCall::Connect) == 2));
    events.connection_state_changed(GattStatus::SUCCESS, blueq::NativeConnectionState::Connected);
    assert!(eventually(|| rig.count(discoveries) == 2));
    events.services_discovered(GattStatus::SUCCESS);
    assert_eq!(connected.recv_timeout(LONG).unwrap().unwrap(), ConnectionState::Connected);
    assert_eq!(rig.session.characteristic_uuids().len(), 4);
}

#[test]
fn link_lost_during_discovery() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), SessionConfig::default());

    let connected = later(rig.session.connect());
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::Connect, LONG));
    rig.peripheral.events().unwrap()
        .connection_state_changed(GattStatus::SUCCESS, blueq::NativeConnectionState::Connected);
    assert!(rig.peripheral.wait_for(|call| *call == FakeCall::DiscoverServices, LONG));

    rig.peripheral.drop_connection();
    let err = connected.recv_timeout(LONG).unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionError(_)), "{}", err);
    assert!(rig.session.wait_until_idle(LONG));
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert!(rig.session.characteristic_uuids().is_empty());
}

#[test]
fn read_without_connection_fails_before_reaching_the_device() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    let err = rig.session.char_read(BATTERY_LEVEL).wait().unwrap_err();
    assert!(matches!(err, Error::ConnectionError(_)));
    assert_eq!(err.to_string(), "Connection error: no device connected");
    assert!(rig.peripheral.calls().is_empty());
}

#[test]
fn unknown_characteristic() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    let missing = uuid_from_u16(0x2a00);
    let err = rig.session.char_read(missing).wait().unwrap_err();
    assert!(matches!(err, Error::UnknownCharacteristic(uuid) if uuid == missing));
}

#[test]
fn reads_are_offered_three_times() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());
    let reads = |call: &FakeCall| matches!(call, FakeCall::Read(_));

    rig.peripheral.refuse_next_reads(2);
    assert_eq!(rig.session.char_read(BATTERY_LEVEL).wait().unwrap(), vec![87]);
    assert_eq!(rig.count(reads), 3);

    rig.peripheral.refuse_next_reads(3);
    let err = rig.session.char_read(BATTERY_LEVEL).wait().unwrap_err();
    assert!(matches!(err, Error::OperationNotIssued(_)));
    assert_eq!(rig.count(reads), 6);
}

#[test]
fn failed_read_status_maps_to_gatt_error() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    rig.peripheral.fail_reads_with(Some(GattStatus::INSUFFICIENT_AUTHENTICATION));
    let err = rig.session.char_read(BATTERY_LEVEL).wait().unwrap_err();
    assert!(matches!(err, Error::Gatt(GattError::InsufficientAuthentication)));
    assert_eq!(err.error_id(), 11);
}

#[test]
fn writes_are_never_retried() {
    let mut config = SessionConfig::default();
    config.set_write_timeout(Duration::from_millis(100));
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), config);
    let writes = |call: &FakeCall| matches!(call, FakeCall::Write(..));

    rig.peripheral.refuse_next_writes(1);
    let err = rig.session.char_write(CONTROL_POINT, vec![1], true).wait().unwrap_err();
    assert!(matches!(err, Error::OperationNotIssued(_)));
    assert_eq!(rig.count(writes), 1);

    rig.peripheral.swallow_writes(true);
    let err = rig.session.char_write(CONTROL_POINT, vec![2], true).wait().unwrap_err();
    assert!(matches!(err, Error::OperationTimedOut(_)));
    assert_eq!(rig.count(writes), 2);

    rig.peripheral.swallow_writes(false);
    rig.session.char_write(CONTROL_POINT, vec![3], false).wait().unwrap();
    assert_eq!(rig.peripheral.value(CONTROL_POINT), Some(vec![3]));
    assert!(rig.peripheral.calls().contains(
        &FakeCall::Write(CONTROL_POINT, vec![3], blueq::WriteType::WithoutResponse)));
}

#[test]
fn dropped_connection_cancels_queued_requests() {
    let mut config = SessionConfig::default();
    config.set_write_timeout(LONG);
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), config);

    let (disconnects_tx, disconnects) = mpsc::channel();
    rig.session.set_disconnect_callback(move |state| {
        let _ = disconnects_tx.send(state);
    });

    rig.peripheral.swallow_writes(true);
    let write = later(rig.session.char_write(CONTROL_POINT, vec![1], true));
    let read = later(rig.session.char_read(BATTERY_LEVEL));
    assert!(rig.peripheral.wait_for(|call| matches!(call, FakeCall::Write(..)), LONG));

    rig.peripheral.drop_connection();

    // The write was already with the device, the read never got there
    assert!(matches!(write.recv_timeout(LONG).unwrap(), Err(Error::ConnectionError(_))));
    assert!(matches!(read.recv_timeout(LONG).unwrap(), Err(Error::Cancelled(_))));
    assert_eq!(disconnects.recv_timeout(LONG).unwrap(), ConnectionState::Disconnected);
    assert_eq!(rig.count(|call| matches!(call, FakeCall::Read(_))), 0);

    assert!(rig.session.wait_until_idle(LONG));
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert!(rig.session.characteristic_uuids().is_empty());
    assert!(rig.peripheral.calls().contains(&FakeCall::Close));

    // The directory was thrown away with the connection
    rig.peripheral.swallow_writes(false);
    assert_eq!(rig.session.connect().wait().unwrap(), ConnectionState::Connected);
    assert_eq!(rig.count(|call| *call == FakeCall::DiscoverServices), 2);
}

#[test]
fn in_flight_read_fails_when_the_connection_drops() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    rig.peripheral.swallow_reads(true);
    let read = later(rig.session.char_read(BATTERY_LEVEL));
    assert!(rig.peripheral.wait_for(|call| matches!(call, FakeCall::Read(_)), LONG));

    rig.peripheral.drop_connection();
    assert!(matches!(read.recv_timeout(LONG).unwrap(), Err(Error::ConnectionError(_))));
    assert!(eventually(|| rig.session.state() == ConnectionState::Disconnected));
}

#[test]
fn descriptor_completion_must_match_request() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    let user_description = uuid_from_u16(0x2901);
    rig.peripheral.answer_descriptors_with(Some(user_description));
    let err = rig.session
        .descriptor_write(HEART_RATE, CLIENT_CHARACTERISTIC_CONFIGURATION, vec![1, 0])
        .wait()
        .unwrap_err();
    assert!(matches!(err, Error::MismatchedOperation(_)));

    rig.peripheral.answer_descriptors_with(None);
    assert_eq!(rig.session.descriptor_read(HEART_RATE, CLIENT_CHARACTERISTIC_CONFIGURATION).wait().unwrap(),
               vec![0, 0]);
}

#[test]
fn reconnect_reuses_discovered_characteristics() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    assert_eq!(rig.session.disconnect().wait().unwrap(), ConnectionState::Disconnected);
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert_eq!(rig.session.characteristic_uuids().len(), 4);
    assert!(rig.peripheral.calls().ends_with(&[FakeCall::Disconnect, FakeCall::Close]));

    assert_eq!(rig.session.connect().wait().unwrap(), ConnectionState::Connected);
    assert_eq!(rig.count(|call| *call == FakeCall::Connect), 2);
    assert_eq!(rig.count(|call| *call == FakeCall::DiscoverServices), 1);

    // Connecting again while connected is a no-op
    assert_eq!(rig.session.connect().wait().unwrap(), ConnectionState::Connected);
    assert_eq!(rig.count(|call| *call == FakeCall::Connect), 2);
}

#[test]
fn refused_connection_reports_disconnected() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    rig.peripheral.refuse_connection(true);
    assert_eq!(rig.session.connect().wait().unwrap(), ConnectionState::Disconnected);
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert_eq!(rig.count(|call| *call == FakeCall::DiscoverServices), 0);
}

#[test]
fn connect_gives_up_after_connect_timeout() {
    let mut config = SessionConfig::default();
    config.set_connect_timeout(Some(Duration::from_millis(100)));
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), config);

    let err = rig.session.connect().wait().unwrap_err();
    assert!(matches!(err, Error::OperationTimedOut(_)));
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    assert_eq!(rig.peripheral.calls(), vec![FakeCall::Connect, FakeCall::Disconnect, FakeCall::Close]);
}

#[test]
fn blocking_wait_names_the_request_that_timed_out() {
    let rig = Rig::new(heart_rate_monitor(FakePeripheral::manual()), SessionConfig::default());

    let err = rig.session.connect().timeout(Duration::from_millis(100)).wait().unwrap_err();
    assert!(matches!(err, Error::OperationTimedOut(_)));
    assert!(err.to_string().contains("connect returned no result in"), "{}", err);
}

#[test]
fn notifications_reach_subscriber() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    let err = rig.session.set_notify(HEART_RATE, true, None).wait().unwrap_err();
    assert!(matches!(err, Error::NoCallbackProvided));

    let (tx, notifications) = mpsc::channel();
    rig.session.subscribe(HEART_RATE, move |uuid, value| {
        let _ = tx.send((uuid, value));
    }).wait().unwrap();
    assert!(rig.peripheral.calls().ends_with(&[
        FakeCall::SetNotification(HEART_RATE, true),
        FakeCall::WriteDescriptor(HEART_RATE, CLIENT_CHARACTERISTIC_CONFIGURATION, vec![1, 0]),
    ]));

    rig.peripheral.notify(HEART_RATE, &[0x06, 72]);
    assert_eq!(notifications.recv_timeout(LONG).unwrap(), (HEART_RATE, vec![0x06, 72]));

    rig.session.unsubscribe(HEART_RATE).wait().unwrap();
    assert!(rig.peripheral.calls().ends_with(&[
        FakeCall::SetNotification(HEART_RATE, false),
        FakeCall::WriteDescriptor(HEART_RATE, CLIENT_CHARACTERISTIC_CONFIGURATION, vec![0, 0]),
    ]));
    rig.peripheral.notify(HEART_RATE, &[0x06, 73]);
    assert!(notifications.recv_timeout(Duration::from_millis(100)).is_err());

    // Indicate-only characteristics get indications
    rig.session.subscribe(SERVICE_CHANGED, |_, _| {}).wait().unwrap();
    assert!(rig.peripheral.calls().contains(
        &FakeCall::WriteDescriptor(SERVICE_CHANGED, CLIENT_CHARACTERISTIC_CONFIGURATION, vec![2, 0])));
}

#[test]
fn requests_after_shutdown_are_cancelled() {
    let rig = Rig::connected(heart_rate_monitor(FakePeripheral::new()), SessionConfig::default());

    rig.session.shutdown();
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);
    let err = rig.session.char_read(BATTERY_LEVEL).wait().unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(rig.count(|call| matches!(call, FakeCall::Read(_))), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaitable_and_callback_requests() {
    init_logging();
    let shared = SharedWorker::start().unwrap();
    let peripheral = heart_rate_monitor(FakePeripheral::new());
    let session = GattSession::open("C0:FF:EE:00:00:02".parse().unwrap(),
                                    Arc::new(peripheral.clone()),
                                    &shared,
                                    Arc::new(TokioContext::current()),
                                    SessionConfig::default()).unwrap();

    assert_eq!(session.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(session.char_read(BATTERY_LEVEL).await.unwrap(), vec![87]);

    let (tx, rx) = tokio::sync::oneshot::channel();
    session.char_write(CONTROL_POINT, vec![5], true).then(move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.await.unwrap());
    assert_eq!(peripheral.value(CONTROL_POINT), Some(vec![5]));

    session.shutdown();
    shared.shutdown();
}

#[test]
fn async_stack_backend() {
    init_logging();
    let shared = SharedWorker::start().unwrap();
    let stack = FakeAsyncStack::new(Duration::from_millis(2))
        .with_characteristic(BATTERY_LEVEL, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY, &[50])
        .with_characteristic(CONTROL_POINT, CharacteristicProperties::WRITE, &[]);
    let device = AsyncStackDevice::new(stack.clone(), shared.handle().clone());
    let session = GattSession::open("C0:FF:EE:00:00:03".parse().unwrap(),
                                    Arc::new(device),
                                    &shared,
                                    Arc::new(Inline),
                                    SessionConfig::default()).unwrap();

    assert_eq!(session.connect().wait().unwrap(), ConnectionState::Connected);
    assert_eq!(session.char_read(BATTERY_LEVEL).wait().unwrap(), vec![50]);

    session.char_write(CONTROL_POINT, vec![9], true).wait().unwrap();
    assert_eq!(stack.value(CONTROL_POINT), Some(vec![9]));

    let err = session.char_read(CONTROL_POINT).wait().unwrap_err();
    assert!(matches!(err, Error::Gatt(GattError::ReadNotPermitted)));

    let (tx, notifications) = mpsc::channel();
    session.subscribe(BATTERY_LEVEL, move |_, value| {
        let _ = tx.send(value);
    }).wait().unwrap();
    stack.notify(BATTERY_LEVEL, &[49]);
    assert_eq!(notifications.recv_timeout(LONG).unwrap(), vec![49]);

    session.unsubscribe(BATTERY_LEVEL).wait().unwrap();

    // Reconnecting skips discovery but the characteristics stay addressable
    assert_eq!(session.disconnect().wait().unwrap(), ConnectionState::Disconnected);
    assert_eq!(session.connect().wait().unwrap(), ConnectionState::Connected);
    assert_eq!(stack.calls().iter().filter(|call| **call == FakeCall::DiscoverServices).count(), 1);
    assert_eq!(session.char_read(BATTERY_LEVEL).wait().unwrap(), vec![50]);
    session.char_write(CONTROL_POINT, vec![10], true).wait().unwrap();
    assert_eq!(stack.value(CONTROL_POINT), Some(vec![10]));

    stack.drop_connection();
    assert!(eventually(|| session.characteristic_uuids().is_empty()));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.shutdown();
    shared.shutdown();
}
