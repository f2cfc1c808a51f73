use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use dashmap::DashMap;
use function_name::named;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::backend::{
    CharacteristicProperties, DiscoveredCharacteristic, NativeDevice, NativeGatt, WriteType,
};
use crate::bridge::{CharacteristicChanged, ConnectionStateChanged, NativeEventBridge, Slot};
use crate::converter::CallbackContext;
use crate::uuid::{
    CLIENT_CHARACTERISTIC_CONFIGURATION, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::{
    Address, ConnectionState, Error, GattRequest, NativeConnectionState, OpContext, Operation,
    OperationQueue, OperationWorker, Result, SessionConfig, SharedWorker,
};

pub type NotifyCallback = Arc<dyn Fn(Uuid, Vec<u8>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Connection {
    state: ConnectionState,
    native: Option<Arc<dyn NativeGatt>>,

    // Survives a solicited disconnect so that reconnecting can skip
    // discovery. Cleared when the device drops us.
    characteristics: HashMap<Uuid, DiscoveredCharacteristic>,

    // Set once an unsolicited disconnect has queued its teardown
    teardown_pending: bool,
}

struct SessionInner {
    address: Address,
    config: SessionConfig,
    device: Arc<dyn NativeDevice>,
    queue: Arc<OperationQueue>,
    worker: OperationWorker,
    bridge: NativeEventBridge,
    context: Arc<dyn CallbackContext>,

    connection: Mutex<Connection>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    // The connect operation that is waiting for the native stack to report
    // whether the link came up
    connect_waiter: Mutex<Option<oneshot::Sender<NativeConnectionState>>>,

    notifications: DashMap<Uuid, NotifyCallback>,
    disconnect_callback: Mutex<Option<DisconnectCallback>>,

    monitors: Mutex<Vec<JoinHandle<()>>>,
    is_shut_down: AtomicBool,
}

/// A client for one remote device's GATT server
///
/// All requests for the device go through a single queue and run one at a
/// time, and every device's requests share one native BLE worker. Requests
/// are returned as [`GattRequest`]s so callers can block on them, pass a
/// callback or await them.
///
/// Sessions are cheap to clone and compare equal if they refer to the same
/// device session.
#[derive(Clone)]
pub struct GattSession {
    inner: Arc<SessionInner>,
}

impl PartialEq for GattSession {
    fn eq(&self, other: &GattSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for GattSession {}
impl Hash for GattSession {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl fmt::Debug for GattSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GattSession")
            .field("address", &self.inner.address)
            .field("state", &self.inner.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GattSession {
    /// Creates the session and starts its operation worker and monitors
    ///
    /// Nothing is sent to the device until [`connect`](Self::connect).
    pub fn open(address: Address, device: Arc<dyn NativeDevice>, shared: &SharedWorker,
                context: Arc<dyn CallbackContext>, config: SessionConfig) -> Result<Self> {
        let queue = Arc::new(OperationQueue::new(address.to_string()));
        let worker = OperationWorker::start(queue.clone(), shared.clone(), config.worker_idle_poll)?;

        let bridge = NativeEventBridge::new();
        let connection_events = bridge.take_connection_events()
            .ok_or_else(|| anyhow!("Connection events already claimed"))?;
        let notifications = bridge.take_notifications()
            .ok_or_else(|| anyhow!("Notifications already claimed"))?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Init);

        let inner = Arc::new(SessionInner {
            address,
            config,
            device,
            queue,
            worker,
            bridge,
            context,
            connection: Mutex::new(Connection {
                state: ConnectionState::Init,
                native: None,
                characteristics: HashMap::new(),
                teardown_pending: false,
            }),
            state_tx,
            state_rx,
            connect_waiter: Mutex::new(None),
            notifications: DashMap::new(),
            disconnect_callback: Mutex::new(None),
            monitors: Mutex::new(Vec::new()),
            is_shut_down: AtomicBool::new(false),
        });

        // XXX: the monitors only get a Weak reference, otherwise they would keep
        // the session alive forever. They upgrade it just while handling an event.
        let weak_inner = Arc::downgrade(&inner);
        let monitors = vec![
            shared.handle().spawn(SessionInner::run_connection_monitor(weak_inner.clone(), connection_events)),
            shared.handle().spawn(SessionInner::run_notification_monitor(weak_inner, notifications)),
        ];
        *lock(&inner.monitors) = monitors;

        debug!("{}: session opened", inner.address);
        Ok(GattSession { inner })
    }

    fn request<T, F, Fut>(&self, name: &'static str, body: F) -> GattRequest<T>
        where T: Send + 'static,
              F: FnOnce(Arc<SessionInner>, OpContext) -> Fut + Send + 'static,
              Fut: Future<Output = Result<T>> + Send + 'static
    {
        let inner = self.inner.clone();
        let operation = Operation::new(name, move |ctx| body(inner, ctx));
        GattRequest::new(operation,
                         self.inner.queue.clone(),
                         self.inner.context.clone(),
                         self.inner.config.request_timeout)
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The characteristics found by service discovery, in UUID order
    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = lock(&self.inner.connection).characteristics.keys().copied().collect();
        uuids.sort();
        uuids
    }

    pub fn characteristic_properties(&self, uuid: Uuid) -> Option<CharacteristicProperties> {
        lock(&self.inner.connection).characteristics.get(&uuid).map(|c| c.properties)
    }

    /// Number of requests waiting behind the one that's running, if any
    pub fn pending_requests(&self) -> usize {
        self.inner.queue.len()
    }

    /// Waits until no request is running or pending
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.inner.queue.wait_until_idle(timeout)
    }

    /// Sets the callback that hears about the device dropping the connection
    ///
    /// It isn't called for disconnects requested through
    /// [`disconnect`](Self::disconnect).
    pub fn set_disconnect_callback<F>(&self, callback: F)
        where F: Fn(ConnectionState) + Send + Sync + 'static
    {
        *lock(&self.inner.disconnect_callback) = Some(Arc::new(callback));
    }

    pub fn clear_disconnect_callback(&self) {
        *lock(&self.inner.disconnect_callback) = None;
    }

    /// Connects and, the first time, discovers the device's characteristics
    ///
    /// Resolves to `Connected`, or `Disconnected` if the native stack
    /// reported that the link didn't come up.
    ///
    /// # Errors
    ///
    /// `ConnectionError` if a connect is already in progress or the link
    /// drops during discovery, and `CouldNotDiscoverServices` if discovery
    /// couldn't be started or failed.
    #[named]
    pub fn connect(&self) -> GattRequest<ConnectionState> {
        debug!("{}: {}()", self.inner.address, function_name!());
        self.request(function_name!(), |inner, ctx| inner.connect_op(ctx))
    }

    /// Disconnects and releases the native connection
    #[named]
    pub fn disconnect(&self) -> GattRequest<ConnectionState> {
        debug!("{}: {}()", self.inner.address, function_name!());
        self.request(function_name!(), |inner, ctx| inner.disconnect_op(ctx))
    }

    /// Reads a characteristic's value
    ///
    /// The read waits for the native stack's completion for as long as the
    /// connection stays up (or up to the configured read timeout).
    ///
    /// # Errors
    ///
    /// `ConnectionError` without a connection, `OperationNotIssued` if the
    /// native stack refused every attempt to issue the read.
    #[named]
    pub fn char_read(&self, uuid: Uuid) -> GattRequest<Vec<u8>> {
        debug!("{}: {}({})", self.inner.address, function_name!(), uuid);
        self.request(function_name!(), move |inner, ctx| inner.char_read_op(ctx, uuid))
    }

    /// Writes a characteristic's value
    ///
    /// A write is offered to the native stack once and never retried.
    ///
    /// # Errors
    ///
    /// `OperationNotIssued` if the stack refuses the write, `OperationTimedOut`
    /// if no completion arrives within the configured write timeout.
    #[named]
    pub fn char_write(&self, uuid: Uuid, data: Vec<u8>, require_response: bool) -> GattRequest<()> {
        debug!("{}: {}({}, {} bytes)", self.inner.address, function_name!(), uuid, data.len());
        self.request(function_name!(),
                     move |inner, ctx| inner.char_write_op(ctx, uuid, data, require_response))
    }

    /// Turns notifications for a characteristic on or off
    ///
    /// Enabling requires a callback, which then gets every notification for
    /// `uuid` until notifications are disabled or the device disconnects.
    #[named]
    pub fn set_notify(&self, uuid: Uuid, enable: bool, callback: Option<NotifyCallback>) -> GattRequest<()> {
        debug!("{}: {}({}, {})", self.inner.address, function_name!(), uuid, enable);
        self.request(function_name!(),
                     move |inner, ctx| inner.set_notify_op(ctx, uuid, enable, callback))
    }

    pub fn subscribe<F>(&self, uuid: Uuid, callback: F) -> GattRequest<()>
        where F: Fn(Uuid, Vec<u8>) + Send + Sync + 'static
    {
        self.set_notify(uuid, true, Some(Arc::new(callback)))
    }

    pub fn unsubscribe(&self, uuid: Uuid) -> GattRequest<()> {
        self.set_notify(uuid, false, None)
    }

    /// Writes a descriptor of a characteristic
    ///
    /// # Errors
    ///
    /// `MismatchedOperation` if the completion that arrives is for a
    /// different descriptor.
    #[named]
    pub fn descriptor_write(&self, characteristic: Uuid, descriptor: Uuid, data: Vec<u8>) -> GattRequest<()> {
        debug!("{}: {}({}, {})", self.inner.address, function_name!(), characteristic, descriptor);
        self.request(function_name!(),
                     move |inner, ctx| inner.descriptor_write_op(ctx, characteristic, descriptor, data))
    }

    #[named]
    pub fn descriptor_read(&self, characteristic: Uuid, descriptor: Uuid) -> GattRequest<Vec<u8>> {
        debug!("{}: {}({}, {})", self.inner.address, function_name!(), characteristic, descriptor);
        self.request(function_name!(),
                     move |inner, ctx| inner.descriptor_read_op(ctx, characteristic, descriptor))
    }

    /// Cancels pending requests, stops the worker and monitors and releases
    /// the native connection
    ///
    /// A request that has already reached the native stack finishes in the
    /// background. Requests made after shutdown fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn check_identity(kind: &str, expected: Uuid, received: Uuid) -> Result<()> {
    if expected == received {
        Ok(())
    } else {
        Err(Error::MismatchedOperation(
            format!("{} completion for {} while waiting on {}", kind, received, expected)))
    }
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        lock(&self.connection).state
    }

    fn set_state_locked(&self, connection: &mut Connection, state: ConnectionState) {
        if connection.state != state {
            debug!("{}: {} -> {}", self.address, connection.state, state);
            connection.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut connection = lock(&self.connection);
        self.set_state_locked(&mut connection, state);
    }

    fn disconnect_callback(&self) -> Option<DisconnectCallback> {
        lock(&self.disconnect_callback).clone()
    }

    /// Resolves the native connection and characteristic for a request that
    /// needs the device to be connected
    fn connected_characteristic(&self, uuid: Uuid)
                                -> Result<(Arc<dyn NativeGatt>, DiscoveredCharacteristic)> {
        let connection = lock(&self.connection);
        let native = match (connection.state, &connection.native) {
            (ConnectionState::Connected, Some(native)) => native.clone(),
            _ => return Err(Error::not_connected()),
        };
        let characteristic = connection.characteristics.get(&uuid)
            .cloned()
            .ok_or(Error::UnknownCharacteristic(uuid))?;
        Ok((native, characteristic))
    }

    // Resolves once the connection is going or gone
    async fn connection_lost(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow();
            if matches!(state, ConnectionState::Disconnecting | ConnectionState::Disconnected) {
                return;
            }
            if state_rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Waits for the completion of a request already issued to the native
    /// stack, giving up if the connection is lost in the meantime
    async fn await_completion<E: fmt::Debug>(&self, slot: &Slot<E>, timeout: Option<Duration>,
                                             what: &str) -> Result<E> {
        tokio::select! {
            event = slot.wait(timeout) => event,
            _ = self.connection_lost() => {
                Err(Error::ConnectionError(format!("connection lost while waiting for {} completion", what)))
            }
        }
    }

    // Returns the state to report straight away, or None to go ahead and connect
    fn begin_connect(&self) -> Result<Option<ConnectionState>> {
        let mut connection = lock(&self.connection);
        match connection.state {
            ConnectionState::Connecting => {
                Err(Error::ConnectionError("connect already in progress".to_string()))
            }
            ConnectionState::Connected => Ok(Some(ConnectionState::Connected)),
            _ => {
                self.set_state_locked(&mut connection, ConnectionState::Connecting);
                connection.teardown_pending = false;
                Ok(None)
            }
        }
    }

    // Gives up on the current native connection without waiting for the
    // native stack to confirm anything
    fn abandon_connection(&self) {
        let native = {
            let mut connection = lock(&self.connection);
            self.set_state_locked(&mut connection, ConnectionState::Disconnected);
            connection.native.take()
        };
        if let Some(native) = native {
            native.disconnect();
            native.close();
        }
    }

    async fn connect_op(self: Arc<Self>, ctx: OpContext) -> Result<ConnectionState> {
        if let Some(reason) = ctx.cancel_reason() {
            debug!("{}: connect cancelled: {}", self.address, reason);
            return Ok(ConnectionState::Cancelled);
        }
        if let Some(state) = self.begin_connect()? {
            debug!("{}: already {}", self.address, state);
            return Ok(state);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        *lock(&self.connect_waiter) = Some(waiter_tx);

        let native = match self.device.connect(self.bridge.sender()) {
            Ok(native) => native,
            Err(err) => {
                lock(&self.connect_waiter).take();
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        lock(&self.connection).native = Some(native.clone());

        let outcome = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter_rx).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    lock(&self.connect_waiter).take();
                    self.abandon_connection();
                    return Err(Error::OperationTimedOut(
                        format!("{} didn't connect within {:?}", self.address, limit)));
                }
            },
            None => waiter_rx.await,
        };

        match outcome {
            Ok(NativeConnectionState::Connected) => {}
            Ok(state) => {
                info!("{}: connection attempt ended with {:?}", self.address, state);
                self.abandon_connection();
                return Ok(ConnectionState::Disconnected);
            }
            Err(_) => {
                self.abandon_connection();
                return Err(Error::ConnectionError("connect attempt abandoned".to_string()));
            }
        }

        self.set_state(ConnectionState::Connected);
        info!("{}: connected", self.address);

        let known = lock(&self.connection).characteristics.len();
        if known == 0 {
            if let Err(err) = self.discover_services(&native).await {
                warn!("{}: service discovery failed, dropping the connection: {}", self.address, err);
                self.abandon_connection();
                return Err(err);
            }
        } else {
            debug!("{}: reusing {} known characteristic(s)", self.address, known);
        }
        Ok(ConnectionState::Connected)
    }

    async fn discover_services(&self, native: &Arc<dyn NativeGatt>) -> Result<()> {
        self.bridge.services_discovered.drain();
        if !native.discover_services() {
            return Err(Error::CouldNotDiscoverServices(
                "native stack would not start service discovery".to_string()));
        }

        // Discovery can silently never complete if the link drops, so poll
        // and keep an eye on the connection state
        let started = Instant::now();
        let event = loop {
            if let Some(event) = self.bridge.services_discovered.poll(self.config.discovery_poll_interval).await? {
                break event;
            }
            if matches!(self.state(), ConnectionState::Disconnected | ConnectionState::Disconnecting) {
                return Err(Error::ConnectionError("disconnected during service discovery".to_string()));
            }
            if let Some(limit) = self.config.discovery_timeout {
                if started.elapsed() >= limit {
                    return Err(Error::OperationTimedOut(
                        format!("service discovery didn't finish within {:?}", limit)));
                }
            }
            trace!("{}: still waiting for service discovery", self.address);
        };
        if let Err(err) = event.status.check() {
            return Err(Error::CouldNotDiscoverServices(err.to_string()));
        }

        let found = native.services();
        debug!("{}: discovered {} characteristic(s)", self.address, found.len());
        for characteristic in found.iter() {
            trace!("{}: service {} characteristic {} {:?}", self.address, characteristic.service,
                   characteristic.uuid, characteristic.properties);
        }
        lock(&self.connection).characteristics = found.into_iter().map(|c| (c.uuid, c)).collect();
        Ok(())
    }

    async fn disconnect_op(self: Arc<Self>, ctx: OpContext) -> Result<ConnectionState> {
        if let Some(reason) = ctx.cancel_reason() {
            debug!("{}: disconnect cancelled: {}", self.address, reason);
            return Ok(ConnectionState::Cancelled);
        }

        let native = {
            let mut connection = lock(&self.connection);
            if connection.native.is_some() {
                self.set_state_locked(&mut connection, ConnectionState::Disconnecting);
            }
            connection.native.take()
        };
        match native {
            Some(native) => {
                // The link can report DISCONNECTED while the radio stays up
                // until the native connection is released as well
                native.disconnect();
                native.close();
                info!("{}: disconnected", self.address);
            }
            None => debug!("{}: nothing to disconnect", self.address),
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(ConnectionState::Disconnected)
    }

    async fn char_read_op(self: Arc<Self>, ctx: OpContext, uuid: Uuid) -> Result<Vec<u8>> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(Error::Cancelled(reason.to_string()));
        }
        let (native, characteristic) = self.connected_characteristic(uuid)?;

        self.bridge.characteristic_read.drain();
        let attempts = self.config.read_issue_attempts.max(1);
        let mut attempt = 1;
        while !native.read_characteristic(characteristic.handle) {
            if attempt >= attempts {
                return Err(Error::OperationNotIssued(
                    format!("native stack refused to read {} {} times", uuid, attempts)));
            }
            debug!("{}: read of {} not issued, retrying", self.address, uuid);
            attempt += 1;
            tokio::time::sleep(self.config.read_retry_pause).await;
        }

        let event = self.await_completion(&self.bridge.characteristic_read, self.config.read_timeout,
                                          "characteristic read").await?;
        check_identity("read", uuid, event.uuid)?;
        event.status.check()?;
        trace!("{}: read {} -> {:?}", self.address, uuid, event.value);
        Ok(event.value)
    }

    async fn char_write_op(self: Arc<Self>, ctx: OpContext, uuid: Uuid, data: Vec<u8>,
                           require_response: bool) -> Result<()> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(Error::Cancelled(reason.to_string()));
        }
        let (native, characteristic) = self.connected_characteristic(uuid)?;
        let write_type = WriteType::from_require_response(require_response);

        // Never retried: a stack can complete a write without ever calling
        // back and a second attempt would write twice
        self.bridge.characteristic_write.drain();
        if !native.write_characteristic(characteristic.handle, &data, write_type) {
            return Err(Error::OperationNotIssued(format!("native stack refused to write {}", uuid)));
        }

        let event = self.await_completion(&self.bridge.characteristic_write,
                                          Some(self.config.write_timeout),
                                          "characteristic write").await?;
        check_identity("write", uuid, event.uuid)?;
        event.status.check()?;
        Ok(())
    }

    async fn set_notify_op(self: Arc<Self>, ctx: OpContext, uuid: Uuid, enable: bool,
                           callback: Option<NotifyCallback>) -> Result<()> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(Error::Cancelled(reason.to_string()));
        }
        if enable && callback.is_none() {
            return Err(Error::NoCallbackProvided);
        }
        let (native, characteristic) = self.connected_characteristic(uuid)?;

        match callback {
            Some(callback) if enable => {
                self.notifications.insert(uuid, callback);
            }
            _ => {
                self.notifications.remove(&uuid);
            }
        }

        if !native.set_characteristic_notification(characteristic.handle, enable) {
            if enable {
                self.notifications.remove(&uuid);
            }
            return Err(Error::OperationNotIssued(
                format!("native stack refused to {} notifications for {}",
                        if enable { "enable" } else { "disable" }, uuid)));
        }

        let value: &[u8] = if !enable {
            &DISABLE_NOTIFICATION_VALUE
        } else if characteristic.properties.contains(CharacteristicProperties::INDICATE)
            && !characteristic.properties.contains(CharacteristicProperties::NOTIFY) {
            &ENABLE_INDICATION_VALUE
        } else {
            &ENABLE_NOTIFICATION_VALUE
        };
        let written = self.write_descriptor(&native, &characteristic, CLIENT_CHARACTERISTIC_CONFIGURATION,
                                            value).await;
        if written.is_err() && enable {
            self.notifications.remove(&uuid);
        }
        written
    }

    async fn write_descriptor(&self, native: &Arc<dyn NativeGatt>, characteristic: &DiscoveredCharacteristic,
                              descriptor: Uuid, value: &[u8]) -> Result<()> {
        self.bridge.descriptor_write.drain();
        if !native.write_descriptor(characteristic.handle, descriptor, value) {
            return Err(Error::OperationNotIssued(
                format!("native stack refused to write descriptor {} of {}", descriptor, characteristic.uuid)));
        }

        let event = self.await_completion(&self.bridge.descriptor_write,
                                          Some(self.config.descriptor_timeout),
                                          "descriptor write").await?;
        // A late completion for an earlier write that timed out must not be
        // taken as ours
        check_identity("descriptor write", descriptor, event.uuid)?;
        event.status.check()?;
        Ok(())
    }

    async fn descriptor_write_op(self: Arc<Self>, ctx: OpContext, characteristic: Uuid, descriptor: Uuid,
                                 data: Vec<u8>) -> Result<()> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(Error::Cancelled(reason.to_string()));
        }
        let (native, characteristic) = self.connected_characteristic(characteristic)?;
        self.write_descriptor(&native, &characteristic, descriptor, &data).await
    }

    async fn descriptor_read_op(self: Arc<Self>, ctx: OpContext, characteristic: Uuid,
                                descriptor: Uuid) -> Result<Vec<u8>> {
        if let Some(reason) = ctx.cancel_reason() {
            return Err(Error::Cancelled(reason.to_string()));
        }
        let (native, characteristic) = self.connected_characteristic(characteristic)?;

        self.bridge.descriptor_read.drain();
        if !native.read_descriptor(characteristic.handle, descriptor) {
            return Err(Error::OperationNotIssued(
                format!("native stack refused to read descriptor {} of {}", descriptor, characteristic.uuid)));
        }
        let event = self.await_completion(&self.bridge.descriptor_read,
                                          Some(self.config.descriptor_timeout),
                                          "descriptor read").await?;
        check_identity("descriptor read", descriptor, event.uuid)?;
        event.status.check()?;
        Ok(event.value)
    }

    /// Tears the session down after the device dropped the connection
    ///
    /// Runs at the head of the queue so that nothing pending gets issued
    /// against a dead connection.
    async fn proc_state_change_op(self: Arc<Self>, ctx: OpContext, new_state: ConnectionState)
                                  -> Result<ConnectionState> {
        if let Some(reason) = ctx.cancel_reason() {
            debug!("{}: state change handling cancelled: {}", self.address, reason);
            return Ok(ConnectionState::Cancelled);
        }
        warn!("{}: device reported {}", self.address, new_state);

        if let Some(callback) = self.disconnect_callback() {
            self.context.dispatch(Box::new(move || callback(new_state)));
        }

        let reason = format!("{} reported {}", self.address, new_state);
        ctx.queue().cancel_all(&reason).await;

        let native = {
            let mut connection = lock(&self.connection);
            self.set_state_locked(&mut connection, ConnectionState::Disconnected);
            connection.teardown_pending = false;
            connection.characteristics.clear();
            connection.native.take()
        };
        self.notifications.clear();
        if let Some(native) = native {
            native.close();
        }
        Ok(ConnectionState::Disconnected)
    }

    // Returns true if this is the first sign of a disconnect nobody asked for
    fn note_unsolicited_disconnect(&self, new_state: ConnectionState) -> bool {
        let mut connection = lock(&self.connection);
        match connection.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.set_state_locked(&mut connection, new_state);
                !std::mem::replace(&mut connection.teardown_pending, true)
            }
            ConnectionState::Disconnecting if connection.teardown_pending => {
                self.set_state_locked(&mut connection, new_state);
                false
            }
            state => {
                trace!("{}: ignoring {} while {}", self.address, new_state, state);
                false
            }
        }
    }

    fn on_connection_state_changed(self: &Arc<Self>, event: ConnectionStateChanged) {
        debug!("{}: native connection state {:?} (status {})", self.address, event.state, event.status);

        if matches!(event.state, NativeConnectionState::Connected | NativeConnectionState::Disconnected) {
            let waiter = lock(&self.connect_waiter).take();
            if let Some(waiter) = waiter {
                if waiter.send(event.state).is_ok() {
                    return;
                }
            }
        }

        match event.state {
            NativeConnectionState::Disconnecting | NativeConnectionState::Disconnected => {
                let new_state = event.state.as_connection_state();
                if self.note_unsolicited_disconnect(new_state) {
                    let inner = self.clone();
                    let teardown = Operation::new("proc_state_change",
                                                  move |ctx| inner.proc_state_change_op(ctx, new_state));
                    self.queue.enqueue_head(teardown);
                }
            }
            NativeConnectionState::Connected => {
                warn!("{}: spurious connected notification", self.address);
            }
            NativeConnectionState::Connecting => {}
        }
    }

    fn on_characteristic_changed(&self, event: CharacteristicChanged) {
        let callback = self.notifications.get(&event.uuid).map(|entry| entry.value().clone());
        match callback {
            Some(callback) => {
                let CharacteristicChanged { uuid, value } = event;
                self.context.dispatch(Box::new(move || callback(uuid, value)));
            }
            None => trace!("{}: no subscriber for notification from {}", self.address, event.uuid),
        }
    }

    async fn run_connection_monitor(weak_inner: Weak<SessionInner>,
                                    events: UnboundedReceiver<ConnectionStateChanged>) {
        let stream = UnboundedReceiverStream::new(events);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let inner = match weak_inner.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            inner.on_connection_state_changed(event);
        }
        trace!("Connection monitor exiting");
    }

    async fn run_notification_monitor(weak_inner: Weak<SessionInner>,
                                      events: UnboundedReceiver<CharacteristicChanged>) {
        let stream = UnboundedReceiverStream::new(events);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let inner = match weak_inner.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            inner.on_characteristic_changed(event);
        }
        trace!("Notification monitor exiting");
    }

    fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: shutting down", self.address);

        self.queue.close();
        self.worker.shutdown();
        self.queue.cancel_all_blocking("session shut down");

        // A connect that's still waiting gets a closed channel
        lock(&self.connect_waiter).take();
        for monitor in lock(&self.monitors).drain(..) {
            monitor.abort();
        }

        let native = {
            let mut connection = lock(&self.connection);
            if connection.state != ConnectionState::Init {
                self.set_state_locked(&mut connection, ConnectionState::Disconnected);
            }
            connection.native.take()
        };
        if let Some(native) = native {
            native.disconnect();
            native.close();
        }
        self.notifications.clear();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePeripheral;
    use crate::Inline;

    #[test]
    fn session_eq() {
        let shared = SharedWorker::start().unwrap();
        let open = |mac: &str| {
            GattSession::open(mac.parse().unwrap(),
                              Arc::new(FakePeripheral::new()),
                              &shared,
                              Arc::new(Inline),
                              SessionConfig::default()).unwrap()
        };
        let a = open("AA:BB:CC:DD:EE:01");
        let b = open("AA:BB:CC:DD:EE:02");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.state(), ConnectionState::Init);
        a.shutdown();
        b.shutdown();
        shared.shutdown();
    }

    #[test]
    fn mismatched_identity() {
        let a = crate::uuid::uuid_from_u16(0x2902);
        let b = crate::uuid::uuid_from_u16(0x2901);
        assert!(check_identity("descriptor write", a, a).is_ok());
        assert!(matches!(check_identity("descriptor write", a, b), Err(Error::MismatchedOperation(_))));
    }
}
