use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ::uuid::Uuid;
use anyhow::anyhow;
use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

pub mod uuid;

pub mod result;
pub use result::OperationResult;

pub mod operation;
pub use operation::{OpContext, Operation};

pub mod queue;
pub use queue::OperationQueue;

pub mod worker;
pub use worker::{OperationWorker, SharedWorker};

pub mod bridge;
pub use bridge::{BridgeSender, NativeEventBridge};

pub mod backend;
pub use backend::{
    BackendProvider, CharacteristicHandle, CharacteristicProperties, DiscoveredCharacteristic,
    NativeDevice, NativeGatt, WriteType,
};

pub mod converter;
pub use converter::{CallbackContext, Inline, TokioContext};

pub mod config;
pub use config::SessionConfig;

pub mod session;
pub use session::{DisconnectCallback, GattSession, NotifyCallback};

pub mod request;
pub use request::GattRequest;

pub mod gateway;
pub use gateway::Gateway;

pub mod fake;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// Identifies the remote device a [`GattSession`] talks to
///
/// Native stacks that expose the hardware address get a `MAC`, anything else
/// is kept as an opaque string.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "{}", mac),
            Address::String(s) => write!(f, "{}", s),
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "MAC:{}", mac),
            Address::String(s) => write!(f, "String:{}", s),
        }
    }
}

// Returns None for anything that isn't six colon separated hex octets, so
// the caller can fall back to treating the address as an opaque string.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        parts.try_push(part).ok()?;
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

/// The state of a [`GattSession`]'s connection to its device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Reported by a connect or disconnect request that was discarded before it ran
    Cancelled,
}
impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A connection state as reported by a native stack's state-change callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}
impl NativeConnectionState {
    /// Decodes the integer codes native stacks use (0 = disconnected .. 3 = disconnecting)
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(NativeConnectionState::Disconnected),
            1 => Some(NativeConnectionState::Connecting),
            2 => Some(NativeConnectionState::Connected),
            3 => Some(NativeConnectionState::Disconnecting),
            _ => None,
        }
    }

    pub fn as_connection_state(self) -> ConnectionState {
        match self {
            NativeConnectionState::Disconnected => ConnectionState::Disconnected,
            NativeConnectionState::Connecting => ConnectionState::Connecting,
            NativeConnectionState::Connected => ConnectionState::Connected,
            NativeConnectionState::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Invalid Offset")]
    InvalidOffset,

    #[error("Invalid Attribute Length")]
    InvalidAttributeLength,

    #[error("Congested")]
    Congested,

    #[error("General Failure: {0}")]
    GeneralFailure(String),
}

/// Completion status carried by native GATT events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(2);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(3);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(5);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(6);
    pub const INVALID_OFFSET: GattStatus = GattStatus(7);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(13);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(15);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(143);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }

    pub fn check(self) -> std::result::Result<(), GattError> {
        if self.is_success() {
            return Ok(());
        }
        Err(GATT_STATUS_ERRORS.get(&self.0)
            .cloned()
            .unwrap_or_else(|| GattError::GeneralFailure(format!("GATT status {}", self.0))))
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

lazy_static! {
    static ref GATT_STATUS_ERRORS: HashMap<u16, GattError> = {
        let mut map = HashMap::new();
        map.insert(GattStatus::READ_NOT_PERMITTED.0, GattError::ReadNotPermitted);
        map.insert(GattStatus::WRITE_NOT_PERMITTED.0, GattError::WriteNotPermitted);
        map.insert(GattStatus::INSUFFICIENT_AUTHENTICATION.0, GattError::InsufficientAuthentication);
        map.insert(GattStatus::REQUEST_NOT_SUPPORTED.0, GattError::Unsupported);
        map.insert(GattStatus::INVALID_OFFSET.0, GattError::InvalidOffset);
        map.insert(GattStatus::INVALID_ATTRIBUTE_LENGTH.0, GattError::InvalidAttributeLength);
        map.insert(GattStatus::INSUFFICIENT_ENCRYPTION.0, GattError::InsufficientEncryption);
        map.insert(GattStatus::CONNECTION_CONGESTED.0, GattError::Congested);
        map.insert(GattStatus::FAILURE.0, GattError::GeneralFailure("GATT failure".to_string()));
        map
    };
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Operation not issued: {0}")]
    OperationNotIssued(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Already scanning")]
    AlreadyScanning,

    #[error("Could not discover services: {0}")]
    CouldNotDiscoverServices(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Mismatched operation: {0}")]
    MismatchedOperation(String),

    #[error("No callback provided")]
    NoCallbackProvided,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),

    #[error("GATT protocol error: {0}")]
    Gatt(#[from] GattError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The stable identifier a gateway reports on the wire for this error
    pub fn error_id(&self) -> u32 {
        match self {
            Error::OperationNotIssued(_) => 1,
            Error::OperationTimedOut(_) => 2,
            Error::ScanFailed(_) => 3,
            Error::AlreadyScanning => 4,
            Error::CouldNotDiscoverServices(_) => 5,
            Error::ConnectionError(_) => 6,
            Error::MismatchedOperation(_) => 7,
            Error::NoCallbackProvided => 8,
            Error::Cancelled(_) => 9,
            Error::UnknownCharacteristic(_) => 10,
            Error::Gatt(_) => 11,
            Error::Other(_) => 1000,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport { id: self.error_id(), message: self.to_string() }
    }

    pub(crate) fn not_connected() -> Self {
        Error::ConnectionError("no device connected".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Error {
        Error::Other(anyhow!("Result channel closed: {:?}", err))
    }
}

/// An error as forwarded to remote clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: u32,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;
