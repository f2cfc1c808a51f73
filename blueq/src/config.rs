use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for a [`GattSession`](crate::GattSession)
///
/// By default characteristic reads wait indefinitely for their completion
/// while writes give up after ten seconds and descriptor writes after one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub discovery_poll_interval: Duration,
    pub discovery_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub read_issue_attempts: u32,
    pub read_retry_pause: Duration,
    pub write_timeout: Duration,
    pub descriptor_timeout: Duration,
    pub worker_idle_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            request_timeout: Duration::from_secs(30),
            connect_timeout: None,
            discovery_poll_interval: Duration::from_millis(250),
            discovery_timeout: None,
            read_timeout: None,
            read_issue_attempts: 3,
            read_retry_pause: Duration::from_millis(1),
            write_timeout: Duration::from_secs(10),
            descriptor_timeout: Duration::from_secs(1),
            worker_idle_poll: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long the blocking and awaitable conventions wait for a result
    pub fn set_request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = timeout;
        self
    }

    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn set_discovery_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.discovery_poll_interval = interval;
        self
    }

    pub fn set_discovery_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.read_timeout = timeout;
        self
    }

    /// How many times a read is offered to a stack that refuses to issue it
    pub fn set_read_issue_attempts(&mut self, attempts: u32, pause: Duration) -> &mut Self {
        self.read_issue_attempts = attempts.max(1);
        self.read_retry_pause = pause;
        self
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.write_timeout = timeout;
        self
    }

    pub fn set_descriptor_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.descriptor_timeout = timeout;
        self
    }

    pub fn set_worker_idle_poll(&mut self, interval: Duration) -> &mut Self {
        self.worker_idle_poll = interval;
        self
    }
}
