use std::time::Duration;
use serde::{Serialize, Serializer};
use crate::command::Command;
use crate::Error;

const DEFAULT_CLIENT_NAME: &str = "hello_nsq";
const MAX_NAME_LENGTH: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Connection level settings, sent to nsqd as the IDENTIFY body.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,

    // Duration of time between heartbeats. This must be less than read_timeout
    #[serde(serialize_with = "duration_to_ms")]
    pub heartbeat_interval: Duration,

    // Size of the buffer (in bytes) used by nsqd for buffering writes to this connection
    pub output_buffer_size: usize,

    // Timeout used by nsqd before flushing buffered writes (set to 0 to disable).
    //
    // WARNING: configuring clients with an extremely low
    // (< 25ms) output_buffer_timeout has a significant effect
    // on nsqd CPU usage (particularly with > 50 clients connected).
    #[serde(serialize_with = "duration_to_ms")]
    pub output_buffer_timeout: Duration,

    // The server-side message timeout for messages delivered to this client
    #[serde(serialize_with = "duration_to_ms")]
    pub msg_timeout: Duration,

    pub sample_rate: u8,

    pub feature_negotiation: bool,

    // Deadline for establishing the TCP connection
    #[serde(skip_serializing)]
    pub dial_timeout: Duration,

    // Deadline for a reply to IDENTIFY, SUB and PUB
    #[serde(skip_serializing)]
    pub read_timeout: Duration,
}

impl Config {
    pub fn identify(&self) -> Result<Command, Error> {
        let obj = serde_json::to_value(self)?;
        Ok(Command::Identify(obj))
    }

    /// Validate checks that all values are within specified min/max ranges
    pub fn validate(&self) -> Result<(), Error> {
        if self.dial_timeout.is_zero() {
            return Err(Error::Config("dial_timeout must be greater than zero".into()));
        }
        if self.read_timeout < Duration::from_millis(100) {
            return Err(Error::Config("read_timeout must be at least 100ms".into()));
        }
        if self.heartbeat_interval < Duration::from_secs(1) {
            return Err(Error::Config("heartbeat_interval must be at least 1s".into()));
        }
        if self.heartbeat_interval >= self.read_timeout {
            return Err(Error::Config(format!(
                "heartbeat_interval ({:?}) must be less than read_timeout ({:?})",
                self.heartbeat_interval, self.read_timeout,
            )));
        }
        if self.sample_rate > 99 {
            return Err(Error::Config(format!("sample_rate {} is out of range 0..=99", self.sample_rate)));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_id: DEFAULT_CLIENT_NAME.into(),
            hostname: ::hostname::get_hostname().unwrap_or_else(|| "unknown".to_owned()),
            user_agent: crate::USER_AGENT.into(),
            heartbeat_interval: Duration::from_secs(30),
            output_buffer_size: 1024*16,
            output_buffer_timeout: Duration::from_millis(250),
            msg_timeout: Duration::from_millis(60000),
            sample_rate: 0,
            feature_negotiation: true,
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
        }
    }
}

fn duration_to_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// What `Consumer::subscribe` does after a handler error.
///
/// The failed message is requeued in both cases, never finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnHandlerError {
    /// Drain the consumer and return the handler's error.
    #[default]
    Stop,
    /// Log the error and keep consuming.
    Continue,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub channel: String,

    /// A single nsqd TCP address, e.g. `127.0.0.1:4150`.
    pub address: Option<String>,

    /// nsqlookupd HTTP addresses used to discover nsqd nodes when `address` is not set.
    pub lookup: Vec<String>,

    // Maximum number of unacknowledged messages, over all nodes
    pub max_in_flight: usize,

    pub on_handler_error: OnHandlerError,

    pub requeue_delay: Duration,

    // How long to wait for CLOSE_WAIT after CLS
    pub drain_timeout: Duration,

    pub identify: Config,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        ConsumerConfig {
            topic: topic.into(),
            channel: channel.into(),
            address: None,
            lookup: Vec::new(),
            max_in_flight: 1,
            on_handler_error: OnHandlerError::default(),
            requeue_delay: Duration::ZERO,
            drain_timeout: Duration::from_secs(5),
            identify: Config::default(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_name("topic", &self.topic)?;
        validate_name("channel", &self.channel)?;
        match (&self.address, self.lookup.is_empty()) {
            (Some(_), false) => {
                return Err(Error::Config("set either address or lookup, not both".into()));
            }
            (None, true) => {
                return Err(Error::Config("either address or lookup must be set".into()));
            }
            _ => {}
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".into()));
        }
        self.identify.validate()
    }
}

/// Topic and channel names are 1 to 64 characters of `[.a-zA-Z0-9_-]`,
/// optionally ending with `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), Error> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName { kind, name: name.to_owned() })
    }
}
