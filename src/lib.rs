//! A small NSQ client: a [`Producer`] that publishes to one topic, a
//! [`Consumer`] that hands the messages of a topic/channel to a handler, and
//! the [`driver`] that wires the two together.

mod codec;
mod command;
mod message;
pub mod config;
pub mod conn;
pub mod consumer;
pub mod driver;
pub mod error;
pub mod lookup;
pub mod producer;

pub use codec::MessageId;
pub use command::{Command, MessageBody};
pub use config::{Config, ConsumerConfig, OnHandlerError};
pub use conn::Connection;
pub use consumer::{Consumer, State};
pub use error::{Error, HandlerError, NsqError};
pub use lookup::Lookup;
pub use message::Message;
pub use producer::Producer;

pub const USER_AGENT: &str = concat!("hello-nsq/", env!("CARGO_PKG_VERSION"));
