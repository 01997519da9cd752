use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Config, validate_name};
use crate::error::Error;
use crate::command::{Command, MessageBody};
use crate::conn::{Connection, Response};

/// Publishes to one topic over one nsqd connection.
pub struct Producer {
    conn: Connection,
    topic: String,
}

impl Producer {
    /// Connect to the nsqd at `addr`. Fails fast if it is unreachable.
    pub async fn connect(addr: &str, topic: impl Into<String>, config: &Config) -> Result<Self, Error> {
        let topic = topic.into();
        validate_name("topic", &topic)?;
        config.validate()?;
        let conn = Connection::connect(addr, config).await?;
        Ok(Self { conn, topic })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a message to the topic, returning once nsqd acknowledged it
    pub async fn publish(&mut self, msg: impl Into<MessageBody>) -> Result<(), Error> {
        let cmd = Command::Pub(self.topic.clone(), msg.into());
        self.request(cmd).await
    }

    /// Publish multiple messages to the topic (atomically):
    ///
    /// NOTE: available in nsqd v0.2.16+
    pub async fn multi_publish<M: Into<MessageBody>>(&mut self, msgs: Vec<M>) -> Result<(), Error> {
        if msgs.is_empty() {
            return Err(Error::Config("MPUB needs at least one message".into()));
        }
        let msgs = msgs.into_iter().map(Into::into).collect();
        self.request(Command::Mpub(self.topic.clone(), msgs)).await
    }

    /// Publish a deferred message to the topic:
    ///
    /// NOTE: available in nsqd v0.3.6+
    pub async fn deferred_publish(&mut self, defer: Duration, msg: impl Into<MessageBody>) -> Result<(), Error> {
        let cmd = Command::Dpub(self.topic.clone(), defer.as_millis() as u64, msg.into());
        self.request(cmd).await
    }

    /// Close the connection. Messages already acknowledged are kept by nsqd.
    pub async fn stop(self) -> Result<(), Error> {
        debug!(addr = %self.conn.addr(), "stopping producer");
        self.conn.close().await
    }

    async fn request(&mut self, cmd: Command) -> Result<(), Error> {
        self.conn.send(cmd).await?;
        match self.conn.receive().await? {
            Response::Ok => Ok(()),
            Response::Err(e) => {
                warn!(topic = %self.topic, "publish rejected: {}", e);
                Err(e.into())
            }
            Response::Msg(_) => Err(Error::protocol("producer connection received a message")),
        }
    }
}
