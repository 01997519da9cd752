//! Publish once, then consume until the expected number of messages arrived.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConsumerConfig};
use crate::consumer::Consumer;
use crate::error::{Error, HandlerError};
use crate::message::Message;
use crate::producer::Producer;

#[derive(Debug, Clone)]
pub struct Settings {
    /// nsqd TCP address, used by the producer and, without `lookup`, the consumer.
    pub address: String,
    /// nsqlookupd HTTP addresses the consumer discovers nodes from.
    pub lookup: Vec<String>,
    pub topic: String,
    pub channel: String,
    pub payload: Vec<u8>,
    pub max_in_flight: usize,
    /// Number of messages to receive before stopping.
    pub expect: usize,
    pub identify: Config,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            address: "127.0.0.1:4150".into(),
            lookup: Vec::new(),
            topic: "hello-topic".into(),
            channel: "hello-channel".into(),
            payload: b"Hello World".to_vec(),
            max_in_flight: 250,
            expect: 1,
            identify: Config::default(),
        }
    }
}

impl Settings {
    fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(self.topic.clone(), self.channel.clone());
        if self.lookup.is_empty() {
            config.address = Some(self.address.clone());
        } else {
            config.lookup = self.lookup.clone();
        }
        config.max_in_flight = self.max_in_flight;
        config.identify = self.identify.clone();
        config
    }
}

/// Publish `settings.payload`, then subscribe and return the bodies of the
/// first `settings.expect` messages.
///
/// Failing to connect is fatal. A failed publish is logged and consumption
/// still runs.
pub async fn run(settings: Settings) -> Result<Vec<Bytes>, Error> {
    let mut producer = Producer::connect(&settings.address, settings.topic.clone(), &settings.identify).await?;
    let payload = settings.payload.clone();
    let publish = tokio::spawn(async move {
        let published = producer.publish(payload).await;
        if let Err(e) = producer.stop().await {
            warn!("closing producer: {}", e);
        }
        published
    });
    match publish.await? {
        Ok(()) => info!(topic = %settings.topic, "published"),
        Err(e) => error!(topic = %settings.topic, "publish failed: {}", e),
    }

    let mut consumer = Consumer::connect(settings.consumer_config()).await?;
    let expect = settings.expect.max(1);
    let consume = tokio::spawn(async move {
        let stop = CancellationToken::new();
        let done = stop.clone();
        let mut received = Vec::with_capacity(expect);
        let result = consumer.subscribe(|msg: &Message| {
            info!(id = %msg.id(), attempts = msg.attempts(), "NSQ message received, msg: {}", String::from_utf8_lossy(msg.body()));
            received.push(msg.body().clone());
            if received.len() >= expect {
                done.cancel();
            }
            Ok::<_, HandlerError>(())
        }, &stop).await;
        result.map(|()| received)
    });

    consume.await?
}
