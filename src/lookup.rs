//! Client for the nsqlookupd HTTP API, used to discover the nsqd nodes of a topic.

use std::collections::BTreeSet;

use reqwest::StatusCode;
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::error::Error;

pub struct Lookup {
    client: reqwest::Client,
    endpoint: Url,
}

/// An nsqd node as registered in nsqlookupd.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Producer {
    pub remote_address: String,
    pub hostname: String,
    pub broadcast_address: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
    pub tombstones: Vec<bool>,
    pub topics: Vec<String>,
}

impl Producer {
    /// The address consumers should dial.
    pub fn tcp_address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LookupResponse {
    pub channels: Vec<String>,
    pub producers: Vec<Producer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Channels {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Nodes {
    pub producers: Vec<Producer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Info {
    pub version: String,
}

// nsqlookupd before 1.0 wrapped every body in `{"status_code", "status_txt", "data"}`
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Legacy { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Legacy { data } => data,
            Envelope::Bare(data) => data,
        }
    }
}

impl Lookup {
    /// `endpoint` is the nsqlookupd HTTP address, with or without the `http://` scheme.
    ///
    /// Requests use the dial and read timeouts of `Config::default()`.
    pub fn new(endpoint: &str) -> Result<Self, Error> {
        Self::with_config(endpoint, &Config::default())
    }

    /// Like [`new`](Lookup::new), with `config.dial_timeout` bounding the
    /// connect and `config.read_timeout` the whole request.
    pub fn with_config(endpoint: &str, config: &Config) -> Result<Self, Error> {
        let endpoint = if endpoint.contains("://") {
            Url::parse(endpoint)?
        } else {
            Url::parse(&format!("http://{}", endpoint))?
        };
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(config.dial_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    /// Returns a list of producers for a topic
    pub async fn lookup<S: AsRef<str>>(&self, topic: S) -> Result<LookupResponse, Error> {
        let url = self.url("lookup", Some(topic.as_ref()))?;
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            // TOPIC_NOT_FOUND
            return Ok(LookupResponse::default());
        }
        decode(resp).await
    }

    /// Returns a list of all known topics
    pub async fn topics(&self) -> Result<Topics, Error> {
        self.get("topics", None).await
    }

    /// Returns a list of all known channels of a topic
    pub async fn channels<S: AsRef<str>>(&self, topic: S) -> Result<Channels, Error> {
        self.get("channels", Some(topic.as_ref())).await
    }

    /// Returns a list of all known `nsqd`
    pub async fn nodes(&self) -> Result<Nodes, Error> {
        self.get("nodes", None).await
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let url = self.url("ping", None)?;
        self.client.get(url).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn info(&self) -> Result<Info, Error> {
        self.get("info", None).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, topic: Option<&str>) -> Result<T, Error> {
        let url = self.url(path, topic)?;
        let resp = self.client.get(url).send().await?;
        decode(resp).await
    }

    fn url(&self, path: &str, topic: Option<&str>) -> Result<Url, Error> {
        let mut url = self.endpoint.join(path)?;
        if let Some(topic) = topic {
            url.query_pairs_mut().append_pair("topic", topic);
        }
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let body = resp.error_for_status()?.bytes().await?;
    let envelope: Envelope<T> = serde_json::from_slice(&body)?;
    Ok(envelope.into_inner())
}

/// Ask every lookup address for the producers of `topic` and return their
/// deduplicated TCP addresses.
pub(crate) async fn discover(lookup_addrs: &[String], topic: &str, config: &Config) -> Result<Vec<String>, Error> {
    let mut nodes = BTreeSet::new();
    let mut last_error = None;

    for addr in lookup_addrs {
        let result = match Lookup::with_config(addr, config) {
            Ok(lookup) => lookup.lookup(topic).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(resp) => {
                debug!(lookup = %addr, producers = resp.producers.len(), "lookup");
                nodes.extend(resp.producers.iter().map(Producer::tcp_address));
            }
            Err(e) => {
                warn!(lookup = %addr, "lookup failed: {}", e);
                last_error = Some(e);
            }
        }
    }

    match (nodes.is_empty(), last_error) {
        (false, _) => Ok(nodes.into_iter().collect()),
        (true, Some(e)) => Err(e),
        (true, None) => Err(Error::NoNodes(topic.to_owned())),
    }
}
