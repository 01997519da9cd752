//! NSQ TCP connecting steps:
//!
//! ```plain
//! >>  V2
//! >>IDENTIFY
//! <<{
//!       "max_rdy_count": 2500,
//!       "version": "1.2.1",
//!       "max_msg_timeout": 900000,
//!       "msg_timeout": 60000,
//!       "tls_v1": false,
//!       "deflate": false,
//!       "snappy": false,
//!       "sample_rate": 0,
//!       "auth_required": false,
//!       "output_buffer_size": 16384,
//!       "output_buffer_timeout": 250
//!   }
//!
//! >>PUB/MPUB/DPUB
//! // Or
//! >>SUB topic channel
//! >>RDY 1
//!
//! ```
//! See [NSQ TCP Protocol Spec](https://nsq.io/clients/tcp_protocol_spec.html) to read more.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{
    prelude::*,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{trace, debug};

use crate::error::Error;
use crate::codec::{NsqCodec, NsqFramed, RawResponse};
use crate::command::Command;
use crate::conn::{Heartbeat, Response};
use crate::config::Config;

pub struct Connection {
    addr: SocketAddr,
    transport: Heartbeat,
    identify: IdentifyResponse,
    read_timeout: Duration,
}

pub type ConnSink = SplitSink<Heartbeat, Command>;
pub type ConnStream = SplitStream<Heartbeat>;

/// nsqd's answer to IDENTIFY when feature negotiation is on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: u64,
    pub version: String,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub snappy: bool,
    pub auth_required: bool,
    pub sample_rate: i32,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        IdentifyResponse {
            max_rdy_count: 2500,
            version: String::new(),
            max_msg_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            snappy: false,
            auth_required: false,
            sample_rate: 0,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

impl Connection {
    /// Dial `addr` and run the `  V2` + IDENTIFY handshake.
    ///
    /// Both steps are bounded by `config.dial_timeout` and `config.read_timeout`.
    pub async fn connect(addr: &str, config: &Config) -> Result<Self, Error> {
        let tcp = match tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr)).await {
            Ok(tcp) => tcp?,
            Err(_) => {
                return Err(Error::DialTimeout { addr: addr.to_owned(), timeout: config.dial_timeout });
            }
        };
        let peer = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;
        let mut framed = Framed::new(tcp, NsqCodec::new());

        let identify = config.identify()?;
        trace!("send identify: {:?}", &identify);
        framed.feed(Command::Version).await?;
        framed.send(identify).await?;

        let response = read_response(&mut framed, addr, config.read_timeout).await?;
        trace!("identify response: {:?}", response);

        let identify: IdentifyResponse = match response {
            // feature_negotiation false response Ok
            NsqFramed::Response(RawResponse::Ok) => IdentifyResponse::default(),
            // feature_negotiation true response Json object
            NsqFramed::Response(RawResponse::Json(value)) => serde_json::from_value(value)?,
            NsqFramed::Error(e) => return Err(e.into()),
            other => {
                return Err(Error::protocol(format!("unexpected IDENTIFY response: {:?}", other)));
            }
        };

        if identify.auth_required {
            return Err(Error::AuthRequired);
        }
        if identify.tls_v1 || identify.snappy || identify.deflate {
            return Err(Error::protocol("nsqd negotiated a stream upgrade that was not requested"));
        }

        debug!(%peer, version = %identify.version, max_rdy_count = identify.max_rdy_count, "connected");
        Ok(Self {
            addr: peer,
            transport: Heartbeat::new(framed),
            identify,
            read_timeout: config.read_timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn identify_response(&self) -> &IdentifyResponse {
        &self.identify
    }

    /// Send `Command` to the server
    pub async fn send(&mut self, cmd: Command) -> Result<(), Error> {
        self.transport.send(cmd).await
    }

    /// Receive from the server, waiting at most `read_timeout`
    pub async fn receive(&mut self) -> Result<Response, Error> {
        match tokio::time::timeout(self.read_timeout, self.transport.next()).await {
            Ok(Some(r)) => r,
            Ok(None) => Err(Error::unexpected_eof()),
            Err(_) => Err(Error::ReadTimeout { addr: self.addr.to_string(), timeout: self.read_timeout }),
        }
    }

    /// `SUB` and wait for the `OK`.
    pub async fn subscribe(&mut self, topic: &str, channel: &str) -> Result<(), Error> {
        self.send(Command::Sub(topic.to_owned(), channel.to_owned())).await?;
        match self.receive().await? {
            Response::Ok => Ok(()),
            Response::Err(e) => Err(e.into()),
            Response::Msg(_) => Err(Error::protocol("message received before subscribing")),
        }
    }

    /// Flush pending commands and shut the socket down.
    pub async fn close(mut self) -> Result<(), Error> {
        self.transport.close().await
    }

    pub fn split(self) -> (ConnSink, ConnStream) {
        self.transport.split()
    }
}

async fn read_response(framed: &mut Framed<TcpStream, NsqCodec>, addr: &str, timeout: Duration) -> Result<NsqFramed, Error> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(response)) => response,
        Ok(None) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        Err(_) => Err(Error::ReadTimeout { addr: addr.to_owned(), timeout }),
    }
}
