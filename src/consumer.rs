use std::net::SocketAddr;
use std::sync::Arc;

use futures::{
    prelude::*,
    channel::mpsc::{self, UnboundedSender},
    stream::{BoxStream, SelectAll},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::{ConsumerConfig, OnHandlerError};
use crate::conn::{Connection, Response};
use crate::error::{Error, HandlerError};
use crate::lookup;
use crate::message::{InFlight, Message, Responder};

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Connected and subscribed, `RDY 0`.
    Created,
    /// `RDY` sent, messages are flowing.
    Started,
    /// `RDY 0` and `CLS` sent, waiting for `CLOSE_WAIT`.
    Draining,
    Stopped,
}

struct Node {
    addr: SocketAddr,
    max_rdy_count: u64,
    commands: UnboundedSender<Command>,
}

impl Node {
    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.commands.unbounded_send(cmd).map_err(|_| Error::Closed)
    }
}

type Incoming = SelectAll<BoxStream<'static, (usize, Result<Response, Error>)>>;

/// Subscribes to one topic/channel on one or more nsqd nodes.
pub struct Consumer {
    config: ConsumerConfig,
    nodes: Vec<Node>,
    incoming: Incoming,
    in_flight: Arc<InFlight>,
    state: State,
}

impl Consumer {
    /// Connect and `SUB` to the configured address, or to every node the
    /// lookup addresses know for the topic.
    ///
    /// With a single address any connection failure is returned. With lookup,
    /// unreachable nodes are skipped as long as one node is left.
    pub async fn connect(config: ConsumerConfig) -> Result<Self, Error> {
        config.validate()?;

        let addrs = match config.address {
            Some(ref addr) => vec![addr.clone()],
            None => lookup::discover(&config.lookup, &config.topic, &config.identify).await?,
        };

        let mut nodes = Vec::with_capacity(addrs.len());
        let mut incoming = SelectAll::new();
        let mut last_error = None;

        for addr in &addrs {
            match connect_node(addr, &config).await {
                Ok(conn) => {
                    let (node, stream) = spawn_node(conn, nodes.len());
                    nodes.push(node);
                    incoming.push(stream);
                }
                Err(e) if config.address.is_some() => return Err(e),
                Err(e) => {
                    warn!(node = %addr, "skipping nsqd: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if nodes.is_empty() {
            return Err(last_error.unwrap_or_else(|| Error::NoNodes(config.topic.clone())));
        }

        info!(topic = %config.topic, channel = %config.channel, nodes = nodes.len(), "subscribed");
        Ok(Self {
            in_flight: Arc::new(InFlight::new(config.max_in_flight)),
            config,
            nodes,
            incoming,
            state: State::Created,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Messages delivered but not finished or requeued yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    pub fn nodes(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.addr).collect()
    }

    /// Send `RDY` to every node. The counts add up to `max_in_flight` unless
    /// there are more nodes than that, in which case every node gets 1.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.state {
            State::Created => {}
            State::Started => return Ok(()),
            State::Draining | State::Stopped => return Err(Error::Closed),
        }
        let counts = rdy_counts(self.config.max_in_flight, self.nodes.len());
        for (node, count) in self.nodes.iter().zip(counts) {
            let count = count.min(node.max_rdy_count);
            debug!(node = %node.addr, count, "RDY");
            node.send(Command::Rdy(count))?;
        }
        self.state = State::Started;
        Ok(())
    }

    /// Wait for the next message, or `None` once `stop` is cancelled (the
    /// consumer is drained first) or every connection closed.
    ///
    /// Draining waits up to `drain_timeout` for messages still held by the
    /// caller, so answer them from another task.
    ///
    /// A message arriving while `max_in_flight` messages are outstanding is
    /// requeued instead of returned.
    pub async fn next_message(&mut self, stop: &CancellationToken) -> Result<Option<Message>, Error> {
        match self.state {
            State::Created => self.start()?,
            State::Started => {}
            State::Draining | State::Stopped => return Ok(None),
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                item = self.incoming.next() => Some(item),
            };

            let (idx, response) = match item {
                None => {
                    self.drain().await;
                    return Ok(None);
                }
                Some(None) => {
                    info!("all nsqd connections closed");
                    self.shutdown();
                    return Ok(None);
                }
                Some(Some(item)) => item,
            };

            let node = &self.nodes[idx];
            match response {
                Ok(Response::Msg(msg)) => {
                    if !self.in_flight.try_acquire() {
                        warn!(node = %node.addr, id = %msg.id, max_in_flight = self.config.max_in_flight,
                            "too many messages in flight, requeueing");
                        let _ = node.send(Command::Req(msg.id, 0));
                        continue;
                    }
                    let responder = Responder {
                        addr: node.addr,
                        commands: node.commands.clone(),
                        in_flight: Arc::clone(&self.in_flight),
                    };
                    return Ok(Some(Message::new(msg, responder)));
                }
                Ok(Response::Ok) => continue,
                Ok(Response::Err(e)) => {
                    warn!(node = %node.addr, "nsqd: {}", e);
                    continue;
                }
                Err(e) => {
                    error!(node = %node.addr, "connection failed: {}", e);
                    self.shutdown();
                    return Err(e);
                }
            }
        }
    }

    /// Deliver messages to `handler` one at a time until `stop` is cancelled.
    ///
    /// A message is finished only after the handler returned `Ok`. On a
    /// handler error it is requeued, and the subscription stops with that
    /// error or goes on, depending on `on_handler_error`.
    pub async fn subscribe<F, E>(&mut self, mut handler: F, stop: &CancellationToken) -> Result<(), Error>
    where
        F: FnMut(&Message) -> Result<(), E>,
        E: Into<HandlerError>,
    {
        self.start()?;
        while let Some(message) = self.next_message(stop).await? {
            match handler(&message) {
                Ok(()) => {
                    if let Err(e) = message.finish() {
                        self.shutdown();
                        return Err(e);
                    }
                }
                Err(e) => {
                    let e = e.into();
                    let id = message.id();
                    if let Err(requeue_error) = message.requeue(self.config.requeue_delay) {
                        error!(%id, "handler failed ({}) and the message could not be requeued", e);
                        self.shutdown();
                        return Err(requeue_error);
                    }
                    match self.config.on_handler_error {
                        OnHandlerError::Stop => {
                            error!(%id, "handler failed, stopping: {}", e);
                            self.drain().await;
                            return Err(Error::Handler(e));
                        }
                        OnHandlerError::Continue => {
                            warn!(%id, "handler failed, message requeued: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain and close every connection.
    pub async fn stop(&mut self) {
        self.drain().await
    }

    // RDY 0 + CLS, requeue whatever still arrives, wait for CLOSE_WAIT and
    // for messages held elsewhere to be answered. Both share `drain_timeout`.
    async fn drain(&mut self) {
        match self.state {
            State::Draining | State::Stopped => return,
            State::Created | State::Started => {}
        }
        self.state = State::Draining;
        info!(in_flight = self.in_flight.current(), "draining");

        for node in &self.nodes {
            let _ = node.send(Command::Rdy(0));
            let _ = node.send(Command::Close);
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let nodes = &self.nodes;
        let incoming = &mut self.incoming;
        let drained = tokio::time::timeout_at(deadline, async move {
            while let Some((idx, response)) = incoming.next().await {
                match response {
                    Ok(Response::Msg(msg)) => {
                        debug!(id = %msg.id, "requeueing message received while draining");
                        let _ = nodes[idx].send(Command::Req(msg.id, 0));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(node = %nodes[idx].addr, "error while draining: {}", e);
                    }
                }
            }
        }).await;

        if drained.is_err() {
            warn!(timeout = ?self.config.drain_timeout, "no CLOSE_WAIT before the drain timeout");
        }

        // the writers stay up so FIN/REQ from held messages still reach nsqd
        if tokio::time::timeout_at(deadline, self.in_flight.settled()).await.is_err() {
            warn!(in_flight = self.in_flight.current(), "closing with unanswered messages, nsqd will redeliver them");
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for node in self.nodes.drain(..) {
            node.commands.close_channel();
        }
        self.incoming = SelectAll::new();
        self.state = State::Stopped;
        debug!("consumer stopped");
    }
}

async fn connect_node(addr: &str, config: &ConsumerConfig) -> Result<Connection, Error> {
    let mut conn = Connection::connect(addr, &config.identify).await?;
    conn.subscribe(&config.topic, &config.channel).await?;
    Ok(conn)
}

// The writer task owns the sink half, so message handles can answer without
// borrowing the consumer.
fn spawn_node(conn: Connection, idx: usize) -> (Node, BoxStream<'static, (usize, Result<Response, Error>)>) {
    let addr = conn.addr();
    let max_rdy_count = conn.identify_response().max_rdy_count.max(1);
    let (sink, stream) = conn.split();
    let (tx, rx) = mpsc::unbounded();

    tokio::spawn(async move {
        if let Err(e) = rx.map(Ok::<_, Error>).forward(sink).await {
            warn!(node = %addr, "writer stopped: {}", e);
        }
    });

    let node = Node { addr, max_rdy_count, commands: tx };
    (node, stream.map(move |r| (idx, r)).boxed())
}

fn rdy_counts(max_in_flight: usize, nodes: usize) -> Vec<u64> {
    let base = max_in_flight / nodes;
    let rem = max_in_flight % nodes;
    (0..nodes)
        .map(|i| (base + usize::from(i < rem)).max(1) as u64)
        .collect()
}
