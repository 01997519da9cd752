use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::warn;

use crate::codec::{MessageId, NsqMsg};
use crate::command::Command;
use crate::error::Error;

/// Counts delivered but unacknowledged messages over all connections of a consumer.
#[derive(Debug)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    max: usize,
    released: Notify,
}

impl InFlight {
    pub(crate) fn new(max: usize) -> Self {
        Self { count: AtomicUsize::new(0), max, released: Notify::new() }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max).then(|| n + 1))
            .is_ok()
    }

    pub(crate) fn release(&self) {
        let _ = self.count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.released.notify_waiters();
    }

    /// Resolves once every outstanding message was answered.
    pub(crate) async fn settled(&self) {
        loop {
            let released = self.released.notified();
            if self.current() == 0 {
                return;
            }
            released.await;
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Where FIN/REQ/TOUCH for a message go.
#[derive(Debug)]
pub(crate) struct Responder {
    pub(crate) addr: SocketAddr,
    pub(crate) commands: UnboundedSender<Command>,
    pub(crate) in_flight: Arc<InFlight>,
}

/// A message delivered by nsqd.
///
/// It stays in flight until [`finish`](Message::finish) or
/// [`requeue`](Message::requeue). Dropping it unanswered requeues it.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Bytes,
    responder: Option<Responder>,
}

impl Message {
    pub(crate) fn new(msg: NsqMsg, responder: Responder) -> Self {
        Self {
            id: msg.id,
            timestamp: msg.timestamp,
            attempts: msg.attempts,
            body: msg.body,
            responder: Some(responder),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Nanoseconds since the unix epoch at which nsqd received the message.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the nsqd that delivered the message.
    pub fn node(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(|r| r.addr)
    }

    /// Acknowledge the message.
    pub fn finish(mut self) -> Result<(), Error> {
        self.respond(Command::Fin(self.id))
    }

    /// Hand the message back to nsqd for redelivery after `delay`.
    pub fn requeue(mut self, delay: Duration) -> Result<(), Error> {
        self.respond(Command::Req(self.id, delay.as_millis() as u64))
    }

    /// Reset the server side timeout of the message.
    pub fn touch(&self) -> Result<(), Error> {
        match self.responder {
            Some(ref responder) => responder.commands.unbounded_send(Command::Touch(self.id)).map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    fn respond(&mut self, cmd: Command) -> Result<(), Error> {
        let responder = self.responder.take().ok_or(Error::Closed)?;
        responder.in_flight.release();
        responder.commands.unbounded_send(cmd).map_err(|_| Error::Closed)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!(id = %self.id, "message dropped without FIN or REQ, requeueing");
            let _ = self.respond(Command::Req(self.id, 0));
        }
    }
}
