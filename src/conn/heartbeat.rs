use std::pin::Pin;
use std::task::{Context, Poll};
use futures::prelude::*;
use futures::ready;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::{NsqCodec, NsqFramed, RawResponse};
use crate::command::Command;
use crate::conn::Response;
use crate::error::Error;

type InnerFramed = Framed<TcpStream, NsqCodec>;

/// Answers `_heartbeat_` with `NOP` and turns `CLOSE_WAIT` into end of stream.
pub struct Heartbeat {
    inner: InnerFramed,
    response_remaining: usize,
    status: Status,
}

enum Status {
    Responding,
    Reading,
}

impl Heartbeat {
    pub(crate) fn new(inner: InnerFramed) -> Self {
        Self { inner, response_remaining: 0, status: Status::Reading }
    }

    fn start_pong(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        ready!(self.inner.poll_ready_unpin(cx)?);
        while self.response_remaining > 0 {
            self.inner.start_send_unpin(Command::Nop)?;
            self.response_remaining -= 1;
        }
        self.status = Status::Responding;
        Poll::Ready(Ok(()))
    }

    fn poll_pong(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        ready!(self.inner.poll_flush_unpin(cx)?);
        self.status = Status::Reading;
        Poll::Ready(Ok(()))
    }
}

impl Stream for Heartbeat {
    type Item = Result<Response, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.response_remaining > 0 {
            ready!(this.start_pong(cx)?);
        }

        if let Status::Responding = this.status {
            ready!(this.poll_pong(cx)?);
        }

        loop {
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(msg)) => {
                    match msg {
                        NsqFramed::Response(RawResponse::Ok) => {
                            return Poll::Ready(Some(Ok(Response::Ok)));
                        }
                        NsqFramed::Response(RawResponse::Heartbeat) => {
                            trace!("heartbeat");
                            this.response_remaining += 1;
                            ready!(this.start_pong(cx)?);
                            ready!(this.poll_pong(cx)?);
                            continue;
                        }
                        NsqFramed::Response(RawResponse::CloseWait) => {
                            return Poll::Ready(None);
                        }
                        NsqFramed::Response(RawResponse::Json(value)) => {
                            return Poll::Ready(Some(Err(Error::protocol(format!("unexpected JSON response: {}", value)))));
                        }
                        NsqFramed::Message(msg) => {
                            return Poll::Ready(Some(Ok(Response::Msg(msg))));
                        }
                        NsqFramed::Error(nsq_error) => {
                            if nsq_error.is_fatal() {
                                return Poll::Ready(Some(Err(nsq_error.into())));
                            } else {
                                return Poll::Ready(Some(Ok(Response::Err(nsq_error))));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl Sink<Command> for Heartbeat {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Command) -> Result<(), Self::Error> {
        self.inner.start_send_unpin(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx)
    }
}
