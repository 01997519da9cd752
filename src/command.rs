use serde_json::Value as JsonValue;

use crate::codec::MessageId;

pub type MessageBody = Vec<u8>;

/// A command sent to nsqd: a header line, optionally followed by a
/// length-prefixed body.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// The `  V2` magic that opens every connection. No newline.
    Version,
    /// Feature negotiation, with the client metadata as JSON body.
    Identify(JsonValue),
    /// `SUB <topic> <channel>`
    Sub(String, String),
    Pub(String, MessageBody),
    /// Atomic batch, all messages or none.
    Mpub(String, Vec<MessageBody>),
    /// Deferred publish, deferral in milliseconds.
    Dpub(String, u64, MessageBody),
    /// How many messages nsqd may push before waiting for FIN/REQ.
    Rdy(u64),
    Fin(MessageId),
    /// Requeue, delay in milliseconds.
    Req(MessageId, u64),
    /// Reset the in-flight timeout of a message.
    Touch(MessageId),
    /// `CLS`, nsqd stops sending and answers `CLOSE_WAIT`.
    Close,
    /// Answer to a heartbeat.
    Nop,
}

pub enum Body<'a> {
    Binary(&'a MessageBody),
    /// MPUB: count, then each message with its own length.
    Messages(&'a [MessageBody]),
    Json(&'a JsonValue),
}

impl Command {
    /// The command line, newline terminated, except for the magic.
    pub fn header(&self) -> String {
        use self::Command::*;
        let name = self.name();
        match *self {
            Version => name.to_owned(),
            Identify(..) | Close | Nop => format!("{}\n", name),
            Pub(ref topic, _) | Mpub(ref topic, _) => format!("{} {}\n", name, topic),
            Fin(ref id) | Touch(ref id) => format!("{} {}\n", name, id),
            Rdy(count) => format!("{} {}\n", name, count),
            Sub(ref topic, ref channel) => format!("{} {} {}\n", name, topic, channel),
            Dpub(ref topic, defer_ms, _) => format!("{} {} {}\n", name, topic, defer_ms),
            Req(ref id, delay_ms) => format!("{} {} {}\n", name, id, delay_ms),
        }
    }

    pub fn body(&self) -> Option<Body> {
        use self::Command::*;
        match *self {
            Identify(ref value) => Some(Body::Json(value)),
            Pub(_, ref body) | Dpub(_, _, ref body) => Some(Body::Binary(body)),
            Mpub(_, ref messages) => Some(Body::Messages(messages)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        use self::Command::*;
        match *self {
            Version => "  V2",
            Identify(..) => "IDENTIFY",
            Sub(..) => "SUB",
            Pub(..) => "PUB",
            Mpub(..) => "MPUB",
            Dpub(..) => "DPUB",
            Rdy(..) => "RDY",
            Fin(..) => "FIN",
            Req(..) => "REQ",
            Touch(..) => "TOUCH",
            Close => "CLS",
            Nop => "NOP",
        }
    }
}
