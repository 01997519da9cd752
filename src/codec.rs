use std::fmt;
use std::str;

use serde_json::{self, Value as JsonValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Encoder, Decoder};

use crate::command::{Command, Body};
use crate::error::{Result, Error, NsqError};

const SIZE_LEN: usize = 4;
const FRAME_TYPE_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 8;
const ATTEMPTS_LEN: usize = 2;
const MESSAGE_ID_LEN: usize = 16;

// nsqd's own --max-msg-size defaults to 1MiB
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR:    i32 = 1;
const FRAME_TYPE_MESSAGE:  i32 = 2;

const HEARTBEAT_RESPONSE: &str = "_heartbeat_";
const OK_RESPONSE: &str = "OK";
const CLOSE_WAIT: &str = "CLOSE_WAIT";

#[derive(Debug, Default)]
pub struct NsqCodec;

impl NsqCodec {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
pub enum NsqFramed {
    Response(RawResponse),
    Error(NsqError),
    Message(NsqMsg),
}

#[derive(Debug, PartialEq)]
pub enum RawResponse {
    Ok,
    Heartbeat,
    CloseWait,
    Json(JsonValue),
}

/// The 16 byte, hex encoded id nsqd assigns to every message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; MESSAGE_ID_LEN]> for MessageId {
    fn from(id: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

#[derive(Debug, Clone)]
pub struct NsqMsg {
    pub(crate) timestamp: i64,
    pub(crate) attempts: u16,
    pub(crate) id: MessageId,
    pub(crate) body: Bytes,
}

impl Encoder<Command> for NsqCodec {
    type Error = Error;

    fn encode(&mut self, cmd: Command, buf: &mut BytesMut) -> Result<()> {
        let header = cmd.header();
        buf.reserve(header.len());
        buf.extend_from_slice(header.as_bytes());

        match cmd.body() {
            Some(Body::Binary(bin)) => {
                buf.reserve(bin.len() + SIZE_LEN);
                buf.put_u32(bin.len() as u32);
                buf.extend_from_slice(bin);
            }
            Some(Body::Messages(msgs)) => {
                // [size][num messages]([message size][message])*
                let len = msgs.iter().map(|msg| msg.len() + SIZE_LEN).sum::<usize>() + SIZE_LEN;
                buf.reserve(len + SIZE_LEN);
                buf.put_u32(len as u32);
                buf.put_u32(msgs.len() as u32);
                for msg in msgs {
                    buf.put_u32(msg.len() as u32);
                    buf.extend_from_slice(msg);
                }
            }
            Some(Body::Json(json)) => {
                let body = serde_json::to_vec(json)?;
                buf.reserve(body.len() + SIZE_LEN);
                buf.put_u32(body.len() as u32);
                buf.extend_from_slice(&body);
            }
            None => {}
        }

        Ok(())
    }
}

impl Decoder for NsqCodec {
    type Item = NsqFramed;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if buf.len() < SIZE_LEN {
            return Ok(None)
        }

        let size = (&buf[..SIZE_LEN]).get_i32();
        if size < FRAME_TYPE_LEN as i32 {
            return Err(Error::protocol(format!("invalid frame size {}", size)));
        }
        let size = size as usize;
        if size > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!("frame of {} bytes exceeds the {} byte limit", size, MAX_FRAME_SIZE)));
        }
        if buf.len() < SIZE_LEN + size {
            buf.reserve(SIZE_LEN + size - buf.len());
            return Ok(None)
        }

        buf.advance(SIZE_LEN);
        let mut frame = buf.split_to(size);
        let frame_type = frame.get_i32();

        let item = match frame_type {
            FRAME_TYPE_RESPONSE => {
                NsqFramed::Response(decode_response(&frame)?)
            }
            FRAME_TYPE_ERROR => {
                NsqFramed::Error(decode_error(&frame)?)
            }
            FRAME_TYPE_MESSAGE => {
                NsqFramed::Message(decode_message(frame)?)
            }
            x => {
                return Err(Error::protocol(format!("unknown frame type {}", x)));
            }
        };

        Ok(Some(item))
    }
}

fn decode_message(mut frame: BytesMut) -> Result<NsqMsg> {
    if frame.len() < TIMESTAMP_LEN + ATTEMPTS_LEN + MESSAGE_ID_LEN {
        return Err(Error::protocol(format!("message frame too short: {} bytes", frame.len())));
    }
    let timestamp = frame.get_i64();
    let attempts = frame.get_u16();
    let mut id = [0u8; MESSAGE_ID_LEN];
    frame.copy_to_slice(&mut id);

    Ok(NsqMsg {
        timestamp,
        attempts,
        id: MessageId(id),
        body: frame.freeze(),
    })
}

fn decode_error(frame: &[u8]) -> Result<NsqError> {
    let err = str::from_utf8(frame)?;
    let err = match err.find(' ') {
        Some(idx) => {
            let (code, desc) = err.split_at(idx);
            NsqError::new(code, desc.trim())
        }
        None => {
            NsqError::new(err, "")
        }
    };
    Ok(err)
}

fn decode_response(frame: &[u8]) -> Result<RawResponse> {
    match str::from_utf8(frame)? {
        OK_RESPONSE => Ok(RawResponse::Ok),
        CLOSE_WAIT => Ok(RawResponse::CloseWait),
        HEARTBEAT_RESPONSE => Ok(RawResponse::Heartbeat),
        body => Ok(RawResponse::Json(serde_json::from_str(body)?)),
    }
}
