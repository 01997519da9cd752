use crate::error::NsqError;
use crate::codec::NsqMsg;

mod heartbeat;
pub mod connection;

pub(crate) use heartbeat::Heartbeat;
pub use connection::Connection;

/// What a connection yields once heartbeats and `CLOSE_WAIT` are handled.
#[derive(Debug)]
pub enum Response {
    Ok,
    /// A non-fatal error frame, e.g. `E_FIN_FAILED`.
    Err(NsqError),
    Msg(NsqMsg),
}
