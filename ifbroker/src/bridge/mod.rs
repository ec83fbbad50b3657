//! Supervisor-helper bridge: wire protocol, framed codecs, and the byte
//! channel to the privileged helper process.

pub mod codec;
pub mod protocol;
pub mod transport;
