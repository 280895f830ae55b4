mod address;
pub mod stream;

pub use address::{ChannelAddress, Scheme, make_address, resolve};
pub use stream::{MSG_LIMIT, PollEvent, StreamChannel, StreamConf, Token};
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("invalid arguments")]
    Params,
    #[error("unrecognized or unsupported address scheme")]
    Scheme,
    #[error("send buffer limit reached")]
    BuffLimit,
    #[error("frame exceeds the configured size limit")]
    InvalidSize,
    #[error("frame checksum mismatch")]
    BadData,
    #[error("stream closed by peer")]
    Eof,
    #[error("transport write failed")]
    WriteFailed,
    #[error("transport read failed")]
    ReadFailed,
    #[error("no connection for this token")]
    ConnectionNotFound,
    #[error("dns resolution failed")]
    DnsGetAddrFailed,
    #[error("socket bind failed")]
    SockBindFailed,
    #[error("socket listen failed")]
    SockListenFailed,
    #[error("socket connect failed")]
    SockConnectFailed,
    #[error("pipe bind failed")]
    PipeBindFailed,
    #[error("pipe listen failed")]
    PipeListenFailed,
    #[error("pipe connect failed")]
    PipeConnectFailed,
}
