use atbus_channel::RingError;
use atbus_network::NetError;
use thiserror::Error;

/// Unified error taxonomy of the bus. Every public operation reports
/// failures through this type; `code()` gives the stable negative
/// integer carried in failure responses on the wire.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid arguments")]
    Params,
    #[error("internal error")]
    Inner,
    #[error("no data")]
    NoData,
    #[error("buffer limit reached")]
    BuffLimit,
    #[error("allocation failed")]
    Malloc,
    #[error("bad address scheme")]
    Scheme,
    #[error("stream ended")]
    Eof,
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("malformed control message")]
    BadData,
    #[error("target bus id unreachable")]
    InvalidId,
    #[error("unknown or unexpected command")]
    InvalidMsg,
}

impl Error {
    pub fn code(self) -> i32 {
        match self {
            Self::Params => -1,
            Self::Inner => -2,
            Self::NoData => -3,
            Self::BuffLimit => -4,
            Self::Malloc => -5,
            Self::Scheme => -6,
            Self::Eof => -7,
            Self::Ring(e) => match e {
                RingError::Params => -1,
                RingError::NoData => -3,
                RingError::BuffLimit { .. } => -4,
                RingError::SizeTooSmall => -101,
                RingError::BadBlockFastCheck => -201,
                RingError::BadBlockNodeNum => -202,
                RingError::BadBlockBuffSize => -203,
                RingError::BadBlockWriteSeqId => -204,
                RingError::BadBlockCheckSeqId => -205,
                RingError::NodeTimeout => -211,
                RingError::ShmGetFailed => -301,
                RingError::ShmNotFound => -302,
            },
            Self::Net(e) => match e {
                NetError::Params => -1,
                NetError::Scheme => -6,
                NetError::Eof => -7,
                NetError::BuffLimit => -4,
                NetError::SockBindFailed => -401,
                NetError::SockListenFailed => -402,
                NetError::SockConnectFailed => -403,
                NetError::PipeBindFailed => -501,
                NetError::PipeListenFailed => -502,
                NetError::PipeConnectFailed => -503,
                NetError::DnsGetAddrFailed => -601,
                NetError::ConnectionNotFound => -602,
                NetError::WriteFailed => -603,
                NetError::ReadFailed => -604,
                NetError::InvalidSize => -605,
                NetError::BadData => -606,
            },
            Self::BadData => -606,
            Self::InvalidId => -801,
            Self::InvalidMsg => -802,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_negative() {
        assert_eq!(Error::Params.code(), -1);
        assert_eq!(Error::Ring(RingError::NodeTimeout).code(), -211);
        assert_eq!(Error::Net(NetError::ReadFailed).code(), -604);
        assert_eq!(Error::InvalidId.code(), -801);

        for e in [
            Error::Params,
            Error::NoData,
            Error::BuffLimit,
            Error::Scheme,
            Error::BadData,
            Error::InvalidId,
            Error::InvalidMsg,
            Error::Ring(RingError::BadBlockFastCheck),
            Error::Net(NetError::SockConnectFailed),
        ] {
            assert!(e.code() < 0);
        }
    }
}
