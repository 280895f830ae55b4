mod ring;
mod shm;

pub use ring::{MemRing, RingChannel, RingConf, RingStats};
pub use shm::ShmRing;
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("invalid arguments")]
    Params,
    #[error("no data available")]
    NoData,
    #[error("buffer limit reached, {need} bytes required")]
    BuffLimit { need: usize },
    #[error("channel region too small")]
    SizeTooSmall,
    #[error("bad block: fast check mismatch")]
    BadBlockFastCheck,
    #[error("bad block: node count mismatch")]
    BadBlockNodeNum,
    #[error("bad block: buffer size out of range")]
    BadBlockBuffSize,
    #[error("bad block: write sequence conflict")]
    BadBlockWriteSeqId,
    /// Reserved: defined for taxonomy completeness, never produced.
    #[error("bad block: check sequence conflict")]
    BadBlockCheckSeqId,
    #[error("write not finished within timeout")]
    NodeTimeout,
    #[error("shared memory mapping failed")]
    ShmGetFailed,
    #[error("shared memory segment not found")]
    ShmNotFound,
}
