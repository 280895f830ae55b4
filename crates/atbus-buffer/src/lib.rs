mod block;
mod manager;
mod varint;

pub use block::BufferBlock;
pub use manager::{BufferManager, Limit};
use thiserror::Error;
pub use varint::{VARINT_MAX_LEN, read_vint, vint_len, write_vint};

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferError {
    #[error("no buffered data")]
    NoData,
    #[error("buffer byte or block limit reached")]
    BuffLimit,
    #[error("invalid arguments")]
    Params,
}
