mod channel;
mod connection;

pub use channel::{PollEvent, StreamChannel};
pub use connection::MSG_LIMIT;
pub use mio::Token;

/// Transport options for a stream channel. Applied to every connection
/// the channel creates.
#[derive(Debug, Clone, Copy)]
pub struct StreamConf {
    /// TCP keepalive idle seconds, 0 disables.
    pub keepalive_secs: u32,
    pub nodelay: bool,
    /// Kernel accept queue length.
    pub backlog: u32,
    /// Largest frame accepted for sending.
    pub send_buffer_limit: usize,
    /// Largest frame accepted on receive.
    pub recv_buffer_limit: usize,
    /// Total bytes the send buffer manager may hold, 0 is unlimited.
    pub send_buffer_max: usize,
    /// Static send block count, 0 keeps the manager dynamic.
    pub send_buffer_static: usize,
    pub recv_buffer_max: usize,
    pub recv_buffer_static: usize,
}

impl Default for StreamConf {
    fn default() -> Self {
        Self {
            keepalive_secs: 60,
            nodelay: true,
            backlog: 128,
            send_buffer_limit: MSG_LIMIT,
            recv_buffer_limit: MSG_LIMIT,
            send_buffer_max: 0,
            send_buffer_static: 0,
            // one frame in flight plus slack for the CRC prefix
            recv_buffer_max: (MSG_LIMIT + 64) * 2,
            recv_buffer_static: 2,
        }
    }
}
