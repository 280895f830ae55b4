use atbus_channel::{RingChannel, ShmRing};
use atbus_network::{ChannelAddress, Token};
use bitflags::bitflags;

use crate::protocol::BusId;

/// Node-local connection identifier, stable for the connection's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        /// Drained from the node's periodic `proc` pump.
        const REG_PROC = 1;
        /// Backed by an event-loop file descriptor.
        const REG_FD = 1 << 1;
        /// Peer shares this process's address space.
        const ACCESS_SHARE_ADDR = 1 << 2;
        /// Peer runs on the same host.
        const ACCESS_SHARE_HOST = 1 << 3;
        const RESETTING = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    /// Transport is up, registration not yet confirmed.
    Handshaking,
    Connected,
    Disconnecting,
}

/// The transport behind a connection.
pub(crate) enum Transport {
    /// In-process ring: the region owner drains it from `proc`, a
    /// sender holds an attached view.
    Mem(RingChannel),
    /// Shared-memory ring; owned mapping when listening, attached when
    /// sending.
    Shm(ShmRing),
    /// Stream connection inside the node's stream channel.
    Stream(Token),
}

/// A single transport binding to (at most) one endpoint.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) address: ChannelAddress,
    pub(crate) state: ConnState,
    pub(crate) flags: ConnFlags,
    /// Bus id of the owning endpoint, if bound.
    pub(crate) binding: Option<BusId>,
    pub(crate) transport: Transport,
    /// When the transport came up; drives the handshake timeout.
    pub(crate) established_sec: i64,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn binding(&self) -> Option<BusId> {
        self.binding
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// Ring channel of a polled transport, if this is one.
    pub(crate) fn ring(&self) -> Option<RingChannel> {
        match &self.transport {
            Transport::Mem(chan) => Some(*chan),
            Transport::Shm(ring) => Some(ring.channel()),
            Transport::Stream(_) => None,
        }
    }

    pub(crate) fn stream_token(&self) -> Option<Token> {
        match &self.transport {
            Transport::Stream(token) => Some(*token),
            _ => None,
        }
    }
}
