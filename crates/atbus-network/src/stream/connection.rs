use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use atbus_buffer::{BufferManager, VARINT_MAX_LEN, read_vint, vint_len, write_vint};
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::{ChannelAddress, NetError, stream::StreamConf};

/// Default per-frame payload ceiling.
pub const MSG_LIMIT: usize = 65536;

const CRC_LEN: usize = 4;

/// Whether the connection is still usable after a call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    Alive,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    /// Outbound, waiting for the connect to complete.
    Connecting,
    Connected,
}

pub(crate) enum StreamHandle {
    Tcp(mio::net::TcpStream),
    Pipe(mio::net::UnixStream),
}

impl StreamHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Pipe(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Pipe(s) => s.write(buf),
        }
    }

    pub(crate) fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Self::Tcp(s) => s,
            Self::Pipe(s) => s,
        }
    }

    pub(crate) fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Pipe(s) => s.take_error(),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Pipe(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

/// One framed stream connection.
///
/// Frames are `CRC32(payload) | varint payload_len | payload`. Inbound
/// bytes stage in a fixed read head; a frame whose payload extends past
/// what has been read spills into a block from the read buffer manager
/// and subsequent reads fill it directly. Outbound frames are laid out
/// in blocks of the write buffer manager and drained whenever the
/// socket is writable.
pub(crate) struct StreamConn {
    pub(crate) handle: StreamHandle,
    pub(crate) addr: ChannelAddress,
    pub(crate) state: TransportState,

    read_head: Box<[u8]>,
    read_head_len: usize,
    read_buffers: BufferManager,
    write_buffers: BufferManager,

    /// Invariant: WRITABLE interest is registered iff this is set (or
    /// the connect is still pending).
    writable_armed: bool,
}

impl StreamConn {
    pub(crate) fn new(
        handle: StreamHandle,
        addr: ChannelAddress,
        state: TransportState,
        conf: &StreamConf,
    ) -> Self {
        let mut read_buffers = BufferManager::new();
        read_buffers.set_limit(conf.recv_buffer_max, 0);
        if conf.recv_buffer_max > 0 && conf.recv_buffer_static > 0 {
            read_buffers.set_mode(conf.recv_buffer_max, conf.recv_buffer_static);
        }

        let mut write_buffers = BufferManager::new();
        write_buffers.set_limit(conf.send_buffer_max, 0);
        if conf.send_buffer_max > 0 && conf.send_buffer_static > 0 {
            write_buffers.set_mode(conf.send_buffer_max, conf.send_buffer_static);
        }

        Self {
            handle,
            addr,
            state,
            read_head: vec![0u8; conf.recv_buffer_limit + CRC_LEN + VARINT_MAX_LEN]
                .into_boxed_slice(),
            read_head_len: 0,
            read_buffers,
            write_buffers,
            writable_armed: false,
        }
    }

    /// Frame `data` into the write buffer manager and try to flush.
    pub(crate) fn send_frame(&mut self, data: &[u8], limit: usize) -> Result<(), NetError> {
        if limit > 0 && data.len() > limit {
            return Err(NetError::InvalidSize);
        }

        let vlen = vint_len(data.len() as u64);
        let total = CRC_LEN + vlen + data.len();
        let block = self.write_buffers.push_back(total).map_err(|_| NetError::BuffLimit)?;

        block[..CRC_LEN].copy_from_slice(&crc32fast::hash(data).to_le_bytes());
        write_vint(data.len() as u64, &mut block[CRC_LEN..CRC_LEN + vlen])
            .expect("block sized for the varint");
        block[CRC_LEN + vlen..].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.write_buffers.is_empty()
    }

    /// Drain queued frames until the kernel blocks or the queue empties.
    /// Calls `written` once per fully transmitted frame.
    pub(crate) fn flush<F>(&mut self, registry: &Registry, token: Token, written: &mut F) -> ConnStatus
    where
        F: FnMut(Option<NetError>),
    {
        if self.state != TransportState::Connected {
            return ConnStatus::Alive;
        }

        loop {
            let frame_len = match self.write_buffers.front() {
                Err(_) => break,
                Ok((data, _)) => data.len(),
            };

            let (data, _) = self.write_buffers.front().expect("checked non-empty");
            match self.handle.write(data) {
                Ok(0) => {
                    written(Some(NetError::WriteFailed));
                    return ConnStatus::Closed;
                }
                Ok(n) => {
                    let whole = n == frame_len;
                    let _ = self.write_buffers.pop_front(n, true);
                    if whole {
                        written(None);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return self.arm_writable(registry, token);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "stream write failed");
                    written(Some(NetError::WriteFailed));
                    return ConnStatus::Closed;
                }
            }
        }

        // drop WRITABLE interest only when fully drained
        if self.writable_armed && self.write_buffers.is_empty() {
            if let Err(err) =
                registry.reregister(self.handle.source_mut(), token, Interest::READABLE)
            {
                debug!(?err, "reregister drop writable");
                return ConnStatus::Closed;
            }
            self.writable_armed = false;
        }

        ConnStatus::Alive
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) -> ConnStatus {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                self.handle.source_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "reregister arm writable");
                return ConnStatus::Closed;
            }
            self.writable_armed = true;
        }
        ConnStatus::Alive
    }

    /// Pull bytes until the kernel blocks, handing every completed frame
    /// to `recved` as `(payload, error)`.
    pub(crate) fn on_readable<F>(&mut self, recv_limit: usize, recved: &mut F) -> ConnStatus
    where
        F: FnMut(&[u8], Option<NetError>),
    {
        loop {
            let filling_block =
                matches!(self.read_buffers.back(), Ok((writable, _)) if !writable.is_empty());

            if filling_block {
                let (writable, _) = self.read_buffers.back_mut().expect("checked non-empty");
                match self.handle.read(writable) {
                    Ok(0) => {
                        recved(&[], Some(NetError::Eof));
                        return ConnStatus::Closed;
                    }
                    Ok(n) => {
                        let _ = self.read_buffers.pop_back(n, false);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return ConnStatus::Alive;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, "stream read failed");
                        recved(&[], Some(NetError::ReadFailed));
                        return ConnStatus::Closed;
                    }
                }
            } else {
                if self.read_head_len == self.read_head.len() {
                    // full head with nothing decodable in it
                    recved(&self.read_head[..self.read_head_len], Some(NetError::InvalidSize));
                    return ConnStatus::Closed;
                }
                match self.handle.read(&mut self.read_head[self.read_head_len..]) {
                    Ok(0) => {
                        recved(&[], Some(NetError::Eof));
                        return ConnStatus::Closed;
                    }
                    Ok(n) => {
                        self.read_head_len += n;
                        if !self.parse_head(recv_limit, recved) {
                            return ConnStatus::Closed;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return ConnStatus::Alive;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, "stream read failed");
                        recved(&[], Some(NetError::ReadFailed));
                        return ConnStatus::Closed;
                    }
                }
            }

            self.deliver_completed_block(recv_limit, recved);
        }
    }

    /// Decode every whole frame currently staged in the read head and
    /// spill an incomplete trailing frame into a big block. Returns
    /// false when the connection must be dropped.
    fn parse_head<F>(&mut self, recv_limit: usize, recved: &mut F) -> bool
    where
        F: FnMut(&[u8], Option<NetError>),
    {
        let len = self.read_head_len;
        let mut start = 0usize;
        let mut overflow = false;

        while len - start > CRC_LEN {
            let Some((frame_len, vlen)) = read_vint(&self.read_head[start + CRC_LEN..len]) else {
                break;
            };
            let have = len - start - CRC_LEN - vlen;

            if have as u64 >= frame_len {
                let frame_len = frame_len as usize;
                let payload_at = start + CRC_LEN + vlen;
                let payload = &self.read_head[payload_at..payload_at + frame_len];
                let expect =
                    u32::from_le_bytes(self.read_head[start..start + CRC_LEN].try_into().unwrap());

                let mut err = None;
                if crc32fast::hash(payload) != expect {
                    err = Some(NetError::BadData);
                } else if recv_limit > 0 && frame_len > recv_limit {
                    err = Some(NetError::InvalidSize);
                }
                recved(payload, err);
                start = payload_at + frame_len;
            } else {
                // the rest of this frame is still in flight
                if recv_limit > 0 && frame_len > recv_limit as u64 {
                    overflow = true;
                    start += CRC_LEN + vlen;
                    break;
                }
                let frame_len = frame_len as usize;
                match self.read_buffers.push_back(CRC_LEN + frame_len) {
                    Ok(block) => {
                        block[..CRC_LEN]
                            .copy_from_slice(&self.read_head[start..start + CRC_LEN]);
                        block[CRC_LEN..CRC_LEN + have]
                            .copy_from_slice(&self.read_head[start + CRC_LEN + vlen..len]);
                        let _ = self.read_buffers.pop_back(CRC_LEN + have, false);
                        start = len;
                    }
                    Err(_) => {
                        overflow = true;
                        start += CRC_LEN + vlen;
                        break;
                    }
                }
            }
        }

        if start > 0 && len > start {
            self.read_head.copy_within(start..len, 0);
        }
        self.read_head_len = len - start;

        if overflow {
            if self.read_head_len > 0 {
                recved(&self.read_head[..self.read_head_len], Some(NetError::InvalidSize));
            }
            return false;
        }
        true
    }

    /// A spilled frame is complete once its block has no writable space
    /// left: verify the checksum and hand it up.
    fn deliver_completed_block<F>(&mut self, recv_limit: usize, recved: &mut F)
    where
        F: FnMut(&[u8], Option<NetError>),
    {
        let complete = matches!(self.read_buffers.front(), Ok((rest, _)) if rest.is_empty());
        if !complete {
            return;
        }

        let raw = self.read_buffers.front_block().expect("checked non-empty");
        let expect = u32::from_le_bytes(raw[..CRC_LEN].try_into().unwrap());
        let payload = &raw[CRC_LEN..];

        let mut err = None;
        if crc32fast::hash(payload) != expect {
            err = Some(NetError::BadData);
        } else if recv_limit > 0 && payload.len() > recv_limit {
            err = Some(NetError::InvalidSize);
        }
        recved(payload, err);

        let _ = self.read_buffers.pop_front(0, true);
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(self.handle.source_mut());
        self.handle.shutdown();
    }
}

/// Kernel-side keepalive, `secs == 0` disables.
pub(crate) fn set_tcp_keepalive(stream: &mio::net::TcpStream, secs: u32) {
    let fd = stream.as_raw_fd();
    let on: libc::c_int = i32::from(secs > 0);
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if secs > 0 {
            let idle = secs as libc::c_int;
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                &idle as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn crc32_matches_the_zlib_polynomial() {
        // standard check value for the reflected 0x04C11DB7 polynomial
        assert_eq!(crc32fast::hash(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32fast::hash(b""), 0);
    }
}
