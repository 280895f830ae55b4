use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, event::Event};
use tracing::{debug, error, warn};

use crate::{
    ChannelAddress, NetError, Scheme, resolve,
    stream::{
        StreamConf,
        connection::{ConnStatus, StreamConn, StreamHandle, TransportState, set_tcp_keepalive},
    },
};

/// Event emitted by [`StreamChannel::poll_with`].
pub enum PollEvent<'a> {
    /// A listener accepted a new inbound connection.
    Accepted { listener: Token, stream: Token, addr: ChannelAddress },
    /// An outbound connect completed.
    Connected { token: Token },
    /// The connection is gone; its token is dead.
    Disconnected { token: Token },
    /// A whole frame arrived, or a transport/framing error surfaced.
    /// On error `payload` holds whatever bytes were pending.
    Received { token: Token, payload: &'a [u8], err: Option<NetError> },
    /// One queued frame was fully handed to the kernel.
    Written { token: Token, err: Option<NetError> },
}

enum Variant {
    TcpListener(mio::net::TcpListener, ChannelAddress),
    PipeListener(mio::net::UnixListener, ChannelAddress),
    Stream(StreamConn),
}

enum Pending {
    Disconnected(Token),
    Written(Token, Option<NetError>),
}

struct ConnPool {
    poll: Poll,
    conf: StreamConf,
    conns: Vec<(Token, Variant)>,
    next_token: usize,
    // events produced outside poll_with, delivered on the next poll
    pending: Vec<Pending>,
}

/// Connection-oriented framed transport over TCP or unix pipes.
///
/// Every listener and connection is identified by a `mio::Token`.
/// Drive all IO by calling [`poll_with`](StreamChannel::poll_with)
/// regularly; it never blocks.
pub struct StreamChannel {
    events: Events,
    pool: ConnPool,
}

impl Default for StreamChannel {
    fn default() -> Self {
        Self::with_conf(StreamConf::default())
    }
}

impl StreamChannel {
    pub fn with_conf(conf: StreamConf) -> Self {
        Self {
            events: Events::with_capacity(128),
            pool: ConnPool {
                poll: Poll::new().expect("couldn't set up a poll for the stream channel"),
                conf,
                conns: Vec::with_capacity(8),
                next_token: 0,
                pending: Vec::new(),
            },
        }
    }

    pub fn conf(&self) -> &StreamConf {
        &self.pool.conf
    }

    /// Bind `addr` and start accepting. Supports `ipv4://`, `ipv6://`,
    /// `unix://` and `dns://` (resolved, then re-entered).
    pub fn listen(&mut self, addr: &ChannelAddress) -> Result<Token, NetError> {
        self.pool.listen(addr)
    }

    /// Start an outbound connection; completion is reported through
    /// [`PollEvent::Connected`]. Frames sent before that are queued.
    pub fn connect(&mut self, addr: &ChannelAddress) -> Result<Token, NetError> {
        self.pool.connect(addr)
    }

    /// Frame and send `data` on a connection, queueing what the kernel
    /// does not take immediately.
    pub fn send(&mut self, token: Token, data: &[u8]) -> Result<(), NetError> {
        self.pool.send(token, data)
    }

    /// Tear one connection (or listener) down.
    pub fn disconnect(&mut self, token: Token) -> Result<(), NetError> {
        self.pool.disconnect(token)
    }

    /// Disconnect everything.
    pub fn close(&mut self) {
        let tokens: Vec<Token> = self.pool.conns.iter().map(|(t, _)| *t).collect();
        for token in tokens {
            let _ = self.pool.disconnect(token);
        }
    }

    /// Poll sockets once (non-blocking) and dispatch events. Returns
    /// whether anything was processed.
    pub fn poll_with<F>(&mut self, mut handler: F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let mut any = self.pool.drain_pending(&mut handler);

        if let Err(err) = self.pool.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!(?err, "stream poll failed");
            }
            return any;
        }

        for ev in self.events.iter() {
            any = true;
            self.pool.handle_event(ev, &mut handler);
        }

        any |= self.pool.drain_pending(&mut handler);
        any
    }

    pub fn conn_addr(&self, token: Token) -> Option<&ChannelAddress> {
        self.pool.conns.iter().find(|(t, _)| *t == token).map(|(_, v)| match v {
            Variant::TcpListener(_, addr) | Variant::PipeListener(_, addr) => addr,
            Variant::Stream(conn) => &conn.addr,
        })
    }

    /// Whether the transport handshake of an outbound connection has
    /// completed (always true for accepted connections).
    pub fn is_established(&self, token: Token) -> bool {
        self.pool.conns.iter().any(|(t, v)| {
            *t == token
                && matches!(v, Variant::Stream(c) if c.state == TransportState::Connected)
        })
    }
}

impl ConnPool {
    fn index_of(&self, token: Token) -> Option<usize> {
        self.conns.iter().position(|(t, _)| *t == token)
    }

    fn listen(&mut self, addr: &ChannelAddress) -> Result<Token, NetError> {
        match addr.scheme {
            Scheme::Dns => {
                let resolved = resolve(addr)?;
                self.listen(&resolved)
            }
            Scheme::Ipv4 | Scheme::Ipv6 => {
                let sock_addr = addr.socket_addr()?;
                let listener = bind_tcp_listener(sock_addr, self.conf.backlog)
                    .inspect_err(|err| warn!(addr = %addr.address, ?err, "tcp listen failed"))?;
                let mut listener = mio::net::TcpListener::from_std(listener);

                let token = Token(self.next_token);
                self.poll
                    .registry()
                    .register(&mut listener, token, Interest::READABLE)
                    .map_err(|_| NetError::SockListenFailed)?;
                self.conns.push((token, Variant::TcpListener(listener, addr.clone())));
                self.next_token += 1;
                Ok(token)
            }
            Scheme::Unix => {
                let listener = std::os::unix::net::UnixListener::bind(&addr.host)
                    .inspect_err(|err| warn!(addr = %addr.address, ?err, "pipe bind failed"))
                    .map_err(|_| NetError::PipeBindFailed)?;
                listener.set_nonblocking(true).map_err(|_| NetError::PipeListenFailed)?;
                let mut listener = mio::net::UnixListener::from_std(listener);

                let token = Token(self.next_token);
                self.poll
                    .registry()
                    .register(&mut listener, token, Interest::READABLE)
                    .map_err(|_| NetError::PipeListenFailed)?;
                self.conns.push((token, Variant::PipeListener(listener, addr.clone())));
                self.next_token += 1;
                Ok(token)
            }
            Scheme::Mem | Scheme::Shm => Err(NetError::Scheme),
        }
    }

    fn connect(&mut self, addr: &ChannelAddress) -> Result<Token, NetError> {
        match addr.scheme {
            Scheme::Dns => {
                let resolved = resolve(addr)?;
                self.connect(&resolved)
            }
            Scheme::Ipv4 | Scheme::Ipv6 => {
                let sock_addr = addr.socket_addr()?;
                let stream = mio::net::TcpStream::connect(sock_addr)
                    .inspect_err(|err| warn!(addr = %addr.address, ?err, "tcp connect failed"))
                    .map_err(|_| NetError::SockConnectFailed)?;
                if self.conf.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                set_tcp_keepalive(&stream, self.conf.keepalive_secs);
                self.install(
                    StreamHandle::Tcp(stream),
                    addr.clone(),
                    NetError::SockConnectFailed,
                )
            }
            Scheme::Unix => {
                let stream = mio::net::UnixStream::connect(&addr.host)
                    .inspect_err(|err| warn!(addr = %addr.address, ?err, "pipe connect failed"))
                    .map_err(|_| NetError::PipeConnectFailed)?;
                self.install(StreamHandle::Pipe(stream), addr.clone(), NetError::PipeConnectFailed)
            }
            Scheme::Mem | Scheme::Shm => Err(NetError::Scheme),
        }
    }

    fn install(
        &mut self,
        handle: StreamHandle,
        addr: ChannelAddress,
        fail: NetError,
    ) -> Result<Token, NetError> {
        let token = Token(self.next_token);
        let mut conn = StreamConn::new(handle, addr, TransportState::Connecting, &self.conf);

        // WRITABLE fires once the connect completes
        self.poll
            .registry()
            .register(conn.handle.source_mut(), token, Interest::WRITABLE)
            .map_err(|_| fail)?;

        self.conns.push((token, Variant::Stream(conn)));
        self.next_token += 1;
        Ok(token)
    }

    fn send(&mut self, token: Token, data: &[u8]) -> Result<(), NetError> {
        let idx = self.index_of(token).ok_or(NetError::ConnectionNotFound)?;
        let Self { poll, conf, conns, pending, .. } = self;
        let Variant::Stream(conn) = &mut conns[idx].1 else {
            return Err(NetError::Params);
        };

        conn.send_frame(data, conf.send_buffer_limit)?;

        let status = conn
            .flush(poll.registry(), token, &mut |err| pending.push(Pending::Written(token, err)));
        if status == ConnStatus::Closed {
            conn.close(poll.registry());
            pending.push(Pending::Disconnected(token));
            conns.swap_remove(idx);
            return Err(NetError::WriteFailed);
        }
        Ok(())
    }

    fn disconnect(&mut self, token: Token) -> Result<(), NetError> {
        let idx = self.index_of(token).ok_or(NetError::ConnectionNotFound)?;
        let Self { poll, conns, pending, .. } = self;

        match &mut conns[idx].1 {
            Variant::Stream(conn) => {
                // last chance to drain what is already queued
                let _ = conn.flush(poll.registry(), token, &mut |err| {
                    pending.push(Pending::Written(token, err));
                });
                conn.close(poll.registry());
                pending.push(Pending::Disconnected(token));
            }
            Variant::TcpListener(listener, _) => {
                let _ = poll.registry().deregister(listener);
            }
            Variant::PipeListener(listener, _) => {
                let _ = poll.registry().deregister(listener);
            }
        }

        conns.swap_remove(idx);
        Ok(())
    }

    fn drain_pending<F>(&mut self, handler: &mut F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let mut any = false;
        for p in self.pending.drain(..) {
            any = true;
            match p {
                Pending::Disconnected(token) => handler(PollEvent::Disconnected { token }),
                Pending::Written(token, err) => handler(PollEvent::Written { token, err }),
            }
        }
        any
    }

    fn handle_event<F>(&mut self, ev: &Event, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let token = ev.token();
        let Some(idx) = self.index_of(token) else {
            // the connection went away earlier in this batch
            return;
        };

        if matches!(self.conns[idx].1, Variant::Stream(_)) {
            self.stream_event(idx, token, ev, handler);
        } else {
            self.accept_loop(idx, token, handler);
        }
    }

    fn accept_loop<F>(&mut self, idx: usize, listener_token: Token, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        loop {
            let accepted = match &mut self.conns[idx].1 {
                Variant::TcpListener(listener, _) => match listener.accept() {
                    Ok((stream, peer)) => {
                        if self.conf.nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        set_tcp_keepalive(&stream, self.conf.keepalive_secs);
                        Some((StreamHandle::Tcp(stream), ChannelAddress::from_socket(peer)))
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        warn!(?err, "tcp accept failed");
                        None
                    }
                },
                Variant::PipeListener(listener, addr) => match listener.accept() {
                    Ok((stream, _)) => Some((StreamHandle::Pipe(stream), addr.clone())),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        warn!(?err, "pipe accept failed");
                        None
                    }
                },
                Variant::Stream(_) => None,
            };

            let Some((handle, addr)) = accepted else { return };

            let token = Token(self.next_token);
            let mut conn =
                StreamConn::new(handle, addr.clone(), TransportState::Connected, &self.conf);
            if let Err(err) =
                self.poll.registry().register(conn.handle.source_mut(), token, Interest::READABLE)
            {
                error!(?err, "couldn't register accepted connection");
                continue;
            }

            debug!(addr = %addr.address, "accepted");
            self.conns.push((token, Variant::Stream(conn)));
            self.next_token += 1;
            handler(PollEvent::Accepted { listener: listener_token, stream: token, addr });
        }
    }

    fn stream_event<F>(&mut self, idx: usize, token: Token, ev: &Event, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let Self { poll, conf, conns, .. } = self;
        let registry = poll.registry();
        let Variant::Stream(conn) = &mut conns[idx].1 else { return };

        let mut closed = false;

        if ev.is_writable() {
            if conn.state == TransportState::Connecting {
                match conn.handle.take_error() {
                    Ok(None) => {
                        conn.state = TransportState::Connected;
                        if registry
                            .reregister(conn.handle.source_mut(), token, Interest::READABLE)
                            .is_err()
                        {
                            closed = true;
                        } else {
                            debug!(addr = %conn.addr.address, "connected");
                            handler(PollEvent::Connected { token });
                            if conn.has_backlog() {
                                closed |= conn.flush(registry, token, &mut |err| {
                                    handler(PollEvent::Written { token, err });
                                }) == ConnStatus::Closed;
                            }
                        }
                    }
                    Ok(Some(err)) => {
                        warn!(addr = %conn.addr.address, ?err, "connect failed");
                        closed = true;
                    }
                    Err(err) => {
                        warn!(addr = %conn.addr.address, ?err, "connect state unknown");
                        closed = true;
                    }
                }
            } else {
                closed |= conn.flush(registry, token, &mut |err| {
                    handler(PollEvent::Written { token, err });
                }) == ConnStatus::Closed;
            }
        }

        if !closed && ev.is_readable() && conn.state == TransportState::Connected {
            closed |= conn.on_readable(conf.recv_buffer_limit, &mut |payload, err| {
                handler(PollEvent::Received { token, payload, err });
            }) == ConnStatus::Closed;
        }

        if closed {
            if let Variant::Stream(conn) = &mut conns[idx].1 {
                conn.close(registry);
            }
            handler(PollEvent::Disconnected { token });
            conns.swap_remove(idx);
        }
    }
}

/// Bind + listen with an explicit backlog; mio's own bind hardwires it.
fn bind_tcp_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, NetError> {
    unsafe {
        let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(NetError::SockBindFailed);
        }

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let bound = match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = std::mem::zeroed();
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = std::mem::zeroed();
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        };
        if bound != 0 {
            libc::close(fd);
            return Err(NetError::SockBindFailed);
        }

        if libc::listen(fd, backlog as libc::c_int) != 0 {
            libc::close(fd);
            return Err(NetError::SockListenFailed);
        }

        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}
