use std::collections::BTreeMap;

use atbus_channel::{RingChannel, ShmRing};
use atbus_network::{PollEvent, Scheme, StreamChannel, StreamConf, Token, make_address};
use tracing::{debug, warn};

use crate::{
    Error,
    connection::{ConnFlags, ConnId, ConnState, Connection, Transport},
    endpoint::{Endpoint, is_child_of},
    protocol::{BusId, Cmd, Msg, MsgBody, NodeRegistryData, RegData},
};

/// Node configuration. Times are in seconds of the caller's `proc`
/// clock.
#[derive(Debug, Clone)]
pub struct NodeConf {
    /// Low-order id bits that address this node's descendants.
    pub children_mask: u32,
    /// Parent's address; empty when this node is a root.
    pub father_address: String,
    /// Advertise a global routing table to peers.
    pub global_router: bool,

    /// Messages drained per polled channel per `proc` call.
    pub loop_times: usize,
    pub backlog: u32,
    /// How long a connection may sit in handshake without a confirmed
    /// registration.
    pub first_idle_timeout_sec: i64,
    pub ping_interval_sec: i64,
    pub retry_interval_sec: i64,
    /// Missed pongs tolerated before an endpoint is torn down.
    pub fault_tolerant: usize,

    /// Largest message accepted for sending or delivery.
    pub msg_size: usize,
    /// Ring region size for shm/mem listen channels.
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Static send block count, 0 keeps send buffers dynamic.
    pub send_buffer_number: usize,
}

impl Default for NodeConf {
    fn default() -> Self {
        Self {
            children_mask: 0,
            father_address: String::new(),
            global_router: false,
            loop_times: 2000,
            backlog: 128,
            first_idle_timeout_sec: 30,
            ping_interval_sec: 2,
            retry_interval_sec: 1,
            fault_tolerant: 3,
            msg_size: 65536,
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 0,
            send_buffer_number: 0,
        }
    }
}

pub(crate) type RecvDataFn = Box<dyn FnMut(BusId, i32, &[u8])>;
pub(crate) type SendFailedFn = Box<dyn FnMut(BusId, i32, &[u8], i32)>;
pub(crate) type CustomCmdFn = Box<dyn FnMut(BusId, &[Vec<u8>])>;
pub(crate) type ErrorFn = Box<dyn FnMut(Error)>;

/// Deferred IO work, executed after event dispatch so handlers never
/// re-enter the stream channel.
pub(crate) enum Action {
    Send { token: Token, bytes: Vec<u8> },
    Disconnect { token: Token },
    ConnectTo { address: String },
}

/// A bus node: one member of the process tree.
///
/// Single-threaded cooperative: `proc`, send calls and callbacks all
/// run on the owning thread. Drive it by calling
/// [`proc`](Node::proc) at a steady cadence with the current time.
pub struct Node {
    io: StreamChannel,
    core: NodeCore,
}

pub(crate) struct NodeCore {
    pub(crate) id: BusId,
    pub(crate) children_mask: u32,
    pub(crate) pid: i32,
    pub(crate) hostname: String,
    pub(crate) conf: NodeConf,

    resetting: bool,

    pub(crate) connections: BTreeMap<ConnId, Connection>,
    next_conn_id: u64,
    pub(crate) tokens: BTreeMap<Token, ConnId>,
    pub(crate) endpoints: BTreeMap<BusId, Endpoint>,
    pub(crate) parent_id: Option<BusId>,

    pub(crate) listen_addresses: Vec<String>,
    pub(crate) global_tree: Vec<NodeRegistryData>,

    pub(crate) actions: Vec<Action>,
    seq: u32,
    ping_seq: u32,

    pub(crate) now_sec: i64,
    pub(crate) now_usec: i64,
    parent_retry_at_sec: i64,

    recv_buf: Vec<u8>,

    pub(crate) on_recv_data: Option<RecvDataFn>,
    pub(crate) on_send_failed: Option<SendFailedFn>,
    pub(crate) on_custom_cmd: Option<CustomCmdFn>,
    pub(crate) on_error: Option<ErrorFn>,
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_owned();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Node {
    pub fn new(id: BusId, conf: NodeConf) -> Result<Self, Error> {
        if conf.children_mask >= 64 || conf.msg_size == 0 {
            return Err(Error::Params);
        }

        let io = StreamChannel::with_conf(StreamConf {
            backlog: conf.backlog,
            send_buffer_limit: conf.msg_size,
            recv_buffer_limit: conf.msg_size,
            send_buffer_max: conf.send_buffer_size,
            send_buffer_static: conf.send_buffer_number,
            recv_buffer_max: (conf.msg_size + 64) * 2,
            ..StreamConf::default()
        });

        let msg_size = conf.msg_size;
        let children_mask = conf.children_mask;
        Ok(Self {
            io,
            core: NodeCore {
                id,
                children_mask,
                pid: std::process::id() as i32,
                hostname: local_hostname(),
                conf,
                resetting: false,
                connections: BTreeMap::new(),
                next_conn_id: 1,
                tokens: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                parent_id: None,
                listen_addresses: Vec::new(),
                global_tree: Vec::new(),
                actions: Vec::new(),
                seq: 0,
                ping_seq: 0,
                now_sec: 0,
                now_usec: 0,
                parent_retry_at_sec: 0,
                recv_buf: vec![0u8; msg_size + 64],
                on_recv_data: None,
                on_send_failed: None,
                on_custom_cmd: None,
                on_error: None,
            },
        })
    }

    pub fn id(&self) -> BusId {
        self.core.id
    }

    pub fn children_mask(&self) -> u32 {
        self.core.children_mask
    }

    pub fn hostname(&self) -> &str {
        &self.core.hostname
    }

    pub fn listen_addresses(&self) -> &[String] {
        &self.core.listen_addresses
    }

    pub fn endpoint(&self, id: BusId) -> Option<&Endpoint> {
        self.core.endpoints.get(&id)
    }

    pub fn parent_id(&self) -> Option<BusId> {
        self.core.parent_id
    }

    /// Last tree snapshot pushed by a global-router peer.
    pub fn global_tree(&self) -> &[NodeRegistryData] {
        &self.core.global_tree
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.core.connections.get(&id)
    }

    pub fn is_child_node(&self, id: BusId) -> bool {
        id != self.core.id && is_child_of(self.core.id, self.core.children_mask, id)
    }

    pub fn is_parent_node(&self, id: BusId) -> bool {
        self.core.parent_id == Some(id)
    }

    pub fn is_brother_node(&self, id: BusId) -> bool {
        if self.is_child_node(id) || self.is_parent_node(id) {
            return false;
        }
        match self.core.parent_id.and_then(|p| self.core.endpoints.get(&p)) {
            Some(parent) => parent.contains(id),
            None => true,
        }
    }

    pub fn set_on_recv_data(&mut self, f: impl FnMut(BusId, i32, &[u8]) + 'static) {
        self.core.on_recv_data = Some(Box::new(f));
    }

    pub fn set_on_send_data_failed(&mut self, f: impl FnMut(BusId, i32, &[u8], i32) + 'static) {
        self.core.on_send_failed = Some(Box::new(f));
    }

    pub fn set_on_custom_cmd(&mut self, f: impl FnMut(BusId, &[Vec<u8>]) + 'static) {
        self.core.on_custom_cmd = Some(Box::new(f));
    }

    pub fn set_on_error(&mut self, f: impl FnMut(Error) + 'static) {
        self.core.on_error = Some(Box::new(f));
    }

    /// Bind a receive address. Stream schemes start accepting; `shm://`
    /// and `mem://` lay out a ring drained from `proc`. The address is
    /// advertised to peers at registration.
    pub fn listen(&mut self, addr: &str) -> Result<(), Error> {
        let parsed = make_address(addr)?;
        match parsed.scheme {
            Scheme::Mem => {
                let base = parsed.mem_base()? as *mut u8;
                let len = self.core.conf.recv_buffer_size;
                let chan = unsafe {
                    RingChannel::attach(base, len)
                        .or_else(|_| RingChannel::init(base, len, None))?
                };
                let cid = self.core.alloc_conn_id();
                self.core.connections.insert(cid, Connection {
                    id: cid,
                    address: parsed,
                    state: ConnState::Connected,
                    flags: ConnFlags::REG_PROC
                        | ConnFlags::ACCESS_SHARE_ADDR
                        | ConnFlags::ACCESS_SHARE_HOST,
                    binding: None,
                    transport: Transport::Mem(chan),
                    established_sec: self.core.now_sec,
                });
            }
            Scheme::Shm => {
                let ring =
                    ShmRing::create_or_open(parsed.shm_key()?, self.core.conf.recv_buffer_size, None)?;
                let cid = self.core.alloc_conn_id();
                self.core.connections.insert(cid, Connection {
                    id: cid,
                    address: parsed,
                    state: ConnState::Connected,
                    flags: ConnFlags::REG_PROC | ConnFlags::ACCESS_SHARE_HOST,
                    binding: None,
                    transport: Transport::Shm(ring),
                    established_sec: self.core.now_sec,
                });
            }
            Scheme::Unix | Scheme::Ipv4 | Scheme::Ipv6 | Scheme::Dns => {
                self.io.listen(&parsed)?;
            }
        }

        self.core.listen_addresses.push(addr.to_owned());
        Ok(())
    }

    /// Open a control connection toward `addr` and start the
    /// registration handshake.
    pub fn connect(&mut self, addr: &str) -> Result<(), Error> {
        let Self { io, core } = self;
        core.connect_stream(io, addr)
    }

    /// Connect the configured parent, if any.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.core.conf.father_address.is_empty() {
            return Ok(());
        }
        let father = self.core.conf.father_address.clone();
        self.core.parent_retry_at_sec = self.core.now_sec + self.core.conf.retry_interval_sec;
        self.connect(&father)
    }

    /// Run one frame: pump stream IO, drain polled ring channels, then
    /// do timeout/ping housekeeping. Returns how many data messages
    /// were handled.
    pub fn proc(&mut self, sec: i64, usec: i64) -> Result<usize, Error> {
        let Self { io, core } = self;
        core.now_sec = sec;
        core.now_usec = usec;

        let mut count = 0usize;
        io.poll_with(|ev| count += core.on_stream_event(ev));
        core.flush_actions(io);

        count += core.proc_ring_channels();
        core.flush_actions(io);

        core.check_timers();
        core.flush_actions(io);

        Ok(count)
    }

    /// Route a payload toward `target`. A self-targeted send loops
    /// straight back into the receive callback.
    pub fn send_data(&mut self, target: BusId, msg_type: i32, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.core.conf.msg_size {
            return Err(Error::BuffLimit);
        }

        if target == self.core.id {
            if let Some(cb) = self.core.on_recv_data.as_mut() {
                cb(target, msg_type, data);
            }
            return Ok(());
        }

        let seq = self.core.next_seq();
        let msg = Msg::new(
            Cmd::DataTransformReq,
            msg_type,
            0,
            seq,
            MsgBody::Forward(crate::protocol::ForwardData {
                from: self.core.id,
                to: target,
                router: Vec::new(),
                content: data.to_vec(),
            }),
        );
        let res = self.core.route_and_send(target, &msg);
        self.core.flush_actions(&mut self.io);
        res
    }

    /// Pack opaque fragments into a custom-command envelope.
    pub fn send_custom_cmd(&mut self, target: BusId, fragments: &[&[u8]]) -> Result<(), Error> {
        let commands: Vec<Vec<u8>> = fragments.iter().map(|f| f.to_vec()).collect();

        if target == self.core.id {
            if let Some(cb) = self.core.on_custom_cmd.as_mut() {
                cb(target, &commands);
            }
            return Ok(());
        }

        let seq = self.core.next_seq();
        let msg = Msg::new(
            Cmd::CustomCmdReq,
            0,
            0,
            seq,
            MsgBody::Custom(crate::protocol::CustomCommandData { from: self.core.id, commands }),
        );
        let res = self.core.route_and_send(target, &msg);
        self.core.flush_actions(&mut self.io);
        res
    }

    /// Tear everything down. Idempotent; safe to call from any state.
    pub fn reset(&mut self) {
        if self.core.resetting {
            return;
        }
        self.core.resetting = true;

        let ids: Vec<BusId> = self.core.endpoints.keys().copied().collect();
        for id in ids {
            self.core.reset_endpoint(id);
        }
        self.core.flush_actions(&mut self.io);
        self.io.close();

        self.core.connections.clear();
        self.core.tokens.clear();
        self.core.endpoints.clear();
        self.core.parent_id = None;
        self.core.actions.clear();
        self.core.resetting = false;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.reset();
    }
}

impl NodeCore {
    pub(crate) fn alloc_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    pub(crate) fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1).max(1);
        self.seq
    }

    fn next_ping_id(&mut self) -> u32 {
        self.ping_seq = self.ping_seq.wrapping_add(1).max(1);
        self.ping_seq
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.now_sec * 1000 + self.now_usec / 1000
    }

    pub(crate) fn notify_error(&mut self, err: Error) {
        debug!(?err, "node error");
        if let Some(cb) = self.on_error.as_mut() {
            cb(err);
        }
    }

    pub(crate) fn local_reg_data(&self) -> RegData {
        RegData {
            bus_id: self.id,
            pid: self.pid,
            hostname: self.hostname.clone(),
            channels: self.listen_addresses.clone(),
            children_mask: self.children_mask,
            has_global_tree: self.conf.global_router,
        }
    }

    fn connect_stream(&mut self, io: &mut StreamChannel, addr: &str) -> Result<(), Error> {
        let parsed = make_address(addr)?;
        match parsed.scheme {
            Scheme::Unix | Scheme::Ipv4 | Scheme::Ipv6 | Scheme::Dns => {
                let token = io.connect(&parsed)?;
                let cid = self.alloc_conn_id();
                self.tokens.insert(token, cid);
                self.connections.insert(cid, Connection {
                    id: cid,
                    address: parsed,
                    state: ConnState::Connecting,
                    flags: ConnFlags::REG_FD,
                    binding: None,
                    transport: Transport::Stream(token),
                    established_sec: self.now_sec,
                });
                Ok(())
            }
            // ring channels become data connections through the
            // registration exchange, not through a direct connect
            Scheme::Mem | Scheme::Shm => Err(Error::Scheme),
        }
    }

    fn on_stream_event(&mut self, ev: PollEvent<'_>) -> usize {
        match ev {
            PollEvent::Accepted { stream, addr, .. } => {
                let cid = self.alloc_conn_id();
                self.tokens.insert(stream, cid);
                self.connections.insert(cid, Connection {
                    id: cid,
                    address: addr,
                    state: ConnState::Handshaking,
                    flags: ConnFlags::REG_FD,
                    binding: None,
                    transport: Transport::Stream(stream),
                    established_sec: self.now_sec,
                });
                0
            }
            PollEvent::Connected { token } => {
                if let Some(cid) = self.tokens.get(&token).copied()
                    && let Some(conn) = self.connections.get_mut(&cid)
                {
                    conn.state = ConnState::Handshaking;
                    conn.established_sec = self.now_sec;
                    let seq = self.next_seq();
                    let reg =
                        Msg::new(Cmd::NodeRegReq, 0, 0, seq, MsgBody::Reg(self.local_reg_data()));
                    match reg.encode() {
                        Ok(bytes) => self.actions.push(Action::Send { token, bytes }),
                        Err(err) => self.notify_error(err),
                    }
                }
                0
            }
            PollEvent::Disconnected { token } => {
                if let Some(cid) = self.tokens.remove(&token) {
                    self.on_conn_gone(cid);
                }
                0
            }
            PollEvent::Received { token, payload, err } => {
                let Some(cid) = self.tokens.get(&token).copied() else { return 0 };
                if let Some(err) = err {
                    // transport-fatal errors are followed by a
                    // Disconnected event; checksum failures only cost
                    // the affected frame
                    self.notify_error(err.into());
                    return 0;
                }
                match Msg::decode(payload) {
                    Ok(msg) => self.dispatch(Some(cid), msg),
                    Err(err) => {
                        self.notify_error(err);
                        if let Some(conn) = self.connections.get(&cid)
                            && let Some(token) = conn.stream_token()
                        {
                            self.actions.push(Action::Disconnect { token });
                        }
                        0
                    }
                }
            }
            PollEvent::Written { err, .. } => {
                if let Some(err) = err {
                    self.notify_error(err.into());
                }
                0
            }
        }
    }

    fn on_conn_gone(&mut self, cid: ConnId) {
        let Some(conn) = self.connections.remove(&cid) else { return };
        debug!(conn = cid.0, addr = %conn.address.address, "connection gone");

        if let Some(ep_id) = conn.binding
            && let Some(ep) = self.endpoints.get_mut(&ep_id)
            && ep.remove_connection(cid)
        {
            self.reset_endpoint(ep_id);
        }

        if !self.conf.father_address.is_empty() && conn.address.address == self.conf.father_address
        {
            self.parent_retry_at_sec = self.now_sec + self.conf.retry_interval_sec;
        }
    }

    pub(crate) fn reset_endpoint(&mut self, ep_id: BusId) {
        let Some(mut ep) = self.endpoints.remove(&ep_id) else { return };
        if ep.flags.contains(crate::EndpointFlags::RESETTING) {
            return;
        }
        ep.flags.insert(crate::EndpointFlags::RESETTING);
        debug!(endpoint = ep_id, "endpoint reset");

        for cid in ep.connection_ids() {
            if let Some(conn) = self.connections.remove(&cid)
                && let Some(token) = conn.stream_token()
            {
                self.tokens.remove(&token);
                self.actions.push(Action::Disconnect { token });
            }
        }

        if self.parent_id == Some(ep_id) {
            self.parent_id = None;
            self.parent_retry_at_sec = self.now_sec + self.conf.retry_interval_sec;
        }
    }

    pub(crate) fn flush_actions(&mut self, io: &mut StreamChannel) {
        let actions = std::mem::take(&mut self.actions);
        for action in actions {
            match action {
                Action::Send { token, bytes } => {
                    if let Err(err) = io.send(token, &bytes) {
                        warn!(?err, "queued send failed");
                        self.notify_error(err.into());
                    }
                }
                Action::Disconnect { token } => {
                    let _ = io.disconnect(token);
                }
                Action::ConnectTo { address } => {
                    if let Err(err) = self.connect_stream(io, &address) {
                        warn!(?err, address = %address, "deferred connect failed");
                        self.notify_error(err);
                    }
                }
            }
        }
    }

    /// Drain every ring connection registered for periodic processing.
    fn proc_ring_channels(&mut self) -> usize {
        let ring_conns: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.flags.contains(ConnFlags::REG_PROC))
            .map(|(id, _)| *id)
            .collect();

        let mut handled = 0usize;
        let now_ms = self.now_ms().max(0) as u64;

        for cid in ring_conns {
            let mut left = self.conf.loop_times;
            while left > 0 {
                left -= 1;
                let Some(chan) = self.connections.get(&cid).and_then(Connection::ring) else {
                    break;
                };
                let msg = match chan.recv(&mut self.recv_buf, now_ms) {
                    Ok(n) => Msg::decode(&self.recv_buf[..n]),
                    Err(atbus_channel::RingError::NoData) => break,
                    Err(err) => {
                        // corrupt or timed-out slot was skipped and
                        // counted, keep the channel going
                        self.notify_error(err.into());
                        break;
                    }
                };
                match msg {
                    Ok(msg) => handled += self.dispatch(Some(cid), msg),
                    Err(err) => self.notify_error(err),
                }
            }
        }
        handled
    }

    fn check_timers(&mut self) {
        self.check_handshake_timeouts();
        self.check_pings();
        self.check_parent_retry();
    }

    fn check_handshake_timeouts(&mut self) {
        let deadline = self.conf.first_idle_timeout_sec;
        let now = self.now_sec;
        let mut expired = Vec::new();
        for (cid, conn) in &mut self.connections {
            if matches!(conn.state, ConnState::Connecting | ConnState::Handshaking)
                && now - conn.established_sec > deadline
            {
                conn.state = ConnState::Disconnecting;
                expired.push(*cid);
            }
        }
        for cid in expired {
            warn!(conn = cid.0, "handshake timed out");
            if let Some(token) = self.connections.get(&cid).and_then(Connection::stream_token) {
                self.actions.push(Action::Disconnect { token });
            }
        }
    }

    fn check_pings(&mut self) {
        let ids: Vec<BusId> = self.endpoints.keys().copied().collect();
        for ep_id in ids {
            let Some(ep) = self.endpoints.get_mut(&ep_id) else { continue };
            if self.now_sec - ep.ping.last_ping_sec < self.conf.ping_interval_sec {
                continue;
            }

            let lost = {
                if ep.ping.outstanding_id != 0 {
                    ep.ping.missed += 1;
                }
                ep.ping.missed > self.conf.fault_tolerant
            };
            if lost {
                warn!(endpoint = ep_id, "endpoint unresponsive, resetting");
                self.reset_endpoint(ep_id);
                continue;
            }

            let ping_id = self.next_ping_id();
            let seq = self.next_seq();
            let msg = Msg::new(
                Cmd::NodePing,
                0,
                0,
                seq,
                MsgBody::Ping(crate::protocol::PingData { ping_id, time_point_ms: self.now_ms() }),
            );
            let sent = msg
                .encode()
                .and_then(|bytes| self.send_on_ctrl(ep_id, &bytes));
            match sent {
                Ok(()) => {
                    let ep = self.endpoints.get_mut(&ep_id).expect("collected above");
                    ep.ping.outstanding_id = ping_id;
                    ep.ping.last_ping_sec = self.now_sec;
                }
                Err(err) => self.notify_error(err),
            }
        }
    }

    fn check_parent_retry(&mut self) {
        if self.conf.father_address.is_empty()
            || self.parent_id.is_some()
            || self.now_sec < self.parent_retry_at_sec
        {
            return;
        }

        let father = self.conf.father_address.clone();
        let already_trying = self.connections.values().any(|c| {
            c.address.address == father
                && matches!(c.state, ConnState::Connecting | ConnState::Handshaking)
        });
        self.parent_retry_at_sec = self.now_sec + self.conf.retry_interval_sec;
        if !already_trying {
            debug!(address = %father, "retrying parent connection");
            self.actions.push(Action::ConnectTo { address: father });
        }
    }

    /// Next-hop lookup: exact endpoint, else the most specific endpoint
    /// whose subtree contains `target`, else the parent.
    pub(crate) fn find_route(&self, target: BusId) -> Option<BusId> {
        if self.endpoints.contains_key(&target) {
            return Some(target);
        }
        self.endpoints
            .values()
            .filter(|ep| ep.contains(target))
            .min_by_key(|ep| ep.children_mask())
            .map(Endpoint::id)
            .or(self.parent_id)
    }

    pub(crate) fn route_and_send(&mut self, target: BusId, msg: &Msg) -> Result<(), Error> {
        let bytes = msg.encode()?;
        if bytes.len() > self.conf.msg_size {
            return Err(Error::BuffLimit);
        }
        let hop = self.find_route(target).ok_or(Error::InvalidId)?;
        self.send_to_endpoint(hop, &bytes)
    }

    pub(crate) fn send_to_endpoint(&mut self, ep_id: BusId, bytes: &[u8]) -> Result<(), Error> {
        let cid = self
            .select_data_connection(ep_id)
            .ok_or(Error::Net(atbus_network::NetError::ConnectionNotFound))?;
        self.push_conn(cid, bytes)
    }

    /// Control traffic (ping, sync, conn offers) always rides the
    /// control connection; only payload forwarding picks by locality.
    pub(crate) fn send_on_ctrl(&mut self, ep_id: BusId, bytes: &[u8]) -> Result<(), Error> {
        let ctrl = self
            .endpoints
            .get(&ep_id)
            .and_then(|ep| ep.ctrl_conn)
            .filter(|cid| self.connections.get(cid).is_some_and(Connection::is_connected))
            .ok_or(Error::Net(atbus_network::NetError::ConnectionNotFound))?;
        self.push_conn(ctrl, bytes)
    }

    fn push_conn(&mut self, cid: ConnId, bytes: &[u8]) -> Result<(), Error> {
        let conn = self
            .connections
            .get(&cid)
            .ok_or(Error::Net(atbus_network::NetError::ConnectionNotFound))?;
        match &conn.transport {
            Transport::Stream(token) => {
                self.actions.push(Action::Send { token: *token, bytes: bytes.to_vec() });
                Ok(())
            }
            Transport::Mem(chan) => Ok(chan.send(bytes)?),
            Transport::Shm(ring) => Ok(ring.channel().send(bytes)?),
        }
    }

    /// Pick the fastest live connection to an endpoint: sort data
    /// connections by locality, walk for the strongest match consistent
    /// with the peer's host/pid, fall back to the control connection.
    pub(crate) fn select_data_connection(&mut self, ep_id: BusId) -> Option<ConnId> {
        let connections = &self.connections;
        let ep = self.endpoints.get_mut(&ep_id)?;

        let ctrl = ep.ctrl_conn?;
        if !connections.get(&ctrl).is_some_and(Connection::is_connected) {
            return None;
        }

        if !ep.flags.contains(crate::EndpointFlags::CONNECTION_SORTED) {
            ep.data_conn.sort_by_key(|cid| {
                let flags =
                    connections.get(cid).map_or(ConnFlags::empty(), |c| c.flags);
                (
                    !flags.contains(ConnFlags::ACCESS_SHARE_ADDR),
                    !flags.contains(ConnFlags::ACCESS_SHARE_HOST),
                )
            });
            ep.flags.insert(crate::EndpointFlags::CONNECTION_SORTED);
        }

        let share_host = ep.hostname() == self.hostname;
        let share_addr = share_host && ep.pid() == self.pid;

        for cid in &ep.data_conn {
            let Some(conn) = connections.get(cid) else { continue };
            if !conn.is_connected() {
                continue;
            }
            if share_addr && conn.flags.contains(ConnFlags::ACCESS_SHARE_ADDR) {
                return Some(*cid);
            }
            if share_host && conn.flags.contains(ConnFlags::ACCESS_SHARE_HOST) {
                return Some(*cid);
            }
            if !conn.flags.contains(ConnFlags::ACCESS_SHARE_HOST) {
                return Some(*cid);
            }
        }

        Some(ctrl)
    }

    pub(crate) fn deliver_local(&mut self, from: BusId, msg_type: i32, data: &[u8]) {
        if let Some(cb) = self.on_recv_data.as_mut() {
            cb(from, msg_type, data);
        }
    }
}
