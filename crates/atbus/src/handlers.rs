//! Control-plane dispatch: registration, liveness, forwarding and the
//! auxiliary commands, all running on the node's owning thread.

use atbus_network::{Scheme, make_address};
use tracing::{debug, warn};

use crate::{
    Error,
    connection::{ConnFlags, ConnId, ConnState},
    endpoint::{Endpoint, children_range, is_child_of},
    node::{Action, NodeCore},
    protocol::{
        BusId, Cmd, ConnData, CustomCommandData, ForwardData, Msg, MsgBody, MsgHead,
        NodeRegistryData, NodeTree, PingData, RegData,
    },
};

impl NodeCore {
    /// Route one decoded message to its handler. Returns how many data
    /// payloads were delivered or relayed.
    pub(crate) fn dispatch(&mut self, from_conn: Option<ConnId>, msg: Msg) -> usize {
        let Msg { head, body } = msg;
        match (head.cmd, body) {
            (Cmd::NodeRegReq, MsgBody::Reg(reg)) => {
                self.on_reg_req(from_conn, &head, reg);
                0
            }
            (Cmd::NodeRegRsp, MsgBody::Reg(reg)) => {
                self.on_reg_rsp(from_conn, &head, reg);
                0
            }
            (Cmd::NodePing, MsgBody::Ping(ping)) => {
                self.on_ping(from_conn, &head, ping);
                0
            }
            (Cmd::NodePong, MsgBody::Ping(ping)) => {
                self.on_pong(from_conn, ping);
                0
            }
            (Cmd::DataTransformReq, MsgBody::Forward(fwd)) => self.on_forward_req(&head, fwd),
            (Cmd::DataTransformRsp, MsgBody::Forward(fwd)) => {
                self.on_forward_rsp(&head, fwd);
                0
            }
            (Cmd::CustomCmdReq, MsgBody::Custom(custom)) => {
                self.on_custom_cmd_req(custom);
                1
            }
            (Cmd::NodeConnSyn, MsgBody::Conn(conn)) => {
                self.on_conn_syn(conn);
                0
            }
            (Cmd::NodeSyncReq, MsgBody::Sync(_)) => {
                self.on_sync_req(from_conn, &head);
                0
            }
            (Cmd::NodeSyncRsp, MsgBody::Sync(tree)) => {
                self.global_tree = tree.nodes;
                0
            }
            _ => {
                self.notify_error(Error::InvalidMsg);
                0
            }
        }
    }

    // ===== registration =====

    fn on_reg_req(&mut self, from_conn: Option<ConnId>, head: &MsgHead, reg: RegData) {
        let Some(cid) = from_conn else {
            warn!(peer = reg.bus_id, "registration without a connection ignored");
            return;
        };
        // ring channels have no reply path for a handshake
        if self.connections.get(&cid).is_none_or(|c| c.stream_token().is_none()) {
            warn!(peer = reg.bus_id, "registration over a polled channel ignored");
            return;
        }

        let accepted = self.accept_registration(cid, &reg);
        let ret = match &accepted {
            Ok(()) => 0,
            Err(err) => err.code(),
        };

        let rsp =
            Msg::new(Cmd::NodeRegRsp, 0, ret, head.sequence, MsgBody::Reg(self.local_reg_data()));
        self.send_on_conn(cid, &rsp);

        match accepted {
            Ok(()) => {
                // a freshly registered child gets our subtree snapshot
                if self.conf.global_router && self.is_direct_child(reg.bus_id) {
                    let snapshot = self.subtree_snapshot();
                    let seq = self.next_seq();
                    let sync = Msg::new(Cmd::NodeSyncRsp, 0, 0, seq, MsgBody::Sync(snapshot));
                    self.send_on_conn(cid, &sync);
                }
            }
            Err(err) => {
                warn!(peer = reg.bus_id, ?err, "registration rejected");
                self.disconnect_conn(cid);
            }
        }
    }

    fn on_reg_rsp(&mut self, from_conn: Option<ConnId>, head: &MsgHead, reg: RegData) {
        let Some(cid) = from_conn else { return };

        if head.ret != 0 {
            warn!(peer = reg.bus_id, ret = head.ret, "peer rejected our registration");
            self.notify_error(Error::InvalidId);
            self.disconnect_conn(cid);
            return;
        }

        if let Err(err) = self.accept_registration(cid, &reg) {
            self.notify_error(err);
            self.disconnect_conn(cid);
        }
    }

    /// Validate a peer's identity and wire it in: create its endpoint,
    /// bind the connection as control, then try faster data channels.
    fn accept_registration(&mut self, cid: ConnId, reg: &RegData) -> Result<(), Error> {
        self.validate_registration(reg)?;

        // the peer is our parent when we sit inside its subtree
        let is_parent = reg.children_mask > self.children_mask
            && is_child_of(reg.bus_id, reg.children_mask, self.id);

        let mut ep = Endpoint::new(
            reg.bus_id,
            reg.children_mask,
            reg.pid,
            reg.hostname.clone(),
            reg.channels.clone(),
            reg.has_global_tree,
        );
        ep.add_connection(cid, false);
        self.endpoints.insert(reg.bus_id, ep);

        if let Some(conn) = self.connections.get_mut(&cid) {
            conn.state = ConnState::Connected;
            conn.binding = Some(reg.bus_id);
            if reg.hostname == self.hostname {
                conn.flags.insert(ConnFlags::ACCESS_SHARE_HOST);
            }
        }

        if is_parent {
            self.parent_id = Some(reg.bus_id);
        }

        debug!(
            peer = reg.bus_id,
            mask = reg.children_mask,
            parent = is_parent,
            "endpoint registered"
        );

        self.probe_data_channels(reg);
        Ok(())
    }

    fn validate_registration(&self, reg: &RegData) -> Result<(), Error> {
        if reg.bus_id == self.id {
            return Err(Error::InvalidId);
        }
        if reg.children_mask >= 64 {
            return Err(Error::Params);
        }
        if self.endpoints.contains_key(&reg.bus_id) {
            return Err(Error::InvalidId);
        }

        // a peer claiming to be our descendant must fit inside our space
        if is_child_of(self.id, self.children_mask, reg.bus_id)
            && reg.children_mask >= self.children_mask
        {
            return Err(Error::InvalidId);
        }

        // subtrees may nest but never partially overlap
        let (reg_lo, reg_hi) = children_range(reg.bus_id, reg.children_mask);
        for ep in self.endpoints.values() {
            let (ep_lo, ep_hi) = ep.children_range();
            if reg_hi < ep_lo || ep_hi < reg_lo {
                continue;
            }
            let ep_is_ancestor = ep.children_mask() > reg.children_mask && ep.contains(reg.bus_id);
            let reg_is_ancestor = reg.children_mask > ep.children_mask()
                && is_child_of(reg.bus_id, reg.children_mask, ep.id());
            if !ep_is_ancestor && !reg_is_ancestor {
                return Err(Error::InvalidId);
            }
        }

        Ok(())
    }

    /// Attach whatever faster transports the peer advertises and
    /// locality permits: shared-memory rings on the same host, an
    /// in-process ring within the same process.
    fn probe_data_channels(&mut self, reg: &RegData) {
        let share_host = reg.hostname == self.hostname;
        let share_addr = share_host && reg.pid == self.pid;

        for channel in &reg.channels {
            let Ok(addr) = make_address(channel) else {
                continue;
            };

            let attached = match addr.scheme {
                Scheme::Shm if share_host => {
                    addr.shm_key().map_err(Error::from).and_then(|key| {
                        let ring = atbus_channel::ShmRing::open(key)?;
                        Ok((
                            crate::connection::Transport::Shm(ring),
                            ConnFlags::ACCESS_SHARE_HOST,
                        ))
                    })
                }
                Scheme::Mem if share_addr => {
                    addr.mem_base().map_err(Error::from).and_then(|base| {
                        let chan = unsafe {
                            atbus_channel::RingChannel::attach(
                                base as *mut u8,
                                self.conf.recv_buffer_size,
                            )
                        }?;
                        Ok((
                            crate::connection::Transport::Mem(chan),
                            ConnFlags::ACCESS_SHARE_ADDR | ConnFlags::ACCESS_SHARE_HOST,
                        ))
                    })
                }
                _ => continue,
            };

            match attached {
                Ok((transport, flags)) => {
                    let data_cid = self.alloc_conn_id();
                    self.connections.insert(data_cid, crate::connection::Connection {
                        id: data_cid,
                        address: addr,
                        state: ConnState::Connected,
                        flags,
                        binding: Some(reg.bus_id),
                        transport,
                        established_sec: self.now_sec,
                    });
                    if let Some(ep) = self.endpoints.get_mut(&reg.bus_id) {
                        ep.add_connection(data_cid, true);
                    }
                    debug!(peer = reg.bus_id, address = %channel, "data channel attached");
                }
                Err(err) => {
                    // best effort, the control connection still carries data
                    debug!(peer = reg.bus_id, address = %channel, ?err, "data channel skipped");
                }
            }
        }
    }

    // ===== liveness =====

    fn on_ping(&mut self, from_conn: Option<ConnId>, head: &MsgHead, ping: PingData) {
        let Some(ep_id) =
            from_conn.and_then(|cid| self.connections.get(&cid)).and_then(|c| c.binding)
        else {
            return;
        };

        let pong = Msg::new(Cmd::NodePong, 0, 0, head.sequence, MsgBody::Ping(ping));
        match pong.encode() {
            Ok(bytes) => {
                if let Err(err) = self.send_on_ctrl(ep_id, &bytes) {
                    self.notify_error(err);
                }
            }
            Err(err) => self.notify_error(err),
        }
    }

    fn on_pong(&mut self, from_conn: Option<ConnId>, ping: PingData) {
        let Some(ep_id) =
            from_conn.and_then(|cid| self.connections.get(&cid)).and_then(|c| c.binding)
        else {
            return;
        };
        let now_ms = self.now_ms();
        let now_sec = self.now_sec;

        if let Some(ep) = self.endpoints.get_mut(&ep_id)
            && ep.ping.outstanding_id == ping.ping_id
        {
            ep.ping.outstanding_id = 0;
            ep.ping.missed = 0;
            ep.ping.last_pong_sec = now_sec;
            ep.ping.rtt_ms = Some((now_ms - ping.time_point_ms).max(0));
        }
    }

    // ===== data plane =====

    fn on_forward_req(&mut self, head: &MsgHead, fwd: ForwardData) -> usize {
        if fwd.to == self.id {
            self.deliver_local(fwd.from, head.msg_type, &fwd.content);
            return 1;
        }

        let mut relayed = fwd.clone();
        relayed.router.push(self.id);
        let msg = Msg::new(
            Cmd::DataTransformReq,
            head.msg_type,
            0,
            head.sequence,
            MsgBody::Forward(relayed),
        );

        match self.route_and_send(fwd.to, &msg) {
            Ok(()) => {
                self.maybe_conn_syn(&fwd);
                1
            }
            Err(err) => {
                warn!(from = fwd.from, to = fwd.to, ?err, "forward failed");
                let rsp = Msg::new(
                    Cmd::DataTransformRsp,
                    head.msg_type,
                    err.code(),
                    head.sequence,
                    MsgBody::Forward(fwd.clone()),
                );
                if self.route_and_send(fwd.from, &rsp).is_err() {
                    self.notify_error(err);
                }
                0
            }
        }
    }

    fn on_forward_rsp(&mut self, head: &MsgHead, fwd: ForwardData) {
        if fwd.from == self.id {
            // our own send bounced somewhere down the path
            if let Some(cb) = self.on_send_failed.as_mut() {
                cb(fwd.to, head.msg_type, &fwd.content, head.ret);
            }
            return;
        }

        let origin = fwd.from;
        let msg =
            Msg::new(Cmd::DataTransformRsp, head.msg_type, head.ret, head.sequence, MsgBody::Forward(fwd));
        if let Err(err) = self.route_and_send(origin, &msg) {
            self.notify_error(err);
        }
    }

    /// When traffic between two of our direct children passes through
    /// us, offer the origin a direct line to its sibling. Best effort,
    /// never retried.
    fn maybe_conn_syn(&mut self, fwd: &ForwardData) {
        let from_child = self.direct_child_for(fwd.from);
        let to_child = self.direct_child_for(fwd.to);
        let (Some(from_child), Some(to_child)) = (from_child, to_child) else {
            return;
        };
        if from_child == to_child {
            return;
        }

        let Some(address) = self
            .endpoints
            .get(&to_child)
            .and_then(|ep| {
                ep.listen_addresses()
                    .iter()
                    .find(|a| {
                        make_address(a).is_ok_and(|p| {
                            matches!(p.scheme, Scheme::Ipv4 | Scheme::Ipv6 | Scheme::Unix | Scheme::Dns)
                        })
                    })
                    .cloned()
            })
        else {
            return;
        };

        debug!(origin = fwd.from, target = fwd.to, address = %address, "offering direct sibling link");
        let seq = self.next_seq();
        let syn = Msg::new(Cmd::NodeConnSyn, 0, 0, seq, MsgBody::Conn(ConnData { address }));
        match syn.encode() {
            Ok(bytes) => {
                let _ = self.send_on_ctrl(from_child, &bytes);
            }
            Err(err) => self.notify_error(err),
        }
    }

    fn on_conn_syn(&mut self, conn: ConnData) {
        let already = self.connections.values().any(|c| c.address.address == conn.address);
        if already {
            return;
        }
        debug!(address = %conn.address, "sibling link offered, connecting");
        self.actions.push(Action::ConnectTo { address: conn.address });
    }

    fn on_custom_cmd_req(&mut self, custom: CustomCommandData) {
        if let Some(cb) = self.on_custom_cmd.as_mut() {
            cb(custom.from, &custom.commands);
        }
    }

    fn on_sync_req(&mut self, from_conn: Option<ConnId>, head: &MsgHead) {
        let Some(ep_id) =
            from_conn.and_then(|cid| self.connections.get(&cid)).and_then(|c| c.binding)
        else {
            return;
        };
        let snapshot = self.subtree_snapshot();
        let rsp = Msg::new(Cmd::NodeSyncRsp, 0, 0, head.sequence, MsgBody::Sync(snapshot));
        match rsp.encode() {
            Ok(bytes) => {
                if let Err(err) = self.send_on_ctrl(ep_id, &bytes) {
                    self.notify_error(err);
                }
            }
            Err(err) => self.notify_error(err),
        }
    }

    // ===== helpers =====

    fn is_direct_child(&self, id: BusId) -> bool {
        id != self.id && is_child_of(self.id, self.children_mask, id)
    }

    /// The direct child endpoint whose subtree holds `id`, if any.
    fn direct_child_for(&self, id: BusId) -> Option<BusId> {
        self.endpoints
            .values()
            .filter(|ep| self.is_direct_child(ep.id()) && (ep.id() == id || ep.contains(id)))
            .min_by_key(|ep| ep.children_mask())
            .map(Endpoint::id)
    }

    fn subtree_snapshot(&self) -> NodeTree {
        NodeTree {
            nodes: self
                .endpoints
                .values()
                .filter(|ep| self.is_direct_child(ep.id()))
                .map(|ep| NodeRegistryData {
                    bus_id: ep.id(),
                    children_mask: ep.children_mask(),
                    has_global_tree: ep.flags().contains(crate::EndpointFlags::GLOBAL_ROUTER),
                })
                .collect(),
        }
    }

    fn send_on_conn(&mut self, cid: ConnId, msg: &Msg) {
        let encoded = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.notify_error(err);
                return;
            }
        };
        let Some(conn) = self.connections.get(&cid) else { return };
        match conn.stream_token() {
            Some(token) => self.actions.push(Action::Send { token, bytes: encoded }),
            None => {
                if let Some(chan) = conn.ring()
                    && let Err(err) = chan.send(&encoded)
                {
                    self.notify_error(Error::from(err));
                }
            }
        }
    }

    fn disconnect_conn(&mut self, cid: ConnId) {
        if let Some(conn) = self.connections.get_mut(&cid) {
            conn.state = ConnState::Disconnecting;
            if let Some(token) = conn.stream_token() {
                self.actions.push(Action::Disconnect { token });
            }
        }
    }
}
