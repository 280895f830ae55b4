use bitflags::bitflags;

use crate::{connection::ConnId, protocol::BusId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointFlags: u32 {
        /// The peer keeps a global routing table.
        const GLOBAL_ROUTER = 1;
        /// Data connections are sorted by locality priority.
        const CONNECTION_SORTED = 1 << 1;
        const RESETTING = 1 << 2;
    }
}

/// Inclusive id range of all descendants of `(id, mask)`.
pub fn children_range(id: BusId, mask: u32) -> (BusId, BusId) {
    if mask >= 64 {
        return (0, BusId::MAX);
    }
    let low_bits = (1u64 << mask) - 1;
    (id & !low_bits, id | low_bits)
}

/// Whether `other` falls inside the subtree of `(id, mask)`.
pub fn is_child_of(id: BusId, mask: u32, other: BusId) -> bool {
    let (lo, hi) = children_range(id, mask);
    other >= lo && other <= hi
}

/// Last ping exchange bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingStat {
    /// Ping id awaiting its pong, zero when none.
    pub outstanding_id: u32,
    pub last_ping_sec: i64,
    pub last_pong_sec: i64,
    pub rtt_ms: Option<i64>,
    /// Intervals that elapsed with the pong still outstanding.
    pub missed: usize,
}

/// A remote node as seen from this node: its identity plus the control
/// connection and any data connections bound to it.
#[derive(Debug)]
pub struct Endpoint {
    id: BusId,
    children_mask: u32,
    pid: i32,
    hostname: String,
    listen_addresses: Vec<String>,

    pub(crate) flags: EndpointFlags,
    pub(crate) ctrl_conn: Option<ConnId>,
    pub(crate) data_conn: Vec<ConnId>,
    pub(crate) ping: PingStat,
}

impl Endpoint {
    pub(crate) fn new(
        id: BusId,
        children_mask: u32,
        pid: i32,
        hostname: String,
        listen_addresses: Vec<String>,
        global_router: bool,
    ) -> Self {
        let mut flags = EndpointFlags::empty();
        if global_router {
            flags |= EndpointFlags::GLOBAL_ROUTER;
        }
        Self {
            id,
            children_mask,
            pid,
            hostname,
            listen_addresses,
            flags,
            ctrl_conn: None,
            data_conn: Vec::new(),
            ping: PingStat::default(),
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn children_mask(&self) -> u32 {
        self.children_mask
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn listen_addresses(&self) -> &[String] {
        &self.listen_addresses
    }

    pub fn children_range(&self) -> (BusId, BusId) {
        children_range(self.id, self.children_mask)
    }

    /// Whether `other` lies inside this endpoint's subtree.
    pub fn contains(&self, other: BusId) -> bool {
        is_child_of(self.id, self.children_mask, other)
    }

    /// Sibling test: disjoint own subtree, same parent subtree when a
    /// parent mask is known (zero means no parent, everything is kin).
    pub fn is_brother_of(&self, other: BusId, parent_mask: u32) -> bool {
        !self.contains(other)
            && (parent_mask == 0 || {
                let (lo, hi) = children_range(self.id, parent_mask);
                other >= lo && other <= hi
            })
    }

    pub fn ping_stat(&self) -> &PingStat {
        &self.ping
    }

    pub fn has_ctrl_connection(&self) -> bool {
        self.ctrl_conn.is_some()
    }

    pub fn data_connection_count(&self) -> usize {
        self.data_conn.len()
    }

    pub fn flags(&self) -> EndpointFlags {
        self.flags
    }

    pub(crate) fn add_connection(&mut self, conn: ConnId, force_data: bool) -> bool {
        if self.flags.contains(EndpointFlags::RESETTING) {
            return false;
        }
        if force_data || self.ctrl_conn.is_some() {
            self.data_conn.push(conn);
            self.flags.remove(EndpointFlags::CONNECTION_SORTED);
        } else {
            self.ctrl_conn = Some(conn);
        }
        true
    }

    /// Drop a connection; returns true when the endpoint can no longer
    /// function (control connection gone, or the last data connection).
    pub(crate) fn remove_connection(&mut self, conn: ConnId) -> bool {
        if self.ctrl_conn == Some(conn) {
            self.ctrl_conn = None;
            return true;
        }
        if let Some(pos) = self.data_conn.iter().position(|c| *c == conn) {
            self.data_conn.remove(pos);
            return self.data_conn.is_empty() && self.ctrl_conn.is_none();
        }
        false
    }

    pub(crate) fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids = Vec::with_capacity(self.data_conn.len() + 1);
        ids.extend(self.ctrl_conn);
        ids.extend(self.data_conn.iter().copied());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENT_ID: BusId = 0x1234_5678;
    const PARENT_MASK: u32 = 16;
    const CHILD_ID: BusId = 0x1234_6789;
    const CHILD_MASK: u32 = 8;

    #[test]
    fn children_range_bounds() {
        assert_eq!(children_range(PARENT_ID, PARENT_MASK), (0x1234_0000, 0x1234_ffff));
        assert_eq!(children_range(CHILD_ID, CHILD_MASK), (0x1234_6700, 0x1234_67ff));
        assert_eq!(children_range(7, 0), (7, 7));
        assert_eq!(children_range(42, 64), (0, BusId::MAX));
    }

    #[test]
    fn parent_child_classification() {
        // the child is inside the parent subtree, not the other way
        assert!(is_child_of(PARENT_ID, PARENT_MASK, CHILD_ID));
        assert!(!is_child_of(CHILD_ID, CHILD_MASK, PARENT_ID));

        // every id is inside its own range
        assert!(is_child_of(PARENT_ID, PARENT_MASK, PARENT_ID));

        // unrelated subtree
        assert!(!is_child_of(PARENT_ID, PARENT_MASK, 0x1235_6789));
    }

    #[test]
    fn sibling_classification() {
        let ep = Endpoint::new(CHILD_ID, CHILD_MASK, 0, String::new(), Vec::new(), false);

        // same parent subtree, disjoint child subtree
        assert!(ep.is_brother_of(0x1234_6890, PARENT_MASK));
        // own descendant is not a sibling
        assert!(!ep.is_brother_of(0x1234_6790, PARENT_MASK));
        // outside the parent subtree
        assert!(!ep.is_brother_of(0x1235_0001, PARENT_MASK));
        // with no parent configured everything disjoint counts
        assert!(ep.is_brother_of(0x1235_0001, 0));
    }

    #[test]
    fn ctrl_then_data_connections() {
        let mut ep = Endpoint::new(CHILD_ID, CHILD_MASK, 0, String::new(), Vec::new(), false);

        assert!(ep.add_connection(ConnId(1), false));
        assert_eq!(ep.ctrl_conn, Some(ConnId(1)));

        assert!(ep.add_connection(ConnId(2), false));
        assert!(ep.add_connection(ConnId(3), true));
        assert_eq!(ep.data_conn, vec![ConnId(2), ConnId(3)]);
        assert!(!ep.flags.contains(EndpointFlags::CONNECTION_SORTED));

        // dropping a data connection with others left keeps it alive
        assert!(!ep.remove_connection(ConnId(2)));
        // dropping control forces reset
        assert!(ep.remove_connection(ConnId(1)));
    }
}
