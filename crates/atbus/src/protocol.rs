//! Control-plane message schema.
//!
//! The envelope is `{head, body}`; `head.cmd` names the operation and
//! the body enum carries the matching payload. Encoding is compact
//! binary via `bitcode`; a decode failure is a `BadData` error and the
//! offending connection is dropped.

use serde::{Deserialize, Serialize};

use crate::Error;

/// 64-bit routing key, partitioned by a children mask.
pub type BusId = u64;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmd {
    DataTransformReq,
    DataTransformRsp,
    CustomCmdReq,
    NodeSyncReq,
    NodeSyncRsp,
    NodeRegReq,
    NodeRegRsp,
    NodeConnSyn,
    NodePing,
    NodePong,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct MsgHead {
    pub cmd: Cmd,
    pub msg_type: i32,
    /// Zero on success paths, a negative error code on failure
    /// responses.
    pub ret: i32,
    pub sequence: u32,
}

/// Application payload routed hop by hop. `router` accumulates the ids
/// of every node that forwarded it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ForwardData {
    pub from: BusId,
    pub to: BusId,
    pub router: Vec<BusId>,
    pub content: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CustomCommandData {
    pub from: BusId,
    pub commands: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegData {
    pub bus_id: BusId,
    pub pid: i32,
    pub hostname: String,
    /// Listen addresses the peer may connect data channels to.
    pub channels: Vec<String>,
    pub children_mask: u32,
    pub has_global_tree: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRegistryData {
    pub bus_id: BusId,
    pub children_mask: u32,
    pub has_global_tree: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct NodeTree {
    pub nodes: Vec<NodeRegistryData>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnData {
    pub address: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingData {
    pub ping_id: u32,
    pub time_point_ms: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum MsgBody {
    Forward(ForwardData),
    Custom(CustomCommandData),
    Reg(RegData),
    Sync(NodeTree),
    Conn(ConnData),
    Ping(PingData),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Msg {
    pub head: MsgHead,
    pub body: MsgBody,
}

impl Msg {
    pub fn new(cmd: Cmd, msg_type: i32, ret: i32, sequence: u32, body: MsgBody) -> Self {
        Self { head: MsgHead { cmd, msg_type, ret, sequence }, body }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bitcode::serialize(self).map_err(|_| Error::BadData)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        bitcode::deserialize(bytes).map_err(|_| Error::BadData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let msg = Msg::new(
            Cmd::DataTransformReq,
            7,
            0,
            42,
            MsgBody::Forward(ForwardData {
                from: 0x1234_5678,
                to: 0x1235_6789,
                router: vec![0x1234_0000],
                content: b"abcdefg\0hello world!\n".to_vec(),
            }),
        );

        let bytes = msg.encode().unwrap();
        let back = Msg::decode(&bytes).unwrap();
        assert_eq!(back.head.cmd, Cmd::DataTransformReq);
        assert_eq!(back.head.msg_type, 7);
        assert_eq!(back.head.sequence, 42);
        let MsgBody::Forward(f) = back.body else { panic!("wrong body") };
        assert_eq!(f.router, vec![0x1234_0000]);
        assert_eq!(f.content, b"abcdefg\0hello world!\n");
    }

    #[test]
    fn garbage_is_bad_data() {
        assert_eq!(Msg::decode(b"definitely not a message").unwrap_err(), Error::BadData);
        assert_eq!(Msg::decode(&[]).unwrap_err(), Error::BadData);
    }

    #[test]
    fn reg_roundtrip() {
        let msg = Msg::new(
            Cmd::NodeRegReq,
            0,
            0,
            1,
            MsgBody::Reg(RegData {
                bus_id: 0x1234_6789,
                pid: 4242,
                hostname: "host-a".into(),
                channels: vec!["ipv4://127.0.0.1:16387".into(), "shm://16339".into()],
                children_mask: 8,
                has_global_tree: false,
            }),
        );
        let back = Msg::decode(&msg.encode().unwrap()).unwrap();
        let MsgBody::Reg(reg) = back.body else { panic!("wrong body") };
        assert_eq!(reg.channels.len(), 2);
        assert_eq!(reg.children_mask, 8);
    }
}
