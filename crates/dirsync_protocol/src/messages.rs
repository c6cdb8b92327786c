//! Replication messages.

use crate::error::{ProtocolError, ProtocolResult};
use dirsync_core::{Csn, DomainId, ReplicaId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A message exchanged between replicas of one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMsg {
    /// A change to replay.
    Update(UpdateMsg),
    /// Liveness of a replica with no changes to send.
    Heartbeat(HeartbeatMsg),
    /// A replica left the topology cleanly.
    Offline(OfflineMsg),
    /// Acknowledgement of an assured update.
    Ack(AckMsg),
}

impl ReplicationMsg {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ReplicationMsg::Update(_) => 1,
            ReplicationMsg::Heartbeat(_) => 2,
            ReplicationMsg::Offline(_) => 3,
            ReplicationMsg::Ack(_) => 4,
        }
    }

    /// The CSN the message is about.
    pub fn csn(&self) -> Csn {
        match self {
            ReplicationMsg::Update(msg) => msg.csn,
            ReplicationMsg::Heartbeat(msg) => msg.csn,
            ReplicationMsg::Offline(msg) => msg.csn,
            ReplicationMsg::Ack(msg) => msg.csn,
        }
    }

    /// Encodes to the wire form: the type byte followed by the CBOR body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = vec![self.type_code()];
        match self {
            ReplicationMsg::Update(msg) => write_body(msg, &mut out)?,
            ReplicationMsg::Heartbeat(msg) => write_body(msg, &mut out)?,
            ReplicationMsg::Offline(msg) => write_body(msg, &mut out)?,
            ReplicationMsg::Ack(msg) => write_body(msg, &mut out)?,
        }
        Ok(out)
    }

    /// Decodes the wire form.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        match code {
            1 => read_body(body).map(ReplicationMsg::Update),
            2 => read_body(body).map(ReplicationMsg::Heartbeat),
            3 => read_body(body).map(ReplicationMsg::Offline),
            4 => read_body(body).map(ReplicationMsg::Ack),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

fn write_body<T: Serialize>(body: &T, out: &mut Vec<u8>) -> ProtocolResult<()> {
    ciborium::into_writer(body, out).map_err(ProtocolError::encode)
}

fn read_body<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(body).map_err(ProtocolError::decode)
}

/// Kind of directory operation carried by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Entry creation.
    Add,
    /// Entry removal.
    Delete,
    /// Attribute modifications.
    Modify,
    /// Rename or move.
    ModifyDn,
}

/// Assured replication mode requested for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Wait until `level` servers hold the change.
    SafeData {
        /// Number of servers that must hold the change, the origin included.
        level: u8,
    },
    /// Wait until every replica has replayed the change.
    SafeRead,
}

/// A change produced on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Replication domain.
    pub domain: DomainId,
    /// CSN assigned by the originating replica.
    pub csn: Csn,
    /// Operation kind.
    pub opcode: Opcode,
    /// Distinguished name of the target entry.
    pub target_dn: String,
    /// Assured mode, when the origin waits for acknowledgements.
    pub assured: Option<AssuredMode>,
    /// Encoded operation body.
    pub payload: Vec<u8>,
}

impl UpdateMsg {
    /// Creates a non-assured update.
    pub fn new(
        domain: DomainId,
        csn: Csn,
        opcode: Opcode,
        target_dn: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            domain,
            csn,
            opcode,
            target_dn: target_dn.into(),
            assured: None,
            payload: payload.into(),
        }
    }

    /// Requests assured replication.
    #[must_use]
    pub fn assured(mut self, mode: AssuredMode) -> Self {
        self.assured = Some(mode);
        self
    }

    /// Returns true if the origin waits for an acknowledgement.
    pub fn is_assured(&self) -> bool {
        self.assured.is_some()
    }

    /// Replica that produced the change.
    pub fn origin(&self) -> ReplicaId {
        self.csn.replica_id()
    }
}

/// Periodic liveness message carrying the sender's current CSN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    /// Replication domain.
    pub domain: DomainId,
    /// A CSN of the sender at its current time.
    pub csn: Csn,
}

/// Sent by a replica that leaves the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineMsg {
    /// Replication domain.
    pub domain: DomainId,
    /// Newest CSN of the departing replica.
    pub csn: Csn,
}

/// Acknowledgement of an assured update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    /// CSN of the acknowledged update.
    pub csn: Csn,
    /// Server that sent the ack.
    pub sender: ReplicaId,
    /// Some expected server did not answer in time.
    pub has_timeout: bool,
    /// Some expected server was in a status that cannot acknowledge.
    pub has_wrong_status: bool,
    /// Some server failed to replay the update.
    pub has_replay_error: bool,
    /// Servers behind the error flags.
    pub failed_servers: Vec<ReplicaId>,
}

impl AckMsg {
    /// A clean acknowledgement from `sender`.
    pub fn new(csn: Csn, sender: ReplicaId) -> Self {
        Self {
            csn,
            sender,
            has_timeout: false,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: Vec::new(),
        }
    }

    /// An acknowledgement reporting that `server` could not replay the update.
    pub fn replay_error(csn: Csn, server: ReplicaId) -> Self {
        Self {
            has_replay_error: true,
            failed_servers: vec![server],
            ..Self::new(csn, server)
        }
    }

    /// Returns true if any error flag is set.
    pub fn has_errors(&self) -> bool {
        self.has_timeout || self.has_wrong_status || self.has_replay_error
    }

    /// Folds another server's answer for the same update into this one.
    ///
    /// The sender is left as is.
    pub fn merge(&mut self, other: &AckMsg) {
        self.has_timeout |= other.has_timeout;
        self.has_wrong_status |= other.has_wrong_status;
        self.has_replay_error |= other.has_replay_error;
        for server in &other.failed_servers {
            if !self.failed_servers.contains(server) {
                self.failed_servers.push(*server);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn domain() -> DomainId {
        DomainId::new("dc=example,dc=com")
    }

    fn update() -> UpdateMsg {
        UpdateMsg::new(
            domain(),
            Csn::new(1_700_000_000_000, 7, ReplicaId(3)),
            Opcode::Modify,
            "uid=jdoe,ou=people,dc=example,dc=com",
            vec![0xa1, 0x01, 0x02],
        )
    }

    #[test]
    fn update_roundtrip() {
        let msg = ReplicationMsg::Update(update().assured(AssuredMode::SafeData { level: 2 }));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], 1);

        let decoded = ReplicationMsg::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        match decoded {
            ReplicationMsg::Update(update) => {
                assert!(update.is_assured());
                assert_eq!(update.origin(), ReplicaId(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_roundtrip_keeps_flags() {
        let mut ack = AckMsg::new(update().csn, ReplicaId(3));
        ack.merge(&AckMsg::replay_error(update().csn, ReplicaId(4)));
        ack.merge(&AckMsg::replay_error(update().csn, ReplicaId(4)));
        assert!(ack.has_errors());
        assert_eq!(ack.failed_servers, vec![ReplicaId(4)]);
        assert_eq!(ack.sender, ReplicaId(3));

        let msg = ReplicationMsg::Ack(ack);
        let decoded = ReplicationMsg::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn type_codes() {
        let csn = update().csn;
        assert_eq!(ReplicationMsg::Update(update()).type_code(), 1);
        assert_eq!(
            ReplicationMsg::Heartbeat(HeartbeatMsg { domain: domain(), csn }).type_code(),
            2
        );
        assert_eq!(
            ReplicationMsg::Offline(OfflineMsg { domain: domain(), csn }).type_code(),
            3
        );
        assert_eq!(ReplicationMsg::Ack(AckMsg::new(csn, ReplicaId(2))).type_code(), 4);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(ReplicationMsg::decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            ReplicationMsg::decode(&[9, 0xa0]),
            Err(ProtocolError::UnknownType(9))
        ));

        let bytes = ReplicationMsg::Update(update()).encode().unwrap();
        assert!(matches!(
            ReplicationMsg::decode(&bytes[..bytes.len() / 2]),
            Err(ProtocolError::Decode(_))
        ));
    }

    proptest! {
        #[test]
        fn csn_survives_the_wire(ts in 0u64..(1 << 48), seq in any::<u32>(), replica in any::<u16>()) {
            let csn = Csn::new(ts, seq, ReplicaId(replica));
            let msg = ReplicationMsg::Heartbeat(HeartbeatMsg { domain: domain(), csn });
            let decoded = ReplicationMsg::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.csn(), csn);
        }
    }
}
