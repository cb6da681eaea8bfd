//! This module contains types associated with messages traded
//! between the system processes: the tagged-sum `SystemMessage`
//! dispatched by `core::server`, and the `Header`/`WireMessage` pair
//! used to frame them on the wire.

use std::io::{Read, Write};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::socket::{SecureSocketRecv, SecureSocketSend};
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::error::*;
use crate::bft::ordering::{GlobalConfigNumber, Incarnation, PoSeqPair, SeqNo, View};

/// The largest signature this build can carry inline in a `Header`.
///
/// Sized for a 4096-bit RSA key; `Header::sig_len` records how many of
/// these bytes are actually meaningful for a given key size.
pub const MAX_SIGNATURE_LENGTH: usize = 512;

/// A header that is sent before a message in transit on the wire.
///
/// A fixed amount of `Header::LENGTH` bytes are read before a message
/// is read. Unlike the original fixed-array-of-bytes layout, fields
/// are packed explicitly field by field rather than transmuted in
/// place, since `Signature` is no longer a fixed-size POD type once
/// RSA (variable modulus size) replaces a fixed-width scheme; an
/// explicit `endian` tag records the byte order used, rather than
/// relying on conditional-compilation byte swaps.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub(crate) version: u32,
    pub(crate) endian: Endian,
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) length: u64,
    pub(crate) sig_len: u16,
    pub(crate) signature: [u8; MAX_SIGNATURE_LENGTH],
}

/// The byte order a `Header` was serialized with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Endian {
    Little,
    Big,
}

/// A message to be sent over the wire. The payload should be a
/// serialized `SystemMessage`, for correctness.
#[derive(Debug)]
pub struct WireMessage<'a> {
    pub(crate) header: Header,
    pub(crate) payload: &'a [u8],
}

/// The `Message` type encompasses all the messages traded between
/// different asynchronous tasks in the system.
pub enum Message<O> {
    /// An already-decoded, trusted message -- used to inject synthetic
    /// traffic into the dispatcher's own loop rather than anything
    /// received off the wire.
    System(Header, SystemMessage<O>),
    /// A freshly received wire payload, not yet decoded or signature
    /// checked. `core::server` runs it through `validate::validate`
    /// before handing the result to `Replica::handle_message`.
    RawSystem(Header, Vec<u8>),
    /// A peer with id `NodeId` has finished connecting (outbound, TLS
    /// handshake complete). This socket should only perform write
    /// operations.
    ConnectedTx(NodeId, SecureSocketSend),
    /// A peer with id `NodeId` has finished connecting (inbound, TLS
    /// handshake complete). This socket should only perform read
    /// operations.
    ConnectedRx(NodeId, SecureSocketRecv),
    /// A timeout has fired (`timeouts::TimeoutKind` serialized as an
    /// opaque token understood by `core::server`).
    Timeout(u64),
    /// Errors reported by asynchronous tasks.
    Error(NodeId, Error),
}

/// A `SystemMessage` corresponds to a message regarding one of the
/// ordering engine's sub-protocols.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum SystemMessage<O> {
    /// A request issued directly by a client.
    Request(RequestMessage<O>),
    /// A reply to a previously issued client request.
    Reply(ReplyMessage),
    /// A client special payload: catchup/reset/reconfiguration
    /// requests that bypass the normal ordering path.
    ClientSpecial(ClientSpecialMessage),
    /// Pre-Order layer traffic.
    PreOrder(PreOrderMessage<O>),
    /// Global-Order (consensus) layer traffic.
    Consensus(ConsensusMessage),
    /// Suspect-Leader traffic: TAT measurements and leader votes.
    SuspectLeader(SuspectLeaderMessage),
    /// Reliable-broadcast traffic, carrying an opaque serialized
    /// payload understood by the sub-protocol that initiated the
    /// broadcast instance (`sync` or `recovery`).
    ReliableBroadcast(ReliableBroadcastMessage),
    /// View-change (Synchronizer) traffic.
    Sync(SyncMessage),
    /// Catchup & Jump (collaborative state transfer) traffic.
    Cst(CstMessage),
    /// Proactive recovery and system reset traffic.
    Recovery(RecoveryMessage),
}

/// Represents a request from a client.
///
/// The `O` type argument symbolizes the client operation to be
/// performed over the replicated state.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct RequestMessage<O> {
    session_id: u64,
    operation_id: u64,
    operation: O,
}

/// A reply delivered to a client after its request has been executed.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ReplyMessage {
    session_id: u64,
    operation_id: u64,
    digest: Digest,
}

/// Client payloads that bypass the normal ordering path: catchup
/// requests, and requests to join an in-progress system reset or
/// membership reconfiguration.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum ClientSpecialMessage {
    /// A client requesting direct state transfer, outside the
    /// replicated log (e.g. a freshly provisioned replica).
    ClientStateTransfer,
    /// A client requesting that the system perform a full reset.
    ClientSystemReset,
    /// A client requesting a membership reconfiguration.
    ClientSystemReconf { new_config: GlobalConfigNumber },
    /// An out-of-band configuration message, authenticated out of
    /// band of the normal request path (e.g. delivered by an
    /// operator tool rather than a regular client session).
    ClientOobConfigMsg(Vec<u8>),
}

impl<O> RequestMessage<O> {
    /// Creates a new `RequestMessage`.
    pub fn new(session_id: u64, operation_id: u64, operation: O) -> Self {
        Self { session_id, operation_id, operation }
    }

    /// Returns a reference to the operation of type `O`.
    pub fn operation(&self) -> &O {
        &self.operation
    }

    /// Returns the client session id that issued this request.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns the client-assigned operation id of this request.
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }
}

impl ReplyMessage {
    /// Creates a new `ReplyMessage`.
    pub fn new(session_id: u64, operation_id: u64, digest: Digest) -> Self {
        Self { session_id, operation_id, digest }
    }

    /// Returns the client session id this reply is addressed to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns the client-assigned operation id this reply answers.
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    /// Returns the digest of the executed reply payload.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// Pre-Order (PO) layer messages (spec.md's PO sub-protocol).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum PreOrderMessage<O> {
    /// A client request broadcast by its originating replica, tagged
    /// with its `PoSeqPair`.
    PoRequest(PoSeqPair, RequestMessage<O>),
    /// An acknowledgement of a `PoRequest`, from a non-originating
    /// replica.
    PoAck(NodeId, PoSeqPair, Digest),
    /// The aggregated-running-update announcement of the highest
    /// `PoSeqPair` a replica has accumulated, for some originator.
    PoAru(NodeId, PoSeqPair),
    /// A proof matrix: one row of `PoAru`/`PoAck` evidence per
    /// originator, bundled by the leader into a `Pre_Prepare`.
    ProofMatrix(SeqNo, Vec<(NodeId, PoSeqPair, Digest)>),
}

/// Global-Order (ORD) layer messages: the classic three-phase
/// pre-prepare/prepare/commit exchange, generalized to carry a
/// `ProofMatrix` instead of a single client batch digest.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ConsensusMessage {
    seq: SeqNo,
    view: View,
    kind: ConsensusMessageKind,
}

/// Represents one of the Global-Order layer's consensus phases.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum ConsensusMessageKind {
    /// Pre-prepare a Pre-Order proof matrix, proposed by the leader.
    /// The `Digest` represents the hash of the serialized proof
    /// matrix payload.
    PrePrepare(Digest),
    /// Prepare a previously pre-prepared proof matrix.
    Prepare(Digest),
    /// Commit a prepared proof matrix, signaling the system is ready
    /// to make its slot eligible for execution.
    Commit(Digest),
}

impl ConsensusMessage {
    /// Creates a new `ConsensusMessage` with sequence number `seq`,
    /// view `view`, and of the kind `kind`.
    pub fn new(seq: SeqNo, view: View, kind: ConsensusMessageKind) -> Self {
        Self { seq, view, kind }
    }

    /// Returns the sequence number of this consensus message.
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    /// Returns the view this consensus message was sent under.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind {
        &self.kind
    }
}

/// Suspect-Leader traffic: turn-around-time measurements and the
/// leader-change voting that follows a suspicion.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum SuspectLeaderMessage {
    /// A round-trip-time probe, used to measure the current leader's
    /// turn-around-time (TAT).
    RttPing(u64),
    /// The reply to an `RttPing`, echoing its nonce.
    RttPong(u64),
    /// An announcement that a replica's TAT measurement exceeded the
    /// suspicion threshold for `view`.
    TatMeasure(View, u64),
    /// A vote to replace the leader of `view`.
    NewLeader(View),
    /// A certificate of `2f+k+1` matching `NewLeader` votes.
    NewLeaderProof(View, Vec<(NodeId, Signature)>),
}

/// A reliable-broadcast protocol instance identifier: who initiated
/// the broadcast, and a monotonically increasing counter scoping it
/// among that initiator's broadcasts.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RbInstance {
    pub initiator: NodeId,
    pub instance_id: u64,
}

/// Bracha-style reliable-broadcast traffic. The broadcast payload
/// itself is opaque at this layer: `sync` and `recovery` each
/// serialize their own content (a `Report`, a `ResetVote`, ...) into
/// the `Init` variant's bytes, and interpret it again once delivered.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum ReliableBroadcastMessage {
    /// The initial broadcast of a payload.
    Init(RbInstance, Vec<u8>),
    /// An echo of a digest seen in an `Init` (or from `2f+k+1` matching
    /// `Echo`s).
    Echo(RbInstance, Digest),
    /// A readiness vote: `f+k+1` matching `Echo`s, or `f+1` matching
    /// `Ready`s, were observed for this digest.
    Ready(RbInstance, Digest),
}

/// View-change (Synchronizer) traffic.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum SyncMessage {
    /// A per-replica report of its suspicion of the current leader,
    /// carrying the reporter's own `execARU` and the size of the
    /// `PC_Set` it is about to reliably-broadcast right after.
    Report(View, SeqNo, usize),
    /// The set of prepared certificates a replica is carrying into the
    /// new view.
    PcSet(View, Vec<(SeqNo, Digest)>),
    /// A vote to install `view`, carrying the voter's last stable
    /// checkpoint sequence number.
    VcList(View, SeqNo),
    /// A partial signature over a `VcProof` candidate, fed into the
    /// threshold-signature pipeline.
    VcPartialSig(View, Digest, Vec<u8>),
    /// A certificate of `2f+k+1` matching `VcList` votes, installing
    /// `view`.
    VcProof(View, Vec<(NodeId, SeqNo)>),
    /// The new leader's replay of prepared-but-not-committed slots
    /// carried over from the previous view.
    Replay(View, Vec<(SeqNo, Digest)>),
    /// A prepare vote for a replayed slot.
    ReplayPrepare(View, SeqNo, Digest),
    /// A commit vote for a replayed slot.
    ReplayCommit(View, SeqNo, Digest),
}

/// The reason a `CstMessage` was sent: a routine catchup for a small
/// gap, or a jump across one or more stable checkpoints.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CstMessageKind {
    Catchup,
    Jump,
}

/// Catchup & Jump (collaborative state transfer) traffic.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum CstMessage {
    /// A request for the latest executed sequence number known to
    /// peer replicas.
    RequestLatestConsensus(u64),
    /// A reply carrying a replica's latest executed sequence number
    /// and current view.
    ReplyLatestConsensus(u64, SeqNo, View),
    /// A request for the checkpointed application state (and any
    /// decision log entries above it).
    RequestState(u64, CstMessageKind),
    /// A reply carrying checkpointed state, or the decision log
    /// entries needed to catch up.
    ReplyState(u64, CstMessageKind, Vec<u8>),
    /// Instructs the receiving replica to jump directly to
    /// `target_seq`, skipping reconciliation of intervening log
    /// entries, backed by a quorum certificate.
    Jump(SeqNo, Vec<(NodeId, Signature)>),
}

/// Proactive recovery and system-reset traffic.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum RecoveryMessage {
    /// Announces that a replica has rebooted into a new incarnation.
    NewIncarnation(Incarnation),
    /// Acknowledges a `NewIncarnation` announcement.
    IncarnationAck(NodeId, Incarnation, Signature),
    /// A certificate of `2f+k+1` matching `IncarnationAck`s.
    IncarnationCert(Incarnation, Vec<(NodeId, Signature)>),
    /// A vote to perform a full system reset.
    ResetVote(GlobalConfigNumber),
    /// This replica's share of a combined reset signature.
    ResetShare(GlobalConfigNumber, Vec<u8>),
    /// A proposal to reset the system to `GlobalConfigNumber`, carrying
    /// `2f+k+1` combined `ResetVote`s.
    ResetProposal(GlobalConfigNumber, Vec<u8>),
    /// A prepare vote for a `ResetProposal`.
    ResetPrepare(GlobalConfigNumber, Digest),
    /// A commit vote for a `ResetProposal`.
    ResetCommit(GlobalConfigNumber, Digest),
    /// The combined threshold-signature certificate finalizing a
    /// system reset.
    ResetCertificate(GlobalConfigNumber, Vec<u8>),
    /// A vote to replace the leader during a reset-in-progress.
    ResetNewLeader(GlobalConfigNumber, View),
    /// A certificate of matching `ResetNewLeader` votes.
    ResetNewLeaderProof(GlobalConfigNumber, View, Vec<(NodeId, Signature)>),
    /// A view-change vote scoped to the reset protocol.
    ResetViewChange(GlobalConfigNumber, View),
    /// Installs a new view for the reset protocol, analogous to `sync`'s
    /// `VcProof` but scoped to `GlobalConfigNumber`.
    ResetNewView(GlobalConfigNumber, View, Vec<(NodeId, SeqNo)>),
}

impl Header {
    /// The size of the on-wire representation of a `Header`, in bytes.
    pub const LENGTH: usize =
        4 /* version */ + 1 /* endian */ + 4 /* from */ + 4 /* to */ + 8 /* length */ + 2 /* sig_len */ + MAX_SIGNATURE_LENGTH;

    /// Serializes a `Header` into a byte buffer of appropriate size.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into").wrapped(ErrorKind::CommunicationMessage);
        }
        let mut cursor = &mut buf[..];
        cursor.write_all(&self.version.to_le_bytes()).unwrap();
        cursor.write_all(&[match self.endian { Endian::Little => 0, Endian::Big => 1 }]).unwrap();
        cursor.write_all(&self.from.to_le_bytes()).unwrap();
        cursor.write_all(&self.to.to_le_bytes()).unwrap();
        cursor.write_all(&self.length.to_le_bytes()).unwrap();
        cursor.write_all(&self.sig_len.to_le_bytes()).unwrap();
        cursor.write_all(&self.signature[..]).unwrap();
        Ok(())
    }

    /// Deserializes a `Header` from a byte buffer of appropriate size.
    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from").wrapped(ErrorKind::CommunicationMessage);
        }
        let mut cursor = &buf[..];

        let mut version_buf = [0; 4];
        cursor.read_exact(&mut version_buf).unwrap();
        let version = u32::from_le_bytes(version_buf);

        let mut endian_buf = [0; 1];
        cursor.read_exact(&mut endian_buf).unwrap();
        let endian = match endian_buf[0] {
            0 => Endian::Little,
            _ => Endian::Big,
        };

        let mut from_buf = [0; 4];
        cursor.read_exact(&mut from_buf).unwrap();
        let from = u32::from_le_bytes(from_buf);

        let mut to_buf = [0; 4];
        cursor.read_exact(&mut to_buf).unwrap();
        let to = u32::from_le_bytes(to_buf);

        let mut length_buf = [0; 8];
        cursor.read_exact(&mut length_buf).unwrap();
        let length = u64::from_le_bytes(length_buf);

        let mut sig_len_buf = [0; 2];
        cursor.read_exact(&mut sig_len_buf).unwrap();
        let sig_len = u16::from_le_bytes(sig_len_buf);

        let mut signature = [0; MAX_SIGNATURE_LENGTH];
        cursor.read_exact(&mut signature).unwrap();

        Ok(Header { version, endian, from, to, length, sig_len, signature })
    }

    /// Reports the current version of the wire protocol, i.e.
    /// `WireMessage::CURRENT_VERSION`.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the id of the process that sent this message.
    pub fn from(&self) -> NodeId {
        NodeId::from(self.from)
    }

    /// Returns the id of the process this message is addressed to.
    pub fn to(&self) -> NodeId {
        NodeId::from(self.to)
    }

    /// Returns the length of the payload following this header.
    pub fn payload_length(&self) -> usize {
        self.length as usize
    }

    /// Reconstructs the `Signature` carried by this header.
    pub fn signature(&self) -> Result<Signature> {
        Signature::from_bytes(&self.signature[..self.sig_len as usize])
    }
}

impl<'a> WireMessage<'a> {
    /// The current version of the wire protocol.
    pub const CURRENT_VERSION: u32 = 0;

    /// Constructs a new message to be sent over the wire.
    pub fn new(from: NodeId, to: NodeId, payload: &'a [u8], sig: Option<Signature>) -> Self {
        let (from, to): (u32, u32) = (from.into(), to.into());
        let mut signature = [0; MAX_SIGNATURE_LENGTH];
        let sig_len = match &sig {
            Some(sig) => {
                let bytes = sig.as_ref();
                signature[..bytes.len()].copy_from_slice(bytes);
                bytes.len() as u16
            }
            None => 0,
        };
        let header = Header {
            version: Self::CURRENT_VERSION,
            endian: Endian::Little,
            length: payload.len() as u64,
            sig_len,
            signature,
            from,
            to,
        };
        Self { header, payload }
    }

    /// Builds a `WireMessage` out of a pre-existing `Header` and payload,
    /// as received from the wire.
    pub fn from_parts(header: Header, payload: &'a [u8]) -> Result<Self> {
        let message = Self { header, payload };
        if !message.is_valid() {
            return Err("Invalid wire message").wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(message)
    }

    /// Retrieve the inner `Header` and payload byte buffer stored
    /// inside the `WireMessage`.
    pub fn into_inner(self) -> (Header, &'a [u8]) {
        (self.header, self.payload)
    }

    /// Returns a reference to the `Header` of the `WireMessage`.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns a reference to the payload bytes of the `WireMessage`.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Checks for the correctness of the `WireMessage`'s framing.
    /// Signature verification happens downstream, in `crypto`'s
    /// validation pipeline, once the payload has been deserialized.
    pub fn is_valid(&self) -> bool {
        self.header.version == Self::CURRENT_VERSION
            && self.header.payload_length() == self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_serialize_roundtrip() {
        let signature = Signature::from_bytes(&[7; 256][..]).expect("invalid signature length");
        let (old_header, _) =
            WireMessage::new(NodeId::from(0), NodeId::from(3), b"I am a cool payload!", Some(signature))
                .into_inner();
        let mut buf = [0; Header::LENGTH];
        old_header.serialize_into(&mut buf[..]).expect("serialize failed");
        let new_header = Header::deserialize_from(&buf[..]).expect("deserialize failed");
        assert_eq!(old_header, new_header);
    }

    #[test]
    fn test_wire_message_rejects_length_mismatch() {
        let (header, _) = WireMessage::new(NodeId::from(0), NodeId::from(1), b"abc", None).into_inner();
        assert!(WireMessage::from_parts(header, b"wrong length").is_err());
    }
}
