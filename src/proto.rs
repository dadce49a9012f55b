//! Messages exchanged between nodes.
//!
//! Every request is answered by exactly one reply carrying the request's [`MessageId`] in
//! [`Envelope::reply_to`]. Replies are correlated by the [`crate::rpc`] substrate.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    keys::{Epoch, NodeId, PeerId, Recno, TxnId},
    txn::Transaction,
};

/// Identifier of a message, unique per sending node.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("{from}/{seq}")]
pub struct MessageId {
    /// Node that allocated the id.
    pub from: NodeId,
    /// Counter local to `from`.
    pub seq: u64,
}

/// A message in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Id of this message.
    pub id: MessageId,
    /// Sender.
    pub from: NodeId,
    /// Receiver.
    pub to: NodeId,
    /// For replies, the id of the request being answered.
    pub reply_to: Option<MessageId>,
    /// Payload.
    pub message: Message,
}

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum FailureReason {
    /// The requested record does not exist.
    #[display("not found")]
    NotFound,
    /// A different reconciliation record already exists at this recno.
    #[display("reconciliation already recorded")]
    AlreadyRecorded,
    /// Reconciliations must be recorded in recno order.
    #[display("out of order, expected recno {expected}")]
    OutOfOrder {
        /// The next recno the ledger accepts.
        expected: Recno,
    },
    /// Storage kept deadlocking after all retries.
    #[display("storage deadlock")]
    Deadlock,
    /// Storage failure.
    #[display("storage error: {_0}")]
    Storage(String),
    /// A key could not be encoded, e.g. a peer name that is too long.
    #[display("invalid key: {_0}")]
    InvalidKey(String),
    /// No reply arrived in time. Only produced locally by the substrate.
    #[display("timed out")]
    TimedOut,
}

impl FailureReason {
    /// Whether resending the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::Deadlock | FailureReason::Storage(_) | FailureReason::TimedOut
        )
    }
}

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::EnumDiscriminants)]
#[strum_discriminants(name(MessageKind))]
#[strum_discriminants(derive(Hash, strum::Display, Serialize, Deserialize))]
#[strum_discriminants(allow(missing_docs))]
pub enum Message {
    /// Ask for the last epoch known to the receiver.
    RequestLastEpoch,
    /// Reply to [`Message::RequestLastEpoch`].
    LastEpochIs {
        /// The receiver's last known epoch.
        epoch: Epoch,
    },
    /// Claim `epoch` for a batch of transactions.
    PublishEpoch {
        /// Candidate epoch.
        epoch: Epoch,
        /// Transactions published in the batch.
        tids: BTreeSet<TxnId>,
    },
    /// The epoch was claimed by another batch.
    CouldNotPublishEpoch {
        /// Last epoch known to the responsible node.
        actual_last: Epoch,
    },
    /// Gossip of a newly claimed epoch. Fire and forget.
    NoteEpoch {
        /// The claimed epoch.
        epoch: Epoch,
    },
    /// Read the batch published at an epoch.
    RequestEpochContents {
        /// The epoch to read.
        epoch: Epoch,
    },
    /// Reply to [`Message::RequestEpochContents`].
    EpochContentsIs {
        /// Transactions published in the batch.
        tids: BTreeSet<TxnId>,
    },
    /// Read one stored reconciliation record.
    RequestReconciliationRecord {
        /// Peer owning the ledger.
        peer: PeerId,
        /// Recno to read.
        recno: Recno,
    },
    /// Reply to [`Message::RequestReconciliationRecord`] with the stored encoding.
    ReconciliationRecordIs {
        /// Encoded record, see [`crate::ledger::record`].
        bytes: Bytes,
    },
    /// Record the outcome of one reconciliation.
    RecordReconciliation {
        /// Peer that reconciled.
        peer: PeerId,
        /// Its reconciliation number.
        recno: Recno,
        /// Highest epoch considered.
        epoch: Epoch,
        /// Accepted transactions.
        accepted: BTreeSet<TxnId>,
        /// Rejected transactions.
        rejected: BTreeSet<TxnId>,
    },
    /// Ask for the most recent recorded recno of a peer.
    RequestMostRecentRecno {
        /// Peer owning the ledger.
        peer: PeerId,
    },
    /// Reply to [`Message::RequestMostRecentRecno`].
    MostRecentRecnoIs {
        /// `None` if the peer never reconciled.
        recno: Option<Recno>,
    },
    /// Store a transaction at the node responsible for its id.
    PublishTxn {
        /// The transaction.
        txn: Transaction,
    },
    /// Fetch a transaction for the reconciliation of `requesting_peer`.
    RequestTxnForReconciliation {
        /// Transaction to fetch.
        tid: TxnId,
        /// Peer performing the reconciliation.
        requesting_peer: PeerId,
        /// Most recent recno of `requesting_peer`, if any.
        as_of_recno: Option<Recno>,
        /// Transactions the requester already accepted.
        known_accepted: BTreeSet<TxnId>,
    },
    /// The requested transaction.
    RetrievedTxn {
        /// Its content.
        txn: Transaction,
        /// Priority if the responder evaluated one.
        priority: Option<i32>,
        /// Antecedents the requester still has to resolve.
        more_antecedents_needed: BTreeSet<TxnId>,
    },
    /// The requester already accepted the transaction.
    TxnNotNeeded,
    /// The requester already rejected the transaction.
    TxnAlreadyRejected,
    /// An antecedent of the requested transaction was rejected by the requester.
    AntecedentTxnRejected {
        /// The rejected antecedent.
        antecedent: TxnId,
    },
    /// The transaction is not available yet; check again later.
    CheckForTxn {
        /// The requested transaction.
        tid: TxnId,
    },
    /// Generic success.
    ReplySuccess,
    /// Generic failure.
    ReplyFailure {
        /// What went wrong.
        reason: FailureReason,
    },
    /// The request could not be understood.
    ReplyException {
        /// Description of the problem.
        message: String,
    },
}

impl Message {
    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self)
    }

    /// Whether this message only makes sense as an answer to a request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::LastEpochIs
                | MessageKind::CouldNotPublishEpoch
                | MessageKind::EpochContentsIs
                | MessageKind::ReconciliationRecordIs
                | MessageKind::MostRecentRecnoIs
                | MessageKind::RetrievedTxn
                | MessageKind::TxnNotNeeded
                | MessageKind::TxnAlreadyRejected
                | MessageKind::AntecedentTxnRejected
                | MessageKind::CheckForTxn
                | MessageKind::ReplySuccess
                | MessageKind::ReplyFailure
                | MessageKind::ReplyException
        )
    }

    /// Whether this is a [`Message::ReplyFailure`] worth retrying.
    pub fn is_transient_failure(&self) -> bool {
        matches!(self, Message::ReplyFailure { reason } if reason.is_transient())
    }

    /// Shorthand for a [`Message::ReplyFailure`].
    pub fn failure(reason: FailureReason) -> Self {
        Message::ReplyFailure { reason }
    }
}

/// Raised when a reply does not match any reply type the caller declared.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unexpected reply {got} to {request}")]
pub struct UnexpectedReply {
    /// Kind of the request.
    pub request: MessageKind,
    /// Kind of the reply.
    pub got: MessageKind,
}

impl UnexpectedReply {
    /// Create an error for `got` answering `request`.
    pub fn new(request: MessageKind, got: &Message) -> Self {
        Self {
            request,
            got: got.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kinds() {
        assert_eq!(Message::RequestLastEpoch.kind(), MessageKind::RequestLastEpoch);
        assert!(!Message::RequestLastEpoch.is_reply());
        assert!(Message::failure(FailureReason::NotFound).is_reply());
        assert_eq!(MessageKind::ReplySuccess.to_string(), "ReplySuccess");
        assert!(Message::failure(FailureReason::Deadlock).is_transient_failure());
        assert!(Message::failure(FailureReason::Storage("io".into())).is_transient_failure());
        assert!(!Message::failure(FailureReason::NotFound).is_transient_failure());
        assert!(!Message::failure(FailureReason::OutOfOrder { expected: 2 }).is_transient_failure());
        assert!(!Message::ReplySuccess.is_transient_failure());
    }

    #[test]
    fn envelope_postcard_roundtrip() {
        let envelope = Envelope {
            id: MessageId {
                from: NodeId(1),
                seq: 7,
            },
            from: NodeId(1),
            to: NodeId(2),
            reply_to: None,
            message: Message::PublishEpoch {
                epoch: Epoch(3),
                tids: [TxnId::new(1, 0), TxnId::new("b", 4)].into(),
            },
        };
        let bytes = postcard::to_stdvec(&envelope).unwrap();
        let decoded: Envelope = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }
}
