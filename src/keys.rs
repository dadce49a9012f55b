//! Identifiers used throughout the reconciliation store.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Wire tag for [`PeerId::Int`].
const PEER_TAG_INT: u8 = 0;
/// Wire tag for [`PeerId::Str`].
const PEER_TAG_STR: u8 = 1;

/// Longest [`PeerId::Str`] name, in bytes, that has a byte form.
pub const MAX_PEER_NAME_LEN: usize = u16::MAX as usize;

/// Marks a [`PeerId::Str`] in the text form when the name alone would read as something else.
const STR_PREFIX: &str = "str:";

/// Identifier of a participating peer.
///
/// The byte form starts with a type tag so peers of different kinds can share a keyspace
/// without ambiguity. Names longer than [`MAX_PEER_NAME_LEN`] bytes have no byte form.
///
/// In text, integers are [`PeerId::Int`] and anything else is a [`PeerId::Str`]. A `str:`
/// prefix forces a name, so `str:42` is the named peer "42".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerId {
    /// Numeric peer id.
    Int(i32),
    /// Named peer id.
    Str(String),
}

impl PeerId {
    /// Encode as `tag || payload`.
    ///
    /// `Int` payloads are 4 big-endian bytes, `Str` payloads are a big-endian `u16` length
    /// followed by the UTF-8 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let mut out = Vec::with_capacity(8);
        self.write_bytes(&mut out)?;
        Ok(out)
    }

    fn write_bytes(&self, out: &mut Vec<u8>) -> Result<(), KeyError> {
        match self {
            PeerId::Int(id) => {
                out.push(PEER_TAG_INT);
                out.extend_from_slice(&id.to_be_bytes());
            }
            PeerId::Str(name) => {
                let len =
                    u16::try_from(name.len()).map_err(|_| KeyError::NameTooLong(name.len()))?;
                out.push(PEER_TAG_STR);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(name.as_bytes());
            }
        }
        Ok(())
    }

    /// Decode a peer id from the front of `bytes`, returning it and the number of bytes used.
    pub fn read_bytes(bytes: &[u8]) -> Result<(Self, usize), KeyError> {
        let (&tag, rest) = bytes.split_first().ok_or(KeyError::Truncated)?;
        match tag {
            PEER_TAG_INT => {
                let raw: [u8; 4] = rest
                    .get(..4)
                    .ok_or(KeyError::Truncated)?
                    .try_into()
                    .map_err(|_| KeyError::Truncated)?;
                Ok((PeerId::Int(i32::from_be_bytes(raw)), 5))
            }
            PEER_TAG_STR => {
                let len: [u8; 2] = rest
                    .get(..2)
                    .ok_or(KeyError::Truncated)?
                    .try_into()
                    .map_err(|_| KeyError::Truncated)?;
                let len = u16::from_be_bytes(len) as usize;
                let name = rest.get(2..2 + len).ok_or(KeyError::Truncated)?;
                let name = std::str::from_utf8(name).map_err(|_| KeyError::InvalidUtf8)?;
                Ok((PeerId::Str(name.to_string()), 3 + len))
            }
            other => Err(KeyError::UnknownTag(other)),
        }
    }

    /// Decode a peer id that spans exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let (peer, used) = Self::read_bytes(bytes)?;
        if used != bytes.len() {
            return Err(KeyError::TrailingBytes);
        }
        Ok(peer)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Int(id) => write!(f, "{id}"),
            PeerId::Str(name) if name.parse::<i32>().is_ok() || name.starts_with(STR_PREFIX) => {
                write!(f, "{STR_PREFIX}{name}")
            }
            PeerId::Str(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    /// Integers parse as [`PeerId::Int`], anything else as [`PeerId::Str`]. A `str:`
    /// prefix is stripped and always yields a [`PeerId::Str`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(STR_PREFIX) {
            return Ok(PeerId::Str(name.to_string()));
        }
        Ok(match s.parse::<i32>() {
            Ok(id) => PeerId::Int(id),
            Err(_) => PeerId::Str(s.to_string()),
        })
    }
}

impl From<i32> for PeerId {
    fn from(value: i32) -> Self {
        PeerId::Int(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::Str(value.to_string())
    }
}

/// Transaction identifier: the publishing peer and its local sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId {
    /// Peer that committed the transaction.
    pub peer: PeerId,
    /// Sequence number local to `peer`.
    pub seq: u32,
}

impl TxnId {
    /// Create a new [`TxnId`].
    pub fn new(peer: impl Into<PeerId>, seq: u32) -> Self {
        Self {
            peer: peer.into(),
            seq,
        }
    }

    /// Compact byte form, usable as a storage key: the peer bytes followed by the
    /// big-endian sequence number.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let mut out = Vec::with_capacity(12);
        self.peer.write_bytes(&mut out)?;
        out.extend_from_slice(&self.seq.to_be_bytes());
        Ok(out)
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let (peer, used) = PeerId::read_bytes(bytes)?;
        let seq: [u8; 4] = bytes
            .get(used..used + 4)
            .ok_or(KeyError::Truncated)?
            .try_into()
            .map_err(|_| KeyError::Truncated)?;
        if bytes.len() != used + 4 {
            return Err(KeyError::TrailingBytes);
        }
        Ok(Self {
            peer,
            seq: u32::from_be_bytes(seq),
        })
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.seq)
    }
}

/// Address of a node in the messaging substrate.
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
    derive_more::From,
)]
#[display("node-{_0}")]
pub struct NodeId(pub u64);

/// One published batch of transactions.
///
/// Epoch `0` is the implicit empty genesis batch, the first published batch claims epoch `1`.
#[derive(
    Debug,
    Default,
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
    derive_more::From,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The genesis epoch, never claimed by a publisher.
    pub const ZERO: Self = Self(0);

    /// The epoch after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Per-peer reconciliation number.
pub type Recno = u64;

/// Errors decoding identifiers from bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Input ended early.
    #[error("truncated identifier")]
    Truncated,
    /// The peer type tag is not known.
    #[error("unknown peer id tag {0}")]
    UnknownTag(u8),
    /// A string peer id is not UTF-8.
    #[error("peer id is not valid utf-8")]
    InvalidUtf8,
    /// Input continued past the identifier.
    #[error("trailing bytes after identifier")]
    TrailingBytes,
    /// A peer name is longer than [`MAX_PEER_NAME_LEN`] bytes.
    #[error("peer name of {0} bytes is too long")]
    NameTooLong(usize),
}

/// Storage key layout.
///
/// Every key starts with a one byte table prefix so tables can share a flat keyspace.
pub(crate) mod storage_key {
    use super::{Epoch, KeyError, PeerId, Recno, TxnId};

    const EPOCH: u8 = b'e';
    const RECON: u8 = b'r';
    const PEER: u8 = b'p';
    const TXN: u8 = b't';

    /// `e || epoch(be u64)`: the batch published at an epoch.
    pub fn epoch(epoch: Epoch) -> Vec<u8> {
        let mut key = vec![EPOCH];
        key.extend_from_slice(&epoch.0.to_be_bytes());
        key
    }

    /// `r || peer || recno(be u64)`: one stored reconciliation record.
    pub fn recon(peer: &PeerId, recno: Recno) -> Result<Vec<u8>, KeyError> {
        let mut key = vec![RECON];
        key.extend_from_slice(&peer.to_bytes()?);
        key.extend_from_slice(&recno.to_be_bytes());
        Ok(key)
    }

    /// `p || peer`: the per peer summary record.
    pub fn peer(peer: &PeerId) -> Result<Vec<u8>, KeyError> {
        let mut key = vec![PEER];
        key.extend_from_slice(&peer.to_bytes()?);
        Ok(key)
    }

    /// `t || tid`: a published transaction.
    pub fn txn(tid: &TxnId) -> Result<Vec<u8>, KeyError> {
        let mut key = vec![TXN];
        key.extend_from_slice(&tid.to_bytes()?);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_wire_form_is_tagged() {
        assert_eq!(PeerId::Int(7).to_bytes(), Ok(vec![0, 0, 0, 0, 7]));
        assert_eq!(PeerId::from("ab").to_bytes(), Ok(vec![1, 0, 2, b'a', b'b']));
        assert_eq!(
            PeerId::from_bytes(&[9, 1, 2]),
            Err(KeyError::UnknownTag(9))
        );
    }

    #[test]
    fn txn_id_bytes_roundtrip() {
        for tid in [TxnId::new(-3, 0), TxnId::new("peer-a", u32::MAX)] {
            let bytes = tid.to_bytes().unwrap();
            assert_eq!(TxnId::from_bytes(&bytes).unwrap(), tid);
        }
        let mut bytes = TxnId::new(1, 1).to_bytes().unwrap();
        bytes.push(0);
        assert_eq!(TxnId::from_bytes(&bytes), Err(KeyError::TrailingBytes));
    }

    #[test]
    fn peer_names_longer_than_the_length_prefix_are_refused() {
        let longest = PeerId::Str("x".repeat(MAX_PEER_NAME_LEN));
        let bytes = longest.to_bytes().unwrap();
        assert_eq!(bytes.len(), 3 + MAX_PEER_NAME_LEN);
        assert_eq!(PeerId::from_bytes(&bytes).unwrap(), longest);

        let too_long = PeerId::Str("x".repeat(MAX_PEER_NAME_LEN + 1));
        assert_eq!(
            too_long.to_bytes(),
            Err(KeyError::NameTooLong(MAX_PEER_NAME_LEN + 1))
        );
        assert!(TxnId::new(too_long.clone(), 0).to_bytes().is_err());
        assert!(storage_key::peer(&too_long).is_err());
        assert!(storage_key::recon(&too_long, 3).is_err());
    }

    #[test]
    fn peer_id_from_str() {
        assert_eq!("42".parse::<PeerId>().unwrap(), PeerId::Int(42));
        assert_eq!("hub".parse::<PeerId>().unwrap(), PeerId::from("hub"));
        assert_eq!("str:42".parse::<PeerId>().unwrap(), PeerId::from("42"));
        assert_eq!("str:str:x".parse::<PeerId>().unwrap(), PeerId::from("str:x"));
    }

    #[test]
    fn peer_id_text_form_roundtrips() {
        for peer in [
            PeerId::Int(-7),
            PeerId::from("hub"),
            PeerId::from("42"),
            PeerId::from("str:x"),
        ] {
            assert_eq!(peer.to_string().parse::<PeerId>().unwrap(), peer);
        }
        assert_eq!(PeerId::from("42").to_string(), "str:42");
        assert_eq!(PeerId::from("hub").to_string(), "hub");
    }

    #[test]
    fn epoch_keys_sort_numerically() {
        assert!(storage_key::epoch(Epoch(2)) < storage_key::epoch(Epoch(256)));
    }
}
