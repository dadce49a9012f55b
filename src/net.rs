//! Point to point messaging between nodes.
//!
//! A [`Transport`] only promises best effort, at least once delivery: messages may be lost,
//! duplicated or reordered. Reliability is layered on top by [`crate::rpc`].

use crate::proto::Envelope;

pub mod codec;
pub mod mem;
pub mod tcp;

/// Sends envelopes to other nodes.
pub trait Transport: Send + Sync + std::fmt::Debug + 'static {
    /// Hand `envelope` to the network.
    ///
    /// An `Ok` return does not mean the message was delivered.
    fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        (**self).send(envelope)
    }
}

/// Queue into which a transport delivers inbound envelopes for a node.
pub type Inbox = async_channel::Sender<Envelope>;
