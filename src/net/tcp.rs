//! TCP transport.
//!
//! Each outbound peer gets one connection task fed by a bounded queue. A failed connection
//! drops its queue; the next send to that peer dials again.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error_span, trace, warn, Instrument};

use super::{codec::EnvelopeCodec, Inbox, Transport};
use crate::{keys::NodeId, proto::Envelope};

/// Channel capacity for the per connection send queue.
const SEND_QUEUE_CAP: usize = 256;

/// Sends envelopes over TCP to statically known addresses.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addrs: Arc<BTreeMap<NodeId, SocketAddr>>,
    conns: Arc<Mutex<BTreeMap<NodeId, mpsc::Sender<Envelope>>>>,
}

impl TcpTransport {
    /// Create a transport for the given address book.
    pub fn new(addrs: BTreeMap<NodeId, SocketAddr>) -> Self {
        Self {
            addrs: Arc::new(addrs),
            conns: Default::default(),
        }
    }

    fn connection(&self, node: NodeId) -> anyhow::Result<mpsc::Sender<Envelope>> {
        let mut conns = self.conns.lock();
        if let Some(tx) = conns.get(&node) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let addr = *self
            .addrs
            .get(&node)
            .with_context(|| format!("no address for {node}"))?;
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAP);
        tokio::spawn(
            async move {
                if let Err(err) = run_connection(addr, rx).await {
                    debug!("connection closed: {err:#}");
                }
            }
            .instrument(error_span!("conn", %node, %addr)),
        );
        conns.insert(node, tx.clone());
        Ok(tx)
    }
}

async fn run_connection(
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Envelope>,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut writer = FramedWrite::new(stream, EnvelopeCodec);
    while let Some(envelope) = rx.recv().await {
        trace!(id = %envelope.id, "send");
        writer.send(envelope).await?;
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let to = envelope.to;
        match self.connection(to)?.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%to, "send queue full, message dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.conns.lock().remove(&to);
                debug!(%to, "connection closed, message dropped");
                Ok(())
            }
        }
    }
}

/// Accept connections on `listener` and push every received envelope into `inbox`.
pub async fn serve(listener: TcpListener, inbox: Inbox) -> anyhow::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let inbox = inbox.clone();
        tokio::spawn(
            async move {
                let mut reader = FramedRead::new(stream, EnvelopeCodec);
                while let Some(envelope) = reader.next().await {
                    match envelope {
                        Ok(envelope) => {
                            if inbox.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!("invalid frame: {err:#}");
                            break;
                        }
                    }
                }
            }
            .instrument(error_span!("accept", %remote)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Message, MessageId};

    #[tokio::test]
    async fn delivers_over_loopback() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (inbox, rx) = async_channel::unbounded();
        let server = tokio::spawn(serve(listener, inbox));

        let transport = TcpTransport::new(BTreeMap::from([(NodeId(2), addr)]));
        let envelope = Envelope {
            id: MessageId {
                from: NodeId(1),
                seq: 1,
            },
            from: NodeId(1),
            to: NodeId(2),
            reply_to: None,
            message: Message::RequestLastEpoch,
        };
        transport.send(envelope.clone())?;
        assert_eq!(rx.recv().await?, envelope);
        server.abort();
        Ok(())
    }
}
