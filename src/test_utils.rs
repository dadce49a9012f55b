//! Helpers shared by the unit tests.

use std::sync::Arc;

use crate::{
    keys::NodeId,
    net::mem::MemNetwork,
    proto::{Envelope, Message},
    rpc::Rpc,
};

pub(crate) mod logging {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    /// Configures logging for the current test, single threaded runtimes only.
    ///
    /// Output is captured by the test harness and shown for failing tests. Defaults to
    /// `trace` unless `RUST_LOG` is set.
    #[must_use = "The tracing guard must only be dropped at the end of the test"]
    pub(crate) fn setup() -> tracing::subscriber::DefaultGuard {
        let filter = match std::env::var_os("RUST_LOG") {
            Some(_) => EnvFilter::from_default_env(),
            None => EnvFilter::new("trace"),
        };
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_line_number(true)
                    .with_test_writer()
                    .with_filter(filter),
            )
            .set_default()
    }
}

/// Attach a node to `net` that answers every request with `handler`.
///
/// Replies to the node's own requests are routed through its [`Rpc`]. Returning `None`
/// leaves the request unanswered.
pub(crate) fn spawn_service<F>(net: &MemNetwork, node: NodeId, handler: F) -> Rpc
where
    F: Fn(&Envelope) -> Option<Message> + Send + 'static,
{
    let (tx, rx) = async_channel::unbounded::<Envelope>();
    let rpc = Rpc::new(node, Arc::new(net.register(node, tx)), Default::default());
    let server = rpc.clone();
    tokio::spawn(async move {
        while let Ok(envelope) = rx.recv().await {
            if server.handle_reply(envelope.clone()) {
                continue;
            }
            if let Some(answer) = handler(&envelope) {
                server.reply(&envelope, answer);
            }
        }
    });
    rpc
}
