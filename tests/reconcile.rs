use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use recon_store::{
    config::{NodeConfig, RpcConfig},
    directory::StaticDirectory,
    ledger::TxnStatus,
    net::mem::{Faults, MemNetwork},
    store::memory,
    workers::Ingress,
    Epoch, Node, NodeId, PeerId, PeerTrust, Transaction, TxnId, Update,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_logging() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(EnvFilter::from_default_env()),
        )
        .set_default()
}

/// One node per peer, all reachable through `net`.
fn spawn_nodes(
    net: &MemNetwork,
    peers: &[&str],
    trust: impl Fn(&str) -> PeerTrust,
    rpc: RpcConfig,
) -> Vec<Node<memory::Store>> {
    let ids: Vec<NodeId> = (0..peers.len() as u64).map(NodeId).collect();
    let directory = Arc::new(StaticDirectory::new(ids.clone()));
    ids.iter()
        .zip(peers)
        .map(|(id, peer)| {
            let config = NodeConfig {
                node_id: id.0,
                peer: peer.to_string(),
                rpc: rpc.clone(),
                ..Default::default()
            };
            let ingress = Ingress::new();
            let transport = net.register(*id, ingress.inbox());
            Node::builder(config, memory::Store::default())
                .directory(directory.clone())
                .trust(Arc::new(trust(peer)))
                .spawn(Arc::new(transport), ingress)
        })
        .collect()
}

fn put(peer: &str, seq: u32, key: &str) -> Transaction {
    Transaction::new(TxnId::new(peer, seq), vec![Update::put("rows", key.to_string(), "v")])
}

fn tids(ids: &[(&str, u32)]) -> BTreeSet<TxnId> {
    ids.iter().map(|(p, s)| TxnId::new(*p, *s)).collect()
}

#[tokio::test]
async fn accepts_foreign_transactions() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::default();
    let nodes = spawn_nodes(&net, &["a", "b", "c"], |_| PeerTrust::new(1), RpcConfig::default());
    let (a, b) = (&nodes[0], &nodes[1]);

    assert_eq!(a.publish(vec![put("a", 0, "x"), put("a", 1, "y")]).await?, Epoch(1));
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.recno, Some(0));
    assert_eq!(outcome.epoch, Epoch(1));
    assert_eq!(outcome.accepted, tids(&[("a", 0), ("a", 1)]));
    assert!(outcome.rejected.is_empty());

    // nothing new, nothing recorded
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.recno, None);
    assert_eq!(outcome.epoch, Epoch(1));

    let peer = PeerId::from("b");
    assert_eq!(b.ledger().most_recent_recno(&peer).await?, Some(0));
    assert_eq!(
        a.ledger()
            .get_txn_status(&peer, 0, &TxnId::new("a", 1), 0)
            .await?,
        TxnStatus::AcceptedAt(0)
    );

    // own transactions are never candidates
    let outcome = a.reconcile().await?;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.epoch, Epoch(1));
    assert_eq!(outcome.recno, Some(0));
    Ok(())
}

#[tokio::test]
async fn conflicts_follow_priority() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::default();
    let trust = |_: &str| PeerTrust::new(1).with_peer("a", 5).with_peer("c", 3);
    let nodes = spawn_nodes(&net, &["a", "b", "c"], trust, RpcConfig::default());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    c.publish(vec![put("c", 0, "k"), put("c", 1, "other")]).await?;
    a.publish(vec![put("a", 0, "k")]).await?;
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.epoch, Epoch(2));
    assert_eq!(outcome.accepted, tids(&[("a", 0), ("c", 1)]));
    assert_eq!(outcome.rejected, tids(&[("c", 0)]));
    Ok(())
}

#[tokio::test]
async fn untrusted_chains_are_rejected() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::default();
    let trust = |_: &str| PeerTrust::new(1).with_peer("c", 0);
    let nodes = spawn_nodes(&net, &["a", "b", "c"], trust, RpcConfig::default());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    c.publish(vec![put("c", 0, "k")]).await?;
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.rejected, tids(&[("c", 0)]));

    // builds on the rejected transaction
    let dependent = Transaction::new(
        TxnId::new("a", 0),
        vec![Update::put("rows", "k", "w").depends_on(TxnId::new("c", 0))],
    );
    a.publish(vec![dependent]).await?;
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.recno, Some(1));
    assert_eq!(outcome.rejected, tids(&[("a", 0)]));
    assert!(outcome.accepted.is_empty());
    Ok(())
}

#[tokio::test]
async fn unavailable_antecedents_defer() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::default();
    let nodes = spawn_nodes(&net, &["a", "b", "c"], |_| PeerTrust::new(1), RpcConfig::default());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let early = Transaction::new(
        TxnId::new("a", 0),
        vec![Update::put("rows", "k", "w").depends_on(TxnId::new("c", 0))],
    );
    a.publish(vec![early]).await?;
    let outcome = b.reconcile().await?;
    assert_eq!(outcome.deferred, tids(&[("a", 0)]));
    assert_eq!(outcome.epoch, Epoch(0));
    assert_eq!(outcome.recno, None);

    c.publish(vec![put("c", 0, "k")]).await?;
    let outcome = b.reconcile().await?;
    assert!(outcome.deferred.is_empty());
    assert_eq!(outcome.accepted, tids(&[("a", 0), ("c", 0)]));
    assert_eq!(outcome.epoch, Epoch(2));
    assert_eq!(outcome.recno, Some(0));
    Ok(())
}

#[tokio::test]
async fn ledger_history_spans_checkpoints() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::default();
    let nodes = spawn_nodes(&net, &["a", "b"], |_| PeerTrust::new(1), RpcConfig::default());
    let (a, b) = (&nodes[0], &nodes[1]);
    let peer = PeerId::from("b");

    for seq in 0..12u32 {
        a.publish(vec![put("a", seq, &format!("k{seq}"))]).await?;
        let outcome = b.reconcile().await?;
        assert_eq!(outcome.recno, Some(seq as u64));
        assert_eq!(outcome.epoch, Epoch(seq as u64 + 1));
    }
    // a fresh client only sees the stored records
    let ledger = a.ledger();
    assert_eq!(ledger.get_epoch_for_recno(&peer, 3, 11).await?, Epoch(4));
    let all = ledger.get_decisions(&peer, 11, 11, true).await?;
    assert_eq!(all.len(), 12);
    assert!(all.iter().all(|d| d.accepted));
    let single = ledger.get_decisions(&peer, 7, 11, false).await?;
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].tid, TxnId::new("a", 7));
    assert_eq!(
        ledger
            .get_txn_status(&peer, 4, &TxnId::new("a", 9), 11)
            .await?,
        TxnStatus::Undecided
    );
    Ok(())
}

#[tokio::test]
async fn random_workload_under_faults() -> Result<()> {
    let _guard = setup_logging();
    let net = MemNetwork::new(
        Faults {
            drop_rate: 0.02,
            duplicate_rate: 0.2,
            max_delay: Some(Duration::from_millis(2)),
        },
        7,
    );
    let rpc = RpcConfig {
        retry_delay_ms: 5,
        max_retries: 10,
        timeout_ms: 100,
    };
    let peers = ["a", "b", "c"];
    let trust = |_: &str| PeerTrust::new(2).with_peer("c", 1).with_relation("secret", 0);
    let nodes = spawn_nodes(&net, &peers, trust, rpc);

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
    let mut published: BTreeMap<TxnId, Transaction> = BTreeMap::new();
    let mut seqs = [0u32; 3];
    for _ in 0..8 {
        let who = rng.gen_range(0..peers.len());
        let mut batch = Vec::new();
        for _ in 0..rng.gen_range(1..3) {
            let tid = TxnId::new(peers[who], seqs[who]);
            seqs[who] += 1;
            let relation = if rng.gen_bool(0.1) { "secret" } else { "rows" };
            let mut update = Update::put(relation, format!("k{}", rng.gen_range(0..4)), "v");
            let earlier: Vec<&TxnId> = published.keys().collect();
            if let Some(dep) = earlier.choose(&mut rng) {
                if rng.gen_bool(0.5) {
                    update = update.depends_on((*dep).clone());
                }
            }
            batch.push(Transaction::new(tid, vec![update]));
        }
        nodes[who].publish(batch.clone()).await?;
        published.extend(batch.into_iter().map(|t| (t.id().clone(), t)));
        let reconciler = rng.gen_range(0..peers.len());
        nodes[reconciler].reconcile().await?;
    }

    for node in &nodes {
        node.reconcile().await?;
        let peer = node.peer().clone();
        let recno = node
            .ledger()
            .most_recent_recno(&peer)
            .await?
            .expect("reconciled");
        let mut accepted = BTreeSet::new();
        let mut rejected = BTreeSet::new();
        for decision in node.ledger().get_decisions(&peer, recno, recno, true).await? {
            let fresh = if decision.accepted {
                accepted.insert(decision.tid)
            } else {
                rejected.insert(decision.tid)
            };
            assert!(fresh, "decided twice");
        }
        assert!(accepted.is_disjoint(&rejected));
        for (tid, txn) in &published {
            if tid.peer == peer {
                assert!(!accepted.contains(tid) && !rejected.contains(tid));
                continue;
            }
            assert!(accepted.contains(tid) || rejected.contains(tid), "{tid} undecided");
            if accepted.contains(tid) {
                for antecedent in txn.antecedents() {
                    assert!(
                        antecedent.peer == peer || accepted.contains(&antecedent),
                        "{tid} accepted without {antecedent}"
                    );
                }
                assert!(txn.updates().iter().all(|u| u.relation != "secret"));
            }
        }
    }
    Ok(())
}
