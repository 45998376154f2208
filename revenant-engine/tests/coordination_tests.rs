//! Sequence allocation between competing writers.

use std::sync::Arc;

use proptest::prelude::*;
use revenant_core::ErrorKind;
use revenant_registry::CoordinationRegistry;
use revenant_test_utils::{assertions, fixtures, AgentSession, ResurrectionEngine, TestCluster};

async fn lineage_to(
    node: &ResurrectionEngine,
    seed: &str,
    head_sequence: usize,
) -> (AgentSession, revenant_core::AgentState) {
    let identity = fixtures::identity(seed);
    let base = fixtures::sample_state(identity.address(), &["a"]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    for n in 1..=head_sequence {
        node.checkpoint(&mut session, &fixtures::step_state(&base, n))
            .await
            .unwrap();
    }
    (session, base)
}

#[tokio::test]
async fn test_two_nodes_claiming_sequence_five_get_one_grant() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let (session, _) = lineage_to(&node, "seq-five", 4).await;
    let agent = session.agent_id().clone();
    let h4 = session.head().pointer();
    assert_eq!(h4.sequence, 4);

    let node_a = cluster.registry.clone();
    let node_b = cluster.registry.clone();
    let (a, b) = tokio::join!(
        node_a.claim_next_sequence(&agent, Some(h4)),
        node_b.claim_next_sequence(&agent, Some(h4)),
    );

    let (granted, rejected) = match (a, b) {
        (Ok(claim), Err(e)) | (Err(e), Ok(claim)) => (claim, e),
        other => panic!("expected exactly one grant, got {:?}", other),
    };
    assert_eq!(granted.sequence, 5);
    assert_eq!(granted.parent, Some(h4));
    assert_eq!(rejected.kind(), ErrorKind::SequenceConflict);
}

#[tokio::test]
async fn test_losing_writer_rebases_and_retries() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let (session, base) = lineage_to(&node, "rebase", 4).await;
    let mut first = session.clone();
    let mut second = session;

    let first_state = fixtures::step_state(&base, 10);
    let second_state = fixtures::step_state(&base, 20);
    let (a, b) = tokio::join!(
        node.checkpoint(&mut first, &first_state),
        node.checkpoint(&mut second, &second_state),
    );

    let (winner, mut loser, loser_state, err) = match (a, b) {
        (Ok(head), Err(e)) => (head, second, second_state, e),
        (Err(e), Ok(head)) => (head, first, first_state, e),
        other => panic!("expected exactly one publish, got {:?}", other),
    };
    assert_eq!(winner.sequence, 5);
    assert_eq!(err.kind(), ErrorKind::SequenceConflict);
    assert!(err.is_retryable());

    let rebased = node.rebase(&mut loser).await.unwrap();
    assert_eq!(rebased, winner.pointer());
    assert_eq!(loser.head().pointer(), winner.pointer());

    let retried = node.checkpoint(&mut loser, &loser_state).await.unwrap();
    assert_eq!(retried.sequence, 6);
    let published = node.load_checkpoint(retried.pointer()).await.unwrap();
    assert_eq!(published.parent_hash(), winner.self_hash);
}

#[tokio::test]
async fn test_hot_outage_surfaces_store_unavailable_and_frees_the_claim() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let (mut session, base) = lineage_to(&node, "outage", 1).await;
    let before = session.head().pointer();

    cluster.hot.set_offline(true);
    let result = node
        .checkpoint(&mut session, &fixtures::step_state(&base, 2))
        .await;
    assertions::assert_kind(&result, ErrorKind::StoreUnavailable);
    assert!(result.unwrap_err().is_retryable());
    assert!(cluster
        .registry
        .outstanding_claim(session.agent_id())
        .unwrap()
        .is_none());
    assert_eq!(session.head().pointer(), before);

    cluster.hot.set_offline(false);
    let head = node
        .checkpoint(&mut session, &fixtures::step_state(&base, 2))
        .await
        .unwrap();
    assert_eq!(head.sequence, 2);
}

#[tokio::test]
async fn test_rebase_with_lost_lease_is_refused() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let (mut session, _) = lineage_to(&node, "rebase-lost", 1).await;
    cluster.advance(cluster.config.lease_ttl + std::time::Duration::from_secs(1));

    let result = node.rebase(&mut session).await;
    assertions::assert_kind(&result, ErrorKind::LeaseLost);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(25))]

    /// Concurrent claimers on the same head never share a sequence.
    #[test]
    fn prop_concurrent_claims_grant_each_sequence_once(claimers in 2usize..8) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("runtime");
        let (granted, conflicts) = rt.block_on(async {
            let cluster = TestCluster::new();
            let node = cluster.node();
            let (session, _) = lineage_to(&node, "claim-race", 2).await;
            let agent = session.agent_id().clone();
            let head = session.head().pointer();
            let registry = Arc::new(cluster.registry.clone());

            let mut handles = Vec::new();
            for _ in 0..claimers {
                let registry = Arc::clone(&registry);
                let agent = agent.clone();
                handles.push(tokio::spawn(async move {
                    registry.claim_next_sequence(&agent, Some(head)).await
                }));
            }

            let mut granted = Vec::new();
            let mut conflicts = 0;
            for handle in handles {
                match handle.await.expect("join") {
                    Ok(claim) => granted.push(claim.sequence),
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::SequenceConflict);
                        conflicts += 1;
                    }
                }
            }
            (granted, conflicts)
        });

        prop_assert_eq!(granted, vec![3]);
        prop_assert_eq!(conflicts, claimers - 1);
    }
}
