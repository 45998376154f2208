//! Lineage integrity: self-hash coverage, contiguity, tamper detection and
//! tier fallback during verification.

use std::collections::BTreeMap;

use proptest::prelude::*;
use revenant_core::{
    AgentId, Checkpoint, CheckpointManifest, Clock, ContentAddress, ContentHash, ErrorKind,
    LineageError, PayloadRef, SegmentName, StorageTier, SystemClock,
};
use revenant_engine::{PlacementHints, TrustAnchor};
use revenant_registry::CoordinationRegistry;
use revenant_test_utils::{assertions, fixtures, generators, TestCluster};
use serde_json::json;

// ============================================================================
// HELPERS
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn manifest_with(agent_id: AgentId, sequence: u64, parent: ContentHash) -> CheckpointManifest {
    let mut refs = BTreeMap::new();
    refs.insert(
        SegmentName::tasks_queued(),
        PayloadRef::Inline {
            bytes: serde_json::to_vec(&json!([{ "id": "t-1" }])).expect("encode"),
        },
    );
    CheckpointManifest::new(agent_id, sequence, parent, refs, SystemClock.now())
}

/// Rewrite the stored manifest at `address` with one field changed.
async fn corrupt_manifest(cluster: &TestCluster, address: ContentAddress) {
    let fetched = cluster.store().fetch(&address).await.expect("fetch manifest");
    let mut manifest = CheckpointManifest::decode(&fetched.bytes).expect("decode");
    manifest.timestamp_micros += 1;
    cluster.tamper_everywhere(&address, manifest.canonical_bytes().expect("encode"));
}

// ============================================================================
// SELF-HASH COVERAGE
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Changing any hashed field after sealing breaks integrity.
    #[test]
    fn prop_any_field_change_breaks_self_hash(
        agent_id in generators::arb_agent_id(),
        other_agent in generators::arb_agent_id(),
        sequence in 1u64..1_000,
        parent in generators::arb_content_hash(),
        other_parent in generators::arb_content_hash(),
        field in 0usize..5,
        delta in 1i64..1_000,
    ) {
        prop_assume!(agent_id != other_agent && parent != other_parent);

        let (checkpoint, _) = Checkpoint::seal(
            manifest_with(agent_id, sequence, parent),
            StorageTier::Hot,
        ).expect("seal");
        prop_assert!(checkpoint.verify_integrity().is_ok());

        let mut tampered = checkpoint.clone();
        match field {
            0 => tampered.manifest.agent_id = other_agent,
            1 => tampered.manifest.sequence += delta as u64,
            2 => tampered.manifest.parent_hash = other_parent,
            3 => {
                tampered.manifest.payload_refs.insert(
                    SegmentName::memory_short_term(),
                    PayloadRef::Inline { bytes: b"[]".to_vec() },
                );
            }
            _ => tampered.manifest.timestamp_micros += delta,
        }

        match tampered.verify_integrity() {
            Err(LineageError::HashMismatch { expected, .. }) => {
                prop_assert_eq!(expected, checkpoint.self_hash);
            }
            other => prop_assert!(false, "expected HashMismatch, got {:?}", other),
        }
    }

    /// A verified lineage has contiguous sequences from genesis.
    #[test]
    fn prop_verified_lineage_is_contiguous(steps in 1usize..8) {
        let rt = runtime();
        rt.block_on(async {
            let cluster = TestCluster::new();
            let node = cluster.node();
            let identity = fixtures::identity("contiguous");
            let base = fixtures::sample_state(identity.address(), &["a"]);
            let mut session = node.register(&identity, base.clone()).await.expect("register");
            for n in 1..=steps {
                node.checkpoint(&mut session, &fixtures::step_state(&base, n))
                    .await
                    .expect("checkpoint");
            }

            let head = session.head().pointer();
            let verified = cluster
                .node()
                .verifier()
                .verify(identity.address(), head, TrustAnchor::Genesis)
                .await
                .expect("verify");
            assert_eq!(verified.depth, steps as u64);
            assert_eq!(verified.anchor_reached.sequence, 0);

            let mut sequences = Vec::new();
            let mut pointer = Some(head);
            while let Some(p) = pointer {
                let checkpoint = node.load_checkpoint(p).await.expect("load");
                sequences.push(checkpoint.sequence());
                pointer = (!checkpoint.is_genesis()).then(|| revenant_core::HeadPointer {
                    sequence: checkpoint.sequence() - 1,
                    self_hash: checkpoint.parent_hash(),
                });
            }
            let expected: Vec<u64> = (0..=steps as u64).rev().collect();
            assert_eq!(sequences, expected);
        });
    }

    /// Whatever tier holds the segments, resurrection restores the state.
    #[test]
    fn prop_state_survives_any_placement(
        (identity, state) in generators::arb_agent_identity().prop_flat_map(|identity| {
            let agent_id = identity.address().clone();
            (Just(identity), generators::arb_agent_state(agent_id))
        }),
        tier in generators::arb_tier(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let cluster = TestCluster::new();
            let node = cluster.node();
            let genesis = fixtures::sample_state(identity.address(), &[]);
            let mut session = node.register(&identity, genesis).await.expect("register");
            node.checkpoint_with_hints(&mut session, &state, Some(&PlacementHints::preferring(tier)))
                .await
                .expect("checkpoint");
            node.release(session).await.expect("release");

            let resurrected = cluster
                .node()
                .resurrect(identity.address())
                .await
                .expect("resurrect");
            assert_eq!(resurrected.state(), &state);
            assert_eq!(resurrected.resurrection().expect("report").depth, 1);
        });
    }
}

// ============================================================================
// TAMPER DETECTION
// ============================================================================

#[tokio::test]
async fn test_genesis_then_child_verifies_at_depth_one() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("depth-one");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    let genesis = session.head().pointer();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();

    let child = node.load_checkpoint(session.head().pointer()).await.unwrap();
    assert_eq!(child.sequence(), 1);
    assert_eq!(child.parent_hash(), genesis.self_hash);

    let verified = cluster
        .node()
        .verifier()
        .verify(identity.address(), session.head().pointer(), TrustAnchor::Genesis)
        .await
        .unwrap();
    assert_eq!(verified.depth, 1);
    assert_eq!(verified.anchor_reached, genesis);
}

#[tokio::test]
async fn test_corrupted_child_manifest_fails_with_hash_mismatch() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("corrupt-manifest");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();
    let head = session.head().pointer();
    node.release(session).await.unwrap();

    corrupt_manifest(&cluster, ContentAddress::from(head.self_hash)).await;

    let fresh = cluster.node();
    let err = fresh
        .verifier()
        .verify(identity.address(), head, TrustAnchor::Genesis)
        .await
        .unwrap_err();
    match err {
        revenant_core::EngineError::Lineage(LineageError::HashMismatch { sequence, expected, .. }) => {
            assert_eq!(sequence, Some(1));
            assert_eq!(expected, head.self_hash);
        }
        other => panic!("expected HashMismatch, got {:?}", other),
    }

    // Resurrection surfaces the same failure and leaves the lineage alone
    let result = fresh.resurrect(identity.address()).await;
    assertions::assert_verification_failed(&result, ErrorKind::HashMismatch);
    let state = fresh.head(identity.address()).await.unwrap();
    assert_eq!(assertions::assert_head_at(&state, 1), head);
    assert!(cluster
        .registry
        .current_lease(identity.address())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_corrupted_ancestor_fails_deep_verification() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("corrupt-ancestor");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    let genesis = session.head().pointer();
    for n in 1..=3 {
        node.checkpoint(&mut session, &fixtures::step_state(&base, n))
            .await
            .unwrap();
    }
    corrupt_manifest(&cluster, ContentAddress::from(genesis.self_hash)).await;

    let err = cluster
        .node()
        .verifier()
        .verify(identity.address(), session.head().pointer(), TrustAnchor::Genesis)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HashMismatch);

    // Bounded verification from the writer's own trusted head never reaches it
    let bounded = node
        .verifier()
        .verify(
            identity.address(),
            session.head().pointer(),
            TrustAnchor::Checkpoint(session.head().pointer()),
        )
        .await
        .unwrap();
    assert_eq!(bounded.depth, 0);
}

#[tokio::test]
async fn test_corrupted_payload_segment_fails_resurrection() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("corrupt-payload");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();
    let head = node.load_checkpoint(session.head().pointer()).await.unwrap();
    node.release(session).await.unwrap();

    let stored = head
        .payload_refs()
        .get(&SegmentName::memory_long_term())
        .and_then(PayloadRef::address)
        .expect("long-term memory is stored out of line");
    let mut bytes = cluster.store().fetch(&stored).await.unwrap().bytes;
    bytes[0] ^= 0xff;
    cluster.tamper_everywhere(&stored, bytes);

    let result = cluster.node().resurrect(identity.address()).await;
    let source = assertions::assert_verification_failed(&result, ErrorKind::HashMismatch);
    assert!(matches!(
        source,
        LineageError::HashMismatch { sequence: Some(1), .. }
    ));
}

#[tokio::test]
async fn test_lost_parent_is_chain_broken() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("lost-parent");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    let genesis = session.head().pointer();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();
    cluster.lose_everywhere(&ContentAddress::from(genesis.self_hash));

    let err = cluster
        .node()
        .verifier()
        .verify(identity.address(), session.head().pointer(), TrustAnchor::Genesis)
        .await
        .unwrap_err();
    match err {
        revenant_core::EngineError::Lineage(LineageError::ChainBroken {
            after_sequence,
            missing,
        }) => {
            assert_eq!(after_sequence, 1);
            assert_eq!(missing, genesis.self_hash);
        }
        other => panic!("expected ChainBroken, got {:?}", other),
    }
}

// ============================================================================
// TIER FALLBACK
// ============================================================================

#[tokio::test]
async fn test_cold_only_ancestors_are_promoted_during_resurrection() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("cold-only");
    let base = fixtures::sample_state(identity.address(), &["a"]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    let genesis = session.head().pointer();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();
    let seq1 = session.head().pointer();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 2))
        .await
        .unwrap();
    let expected_state = session.state().clone();
    node.release(session).await.unwrap();

    let store = cluster.store();
    for pointer in [genesis, seq1] {
        let address = ContentAddress::from(pointer.self_hash);
        store.demote(&address, StorageTier::Cold).await.unwrap();
        assert!(!cluster.hot.holds(&address));
        assert!(!cluster.warm.holds(&address));
        assert!(cluster.cold.holds(&address));
    }

    let resurrected = cluster.node().resurrect(identity.address()).await.unwrap();
    let report = resurrected.resurrection().expect("report");
    assert_eq!(report.depth, 2);
    assert_eq!(report.promoted, 2);
    assert_eq!(report.anchor_reached, genesis);
    assert_eq!(resurrected.state(), &expected_state);

    for pointer in [genesis, seq1] {
        let address = ContentAddress::from(pointer.self_hash);
        assert!(cluster.hot.holds(&address), "promoted back to hot");
        assert!(cluster.cold.holds(&address), "colder copy kept");
    }
}

#[tokio::test]
async fn test_offline_hot_tier_falls_back_for_reads() {
    let cluster = TestCluster::new();
    let node = cluster.node();
    let identity = fixtures::identity("hot-offline");
    let base = fixtures::sample_state(identity.address(), &[]);
    let mut session = node.register(&identity, base.clone()).await.unwrap();
    let genesis = session.head().pointer();
    node.checkpoint(&mut session, &fixtures::step_state(&base, 1))
        .await
        .unwrap();
    cluster
        .store()
        .demote(&ContentAddress::from(genesis.self_hash), StorageTier::Warm)
        .await
        .unwrap();

    cluster.hot.set_offline(true);
    let err = cluster
        .node()
        .verifier()
        .verify(identity.address(), session.head().pointer(), TrustAnchor::Genesis)
        .await
        .unwrap_err();
    // The head lives only in hot, so its absence elsewhere is not proof of loss
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());

    cluster.hot.set_offline(false);
    let verified = cluster
        .node()
        .verifier()
        .verify(identity.address(), session.head().pointer(), TrustAnchor::Genesis)
        .await
        .unwrap();
    assert_eq!(verified.depth, 1);
}
