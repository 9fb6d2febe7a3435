//! Multi-adjudicator round tests over the in-process transport.
//!
//! Every test builds its own network and nodes, wires them into a full mesh,
//! lets heartbeats populate the peer tables, and then drives real rounds.
//! Some members are scripted services instead of nodes, to hold back or
//! falsify what an honest node would send. Time is paused, so
//! thirty-second deadlines cost nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use arbiter_protocol::config::CATCH_UP_TIMEOUT;
use arbiter_protocol::consensus::membership::StaticMembership;
use arbiter_protocol::consensus::reporter::{Misbehavior, PeerReporter};
use arbiter_protocol::consensus::state::ConsensusState;
use arbiter_protocol::consensus::{
    elect_producer, RoundAttestation, RoundFailure, RoundKey, RoundKind, RoundOutcome,
    SignedEntry,
};
use arbiter_protocol::crypto::keys::ArbiterKeypair;
use arbiter_protocol::crypto::signatures::{contribution_message, hash_message, Ed25519Verifier};
use arbiter_protocol::crypto::canonical_digest;
use arbiter_protocol::network::{
    AddressedEntry, GossipReply, GossipRequest, MemoryNetwork, PeerClient, RoundService,
    RpcError, StateSummary,
};
use arbiter_protocol::{AdjudicatorNode, NodeConfig};

const FINALIZE: Duration = Duration::from_secs(6);

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Reports(Mutex<Vec<(String, Misbehavior)>>);

impl PeerReporter for Reports {
    fn report(&self, peer: &str, offense: Misbehavior) {
        self.0.lock().push((peer.to_owned(), offense));
    }
}

struct Cluster {
    net: Arc<MemoryNetwork>,
    nodes: Vec<Arc<AdjudicatorNode>>,
    keys: Vec<ArbiterKeypair>,
}

fn keys(count: usize) -> Vec<ArbiterKeypair> {
    (0..count)
        .map(|i| ArbiterKeypair::from_seed(&[i as u8 + 1; 32]))
        .collect()
}

/// `members` adjudicators in the membership, of which the first `running`
/// are actually online, joined and connected to each other.
async fn cluster(members: usize, running: usize) -> Cluster {
    let keys = keys(members);
    let membership = Arc::new(StaticMembership::new(keys.iter().map(|k| k.address())));
    let net = MemoryNetwork::new();

    let nodes: Vec<Arc<AdjudicatorNode>> = keys[..running]
        .iter()
        .map(|k| {
            Arc::new(AdjudicatorNode::new(
                k.clone(),
                membership.clone(),
                NodeConfig::default(),
            ))
        })
        .collect();
    mesh(&net, &nodes);

    // First heartbeats fire immediately; give every row a fresh update.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    Cluster { net, nodes, keys }
}

fn mesh(net: &Arc<MemoryNetwork>, nodes: &[Arc<AdjudicatorNode>]) {
    for node in nodes {
        node.join(net);
    }
    for a in nodes {
        for b in nodes.iter().filter(|b| b.address() != a.address()) {
            a.connect_to(net, b.address()).unwrap();
        }
    }
}

async fn run_all(nodes: &[Arc<AdjudicatorNode>], phase: u32, kind: RoundKind) -> Vec<RoundOutcome> {
    let rounds = nodes.iter().map(|node| {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            let payload = format!("draw-from-{}", &node.address()[..8]);
            node.run_round(phase, payload, FINALIZE, kind).await
        })
    });
    let mut outcomes = Vec::new();
    for handle in futures::future::join_all(rounds).await {
        outcomes.push(handle.unwrap());
    }
    outcomes
}

async fn shutdown(nodes: &[Arc<AdjudicatorNode>]) {
    for node in nodes {
        node.shutdown().await;
    }
}

/// A real node for `keys[index]`, with every key in the membership.
fn member_node(keys: &[ArbiterKeypair], index: usize, net: &Arc<MemoryNetwork>) -> Arc<AdjudicatorNode> {
    let membership = Arc::new(StaticMembership::new(keys.iter().map(|k| k.address())));
    let node = Arc::new(AdjudicatorNode::new(
        keys[index].clone(),
        membership,
        NodeConfig::default(),
    ));
    node.join(net);
    node
}

/// A member that heartbeats whatever `state` says and, when asked for its
/// own address, hands out `payload` as its contribution and `digest` as its
/// hash commitment. `None` withholds that entry.
struct Scripted {
    keypair: ArbiterKeypair,
    state: Arc<ConsensusState>,
    payload: Option<String>,
    digest: Option<String>,
}

impl Scripted {
    fn summary(&self) -> GossipReply {
        let snapshot = self.state.snapshot();
        GossipReply::State(StateSummary {
            height: snapshot.height,
            phase: snapshot.phase,
            finalized: snapshot.is_finalized(),
        })
    }

    fn own(&self, request: &GossipRequest, value: Option<&String>, message: &[u8]) -> GossipReply {
        let address = self.keypair.address();
        match value {
            Some(value) if request.missing.contains(&address) => {
                GossipReply::Entry(AddressedEntry {
                    address,
                    entry: SignedEntry::new(value.clone(), self.keypair.sign_hex(message)),
                })
            }
            _ => self.summary(),
        }
    }
}

impl RoundService for Scripted {
    fn handle_round_state(
        &self,
        _caller: &str,
        _attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError> {
        Ok(RoundAttestation::sign(&self.keypair, &self.state.snapshot()))
    }

    fn handle_contribution(
        &self,
        _caller: &str,
        request: GossipRequest,
    ) -> Result<GossipReply, RpcError> {
        let message = contribution_message(self.payload.as_deref().unwrap_or_default());
        Ok(self.own(&request, self.payload.as_ref(), &message))
    }

    fn handle_hash(&self, _caller: &str, request: GossipRequest) -> Result<GossipReply, RpcError> {
        let message = hash_message(request.key, self.digest.as_deref().unwrap_or_default());
        Ok(self.own(&request, self.digest.as_ref(), &message))
    }
}

/// Registers a [`Scripted`] member for `keypair` at height 0, phase 0. The
/// network only holds it weakly; keep the returned handle alive.
fn scripted(
    net: &Arc<MemoryNetwork>,
    keypair: &ArbiterKeypair,
    payload: Option<&str>,
    digest: Option<&str>,
) -> (Arc<dyn RoundService>, Arc<ConsensusState>) {
    let state = Arc::new(ConsensusState::new(0));
    let service: Arc<dyn RoundService> = Arc::new(Scripted {
        keypair: keypair.clone(),
        state: state.clone(),
        payload: payload.map(str::to_owned),
        digest: digest.map(str::to_owned),
    });
    net.register(keypair.address(), &service);
    (service, state)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

// 1. Three of five online is a majority: every online node finalizes the
//    same three-entry set and elects the same producer.
#[tokio::test(start_paused = true)]
async fn majority_online_finalizes_identical_sets() {
    let c = cluster(5, 3).await;
    let outcomes = run_all(&c.nodes, 0, RoundKind::Initial).await;

    let mut digests = Vec::new();
    let mut producers = Vec::new();
    for outcome in &outcomes {
        match outcome {
            RoundOutcome::Finalized {
                key,
                entries,
                digest,
            } => {
                assert_eq!(*key, RoundKey::new(1, 0));
                assert_eq!(entries.len(), 3);
                digests.push(digest.clone());
                producers.push(elect_producer(entries));
            }
            other => panic!("round did not finalize: {other:?}"),
        }
    }
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert!(producers.windows(2).all(|w| w[0] == w[1]));

    // The digest is the canonical digest of the sorted set.
    let entries = outcomes[0].entries().unwrap();
    let recomputed = canonical_digest(entries.iter().map(|(a, p)| (a.as_str(), p.as_str())));
    assert_eq!(recomputed, digests[0]);

    for node in &c.nodes {
        assert!(node.state().snapshot().is_finalized());
    }
    shutdown(&c.nodes).await;
}

// 2. Two of five online can never reach three contributions.
#[tokio::test(start_paused = true)]
async fn minority_online_fails_with_insufficient_contributions() {
    let c = cluster(5, 2).await;
    let outcomes = run_all(&c.nodes, 0, RoundKind::Initial).await;

    for outcome in outcomes {
        assert_eq!(
            outcome,
            RoundOutcome::Failed {
                key: RoundKey::new(1, 0),
                reason: RoundFailure::InsufficientContributions { have: 2, need: 3 },
            }
        );
    }
    for node in &c.nodes {
        assert!(!node.state().snapshot().is_finalized());
    }
    shutdown(&c.nodes).await;
}

// 3. A height change mid-collection moves the whole round to the new key.
#[tokio::test(start_paused = true)]
async fn height_change_mid_round_restarts_at_new_key() {
    let c = cluster(5, 3).await;

    // Two nodes start and stall at two of three contributions.
    let early = run_all(&c.nodes[..2], 0, RoundKind::Initial);
    let late = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for node in &c.nodes {
            node.state().advance_height(5);
        }
        run_all(&c.nodes[2..], 0, RoundKind::Initial).await
    };
    let (early, late) = tokio::join!(early, late);

    for outcome in early.iter().chain(late.iter()) {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
        assert_eq!(outcome.key(), RoundKey::new(6, 0));
    }
    shutdown(&c.nodes).await;
}

// 4. A peer serving forged entries gets reported and never merged.
#[tokio::test(start_paused = true)]
async fn forged_entries_are_never_merged() {
    let keys = keys(3);
    let (honest_key, forger_key, victim_key) = (&keys[0], &keys[1], &keys[2]);
    let membership = Arc::new(StaticMembership::new(keys.iter().map(|k| k.address())));
    let reports = Arc::new(Reports::default());
    let net = MemoryNetwork::new();

    let honest = AdjudicatorNode::with_parts(
        honest_key.clone(),
        membership,
        Arc::new(ConsensusState::new(0)),
        Arc::new(Ed25519Verifier),
        reports.clone(),
        NodeConfig::default(),
    );
    honest.join(&net);

    let forger: Arc<dyn RoundService> = Arc::new(Forger {
        keypair: forger_key.clone(),
        victim: victim_key.address(),
    });
    net.register(forger_key.address(), &forger);
    honest.connect_to(&net, &forger_key.address()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let outcome = honest
        .run_round(1, "honest", FINALIZE, RoundKind::Middle)
        .await;

    assert_eq!(
        outcome,
        RoundOutcome::Failed {
            key: RoundKey::new(1, 1),
            reason: RoundFailure::InsufficientContributions { have: 1, need: 2 },
        }
    );
    assert!(!honest
        .contributions()
        .contains(RoundKey::new(1, 1), &victim_key.address()));

    let reports = reports.0.lock();
    assert!(!reports.is_empty());
    assert!(reports.iter().all(|(peer, offense)| {
        *peer == forger_key.address()
            && *offense
                == Misbehavior::BadSignature {
                    address: victim_key.address(),
                }
    }));
    drop(reports);
    honest.shutdown().await;
}

/// Heartbeats honestly at phase 1 but answers every gossip request with an
/// entry for `victim` signed by its own key.
struct Forger {
    keypair: ArbiterKeypair,
    victim: String,
}

impl RoundService for Forger {
    fn handle_round_state(
        &self,
        _caller: &str,
        _attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError> {
        let state = ConsensusState::new(0);
        state.begin_phase(1);
        Ok(RoundAttestation::sign(&self.keypair, &state.snapshot()))
    }

    fn handle_contribution(
        &self,
        _caller: &str,
        _request: GossipRequest,
    ) -> Result<GossipReply, RpcError> {
        let signature = self.keypair.sign_hex(&contribution_message("forged"));
        Ok(GossipReply::Entry(AddressedEntry {
            address: self.victim.clone(),
            entry: SignedEntry::new("forged", signature),
        }))
    }

    fn handle_hash(&self, caller: &str, request: GossipRequest) -> Result<GossipReply, RpcError> {
        self.handle_contribution(caller, request)
    }
}

// 5. A member offering an entry under someone else's name is refused by
//    the server.
#[tokio::test(start_paused = true)]
async fn server_refuses_offers_for_other_addresses() {
    let c = cluster(3, 1).await;
    let node = &c.nodes[0];
    let (mallory, victim) = (&c.keys[1], &c.keys[2]);

    let client = c.net.client(&mallory.address(), node.address());
    let forged = SignedEntry::new(
        "mine now",
        victim.sign_hex(&contribution_message("mine now")),
    );
    let reply = client
        .request_contribution(GossipRequest {
            key: RoundKey::new(1, 0),
            missing: vec![],
            offered: Some(AddressedEntry {
                address: victim.address(),
                entry: forged,
            }),
        })
        .await
        .unwrap();

    assert!(matches!(reply, GossipReply::State(_)));
    assert_eq!(node.contributions().count(RoundKey::new(1, 0)), 0);
    shutdown(&c.nodes).await;
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

// 6. Across many heights the caches only ever hold the retention window.
#[tokio::test(start_paused = true)]
async fn caches_stay_inside_the_window_across_heights() {
    let keypair = ArbiterKeypair::generate();
    let mut config = NodeConfig::default();
    config.cache_capacity = 8;
    let node = AdjudicatorNode::new(
        keypair.clone(),
        Arc::new(StaticMembership::new([keypair.address()])),
        config,
    );

    let kinds = [RoundKind::Initial, RoundKind::Middle, RoundKind::Last];
    for height in 0..20u64 {
        for (phase, kind) in kinds.iter().enumerate() {
            let outcome = node
                .run_round(phase as u32, format!("{height}/{phase}"), FINALIZE, *kind)
                .await;
            assert!(outcome.is_finalized());
            assert!(node.contributions().key_count() <= 8);
            assert!(node.hashes().key_count() <= 8);
        }
        node.state().advance_height(height + 1);
    }

    let outcome = node
        .run_round(0, "last", FINALIZE, RoundKind::Initial)
        .await;
    let active = outcome.key();
    assert_eq!(active, RoundKey::new(21, 0));
    for key in node
        .contributions()
        .keys()
        .into_iter()
        .chain(node.hashes().keys())
    {
        assert!(!key.is_behind_window(active), "{key} survived past {active}");
    }
}

// 7. Re-running a finalized round at the same key reproduces the same set.
#[tokio::test(start_paused = true)]
async fn rerun_of_finalized_round_is_idempotent() {
    let c = cluster(5, 3).await;
    let first = run_all(&c.nodes, 0, RoundKind::Initial).await;
    let second = run_all(&c.nodes, 0, RoundKind::Initial).await;

    for (a, b) in first.iter().zip(second.iter()) {
        assert!(a.is_finalized() && b.is_finalized());
        assert_eq!(a.entries(), b.entries());
    }
    shutdown(&c.nodes).await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

// 8. A majority committing another digest fails the round outright.
#[tokio::test(start_paused = true)]
async fn majority_of_other_digests_is_a_hash_mismatch() {
    let keys = keys(3);
    let net = MemoryNetwork::new();
    let node = member_node(&keys, 0, &net);
    let mut colluders = Vec::new();
    for key in &keys[1..] {
        colluders.push(scripted(&net, key, Some("draw"), Some("some other digest")));
        node.connect_to(&net, &key.address()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let outcome = node
        .run_round(0, "draw", FINALIZE, RoundKind::Initial)
        .await;
    assert_eq!(
        outcome,
        RoundOutcome::Failed {
            key: RoundKey::new(1, 0),
            reason: RoundFailure::HashMismatch {
                mismatches: 2,
                need: 2,
            },
        }
    );
    assert!(!node.state().snapshot().is_finalized());
    node.shutdown().await;
}

// 9. A live peer that never commits a hash holds the tally open until the
//    finalize timeout.
#[tokio::test(start_paused = true)]
async fn withheld_hash_runs_into_finalize_timeout() {
    let keys = keys(3);
    let net = MemoryNetwork::new();
    let node = member_node(&keys, 0, &net);
    let _silent = scripted(&net, &keys[1], Some("draw"), None);
    node.connect_to(&net, &keys[1].address()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let started = Instant::now();
    let outcome = node
        .run_round(0, "draw", Duration::from_secs(3), RoundKind::Initial)
        .await;
    assert_eq!(
        outcome,
        RoundOutcome::Failed {
            key: RoundKey::new(1, 0),
            reason: RoundFailure::FinalizeTimeout {
                matches: 1,
                need: 2,
            },
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
    node.shutdown().await;
}

// 10. Cutting the only other live member off after collection leaves the
//     tally nobody to wait for; it gives up before the finalize timeout.
#[tokio::test(start_paused = true)]
async fn partition_after_collection_makes_majority_unreachable() {
    let keys = keys(3);
    let net = MemoryNetwork::new();
    let node = member_node(&keys, 0, &net);
    let _silent = scripted(&net, &keys[1], Some("draw"), None);
    node.connect_to(&net, &keys[1].address()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let started = Instant::now();
    let round = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            node.run_round(0, "draw", FINALIZE, RoundKind::Initial)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(node.coordinator().is_ready(), "collection should be over");
    net.isolate(&keys[1].address());

    let outcome = round.await.unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::Failed {
            key: RoundKey::new(1, 0),
            reason: RoundFailure::MajorityUnreachable {
                matches: 1,
                pending: 0,
                need: 2,
            },
        }
    );
    assert!(started.elapsed() < FINALIZE);
    node.shutdown().await;
}

// ---------------------------------------------------------------------------
// Catch-up
// ---------------------------------------------------------------------------

/// Two live nodes that already finalized phase 0, plus a scripted third
/// member that only heartbeats and is still processing phase 0.
async fn with_straggler() -> (Cluster, Arc<ConsensusState>, Arc<dyn RoundService>) {
    let c = cluster(3, 2).await;
    for node in &c.nodes {
        node.state().begin_phase(0);
        node.state().finalize_phase(0, 0);
    }
    let (straggler, lagging) = scripted(&c.net, &c.keys[2], None, None);
    for node in &c.nodes {
        node.connect_to(&c.net, &c.keys[2].address()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    (c, lagging, straggler)
}

// 11. A finalized round waits for a fresh member that is behind, and stops
//     waiting once it reports the phase finalized.
#[tokio::test(start_paused = true)]
async fn catch_up_waits_for_lagging_member() {
    let (c, lagging, _straggler) = with_straggler().await;

    let started = Instant::now();
    let rounds = run_all(&c.nodes, 1, RoundKind::Middle);
    let catch_up = async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        lagging.begin_phase(1);
        lagging.finalize_phase(0, 1);
    };
    let (outcomes, ()) = tokio::join!(rounds, catch_up);
    let elapsed = started.elapsed();

    for outcome in &outcomes {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
        assert_eq!(outcome.key(), RoundKey::new(1, 1));
    }
    assert!(elapsed >= Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(elapsed < CATCH_UP_TIMEOUT, "returned after {elapsed:?}");
    shutdown(&c.nodes).await;
}

// 12. A member that never catches up only delays success, bounded by the
//     catch-up timeout.
#[tokio::test(start_paused = true)]
async fn catch_up_gives_up_after_timeout() {
    let (c, _lagging, _straggler) = with_straggler().await;

    let started = Instant::now();
    let outcomes = run_all(&c.nodes, 1, RoundKind::Middle).await;

    for outcome in &outcomes {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
    }
    assert!(started.elapsed() >= CATCH_UP_TIMEOUT);
    shutdown(&c.nodes).await;
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

// 13. With one link cut, entries and hashes travel through the third node;
//     after healing, the next phase runs over the full mesh.
#[tokio::test(start_paused = true)]
async fn cut_link_is_bridged_by_relay() {
    let c = cluster(5, 3).await;
    c.net.partition(c.nodes[0].address(), c.nodes[1].address());

    let first = run_all(&c.nodes, 0, RoundKind::Initial).await;
    for outcome in &first {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
        assert_eq!(outcome.entries().map(<[_]>::len), Some(3));
    }
    assert!(first.windows(2).all(|w| w[0].entries() == w[1].entries()));

    c.net.heal_all();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let second = run_all(&c.nodes, 1, RoundKind::Middle).await;
    for outcome in &second {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
        assert_eq!(outcome.key(), RoundKey::new(1, 1));
    }
    assert!(second.windows(2).all(|w| w[0].entries() == w[1].entries()));
    shutdown(&c.nodes).await;
}

// 14. Slow links only slow the round down.
#[tokio::test(start_paused = true)]
async fn slow_links_still_finalize() {
    let c = cluster(5, 3).await;
    c.net.set_latency(Duration::from_millis(40));

    let outcomes = run_all(&c.nodes, 0, RoundKind::Initial).await;
    for outcome in &outcomes {
        assert!(outcome.is_finalized(), "unexpected outcome {outcome:?}");
        assert_eq!(outcome.entries().map(<[_]>::len), Some(3));
    }
    assert!(outcomes.windows(2).all(|w| w[0].entries() == w[1].entries()));
    shutdown(&c.nodes).await;
}
