//! Gossip engine: epidemic anti-entropy dissemination of node liveness,
//! capability advertisements, cost state, and knowledge manifests (§4.2).
//!
//! Inter-node transport is opaque to this module (§6) — no NAT/STUN/relay
//! plumbing lives here. The engine depends only on [`PeerTransport`], so the
//! digest exchange and idempotent-apply logic are fully testable against an
//! in-memory double.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::registry::Registry;
use crate::types::{now_unix_s, Capability, CostState, Node};

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no live peers to gossip with")]
    NoPeers,
}

/// Digest entry exchanged during anti-entropy: `(seq, hash)` for one
/// sender, compact enough to ship every tick without shipping payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestEntry {
    pub seq: u64,
    pub hash: u64,
}

pub type Digest = HashMap<String, DigestEntry>;

/// Per-domain knowledge summary carried by `KNOWLEDGE_STATE` (§4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSummary {
    pub domain: String,
    pub version: u64,
    pub chunk_count: u64,
    pub state: String,
}

/// The gossip message taxonomy (§4.2). Every variant carries the common
/// envelope fields via [`GossipMessage`] rather than duplicating them per
/// variant.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipBody {
    NodeHello { display_name: String, endpoints: Vec<String> },
    CapabilityUpdate { capabilities: Vec<Capability> },
    NodeCostUpdate { cost: CostState },
    KnowledgeState { domains: Vec<KnowledgeSummary> },
    ModelDeployed { capability: Capability },
    AgentRegister { capability: Capability },
    ToolAvailable { capability: Capability },
    Farewell,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    pub sender: String,
    pub seq: u64,
    pub wall_ts: u64,
    pub ttl_hops: u8,
    pub body: GossipBody,
}

impl GossipMessage {
    /// Cheap content hash used as the digest entry for this message —
    /// deliberately coarse (not cryptographic); only needs to distinguish
    /// "same seq, same content" from "same seq, different content" during
    /// anti-entropy.
    pub fn content_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        #[derive(Hash)]
        enum Tag {
            Hello,
            Cap,
            Cost,
            Knowledge,
            Model,
            Agent,
            Tool,
            Bye,
        }
        let mut hasher = DefaultHasher::new();
        self.sender.hash(&mut hasher);
        self.seq.hash(&mut hasher);
        match &self.body {
            GossipBody::NodeHello { display_name, endpoints } => {
                Tag::Hello.hash(&mut hasher);
                display_name.hash(&mut hasher);
                endpoints.hash(&mut hasher);
            }
            GossipBody::CapabilityUpdate { capabilities } => {
                Tag::Cap.hash(&mut hasher);
                for c in capabilities {
                    c.key().hash(&mut hasher);
                }
            }
            GossipBody::NodeCostUpdate { cost } => {
                Tag::Cost.hash(&mut hasher);
                cost.sampled_at.hash(&mut hasher);
                (cost.overall_cost.to_bits()).hash(&mut hasher);
            }
            GossipBody::KnowledgeState { domains } => {
                Tag::Knowledge.hash(&mut hasher);
                for d in domains {
                    d.domain.hash(&mut hasher);
                    d.version.hash(&mut hasher);
                }
            }
            GossipBody::ModelDeployed { capability } => {
                Tag::Model.hash(&mut hasher);
                capability.key().hash(&mut hasher);
            }
            GossipBody::AgentRegister { capability } => {
                Tag::Agent.hash(&mut hasher);
                capability.key().hash(&mut hasher);
            }
            GossipBody::ToolAvailable { capability } => {
                Tag::Tool.hash(&mut hasher);
                capability.key().hash(&mut hasher);
            }
            GossipBody::Farewell => {
                Tag::Bye.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

/// Opaque transport seam (§6): send a digest to a peer, fetch the messages
/// a peer has that we're missing, and list the currently-live peer set to
/// sample from. Real deployments back this with HTTP/QUIC/whatever; tests
/// back it with an in-memory map.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn live_peers(&self) -> Vec<String>;
    async fn exchange_digest(&self, peer: &str, local: Digest) -> Result<Digest, GossipError>;
    async fn pull_messages(
        &self,
        peer: &str,
        wanted: Vec<(String, u64)>,
    ) -> Result<Vec<GossipMessage>, GossipError>;
}

/// Tracks, for idempotent apply, the highest `(seq, hash)` accepted per
/// sender — this is the state the "monotone per-sender seq" invariant (§8)
/// is checked against.
pub struct GossipState {
    seen: HashMap<String, DigestEntry>,
}

impl GossipState {
    pub fn new() -> Self {
        GossipState { seen: HashMap::new() }
    }

    pub fn local_digest(&self) -> Digest {
        self.seen.clone()
    }

    /// `true` if `msg` is new information (higher seq than previously
    /// seen for this sender, or first sighting).
    pub fn is_new(&self, msg: &GossipMessage) -> bool {
        match self.seen.get(&msg.sender) {
            None => true,
            Some(entry) => msg.seq > entry.seq,
        }
    }

    fn record(&mut self, msg: &GossipMessage) {
        self.seen.insert(
            msg.sender.clone(),
            DigestEntry { seq: msg.seq, hash: msg.content_hash() },
        );
    }
}

impl Default for GossipState {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one gossip message to the registry. Applying an update with
/// `seq <= local_seq` for that sender is a documented no-op (§4.2) — this
/// makes `apply` idempotent and keeps per-sender seq monotone (§8).
pub async fn apply(state: &mut GossipState, registry: &Registry, msg: GossipMessage) -> bool {
    if !state.is_new(&msg) {
        log::debug!(
            "gossip: dropping stale/duplicate message from {} seq={}",
            msg.sender,
            msg.seq
        );
        return false;
    }

    match &msg.body {
        GossipBody::NodeHello { display_name, endpoints } => {
            registry
                .upsert_node_identity(&msg.sender, display_name, endpoints.clone(), msg.seq)
                .await;
        }
        GossipBody::CapabilityUpdate { capabilities } => {
            registry
                .apply_capabilities(&msg.sender, capabilities.clone(), msg.seq)
                .await;
        }
        GossipBody::NodeCostUpdate { cost } => {
            registry.apply_cost(&msg.sender, cost.clone(), msg.seq).await;
        }
        GossipBody::KnowledgeState { .. } => {
            registry.touch_node(&msg.sender, msg.seq).await;
        }
        GossipBody::ModelDeployed { capability }
        | GossipBody::AgentRegister { capability }
        | GossipBody::ToolAvailable { capability } => {
            // Additive per the resolved open question in SPEC_FULL.md: a
            // specialized announcement inserts alongside existing
            // capabilities rather than replacing them.
            registry
                .apply_capabilities(&msg.sender, vec![capability.clone()], msg.seq)
                .await;
        }
        GossipBody::Farewell => {
            registry.mark_departed(&msg.sender, msg.seq).await;
        }
    }

    state.record(&msg);
    true
}

/// One anti-entropy tick: pick up to `k` live peers, exchange digests,
/// pull and apply whatever they have that we're missing or is newer
/// (§4.2). Returns the number of messages actually applied.
pub async fn run_tick(
    state: &Arc<RwLock<GossipState>>,
    registry: &Registry,
    transport: &dyn PeerTransport,
    fanout_k: usize,
) -> Result<usize, GossipError> {
    let mut peers = transport.live_peers().await;
    if peers.is_empty() {
        return Err(GossipError::NoPeers);
    }
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(fanout_k);

    let local_digest = state.read().await.local_digest();
    let mut applied = 0usize;

    for peer in peers {
        let remote_digest = transport.exchange_digest(&peer, local_digest.clone()).await?;
        let mut wanted = Vec::new();
        for (sender, remote_entry) in &remote_digest {
            let local_seq = local_digest.get(sender).map(|e| e.seq).unwrap_or(0);
            let is_new_sender = !local_digest.contains_key(sender);
            if is_new_sender || remote_entry.seq > local_seq {
                wanted.push((sender.clone(), local_seq));
            }
        }
        if wanted.is_empty() {
            continue;
        }
        let messages = transport.pull_messages(&peer, wanted).await?;
        for msg in messages {
            let mut guard = state.write().await;
            if apply(&mut guard, registry, msg).await {
                applied += 1;
            }
        }
    }

    Ok(applied)
}

/// Classification used by the registry's liveness/eviction bookkeeping
/// (§4.2): `stale` after `liveness_window`, removed after `eviction_window`.
pub fn liveness_class(node: &Node, liveness_window_s: u64, eviction_window_s: u64) -> Liveness {
    let age = now_unix_s().saturating_sub(node.last_seen);
    if age > liveness_window_s + eviction_window_s {
        Liveness::Evictable
    } else if age > liveness_window_s {
        Liveness::Stale
    } else {
        Liveness::Live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Stale,
    Evictable,
}
