//! Intent router: the five-tier cascade (§4.4) that turns a typed
//! [`Intent`] into a concrete `(node, capability)` [`RouteDecision`].
//!
//! Tiers run strictly in order — a later tier only runs once an earlier
//! one has failed to produce a decision (the "cascade monotonicity"
//! invariant, §8). Each tier is a pure function over the candidate set
//! plus, for Tier 4, one optional I/O hop (an embedding lookup).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::NodeConfig;
use crate::cost::{score_for_intent, CostInputs};
use crate::registry::Registry;
use crate::simhash::{hamming_distance, simhash64, similarity as simhash_similarity};
use crate::types::{Capability, Intent, LocalityPref, Node, RouteDecision, TierHit};

#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    #[error("no node advertises a capability matching this intent")]
    NoCapableNode,
    #[error("matching capabilities exist but no candidate is currently live")]
    AllCandidatesStale,
    #[error("routing cascade exceeded the intent's deadline")]
    DeadlineExceeded,
    #[error("preferences.locality=specific-node requested {0}, which is unavailable")]
    SpecificNodeUnavailable(String),
}

/// Opaque embedding seam (§1 non-goal: no specific embedding model is
/// defined by this crate). A real deployment wires in whatever embedder it
/// bundles; tests use a deterministic stand-in.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

pub struct NoEmbedder;
impl Embedder for NoEmbedder {
    fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

struct CachedDecision {
    decision: RouteDecision,
    expires_at: Instant,
}

/// Tier 1 exact cache. Concurrency model per §5: concurrent map with TTL
/// eviction applied on read (a single shard here; production deployments
/// wanting per-shard locking can swap this type without touching the
/// cascade above it).
struct ExactCache {
    entries: RwLock<HashMap<u64, CachedDecision>>,
}

impl ExactCache {
    fn new() -> Self {
        ExactCache { entries: RwLock::new(HashMap::new()) }
    }

    async fn get(&self, key: u64) -> Option<RouteDecision> {
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.decision.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: u64, decision: RouteDecision, ttl: Duration) {
        self.entries
            .write()
            .await
            .insert(key, CachedDecision { decision, expires_at: Instant::now() + ttl });
    }
}

struct SemanticEntry {
    fingerprint: u64,
    decision: RouteDecision,
    expires_at: Instant,
}

/// Tier 2 semantic cache, keyed by SimHash with Hamming-distance lookup
/// (§4.4). Stored as a flat list since cache sizes here are small relative
/// to the tier's own 0.1ms budget; a production deployment with a much
/// larger cache would shard by a SimHash prefix instead.
struct SemanticCache {
    entries: RwLock<Vec<SemanticEntry>>,
}

impl SemanticCache {
    fn new() -> Self {
        SemanticCache { entries: RwLock::new(Vec::new()) }
    }

    async fn get(&self, fingerprint: u64, hamming_max: u32) -> Option<RouteDecision> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.expires_at > Instant::now());
        entries
            .iter()
            .find(|e| hamming_distance(e.fingerprint, fingerprint) <= hamming_max)
            .map(|e| e.decision.clone())
    }

    async fn put(&self, fingerprint: u64, decision: RouteDecision, ttl: Duration) {
        self.entries.write().await.push(SemanticEntry {
            fingerprint,
            decision,
            expires_at: Instant::now() + ttl,
        });
    }
}

pub struct IntentRouter {
    config: NodeConfig,
    registry: Arc<Registry>,
    embedder: Box<dyn Embedder>,
    exact_cache: ExactCache,
    semantic_cache: SemanticCache,
}

impl IntentRouter {
    pub fn new(config: NodeConfig, registry: Arc<Registry>, embedder: Box<dyn Embedder>) -> Self {
        IntentRouter {
            config,
            registry,
            embedder,
            exact_cache: ExactCache::new(),
            semantic_cache: SemanticCache::new(),
        }
    }

    fn exact_key(intent: &Intent) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        intent.intent_type.hash(&mut hasher);
        intent.domain.hash(&mut hasher);
        intent.payload.hash(&mut hasher);
        intent.preferences.latency.hash_discriminant(&mut hasher);
        intent.preferences.accuracy.hash_discriminant(&mut hasher);
        hasher.finish()
    }

    fn query_text(intent: &Intent) -> String {
        if !intent.payload_keywords.is_empty() {
            intent.payload_keywords.join(" ")
        } else {
            String::from_utf8_lossy(&intent.payload).to_string()
        }
    }

    /// Runs the full five-tier cascade with no excluded nodes — the common
    /// case for a first routing attempt.
    pub async fn route(&self, intent: &Intent) -> Result<RouteDecision, RouterError> {
        self.route_excluding(intent, &[]).await
    }

    /// Runs the full five-tier cascade, treating `excluded` node ids as
    /// unavailable at every tier (§4.6: dispatch retries re-query the
    /// router with the failed node excluded). A cache hit naming an
    /// excluded node is skipped rather than invalidated — it's still valid
    /// for other callers, just not for this retry.
    pub async fn route_excluding(
        &self,
        intent: &Intent,
        excluded: &[String],
    ) -> Result<RouteDecision, RouterError> {
        let started = Instant::now();
        let deadline = intent.deadline_ms.map(Duration::from_millis);

        if let Some(decision) = self.tier1_exact(intent, excluded).await {
            return Ok(decision);
        }
        self.check_deadline(started, deadline)?;

        if let Some(decision) = self.tier2_semantic(intent, excluded).await {
            self.exact_cache
                .put(Self::exact_key(intent), decision.clone(), self.exact_ttl())
                .await;
            return Ok(decision);
        }
        self.check_deadline(started, deadline)?;

        let candidates = self.tier3_keyword_type(intent, excluded).await?;
        self.check_deadline(started, deadline)?;

        // Tier 3 resolved to a single unambiguous candidate: the decision
        // is made here, tier_hit = keyword, and Tier 4/5 never run (cascade
        // monotonicity, §8).
        if candidates.len() == 1 {
            let (node, cap) = candidates.into_iter().next().unwrap();
            if !node.is_live(self.config.liveness_window_s) {
                return Err(RouterError::AllCandidatesStale);
            }
            let decision = RouteDecision {
                intent_id: intent.id.clone(),
                node_id: node.node_id.clone(),
                capability_key: cap.key(),
                tier_hit: TierHit::Keyword,
                score: 1.0,
                reason: "tier3 unambiguous keyword/type match".to_string(),
            };
            self.exact_cache
                .put(Self::exact_key(intent), decision.clone(), self.exact_ttl())
                .await;
            return Ok(decision);
        }

        let scored = self.tier4_rerank(intent, candidates).await;
        self.check_deadline(started, deadline)?;

        let tier_hit = if scores_are_distinguishing(&scored) {
            TierHit::Rerank
        } else {
            TierHit::Cost
        };
        let decision = self.tier5_cost_weighted(intent, scored, tier_hit, excluded).await?;

        self.exact_cache
            .put(Self::exact_key(intent), decision.clone(), self.exact_ttl())
            .await;
        let fingerprint = simhash64(&Self::query_text(intent));
        self.semantic_cache
            .put(fingerprint, decision.clone(), self.semantic_ttl())
            .await;

        Ok(decision)
    }

    fn exact_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_exact_s)
    }

    fn semantic_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_semantic_s)
    }

    fn check_deadline(&self, started: Instant, deadline: Option<Duration>) -> Result<(), RouterError> {
        match deadline {
            Some(d) if started.elapsed() > d => Err(RouterError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Tier 1: exact cache. A hit is only honored if the target node is
    /// still live — this is the "cache correctness" invariant (§8) — and
    /// isn't one of `excluded` (a node already tried and failed this
    /// dispatch).
    async fn tier1_exact(&self, intent: &Intent, excluded: &[String]) -> Option<RouteDecision> {
        let cached = self.exact_cache.get(Self::exact_key(intent)).await?;
        if excluded.contains(&cached.node_id) {
            return None;
        }
        if self.decision_still_valid(&cached).await {
            let mut hit = cached;
            hit.tier_hit = TierHit::Exact;
            Some(hit)
        } else {
            None
        }
    }

    /// Tier 2: semantic cache by SimHash proximity. A hit is re-validated
    /// against liveness/cost and against `excluded`; a mismatch demotes to
    /// Tier 3 rather than returning a stale or already-failed decision.
    async fn tier2_semantic(&self, intent: &Intent, excluded: &[String]) -> Option<RouteDecision> {
        let fingerprint = simhash64(&Self::query_text(intent));
        let cached = self
            .semantic_cache
            .get(fingerprint, self.config.simhash_hamming_max)
            .await?;
        if excluded.contains(&cached.node_id) {
            return None;
        }
        if self.decision_still_valid(&cached).await {
            let mut hit = cached;
            hit.tier_hit = TierHit::Semantic;
            Some(hit)
        } else {
            None
        }
    }

    async fn decision_still_valid(&self, decision: &RouteDecision) -> bool {
        match self.registry.get_node(&decision.node_id).await {
            Some(node) => node
                .capabilities
                .iter()
                .any(|c| c.key() == decision.capability_key),
            None => false,
        }
    }

    /// Tier 3: keyword/type match, with fallback order — domain match, or
    /// keyword intersection, or a domain-less generalist capability; failing
    /// that, fall back to type match alone. Candidates in `excluded` never
    /// appear in the returned set.
    async fn tier3_keyword_type(
        &self,
        intent: &Intent,
        excluded: &[String],
    ) -> Result<Vec<(Node, Capability)>, RouterError> {
        if let LocalityPref::SpecificNode(node_id) = &intent.preferences.locality {
            if excluded.contains(node_id) {
                return Err(RouterError::SpecificNodeUnavailable(node_id.clone()));
            }
            let node = self
                .registry
                .get_node(node_id)
                .await
                .ok_or_else(|| RouterError::SpecificNodeUnavailable(node_id.clone()))?;
            let cap = node
                .capabilities
                .iter()
                .find(|c| c.type_matches(&intent.intent_type))
                .cloned()
                .ok_or_else(|| RouterError::SpecificNodeUnavailable(node_id.clone()))?;
            return Ok(vec![(node, cap)]);
        }

        let type_matches: Vec<(Node, Capability)> = self
            .registry
            .lookup_nodes(&intent.intent_type, None)
            .await
            .into_iter()
            .filter(|(node, _)| !excluded.contains(&node.node_id))
            .collect();
        if type_matches.is_empty() {
            return Err(RouterError::NoCapableNode);
        }

        // (a)/(b): domain or keyword specifically match — preferred over a
        // bare generalist whenever something specific is available.
        let specific: Vec<(Node, Capability)> = type_matches
            .iter()
            .filter(|(_, cap)| {
                let domain_match = match (&intent.domain, &cap.domain) {
                    (Some(wanted), Some(have)) => wanted == have,
                    _ => false,
                };
                let keyword_hit = !intent.payload_keywords.is_empty()
                    && cap
                        .representations
                        .keywords
                        .iter()
                        .any(|kw| intent.payload_keywords.contains(kw));
                domain_match || keyword_hit
            })
            .cloned()
            .collect();

        // (c): fall back to domain-less generalists when nothing specific
        // matched.
        let generalists: Vec<(Node, Capability)> = type_matches
            .iter()
            .filter(|(_, cap)| cap.domain.is_none())
            .cloned()
            .collect();

        let candidates = if !specific.is_empty() {
            specific
        } else if !generalists.is_empty() {
            generalists
        } else {
            type_matches
        };

        let any_live = candidates
            .iter()
            .any(|(node, _)| node.is_live(self.config.liveness_window_s));
        if !any_live {
            return Err(RouterError::AllCandidatesStale);
        }

        Ok(candidates)
    }

    /// Tier 4: cosine similarity against candidate embeddings when the
    /// candidate set has more than one member and an embedding is
    /// available (precomputed on the intent, or produced by the local
    /// embedder). Candidates without an embedding fall back to SimHash
    /// similarity; keyword-only candidates never rerank.
    async fn tier4_rerank(
        &self,
        intent: &Intent,
        candidates: Vec<(Node, Capability)>,
    ) -> Vec<((Node, Capability), f64)> {
        if candidates.len() <= 1 {
            return candidates.into_iter().map(|c| (c, 1.0)).collect();
        }

        let query_embedding = intent
            .payload_embedding
            .clone()
            .or_else(|| {
                if self.config.embedder_available {
                    self.embedder.embed(&Self::query_text(intent))
                } else {
                    None
                }
            });
        let query_fingerprint = simhash64(&Self::query_text(intent));

        candidates
            .into_iter()
            .map(|(node, cap)| {
                let score = match (&query_embedding, &cap.representations.embedding) {
                    (Some(q), Some(c)) => cosine_similarity(q, c),
                    _ => match cap.representations.simhash {
                        Some(fp) => simhash_similarity(query_fingerprint, fp) * 0.7,
                        None => 0.5,
                    },
                };
                ((node, cap), score)
            })
            .collect()
    }

    /// Tier 5: combine semantic score with cost, apply tie-breakers, and
    /// produce the final decision. Candidates in `excluded` are skipped
    /// even if Tier 3/4 already let them through (e.g. a single-sender
    /// gossip gap before the exclusion was applied upstream).
    async fn tier5_cost_weighted(
        &self,
        intent: &Intent,
        scored: Vec<((Node, Capability), f64)>,
        tier_hit: TierHit,
        excluded: &[String],
    ) -> Result<RouteDecision, RouterError> {
        if scored.is_empty() {
            return Err(RouterError::NoCapableNode);
        }

        let mut best: Option<(f64, Node, Capability, u8)> = None;
        for ((node, cap), semantic_score) in scored {
            if !node.is_live(self.config.liveness_window_s) || excluded.contains(&node.node_id) {
                continue;
            }
            let cost_inputs = match self.registry.snapshot_cost(&node.node_id).await {
                Some(Ok(cost)) => Some(CostInputs::from_cost_state(&cost)),
                _ => None,
            };
            let cost = score_for_intent(cost_inputs.as_ref(), intent, self.config.budget_sensitivity);
            let mut final_score = semantic_score / cost;

            let hop_count: u8 = if node.node_id == self.config.node_id { 0 } else { 1 };
            if hop_count == 0 && matches!(intent.preferences.locality, LocalityPref::PreferLocal) {
                final_score *= 1.2;
            }

            let candidate = (final_score, node, cap, hop_count);
            best = Some(match best {
                None => candidate,
                Some(current) => pick_better(current, candidate),
            });
        }

        let (score, node, cap, _hops) = best.ok_or(RouterError::AllCandidatesStale)?;
        Ok(RouteDecision {
            intent_id: intent.id.clone(),
            node_id: node.node_id.clone(),
            capability_key: cap.key(),
            tier_hit,
            score,
            reason: "tier5 cost-weighted selection".to_string(),
        })
    }
}

/// `true` when Tier 4 produced meaningfully different scores across
/// candidates (real embedding/SimHash signal), as opposed to every
/// candidate landing on the same flat fallback score — in the latter case
/// cost alone ends up deciding the winner.
fn scores_are_distinguishing(scored: &[((Node, Capability), f64)]) -> bool {
    match scored.split_first() {
        None => false,
        Some((first, rest)) => rest.iter().any(|s| (s.1 - first.1).abs() > 1e-9),
    }
}

fn pick_better(
    current: (f64, Node, Capability, u8),
    candidate: (f64, Node, Capability, u8),
) -> (f64, Node, Capability, u8) {
    let (c_score, c_node, c_cap, c_hops) = current;
    let (n_score, n_node, n_cap, n_hops) = candidate;

    if (n_score - c_score).abs() > 1e-9 {
        return if n_score > c_score {
            (n_score, n_node, n_cap, n_hops)
        } else {
            (c_score, c_node, c_cap, c_hops)
        };
    }
    if n_hops != c_hops {
        return if n_hops < c_hops {
            (n_score, n_node, n_cap, n_hops)
        } else {
            (c_score, c_node, c_cap, c_hops)
        };
    }
    let c_latency = c_node.cost_state.as_ref().and_then(|c| c.latency_ms).unwrap_or(f64::MAX);
    let n_latency = n_node.cost_state.as_ref().and_then(|c| c.latency_ms).unwrap_or(f64::MAX);
    if (n_latency - c_latency).abs() > 1e-9 {
        return if n_latency < c_latency {
            (n_score, n_node, n_cap, n_hops)
        } else {
            (c_score, c_node, c_cap, c_hops)
        };
    }
    if n_node.node_id < c_node.node_id {
        (n_score, n_node, n_cap, n_hops)
    } else {
        (c_score, c_node, c_cap, c_hops)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

trait HashDiscriminant {
    fn hash_discriminant<H: Hasher>(&self, state: &mut H);
}

impl HashDiscriminant for crate::types::LatencyPref {
    fn hash_discriminant<H: Hasher>(&self, state: &mut H) {
        (*self as u8 as u16).hash(state);
    }
}

impl HashDiscriminant for crate::types::AccuracyPref {
    fn hash_discriminant<H: Hasher>(&self, state: &mut H) {
        (*self as u8 as u16).hash(state);
    }
}
