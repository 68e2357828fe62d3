//! In-memory registry of nodes, capabilities, and cost state — entirely
//! derived from gossip (§4.3). Three indices (`by_node`, `by_capability_type`,
//! `by_domain`) are kept in lockstep behind a single writer lock; readers
//! take a consistent snapshot via the same `Arc<RwLock<HashMap<..>>>`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::NodeConfig;
use crate::types::{now_unix_s, Capability, CostState, Node};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability embedding dimensionality {found} disagrees with configured {expected}")]
    EmbeddingDimMismatch { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyOutcome {
    Accepted,
    Stale,
    RejectedEmbeddingDim,
}

struct Indices {
    by_node: HashMap<String, Node>,
    /// capability type (including wildcards like `rag/<domain>` literal
    /// types) -> set of capability keys
    by_capability_type: HashMap<String, Vec<String>>,
    by_domain: HashMap<String, Vec<String>>,
}

impl Indices {
    fn new() -> Self {
        Indices {
            by_node: HashMap::new(),
            by_capability_type: HashMap::new(),
            by_domain: HashMap::new(),
        }
    }

    fn reindex_node_capabilities(&mut self, node_id: &str) {
        self.by_capability_type.retain(|_, keys| {
            keys.retain(|k| !k.ends_with(&format!("@{node_id}")));
            !keys.is_empty()
        });
        self.by_domain.retain(|_, keys| {
            keys.retain(|k| !k.ends_with(&format!("@{node_id}")));
            !keys.is_empty()
        });

        let Some(node) = self.by_node.get(node_id) else {
            return;
        };
        for cap in &node.capabilities {
            self.by_capability_type
                .entry(cap.cap_type.clone())
                .or_default()
                .push(cap.key());
            if let Some(domain) = &cap.domain {
                self.by_domain.entry(domain.clone()).or_default().push(cap.key());
            }
        }
    }
}

/// The process-wide node/capability/cost model. Initialized explicitly at
/// node start (never lazily on first use, per §9's singleton guidance) and
/// held behind `Arc` so gossip-apply and router reads share one instance.
pub struct Registry {
    config: NodeConfig,
    indices: RwLock<Indices>,
}

impl Registry {
    pub fn new(config: NodeConfig) -> Self {
        Registry { config, indices: RwLock::new(Indices::new()) }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn ensure_node<'a>(indices: &'a mut Indices, node_id: &str) -> &'a mut Node {
        indices.by_node.entry(node_id.to_string()).or_insert_with(|| Node {
            node_id: node_id.to_string(),
            display_name: node_id.to_string(),
            capabilities: Vec::new(),
            cost_state: None,
            last_seen: now_unix_s(),
            endpoints: Vec::new(),
            seq: 0,
        })
    }

    pub async fn upsert_node_identity(
        &self,
        node_id: &str,
        display_name: &str,
        endpoints: Vec<String>,
        seq: u64,
    ) -> ApplyOutcome {
        let mut indices = self.indices.write().await;
        if !accepts_seq(&indices, node_id, seq) {
            return ApplyOutcome::Stale;
        }
        let node = Self::ensure_node(&mut indices, node_id);
        node.display_name = display_name.to_string();
        node.endpoints = endpoints;
        node.last_seen = now_unix_s();
        node.seq = seq;
        ApplyOutcome::Accepted
    }

    pub async fn apply_capabilities(
        &self,
        node_id: &str,
        capabilities: Vec<Capability>,
        seq: u64,
    ) -> ApplyOutcome {
        let mut indices = self.indices.write().await;
        if !accepts_seq(&indices, node_id, seq) {
            return ApplyOutcome::Stale;
        }
        for cap in &capabilities {
            if let Some(embedding) = &cap.representations.embedding {
                if embedding.len() != self.config.embedding_dim {
                    log::warn!(
                        "registry: dropping embedding for {} — dim {} != configured {}",
                        cap.key(),
                        embedding.len(),
                        self.config.embedding_dim
                    );
                }
            }
        }
        {
            let node = Self::ensure_node(&mut indices, node_id);
            for mut cap in capabilities {
                if let Some(embedding) = &cap.representations.embedding {
                    if embedding.len() != self.config.embedding_dim {
                        cap.representations.embedding = None;
                    }
                }
                node.capabilities.retain(|existing| existing.key() != cap.key());
                node.capabilities.push(cap);
            }
            node.last_seen = now_unix_s();
            node.seq = seq;
        }
        indices.reindex_node_capabilities(node_id);
        ApplyOutcome::Accepted
    }

    pub async fn apply_cost(&self, node_id: &str, cost: CostState, seq: u64) -> ApplyOutcome {
        let mut indices = self.indices.write().await;
        if !accepts_seq(&indices, node_id, seq) {
            return ApplyOutcome::Stale;
        }
        let node = Self::ensure_node(&mut indices, node_id);
        node.cost_state = Some(cost);
        node.last_seen = now_unix_s();
        node.seq = seq;
        ApplyOutcome::Accepted
    }

    pub async fn touch_node(&self, node_id: &str, seq: u64) -> ApplyOutcome {
        let mut indices = self.indices.write().await;
        if !accepts_seq(&indices, node_id, seq) {
            return ApplyOutcome::Stale;
        }
        let node = Self::ensure_node(&mut indices, node_id);
        node.last_seen = now_unix_s();
        node.seq = seq;
        ApplyOutcome::Accepted
    }

    pub async fn mark_departed(&self, node_id: &str, seq: u64) -> ApplyOutcome {
        let mut indices = self.indices.write().await;
        if !accepts_seq(&indices, node_id, seq) {
            return ApplyOutcome::Stale;
        }
        indices.by_node.remove(node_id);
        indices.reindex_node_capabilities(node_id);
        ApplyOutcome::Accepted
    }

    /// `lookup_nodes(capability_type, domain?)` — returns live and stale
    /// candidates alike; callers apply liveness filtering per their own
    /// tier logic (Tier 3 routes around stale peers with a penalty, not an
    /// exclusion).
    pub async fn lookup_nodes(
        &self,
        capability_type: &str,
        domain: Option<&str>,
    ) -> Vec<(Node, Capability)> {
        let indices = self.indices.read().await;
        let mut out = Vec::new();
        for node in indices.by_node.values() {
            for cap in &node.capabilities {
                if !cap.type_matches(capability_type) {
                    continue;
                }
                if let Some(wanted_domain) = domain {
                    let matches_domain = cap.domain.as_deref() == Some(wanted_domain);
                    let generalist = cap.domain.is_none();
                    if !matches_domain && !generalist {
                        continue;
                    }
                }
                out.push((node.clone(), cap.clone()));
            }
        }
        out
    }

    /// `all_capabilities(domain?)` — every capability across every known
    /// node, optionally restricted to one domain (generalists included).
    /// Backs capability discovery (§6) when the caller passes no type
    /// filter, where `lookup_nodes`'s type-wildcard matching doesn't apply.
    pub async fn all_capabilities(&self, domain: Option<&str>) -> Vec<(Node, Capability)> {
        let indices = self.indices.read().await;
        let mut out = Vec::new();
        for node in indices.by_node.values() {
            for cap in &node.capabilities {
                if let Some(wanted_domain) = domain {
                    let matches_domain = cap.domain.as_deref() == Some(wanted_domain);
                    let generalist = cap.domain.is_none();
                    if !matches_domain && !generalist {
                        continue;
                    }
                }
                out.push((node.clone(), cap.clone()));
            }
        }
        out
    }

    pub async fn get_node(&self, node_id: &str) -> Option<Node> {
        self.indices.read().await.by_node.get(node_id).cloned()
    }

    /// `snapshot_cost(node_id)` — `None` when unknown, `Some(Err(Stale))`
    /// when present but past `cost_stale_threshold_s` (§4.3).
    pub async fn snapshot_cost(&self, node_id: &str) -> Option<Result<CostState, Stale>> {
        let indices = self.indices.read().await;
        let node = indices.by_node.get(node_id)?;
        let cost = node.cost_state.clone()?;
        if cost.is_stale(self.config.cost_stale_threshold_s) {
            Some(Err(Stale))
        } else {
            Some(Ok(cost))
        }
    }

    pub async fn node_count(&self) -> usize {
        self.indices.read().await.by_node.len()
    }

    pub async fn evict_stale(&self, liveness_window_s: u64, eviction_window_s: u64) -> Vec<String> {
        use crate::gossip::{liveness_class, Liveness};

        let mut indices = self.indices.write().await;
        let to_remove: Vec<String> = indices
            .by_node
            .values()
            .filter(|n| {
                liveness_class(n, liveness_window_s, eviction_window_s) == Liveness::Evictable
            })
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &to_remove {
            indices.by_node.remove(node_id);
            indices.reindex_node_capabilities(node_id);
        }
        to_remove
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stale;

fn accepts_seq(indices: &Indices, node_id: &str, seq: u64) -> bool {
    match indices.by_node.get(node_id) {
        None => true,
        Some(node) => seq > node.seq || (seq == 0 && node.seq == 0),
    }
}
