//! Typed node configuration.
//!
//! A node is always constructed from a [`NodeConfig`] — no subsystem reaches
//! for an environment variable or a lazy default on its own. Every field has
//! a default so `NodeConfig { node_id: "n1".into(), ..Default::default() }`
//! (or a bare `{}` over JSON) produces a runnable node.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-domain knowledge budget and replication priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainLimit {
    pub max_bytes: u64,
    pub max_chunks: u64,
    /// Higher priority domains are synced first and evicted last.
    pub priority: u8,
}

impl Default for DomainLimit {
    fn default() -> Self {
        DomainLimit {
            max_bytes: 64 * 1024 * 1024,
            max_chunks: 50_000,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub display_name: String,

    #[serde(default = "defaults::gossip_interval_s")]
    pub gossip_interval_s: u64,
    #[serde(default = "defaults::gossip_fanout_k")]
    pub gossip_fanout_k: usize,
    #[serde(default = "defaults::liveness_window_s")]
    pub liveness_window_s: u64,
    #[serde(default = "defaults::eviction_window_s")]
    pub eviction_window_s: u64,

    #[serde(default = "defaults::cost_stale_threshold_s")]
    pub cost_stale_threshold_s: u64,

    #[serde(default = "defaults::cache_ttl_exact_s")]
    pub cache_ttl_exact_s: u64,
    #[serde(default = "defaults::cache_ttl_semantic_s")]
    pub cache_ttl_semantic_s: u64,
    #[serde(default = "defaults::simhash_hamming_max")]
    pub simhash_hamming_max: u32,

    #[serde(default = "defaults::budget_sensitivity")]
    pub budget_sensitivity: f64,

    #[serde(default = "defaults::knowledge_budget_bytes")]
    pub knowledge_budget_bytes: u64,
    #[serde(default)]
    pub per_domain_limits: HashMap<String, DomainLimit>,
    #[serde(default)]
    pub subscriptions: Vec<String>,

    #[serde(default)]
    pub embedder_available: bool,
    /// Dimensionality of dense embeddings this deployment has standardized
    /// on. See SPEC_FULL.md's resolution of the embedding-dimensionality
    /// open question: configured, never inferred.
    #[serde(default = "defaults::embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default = "defaults::dispatcher_workers")]
    pub dispatcher_workers: usize,
}

mod defaults {
    pub fn gossip_interval_s() -> u64 {
        5
    }
    pub fn gossip_fanout_k() -> usize {
        3
    }
    pub fn liveness_window_s() -> u64 {
        gossip_interval_s() * 5
    }
    pub fn eviction_window_s() -> u64 {
        liveness_window_s() * 3
    }
    pub fn cost_stale_threshold_s() -> u64 {
        120
    }
    pub fn cache_ttl_exact_s() -> u64 {
        60
    }
    pub fn cache_ttl_semantic_s() -> u64 {
        3600
    }
    pub fn simhash_hamming_max() -> u32 {
        3
    }
    pub fn budget_sensitivity() -> f64 {
        1.0
    }
    pub fn knowledge_budget_bytes() -> u64 {
        512 * 1024 * 1024
    }
    pub fn embedding_dim() -> usize {
        384
    }
    pub fn dispatcher_workers() -> usize {
        4
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: String::new(),
            display_name: String::new(),
            gossip_interval_s: defaults::gossip_interval_s(),
            gossip_fanout_k: defaults::gossip_fanout_k(),
            liveness_window_s: defaults::liveness_window_s(),
            eviction_window_s: defaults::eviction_window_s(),
            cost_stale_threshold_s: defaults::cost_stale_threshold_s(),
            cache_ttl_exact_s: defaults::cache_ttl_exact_s(),
            cache_ttl_semantic_s: defaults::cache_ttl_semantic_s(),
            simhash_hamming_max: defaults::simhash_hamming_max(),
            budget_sensitivity: defaults::budget_sensitivity(),
            knowledge_budget_bytes: defaults::knowledge_budget_bytes(),
            per_domain_limits: HashMap::new(),
            subscriptions: Vec::new(),
            embedder_available: false,
            embedding_dim: defaults::embedding_dim(),
            dispatcher_workers: defaults::dispatcher_workers(),
        }
    }
}

impl NodeConfig {
    pub fn domain_limit(&self, domain: &str) -> DomainLimit {
        self.per_domain_limits
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }
}
