//! Core data model: nodes, capabilities, intents, and knowledge records.
//!
//! These types are deliberately dumb — construction, validation and
//! mutation discipline live in [`crate::registry`], [`crate::router`] and
//! [`crate::knowledge`]. Payloads stay opaque bytes; nothing in this module
//! parses intent or chunk content.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ─── Node ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    pub cost_state: Option<CostState>,
    pub last_seen: u64,
    pub endpoints: Vec<String>,
    /// Highest gossip `seq` accepted from this node so far (monotone).
    pub seq: u64,
}

impl Node {
    pub fn is_live(&self, liveness_window_s: u64) -> bool {
        now_unix_s().saturating_sub(self.last_seen) <= liveness_window_s
    }
}

// ─── Capability ──────────────────────────────────────────────────────────────

/// `{type, domain?, node_id, representations, constraints}` — addressable
/// as `"{type}@{node_id}"`, unique by that pair (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub cap_type: String,
    pub domain: Option<String>,
    pub node_id: String,
    pub representations: Representations,
    pub constraints: Vec<String>,
}

impl Capability {
    pub fn key(&self) -> String {
        format!("{}@{}", self.cap_type, self.node_id)
    }

    /// Type-inheritance match used by Tier 3: `vision/*` matches
    /// `vision/classify`.
    pub fn type_matches(&self, wanted: &str) -> bool {
        if self.cap_type == wanted {
            return true;
        }
        if let Some(prefix) = wanted.strip_suffix("/*") {
            return self.cap_type.starts_with(prefix)
                && self.cap_type.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        if let Some(prefix) = self.cap_type.strip_suffix("/*") {
            return wanted.starts_with(prefix)
                && wanted.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        false
    }
}

/// Up to four representations a capability may gossip. `embedding` must be
/// byte-identical across peers that hold it (§3 invariant) — never
/// re-embedded in transit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Representations {
    pub embedding: Option<Vec<f32>>,
    pub simhash: Option<u64>,
    pub keywords: Vec<String>,
    pub domain_tag: Option<String>,
}

// ─── CostState ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostState {
    pub on_battery: bool,
    pub battery_pct: Option<f64>,
    pub cpu_load: f64,
    pub gpu_load_pct: Option<f64>,
    pub mem_pct: f64,
    pub bandwidth_mbps: Option<f64>,
    pub metered: bool,
    pub latency_ms: Option<f64>,
    pub api_model: Option<String>,
    pub overall_cost: f64,
    pub sampled_at: u64,
}

impl CostState {
    pub fn is_stale(&self, stale_threshold_s: u64) -> bool {
        now_unix_s().saturating_sub(self.sampled_at) > stale_threshold_s
    }
}

// ─── Intent / RouteDecision ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyPref {
    Low,
    Normal,
    HighQuality,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AccuracyPref {
    BestEffort,
    High,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LocalityPref {
    Local,
    Any,
    PreferLocal,
    SpecificNode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentPreferences {
    pub latency: LatencyPref,
    pub accuracy: AccuracyPref,
    pub locality: LocalityPref,
}

impl Default for IntentPreferences {
    fn default() -> Self {
        IntentPreferences {
            latency: LatencyPref::Normal,
            accuracy: AccuracyPref::BestEffort,
            locality: LocalityPref::Any,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntentCache {
    pub key: Option<String>,
    pub ttl_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub id: String,
    pub intent_type: String,
    pub domain: Option<String>,
    /// Opaque to the router; never parsed here.
    pub payload: Vec<u8>,
    pub preferences: IntentPreferences,
    pub cache: IntentCache,
    pub deadline_ms: Option<u64>,
    /// Pre-computed embedding, when the caller has already run its own
    /// embedder (lets edge nodes skip Tier 4's embed-on-the-fly step).
    pub payload_embedding: Option<Vec<f32>>,
    pub payload_keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TierHit {
    Exact,
    Semantic,
    Keyword,
    Rerank,
    Cost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDecision {
    pub intent_id: String,
    pub node_id: String,
    pub capability_key: String,
    pub tier_hit: TierHit,
    pub score: f64,
    pub reason: String,
}

// ─── Knowledge model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeDomain {
    pub id: String,
    pub version: u64,
    pub chunking_policy: String,
    pub embedding_model: String,
    pub distribution_rules: String,
    pub security: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeChunk {
    pub id: String,
    pub domain: String,
    pub doc_ref: String,
    pub content_bytes: Vec<u8>,
    pub embedding: Vec<f32>,
    pub metadata: String,
    pub version: u64,
    pub checksum: String,
}

/// `[(chunk_id, version, truncated_checksum)]` plus per-batch rollup
/// checksums, used to compute `{added, updated, removed}` between two
/// snapshots without shipping full chunk content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainManifest {
    pub domain: String,
    pub version: u64,
    pub entries: Vec<ManifestEntry>,
    pub batch_rollups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub chunk_id: String,
    pub version: u64,
    pub truncated_checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl DomainManifest {
    /// `local.diff(remote)` — entries present in `remote` but not `self`
    /// are `added`; present in both with a different checksum are
    /// `updated`; present in `self` but missing from `remote` are
    /// `removed`.
    pub fn diff(&self, remote: &DomainManifest) -> ManifestDiff {
        use std::collections::HashMap;

        let local_by_id: HashMap<&str, &ManifestEntry> =
            self.entries.iter().map(|e| (e.chunk_id.as_str(), e)).collect();
        let remote_by_id: HashMap<&str, &ManifestEntry> = remote
            .entries
            .iter()
            .map(|e| (e.chunk_id.as_str(), e))
            .collect();

        let mut diff = ManifestDiff::default();
        for (id, remote_entry) in &remote_by_id {
            match local_by_id.get(id) {
                None => diff.added.push(id.to_string()),
                Some(local_entry) => {
                    if local_entry.truncated_checksum != remote_entry.truncated_checksum
                        || local_entry.version != remote_entry.version
                    {
                        diff.updated.push(id.to_string());
                    }
                }
            }
        }
        for id in local_by_id.keys() {
            if !remote_by_id.contains_key(id) {
                diff.removed.push(id.to_string());
            }
        }
        diff
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSyncState {
    Syncing,
    Full,
    Partial,
    Stale,
    Offline,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeKnowledgeState {
    pub domain: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub chunks_local: u64,
    pub chunks_pending: u64,
    pub storage_bytes: u64,
    pub state: KnowledgeSyncState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_key_is_type_at_node() {
        let cap = Capability {
            cap_type: "vision/classify".into(),
            domain: None,
            node_id: "n1".into(),
            representations: Representations::default(),
            constraints: vec![],
        };
        assert_eq!(cap.key(), "vision/classify@n1");
    }

    #[test]
    fn wildcard_type_match_is_two_level_only() {
        let cap = Capability {
            cap_type: "vision/classify".into(),
            domain: None,
            node_id: "n1".into(),
            representations: Representations::default(),
            constraints: vec![],
        };
        assert!(cap.type_matches("vision/*"));
        assert!(cap.type_matches("vision/classify"));
        assert!(!cap.type_matches("audio/*"));
        assert!(!cap.type_matches("vision/classify/extra"));
    }

    #[test]
    fn manifest_diff_finds_added_updated_removed() {
        let local = DomainManifest {
            domain: "wildlife".into(),
            version: 41,
            entries: vec![
                ManifestEntry { chunk_id: "a".into(), version: 1, truncated_checksum: "aa".into() },
                ManifestEntry { chunk_id: "b".into(), version: 1, truncated_checksum: "bb".into() },
            ],
            batch_rollups: vec![],
        };
        let remote = DomainManifest {
            domain: "wildlife".into(),
            version: 42,
            entries: vec![
                ManifestEntry { chunk_id: "a".into(), version: 1, truncated_checksum: "aa".into() },
                ManifestEntry { chunk_id: "b".into(), version: 2, truncated_checksum: "bb2".into() },
                ManifestEntry { chunk_id: "c".into(), version: 1, truncated_checksum: "cc".into() },
            ],
            batch_rollups: vec![],
        };
        let diff = local.diff(&remote);
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.updated, vec!["b".to_string()]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn empty_diff_is_empty() {
        let m = DomainManifest {
            domain: "d".into(),
            version: 1,
            entries: vec![ManifestEntry {
                chunk_id: "a".into(),
                version: 1,
                truncated_checksum: "aa".into(),
            }],
            batch_rollups: vec![],
        };
        assert!(m.diff(&m.clone()).is_empty());
    }
}
