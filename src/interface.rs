//! External interface (§6): the response envelope a collaborating service
//! layer wraps around [`crate::dispatcher::Dispatcher`], plus capability
//! discovery over the registry snapshot. Serialization framing and auth are
//! the caller's concern — this module only shapes the typed request/response
//! records.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{DispatchStatus, Dispatcher};
use crate::registry::Registry;
use crate::types::{Capability, Intent, TierHit};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Completed,
    Failed,
    Timeout,
}

impl From<DispatchStatus> for IntentStatus {
    fn from(status: DispatchStatus) -> Self {
        match status {
            DispatchStatus::Completed => IntentStatus::Completed,
            DispatchStatus::Failed => IntentStatus::Failed,
            DispatchStatus::Timeout => IntentStatus::Timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResponse {
    pub id: String,
    pub status: IntentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    pub routed_to: Option<String>,
    pub tier_hit: Option<TierHit>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

/// Runs an [`Intent`] end to end through the dispatcher and shapes the
/// response envelope from §6. Never returns `Err` — dispatch failures are
/// carried as `status = failed` with a reason in `warnings`, per §7's
/// "never a raw exception payload" rule.
pub async fn submit_intent(dispatcher: &Dispatcher, intent: &Intent) -> IntentResponse {
    let started = Instant::now();
    let outcome = dispatcher.dispatch(intent).await;
    IntentResponse {
        id: intent.id.clone(),
        status: outcome.status.into(),
        result: outcome.result,
        routed_to: outcome.routed_to,
        tier_hit: outcome.tier_hit,
        latency_ms: started.elapsed().as_millis() as u64,
        warnings: outcome.warnings,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub cap_type: Option<String>,
    pub domain: Option<String>,
}

/// `list(filter)` (§6): a read-only capability listing derived from the
/// registry snapshot — no caching, no side effects.
pub async fn list_capabilities(registry: &Registry, filter: CapabilityFilter) -> Vec<Capability> {
    let candidates = match &filter.cap_type {
        Some(cap_type) => registry.lookup_nodes(cap_type, filter.domain.as_deref()).await,
        None => registry.all_capabilities(filter.domain.as_deref()).await,
    };
    candidates.into_iter().map(|(_, cap)| cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::dispatcher::{LocalHandler, RemoteTransport};
    use crate::router::{IntentRouter, NoEmbedder};
    use crate::types::{AccuracyPref, IntentCache, IntentPreferences, LatencyPref, LocalityPref, Representations};
    use std::sync::Arc;

    struct Echo;
    #[async_trait::async_trait]
    impl LocalHandler for Echo {
        async fn handle(&self, _intent: &Intent, _capability_key: &str) -> Result<Vec<u8>, String> {
            Ok(b"done".to_vec())
        }
    }

    struct Unreachable;
    #[async_trait::async_trait]
    impl RemoteTransport for Unreachable {
        async fn forward(&self, _n: &str, _i: &Intent, _c: &str) -> Result<Vec<u8>, String> {
            Err("unreachable in test".into())
        }
    }

    #[tokio::test]
    async fn submit_intent_shapes_completed_envelope() {
        let registry = Registry::new(NodeConfig { node_id: "self".into(), ..Default::default() });
        registry
            .apply_capabilities(
                "self",
                vec![Capability {
                    cap_type: "tool/camera".into(),
                    domain: None,
                    node_id: "self".into(),
                    representations: Representations::default(),
                    constraints: vec![],
                }],
                1,
            )
            .await;
        let router = Arc::new(IntentRouter::new(
            NodeConfig { node_id: "self".into(), ..Default::default() },
            registry.into_shared(),
            Box::new(NoEmbedder),
        ));
        let dispatcher = Dispatcher::new(router, Arc::new(Echo), Arc::new(Unreachable), "self".into(), 4);

        let intent = Intent {
            id: "i1".into(),
            intent_type: "tool/camera".into(),
            domain: None,
            payload: vec![],
            preferences: IntentPreferences {
                latency: LatencyPref::Normal,
                accuracy: AccuracyPref::BestEffort,
                locality: LocalityPref::Any,
            },
            cache: IntentCache::default(),
            deadline_ms: Some(5_000),
            payload_embedding: None,
            payload_keywords: vec![],
        };

        let response = submit_intent(&dispatcher, &intent).await;
        assert_eq!(response.status, IntentStatus::Completed);
        assert_eq!(response.result, Some(b"done".to_vec()));
        assert_eq!(response.routed_to.as_deref(), Some("self"));
    }

    #[tokio::test]
    async fn list_capabilities_filters_by_domain() {
        let registry = Registry::new(NodeConfig { node_id: "self".into(), ..Default::default() });
        registry
            .apply_capabilities(
                "a",
                vec![Capability {
                    cap_type: "vision/classify".into(),
                    domain: Some("wildlife".into()),
                    node_id: "a".into(),
                    representations: Representations::default(),
                    constraints: vec![],
                }],
                1,
            )
            .await;

        let hits = list_capabilities(
            &registry,
            CapabilityFilter { cap_type: Some("vision/classify".into()), domain: Some("wildlife".into()) },
        )
        .await;
        assert_eq!(hits.len(), 1);

        let misses = list_capabilities(
            &registry,
            CapabilityFilter { cap_type: Some("vision/classify".into()), domain: Some("other".into()) },
        )
        .await;
        assert!(misses.is_empty());
    }
}
