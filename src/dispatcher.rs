//! Dispatcher: executes a [`RouteDecision`] locally or forwards it to the
//! remote node, with bounded retries and a TTL result cache (§4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::router::{IntentRouter, RouterError};
use crate::types::{Intent, RouteDecision};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("local handler failed: {0}")]
    HandlerFailed(String),
    #[error("dispatcher work queue is full")]
    Overloaded,
    #[error("remote dispatch timed out")]
    Timeout,
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Runs a [`RouteDecision`] either in-process or against a remote peer.
/// Transport is opaque (§6) — this crate only needs request/response with a
/// deadline and a trusted `sender`.
#[async_trait::async_trait]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, intent: &Intent, capability_key: &str) -> Result<Vec<u8>, String>;
}

#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn forward(
        &self,
        node_id: &str,
        intent: &Intent,
        capability_key: &str,
    ) -> Result<Vec<u8>, String>;
}

struct CachedResult {
    result: Vec<u8>,
    expires_at: Instant,
}

/// Result cache keyed by `intent.cache.key`, honoring `intent.cache.ttl`
/// (§4.6). A bounded semaphore stands in for the "bounded work queue"
/// backpressure requirement from §5 — once exhausted, dispatch returns
/// `Overloaded` rather than queuing unbounded work.
pub struct Dispatcher {
    router: Arc<IntentRouter>,
    local: Arc<dyn LocalHandler>,
    remote: Arc<dyn RemoteTransport>,
    result_cache: RwLock<HashMap<String, CachedResult>>,
    inflight: Arc<tokio::sync::Semaphore>,
    self_node_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub result: Option<Vec<u8>>,
    pub routed_to: Option<String>,
    pub tier_hit: Option<crate::types::TierHit>,
    pub warnings: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<IntentRouter>,
        local: Arc<dyn LocalHandler>,
        remote: Arc<dyn RemoteTransport>,
        self_node_id: String,
        max_inflight: usize,
    ) -> Self {
        Dispatcher {
            router,
            local,
            remote,
            result_cache: RwLock::new(HashMap::new()),
            inflight: Arc::new(tokio::sync::Semaphore::new(max_inflight)),
            self_node_id,
        }
    }

    pub async fn dispatch(&self, intent: &Intent) -> DispatchOutcome {
        if let Some(key) = &intent.cache.key {
            if let Some(cached) = self.cached_result(key).await {
                return DispatchOutcome {
                    status: DispatchStatus::Completed,
                    result: Some(cached),
                    routed_to: None,
                    tier_hit: None,
                    warnings: vec![],
                };
            }
        }

        let Ok(_permit) = self.inflight.clone().try_acquire_owned() else {
            return DispatchOutcome {
                status: DispatchStatus::Failed,
                result: None,
                routed_to: None,
                tier_hit: None,
                warnings: vec!["overloaded".into()],
            };
        };

        let deadline = Duration::from_millis(intent.deadline_ms.unwrap_or(30_000));
        let mut excluded: Vec<String> = Vec::new();
        let mut warnings = Vec::new();

        for attempt in 0..=2u8 {
            let decision = match self.route_excluding(intent, &excluded).await {
                Ok(d) => d,
                Err(_) if attempt > 0 => {
                    warnings.push("degraded_tier_hit".into());
                    return DispatchOutcome {
                        status: DispatchStatus::Failed,
                        result: None,
                        routed_to: None,
                        tier_hit: None,
                        warnings,
                    };
                }
                Err(_) => {
                    return DispatchOutcome {
                        status: DispatchStatus::Failed,
                        result: None,
                        routed_to: None,
                        tier_hit: None,
                        warnings,
                    };
                }
            };

            let run = async {
                if decision.node_id == self.self_node_id {
                    self.local
                        .handle(intent, &decision.capability_key)
                        .await
                        .map_err(DispatchError::HandlerFailed)
                } else {
                    self.remote
                        .forward(&decision.node_id, intent, &decision.capability_key)
                        .await
                        .map_err(DispatchError::HandlerFailed)
                }
            };

            match timeout(deadline, run).await {
                Ok(Ok(bytes)) => {
                    if let (Some(key), Some(ttl)) = (&intent.cache.key, intent.cache.ttl_s) {
                        self.store_result(key, bytes.clone(), Duration::from_secs(ttl)).await;
                    }
                    return DispatchOutcome {
                        status: DispatchStatus::Completed,
                        result: Some(bytes),
                        routed_to: Some(decision.node_id),
                        tier_hit: Some(decision.tier_hit),
                        warnings,
                    };
                }
                Ok(Err(e)) => {
                    if decision.node_id == self.self_node_id {
                        return DispatchOutcome {
                            status: DispatchStatus::Failed,
                            result: None,
                            routed_to: Some(decision.node_id),
                            tier_hit: Some(decision.tier_hit),
                            warnings: vec![e.to_string()],
                        };
                    }
                    log::warn!("dispatcher: node {} failed, retrying: {e}", decision.node_id);
                    excluded.push(decision.node_id);
                }
                Err(_) => {
                    return DispatchOutcome {
                        status: DispatchStatus::Timeout,
                        result: None,
                        routed_to: Some(decision.node_id),
                        tier_hit: Some(decision.tier_hit),
                        warnings,
                    };
                }
            }
        }

        DispatchOutcome {
            status: DispatchStatus::Failed,
            result: None,
            routed_to: None,
            tier_hit: None,
            warnings,
        }
    }

    /// Re-queries the router excluding previously-failed nodes (§4.6: up to
    /// 2 retries across distinct nodes).
    async fn route_excluding(
        &self,
        intent: &Intent,
        excluded: &[String],
    ) -> Result<RouteDecision, RouterError> {
        self.router.route_excluding(intent, excluded).await
    }

    async fn cached_result(&self, key: &str) -> Option<Vec<u8>> {
        let mut cache = self.result_cache.write().await;
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn store_result(&self, key: &str, result: Vec<u8>, ttl: Duration) {
        self.result_cache
            .write()
            .await
            .insert(key.to_string(), CachedResult { result, expires_at: Instant::now() + ttl });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::registry::Registry;
    use crate::types::{AccuracyPref, Capability, IntentCache, IntentPreferences, LatencyPref, LocalityPref, Representations};

    struct AlwaysOkHandler;
    #[async_trait::async_trait]
    impl LocalHandler for AlwaysOkHandler {
        async fn handle(&self, _intent: &Intent, _capability_key: &str) -> Result<Vec<u8>, String> {
            Ok(b"ok".to_vec())
        }
    }

    struct NeverCalledRemote;
    #[async_trait::async_trait]
    impl RemoteTransport for NeverCalledRemote {
        async fn forward(&self, _n: &str, _i: &Intent, _c: &str) -> Result<Vec<u8>, String> {
            Err("should not be called in local-only test".into())
        }
    }

    fn intent(id: &str) -> Intent {
        Intent {
            id: id.into(),
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
        }
    }

    #[tokio::test]
    async fn dispatches_locally_when_decision_targets_self() {
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
            Box::new(crate::router::NoEmbedder),
        ));
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(AlwaysOkHandler),
            Arc::new(NeverCalledRemote),
            "self".into(),
            4,
        );

        let outcome = dispatcher.dispatch(&intent("i1")).await;
        assert_eq!(outcome.status, DispatchStatus::Completed);
        assert_eq!(outcome.result, Some(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn result_cache_short_circuits_dispatch() {
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
            Box::new(crate::router::NoEmbedder),
        ));
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(AlwaysOkHandler),
            Arc::new(NeverCalledRemote),
            "self".into(),
            4,
        );

        let mut i = intent("i1");
        i.cache.key = Some("result-key".into());
        i.cache.ttl_s = Some(60);
        let first = dispatcher.dispatch(&i).await;
        assert_eq!(first.status, DispatchStatus::Completed);

        let second = dispatcher.dispatch(&i).await;
        assert_eq!(second.status, DispatchStatus::Completed);
        assert_eq!(second.result, first.result);
    }

    struct FailsFor {
        bad_node: String,
    }
    #[async_trait::async_trait]
    impl RemoteTransport for FailsFor {
        async fn forward(&self, n: &str, _i: &Intent, _c: &str) -> Result<Vec<u8>, String> {
            if n == self.bad_node {
                Err("node unreachable".into())
            } else {
                Ok(format!("handled-by-{n}").into_bytes())
            }
        }
    }

    struct NeverCalledLocal;
    #[async_trait::async_trait]
    impl LocalHandler for NeverCalledLocal {
        async fn handle(&self, _intent: &Intent, _capability_key: &str) -> Result<Vec<u8>, String> {
            Err("should not be called when both candidates are remote".into())
        }
    }

    #[tokio::test]
    async fn retries_with_a_distinct_node_after_remote_failure() {
        let registry = Registry::new(NodeConfig { node_id: "self".into(), ..Default::default() });
        for id in ["a", "b"] {
            registry
                .apply_capabilities(
                    id,
                    vec![Capability {
                        cap_type: "tool/camera".into(),
                        domain: None,
                        node_id: id.into(),
                        representations: Representations::default(),
                        constraints: vec![],
                    }],
                    1,
                )
                .await;
        }
        let router = Arc::new(IntentRouter::new(
            NodeConfig { node_id: "self".into(), ..Default::default() },
            registry.into_shared(),
            Box::new(crate::router::NoEmbedder),
        ));
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(NeverCalledLocal),
            Arc::new(FailsFor { bad_node: "a".into() }),
            "self".into(),
            4,
        );

        // Tie-broken cost-weighted selection always prefers "a" first; the
        // retry must exclude it and land on "b" rather than repeating "a"
        // from the now-cached Tier 1 decision.
        let outcome = dispatcher.dispatch(&intent("i1")).await;
        assert_eq!(outcome.status, DispatchStatus::Completed);
        assert_eq!(outcome.routed_to.as_deref(), Some("b"));
        assert_eq!(outcome.result, Some(b"handled-by-b".to_vec()));
    }
}
