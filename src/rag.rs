//! RAG escalation (§4.5): when local knowledge coverage for a domain is thin,
//! the router issues a secondary `rag/<domain>` intent through the
//! dispatcher rather than failing the original query outright. Recursion is
//! bounded to depth 1 — the secondary intent is never itself escalated.

use thiserror::Error;

use crate::dispatcher::Dispatcher;
use crate::knowledge::{KnowledgeError, KnowledgeStore};
use crate::types::{
    AccuracyPref, Intent, IntentCache, IntentPreferences, KnowledgeChunk, LatencyPref, LocalityPref,
};

#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
    #[error("remote rag escalation returned an undecodable payload")]
    BadRemotePayload,
}

pub struct RagResult {
    pub chunks: Vec<(KnowledgeChunk, f64)>,
    pub warnings: Vec<String>,
}

/// `search(query_embedding, domain, k, min_score)` with the escalation
/// behavior from §4.5: local results below `min_score` trigger one
/// `rag/<domain>` dispatch, and a same-shaped remote result set wins
/// whenever it outscores the local one.
pub async fn query(
    knowledge: &KnowledgeStore,
    dispatcher: &Dispatcher,
    intent_id_prefix: &str,
    domain: &str,
    query_embedding: &[f32],
    k: usize,
    min_score: f64,
) -> Result<RagResult, RagError> {
    let local = knowledge.search(query_embedding, domain, k, 0.0).await?;
    let local_best = local.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);

    if !local.is_empty() && local_best >= min_score {
        return Ok(RagResult { chunks: local, warnings: vec![] });
    }

    let remote = escalate(dispatcher, intent_id_prefix, domain, query_embedding, k).await;

    match remote {
        Ok(remote_chunks) if !remote_chunks.is_empty() => {
            let remote_best = remote_chunks.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
            let merged = if remote_best > local_best { remote_chunks } else { local };
            Ok(RagResult { chunks: merged, warnings: vec!["partial_local_coverage".into()] })
        }
        _ => Ok(RagResult { chunks: local, warnings: vec!["partial_local_coverage".into()] }),
    }
}

async fn escalate(
    dispatcher: &Dispatcher,
    intent_id_prefix: &str,
    domain: &str,
    query_embedding: &[f32],
    k: usize,
) -> Result<Vec<(KnowledgeChunk, f64)>, RagError> {
    let payload = serde_json::to_vec(&RemoteRagRequest { query_embedding: query_embedding.to_vec(), k })
        .map_err(|_| RagError::BadRemotePayload)?;

    let intent = Intent {
        id: format!("{intent_id_prefix}-rag-{domain}"),
        intent_type: format!("rag/{domain}"),
        domain: Some(domain.to_string()),
        payload,
        preferences: IntentPreferences {
            latency: LatencyPref::Normal,
            accuracy: AccuracyPref::High,
            locality: LocalityPref::Any,
        },
        cache: IntentCache::default(),
        deadline_ms: Some(5_000),
        payload_embedding: Some(query_embedding.to_vec()),
        payload_keywords: vec![],
    };

    let outcome = dispatcher.dispatch(&intent).await;
    let bytes = match outcome.result {
        Some(bytes) => bytes,
        None => return Ok(vec![]),
    };
    let remote: Vec<RemoteRagHit> =
        serde_json::from_slice(&bytes).map_err(|_| RagError::BadRemotePayload)?;
    Ok(remote.into_iter().map(|hit| (hit.chunk, hit.score)).collect())
}

#[derive(serde::Serialize)]
struct RemoteRagRequest {
    query_embedding: Vec<f32>,
    k: usize,
}

#[derive(serde::Deserialize)]
struct RemoteRagHit {
    chunk: KnowledgeChunk,
    score: f64,
}

#[derive(serde::Serialize)]
struct RemoteRagHitOut<'a> {
    chunk: &'a KnowledgeChunk,
    score: f64,
}

/// Helper for a `LocalHandler`/`RemoteTransport` implementation serving the
/// other side of a `rag/<domain>` intent: encodes this node's own search
/// results in the wire shape [`query`] expects to decode.
pub fn encode_rag_response(hits: &[(KnowledgeChunk, f64)]) -> Vec<u8> {
    let out: Vec<RemoteRagHitOut> =
        hits.iter().map(|(chunk, score)| RemoteRagHitOut { chunk, score: *score }).collect();
    serde_json::to_vec(&out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::dispatcher::{LocalHandler, RemoteTransport};
    use crate::knowledge::{checksum, run_migrations};
    use crate::registry::Registry;
    use crate::router::{IntentRouter, NoEmbedder};
    use crate::types::Capability;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    fn chunk(id: &str, domain: &str, embedding: Vec<f32>) -> KnowledgeChunk {
        let content = format!("content-{id}").into_bytes();
        let metadata = "{}".to_string();
        let cs = checksum(&content, &metadata, 1);
        KnowledgeChunk {
            id: id.into(),
            domain: domain.into(),
            doc_ref: format!("doc://{id}"),
            content_bytes: content,
            embedding,
            metadata,
            version: 1,
            checksum: cs,
        }
    }

    struct RemoteRagHandler {
        store: Arc<KnowledgeStore>,
    }

    #[async_trait::async_trait]
    impl RemoteTransport for RemoteRagHandler {
        async fn forward(&self, _node: &str, intent: &Intent, _cap: &str) -> Result<Vec<u8>, String> {
            let req: RemoteRagRequest =
                serde_json::from_slice(&intent.payload).map_err(|e| e.to_string())?;
            let domain = intent.domain.clone().unwrap_or_default();
            let hits = self
                .store
                .search(&req.query_embedding, &domain, req.k, 0.0)
                .await
                .map_err(|e| e.to_string())?;
            Ok(encode_rag_response(&hits))
        }
    }

    struct NeverLocal;
    #[async_trait::async_trait]
    impl LocalHandler for NeverLocal {
        async fn handle(&self, _intent: &Intent, _cap: &str) -> Result<Vec<u8>, String> {
            Err("no local rag handler".into())
        }
    }

    #[tokio::test]
    async fn thin_local_coverage_escalates_and_prefers_higher_remote_score() {
        let local_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        run_migrations(&local_pool).await.unwrap();
        let local_store =
            KnowledgeStore::new(local_pool, NodeConfig { node_id: "self".into(), ..Default::default() })
                .into_shared();
        local_store.apply_chunks(vec![chunk("weak", "wildlife", vec![0.9, 0.1, 0.0])]).await.unwrap();

        let remote_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        run_migrations(&remote_pool).await.unwrap();
        let remote_store =
            KnowledgeStore::new(remote_pool, NodeConfig { node_id: "peer".into(), ..Default::default() })
                .into_shared();
        remote_store.apply_chunks(vec![chunk("strong", "wildlife", vec![1.0, 0.0, 0.0])]).await.unwrap();

        let registry = Registry::new(NodeConfig { node_id: "self".into(), ..Default::default() });
        registry
            .apply_capabilities(
                "peer",
                vec![Capability {
                    cap_type: "rag/wildlife".into(),
                    domain: Some("wildlife".into()),
                    node_id: "peer".into(),
                    representations: Default::default(),
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
        let dispatcher = Dispatcher::new(
            router,
            Arc::new(NeverLocal),
            Arc::new(RemoteRagHandler { store: remote_store }),
            "self".into(),
            4,
        );

        let result =
            query(&local_store, &dispatcher, "q1", "wildlife", &[1.0, 0.0, 0.0], 5, 0.95).await.unwrap();

        assert!(result.warnings.contains(&"partial_local_coverage".to_string()));
        assert_eq!(result.chunks[0].0.id, "strong");
    }
}
