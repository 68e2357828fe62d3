//! Knowledge store & sync (§4.5): a content-addressable chunk store backed
//! by an embedded SQLite read model, a companion HNSW approximate-k-NN
//! vector index per domain, and the pull-based manifest/diff sync protocol.

use std::collections::HashMap;
use std::sync::Arc;

use hnsw_rs::prelude::*;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{DomainLimit, NodeConfig};
use crate::types::{
    now_unix_s, DomainManifest, KnowledgeChunk, KnowledgeSyncState, ManifestEntry,
    NodeKnowledgeState,
};

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("no subscription covers domain {0}")]
    DomainMissing(String),
    #[error("chunk {0} failed checksum verification")]
    ChecksumMismatch(String),
}

pub fn checksum(content_bytes: &[u8], metadata: &str, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_bytes);
    hasher.update(metadata.as_bytes());
    hasher.update(version.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub fn truncated_checksum(full: &str) -> String {
    full.chars().take(12).collect()
}

/// Creates the knowledge-store tables. Idempotent — safe to call on every
/// startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), KnowledgeError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_chunks (
            chunk_id     TEXT PRIMARY KEY,
            domain       TEXT NOT NULL,
            doc_ref      TEXT NOT NULL,
            content      BLOB NOT NULL,
            embedding    TEXT NOT NULL,
            metadata     TEXT NOT NULL,
            version      INTEGER NOT NULL,
            checksum     TEXT NOT NULL,
            last_queried INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_domain ON knowledge_chunks(domain);

        CREATE TABLE IF NOT EXISTS knowledge_domains (
            domain_id  TEXT PRIMARY KEY,
            version    INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

struct DomainIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    id_to_chunk: HashMap<usize, String>,
    chunk_to_id: HashMap<String, usize>,
    next_id: usize,
}

impl DomainIndex {
    fn new(max_elements: usize) -> Self {
        let nb_layer = 16usize.min((max_elements as f32).ln().trunc() as usize).max(1);
        DomainIndex {
            hnsw: Hnsw::<f32, DistCosine>::new(16, max_elements.max(16), nb_layer, 200, DistCosine),
            id_to_chunk: HashMap::new(),
            chunk_to_id: HashMap::new(),
            next_id: 0,
        }
    }

    fn upsert(&mut self, chunk_id: &str, embedding: &[f32]) {
        if embedding.is_empty() {
            return;
        }
        let id = *self.chunk_to_id.entry(chunk_id.to_string()).or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            id
        });
        self.id_to_chunk.insert(id, chunk_id.to_string());
        self.hnsw.insert((embedding, id));
    }

    fn remove(&mut self, chunk_id: &str) {
        if let Some(id) = self.chunk_to_id.remove(chunk_id) {
            self.id_to_chunk.remove(&id);
            // hnsw_rs has no point-deletion API; the stale entry is simply
            // never surfaced again because `id_to_chunk` no longer resolves
            // it, and it gets dropped for good on the next full rebuild.
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f64)> {
        self.hnsw
            .search(query, k, 64)
            .into_iter()
            .filter_map(|neighbour| {
                let chunk_id = self.id_to_chunk.get(&neighbour.d_id)?;
                let score = 1.0 - neighbour.distance as f64;
                Some((chunk_id.clone(), score))
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.chunk_to_id.len()
    }
}

pub struct KnowledgeStore {
    pool: SqlitePool,
    config: NodeConfig,
    indices: Mutex<HashMap<String, DomainIndex>>,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool, config: NodeConfig) -> Self {
        KnowledgeStore { pool, config, indices: Mutex::new(HashMap::new()) }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn domain_limit(&self, domain: &str) -> DomainLimit {
        self.config.domain_limit(domain)
    }

    async fn with_domain_index<F, R>(&self, domain: &str, f: F) -> R
    where
        F: FnOnce(&mut DomainIndex) -> R,
    {
        let mut indices = self.indices.lock().await;
        let limit = self.domain_limit(domain);
        let index = indices
            .entry(domain.to_string())
            .or_insert_with(|| DomainIndex::new(limit.max_chunks as usize));
        f(index)
    }

    /// Verifies each chunk's checksum, then inserts/updates it in the
    /// durable store and the in-memory vector index (§4.5 step 5, APPLY).
    pub async fn apply_chunks(&self, chunks: Vec<KnowledgeChunk>) -> Result<usize, KnowledgeError> {
        let mut applied = 0usize;
        for chunk in chunks {
            let expected = checksum(&chunk.content_bytes, &chunk.metadata, chunk.version);
            if expected != chunk.checksum {
                log::warn!("knowledge: checksum mismatch for chunk {}", chunk.id);
                return Err(KnowledgeError::ChecksumMismatch(chunk.id));
            }

            let embedding_json = serde_json::to_string(&chunk.embedding).unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks
                    (chunk_id, domain, doc_ref, content, embedding, metadata, version, checksum, last_queried)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    domain=excluded.domain, doc_ref=excluded.doc_ref, content=excluded.content,
                    embedding=excluded.embedding, metadata=excluded.metadata,
                    version=excluded.version, checksum=excluded.checksum
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.domain)
            .bind(&chunk.doc_ref)
            .bind(&chunk.content_bytes)
            .bind(&embedding_json)
            .bind(&chunk.metadata)
            .bind(chunk.version as i64)
            .bind(&chunk.checksum)
            .bind(now_unix_s() as i64)
            .execute(&self.pool)
            .await?;

            self.with_domain_index(&chunk.domain, |idx| idx.upsert(&chunk.id, &chunk.embedding))
                .await;
            applied += 1;
        }
        Ok(applied)
    }

    pub async fn remove_chunks(&self, domain: &str, ids: &[String]) -> Result<(), KnowledgeError> {
        for id in ids {
            sqlx::query("DELETE FROM knowledge_chunks WHERE chunk_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        self.with_domain_index(domain, |idx| {
            for id in ids {
                idx.remove(id);
            }
        })
        .await;
        Ok(())
    }

    pub async fn set_domain_version(&self, domain: &str, version: u64) -> Result<(), KnowledgeError> {
        sqlx::query(
            "INSERT INTO knowledge_domains (domain_id, version) VALUES (?, ?)
             ON CONFLICT(domain_id) DO UPDATE SET version=excluded.version",
        )
        .bind(domain)
        .bind(version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn domain_version(&self, domain: &str) -> Result<u64, KnowledgeError> {
        let row = sqlx::query("SELECT version FROM knowledge_domains WHERE domain_id = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64).unwrap_or(0))
    }

    /// Builds a [`DomainManifest`] from the locally stored chunks — used
    /// both to answer a peer's `GET_MANIFEST` and to diff against a
    /// remote manifest during sync.
    pub async fn local_manifest(&self, domain: &str) -> Result<DomainManifest, KnowledgeError> {
        let rows = sqlx::query("SELECT chunk_id, version, checksum FROM knowledge_chunks WHERE domain = ?")
            .bind(domain)
            .fetch_all(&self.pool)
            .await?;
        let entries = rows
            .into_iter()
            .map(|row| ManifestEntry {
                chunk_id: row.get("chunk_id"),
                version: row.get::<i64, _>("version") as u64,
                truncated_checksum: truncated_checksum(&row.get::<String, _>("checksum")),
            })
            .collect();
        Ok(DomainManifest {
            domain: domain.to_string(),
            version: self.domain_version(domain).await?,
            entries,
            batch_rollups: vec![],
        })
    }

    /// Runs the pull-based sync protocol (§4.5 steps 3-6) against an
    /// already-fetched remote manifest and a chunk-fetch callback. The
    /// transport itself (steps 1/2/4's wire exchange) is the caller's
    /// concern — this is the diff/apply/announce core.
    pub async fn sync_from_manifest<F, Fut>(
        &self,
        domain: &str,
        remote: &DomainManifest,
        fetch_chunks: F,
    ) -> Result<NodeKnowledgeState, KnowledgeError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<KnowledgeChunk>, KnowledgeError>>,
    {
        let local = self.local_manifest(domain).await?;
        let diff = local.diff(remote);

        if diff.is_empty() {
            let count = self.chunk_count(domain).await?;
            return Ok(NodeKnowledgeState {
                domain: domain.to_string(),
                local_version: local.version,
                remote_version: remote.version,
                chunks_local: count,
                chunks_pending: 0,
                storage_bytes: self.storage_bytes(domain).await?,
                state: KnowledgeSyncState::Full,
            });
        }

        let mut wanted = diff.added.clone();
        wanted.extend(diff.updated.clone());
        if !wanted.is_empty() {
            let chunks = fetch_chunks(wanted).await?;
            self.apply_chunks(chunks).await?;
        }
        if !diff.removed.is_empty() {
            self.remove_chunks(domain, &diff.removed).await?;
        }
        self.set_domain_version(domain, remote.version).await?;

        let count = self.chunk_count(domain).await?;
        let total_remote = remote.entries.len() as u64;
        let state = if count >= total_remote {
            KnowledgeSyncState::Full
        } else {
            KnowledgeSyncState::Partial
        };

        Ok(NodeKnowledgeState {
            domain: domain.to_string(),
            local_version: remote.version,
            remote_version: remote.version,
            chunks_local: count,
            chunks_pending: total_remote.saturating_sub(count),
            storage_bytes: self.storage_bytes(domain).await?,
            state,
        })
    }

    pub async fn chunk_count(&self, domain: &str) -> Result<u64, KnowledgeError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM knowledge_chunks WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    pub async fn storage_bytes(&self, domain: &str) -> Result<u64, KnowledgeError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(LENGTH(content)), 0) AS n FROM knowledge_chunks WHERE domain = ?",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// `search(query_embedding, domain, k, min_score)` (§4.5). Returns an
    /// empty vec (rather than an error) when the domain index is empty —
    /// the router decides whether that warrants remote escalation.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        domain: &str,
        k: usize,
        min_score: f64,
    ) -> Result<Vec<(KnowledgeChunk, f64)>, KnowledgeError> {
        let hits = self.with_domain_index(domain, |idx| idx.search(query_embedding, k)).await;

        let mut results = Vec::new();
        for (chunk_id, score) in hits {
            if score < min_score {
                continue;
            }
            if let Some(chunk) = self.get_chunk(&chunk_id).await? {
                sqlx::query("UPDATE knowledge_chunks SET last_queried = ? WHERE chunk_id = ?")
                    .bind(now_unix_s() as i64)
                    .bind(&chunk_id)
                    .execute(&self.pool)
                    .await?;
                results.push((chunk, score));
            }
        }
        Ok(results)
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>, KnowledgeError> {
        let row = sqlx::query(
            "SELECT chunk_id, domain, doc_ref, content, embedding, metadata, version, checksum
             FROM knowledge_chunks WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| KnowledgeChunk {
            id: row.get("chunk_id"),
            domain: row.get("domain"),
            doc_ref: row.get("doc_ref"),
            content_bytes: row.get("content"),
            embedding: serde_json::from_str(&row.get::<String, _>("embedding")).unwrap_or_default(),
            metadata: row.get("metadata"),
            version: row.get::<i64, _>("version") as u64,
            checksum: row.get("checksum"),
        }))
    }

    /// Enforces the per-domain byte/chunk budget (§4.5): evicts
    /// least-recently-queried chunks in the lowest-priority subscribed
    /// domain first, never below `min_free` (5% of budget).
    pub async fn evict_if_needed(&self) -> Result<Vec<String>, KnowledgeError> {
        let mut evicted = Vec::new();
        let total_budget = self.config.knowledge_budget_bytes;
        let min_free = total_budget / 20;

        let mut domains: Vec<(String, DomainLimit)> = self
            .config
            .subscriptions
            .iter()
            .map(|d| (d.clone(), self.domain_limit(d)))
            .collect();
        domains.sort_by_key(|(_, limit)| limit.priority);

        let mut used_total = 0u64;
        for (domain, _) in &domains {
            used_total += self.storage_bytes(domain).await?;
        }

        for (domain, limit) in &domains {
            if total_budget.saturating_sub(used_total) >= min_free {
                break;
            }
            let rows = sqlx::query(
                "SELECT chunk_id, LENGTH(content) AS n FROM knowledge_chunks
                 WHERE domain = ? ORDER BY last_queried ASC",
            )
            .bind(domain)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                if total_budget.saturating_sub(used_total) >= min_free {
                    break;
                }
                let chunk_id: String = row.get("chunk_id");
                let size = row.get::<i64, _>("n") as u64;
                self.remove_chunks(domain, &[chunk_id.clone()]).await?;
                used_total = used_total.saturating_sub(size);
                evicted.push(chunk_id);
            }
            let _ = limit;
        }
        Ok(evicted)
    }
}

/// One subscribed domain's place in the sync priority queue (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncJobState {
    Syncing,
    Stale,
    Error { consecutive_failures: u32 },
    Idle,
}

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub domain: String,
    pub priority: u8,
    pub staleness_s: u64,
    pub coverage: f64,
    pub state: SyncJobState,
}

impl SyncJob {
    /// Score combining `(state, staleness, coverage, priority)` (§4.5):
    /// `SYNCING` always sorts first, `STALE` next, `ERROR` backs off
    /// exponentially (base 30s, cap 1h) before it's eligible again.
    fn score(&self) -> f64 {
        let state_weight = match self.state {
            SyncJobState::Syncing => 1_000_000.0,
            SyncJobState::Stale => 100_000.0,
            SyncJobState::Error { .. } => 0.0,
            SyncJobState::Idle => 10_000.0,
        };
        let backoff_penalty = match self.state {
            SyncJobState::Error { consecutive_failures } => {
                let backoff_s = (30u64 << consecutive_failures.min(7)).min(3600);
                if self.staleness_s < backoff_s {
                    return f64::NEG_INFINITY;
                }
                0.0
            }
            _ => 0.0,
        };
        state_weight + self.staleness_s as f64 + (1.0 - self.coverage) * 1000.0
            + self.priority as f64 * 10.0
            - backoff_penalty
    }
}

/// Picks the next domain to sync from a set of candidate jobs, or `None`
/// when every job is either fully covered or still backing off.
pub fn next_sync_job(jobs: &[SyncJob]) -> Option<SyncJob> {
    jobs.iter()
        .map(|j| (j, j.score()))
        .filter(|(_, score)| score.is_finite())
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(j, _)| j.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store(config: NodeConfig) -> KnowledgeStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        KnowledgeStore::new(pool, config)
    }

    fn chunk(id: &str, domain: &str, version: u64, embedding: Vec<f32>) -> KnowledgeChunk {
        let content = format!("content-for-{id}").into_bytes();
        let metadata = "{}".to_string();
        let cs = checksum(&content, &metadata, version);
        KnowledgeChunk {
            id: id.into(),
            domain: domain.into(),
            doc_ref: format!("doc://{id}"),
            content_bytes: content,
            embedding,
            metadata,
            version,
            checksum: cs,
        }
    }

    #[tokio::test]
    async fn apply_rejects_bad_checksum() {
        let store = test_store(NodeConfig { node_id: "n1".into(), ..Default::default() }).await;
        let mut c = chunk("a", "wildlife", 1, vec![0.1, 0.2]);
        c.checksum = "deadbeef".into();
        let err = store.apply_chunks(vec![c]).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::ChecksumMismatch(_)));
    }

    #[tokio::test]
    async fn manifest_roundtrip_reaches_full_coverage() {
        let store = test_store(NodeConfig { node_id: "n1".into(), ..Default::default() }).await;

        let remote_chunks: Vec<KnowledgeChunk> = (0..5)
            .map(|i| chunk(&format!("c{i}"), "wildlife", 1, vec![i as f32, 0.0]))
            .collect();
        let remote_manifest = DomainManifest {
            domain: "wildlife".into(),
            version: 1,
            entries: remote_chunks
                .iter()
                .map(|c| ManifestEntry {
                    chunk_id: c.id.clone(),
                    version: c.version,
                    truncated_checksum: truncated_checksum(&c.checksum),
                })
                .collect(),
            batch_rollups: vec![],
        };

        let state = store
            .sync_from_manifest("wildlife", &remote_manifest, |ids| {
                let chunks: Vec<KnowledgeChunk> =
                    remote_chunks.iter().filter(|c| ids.contains(&c.id)).cloned().collect();
                async move { Ok(chunks) }
            })
            .await
            .unwrap();

        assert_eq!(state.state, KnowledgeSyncState::Full);
        assert_eq!(state.local_version, 1);
        assert_eq!(state.chunks_local, 5);

        // Second sync against the same manifest should see an empty diff.
        let state2 = store
            .sync_from_manifest("wildlife", &remote_manifest, |_| async { Ok(vec![]) })
            .await
            .unwrap();
        assert_eq!(state2.chunks_local, 5);
    }

    #[tokio::test]
    async fn search_finds_nearest_chunk_by_cosine() {
        let store = test_store(NodeConfig { node_id: "n1".into(), ..Default::default() }).await;
        store
            .apply_chunks(vec![
                chunk("near", "wildlife", 1, vec![1.0, 0.0, 0.0]),
                chunk("far", "wildlife", 1, vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0, 0.0], "wildlife", 1, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "near");
    }

    #[tokio::test]
    async fn eviction_respects_budget_and_min_free() {
        let mut config = NodeConfig { node_id: "n1".into(), ..Default::default() };
        config.knowledge_budget_bytes = 40;
        config.subscriptions = vec!["wildlife".into()];
        let store = test_store(config).await;

        for i in 0..5 {
            store
                .apply_chunks(vec![chunk(&format!("c{i}"), "wildlife", 1, vec![0.1])])
                .await
                .unwrap();
        }

        let used_before = store.storage_bytes("wildlife").await.unwrap();
        assert!(used_before > 0);

        store.evict_if_needed().await.unwrap();
        let used_after = store.storage_bytes("wildlife").await.unwrap();
        assert!(used_after <= used_before);
    }

    #[test]
    fn next_sync_job_prefers_syncing_then_stale_over_idle() {
        let jobs = vec![
            SyncJob {
                domain: "idle-domain".into(),
                priority: 5,
                staleness_s: 10_000,
                coverage: 0.1,
                state: SyncJobState::Idle,
            },
            SyncJob {
                domain: "stale-domain".into(),
                priority: 0,
                staleness_s: 0,
                coverage: 0.9,
                state: SyncJobState::Stale,
            },
            SyncJob {
                domain: "syncing-domain".into(),
                priority: 0,
                staleness_s: 0,
                coverage: 0.9,
                state: SyncJobState::Syncing,
            },
        ];
        let picked = next_sync_job(&jobs).unwrap();
        assert_eq!(picked.domain, "syncing-domain");
    }

    #[test]
    fn next_sync_job_skips_errors_still_backing_off() {
        let jobs = vec![
            SyncJob {
                domain: "backing-off".into(),
                priority: 5,
                staleness_s: 5,
                coverage: 0.0,
                state: SyncJobState::Error { consecutive_failures: 3 },
            },
            SyncJob {
                domain: "ready-after-backoff".into(),
                priority: 5,
                staleness_s: 600,
                coverage: 0.0,
                state: SyncJobState::Error { consecutive_failures: 0 },
            },
        ];
        let picked = next_sync_job(&jobs).unwrap();
        assert_eq!(picked.domain, "ready-after-backoff");
    }

    #[test]
    fn next_sync_job_none_when_all_backing_off() {
        let jobs = vec![SyncJob {
            domain: "stuck".into(),
            priority: 0,
            staleness_s: 1,
            coverage: 0.0,
            state: SyncJobState::Error { consecutive_failures: 5 },
        }];
        assert!(next_sync_job(&jobs).is_none());
    }
}
