//! Node runtime wiring: the process-wide singleton that ties the registry,
//! router, dispatcher, and knowledge store together and drives their
//! background loops (§5, §9). One `OnceLock`, populated by an explicit
//! `bootstrap()` call, never lazily.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::NodeConfig;
use crate::cost::{is_significant_change, CostSampler};
use crate::dispatcher::{Dispatcher, LocalHandler, RemoteTransport};
use crate::gossip::{self, GossipBody, GossipMessage, GossipState, PeerTransport};
use crate::knowledge::KnowledgeStore;
use crate::registry::Registry;
use crate::router::{Embedder, IntentRouter};
use crate::types::now_unix_s;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node already bootstrapped")]
    AlreadyInitialized,
    #[error(transparent)]
    Knowledge(#[from] crate::knowledge::KnowledgeError),
}

pub struct NodeHandle {
    pub config: NodeConfig,
    pub registry: Arc<Registry>,
    pub knowledge: Arc<KnowledgeStore>,
    pub router: Arc<IntentRouter>,
    pub dispatcher: Arc<Dispatcher>,
    gossip_state: Arc<RwLock<GossipState>>,
}

static NODE: OnceLock<Arc<NodeHandle>> = OnceLock::new();

pub fn get_node() -> Option<Arc<NodeHandle>> {
    NODE.get().cloned()
}

/// Brings up one node: runs knowledge-store migrations, constructs the
/// registry/router/dispatcher, and spawns the gossip, cost-sampling, and
/// eviction background loops as independent tasks on whatever runtime the
/// caller is running in. Idempotent — a second call is a documented no-op
/// that returns the existing handle.
pub async fn bootstrap(
    config: NodeConfig,
    pool: SqlitePool,
    transport: Arc<dyn PeerTransport>,
    local: Arc<dyn LocalHandler>,
    remote: Arc<dyn RemoteTransport>,
    cost_sampler: Arc<dyn CostSampler>,
    embedder: Box<dyn Embedder>,
) -> Result<Arc<NodeHandle>, NodeError> {
    if let Some(existing) = NODE.get() {
        return Ok(existing.clone());
    }

    crate::knowledge::run_migrations(&pool).await?;

    let registry = Registry::new(config.clone()).into_shared();
    let knowledge = KnowledgeStore::new(pool, config.clone()).into_shared();
    let router = Arc::new(IntentRouter::new(config.clone(), registry.clone(), embedder));
    let dispatcher = Arc::new(Dispatcher::new(
        router.clone(),
        local,
        remote,
        config.node_id.clone(),
        config.dispatcher_workers,
    ));
    let gossip_state = Arc::new(RwLock::new(GossipState::new()));

    let handle = Arc::new(NodeHandle {
        config: config.clone(),
        registry: registry.clone(),
        knowledge: knowledge.clone(),
        router,
        dispatcher,
        gossip_state: gossip_state.clone(),
    });

    if NODE.set(handle.clone()).is_err() {
        return Ok(NODE.get().unwrap().clone());
    }

    tokio::spawn(gossip_loop(
        gossip_state.clone(),
        registry.clone(),
        transport.clone(),
        config.clone(),
    ));
    tokio::spawn(cost_loop(
        registry.clone(),
        cost_sampler,
        config.clone(),
        gossip_state,
        transport,
    ));
    tokio::spawn(eviction_loop(registry, knowledge, config));

    Ok(handle)
}

/// One `gossip_interval_s`-period anti-entropy tick, forever. A transport
/// with no live peers is logged and retried rather than treated as fatal —
/// single-node and partitioned deployments are normal, not errors.
async fn gossip_loop(
    state: Arc<RwLock<GossipState>>,
    registry: Arc<Registry>,
    transport: Arc<dyn PeerTransport>,
    config: NodeConfig,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.gossip_interval_s));
    loop {
        ticker.tick().await;
        match gossip::run_tick(&state, &registry, transport.as_ref(), config.gossip_fanout_k).await
        {
            Ok(applied) if applied > 0 => {
                log::debug!("gossip: applied {applied} updates this tick");
            }
            Ok(_) => {}
            Err(e) => log::debug!("gossip: tick skipped: {e}"),
        }
    }
}

/// Samples local cost on a fixed cadence (§4.1's periodic 30s tick), applies
/// it to the local registry entry, and self-records it into the gossip
/// digest so the next anti-entropy exchange carries it to peers. When the
/// new sample is a significant change from the last one (battery flip,
/// ≥10% battery delta, ≥0.20 cpu delta, metered flip — see
/// [`crate::cost::is_significant_change`]), an anti-entropy exchange is
/// triggered immediately instead of waiting for the next periodic tick, so a
/// cost flip reaches peers within one `T_gossip` regardless of where in the
/// cycle it happened (§4.1, §8 scenario 3).
async fn cost_loop(
    registry: Arc<Registry>,
    sampler: Arc<dyn CostSampler>,
    config: NodeConfig,
    gossip_state: Arc<RwLock<GossipState>>,
    transport: Arc<dyn PeerTransport>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    let mut seq = 0u64;
    let mut prev: Option<crate::types::CostState> = None;
    loop {
        ticker.tick().await;
        match sampler.sample() {
            Ok(cost) => {
                seq += 1;
                let significant =
                    prev.as_ref().map(|p| is_significant_change(p, &cost)).unwrap_or(false);
                prev = Some(cost.clone());

                let msg = GossipMessage {
                    sender: config.node_id.clone(),
                    seq,
                    wall_ts: now_unix_s(),
                    ttl_hops: 1,
                    body: GossipBody::NodeCostUpdate { cost },
                };
                {
                    let mut guard = gossip_state.write().await;
                    gossip::apply(&mut guard, &registry, msg).await;
                }

                if significant {
                    log::info!("cost: significant change detected, broadcasting immediately");
                    match gossip::run_tick(
                        &gossip_state,
                        &registry,
                        transport.as_ref(),
                        config.gossip_fanout_k,
                    )
                    .await
                    {
                        Ok(_) => {}
                        Err(e) => log::debug!("cost: immediate broadcast tick skipped: {e}"),
                    }
                }
            }
            Err(e) => log::warn!("cost: sampling failed: {e}"),
        }
    }
}

/// Periodic eviction of stale nodes and over-budget knowledge chunks (§4.2,
/// §4.5). Runs at the liveness window's cadence — no point checking more
/// often than the window it enforces.
async fn eviction_loop(registry: Arc<Registry>, knowledge: Arc<KnowledgeStore>, config: NodeConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.liveness_window_s.max(1)));
    loop {
        ticker.tick().await;
        let evicted = registry
            .evict_stale(config.liveness_window_s, config.eviction_window_s)
            .await;
        if !evicted.is_empty() {
            log::info!("registry: evicted {} stale node(s)", evicted.len());
        }
        match knowledge.evict_if_needed().await {
            Ok(chunks) if !chunks.is_empty() => {
                log::info!("knowledge: evicted {} chunk(s) over budget", chunks.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("knowledge: eviction pass failed: {e}"),
        }
    }
}
