//! Cost collector: samples local [`CostState`], decides when a change is
//! significant enough to broadcast immediately, and exposes the pure
//! `compute_node_cost` scoring function used by both the local sampler and
//! Tier 5 routing.

use thiserror::Error;

use crate::types::{now_unix_s, CostState, Intent};

#[derive(Debug, Error)]
pub enum CostError {
    #[error("no platform cost adapter matched this node")]
    CostUnavailable,
}

/// Platform-abstract sampling seam. Battery/CPU/GPU telemetry is itself
/// out-of-scope plumbing (§1), so the collector depends on this trait
/// rather than threading `cfg(target_os = ...)` through routing logic,
/// keeping platform-specific code narrowly scoped instead of spread
/// through business logic.
pub trait CostSampler: Send + Sync {
    fn sample(&self) -> Result<CostState, CostError>;
}

/// Deterministic sampler for tests and headless nodes: always reports a
/// fixed, non-stale reading. Real deployments provide their own
/// `CostSampler` backed by platform telemetry.
pub struct StaticSampler {
    pub state: CostState,
}

impl CostSampler for StaticSampler {
    fn sample(&self) -> Result<CostState, CostError> {
        let mut state = self.state.clone();
        state.sampled_at = now_unix_s();
        Ok(state)
    }
}

/// Kind of work a routing decision is being scored for — only `Inference`
/// and `Embedding` engage the GPU multiplier (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Inference,
    Embedding,
    Other,
}

/// Raw inputs to the cost aggregation function, decoupled from [`CostState`]
/// so routing can score a hypothetical/neutral state without constructing a
/// full gossip record.
#[derive(Debug, Clone, Copy)]
pub struct CostInputs {
    pub on_battery: bool,
    pub battery_pct: Option<f64>,
    pub cpu_load: f64,
    pub gpu_load_pct: Option<f64>,
    pub mem_pct: f64,
    pub bandwidth_mbps: Option<f64>,
    pub metered: bool,
    pub latency_ms: Option<f64>,
    pub estimated_api_cost: f64,
}

impl CostInputs {
    pub fn neutral() -> Self {
        CostInputs {
            on_battery: false,
            battery_pct: None,
            cpu_load: 0.5,
            gpu_load_pct: None,
            mem_pct: 50.0,
            bandwidth_mbps: None,
            metered: false,
            latency_ms: None,
            estimated_api_cost: 0.0,
        }
    }

    pub fn from_cost_state(state: &CostState) -> Self {
        CostInputs {
            on_battery: state.on_battery,
            battery_pct: state.battery_pct,
            cpu_load: state.cpu_load,
            gpu_load_pct: state.gpu_load_pct,
            mem_pct: state.mem_pct,
            bandwidth_mbps: state.bandwidth_mbps,
            metered: state.metered,
            latency_ms: state.latency_ms,
            estimated_api_cost: 0.0,
        }
    }
}

/// Pure, deterministic cost aggregation (§4.1). Identical inputs always
/// produce identical outputs — this is the function the "cost scoring
/// determinism" invariant (§8) is about.
pub fn compute_node_cost(inputs: &CostInputs, work: WorkKind, budget_sensitivity: f64) -> f64 {
    let mut cost = 1.0f64;

    if inputs.on_battery {
        let pct = inputs.battery_pct.unwrap_or(100.0);
        cost *= if pct < 20.0 {
            5.0
        } else if pct < 50.0 {
            3.0
        } else {
            2.0
        };
    }

    let cpu_mult = if inputs.cpu_load < 0.25 {
        1.0
    } else if inputs.cpu_load < 0.50 {
        1.3
    } else if inputs.cpu_load < 0.75 {
        1.6
    } else {
        2.0
    };
    cost *= cpu_mult;

    let mem_mult = if inputs.mem_pct < 80.0 {
        1.0
    } else if inputs.mem_pct < 90.0 {
        1.5
    } else {
        2.5
    };
    cost *= mem_mult;

    if matches!(work, WorkKind::Inference | WorkKind::Embedding) {
        if let Some(gpu) = inputs.gpu_load_pct {
            let gpu_mult = if gpu < 25.0 {
                1.0
            } else if gpu < 50.0 {
                1.5
            } else {
                2.0
            };
            cost *= gpu_mult;
        }
    }

    if inputs.metered {
        cost *= 3.0;
    }
    if let Some(bw) = inputs.bandwidth_mbps {
        cost *= if bw < 1.0 {
            5.0
        } else if bw < 10.0 {
            2.0
        } else if bw < 100.0 {
            1.2
        } else {
            1.0
        };
    }

    let api_penalty = inputs.estimated_api_cost * 100.0 * budget_sensitivity;
    cost += api_penalty;

    let latency_pen = 1.0 + (inputs.latency_ms.unwrap_or(0.0) - 100.0).max(0.0) / 500.0;
    cost *= latency_pen;

    cost.max(1.0)
}

/// Cost scoring entry point used by the router: neutral cost when the
/// registry reports `Stale` (§4.3), otherwise the real aggregation.
pub fn score_for_intent(
    inputs: Option<&CostInputs>,
    intent: &Intent,
    budget_sensitivity: f64,
) -> f64 {
    let work = if intent.intent_type.starts_with("ml/embed") {
        WorkKind::Embedding
    } else if intent.intent_type.starts_with("llm/") || intent.intent_type.starts_with("vision/") {
        WorkKind::Inference
    } else {
        WorkKind::Other
    };
    match inputs {
        Some(inputs) => compute_node_cost(inputs, work, budget_sensitivity),
        None => compute_node_cost(&CostInputs::neutral(), work, budget_sensitivity),
    }
}

/// Determines whether a new sample warrants immediate broadcast rather
/// than waiting for the periodic 30s tick (§4.1).
pub fn is_significant_change(prev: &CostState, next: &CostState) -> bool {
    if prev.on_battery != next.on_battery {
        return true;
    }
    if let (Some(p), Some(n)) = (prev.battery_pct, next.battery_pct) {
        if (p - n).abs() >= 10.0 {
            return true;
        }
    }
    if (prev.cpu_load - next.cpu_load).abs() >= 0.20 {
        return true;
    }
    if prev.metered != next.metered {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_cost() {
        let inputs = CostInputs {
            on_battery: true,
            battery_pct: Some(15.0),
            cpu_load: 0.6,
            gpu_load_pct: Some(40.0),
            mem_pct: 85.0,
            bandwidth_mbps: Some(5.0),
            metered: true,
            latency_ms: Some(250.0),
            estimated_api_cost: 0.02,
        };
        let a = compute_node_cost(&inputs, WorkKind::Inference, 1.0);
        let b = compute_node_cost(&inputs, WorkKind::Inference, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn battery_under_20_pct_multiplies_by_five() {
        let mut inputs = CostInputs::neutral();
        inputs.cpu_load = 0.1;
        inputs.mem_pct = 10.0;
        let baseline = compute_node_cost(&inputs, WorkKind::Other, 1.0);
        inputs.on_battery = true;
        inputs.battery_pct = Some(15.0);
        let on_battery = compute_node_cost(&inputs, WorkKind::Other, 1.0);
        assert!((on_battery / baseline - 5.0).abs() < 1e-9);
    }

    #[test]
    fn gpu_multiplier_only_applies_to_inference_and_embedding() {
        let mut inputs = CostInputs::neutral();
        inputs.cpu_load = 0.1;
        inputs.mem_pct = 10.0;
        inputs.gpu_load_pct = Some(90.0);
        let other = compute_node_cost(&inputs, WorkKind::Other, 1.0);
        let inference = compute_node_cost(&inputs, WorkKind::Inference, 1.0);
        assert!(inference > other);
    }

    #[test]
    fn cost_flip_on_battery_is_significant() {
        let plugged = CostState {
            on_battery: false,
            battery_pct: None,
            cpu_load: 0.2,
            gpu_load_pct: None,
            mem_pct: 30.0,
            bandwidth_mbps: None,
            metered: false,
            latency_ms: None,
            api_model: None,
            overall_cost: 1.0,
            sampled_at: 0,
        };
        let mut on_battery = plugged.clone();
        on_battery.on_battery = true;
        on_battery.battery_pct = Some(15.0);
        assert!(is_significant_change(&plugged, &on_battery));
    }

    #[test]
    fn small_cpu_delta_is_not_significant() {
        let a = CostState {
            on_battery: false,
            battery_pct: None,
            cpu_load: 0.30,
            gpu_load_pct: None,
            mem_pct: 30.0,
            bandwidth_mbps: None,
            metered: false,
            latency_ms: None,
            api_model: None,
            overall_cost: 1.0,
            sampled_at: 0,
        };
        let mut b = a.clone();
        b.cpu_load = 0.35;
        assert!(!is_significant_change(&a, &b));
    }
}
