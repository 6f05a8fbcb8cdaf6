//! Scenario-level rate metrics and the release-gate policy evaluated
//! against them (§4.J).

use std::time::Duration;

/// Observed outcome rates for one scenario over a drill window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScenarioRates {
    pub five_xx_rate: f64,
    pub network_error_rate: f64,
    pub unknown_status_rate: f64,
    pub two_xx_success_rate: f64,
    pub p95: Duration,
}

/// The thresholds a scenario's observed rates must stay within to pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    pub max_5xx_rate: f64,
    pub max_network_error_rate: f64,
    pub max_unknown_status_rate: f64,
    pub min_2xx_success_rate: f64,
    pub max_p95: Duration,
}

/// One failed threshold from a policy evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyViolation {
    pub metric: &'static str,
    pub observed: f64,
    pub limit: f64,
}

/// Evaluate `rates` against `policy`, returning every threshold the scenario
/// failed. An empty result means the scenario passes.
pub fn evaluate_policy(rates: &ScenarioRates, policy: &Policy) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();

    if rates.five_xx_rate > policy.max_5xx_rate {
        violations.push(PolicyViolation { metric: "5xx_rate", observed: rates.five_xx_rate, limit: policy.max_5xx_rate });
    }
    if rates.network_error_rate > policy.max_network_error_rate {
        violations.push(PolicyViolation {
            metric: "network_error_rate",
            observed: rates.network_error_rate,
            limit: policy.max_network_error_rate,
        });
    }
    if rates.unknown_status_rate > policy.max_unknown_status_rate {
        violations.push(PolicyViolation {
            metric: "unknown_status_rate",
            observed: rates.unknown_status_rate,
            limit: policy.max_unknown_status_rate,
        });
    }
    if rates.two_xx_success_rate < policy.min_2xx_success_rate {
        violations.push(PolicyViolation {
            metric: "2xx_success_rate",
            observed: rates.two_xx_success_rate,
            limit: policy.min_2xx_success_rate,
        });
    }
    if rates.p95 > policy.max_p95 {
        violations.push(PolicyViolation {
            metric: "p95_ms",
            observed: rates.p95.as_millis() as f64,
            limit: policy.max_p95.as_millis() as f64,
        });
    }

    violations
}
