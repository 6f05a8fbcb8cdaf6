//! Canary comparison: control vs candidate rates against regression
//! thresholds (§4.J).

use crate::rates::ScenarioRates;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanaryThresholds {
    pub max_p95_ratio: f64,
    pub max_p95_delta_ms: f64,
    pub max_5xx_rate_delta: f64,
    pub max_network_error_rate_delta: f64,
    pub max_unknown_status_rate_delta: f64,
    pub max_2xx_success_rate_delta: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanaryRegression {
    pub metric: &'static str,
    pub control: f64,
    pub candidate: f64,
    pub limit: f64,
}

/// Compare `candidate` against `control`, returning every regression beyond
/// `thresholds`. `2xx_success_rate` regresses when the candidate drops
/// below control by more than its delta threshold; every other metric
/// regresses when the candidate rises above control by more than its own.
pub fn compare_canary(
    control: &ScenarioRates,
    candidate: &ScenarioRates,
    thresholds: &CanaryThresholds,
) -> Vec<CanaryRegression> {
    let mut regressions = Vec::new();

    let control_p95_ms = control.p95.as_millis() as f64;
    let candidate_p95_ms = candidate.p95.as_millis() as f64;
    let p95_ratio = if control_p95_ms > 0.0 { candidate_p95_ms / control_p95_ms } else { 1.0 };
    if p95_ratio > thresholds.max_p95_ratio {
        regressions.push(CanaryRegression {
            metric: "p95_ratio",
            control: control_p95_ms,
            candidate: candidate_p95_ms,
            limit: thresholds.max_p95_ratio,
        });
    }
    let p95_delta_ms = candidate_p95_ms - control_p95_ms;
    if p95_delta_ms > thresholds.max_p95_delta_ms {
        regressions.push(CanaryRegression {
            metric: "p95_delta_ms",
            control: control_p95_ms,
            candidate: candidate_p95_ms,
            limit: thresholds.max_p95_delta_ms,
        });
    }

    check_increase_regression(
        "5xx_rate",
        control.five_xx_rate,
        candidate.five_xx_rate,
        thresholds.max_5xx_rate_delta,
        &mut regressions,
    );
    check_increase_regression(
        "network_error_rate",
        control.network_error_rate,
        candidate.network_error_rate,
        thresholds.max_network_error_rate_delta,
        &mut regressions,
    );
    check_increase_regression(
        "unknown_status_rate",
        control.unknown_status_rate,
        candidate.unknown_status_rate,
        thresholds.max_unknown_status_rate_delta,
        &mut regressions,
    );

    let success_drop = control.two_xx_success_rate - candidate.two_xx_success_rate;
    if success_drop > thresholds.max_2xx_success_rate_delta {
        regressions.push(CanaryRegression {
            metric: "2xx_success_rate",
            control: control.two_xx_success_rate,
            candidate: candidate.two_xx_success_rate,
            limit: thresholds.max_2xx_success_rate_delta,
        });
    }

    regressions
}

fn check_increase_regression(
    metric: &'static str,
    control: f64,
    candidate: f64,
    max_delta: f64,
    out: &mut Vec<CanaryRegression>,
) {
    let delta = candidate - control;
    if delta > max_delta {
        out.push(CanaryRegression { metric, control, candidate, limit: max_delta });
    }
}
