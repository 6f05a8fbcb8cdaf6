//! Synthetic probes and staged load drills against a running gateway.
//!
//! `ProbeRunner` is the seam between this binary and an actual HTTP client;
//! tests and dry runs use `RecordedProbeRunner` instead of hitting a live
//! gateway.

use async_trait::async_trait;
use std::time::Duration;

use crate::profiles::DrillProfile;
use crate::rates::ScenarioRates;

#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Execute a synthetic probe against `endpoint`, returning the observed
    /// HTTP status (or `None` on a network error, distinct from a 5xx).
    async fn probe(&self, endpoint: &str) -> Option<u16>;

    /// Run a staged load drill for `scenario` at `profile`'s target rate and
    /// duration, returning the aggregated rates.
    async fn drill(&self, scenario: &str, profile: DrillProfile) -> ScenarioRates;
}

/// A fixed set of canned responses, for dry runs and tests.
#[derive(Clone, Default)]
pub struct RecordedProbeRunner {
    pub scenario_rates: std::collections::HashMap<String, ScenarioRates>,
    pub probe_statuses: std::collections::HashMap<String, Option<u16>>,
}

#[async_trait]
impl ProbeRunner for RecordedProbeRunner {
    async fn probe(&self, endpoint: &str) -> Option<u16> {
        self.probe_statuses.get(endpoint).copied().flatten()
    }

    async fn drill(&self, scenario: &str, _profile: DrillProfile) -> ScenarioRates {
        self.scenario_rates.get(scenario).copied().unwrap_or(ScenarioRates {
            five_xx_rate: 0.0,
            network_error_rate: 0.0,
            unknown_status_rate: 0.0,
            two_xx_success_rate: 1.0,
            p95: Duration::from_millis(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_runner_replays_canned_rates_for_known_scenarios() {
        let mut rates = std::collections::HashMap::new();
        rates.insert(
            "chat_completion".to_string(),
            ScenarioRates {
                five_xx_rate: 0.02,
                network_error_rate: 0.0,
                unknown_status_rate: 0.0,
                two_xx_success_rate: 0.98,
                p95: Duration::from_millis(300),
            },
        );
        let runner = RecordedProbeRunner { scenario_rates: rates, probe_statuses: Default::default() };
        let observed = runner.drill("chat_completion", DrillProfile::Quick).await;
        assert_eq!(observed.five_xx_rate, 0.02);
    }

    #[tokio::test]
    async fn unknown_scenario_falls_back_to_a_clean_result() {
        let runner = RecordedProbeRunner::default();
        let observed = runner.drill("unknown", DrillProfile::Quick).await;
        assert_eq!(observed.two_xx_success_rate, 1.0);
    }
}
