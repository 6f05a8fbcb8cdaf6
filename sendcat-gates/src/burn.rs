//! SLO burn-rate evaluation (§4.J, GLOSSARY "Burn rate").
//!
//! Burn rate is the ratio of the observed bad-request fraction to the SLO's
//! allowed error budget. A burn rate of 1.0 means the scenario is consuming
//! its monthly error budget at exactly the sustainable pace; release gates
//! block promotion once either window's burn rate clears its multiplier.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SloBaseline {
    /// Allowed bad-request fraction over the SLO's full measurement period.
    pub error_budget: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BurnRateWindows {
    pub short_window_bad_fraction: f64,
    pub long_window_bad_fraction: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BurnRateResult {
    pub short_window_burn: f64,
    pub long_window_burn: f64,
}

impl BurnRateResult {
    /// Multi-window burn-rate alerting (the Google SRE workbook's two-window
    /// pattern): both the short and long window must clear `multiplier`
    /// before the gate blocks, so a momentary blip in the short window alone
    /// doesn't fail a release.
    pub fn exceeds(&self, multiplier: f64) -> bool {
        self.short_window_burn >= multiplier && self.long_window_burn >= multiplier
    }
}

pub fn evaluate_burn_rate(windows: BurnRateWindows, baseline: SloBaseline) -> BurnRateResult {
    let budget = baseline.error_budget.max(f64::EPSILON);
    BurnRateResult {
        short_window_burn: windows.short_window_bad_fraction / budget,
        long_window_burn: windows.long_window_bad_fraction / budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burn_rate_of_one_means_budget_is_being_spent_at_the_sustainable_rate() {
        let result = evaluate_burn_rate(
            BurnRateWindows { short_window_bad_fraction: 0.01, long_window_bad_fraction: 0.01 },
            SloBaseline { error_budget: 0.01 },
        );
        assert_eq!(result.short_window_burn, 1.0);
        assert_eq!(result.long_window_burn, 1.0);
    }

    #[test]
    fn gate_blocks_only_when_both_windows_clear_the_multiplier() {
        let result = BurnRateResult { short_window_burn: 15.0, long_window_burn: 0.5 };
        assert!(!result.exceeds(14.4), "long window hasn't sustained the burn, so it shouldn't block");

        let sustained = BurnRateResult { short_window_burn: 15.0, long_window_burn: 15.0 };
        assert!(sustained.exceeds(14.4));
    }
}
