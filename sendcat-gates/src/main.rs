//! Reliability drills and release/canary gates for the chat gateway (§4.J).
//!
//! ```text
//! sendcat-gates drill <scenario> <profile>
//! sendcat-gates gate <scenario> <profile>
//! sendcat-gates canary <scenario> <profile>
//! ```

mod burn;
mod canary;
mod probe;
mod profiles;
mod rates;

use anyhow::{anyhow, Result};

use probe::{ProbeRunner, RecordedProbeRunner};
use profiles::DrillProfile;
use rates::{evaluate_policy, Policy};

use std::time::Duration;

/// Default policy until a real policy file is wired up. Kept conservative:
/// a release gate should err toward blocking.
fn default_policy() -> Policy {
    Policy {
        max_5xx_rate: 0.01,
        max_network_error_rate: 0.01,
        max_unknown_status_rate: 0.005,
        min_2xx_success_rate: 0.98,
        max_p95: Duration::from_millis(800),
    }
}

fn usage() {
    eprintln!(
        "Usage:\n  sendcat-gates drill <scenario> <profile>\n  sendcat-gates gate <scenario> <profile>\n  sendcat-gates canary <scenario> <profile>\n\nprofiles: quick, standard, burst, soak, m1_1k, m2_5k, m3_20k"
    );
}

async fn cmd_drill(runner: &dyn ProbeRunner, scenario: &str, profile: DrillProfile) -> Result<()> {
    let rates = runner.drill(scenario, profile).await;
    println!("drill {scenario} @ {}: {rates:#?}", profile.as_str());
    Ok(())
}

async fn cmd_gate(runner: &dyn ProbeRunner, scenario: &str, profile: DrillProfile) -> Result<()> {
    let observed = runner.drill(scenario, profile).await;
    let violations = evaluate_policy(&observed, &default_policy());
    if violations.is_empty() {
        println!("gate PASS: {scenario} @ {}", profile.as_str());
        Ok(())
    } else {
        for v in &violations {
            println!("gate FAIL: {} observed {:.4} exceeds limit {:.4}", v.metric, v.observed, v.limit);
        }
        Err(anyhow!("release gate failed: {} threshold(s) violated", violations.len()))
    }
}

async fn cmd_canary(runner: &dyn ProbeRunner, scenario: &str, profile: DrillProfile) -> Result<()> {
    let control_scenario = format!("{scenario}_control");
    let candidate_scenario = format!("{scenario}_candidate");
    let control = runner.drill(&control_scenario, profile).await;
    let candidate = runner.drill(&candidate_scenario, profile).await;

    let thresholds = canary::CanaryThresholds {
        max_p95_ratio: 1.2,
        max_p95_delta_ms: 150.0,
        max_5xx_rate_delta: 0.005,
        max_network_error_rate_delta: 0.005,
        max_unknown_status_rate_delta: 0.005,
        max_2xx_success_rate_delta: 0.01,
    };
    let regressions = canary::compare_canary(&control, &candidate, &thresholds);
    if regressions.is_empty() {
        println!("canary PASS: {scenario} @ {}", profile.as_str());
        Ok(())
    } else {
        for r in &regressions {
            println!(
                "canary FAIL: {} control={:.4} candidate={:.4} limit={:.4}",
                r.metric, r.control, r.candidate, r.limit
            );
        }
        Err(anyhow!("canary comparison failed: {} regression(s) found", regressions.len()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        usage();
        std::process::exit(1);
    }

    let cmd = &args[0];
    let scenario = &args[1];
    let profile = DrillProfile::from_str(&args[2]).ok_or_else(|| anyhow!("unknown profile {}", args[2]))?;

    // TODO: wire a real HTTP-backed ProbeRunner once sendcat-http exposes a
    // stable base URL for drills to target.
    let runner = RecordedProbeRunner::default();

    match cmd.as_str() {
        "drill" => cmd_drill(&runner, scenario, profile).await,
        "gate" => cmd_gate(&runner, scenario, profile).await,
        "canary" => cmd_canary(&runner, scenario, profile).await,
        _ => {
            usage();
            std::process::exit(1);
        }
    }
}
