use std::path::Path;

use anyhow::{Context, Result, bail};
use netsim_abstract::{TestAction, TestAssertion, TestScenario};
use tracing::info;

use crate::engine::Simulation;
use crate::metrics::MetricRecord;
use crate::report::SimulationReport;

/// Everything a finished scenario run leaves behind.
pub struct ScenarioOutcome {
    pub report: SimulationReport,
    pub records: Vec<MetricRecord>,
}

/// Load a scenario description from a TOML file.
pub fn load_scenario(path: &Path) -> Result<TestScenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario file {}", path.display()))?;
    let scenario: TestScenario =
        toml::from_str(&content).context("failed to parse scenario file")?;
    Ok(scenario)
}

/// Run one scenario to completion and evaluate its assertions. The
/// topology is assumed validated; assertion failures come back as errors
/// naming the scenario and the check that failed.
pub fn run_scenario(scenario: &TestScenario) -> Result<ScenarioOutcome> {
    info!("running scenario `{}`", scenario.name);
    let mut sim = Simulation::new(&scenario.topology);
    sim.set_horizon(scenario.horizon_s);
    for action in &scenario.actions {
        match action {
            TestAction::DropDataSeqOnce { flow, seq } => sim.add_drop_data_seq_once(flow, *seq),
            TestAction::DropAllUntil { flow, time } => sim.add_blackhole_until(flow, *time),
        }
    }
    sim.run_until_empty();
    let report = sim.export_report();
    for assertion in &scenario.assertions {
        check(scenario, &report, assertion)?;
    }
    Ok(ScenarioOutcome {
        report,
        records: sim.metrics().records().to_vec(),
    })
}

fn check(
    scenario: &TestScenario,
    report: &SimulationReport,
    assertion: &TestAssertion,
) -> Result<()> {
    let fail = |detail: String| -> Result<()> {
        bail!("scenario `{}`: {detail}", scenario.name);
    };
    match assertion {
        TestAssertion::FlowCompleted { flow } => {
            let summary = report
                .flow(flow)
                .with_context(|| format!("scenario `{}`: unknown flow `{flow}`", scenario.name))?;
            if summary.completed_at.is_none() {
                return fail(format!("flow `{flow}` did not complete"));
            }
        }
        TestAssertion::MaxDuration { seconds } => {
            if report.duration_s > *seconds {
                return fail(format!(
                    "run took {:.6}s, over the {seconds}s bound",
                    report.duration_s
                ));
            }
        }
        TestAssertion::MaxDrops { count } => {
            if report.drops > *count {
                return fail(format!("{} drops, over the bound {count}", report.drops));
            }
        }
        TestAssertion::MinDrops { count } => {
            if report.drops < *count {
                return fail(format!("{} drops, under the bound {count}", report.drops));
            }
        }
        TestAssertion::CwndReached { flow, at_least } => {
            let summary = report
                .flow(flow)
                .with_context(|| format!("scenario `{}`: unknown flow `{flow}`", scenario.name))?;
            if summary.max_cwnd < *at_least {
                return fail(format!(
                    "flow `{flow}` window peaked at {:.3}, wanted at least {at_least}",
                    summary.max_cwnd
                ));
            }
        }
        TestAssertion::Timeouts { flow, min, max } => {
            let summary = report
                .flow(flow)
                .with_context(|| format!("scenario `{}`: unknown flow `{flow}`", scenario.name))?;
            let n = summary.timeouts;
            if n < *min || max.is_some_and(|m| n > m) {
                return fail(format!(
                    "flow `{flow}` timed out {n} times, wanted [{min}, {}]",
                    max.map_or("*".to_string(), |m| m.to_string())
                ));
            }
        }
        TestAssertion::FastRetransmits { flow, min, max } => {
            let summary = report
                .flow(flow)
                .with_context(|| format!("scenario `{}`: unknown flow `{flow}`", scenario.name))?;
            let n = summary.fast_retransmits;
            if n < *min || max.is_some_and(|m| n > m) {
                return fail(format!(
                    "flow `{flow}` fast-retransmitted {n} times, wanted [{min}, {}]",
                    max.map_or("*".to_string(), |m| m.to_string())
                ));
            }
        }
    }
    Ok(())
}
