use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use netsim_loader::load_topology;
use netsim_simulator::scenario_runner;
use netsim_simulator::{MetricRecord, Simulation, SimulationReport};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Discrete-event packet network simulator",
    long_about = "Runs a topology document (JSON) or a scenario file (TOML) \
                  over virtual time and records plotting metrics."
)]
struct Args {
    /// Topology configuration (.json) or scenario file (.toml).
    config: PathBuf,

    /// -d prints event traces; -dd additionally pauses between events.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Stop once virtual time passes this horizon, in seconds.
    #[arg(long)]
    horizon: Option<f64>,

    /// Metrics log destination. Defaults to plot/<stem>_log.json.
    #[arg(long)]
    log_out: Option<PathBuf>,

    /// Write the end-of-run summary report as JSON.
    #[arg(long)]
    report_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let is_scenario = args
        .config
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    let (records, report) = if is_scenario {
        run_scenario_file(&args)?
    } else {
        run_topology_file(&args)?
    };

    let log_path = args
        .log_out
        .clone()
        .unwrap_or_else(|| derive_log_path(&args.config));
    write_metrics_log(&log_path, &records)?;
    info!("metrics log written to {}", log_path.display());

    if let Some(path) = &args.report_out {
        write_report(path, &report)?;
        info!("report written to {}", path.display());
    }

    Ok(())
}

fn run_topology_file(args: &Args) -> Result<(Vec<MetricRecord>, SimulationReport)> {
    let spec = load_topology(&args.config)
        .with_context(|| format!("invalid topology {}", args.config.display()))?;
    let mut sim = Simulation::new(&spec);
    sim.set_horizon(args.horizon);

    if args.debug >= 2 {
        run_paused(&mut sim)?;
    } else {
        sim.run_until_empty();
    }
    Ok((sim.metrics().records().to_vec(), sim.export_report()))
}

fn run_scenario_file(args: &Args) -> Result<(Vec<MetricRecord>, SimulationReport)> {
    let mut scenario = scenario_runner::load_scenario(&args.config)?;
    netsim_loader::validate(&scenario.topology)
        .with_context(|| format!("invalid topology in {}", args.config.display()))?;
    if scenario.horizon_s.is_none() {
        scenario.horizon_s = args.horizon;
    }
    let outcome = scenario_runner::run_scenario(&scenario)?;
    info!("scenario `{}` passed", scenario.name);
    Ok((outcome.records, outcome.report))
}

/// Step the simulation one event at a time, waiting for ENTER between
/// events so the trace can be inspected.
fn run_paused(sim: &mut Simulation) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    while let Some(next) = sim.peek_next_time() {
        eprintln!(
            "t={:.6} next event at t={:.6}, {} queued (ENTER to dispatch)",
            sim.current_time(),
            next,
            sim.remaining_events()
        );
        if lines.next().transpose()?.is_none() {
            break; // stdin closed: fall through to a plain run
        }
        sim.step();
    }
    sim.run_until_empty();
    Ok(())
}

/// Metrics land next to the input under plot/, named <stem>_log.json.
fn derive_log_path(config: &Path) -> PathBuf {
    let stem = config
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sim".to_string());
    PathBuf::from("plot").join(format!("{stem}_log.json"))
}

fn write_metrics_log(path: &Path, records: &[MetricRecord]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let data = serde_json::to_vec_pretty(records).context("failed to serialize metrics log")?;
    fs::write(path, &data)
        .with_context(|| format!("failed to write metrics log {}", path.display()))?;
    Ok(())
}

fn write_report(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
    fs::write(path, &data)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(())
}

fn init_logging(debug: u8) {
    let level = if debug > 0 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_replaces_directory_and_extension() {
        assert_eq!(
            derive_log_path(Path::new("input/net0.json")),
            PathBuf::from("plot/net0_log.json")
        );
        assert_eq!(
            derive_log_path(Path::new("net1.json")),
            PathBuf::from("plot/net1_log.json")
        );
    }
}
