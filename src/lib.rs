//! sched-energy library.
//!
//! Replays a scheduler/binder trace of a big.LITTLE device, rebuilds the
//! per-thread task timelines and binder transactions and attributes an
//! energy cost to every task with a device power model.
//!
//! # Modules
//!
//! - [`event`] - Typed trace events and the JSON-lines reader
//! - [`pid`] - Thread classification
//! - [`metrics`] - Utilization, temperature and GPU lookups
//! - [`power`] - Device power models
//! - [`task`] / [`branch`] / [`tree`] - The replay engine
//! - [`report`] - Energy report types and output
//!
//! # Example
//!
//! ```no_run
//! use sched_energy::{sched_energy, Config};
//! use std::path::PathBuf;
//!
//! let config = Config {
//!     events: PathBuf::from("trace.jsonl"),
//!     pids: PathBuf::from("pids.json"),
//!     ..Config::default()
//! };
//! let summary = sched_energy(&config).expect("replay failed");
//! println!("{:.6} J", summary.totals.total_joules);
//! ```

pub mod binder;
pub mod branch;
pub mod config;
pub mod core_state;
pub mod event;
pub mod graph;
pub mod metrics;
pub mod pid;
pub mod power;
pub mod report;
pub mod snapshot;
pub mod task;
pub mod tree;

#[cfg(test)]
mod test_utils;

use anyhow::{bail, Result};
use tracing::info;

pub use config::{Config, OutputFormat, Topology};
pub use event::{read_events, Event};
pub use metrics::MetricsContext;
pub use pid::{PidClassifier, PidTable};
pub use power::{model_for_device, PowerModel};
pub use report::{write_report, TreeSummary};
pub use snapshot::InitialMetrics;
pub use tree::{ProcessTree, TimeWindow};

/// Run a full replay as described by `config`.
///
/// Loads the pid table and events, compiles the metrics lookups over the
/// replayed window, seeds the tree and replays every relevant event. The
/// dependency graph is written to `config.graph` when set.
pub fn sched_energy(config: &Config) -> Result<TreeSummary> {
    config.validate()?;

    let classifier = PidTable::load(&config.pids)?;
    let events: Vec<Event> = read_events(&config.events)?
        .into_iter()
        .filter(event::is_relevant)
        .collect();
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        bail!("No relevant events in {}", config.events.display());
    };
    info!(
        "{} relevant events, {} threads classified",
        events.len(),
        classifier.len()
    );

    let window = TimeWindow::new(
        config.window_start.unwrap_or(0),
        config.window_end.unwrap_or(u64::MAX),
    );
    // lookups are dense, so only compile what the trace covers
    let start = window.start.max(first.ts());
    let end = window.end.min(last.ts());
    if start > end {
        bail!(
            "Window [{}, {}] does not overlap the trace [{}, {}]",
            window.start,
            window.end,
            first.ts(),
            last.ts()
        );
    }

    let metrics = MetricsContext::from_events(
        &events,
        config.topology.clone(),
        config.util_window_us,
        config.default_temperature,
        start,
        end,
        config.workers,
    )?;
    let model = model_for_device(&config.device)?;

    let initial = if let Some(path) = &config.snapshot {
        InitialMetrics::load(path)?
    } else if let Some(dir) = &config.sysfs {
        InitialMetrics::from_sysfs(dir)?
    } else {
        InitialMetrics::default()
    };

    let mut tree = ProcessTree::new(
        metrics,
        model,
        Box::new(classifier),
        config.series_interval_us,
    );
    if config.graph.is_some() {
        tree = tree.with_graph();
    }
    tree.seed(&initial)?;

    let subgraph = config.graph.is_some();
    for event in &events {
        tree.handle_event(event, subgraph, &window)?;
    }

    let summary = tree.finish_tree()?;
    if let (Some(path), Some(graph)) = (&config.graph, tree.graph()) {
        graph.write_dot(path)?;
        info!(
            "Wrote {} nodes and {} edges to {}",
            graph.node_count(),
            graph.edge_count(),
            path.display()
        );
    }
    Ok(summary)
}
