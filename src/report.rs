//! Energy report produced by [`crate::tree::ProcessTree::finish_tree`].

use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::config::OutputFormat;
use crate::pid::ThreadClass;

/// Per-thread energy inside the report window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchEnergy {
    pub pid: u32,
    pub process: String,
    pub thread: String,
    pub class: ThreadClass,
    pub tasks: usize,
    pub binders: usize,
    pub big_joules: f64,
    pub little_joules: f64,
    pub total_joules: f64,
    pub duration_us: f64,
    pub cycles: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Totals {
    pub big_joules: f64,
    pub little_joules: f64,
    pub gpu_joules: f64,
    pub total_joules: f64,
}

/// One slot of the energy-vs-time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyBucket {
    pub start: u64,
    pub end: u64,
    pub cpu_joules: f64,
    pub gpu_joules: f64,
}

/// Counts of the anomalies recovered from while replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TreeStats {
    pub events: u64,
    pub out_of_window: u64,
    /// Replies with no pending call.
    pub dropped_replies: u64,
    /// Calls whose destination thread could not be determined.
    pub unresolved_transactions: u64,
    /// Completed transactions discarded because the woken thread could not
    /// be identified.
    pub unidentified_targets: u64,
    /// Calls still waiting for a reply when the trace ended.
    pub leaked_pending: u64,
    /// Completed transactions whose destination never woke.
    pub unmatched_completions: u64,
}

/// Operating point changes of one core, or of the GPU, inside the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitActivity {
    /// `cpuN` or `gpu`.
    pub unit: String,
    pub changes: usize,
    /// Operating point at the end of the replay.
    pub freq: u64,
    pub util: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSummary {
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
    pub branches: Vec<BranchEnergy>,
    pub totals: Totals,
    pub series: Vec<EnergyBucket>,
    pub activity: Vec<UnitActivity>,
    pub stats: TreeStats,
}

const MAX_COLUMN_WIDTH: usize = 40;

const BRANCH_HEADERS: [&str; 11] = [
    "pid",
    "process",
    "thread",
    "class",
    "tasks",
    "binders",
    "big_j",
    "little_j",
    "total_j",
    "duration_us",
    "cycles",
];

fn branch_row(b: &BranchEnergy) -> Vec<String> {
    vec![
        b.pid.to_string(),
        b.process.clone(),
        b.thread.clone(),
        b.class.to_string(),
        b.tasks.to_string(),
        b.binders.to_string(),
        format!("{:.6}", b.big_joules),
        format!("{:.6}", b.little_joules),
        format!("{:.6}", b.total_joules),
        format!("{:.0}", b.duration_us),
        format!("{:.0}", b.cycles),
    ]
}

fn write_table(out: &mut dyn Write, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    if rows.is_empty() {
        writeln!(out, "(no results)")?;
        return Ok(());
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, val) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(val.len());
            }
        }
    }
    for w in &mut widths {
        *w = (*w).min(MAX_COLUMN_WIDTH);
    }

    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, width)| format!("{h:width$}"))
        .collect();
    writeln!(out, "{}", header_line.join(" | "))?;

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    writeln!(out, "{}", sep.join("-+-"))?;

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(v, width)| {
                let width = *width;
                let truncated = if v.chars().count() > width && width > 3 {
                    let head: String = v.chars().take(width - 3).collect();
                    format!("{head}...")
                } else {
                    v.clone()
                };
                format!("{truncated:width$}")
            })
            .collect();
        writeln!(out, "{}", line.join(" | "))?;
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_csv(out: &mut dyn Write, summary: &TreeSummary) -> Result<()> {
    writeln!(out, "{}", BRANCH_HEADERS.join(","))?;
    for branch in &summary.branches {
        let row: Vec<String> = branch_row(branch).iter().map(|v| csv_field(v)).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}

fn write_text(out: &mut dyn Write, summary: &TreeSummary) -> Result<()> {
    match (summary.start_time, summary.finish_time) {
        (Some(start), Some(finish)) => writeln!(out, "Window: {start}us - {finish}us\n")?,
        _ => writeln!(out, "Window: no finished tasks\n")?,
    }

    let rows: Vec<Vec<String>> = summary.branches.iter().map(branch_row).collect();
    write_table(out, &BRANCH_HEADERS, &rows)?;

    let t = &summary.totals;
    writeln!(out)?;
    writeln!(
        out,
        "Total: {:.6} J (big {:.6} J, little {:.6} J, gpu {:.6} J)",
        t.total_joules, t.big_joules, t.little_joules, t.gpu_joules
    )?;

    if !summary.series.is_empty() {
        writeln!(out)?;
        let rows: Vec<Vec<String>> = summary
            .series
            .iter()
            .map(|b| {
                vec![
                    b.start.to_string(),
                    b.end.to_string(),
                    format!("{:.6}", b.cpu_joules),
                    format!("{:.6}", b.gpu_joules),
                ]
            })
            .collect();
        write_table(out, &["start_us", "end_us", "cpu_j", "gpu_j"], &rows)?;
    }

    if !summary.activity.is_empty() {
        writeln!(out)?;
        let rows: Vec<Vec<String>> = summary
            .activity
            .iter()
            .map(|a| {
                vec![
                    a.unit.clone(),
                    a.changes.to_string(),
                    (a.freq / 1_000_000).to_string(),
                    format!("{:.1}", a.util),
                ]
            })
            .collect();
        write_table(out, &["unit", "changes", "freq_mhz", "util"], &rows)?;
    }

    let s = &summary.stats;
    writeln!(out)?;
    writeln!(
        out,
        "{} events, {} outside window, {} dropped replies, {} unresolved, {} unidentified, {} leaked calls, {} unmatched completions",
        s.events,
        s.out_of_window,
        s.dropped_replies,
        s.unresolved_transactions,
        s.unidentified_targets,
        s.leaked_pending,
        s.unmatched_completions
    )?;
    Ok(())
}

/// Write `summary` to `out` in `format`.
pub fn write_report(out: &mut dyn Write, summary: &TreeSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => write_text(out, summary),
        OutputFormat::Csv => write_csv(out, summary),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, summary)?;
            writeln!(out)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TreeSummary {
        TreeSummary {
            start_time: Some(0),
            finish_time: Some(2_000),
            branches: vec![BranchEnergy {
                pid: 100,
                process: "com.example, debug".to_string(),
                thread: "main".to_string(),
                class: ThreadClass::App,
                tasks: 2,
                binders: 0,
                big_joules: 0.5,
                little_joules: 0.25,
                total_joules: 0.75,
                duration_us: 1_500.0,
                cycles: 1_600.0,
            }],
            totals: Totals {
                big_joules: 0.5,
                little_joules: 0.25,
                gpu_joules: 0.1,
                total_joules: 0.85,
            },
            series: vec![EnergyBucket {
                start: 0,
                end: 2_000,
                cpu_joules: 0.75,
                gpu_joules: 0.1,
            }],
            activity: vec![UnitActivity {
                unit: "cpu4".to_string(),
                changes: 3,
                freq: 1_844_000_000,
                util: 75.0,
            }],
            stats: TreeStats::default(),
        }
    }

    fn render(format: OutputFormat) -> String {
        let mut out = Vec::new();
        write_report(&mut out, &summary(), format).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_table() {
        let text = render(OutputFormat::Table);
        assert!(text.contains("Window: 0us - 2000us"));
        assert!(text.contains("pid | process"));
        assert!(text.contains("0.750000"));
        assert!(text.contains("Total: 0.850000 J"));
        assert!(text.contains("unit | changes | freq_mhz"));
        assert!(text.contains("1844"));
    }

    #[test]
    fn test_csv_quotes_fields() {
        let text = render(OutputFormat::Csv);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), BRANCH_HEADERS.join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("100,\"com.example, debug\",main,app,2,0,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_json() {
        let text = render(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["branches"][0]["pid"], 100);
        assert_eq!(value["branches"][0]["class"], "app");
        assert_eq!(value["totals"]["gpu_joules"], 0.1);
        assert_eq!(value["stats"]["dropped_replies"], 0);
        assert_eq!(value["activity"][0]["unit"], "cpu4");
        assert_eq!(value["activity"][0]["changes"], 3);
    }

    #[test]
    fn test_empty_table() {
        let mut empty = summary();
        empty.branches.clear();
        empty.series.clear();
        empty.activity.clear();
        empty.start_time = None;
        let mut out = Vec::new();
        write_report(&mut out, &empty, OutputFormat::Table).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("no finished tasks"));
        assert!(text.contains("(no results)"));
    }
}
