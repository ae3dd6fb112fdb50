//! Trace Analyzer
//!
//! Streams a routing trace and summarises how evenly tokens were spread across
//! experts. Records are treated as an unordered multiset, so traces appended by
//! several runs or interleaved writers analyse the same way.
//!
//! # Statistics
//!
//! ```text
//! count_i        = occurrences of expert i in any topk_ids (rank ignored)
//! utilization_i  = count_i / Σ count
//! entropy        = -Σ p_i · ln(p_i + ε)
//! ```
//!
//! Entropy is 0 when one expert takes every activation and ln(N) when all N experts
//! are used equally.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use serde::Serialize;

use crate::errors::{Result, RouteMapError};
use crate::trace_record::{MetaRecord, RouteRecord, TraceRecord};

/// Guards `ln(0)` in the entropy sum
pub const ENTROPY_EPSILON: f64 = 1e-12;

/// Experts listed in the text report
const REPORT_TOP_N: usize = 3;

/// Load-balance statistics for one trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub num_experts: usize,
    /// Activations per expert, including zeros for unused experts
    pub counts: BTreeMap<usize, u64>,
    pub total_activations: u64,
    /// `counts[i] / total_activations`, indexed by expert
    pub utilization: Vec<f64>,
    /// Every expert ranked by count (descending), ties by ascending index
    pub top_n: Vec<(usize, u64)>,
    pub entropy: f64,
    pub route_records: u64,
    pub meta_records: u64,
    /// Lines that were not valid records
    pub skipped_lines: u64,
    /// First meta header seen
    pub meta: Option<MetaRecord>,
    /// Route records per layer id
    pub layer_records: BTreeMap<i64, u64>,
    /// Mean of Σ topk_weights over route records
    pub mean_weight_mass: f64,
}

/// Incremental state while reading a trace
#[derive(Debug)]
pub struct TraceAccumulator {
    num_experts: usize,
    counts: BTreeMap<usize, u64>,
    route_records: u64,
    meta_records: u64,
    skipped_lines: u64,
    /// Route records rejected for naming an expert `>= num_experts`
    out_of_range: u64,
    meta: Option<MetaRecord>,
    layer_records: BTreeMap<i64, u64>,
    weight_mass: f64,
}

impl TraceAccumulator {
    /// Accumulator over experts `0..num_experts`
    pub fn new(num_experts: usize) -> Self {
        TraceAccumulator {
            num_experts,
            counts: BTreeMap::new(),
            route_records: 0,
            meta_records: 0,
            skipped_lines: 0,
            out_of_range: 0,
            meta: None,
            layer_records: BTreeMap::new(),
            weight_mass: 0.0,
        }
    }

    /// Feed one trace line. Blank lines are ignored; anything else that is not a
    /// record is counted as skipped.
    pub fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match TraceRecord::from_json_line(line) {
            Ok(record) => self.push_record(record),
            Err(_) => self.skipped_lines += 1,
        }
    }

    pub fn push_record(&mut self, record: TraceRecord) {
        match record {
            TraceRecord::Meta(meta) => {
                self.meta_records += 1;
                if self.meta.is_none() {
                    self.meta = Some(meta);
                }
            }
            TraceRecord::Route(route) => self.push_route(&route),
        }
    }

    /// A route naming an unknown expert is malformed as a whole and counts as
    /// one skipped line.
    fn push_route(&mut self, route: &RouteRecord) {
        if route.topk_ids.iter().any(|&e| e >= self.num_experts) {
            self.out_of_range += 1;
            self.skipped_lines += 1;
            return;
        }
        self.route_records += 1;
        *self.layer_records.entry(route.layer).or_insert(0) += 1;
        self.weight_mass += route.weight_mass();
        for &expert in &route.topk_ids {
            *self.counts.entry(expert).or_insert(0) += 1;
        }
    }

    /// Close the accumulation into a [`Summary`]
    pub fn finish(self) -> Summary {
        let num_experts = self.num_experts;
        if self.out_of_range > 0 {
            tracing::warn!(
                num_experts,
                records = self.out_of_range,
                "Skipped route records naming experts beyond the configured count"
            );
        }
        if self.skipped_lines > 0 {
            tracing::warn!(skipped = self.skipped_lines, "Skipped malformed trace lines");
        }

        let mut counts: BTreeMap<usize, u64> = (0..num_experts).map(|i| (i, 0)).collect();
        counts.extend(self.counts);

        let total_activations: u64 = counts.values().sum();
        let utilization: Vec<f64> = counts
            .values()
            .map(|&c| {
                if total_activations == 0 {
                    0.0
                } else {
                    c as f64 / total_activations as f64
                }
            })
            .collect();

        let mut top_n: Vec<(usize, u64)> = counts.iter().map(|(&e, &c)| (e, c)).collect();
        top_n.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mean_weight_mass = if self.route_records == 0 {
            0.0
        } else {
            self.weight_mass / self.route_records as f64
        };

        Summary {
            num_experts,
            entropy: entropy(&utilization),
            counts,
            total_activations,
            utilization,
            top_n,
            route_records: self.route_records,
            meta_records: self.meta_records,
            skipped_lines: self.skipped_lines,
            meta: self.meta,
            layer_records: self.layer_records,
            mean_weight_mass,
        }
    }
}

/// `-Σ p · ln(p + ε)`, clamped at zero
pub fn entropy(probs: &[f64]) -> f64 {
    let h: f64 = probs
        .iter()
        .map(|&p| -p * (p + ENTROPY_EPSILON).ln())
        .sum();
    h.max(0.0)
}

/// Analyse the trace at `path`
///
/// # Errors
///
/// Returns `RouteMapError::TraceNotFound` if `path` does not exist. A file without
/// route records yields an empty summary, not an error.
pub fn analyze(path: &Path, num_experts: usize) -> Result<Summary> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => RouteMapError::TraceNotFound {
            path: path.display().to_string(),
        },
        _ => RouteMapError::from(e),
    })?;

    let summary = analyze_reader(BufReader::new(file), num_experts)?;
    tracing::info!(
        path = %path.display(),
        route_records = summary.route_records,
        total_activations = summary.total_activations,
        "Analyzed routing trace"
    );
    Ok(summary)
}

/// Analyse a trace one line at a time
///
/// Lines that are not valid UTF-8 are skipped like any other malformed line.
pub fn analyze_reader<R: BufRead>(mut reader: R, num_experts: usize) -> Result<Summary> {
    let mut acc = TraceAccumulator::new(num_experts);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        match std::str::from_utf8(&buf) {
            Ok(line) => acc.push_line(line),
            Err(_) => acc.skipped_lines += 1,
        }
    }
    Ok(acc.finish())
}

#[derive(Serialize)]
struct CsvRow {
    expert: usize,
    count: u64,
    utilization: f64,
}

impl Summary {
    /// The `n` most used experts
    pub fn top(&self, n: usize) -> &[(usize, u64)] {
        &self.top_n[..n.min(self.top_n.len())]
    }

    /// True when the trace held no route records
    pub fn is_empty(&self) -> bool {
        self.route_records == 0
    }

    /// ln(number of experts), the entropy of perfectly uniform routing
    pub fn max_entropy(&self) -> f64 {
        if self.num_experts > 1 {
            (self.num_experts as f64).ln()
        } else {
            0.0
        }
    }

    /// Entropy scaled to [0, 1]
    pub fn normalized_entropy(&self) -> f64 {
        let max = self.max_entropy();
        if max > 0.0 {
            self.entropy / max
        } else {
            0.0
        }
    }

    pub fn render_report(&self) -> String {
        let top = self.top(REPORT_TOP_N);
        let top1 = top
            .first()
            .filter(|(_, c)| *c > 0)
            .map_or("n/a".to_string(), |(e, _)| format!("#{}", e));
        let top_list = top
            .iter()
            .filter(|(_, c)| *c > 0)
            .map(|(e, c)| format!("#{} ({} hits)", e, c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = String::new();
        if let Some(meta) = &self.meta {
            out.push_str(&format!("Model: {} (top_k {})\n", meta.model_id, meta.top_k));
        }
        out.push_str(&format!(
            "Route Records: {} ({} skipped lines)\n",
            self.route_records, self.skipped_lines
        ));
        out.push_str(&format!("Total Activations: {}\n", self.total_activations));
        out.push_str(&format!("Top-1 Expert: {}\n", top1));
        out.push_str(&format!(
            "Top {} Experts: {}\n",
            REPORT_TOP_N,
            if top_list.is_empty() { "n/a" } else { top_list.as_str() }
        ));
        out.push_str(&format!(
            "Entropy: {:.4} (max {:.4}, normalized {:.3})\n",
            self.entropy,
            self.max_entropy(),
            self.normalized_entropy()
        ));
        out
    }

    /// Write `expert,count,utilization` rows for plotting
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for ((&expert, &count), &utilization) in self.counts.iter().zip(&self.utilization) {
            wtr.serialize(CsvRow {
                expert,
                count,
                utilization,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_report())
    }
}
