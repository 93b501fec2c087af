//! Boundary benchmark: how result size affects the latency of getting a
//! run's output back through the runner stage, the frame protocol and
//! rehydration.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::RuntimeError;
use crate::lang::CompiledUnit;
use crate::metrics;
use crate::model::{PipelineConfig, PipelineState, RequestId};
use crate::orchestrator::Pipeline;
use crate::output::{OutputItem, Value};
use crate::stages::{chunk_replies, protocol, Runner, ScriptCompiler};

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub sizes: Vec<usize>,
    pub iterations: usize,
    pub chunk_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchRow {
    pub items: usize,
    pub mode: &'static str,
    pub frames: usize,
    pub frame_bytes: usize,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p25_ms: Option<f64>,
    pub p75_ms: Option<f64>,
}

/// Ignores the unit and emits a fixed number of print items.
struct SyntheticRunner {
    items: usize,
}

impl Runner for SyntheticRunner {
    fn run(&mut self, _unit: &CompiledUnit) -> Result<Vec<OutputItem>, RuntimeError> {
        Ok(synthetic_items(self.items))
    }
}

fn synthetic_items(n: usize) -> Vec<OutputItem> {
    (0..n)
        .map(|i| OutputItem::print(Value::Str(format!("line {i}: the quick brown fox"))))
        .collect()
}

/// Frames and bytes a run of `items` prints costs on the wire.
fn wire_cost(items: usize, chunk_items: usize) -> Result<(usize, usize)> {
    let records = synthetic_items(items).iter().map(OutputItem::to_record).collect();
    let replies = chunk_replies(RequestId(0), records, chunk_items);
    let mut bytes = 0;
    for reply in &replies {
        bytes += protocol::encode(reply)?.len();
    }
    Ok((replies.len(), bytes))
}

pub async fn run_bench(cfg: &BenchConfig) -> Result<Vec<BenchRow>> {
    let mut rows = Vec::new();
    for &items in &cfg.sizes {
        for (mode, chunk_items) in [("single", 0), ("chunked", cfg.chunk_items)] {
            rows.push(bench_one(items, mode, chunk_items, cfg.iterations).await?);
        }
    }
    Ok(rows)
}

async fn bench_one(
    items: usize,
    mode: &'static str,
    chunk_items: usize,
    iterations: usize,
) -> Result<BenchRow> {
    let pipeline_cfg = PipelineConfig {
        chunk_items,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::start(pipeline_cfg, ScriptCompiler, SyntheticRunner { items }, None)?;
    let mut hist = Histogram::<u64>::new_with_bounds(1, 600_000_000, 3)
        .context("failed to create latency histogram")?;
    let mut samples_ms = Vec::with_capacity(iterations);

    for _ in 0..iterations {
        let started = Instant::now();
        let request = pipeline.compile_and_run("");
        let state = pipeline.settled(request).await?;
        let elapsed = started.elapsed();
        match &state {
            PipelineState::Succeeded { result, .. } if result.items.len() == items => {}
            other => bail!(
                "benchmark run with {items} items ended as {}: {:?}",
                other.label(),
                other.display_text()
            ),
        }
        hist.record((elapsed.as_micros() as u64).max(1))
            .context("latency out of histogram range")?;
        samples_ms.push(elapsed.as_secs_f64() * 1000.0);
    }
    pipeline.shutdown().await?;

    let (frames, frame_bytes) = wire_cost(items, chunk_items)?;
    let summary = metrics::compute_metrics(&samples_ms);
    tracing::debug!(items, mode, frames, frame_bytes, "benchmark size done");
    Ok(BenchRow {
        items,
        mode,
        frames,
        frame_bytes,
        p50_us: hist.value_at_quantile(0.5),
        p99_us: hist.value_at_quantile(0.99),
        max_us: hist.max(),
        mean_ms: summary.map(|s| s.0),
        median_ms: summary.map(|s| s.1),
        p25_ms: summary.map(|s| s.2),
        p75_ms: summary.map(|s| s.3),
    })
}

/// Render rows as an aligned table.
pub fn format_rows(rows: &[BenchRow]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:>8} {:>8} {:>7} {:>11} {:>9} {:>9} {:>9} {:>9}",
        "items", "mode", "frames", "bytes", "p50 us", "p99 us", "max us", "mean ms"
    )];
    for row in rows {
        lines.push(format!(
            "{:>8} {:>8} {:>7} {:>11} {:>9} {:>9} {:>9} {:>9}",
            row.items,
            row.mode,
            row.frames,
            row.frame_bytes,
            row.p50_us,
            row.p99_us,
            row.max_us,
            row.mean_ms
                .map(|m| format!("{m:.3}"))
                .unwrap_or_else(|| "-".to_string()),
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_cost_counts_frames() {
        let (frames, bytes) = wire_cost(10, 4).unwrap();
        assert_eq!(frames, 3);
        let (single_frames, single_bytes) = wire_cost(10, 0).unwrap();
        assert_eq!(single_frames, 1);
        assert!(bytes > single_bytes);
    }

    #[tokio::test]
    async fn test_small_bench_completes() {
        let cfg = BenchConfig {
            sizes: vec![1, 50],
            iterations: 3,
            chunk_items: 16,
        };
        let rows = run_bench(&cfg).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].items, 50);
        assert_eq!(rows[3].mode, "chunked");
        assert_eq!(rows[3].frames, 4);
        assert!(rows.iter().all(|r| r.max_us >= r.p50_us));
        assert_eq!(format_rows(&rows).len(), 5);
    }
}
