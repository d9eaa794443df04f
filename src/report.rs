// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::metrics::MetricsReport;

pub const MARKDOWN_FILE: &str = "metrics_report.md";
pub const JSON_FILE: &str = "metrics.json";

const MIN_PASS_RATE: f64 = 80.0;
const MAX_ERROR_RATE: f64 = 5.0;
const MAX_LOW_COVERAGE: f64 = 30.0;
const MAX_MEAN_LATENCY_MS: f64 = 5000.0;

pub fn recommendations(report: &MetricsReport) -> Vec<String> {
    let mut out = Vec::new();
    if report.evaluated > 0 && report.schema_pass_rate < MIN_PASS_RATE {
        out.push(format!(
            "Schema pass rate is {:.1}%, below {MIN_PASS_RATE:.0}%: tighten the output constraints in the prompt or lower the temperature.",
            report.schema_pass_rate
        ));
    }
    if report.error_rate > MAX_ERROR_RATE {
        out.push(format!(
            "Error rate is {:.1}%, above {MAX_ERROR_RATE:.0}%: check that the model backend is reachable and raise generation.timeout_secs.",
            report.error_rate
        ));
    }
    let coverage_total: usize = report.context_coverage.values().sum();
    if coverage_total > 0 {
        let low = report.context_coverage.get("low").copied().unwrap_or(0);
        let low_share = (low * 100) as f64 / coverage_total as f64;
        if low_share > MAX_LOW_COVERAGE {
            out.push(format!(
                "{low_share:.1}% of rag answers report low context coverage: index more documents or adjust chunk_size and top_k."
            ));
        }
    }
    if let Some(latency) = &report.latency
        && latency.mean_ms > MAX_MEAN_LATENCY_MS
    {
        out.push(format!(
            "Mean latency is {:.0} ms: use a smaller model, lower max_tokens or reduce num_ctx.",
            latency.mean_ms
        ));
    }
    if report.evaluated > 0 && report.schema_pass_rate >= 90.0 && report.error_rate < 2.0 {
        out.push("Excellent: outputs are consistently schema-valid with few errors.".to_string());
    }
    out
}

pub fn render_markdown(report: &MetricsReport) -> String {
    let mut out = String::new();
    out.push_str("# Evaluation Report\n\n## Summary\n\n");
    out.push_str("| metric | value |\n|---|---|\n");
    let _ = writeln!(out, "| total tasks | {} |", report.total);
    let _ = writeln!(out, "| evaluated | {} |", report.evaluated);
    let _ = writeln!(out, "| schema valid | {} |", report.valid);
    let _ = writeln!(out, "| schema invalid | {} |", report.invalid);
    let _ = writeln!(out, "| errored | {} |", report.errored);
    let _ = writeln!(out, "| schema pass rate | {:.1}% |", report.schema_pass_rate);
    let _ = writeln!(out, "| error rate | {:.1}% |", report.error_rate);

    if let Some(latency) = &report.latency {
        out.push_str("\n## Latency\n\n| min | max | mean | median |\n|---|---|---|---|\n");
        let _ = writeln!(
            out,
            "| {} ms | {} ms | {:.1} ms | {:.1} ms |",
            latency.min_ms, latency.max_ms, latency.mean_ms, latency.median_ms
        );
    }

    if !report.errors_by_kind.is_empty() {
        out.push_str("\n## Errors\n\n");
        for (kind, count) in &report.errors_by_kind {
            let _ = writeln!(out, "- {kind}: {count}");
        }
    }

    if !report.per_schema.is_empty() {
        out.push_str("\n## Per Schema\n\n| schema | total | valid | errored | pass rate |\n|---|---|---|---|---|\n");
        for (schema, row) in &report.per_schema {
            let _ = writeln!(
                out,
                "| {schema} | {} | {} | {} | {:.1}% |",
                row.total, row.valid, row.errored, row.pass_rate
            );
        }
    }

    if !report.confidence.is_empty() {
        out.push_str("\n## Confidence\n\n");
        for (level, count) in &report.confidence {
            let _ = writeln!(out, "- {level}: {count}");
        }
    }

    if !report.context_coverage.is_empty() {
        out.push_str("\n## Context Coverage\n\n");
        for (level, count) in &report.context_coverage {
            let _ = writeln!(out, "- {level}: {count}");
        }
    }

    if report.retrieval.rag_tasks > 0 {
        out.push_str("\n## Retrieval\n\n");
        let _ = writeln!(out, "- rag tasks: {}", report.retrieval.rag_tasks);
        let _ = writeln!(out, "- mean chunks: {:.2}", report.retrieval.mean_chunks);
        let _ = writeln!(
            out,
            "- tasks without context: {}",
            report.retrieval.zero_context_tasks
        );
    }

    if let Some(cls) = &report.classification {
        out.push_str("\n## Classification\n\n");
        let _ = writeln!(
            out,
            "Samples: {} | accuracy: {:.3} | macro F1: {:.3}\n",
            cls.samples, cls.accuracy, cls.macro_f1
        );
        out.push_str("| class | precision | recall | f1 | support |\n|---|---|---|---|---|\n");
        for (label, m) in &cls.per_class {
            let _ = writeln!(
                out,
                "| {label} | {:.3} | {:.3} | {:.3} | {} |",
                m.precision, m.recall, m.f1, m.support
            );
        }
        out.push_str("\nConfusion matrix (rows expected, columns predicted):\n\n");
        let _ = writeln!(out, "| | {} |", cls.labels.join(" | "));
        let _ = writeln!(out, "|---|{}", "---|".repeat(cls.labels.len()));
        for (label, row) in cls.labels.iter().zip(&cls.confusion_matrix) {
            let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            let _ = writeln!(out, "| {label} | {} |", cells.join(" | "));
        }
    }

    if let Some(overlap) = &report.overlap {
        out.push_str("\n## Reference Overlap\n\n");
        let _ = writeln!(
            out,
            "Samples: {} | ROUGE-1: {:.3} | ROUGE-2: {:.3} | ROUGE-L: {:.3}",
            overlap.samples, overlap.rouge1, overlap.rouge2, overlap.rouge_l
        );
    }

    out.push_str("\n## Recommendations\n\n");
    let recs = recommendations(report);
    if recs.is_empty() {
        out.push_str("- No issues detected.\n");
    }
    for rec in recs {
        let _ = writeln!(out, "- {rec}");
    }
    out
}

/// Writes the markdown and JSON reports into `out_dir`.
pub fn write_reports(out_dir: &Path, report: &MetricsReport) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let markdown = out_dir.join(MARKDOWN_FILE);
    std::fs::write(&markdown, render_markdown(report))
        .with_context(|| format!("write {}", markdown.display()))?;
    let json = out_dir.join(JSON_FILE);
    let text = serde_json::to_string_pretty(report)?;
    std::fs::write(&json, text + "\n").with_context(|| format!("write {}", json.display()))?;
    Ok((markdown, json))
}
