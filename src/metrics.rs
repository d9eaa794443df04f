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

//! Aggregate statistics over a set of task results.
//!
//! Results carrying an error are excluded from the pass-rate, latency and
//! quality figures and are counted separately.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::model::RunMode;
use crate::model::TaskResult;
use crate::schema::SchemaKind;

pub const NO_CONFIDENCE: &str = "none";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub total: usize,
    /// Results without an error; the pass-rate denominator.
    pub evaluated: usize,
    pub valid: usize,
    pub invalid: usize,
    pub errored: usize,
    /// Percent of `evaluated` that passed schema validation.
    pub schema_pass_rate: f64,
    /// Percent of `total` that errored.
    pub error_rate: f64,
    pub errors_by_kind: BTreeMap<String, usize>,
    pub latency: Option<LatencyStats>,
    pub confidence: BTreeMap<String, usize>,
    pub context_coverage: BTreeMap<String, usize>,
    pub retrieval: RetrievalStats,
    pub per_schema: BTreeMap<String, SchemaBreakdown>,
    pub classification: Option<ClassificationMetrics>,
    pub overlap: Option<OverlapMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub median_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub rag_tasks: usize,
    pub mean_chunks: f64,
    pub zero_context_tasks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaBreakdown {
    pub total: usize,
    pub valid: usize,
    pub errored: usize,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub samples: usize,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub per_class: BTreeMap<String, ClassMetrics>,
    /// Row and column order of `confusion_matrix`.
    pub labels: Vec<String>,
    /// `confusion_matrix[expected][predicted]`.
    pub confusion_matrix: Vec<Vec<usize>>,
}

/// Mean ROUGE F1 scores against reference texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapMetrics {
    pub samples: usize,
    pub rouge1: f64,
    pub rouge2: f64,
    pub rouge_l: f64,
}

pub fn aggregate(results: &[TaskResult]) -> MetricsReport {
    let total = results.len();
    let ok: Vec<&TaskResult> = results.iter().filter(|r| !r.is_error()).collect();
    let evaluated = ok.len();
    let valid = ok.iter().filter(|r| r.schema_valid).count();
    let errored = total - evaluated;

    let mut errors_by_kind = BTreeMap::new();
    for error in results.iter().filter_map(|r| r.error.as_ref()) {
        *errors_by_kind
            .entry(error.kind.as_str().to_string())
            .or_insert(0) += 1;
    }

    let mut confidence = BTreeMap::new();
    for result in &ok {
        let key = result.confidence.map(|c| c.as_str()).unwrap_or(NO_CONFIDENCE);
        *confidence.entry(key.to_string()).or_insert(0) += 1;
    }

    let mut context_coverage = BTreeMap::new();
    for result in ok.iter().filter(|r| r.schema_type == Some(SchemaKind::Rag)) {
        if let Some(coverage) = result.field_str("context_coverage") {
            *context_coverage.entry(coverage.to_string()).or_insert(0) += 1;
        }
    }

    MetricsReport {
        total,
        evaluated,
        valid,
        invalid: evaluated - valid,
        errored,
        schema_pass_rate: percent(valid, evaluated),
        error_rate: percent(errored, total),
        errors_by_kind,
        latency: latency_stats(&ok),
        confidence,
        context_coverage,
        retrieval: retrieval_stats(results),
        per_schema: per_schema(results),
        classification: classification_metrics(&ok),
        overlap: overlap_metrics(&ok),
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part * 100) as f64 / whole as f64
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn latency_stats(results: &[&TaskResult]) -> Option<LatencyStats> {
    let mut values: Vec<u64> = results.iter().map(|r| r.latency_ms).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let n = values.len();
    let median_ms = if n % 2 == 1 {
        values[n / 2] as f64
    } else {
        (values[n / 2 - 1] + values[n / 2]) as f64 / 2.0
    };
    Some(LatencyStats {
        min_ms: values[0],
        max_ms: values[n - 1],
        mean_ms: values.iter().sum::<u64>() as f64 / n as f64,
        median_ms,
    })
}

fn retrieval_stats(results: &[TaskResult]) -> RetrievalStats {
    let rag: Vec<&TaskResult> = results.iter().filter(|r| r.mode == RunMode::Rag).collect();
    let chunks: usize = rag.iter().map(|r| r.retrieved_chunk_ids.len()).sum();
    RetrievalStats {
        rag_tasks: rag.len(),
        mean_chunks: ratio(chunks, rag.len()),
        zero_context_tasks: rag.iter().filter(|r| r.retrieved_chunk_ids.is_empty()).count(),
    }
}

fn per_schema(results: &[TaskResult]) -> BTreeMap<String, SchemaBreakdown> {
    let mut map: BTreeMap<String, SchemaBreakdown> = BTreeMap::new();
    for result in results {
        let key = result
            .schema_type
            .map(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        let entry = map.entry(key).or_default();
        entry.total += 1;
        if result.is_error() {
            entry.errored += 1;
        } else if result.schema_valid {
            entry.valid += 1;
        }
    }
    for entry in map.values_mut() {
        entry.pass_rate = percent(entry.valid, entry.total - entry.errored);
    }
    map
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

fn classification_metrics(results: &[&TaskResult]) -> Option<ClassificationMetrics> {
    let pairs: Vec<(String, String)> = results
        .iter()
        .filter(|r| r.schema_type == Some(SchemaKind::Classification))
        .filter_map(|r| {
            let expected = r.expected.as_deref()?;
            let field = SchemaKind::Classification.label_field()?;
            let predicted = r.field_str(field)?;
            Some((normalize_label(expected), normalize_label(predicted)))
        })
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let labels: Vec<String> = pairs
        .iter()
        .flat_map(|(e, p)| [e.clone(), p.clone()])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let position: HashMap<&str, usize> = labels
        .iter()
        .enumerate()
        .map(|(i, l)| (l.as_str(), i))
        .collect();
    let mut confusion_matrix = vec![vec![0usize; labels.len()]; labels.len()];
    for (expected, predicted) in &pairs {
        confusion_matrix[position[expected.as_str()]][position[predicted.as_str()]] += 1;
    }

    let mut per_class = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        let tp = confusion_matrix[i][i];
        let support: usize = confusion_matrix[i].iter().sum();
        let predicted: usize = confusion_matrix.iter().map(|row| row[i]).sum();
        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        per_class.insert(
            label.clone(),
            ClassMetrics {
                precision,
                recall,
                f1: f1(precision, recall),
                support,
            },
        );
    }
    let correct = (0..labels.len()).map(|i| confusion_matrix[i][i]).sum();
    let macro_f1 = per_class.values().map(|c| c.f1).sum::<f64>() / labels.len() as f64;

    Some(ClassificationMetrics {
        samples: pairs.len(),
        accuracy: ratio(correct, pairs.len()),
        macro_f1,
        per_class,
        labels,
        confusion_matrix,
    })
}

fn overlap_metrics(results: &[&TaskResult]) -> Option<OverlapMetrics> {
    let scores: Vec<(f64, f64, f64)> = results
        .iter()
        .filter_map(|r| {
            let reference = r.expected.as_deref()?;
            let field = r.schema_type?.text_field()?;
            let candidate = r.field_str(field)?;
            Some(rouge_scores(candidate, reference))
        })
        .collect();
    if scores.is_empty() {
        return None;
    }
    let n = scores.len() as f64;
    Some(OverlapMetrics {
        samples: scores.len(),
        rouge1: scores.iter().map(|s| s.0).sum::<f64>() / n,
        rouge2: scores.iter().map(|s| s.1).sum::<f64>() / n,
        rouge_l: scores.iter().map(|s| s.2).sum::<f64>() / n,
    })
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// ROUGE-1, ROUGE-2 and ROUGE-L F1 of `candidate` against `reference`.
pub fn rouge_scores(candidate: &str, reference: &str) -> (f64, f64, f64) {
    let cand = tokens(candidate);
    let refr = tokens(reference);
    (
        rouge_n(&cand, &refr, 1),
        rouge_n(&cand, &refr, 2),
        rouge_l(&cand, &refr),
    )
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

fn rouge_n(cand: &[String], refr: &[String], n: usize) -> f64 {
    let cand_counts = ngram_counts(cand, n);
    let ref_counts = ngram_counts(refr, n);
    let cand_total: usize = cand_counts.values().sum();
    let ref_total: usize = ref_counts.values().sum();
    let overlap: usize = cand_counts
        .iter()
        .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    f1(ratio(overlap, cand_total), ratio(overlap, ref_total))
}

fn rouge_l(cand: &[String], refr: &[String]) -> f64 {
    if cand.is_empty() || refr.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; refr.len() + 1];
    let mut cur = vec![0usize; refr.len() + 1];
    for c in cand {
        for (j, r) in refr.iter().enumerate() {
            cur[j + 1] = if c == r {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let lcs = prev[refr.len()];
    f1(ratio(lcs, cand.len()), ratio(lcs, refr.len()))
}
