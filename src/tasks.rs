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

//! Task files in and result files out.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde_json::Value;

use crate::model::Task;
use crate::model::TaskResult;

const CSV_ID: &str = "task_id";
const CSV_TYPE: &str = "task_type";
const CSV_INPUT: &str = "input_text";
const CSV_EXPECTED: &str = "expected";

/// Reads tasks from `.csv`, `.jsonl` or `.json` (one object or an array).
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let tasks = match ext.as_str() {
        "csv" => load_csv(path)?,
        "jsonl" | "ndjson" => load_jsonl(path)?,
        "json" => {
            let text =
                std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            let value: Value = serde_json::from_str(&text).context("parse task file")?;
            match value {
                Value::Array(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| task_from_value(item, i))
                    .collect::<Result<Vec<_>>>()?,
                other => vec![task_from_value(other, 0)?],
            }
        }
        _ => anyhow::bail!(
            "unsupported task file {}; expected .csv, .jsonl or .json",
            path.display()
        ),
    };
    Ok(tasks)
}

fn load_csv(path: &Path) -> Result<Vec<Task>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    if !headers.iter().any(|h| h == CSV_INPUT) {
        anyhow::bail!("{} has no `{CSV_INPUT}` column", path.display());
    }
    let mut tasks = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("row {}", i + 1))?;
        let mut task = Task::new(format!("task_{}", i + 1), "");
        for (header, value) in headers.iter().zip(record.iter()) {
            match header {
                CSV_ID if !value.trim().is_empty() => task.task_id = value.to_string(),
                CSV_ID => {}
                CSV_TYPE => task.schema_type = non_empty(value),
                CSV_INPUT => task.input = value.to_string(),
                CSV_EXPECTED => task.expected = non_empty(value),
                other => {
                    task.fields.insert(other.to_string(), value.to_string());
                }
            }
        }
        tasks.push(task);
    }
    Ok(tasks)
}

fn load_jsonl(path: &Path) -> Result<Vec<Task>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tasks = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).with_context(|| format!("line {}", i + 1))?;
        tasks.push(task_from_value(value, tasks.len())?);
    }
    Ok(tasks)
}

/// Accepts `input` or `text` for the input, `schema_type` or `task_type`
/// for the schema. Other scalar keys become fields.
fn task_from_value(value: Value, position: usize) -> Result<Task> {
    let Value::Object(map) = value else {
        anyhow::bail!("task {} is not a JSON object", position + 1);
    };
    let mut task = Task::new(format!("task_{}", position + 1), "");
    let mut input = None;
    let mut fields = BTreeMap::new();
    for (key, value) in map {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            other => other.to_string(),
        };
        match key.as_str() {
            "task_id" => task.task_id = text,
            "input" | "input_text" => input = Some(text),
            "text" if input.is_none() => input = Some(text),
            "schema_type" | "task_type" => task.schema_type = non_empty(&text),
            "expected" => task.expected = non_empty(&text),
            _ => {
                fields.insert(key, text);
            }
        }
    }
    task.input = input.with_context(|| format!("task {} has no `input` or `text`", task.task_id))?;
    task.fields = fields;
    Ok(task)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

pub fn save_results_json(path: &Path, results: &[TaskResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, results)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Reads results written by [`save_results_json`].
pub fn load_results(path: &Path) -> Result<Vec<TaskResult>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text).context("parse results")?;
    let results = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(mut map) => match map.remove("results") {
            Some(inner) => serde_json::from_value(inner)?,
            None => vec![serde_json::from_value(Value::Object(map))?],
        },
        _ => anyhow::bail!("{} holds no results", path.display()),
    };
    Ok(results)
}

/// One row per result; the parsed output is embedded as compact JSON.
pub fn save_results_csv(path: &Path, results: &[TaskResult]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    writer.write_record([
        "task_id",
        "schema_type",
        "mode",
        "schema_valid",
        "confidence",
        "result_json",
        "latency_ms",
        "error",
    ])?;
    for result in results {
        let result_json = result
            .parsed_json
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        writer.write_record([
            result.task_id.as_str(),
            result.schema_type.map(|s| s.as_str()).unwrap_or(""),
            result.mode.as_str(),
            if result.schema_valid { "true" } else { "false" },
            result.confidence.map(|c| c.as_str()).unwrap_or(""),
            result_json.as_str(),
            result.latency_ms.to_string().as_str(),
            result.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
