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

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

fn ragkit_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("ragkit"));
    cmd.env("RAGKIT_RETRIEVAL__MIN_SIMILARITY_SCORE", "0.0");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn normalize_json(mut value: Value) -> Value {
    if let Some(stats) = value.get_mut("stats")
        && let Some(obj) = stats.as_object_mut()
    {
        obj.insert("took_ms".to_string(), json!(0));
    }
    strip_mtime(&mut value);
    value
}

fn strip_mtime(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.contains_key("mtime") {
                map.insert("mtime".to_string(), json!(""));
            }
            for v in map.values_mut() {
                strip_mtime(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_mtime(v);
            }
        }
        _ => {}
    }
}

fn run_stdout(cmd: &mut Command, cwd: &Path) -> String {
    let output = cmd.current_dir(cwd).output().expect("run command");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn run_json(cmd: &mut Command, cwd: &Path) -> Value {
    serde_json::from_str(&run_stdout(cmd, cwd)).expect("parse json")
}

fn assert_repeatable(args: &[&str], runs: usize, cwd: &Path) {
    let mut baseline: Option<Value> = None;
    for _ in 0..runs {
        let mut cmd = ragkit_cmd();
        cmd.args(args);
        let json = normalize_json(run_json(&mut cmd, cwd));
        if let Some(ref expected) = baseline {
            assert_eq!(&json, expected);
        } else {
            baseline = Some(json);
        }
    }
}

#[test]
fn deterministic_outputs() {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path();
    fs::create_dir_all(root.join("docs")).expect("docs dir");
    fs::write(root.join("docs/a.txt"), "alpha beta gamma\n").expect("write file");
    fs::write(root.join("docs/b.txt"), "beta gamma delta\n").expect("write file");
    fs::write(root.join("docs/c.txt"), "gamma delta epsilon\n").expect("write file");
    // same text under another path: equal scores, ties resolved by insertion order
    fs::write(root.join("docs/d.txt"), "alpha beta gamma\n").expect("write file");

    let mut cmd = ragkit_cmd();
    cmd.args(["init", "."]);
    assert!(cmd.current_dir(root).output().unwrap().status.success());

    let mut cmd = ragkit_cmd();
    cmd.args(["index", "docs", "--glob", "**/*.txt", "--json"]);
    assert!(cmd.current_dir(root).output().unwrap().status.success());

    assert_repeatable(&["search", "gamma", "--k", "4", "--json"], 20, root);
    assert_repeatable(&["search", "alpha beta", "--k", "2", "--json"], 10, root);

    let mut cmd = ragkit_cmd();
    cmd.args(["search", "alpha beta gamma", "--k", "2", "--json"]);
    let tied = run_json(&mut cmd, root);
    let sources: Vec<&str> = tied["results"]
        .as_array()
        .expect("results")
        .iter()
        .filter_map(|r| r["source_path"].as_str())
        .collect();
    assert_eq!(sources.len(), 2);
    assert!(sources[0].ends_with("a.txt"));
    assert!(sources[1].ends_with("d.txt"));

    let mut baseline: Option<String> = None;
    for _ in 0..10 {
        let mut cmd = ragkit_cmd();
        cmd.args(["prompt", "gamma delta", "--schema", "qna"]);
        let prompt = run_stdout(&mut cmd, root);
        match &baseline {
            Some(expected) => assert_eq!(&prompt, expected),
            None => baseline = Some(prompt),
        }
    }
}
