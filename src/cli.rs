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

use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(
    name = "ragkit",
    version,
    about = "Local retrieval-augmented generation with schema-checked JSON output"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new ragkit project
    Init {
        /// Project directory
        path: Option<PathBuf>,
    },

    /// Chunk, embed and index documents
    Index(IndexArgs),

    /// Retrieve the chunks nearest to a query
    Search(SearchArgs),

    /// Print the prompt a query would be sent with
    Prompt(PromptArgs),

    /// Run one task from the command line
    Ask(AskArgs),

    /// Run one task from a JSON file
    Process(ProcessArgs),

    /// Run a CSV or JSONL file of tasks
    Batch(BatchArgs),

    /// Compute metrics over saved results
    Evaluate(EvaluateArgs),

    /// List the output schemas
    Schemas {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index stats
    Stats {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Files or directories to index
    pub paths: Vec<PathBuf>,

    /// Glob to include
    #[arg(long)]
    pub glob: Option<String>,

    /// Ignore globs
    #[arg(long)]
    pub ignore: Vec<String>,

    /// Clear the index first
    #[arg(long)]
    pub rebuild: bool,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Query text
    pub query: String,

    /// Top-k results (defaults to retrieval.top_k)
    #[arg(long)]
    pub k: Option<usize>,

    /// Minimum similarity (defaults to retrieval.min_similarity_score)
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PromptArgs {
    /// Query text
    pub query: String,

    /// Output schema
    #[arg(long)]
    pub schema: Option<String>,

    /// Skip retrieval
    #[arg(long)]
    pub no_rag: bool,
}

#[derive(Args, Debug)]
pub struct AskArgs {
    /// Task input
    pub text: String,

    /// Output schema
    #[arg(long)]
    pub schema: Option<String>,

    /// Skip retrieval
    #[arg(long)]
    pub no_rag: bool,

    /// Write the result as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// JSON task file
    pub file: PathBuf,

    /// Schema for tasks that name none
    #[arg(long)]
    pub schema: Option<String>,

    /// Skip retrieval
    #[arg(long)]
    pub no_rag: bool,

    /// Write results as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// CSV or JSONL task file
    pub file: PathBuf,

    /// Schema for tasks that name none
    #[arg(long)]
    pub schema: Option<String>,

    /// Skip retrieval
    #[arg(long)]
    pub no_rag: bool,

    /// Concurrent tasks (defaults to batch.workers)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Write results as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Write results as CSV
    #[arg(long)]
    pub csv_out: Option<PathBuf>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Results JSON written by `ask`, `process` or `batch`
    pub results: PathBuf,

    /// Directory for metrics_report.md and metrics.json
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}
