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

mod chunk;
mod cli;
mod config;
mod embed;
mod error;
mod generate;
mod ingest;
mod logging;
mod metrics;
mod model;
mod ollama;
mod output;
mod pipeline;
mod prompt;
mod report;
mod schema;
mod store;
mod tasks;
mod validate;

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::chunk::Chunker;
use crate::cli::AskArgs;
use crate::cli::BatchArgs;
use crate::cli::Cli;
use crate::cli::Commands;
use crate::cli::EvaluateArgs;
use crate::cli::IndexArgs;
use crate::cli::ProcessArgs;
use crate::cli::PromptArgs;
use crate::cli::SearchArgs;
use crate::config::CONFIG_FILE;
use crate::config::Config;
use crate::config::ConfigCtx;
use crate::error::RagError;
use crate::generate::RetryPolicy;
use crate::model::RunMode;
use crate::model::Task;
use crate::model::TaskResult;
use crate::output::IndexedOut;
use crate::output::JsonResponse;
use crate::output::StatsOut;
use crate::output::TasksOut;
use crate::output::print_json;
use crate::pipeline::Indexer;
use crate::pipeline::Pipeline;
use crate::schema::SchemaKind;
use crate::store::StoreMode;
use crate::store::VectorIndex;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::Index(args) => {
            let json = args.json;
            handle_result(cmd_index(args), json)
        }
        Commands::Search(args) => {
            let json = args.json;
            handle_result(cmd_search(args), json)
        }
        Commands::Prompt(args) => cmd_prompt(args),
        Commands::Ask(args) => {
            let json = args.json;
            handle_result(cmd_ask(args), json)
        }
        Commands::Process(args) => {
            let json = args.json;
            handle_result(cmd_process(args), json)
        }
        Commands::Batch(args) => {
            let json = args.json;
            handle_result(cmd_batch(args), json)
        }
        Commands::Evaluate(args) => {
            let json = args.json;
            handle_result(cmd_evaluate(args), json)
        }
        Commands::Schemas { json } => cmd_schemas(json),
        Commands::Stats { json } => handle_result(cmd_stats(json), json),
    }
}

/// With `--json`, failures are also reported as an error envelope on stdout.
fn handle_result(result: Result<()>, json: bool) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if json {
                let (code, hint) = match err.downcast_ref::<RagError>() {
                    Some(rag) => (rag.kind().as_str(), hint_for(rag)),
                    None => ("error", None),
                };
                let details = err.chain().nth(1).map(|cause| cause.to_string());
                let resp = JsonResponse::error(code, &err.to_string()).with_details(details, hint);
                print_json(&resp)?;
            }
            Err(err)
        }
    }
}

fn hint_for(err: &RagError) -> Option<String> {
    match err {
        RagError::ModelUnavailable { .. } => {
            Some("check that the model server is running and the model is pulled".to_string())
        }
        RagError::ModelRejected { .. } => {
            Some("check the model name; `ollama pull <model>` fetches a missing model".to_string())
        }
        RagError::UnknownSchema { available, .. } => Some(format!("available: {available}")),
        RagError::Config(_) => Some(format!("check {CONFIG_FILE} and RAGKIT_* variables")),
        _ => None,
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    Ok(runtime.block_on(future))
}

fn load_project() -> Result<ConfigCtx> {
    let ctx = ConfigCtx::load_from_cwd()?;
    logging::init(&ctx.config.logging);
    Ok(ctx)
}

fn discover_project() -> Result<ConfigCtx> {
    let ctx = ConfigCtx::discover_from_cwd()?;
    logging::init(&ctx.config.logging);
    Ok(ctx)
}

fn run_mode(no_rag: bool) -> RunMode {
    if no_rag { RunMode::Direct } else { RunMode::Rag }
}

/// Opens the index for querying when one exists.
fn open_index_for_query(ctx: &ConfigCtx, mode: RunMode) -> Result<Option<Arc<VectorIndex>>> {
    if mode == RunMode::Direct {
        return Ok(None);
    }
    let path = ctx.store_path();
    if !path.exists() {
        warn!(path = %path.display(), "index not found");
        return Ok(None);
    }
    Ok(Some(Arc::new(VectorIndex::open(&path, StoreMode::ReadOnly)?)))
}

fn build_pipeline(ctx: &ConfigCtx, mode: RunMode) -> Result<Arc<Pipeline>> {
    let embedder = embed::build_embedder(&ctx.config.embedding)?;
    let generator = generate::build_generator(&ctx.config.generation)?;
    let index = open_index_for_query(ctx, mode)?;
    Ok(Arc::new(Pipeline::new(&ctx.config, embedder, index, generator)))
}

fn cli_task(task_id: &str, input: String, schema: Option<String>) -> Task {
    let task = Task::new(task_id, input);
    match schema {
        Some(schema) => task.with_schema(schema),
        None => task,
    }
}

/// Fills in `schema` for tasks that name none.
fn apply_default_schema(tasks: &mut [Task], schema: Option<&str>) {
    if let Some(schema) = schema {
        for task in tasks {
            task.schema_type.get_or_insert_with(|| schema.to_string());
        }
    }
}

fn results_to_json(results: &[TaskResult]) -> Result<Vec<Value>> {
    results
        .iter()
        .map(|r| serde_json::to_value(r).context("serialize result"))
        .collect()
}

fn tasks_summary(results: &[TaskResult]) -> TasksOut {
    let failed = results.iter().filter(|r| r.is_error()).count();
    let valid = results.iter().filter(|r| r.schema_valid).count();
    TasksOut {
        total: results.len(),
        valid,
        invalid: results.len() - valid - failed,
        failed,
    }
}

fn cmd_init(path: Option<PathBuf>) -> Result<()> {
    let root = path.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&root).with_context(|| format!("create dir {root:?}"))?;

    let config_path = root.join(CONFIG_FILE);
    if config_path.exists() {
        anyhow::bail!("{CONFIG_FILE} already exists at {}", config_path.display());
    }

    let config = Config::default();
    config::write_config(&config_path, &config)?;

    let store_path = root.join(&config.store_path);
    VectorIndex::init(&store_path)?;

    println!("Initialized ragkit project at {}", root.display());
    Ok(())
}

fn cmd_index(args: IndexArgs) -> Result<()> {
    let started = Instant::now();
    let ctx = load_project()?;
    let index = Arc::new(VectorIndex::open(&ctx.store_path(), StoreMode::ReadWrite)?);

    let opts = ingest::LoadOptions {
        glob: args.glob,
        ignore: args.ignore,
        root: Some(ctx.root.clone()),
    };
    let loaded = ingest::load_documents(&args.paths, &opts)?;
    let embedder = embed::build_embedder(&ctx.config.embedding)?;
    let chunker = Chunker::from_config(&ctx.config.chunking)?;
    let indexer = Indexer::new(chunker, embedder, Arc::clone(&index))
        .with_retry(RetryPolicy::from_config(&ctx.config.generation));
    let report = if args.rebuild {
        block_on(indexer.rebuild(&loaded.documents))??
    } else {
        block_on(indexer.index_documents(&loaded.documents))??
    };

    if args.json {
        let stats = index.stats();
        let resp = JsonResponse::ok()
            .with_stats(StatsOut {
                took_ms: started.elapsed().as_millis() as i64,
                entry_count: Some(stats.entry_count),
                document_count: Some(stats.document_count),
                db_size_bytes: Some(stats.db_size_bytes),
                embedding: stats.embedding,
                indexed: Some(IndexedOut {
                    documents: report.documents,
                    chunks: report.chunks,
                    inserted: report.inserted,
                    updated: report.updated,
                    removed: report.removed,
                    skipped: loaded.skipped,
                }),
                tasks: None,
            })
            .with_warnings(loaded.warnings);
        print_json(&resp)?;
    } else {
        println!(
            "Indexed {} docs ({} chunks: {} new, {} updated, {} removed)",
            report.documents, report.chunks, report.inserted, report.updated, report.removed
        );
        for warn in loaded.warnings {
            eprintln!("warning: {warn}");
        }
    }
    Ok(())
}

fn cmd_search(args: SearchArgs) -> Result<()> {
    let started = Instant::now();
    let ctx = load_project()?;
    let index = VectorIndex::open(&ctx.store_path(), StoreMode::ReadOnly)?;
    let embedder = embed::build_embedder(&ctx.config.embedding)?;
    let top_k = args.k.unwrap_or(ctx.config.retrieval.top_k);
    let min_score = args
        .min_score
        .unwrap_or(ctx.config.retrieval.min_similarity_score);

    index.check_query_model(&embedder.model_id())?;
    let vector = block_on(embedder.embed(&args.query))??;
    let hits = index.retrieve(&vector, top_k, min_score)?;

    if args.json {
        let results = hits
            .iter()
            .map(|hit| serde_json::to_value(hit).context("serialize hit"))
            .collect::<Result<Vec<_>>>()?;
        let resp = JsonResponse::ok()
            .with_results(results)
            .with_stats(StatsOut {
                took_ms: started.elapsed().as_millis() as i64,
                entry_count: Some(index.len()),
                ..Default::default()
            });
        print_json(&resp)?;
    } else if hits.is_empty() {
        println!("No chunks scored at least {min_score:.2}");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            let preview: String = hit.entry.chunk_text.chars().take(120).collect();
            println!(
                "{:>2}. {:.3}  {}  [{}]",
                i + 1,
                hit.score,
                hit.entry.source_path,
                hit.entry.chunk_id
            );
            println!("    {}", preview.replace('\n', " "));
        }
    }
    Ok(())
}

fn cmd_prompt(args: PromptArgs) -> Result<()> {
    let ctx = discover_project()?;
    let mode = run_mode(args.no_rag);
    let pipeline = build_pipeline(&ctx, mode)?;
    let task = cli_task("prompt", args.query, args.schema);
    let prompt = block_on(pipeline.render_prompt(&task, mode))??;
    print!("{prompt}");
    Ok(())
}

fn cmd_ask(args: AskArgs) -> Result<()> {
    let ctx = discover_project()?;
    let mode = run_mode(args.no_rag);
    let pipeline = build_pipeline(&ctx, mode)?;
    let task = cli_task("ask", args.text, args.schema);
    let result = block_on(pipeline.run(&task, mode))?;
    emit_results(vec![result], args.out.as_deref(), args.json)
}

fn cmd_process(args: ProcessArgs) -> Result<()> {
    let ctx = discover_project()?;
    let mode = run_mode(args.no_rag);
    let mut tasks = tasks::load_tasks(&args.file)?;
    apply_default_schema(&mut tasks, args.schema.as_deref());
    let pipeline = build_pipeline(&ctx, mode)?;
    let results = block_on(async {
        let mut results = Vec::with_capacity(tasks.len());
        for task in &tasks {
            results.push(pipeline.run(task, mode).await);
        }
        results
    })?;
    emit_results(results, args.out.as_deref(), args.json)
}

/// Prints results and optionally saves them.
fn emit_results(results: Vec<TaskResult>, out: Option<&Path>, json: bool) -> Result<()> {
    if let Some(path) = out {
        tasks::save_results_json(path, &results)?;
    }
    if json {
        let resp = JsonResponse::ok()
            .with_results(results_to_json(&results)?)
            .with_stats(StatsOut {
                took_ms: results.iter().map(|r| r.latency_ms as i64).sum(),
                tasks: Some(tasks_summary(&results)),
                ..Default::default()
            });
        print_json(&resp)?;
        return Ok(());
    }
    for result in &results {
        print_result(result)?;
    }
    Ok(())
}

fn print_result(result: &TaskResult) -> Result<()> {
    if let Some(error) = &result.error {
        println!("{}: error ({}): {}", result.task_id, error.kind.as_str(), error.message);
        return Ok(());
    }
    match &result.parsed_json {
        Some(parsed) => println!("{}", serde_json::to_string_pretty(parsed)?),
        None => println!("{}", result.raw_model_output.as_deref().unwrap_or("")),
    }
    if !result.schema_valid {
        eprintln!("warning: output failed validation: {}", result.violations.join(", "));
    }
    if !result.context.is_empty() {
        let sources: Vec<&str> = result.context.iter().map(|c| c.source.as_str()).collect();
        eprintln!("sources: {}", sources.join(", "));
    }
    Ok(())
}

fn cmd_batch(args: BatchArgs) -> Result<()> {
    let started = Instant::now();
    let ctx = discover_project()?;
    let mode = run_mode(args.no_rag);
    let mut tasks = tasks::load_tasks(&args.file)?;
    apply_default_schema(&mut tasks, args.schema.as_deref());
    let workers = args.workers.unwrap_or(ctx.config.batch.workers).max(1);
    let pipeline = build_pipeline(&ctx, mode)?;
    let results = block_on(pipeline.run_batch(&tasks, mode, workers))?;

    if let Some(path) = &args.out {
        tasks::save_results_json(path, &results)?;
    }
    if let Some(path) = &args.csv_out {
        tasks::save_results_csv(path, &results)?;
    }
    let metrics = metrics::aggregate(&results);
    info!(
        tasks = results.len(),
        pass_rate = metrics.schema_pass_rate,
        "batch complete"
    );

    if args.json {
        let resp = JsonResponse::ok()
            .with_results(results_to_json(&results)?)
            .with_stats(StatsOut {
                took_ms: started.elapsed().as_millis() as i64,
                tasks: Some(tasks_summary(&results)),
                ..Default::default()
            })
            .with_metrics(metrics);
        print_json(&resp)?;
    } else {
        let summary = tasks_summary(&results);
        println!(
            "Processed {} tasks: {} valid, {} invalid, {} failed",
            summary.total, summary.valid, summary.invalid, summary.failed
        );
        println!(
            "Schema pass rate: {:.1}% | error rate: {:.1}%",
            metrics.schema_pass_rate, metrics.error_rate
        );
        if let Some(path) = &args.out {
            println!("Results: {}", path.display());
        }
        if let Some(path) = &args.csv_out {
            println!("CSV: {}", path.display());
        }
    }
    Ok(())
}

fn cmd_evaluate(args: EvaluateArgs) -> Result<()> {
    discover_project()?;
    let results = tasks::load_results(&args.results)?;
    let metrics = metrics::aggregate(&results);
    let (markdown, json_path) = report::write_reports(&args.out_dir, &metrics)?;

    if args.json {
        let resp = JsonResponse::ok().with_metrics(metrics);
        print_json(&resp)?;
    } else {
        print!("{}", report::render_markdown(&metrics));
        println!();
        println!("Wrote {} and {}", markdown.display(), json_path.display());
    }
    Ok(())
}

fn cmd_schemas(json: bool) -> Result<()> {
    if json {
        let results = SchemaKind::ALL
            .iter()
            .map(|kind| {
                let fields: Vec<Value> = kind
                    .fields()
                    .iter()
                    .map(|f| serde_json::json!({"name": f.name, "required": f.required}))
                    .collect();
                serde_json::json!({
                    "name": kind.as_str(),
                    "description": kind.description(),
                    "fields": fields,
                })
            })
            .collect();
        print_json(&JsonResponse::ok().with_results(results))?;
    } else {
        for kind in SchemaKind::ALL {
            println!("{:<20} {}", kind.as_str(), kind.description());
        }
    }
    Ok(())
}

fn cmd_stats(json: bool) -> Result<()> {
    let ctx = load_project()?;
    let index = VectorIndex::open(&ctx.store_path(), StoreMode::ReadOnly)?;
    let stats = index.stats();

    if json {
        let resp = JsonResponse::ok().with_stats(StatsOut {
            took_ms: 0,
            entry_count: Some(stats.entry_count),
            document_count: Some(stats.document_count),
            db_size_bytes: Some(stats.db_size_bytes),
            embedding: stats.embedding,
            ..Default::default()
        });
        print_json(&resp)?;
    } else {
        println!("Docs: {}", stats.document_count);
        println!("Chunks: {}", stats.entry_count);
        println!("DB size: {} bytes", stats.db_size_bytes);
        match stats.embedding {
            Some(sig) => println!("Embedding: {} (dim {})", sig.model, sig.dim),
            None => println!("Embedding: (empty index)"),
        }
        println!("Generation: {}", ctx.config.generation.model);
    }
    Ok(())
}
