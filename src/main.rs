//! # Help Chat CLI (`help-chat`)
//!
//! Command-line bridge for front ends. Every command prints exactly one
//! JSON envelope on stdout and exits non-zero on failure:
//!
//! ```text
//! {"status":"ok","data":...}
//! {"status":"error","message":"..."}
//! ```
//!
//! `reindex` additionally prints `{"status":"progress","file":"..."}` lines
//! before its envelope as files are indexed.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `help-chat validate` | Parse and validate the configuration, echo it back |
//! | `help-chat reindex` | Bring the vector store and snapshots up to date |
//! | `help-chat search "<query>"` | Show the most similar indexed files |
//! | `help-chat make-request --prompt-file <path>` | Ask the chat model with retrieved context |
//! | `help-chat completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! help-chat --config-file ./help.json reindex
//! help-chat --config-file ./help.json search "proxy settings" --limit 3
//! help-chat --config-file ./help.json make-request --prompt-file question.txt
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use help_chat::chat::HelpChat;
use help_chat::config::{self, Config};
use help_chat::embedding::EmbedderSettings;
use help_chat::indexer;
use help_chat::logging;
use help_chat::progress::ProgressMode;
use help_chat::retrieve::Retriever;
use help_chat::worker::{self, WorkerBackend, WorkerRole};

/// Help Chat: incremental document indexing and retrieval-augmented chat.
///
/// All commands except `completions` read a JSON (`.json`) or TOML
/// configuration file given with `--config-file`.
#[derive(Parser)]
#[command(
    name = "help-chat",
    about = "Help Chat: incremental document indexing and retrieval-augmented chat over a local folder",
    version
)]
struct Cli {
    /// Path to the configuration file (JSON or TOML).
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the configuration.
    Validate,

    /// Index new and changed files, drop removed ones.
    ///
    /// Unchanged files (same SHA-256) are skipped. Files that fail to
    /// convert or embed are logged and skipped without aborting the pass.
    Reindex {
        /// Progress output: `json` lines on stdout, `human` on stderr, or `off`.
        #[arg(long, value_enum, default_value = "json")]
        progress: ProgressMode,
    },

    /// Rank indexed files by similarity to a query.
    Search {
        query: String,

        /// Number of results (defaults to `context_documents`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Send a prompt, augmented with retrieved context, to the chat model.
    MakeRequest {
        /// File holding the prompt text (UTF-8).
        #[arg(long)]
        prompt_file: PathBuf,

        /// Emit `{"status":"chunk","text":...}` lines as the answer streams in.
        #[arg(long)]
        stream: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        shell: clap_complete::Shell,
    },

    /// Serve conversion or embedding requests on stdin/stdout.
    #[command(hide = true)]
    Worker {
        #[command(subcommand)]
        role: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Convert,
    Embed {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        dims: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Commands that never print an envelope. Workers run outside any async
    // runtime so blocking HTTP clients are usable inside them.
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "help-chat", &mut io::stdout());
            return;
        }
        Commands::Worker { role } => {
            logging::init(None);
            let role = match role {
                WorkerCommand::Convert => WorkerRole::Convert,
                WorkerCommand::Embed {
                    provider,
                    model,
                    url,
                    dims,
                } => WorkerRole::Embed(EmbedderSettings {
                    provider: provider.clone(),
                    model: model.clone(),
                    url: url.clone(),
                    dims: *dims,
                }),
            };
            let stdin = io::stdin();
            let stdout = io::stdout();
            if let Err(e) = worker::run_worker_loop(role, stdin.lock(), stdout.lock()) {
                eprintln!("worker: {:#}", e);
                std::process::exit(1);
            }
            return;
        }
        _ => {}
    }

    let outcome = tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));

    let code = match outcome {
        Ok(data) => {
            emit(&json!({ "status": "ok", "data": data }));
            0
        }
        Err(e) => {
            emit(&json!({ "status": "error", "message": format!("{:#}", e) }));
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<Value> {
    let config_path = cli
        .config_file
        .as_deref()
        .context("--config-file is required")?;
    let cfg = config::load_config(config_path);
    logging::init(
        cfg.as_ref()
            .ok()
            .filter(|c| c.enable_debug_log)
            .map(|c| c.debug_log_path())
            .as_deref(),
    );
    let cfg = cfg?;

    match cli.command {
        Commands::Validate => Ok(serde_json::to_value(&cfg)?),
        Commands::Reindex { progress } => {
            let backend = worker_backend(&cfg)?;
            let reporter = progress.reporter();
            let summary = indexer::run_reindex(&cfg, backend, reporter.as_ref()).await?;
            Ok(json!({ "value": "reindexed", "summary": summary }))
        }
        Commands::Search { query, limit } => {
            let retriever = Retriever::open(&cfg).await?;
            let hits = retriever
                .retrieve(&query, limit.unwrap_or(cfg.context_documents))
                .await;
            retriever.close().await;
            Ok(serde_json::to_value(hits?)?)
        }
        Commands::MakeRequest {
            prompt_file,
            stream,
        } => {
            let prompt = load_prompt(&prompt_file)?;
            let chat = HelpChat::open(&cfg).await?;
            let answer = if stream {
                chat.make_request_streaming(&prompt, |text| {
                    emit(&json!({ "status": "chunk", "text": text }));
                })
                .await
            } else {
                chat.make_request(&prompt).await
            };
            chat.close().await;
            Ok(Value::String(answer?))
        }
        Commands::Completions { .. } | Commands::Worker { .. } => {
            anyhow::bail!("command does not take a configuration")
        }
    }
}

fn worker_backend(cfg: &Config) -> Result<WorkerBackend> {
    if cfg.isolate_workers {
        WorkerBackend::current_exe()
    } else {
        Ok(WorkerBackend::InProcess)
    }
}

fn load_prompt(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read prompt file: {}", path.display()))
}

fn emit(value: &Value) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", value);
    let _ = stdout.flush();
}
