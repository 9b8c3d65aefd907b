//! Conversion and embedding workers.
//!
//! Two backends implement the pool's [`Worker`] seam:
//!
//! - **In-process**: tasks run on tokio's blocking thread pool. An abandoned
//!   task keeps its thread until it returns on its own.
//! - **Process**: each worker is a child process running the binary's hidden
//!   `worker convert|embed` subcommand. Requests and responses are single
//!   JSON objects, one per line, over the child's stdin/stdout. Children are
//!   spawned with `kill_on_drop`, so abandoning a pool kills them; a child
//!   that dies mid-task is respawned on the next task.
//!
//! # Wire format
//!
//! ```text
//! → {"op":"ping"}
//! ← {"status":"pong"}
//! → {"op":"convert","path":"/docs/guide.pdf"}
//! ← {"status":"success","text":"..."}
//! → {"op":"encode","text":"...","model":"all-MiniLM-L6-v2"}
//! ← {"status":"success","vector":"<base64 of little-endian f32 bytes>"}
//! ← {"status":"unsupported","message":"..."} | {"status":"error","message":"..."}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::embedding::{create_embedder, vec_to_blob, Embedder, EmbedderSettings};
use crate::extract;
use crate::pool::{
    TaskOutcome, Worker, WorkerFactory, WorkerPool, CONVERSION_STARTUP_BUFFER,
    CONVERSION_WORKERS, EMBEDDING_STARTUP_BUFFER, EMBEDDING_WORKERS,
};

/// Text encoded once per pool to load the model before real work.
pub const EMBEDDING_WARMUP_TEXT: &str = "warmup test";

pub type ConversionPool = WorkerPool<ConvertRequest, String>;
pub type EmbeddingPool = WorkerPool<EmbedRequest, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertRequest {
    /// No-op round trip used to warm the pool.
    Ping,
    Convert(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedRequest {
    pub text: String,
    pub model: String,
}

/// Where pooled work runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBackend {
    InProcess,
    /// Child processes of `program`, which must accept `worker convert` and
    /// `worker embed ...` arguments.
    Process { program: PathBuf },
}

impl WorkerBackend {
    /// Child processes of the running executable.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(WorkerBackend::Process { program })
    }
}

pub fn conversion_pool(backend: &WorkerBackend, base_timeout: Duration) -> ConversionPool {
    WorkerPool::new(
        "conversion",
        Arc::new(ConversionWorkers {
            backend: backend.clone(),
        }),
        CONVERSION_WORKERS,
        base_timeout,
        CONVERSION_STARTUP_BUFFER,
    )
}

pub fn embedding_pool(
    backend: &WorkerBackend,
    settings: &EmbedderSettings,
    base_timeout: Duration,
) -> EmbeddingPool {
    WorkerPool::new(
        "embedding",
        Arc::new(EmbeddingWorkers {
            backend: backend.clone(),
            settings: settings.clone(),
        }),
        EMBEDDING_WORKERS,
        base_timeout,
        EMBEDDING_STARTUP_BUFFER,
    )
}

// ============ Wire protocol ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WorkerRequest {
    Ping,
    Convert { path: PathBuf },
    Encode { text: String, model: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerResponse {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vector: Option<String>,
    },
    Pong,
    Unsupported {
        message: String,
    },
    Error {
        message: String,
    },
}

impl WorkerResponse {
    fn from_text(outcome: TaskOutcome<String>) -> Self {
        match outcome {
            TaskOutcome::Success(text) => WorkerResponse::Success {
                text: Some(text),
                vector: None,
            },
            other => Self::from_failure(other),
        }
    }

    fn from_vector(outcome: TaskOutcome<Vec<u8>>) -> Self {
        match outcome {
            TaskOutcome::Success(bytes) => WorkerResponse::Success {
                text: None,
                vector: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            },
            other => Self::from_failure(other),
        }
    }

    fn from_failure<T>(outcome: TaskOutcome<T>) -> Self {
        match outcome {
            TaskOutcome::Unsupported(message) => WorkerResponse::Unsupported { message },
            TaskOutcome::Error(message) => WorkerResponse::Error { message },
            TaskOutcome::Timeout => WorkerResponse::Error {
                message: "timeout".to_string(),
            },
            TaskOutcome::Success(_) => WorkerResponse::Error {
                message: "unexpected payload".to_string(),
            },
        }
    }
}

// ============ Task bodies shared by both backends ============

/// Convert one file, classifying failures the way the pool expects.
pub fn convert_outcome(path: &std::path::Path) -> TaskOutcome<String> {
    match extract::convert_path(path) {
        Ok(text) => TaskOutcome::Success(text),
        Err(e) if e.is_unsupported() => TaskOutcome::Unsupported(e.to_string()),
        Err(e) => TaskOutcome::Error(e.to_string()),
    }
}

/// Lazily constructed embedder, rebuilt when a request names another model.
pub struct EmbedderCache {
    settings: EmbedderSettings,
    current: Option<Box<dyn Embedder>>,
}

impl EmbedderCache {
    pub fn new(settings: EmbedderSettings) -> Self {
        Self {
            settings,
            current: None,
        }
    }

    pub fn encode(&mut self, text: &str, model: &str) -> TaskOutcome<Vec<u8>> {
        let stale = self
            .current
            .as_ref()
            .is_some_and(|embedder| embedder.model_name() != model);
        if stale || self.current.is_none() {
            let settings = EmbedderSettings {
                model: model.to_string(),
                ..self.settings.clone()
            };
            match create_embedder(&settings) {
                Ok(embedder) => self.current = Some(embedder),
                Err(e) => return TaskOutcome::Error(format!("{:#}", e)),
            }
        }
        let Some(embedder) = self.current.as_mut() else {
            return TaskOutcome::Error("embedder unavailable".to_string());
        };

        match embedder.encode(text) {
            Ok(vector) => TaskOutcome::Success(vec_to_blob(&vector)),
            Err(e) => TaskOutcome::Error(format!("{:#}", e)),
        }
    }
}

// ============ In-process backend ============

struct InProcessConverter;

#[async_trait]
impl Worker<ConvertRequest, String> for InProcessConverter {
    async fn handle(&mut self, req: ConvertRequest) -> TaskOutcome<String> {
        match req {
            ConvertRequest::Ping => TaskOutcome::Success(String::new()),
            ConvertRequest::Convert(path) => {
                match tokio::task::spawn_blocking(move || convert_outcome(&path)).await {
                    Ok(outcome) => outcome,
                    Err(e) => TaskOutcome::Error(format!("conversion task failed: {}", e)),
                }
            }
        }
    }
}

struct InProcessEmbedder {
    cache: Option<EmbedderCache>,
    settings: EmbedderSettings,
}

#[async_trait]
impl Worker<EmbedRequest, Vec<u8>> for InProcessEmbedder {
    async fn handle(&mut self, req: EmbedRequest) -> TaskOutcome<Vec<u8>> {
        let mut cache = self
            .cache
            .take()
            .unwrap_or_else(|| EmbedderCache::new(self.settings.clone()));
        let task = tokio::task::spawn_blocking(move || {
            let outcome = cache.encode(&req.text, &req.model);
            (cache, outcome)
        });
        match task.await {
            Ok((cache, outcome)) => {
                self.cache = Some(cache);
                outcome
            }
            Err(e) => TaskOutcome::Error(format!("embedding task failed: {}", e)),
        }
    }
}

// ============ Process backend ============

struct ChildIo {
    // Held for kill_on_drop.
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A worker backed by one child process.
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    io: Option<ChildIo>,
}

impl ProcessWorker {
    /// Spawn the child immediately so start-up failures surface at pool
    /// creation.
    pub fn spawn(program: PathBuf, args: Vec<String>) -> Result<Self> {
        let mut worker = Self {
            program,
            args,
            io: None,
        };
        worker.io = Some(worker.start_child()?);
        Ok(worker)
    }

    fn start_child(&self) -> Result<ChildIo> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", self.program.display()))?;
        let stdin = child.stdin.take().context("worker stdin unavailable")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        debug!("Spawned worker process {:?} {:?}", child.id(), self.args);
        Ok(ChildIo {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one request and read one response. Any I/O or framing failure
    /// discards the child; the next call starts a fresh one.
    async fn roundtrip(&mut self, request: &WorkerRequest) -> std::result::Result<WorkerResponse, String> {
        if self.io.is_none() {
            self.io = Some(self.start_child().map_err(|e| format!("{:#}", e))?);
        }
        let result = match self.io.as_mut() {
            Some(io) => exchange(io, request).await,
            None => Err("worker process unavailable".to_string()),
        };
        if result.is_err() {
            self.io = None;
        }
        result
    }
}

async fn exchange(io: &mut ChildIo, request: &WorkerRequest) -> std::result::Result<WorkerResponse, String> {
    let mut line = serde_json::to_string(request).map_err(|e| e.to_string())?;
    line.push('\n');
    io.stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("failed to write to worker: {}", e))?;
    io.stdin
        .flush()
        .await
        .map_err(|e| format!("failed to write to worker: {}", e))?;

    let mut reply = String::new();
    let n = io
        .stdout
        .read_line(&mut reply)
        .await
        .map_err(|e| format!("failed to read from worker: {}", e))?;
    if n == 0 {
        return Err("worker process exited".to_string());
    }
    serde_json::from_str(reply.trim_end()).map_err(|e| format!("malformed worker reply: {}", e))
}

fn failure_outcome<T>(response: WorkerResponse) -> TaskOutcome<T> {
    match response {
        WorkerResponse::Unsupported { message } => TaskOutcome::Unsupported(message),
        WorkerResponse::Error { message } => TaskOutcome::Error(message),
        WorkerResponse::Pong => TaskOutcome::Error("unexpected pong".to_string()),
        WorkerResponse::Success { .. } => TaskOutcome::Error("reply missing payload".to_string()),
    }
}

#[async_trait]
impl Worker<ConvertRequest, String> for ProcessWorker {
    async fn handle(&mut self, req: ConvertRequest) -> TaskOutcome<String> {
        let request = match req {
            ConvertRequest::Ping => WorkerRequest::Ping,
            ConvertRequest::Convert(path) => WorkerRequest::Convert { path },
        };
        match self.roundtrip(&request).await {
            Ok(WorkerResponse::Pong) => TaskOutcome::Success(String::new()),
            Ok(WorkerResponse::Success {
                text: Some(text), ..
            }) => TaskOutcome::Success(text),
            Ok(other) => failure_outcome(other),
            Err(message) => {
                warn!("Conversion worker failed: {}", message);
                TaskOutcome::Error(message)
            }
        }
    }
}

#[async_trait]
impl Worker<EmbedRequest, Vec<u8>> for ProcessWorker {
    async fn handle(&mut self, req: EmbedRequest) -> TaskOutcome<Vec<u8>> {
        let request = WorkerRequest::Encode {
            text: req.text,
            model: req.model,
        };
        match self.roundtrip(&request).await {
            Ok(WorkerResponse::Success {
                vector: Some(vector),
                ..
            }) => match base64::engine::general_purpose::STANDARD.decode(vector) {
                Ok(bytes) => TaskOutcome::Success(bytes),
                Err(e) => TaskOutcome::Error(format!("malformed vector from worker: {}", e)),
            },
            Ok(other) => failure_outcome(other),
            Err(message) => {
                warn!("Embedding worker failed: {}", message);
                TaskOutcome::Error(message)
            }
        }
    }
}

// ============ Factories ============

struct ConversionWorkers {
    backend: WorkerBackend,
}

impl WorkerFactory<ConvertRequest, String> for ConversionWorkers {
    fn spawn(&self) -> Result<Box<dyn Worker<ConvertRequest, String>>> {
        match &self.backend {
            WorkerBackend::InProcess => Ok(Box::new(InProcessConverter)),
            WorkerBackend::Process { program } => Ok(Box::new(ProcessWorker::spawn(
                program.clone(),
                vec!["worker".to_string(), "convert".to_string()],
            )?)),
        }
    }
}

struct EmbeddingWorkers {
    backend: WorkerBackend,
    settings: EmbedderSettings,
}

impl WorkerFactory<EmbedRequest, Vec<u8>> for EmbeddingWorkers {
    fn spawn(&self) -> Result<Box<dyn Worker<EmbedRequest, Vec<u8>>>> {
        match &self.backend {
            WorkerBackend::InProcess => Ok(Box::new(InProcessEmbedder {
                cache: None,
                settings: self.settings.clone(),
            })),
            WorkerBackend::Process { program } => Ok(Box::new(ProcessWorker::spawn(
                program.clone(),
                embed_worker_args(&self.settings),
            )?)),
        }
    }
}

/// Command line for an embedding worker process.
pub fn embed_worker_args(settings: &EmbedderSettings) -> Vec<String> {
    let mut args = vec![
        "worker".to_string(),
        "embed".to_string(),
        "--provider".to_string(),
        settings.provider.clone(),
        "--model".to_string(),
        settings.model.clone(),
    ];
    if let Some(url) = &settings.url {
        args.push("--url".to_string());
        args.push(url.clone());
    }
    if let Some(dims) = settings.dims {
        args.push("--dims".to_string());
        args.push(dims.to_string());
    }
    args
}

// ============ Worker process side ============

/// Which requests a worker process serves.
pub enum WorkerRole {
    Convert,
    Embed(EmbedderSettings),
}

/// Serve requests from `input` until end of stream, one JSON line in, one
/// JSON line out. Malformed or misrouted requests get an error reply.
pub fn run_worker_loop<R: BufRead, W: Write>(role: WorkerRole, input: R, mut output: W) -> Result<()> {
    let mut cache = match &role {
        WorkerRole::Embed(settings) => Some(EmbedderCache::new(settings.clone())),
        WorkerRole::Convert => None,
    };

    for line in input.lines() {
        let line = line.context("Failed to read worker request")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Ping) => WorkerResponse::Pong,
            Ok(WorkerRequest::Convert { path }) => match role {
                WorkerRole::Convert => WorkerResponse::from_text(convert_outcome(&path)),
                WorkerRole::Embed(_) => WorkerResponse::Error {
                    message: "embedding worker cannot convert files".to_string(),
                },
            },
            Ok(WorkerRequest::Encode { text, model }) => match cache.as_mut() {
                Some(cache) => WorkerResponse::from_vector(cache.encode(&text, &model)),
                None => WorkerResponse::Error {
                    message: "conversion worker cannot encode text".to_string(),
                },
            },
            Err(e) => WorkerResponse::Error {
                message: format!("invalid request: {}", e),
            },
        };

        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::blob_to_vec;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn hash_settings() -> EmbedderSettings {
        EmbedderSettings {
            provider: "hash".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            url: None,
            dims: Some(32),
        }
    }

    fn serve(role: WorkerRole, requests: &[&str]) -> Vec<WorkerResponse> {
        let input = Cursor::new(requests.join("\n"));
        let mut output = Vec::new();
        run_worker_loop(role, input, &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&WorkerRequest::Encode {
            text: "hi".into(),
            model: "m".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"encode","text":"hi","model":"m"}"#);
        assert_eq!(
            serde_json::from_str::<WorkerRequest>(r#"{"op":"ping"}"#).unwrap(),
            WorkerRequest::Ping
        );
        let reply = serde_json::to_string(&WorkerResponse::Unsupported {
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(reply, r#"{"status":"unsupported","message":"nope"}"#);
    }

    #[test]
    fn conversion_worker_serves_ping_and_convert() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("a.txt");
        std::fs::write(&doc, "hello").unwrap();
        let convert = serde_json::to_string(&WorkerRequest::Convert { path: doc }).unwrap();
        let unsupported = serde_json::to_string(&WorkerRequest::Convert {
            path: tmp.path().join("x.bmp"),
        })
        .unwrap();

        let replies = serve(
            WorkerRole::Convert,
            &[r#"{"op":"ping"}"#, &convert, "not json", &unsupported],
        );
        assert_eq!(replies[0], WorkerResponse::Pong);
        assert_eq!(
            replies[1],
            WorkerResponse::Success {
                text: Some("hello".into()),
                vector: None
            }
        );
        assert!(matches!(replies[2], WorkerResponse::Error { .. }));
        // Missing file with an unknown extension: reading fails first.
        assert!(matches!(
            replies[3],
            WorkerResponse::Error { .. } | WorkerResponse::Unsupported { .. }
        ));
    }

    #[test]
    fn embedding_worker_returns_base64_vector() {
        let replies = serve(
            WorkerRole::Embed(hash_settings()),
            &[r#"{"op":"encode","text":"warmup test","model":"all-MiniLM-L6-v2"}"#],
        );
        let WorkerResponse::Success {
            vector: Some(vector),
            ..
        } = &replies[0]
        else {
            panic!("unexpected reply {:?}", replies[0]);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(vector)
            .unwrap();
        assert_eq!(blob_to_vec(&bytes).len(), 32);
    }

    #[test]
    fn misrouted_requests_are_errors() {
        let replies = serve(
            WorkerRole::Convert,
            &[r#"{"op":"encode","text":"x","model":"m"}"#],
        );
        assert!(matches!(replies[0], WorkerResponse::Error { .. }));
    }

    #[test]
    fn embed_args_include_optional_settings() {
        let mut settings = hash_settings();
        settings.url = Some("http://localhost:11434".into());
        let args = embed_worker_args(&settings);
        assert_eq!(
            args,
            vec![
                "worker",
                "embed",
                "--provider",
                "hash",
                "--model",
                "all-MiniLM-L6-v2",
                "--url",
                "http://localhost:11434",
                "--dims",
                "32"
            ]
        );
    }

    #[tokio::test]
    async fn in_process_pools_convert_and_embed() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("guide.html");
        std::fs::write(&doc, "<h1>Guide</h1><p>Body</p>").unwrap();

        let mut conversion = conversion_pool(&WorkerBackend::InProcess, Duration::from_secs(5));
        assert!(conversion.warm_up(ConvertRequest::Ping).await);
        let TaskOutcome::Success(text) = conversion.submit(ConvertRequest::Convert(doc)).await
        else {
            panic!("conversion failed");
        };
        assert!(text.contains("# Guide"));

        let mut embedding =
            embedding_pool(&WorkerBackend::InProcess, &hash_settings(), Duration::from_secs(5));
        let request = EmbedRequest {
            text: text.clone(),
            model: "all-MiniLM-L6-v2".into(),
        };
        let TaskOutcome::Success(first) = embedding.submit(request.clone()).await else {
            panic!("embedding failed");
        };
        let TaskOutcome::Success(second) = embedding.submit(request).await else {
            panic!("embedding failed");
        };
        assert_eq!(first.len(), 32 * 4);
        assert_eq!(first, second);

        conversion.shutdown();
        embedding.shutdown();
    }
}
