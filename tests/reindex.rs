use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use help_chat::db;
use help_chat::embedding::{EmbedderSettings, HashEmbedder};
use help_chat::error::IndexError;
use help_chat::indexer::{reindex, ReindexOptions};
use help_chat::models::{IndexedDocument, ReindexSummary};
use help_chat::progress::{FileCallback, NoProgress};
use help_chat::retrieve::Retriever;
use help_chat::store::VectorStore;
use help_chat::worker::WorkerBackend;

const DIMS: usize = 96;

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    options: ReindexOptions,
}

impl Fixture {
    fn new(extensions: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let base = fs::canonicalize(tmp.path()).unwrap();
        let root = base.join("docs");
        fs::create_dir_all(&root).unwrap();
        let options = ReindexOptions {
            root_path: root.clone(),
            temp_path: base.join("work"),
            embeddings_path: base.join("embeddings.db"),
            conversion_timeout: Duration::from_secs(5),
            supported_extensions: extensions.to_string(),
            embedder: EmbedderSettings {
                provider: "hash".to_string(),
                model: "all-MiniLM-L6-v2".to_string(),
                url: None,
                dims: Some(DIMS),
            },
            backend: WorkerBackend::InProcess,
        };
        Self {
            _tmp: tmp,
            root,
            options,
        }
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn markdown(&self, relative: &str) -> PathBuf {
        self.options.temp_path.join("_markdown").join(relative)
    }

    async fn store(&self) -> VectorStore {
        VectorStore::open(&self.options.embeddings_path).await.unwrap()
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Minimal docx (ZIP) whose word/document.xml holds one paragraph.
fn docx_with_text(phrase: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn assert_same_row(after: &IndexedDocument, before: &IndexedDocument) {
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.embedding, before.embedding);
    assert_eq!(after.last_updated, before.last_updated);
}

#[tokio::test]
async fn unchanged_tree_keeps_rows_and_snapshots() {
    let fx = Fixture::new(".txt,.md");
    let a = fx.write("a.txt", "alpha document");
    fx.write("guide/b.md", "# Beta guide");

    reindex(&fx.options, &NoProgress).await.unwrap();
    let store = fx.store().await;
    let before = store.get(&key(&a)).await.unwrap().unwrap();
    store.close().await;
    let snapshot_mtime = fs::metadata(fx.markdown("a.txt.md"))
        .unwrap()
        .modified()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = reindex(&fx.options, &NoProgress).await.unwrap();
    assert_eq!(summary.unchanged, 2);
    assert_eq!(summary.indexed, 0);

    let store = fx.store().await;
    let after = store.get(&key(&a)).await.unwrap().unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.embedding, before.embedding);
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(
        fs::metadata(fx.markdown("a.txt.md"))
            .unwrap()
            .modified()
            .unwrap(),
        snapshot_mtime
    );
    assert_eq!(
        fs::read_to_string(fx.markdown("guide/b.md.md")).unwrap(),
        "# Beta guide"
    );
}

#[tokio::test]
async fn changed_file_gets_new_hash_embedding_and_timestamp() {
    let fx = Fixture::new(".txt");
    let a = fx.write("a.txt", "first version");

    reindex(&fx.options, &NoProgress).await.unwrap();
    let store = fx.store().await;
    let before = store.get(&key(&a)).await.unwrap().unwrap();
    store.close().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    fx.write("a.txt", "completely rewritten content");
    let summary = reindex(&fx.options, &NoProgress).await.unwrap();
    assert_eq!(summary.indexed, 1);

    let store = fx.store().await;
    let after = store.get(&key(&a)).await.unwrap().unwrap();
    assert_ne!(after.content_hash, before.content_hash);
    assert_ne!(after.embedding, before.embedding);
    assert!(after.last_updated > before.last_updated);
    assert_eq!(
        fs::read_to_string(fx.markdown("a.txt.md")).unwrap(),
        "completely rewritten content"
    );
}

#[tokio::test]
async fn removed_file_prunes_empty_snapshot_dirs() {
    let fx = Fixture::new(".txt");
    let deep = fx.write("one/two/deep.txt", "deep text");
    fx.write("one/keep.txt", "kept text");

    reindex(&fx.options, &NoProgress).await.unwrap();
    assert!(fx.markdown("one/two/deep.txt.md").exists());

    fs::remove_file(&deep).unwrap();
    let summary = reindex(&fx.options, &NoProgress).await.unwrap();
    assert_eq!(summary.removed, 1);

    assert!(!fx.markdown("one/two").exists());
    assert!(fx.markdown("one/keep.txt.md").exists());
    let store = fx.store().await;
    assert!(store.get(&key(&deep)).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn extension_matching_ignores_case_and_unlisted_types() {
    let fx = Fixture::new(".txt");
    let report = fx.write("report.TXT", "quarterly report");
    let notes = fx.write("notes.xyz", "never indexed");

    let seen = Mutex::new(Vec::new());
    let callback = FileCallback(|path: &Path| seen.lock().unwrap().push(path.to_path_buf()));
    let summary = reindex(&fx.options, &callback).await.unwrap();

    assert_eq!(summary.scanned, 1);
    assert_eq!(*seen.lock().unwrap(), vec![report.clone()]);
    let store = fx.store().await;
    let row = store.get(&key(&report)).await.unwrap().unwrap();
    assert_eq!(row.extension, ".txt");
    assert!(store.get(&key(&notes)).await.unwrap().is_none());
}

#[tokio::test]
async fn exact_text_query_ranks_its_file_first() {
    let fx = Fixture::new(".txt,.md");
    let target = fx.write("install.txt", "install the widget with the setup wizard");
    fx.write("faq.md", "frequently asked questions about billing");
    fx.write("misc/changelog.txt", "version history and release notes");

    reindex(&fx.options, &NoProgress).await.unwrap();

    let retriever = Retriever::new(
        fx.store().await,
        Box::new(HashEmbedder::new("all-MiniLM-L6-v2", DIMS)),
        &fx.options.root_path,
        &fx.options.temp_path,
    );
    let hits = retriever
        .retrieve("install the widget with the setup wizard", 2)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].path, key(&target));
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    let prompt = retriever.augment_prompt("How do I install the widget?", &hits[..1]);
    assert!(prompt.starts_with("Relevant documentation:\n\n- Source: "));
    assert!(prompt.contains("    install the widget with the setup wizard"));
    assert!(prompt.ends_with("\n\nUser question: How do I install the widget?"));
}

#[tokio::test]
async fn changed_file_that_fails_keeps_its_previous_row() {
    let fx = Fixture::new(".txt,.docx");
    let notes = fx.write("notes.txt", "original notes");
    let guide = fx.root.join("guide.docx");
    fs::write(&guide, docx_with_text("original guide")).unwrap();

    assert_eq!(reindex(&fx.options, &NoProgress).await.unwrap().indexed, 2);
    let store = fx.store().await;
    let notes_before = store.get(&key(&notes)).await.unwrap().unwrap();
    let guide_before = store.get(&key(&guide)).await.unwrap().unwrap();
    store.close().await;

    fx.write("notes.txt", "  \n\t ");
    fs::write(&guide, b"no longer a zip archive").unwrap();
    let summary = reindex(&fx.options, &NoProgress).await.unwrap();
    assert_eq!(
        summary,
        ReindexSummary {
            scanned: 2,
            skipped: 2,
            ..Default::default()
        }
    );

    let store = fx.store().await;
    assert_same_row(&store.get(&key(&notes)).await.unwrap().unwrap(), &notes_before);
    assert_same_row(&store.get(&key(&guide)).await.unwrap().unwrap(), &guide_before);
    assert_eq!(
        fs::read_to_string(fx.markdown("notes.txt.md")).unwrap(),
        "original notes"
    );
    assert!(fs::read_to_string(fx.markdown("guide.docx.md"))
        .unwrap()
        .contains("original guide"));
}

#[tokio::test]
async fn failed_row_write_rolls_back_the_whole_pass() {
    let fx = Fixture::new(".txt");
    let a = fx.write("a.txt", "first version");
    let old = fx.write("old.txt", "soon removed");
    reindex(&fx.options, &NoProgress).await.unwrap();
    let store = fx.store().await;
    let a_before = store.get(&key(&a)).await.unwrap().unwrap();
    store.close().await;

    let pool = db::connect(&fx.options.embeddings_path).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_rows BEFORE INSERT ON embeddings \
         WHEN NEW.file_path LIKE '%rejected%' \
         BEGIN SELECT RAISE(ABORT, 'row rejected'); END",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    fs::remove_file(&old).unwrap();
    fx.write("a.txt", "second version");
    let rejected = fx.write("rejected.txt", "cannot be stored");

    let err = reindex(&fx.options, &NoProgress).await.unwrap_err();
    assert!(matches!(err, IndexError::Store { .. }), "{}", err);

    let store = fx.store().await;
    assert_eq!(store.count().await.unwrap(), 2);
    assert_same_row(&store.get(&key(&a)).await.unwrap().unwrap(), &a_before);
    assert!(store.get(&key(&old)).await.unwrap().is_some());
    assert!(store.get(&key(&rejected)).await.unwrap().is_none());
}

/// Conversion worker that answers pings but never finishes a conversion.
/// It records its pid before hanging. Embedding workers run the real binary.
#[cfg(target_os = "linux")]
const HANGING_WORKER: &str = r#"#!/bin/sh
if [ "$2" = "convert" ]; then
    while read -r line; do
        case "$line" in
            *'"op":"ping"'*) echo '{"status":"pong"}' ;;
            *) echo $$ > "@PIDFILE@"; exec sleep 300 ;;
        esac
    done
    exit 0
fi
exec "@BIN@" "$@"
"#;

/// Dead or waiting to be reaped.
#[cfg(target_os = "linux")]
fn process_gone(pid: &str) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn hung_conversion_worker_is_killed_and_later_files_still_index() {
    use std::os::unix::fs::PermissionsExt;

    let mut fx = Fixture::new(".txt,.docx");
    fs::write(fx.root.join("a_manual.docx"), docx_with_text("never converted")).unwrap();
    let notes = fx.write("b_notes.txt", "plain notes are still indexed");

    let base = fx.root.parent().unwrap().to_path_buf();
    let pid_file = base.join("worker.pid");
    let script = base.join("hanging-worker.sh");
    fs::write(
        &script,
        HANGING_WORKER
            .replace("@PIDFILE@", &pid_file.to_string_lossy())
            .replace("@BIN@", env!("CARGO_BIN_EXE_help-chat")),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    fx.options.backend = WorkerBackend::Process { program: script };
    fx.options.conversion_timeout = Duration::from_secs(1);

    let started = std::time::Instant::now();
    let summary = reindex(&fx.options, &NoProgress).await.unwrap();
    // The ping warmed the pool, so the hung file only got the base budget.
    assert!(started.elapsed() < help_chat::pool::CONVERSION_STARTUP_BUFFER);
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.skipped, 1);

    let store = fx.store().await;
    assert!(store.get(&key(&notes)).await.unwrap().is_some());
    assert_eq!(store.count().await.unwrap(), 1);
    store.close().await;

    let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let mut gone = false;
    for _ in 0..50 {
        if process_gone(&pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "hung worker {} still running", pid);
}
