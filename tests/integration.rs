use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn help_chat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("help-chat");
    path
}

struct TestEnv {
    _tmp: TempDir,
    docs: PathBuf,
    work: PathBuf,
    config: PathBuf,
}

/// Docs folder, temp workspace and a TOML config using the offline hash
/// embedder with isolated worker processes.
fn setup_test_env(store_inside_temp: bool) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let base = fs::canonicalize(tmp.path()).unwrap();
    let docs = base.join("docs");
    let work = base.join("work");
    fs::create_dir_all(&docs).unwrap();

    let store = if store_inside_temp {
        work.join("embeddings.db")
    } else {
        base.join("data").join("embeddings.db")
    };

    let config_content = format!(
        r#"name = "integration"
root_path = "{}"
temp_path = "{}"
api_path = "http://127.0.0.1:9/v1"
api_key = "sk-test"
embeddings_path = "{}"
supported_extensions = ".txt,.md"
conversion_timeout = 10
embedding_provider = "hash"
embedding_dims = 256
isolate_workers = true
"#,
        docs.display(),
        work.display(),
        store.display()
    );
    let config = base.join("help.toml");
    fs::write(&config, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        docs,
        work,
        config,
    }
}

/// Run the binary and return every stdout line as JSON plus the exit status.
fn run_help_chat(config: &Path, args: &[&str]) -> (Vec<Value>, bool) {
    let binary = help_chat_binary();
    let output = Command::new(&binary)
        .arg("--config-file")
        .arg(config)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run help-chat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let lines = stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l)
                .unwrap_or_else(|e| panic!("non-JSON stdout line {:?} ({}); stderr: {}", l, e, stderr))
        })
        .collect();
    (lines, output.status.success())
}

fn envelope(lines: &[Value]) -> &Value {
    lines.last().expect("no output")
}

#[test]
fn test_validate_echoes_config_without_key() {
    let env = setup_test_env(false);
    let (lines, ok) = run_help_chat(&env.config, &["validate"]);
    assert!(ok);
    let out = envelope(&lines);
    assert_eq!(out["status"], "ok");
    assert_eq!(out["data"]["name"], "integration");
    assert_eq!(out["data"]["supported_extensions"], ".txt,.md");
    assert!(out["data"].get("api_key").is_none());
}

#[test]
fn test_invalid_config_reports_error() {
    let env = setup_test_env(false);
    fs::write(&env.config, "root_path = \"/docs\"\n").unwrap();

    let (lines, ok) = run_help_chat(&env.config, &["validate"]);
    assert!(!ok);
    let out = envelope(&lines);
    assert_eq!(out["status"], "error");
    assert!(out["message"].as_str().unwrap().contains("missing field"));
}

#[test]
fn test_reindex_add_then_remove() {
    let env = setup_test_env(false);
    fs::write(env.docs.join("a.txt"), "hello").unwrap();
    fs::write(env.docs.join("b.md"), "# hi").unwrap();

    let (lines, ok) = run_help_chat(&env.config, &["reindex"]);
    assert!(ok, "{:?}", lines);
    let progress: Vec<&str> = lines
        .iter()
        .filter(|l| l["status"] == "progress")
        .map(|l| l["file"].as_str().unwrap())
        .collect();
    assert_eq!(progress.len(), 2);
    assert!(progress.iter().any(|f| f.ends_with("a.txt")));
    let out = envelope(&lines);
    assert_eq!(out["status"], "ok");
    assert_eq!(out["data"]["value"], "reindexed");
    assert_eq!(out["data"]["summary"]["indexed"], 2);

    let markdown = env.work.join("_markdown");
    assert_eq!(fs::read_to_string(markdown.join("a.txt.md")).unwrap(), "hello");
    assert_eq!(fs::read_to_string(markdown.join("b.md.md")).unwrap(), "# hi");
    assert!(env.work.join(".help_chat_temp").exists());

    let (lines, ok) = run_help_chat(&env.config, &["search", "hello", "--limit", "10"]);
    assert!(ok);
    let hits = envelope(&lines)["data"].as_array().unwrap().clone();
    assert_eq!(hits.len(), 2);
    assert!(hits[0]["path"].as_str().unwrap().ends_with("a.txt"));

    fs::remove_file(env.docs.join("a.txt")).unwrap();
    let (lines, ok) = run_help_chat(&env.config, &["reindex", "--progress", "off"]);
    assert!(ok);
    assert_eq!(lines.len(), 1);
    let summary = &envelope(&lines)["data"]["summary"];
    assert_eq!(summary["removed"], 1);
    assert_eq!(summary["unchanged"], 1);
    assert_eq!(summary["indexed"], 0);
    assert!(!markdown.join("a.txt.md").exists());
    assert!(markdown.join("b.md.md").exists());

    let (lines, _) = run_help_chat(&env.config, &["search", "hello", "--limit", "10"]);
    assert_eq!(envelope(&lines)["data"].as_array().unwrap().len(), 1);
}

#[test]
fn test_reindex_refuses_unmanaged_temp() {
    let env = setup_test_env(false);
    fs::write(env.docs.join("a.txt"), "hello").unwrap();
    fs::create_dir_all(&env.work).unwrap();
    fs::write(env.work.join("keep.txt"), "user data").unwrap();

    let (lines, ok) = run_help_chat(&env.config, &["reindex"]);
    assert!(!ok);
    let out = envelope(&lines);
    assert_eq!(out["status"], "error");
    assert!(out["message"].as_str().unwrap().contains("not managed"));
    assert_eq!(fs::read_to_string(env.work.join("keep.txt")).unwrap(), "user data");
    assert!(!env.work.join(".help_chat_temp").exists());
}

#[test]
fn test_store_inside_temp_survives_reindex() {
    let env = setup_test_env(true);
    fs::write(env.docs.join("a.txt"), "alpha notes").unwrap();
    fs::write(env.docs.join("b.txt"), "beta notes").unwrap();

    let (lines, ok) = run_help_chat(&env.config, &["reindex", "--progress", "off"]);
    assert!(ok, "{:?}", lines);
    assert_eq!(envelope(&lines)["data"]["summary"]["indexed"], 2);

    let (lines, ok) = run_help_chat(&env.config, &["reindex", "--progress", "off"]);
    assert!(ok, "{:?}", lines);
    let summary = &envelope(&lines)["data"]["summary"];
    assert_eq!(summary["unchanged"], 2);
    assert_eq!(summary["indexed"], 0);
    assert!(env.work.join("embeddings.db").exists());
}

#[test]
fn test_missing_root_is_an_error() {
    let env = setup_test_env(false);
    fs::remove_dir_all(&env.docs).unwrap();

    let (lines, ok) = run_help_chat(&env.config, &["reindex"]);
    assert!(!ok);
    assert!(envelope(&lines)["message"]
        .as_str()
        .unwrap()
        .contains("Root path does not exist"));
    assert!(!env.work.exists());
}

#[test]
fn test_completions_need_no_config() {
    let output = Command::new(help_chat_binary())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("help-chat"));
}

#[test]
fn test_worker_answers_ping() {
    let mut child = Command::new(help_chat_binary())
        .args(["worker", "convert"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"{\"op\":\"ping\"}\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let reply: Value = serde_json::from_slice(output.stdout.trim_ascii()).unwrap();
    assert_eq!(reply["status"], "pong");
}
