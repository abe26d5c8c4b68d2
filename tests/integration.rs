use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn hl_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("hl");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Nothing listens on port 1, so every fetch is a connection failure.
    let config_content = format!(
        r#"[db]
path = "{}/data/hl.sqlite"

[fetch]
base_url = "http://127.0.0.1:1/records"
min_request_delay_ms = 0
backoff_ms = 1
max_transient_retries = 0
timeout_secs = 2

[harvest]
job = "catalog"
flush_every = 2

[snapshot]
tag_fields = ["tags"]
"#,
        root.display()
    );

    let config_path = config_dir.join("hl.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hl(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = hl_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hl binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn write_observations(dir: &Path) -> PathBuf {
    let path = dir.join("observations.jsonl");
    fs::write(
        &path,
        concat!(
            r#"{"key": "570", "observed_at": "2025-03-10 00:00:00", "fields": {"price": 10, "tags": ["MOBA"]}}"#,
            "\n",
            r#"{"key": "570", "observed_at": "2025-03-01 00:00:00", "fields": {"price": 5, "tags": "[\"MOBA\", \"Strategy\"]"}}"#,
            "\n",
            r#"{"key": "570", "observed_at": "2025-03-20 00:00:00", "fields": {"price": 10, "tags": ["MOBA"]}}"#,
            "\n",
            r#"{"key": 730, "observed_at": "2025-03-05", "fields": {"price": 0}}"#,
            "\n",
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_hl(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/hl.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_hl(&config_path, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_hl(&config_path, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_hl(&tmp.path().join("nope.toml"), &["init"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_import_then_history_and_as_of() {
    let (tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);
    let file = write_observations(tmp.path());

    let (stdout, stderr, code) = run_hl(&config_path, &["import", file.to_str().unwrap()]);
    assert_eq!(code, Some(0), "import failed: {}", stderr);
    assert!(stdout.contains("observations: 4"));
    assert!(stdout.contains("inserted: 2"));
    assert!(stdout.contains("updated: 1"));
    assert!(stdout.contains("unchanged: 1"));

    let (stdout, _, code) = run_hl(&config_path, &["history", "570"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("[1] 2025-03-01T00:00:00Z .. 2025-03-10T00:00:00Z"));
    assert!(stdout.contains("[2] 2025-03-10T00:00:00Z .. open"));
    assert!(stdout.contains("tags: [MOBA, Strategy]"));
    assert!(!stdout.contains("[3]"));

    let (stdout, _, code) = run_hl(&config_path, &["as-of", "570", "2025-03-05"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("price: 5"));

    // Boundary instant belongs to the newer version
    let (stdout, _, _) = run_hl(&config_path, &["as-of", "570", "2025-03-10T00:00:00Z"]);
    assert!(stdout.contains("price: 10"));

    let (_, stderr, code) = run_hl(&config_path, &["as-of", "570", "2024-01-01"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("No version"));
}

#[test]
fn test_history_json_output() {
    let (tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);
    let file = write_observations(tmp.path());
    run_hl(&config_path, &["import", file.to_str().unwrap()]);

    let (stdout, _, code) = run_hl(&config_path, &["history", "730", "--json"]);
    assert_eq!(code, Some(0));
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let versions = parsed.as_array().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["valid_to"], serde_json::Value::Null);
    assert_eq!(versions[0]["fields"]["price"], 0);
}

#[test]
fn test_vocab_ids_stable_across_invocations() {
    let (_tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);

    let (stdout, _, code) = run_hl(&config_path, &["vocab", "intern", "FPS", "Shooter"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("1\tFPS"));
    assert!(stdout.contains("2\tShooter"));

    let (stdout, _, _) = run_hl(&config_path, &["vocab", "intern", "Shooter", "MOBA"]);
    assert!(stdout.contains("2\tShooter"));
    assert!(stdout.contains("3\tMOBA"));

    let (stdout, _, _) = run_hl(&config_path, &["vocab", "list"]);
    let lines: Vec<&str> = stdout.lines().skip(1).collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[2].contains("MOBA"));
}

#[test]
fn test_vocab_json_file_backend() {
    let (tmp, config_path) = setup_test_env();
    let mapping = tmp.path().join("data/tag_mapping.json");
    fs::create_dir_all(mapping.parent().unwrap()).unwrap();
    fs::write(&mapping, r#"{"Indie": 7}"#).unwrap();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str(&format!(
        "\n[storage]\nvocabulary_file = \"{}\"\n",
        mapping.display()
    ));
    fs::write(&config_path, content).unwrap();
    run_hl(&config_path, &["init"]);

    let (stdout, _, code) = run_hl(&config_path, &["vocab", "intern", "Indie", "Casual"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("7\tIndie"));
    assert!(stdout.contains("8\tCasual"));

    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&mapping).unwrap()).unwrap();
    assert_eq!(on_disk["Casual"], 8);
}

#[test]
fn test_harvest_unreachable_source_exits_2_and_is_resumable() {
    let (tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);
    let keys_file = tmp.path().join("keys.txt");
    fs::write(&keys_file, "# catalog\n570\n730\n\n570\n").unwrap();

    let (stdout, stderr, code) = run_hl(
        &config_path,
        &[
            "harvest",
            "440",
            "--keys-file",
            keys_file.to_str().unwrap(),
            "--progress",
            "off",
        ],
    );
    assert_eq!(code, Some(2), "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("processed: 3"));
    assert!(stdout.contains("transient_failure: 3"));
    assert!(stdout.contains("incomplete: 3 keys still pending"));

    let (stdout, _, code) = run_hl(&config_path, &["checkpoint", "status", "--pending"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("entries: 3"));
    assert!(stdout.contains("transient_failure: 3"));
    assert!(stdout.contains("570  attempts=1"));

    let (_, _, code) = run_hl(&config_path, &["harvest", "570", "--progress", "off"]);
    assert_eq!(code, Some(2));
    let (stdout, _, _) = run_hl(&config_path, &["checkpoint", "status", "--pending"]);
    assert!(stdout.contains("570  attempts=2"));
}

#[test]
fn test_harvest_without_keys_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);
    let (_, stderr, code) = run_hl(&config_path, &["harvest"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("No candidate keys"));
}

#[test]
fn test_checkpoint_reset() {
    let (_tmp, config_path) = setup_test_env();
    run_hl(&config_path, &["init"]);
    run_hl(&config_path, &["harvest", "1", "2", "--progress", "off"]);

    let (stdout, _, code) = run_hl(&config_path, &["checkpoint", "reset", "1", "9"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("reset entries: 1"));

    let (stdout, _, _) = run_hl(&config_path, &["checkpoint", "reset", "--all"]);
    assert!(stdout.contains("reset entries: 1"));

    let (_, stderr, code) = run_hl(&config_path, &["checkpoint", "reset"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("Nothing to reset"));
}
