mod util;

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use std::fs;

use fasttext_serving::daemon::core::ServerOptions;
use util::{TempFixtureDir, TestServer, language_model, language_parts, store_with};

fn base_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fasttext-serving"));
    for var in [
        "FASTTEXT_SERVING_CONFIG",
        "FASTTEXT_SERVING_MODELS",
        "FASTTEXT_SERVING_SERVER",
        "FASTTEXT_SERVING_SECURITY",
        "FASTTEXT_SERVING_KEY_FILE",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn keygen_writes_hex_key() {
    let fixtures = TempFixtureDir::new();
    let path = fixtures.path().join("serving.key");

    base_cmd().arg("keygen").arg(&path).assert().success();

    let text = fs::read_to_string(&path).unwrap();
    let key = text.trim();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn keygen_refuses_to_overwrite() {
    let fixtures = TempFixtureDir::new();
    let path = fixtures.path().join("serving.key");
    fs::write(&path, "keep me").unwrap();

    base_cmd()
        .arg("keygen")
        .arg(&path)
        .assert()
        .failure()
        .stderr(contains("already exists"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");

    base_cmd().args(["keygen", "--force"]).arg(&path).assert().success();
    assert_ne!(fs::read_to_string(&path).unwrap(), "keep me");
}

#[test]
fn inspect_prints_model_metadata() {
    let fixtures = TempFixtureDir::new();
    let path = fixtures.write_model("lid", &language_parts());

    let output = base_cmd()
        .arg("inspect")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .clone();
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["name"], "lid");
    assert_eq!(json["labels"], serde_json::json!(["en", "fr", "de"]));
    assert_eq!(json["dim"], 3);
}

#[test]
fn inspect_rejects_garbage() {
    let fixtures = TempFixtureDir::new();
    let path = fixtures.path().join("junk.ftsm");
    fs::write(&path, b"not a model at all").unwrap();

    base_cmd().arg("inspect").arg(&path).assert().failure();
}

#[test]
fn serve_without_models_fails_fast() {
    let fixtures = TempFixtureDir::new();
    let config = fixtures.path().join("config.toml");
    fs::write(&config, "port = 0\n").unwrap();

    base_cmd()
        .arg("--config")
        .arg(&config)
        .arg("serve")
        .assert()
        .failure()
        .stderr(contains("no models configured"));
}

#[test]
fn serve_refuses_http_in_encrypted_mode() {
    let fixtures = TempFixtureDir::new();
    let model = fixtures.write_model("lid", &language_parts());
    let key = fixtures.path().join("serving.key");
    base_cmd().arg("keygen").arg(&key).assert().success();

    base_cmd()
        .args(["serve", "--port", "0", "--http-port", "9", "--security", "encrypted"])
        .arg("--key-file")
        .arg(&key)
        .arg("--model")
        .arg(&model)
        .assert()
        .failure()
        .stderr(contains("plaintext only"));
}

#[test]
fn health_and_predict_against_running_server() {
    let server = TestServer::start(store_with(vec![language_model()]), ServerOptions::default());
    let addr = server.addr.to_string();

    base_cmd()
        .args(["health", "--server", &addr])
        .assert()
        .success()
        .stdout(contains("\"ready\": true"));

    let output = base_cmd()
        .args(["predict", "--server", &addr, "-k", "1"])
        .write_stdin("bonjour le monde\nhallo welt\n")
        .assert()
        .success()
        .get_output()
        .clone();
    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["labels"], serde_json::json!(["fr"]));
    assert_eq!(lines[1]["labels"], serde_json::json!(["de"]));
}

#[test]
fn predict_reports_unreachable_server() {
    base_cmd()
        .args(["predict", "--server", "127.0.0.1:1", "hello"])
        .assert()
        .failure()
        .stderr(contains("connect").or(contains("refused")));
}

#[test]
fn completions_generate_for_bash() {
    base_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(contains("fasttext-serving"));
}

#[test]
fn man_page_renders() {
    base_cmd()
        .arg("man")
        .assert()
        .success()
        .stdout(contains(".TH"));
}
