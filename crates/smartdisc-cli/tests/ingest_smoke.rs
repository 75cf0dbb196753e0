#![allow(
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::uninlined_format_args
)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn sd_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_sd") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/sd");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "smartdisc-cli", "--bin", "sd"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build sd binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn sd_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(sd_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sd command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("smartdisc-{tag}-{}.sqlite3", Ulid::new()))
}

#[test]
fn throw_with_samples_round_trip() {
    let db_path = temp_db("ingest");

    let register = sd_output(&db_path, &["disc", "register", "--id", "disc-alpha"]);
    assert_success(&register, "disc register");

    let create = sd_output(
        &db_path,
        &[
            "throw",
            "create",
            "--disc-id",
            "disc-alpha",
            "--player-id",
            "player-1",
            "--rotation",
            "120",
            "--samples-json",
            r#"[{"timestamp":"2026-03-01T10:00:00Z","accel_x":0.5},{"timestamp":"2026-03-01T10:00:01Z"}]"#,
        ],
    );
    assert_success(&create, "throw create");
    let receipt = stdout_json(&create);
    assert_eq!(receipt["inserted_samples"], Value::from(2));
    assert_eq!(receipt["is_new_record"], Value::Bool(true));
    assert_eq!(receipt["record_metric"], Value::from("rotation"));

    let throw_id = match receipt["id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("receipt missing throw id: {receipt}"),
    };

    let samples = sd_output(
        &db_path,
        &["sample", "for-throw", "--throw-id", &throw_id],
    );
    assert_success(&samples, "sample for-throw");
    let samples_json = stdout_json(&samples);
    let listed = match samples_json.as_array() {
        Some(value) => value,
        None => panic!("expected sample array"),
    };
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["sequence_nr"], Value::from(0));
    assert_eq!(listed[1]["sequence_nr"], Value::from(1));

    let audit = sd_output(
        &db_path,
        &[
            "audit",
            "list",
            "--table",
            "throws",
            "--record-id",
            &throw_id,
        ],
    );
    assert_success(&audit, "audit list");
    let audit_json = stdout_json(&audit);
    let entries = match audit_json.as_array() {
        Some(value) => value,
        None => panic!("expected audit array"),
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["operation"], Value::from("insert_complete"));
    assert_eq!(entries[0]["after"]["inserted_samples"], Value::from(2));

    let highscore = sd_output(&db_path, &["highscore", "show", "--player-id", "player-1"]);
    assert_success(&highscore, "highscore show");
    let highscore_json = stdout_json(&highscore);
    assert_eq!(highscore_json["best_rotation"], Value::from(120.0));
    assert_eq!(highscore_json["best_height"], Value::Null);

    let delete = sd_output(&db_path, &["throw", "delete", "--id", &throw_id]);
    assert_success(&delete, "throw delete");

    let get_after_delete = sd_output(&db_path, &["throw", "get", "--id", &throw_id]);
    assert!(
        !get_after_delete.status.success(),
        "soft-deleted throw should not be readable live"
    );

    // History stays addressable: samples and audit entries survive deletion.
    let samples_after = sd_output(
        &db_path,
        &["sample", "for-throw", "--throw-id", &throw_id],
    );
    assert_success(&samples_after, "sample for-throw after delete");
    let samples_after_json = stdout_json(&samples_after);
    assert_eq!(
        samples_after_json.as_array().map(Vec::len),
        Some(2_usize)
    );

    let audit_after = sd_output(
        &db_path,
        &[
            "audit",
            "list",
            "--table",
            "throws",
            "--record-id",
            &throw_id,
        ],
    );
    assert_success(&audit_after, "audit list after delete");
    let audit_after_json = stdout_json(&audit_after);
    assert_eq!(audit_after_json.as_array().map(Vec::len), Some(2_usize));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn validation_failure_exits_nonzero_with_kind() {
    let db_path = temp_db("validation");

    let register = sd_output(&db_path, &["disc", "register", "--id", "disc-alpha"]);
    assert_success(&register, "disc register");

    let create = sd_output(
        &db_path,
        &["throw", "create", "--disc-id", "disc-alpha"],
    );
    assert!(
        !create.status.success(),
        "metric-less throw creation must fail"
    );
    let stderr = String::from_utf8_lossy(&create.stderr);
    assert!(
        stderr.contains("validation error"),
        "stderr should carry the error kind: {stderr}"
    );

    let throws = sd_output(&db_path, &["throw", "list"]);
    assert_success(&throws, "throw list");
    let listed = stdout_json(&throws);
    assert_eq!(listed.as_array().map(Vec::len), Some(0_usize));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn token_issue_resolve_revoke_round_trip() {
    let db_path = temp_db("token");

    let register = sd_output(
        &db_path,
        &["user", "register", "--id", "player-1", "--role", "player"],
    );
    assert_success(&register, "user register");

    let issue = sd_output(&db_path, &["token", "issue", "--user-id", "player-1"]);
    assert_success(&issue, "token issue");
    let issued = stdout_json(&issue);
    let token = match issued["token"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("issue output missing token: {issued}"),
    };

    let resolve = sd_output(&db_path, &["token", "resolve", "--token", &token]);
    assert_success(&resolve, "token resolve");
    let resolved = stdout_json(&resolve);
    assert_eq!(resolved["id"], Value::from("player-1"));
    assert_eq!(resolved["role"], Value::from("player"));

    let revoke = sd_output(&db_path, &["token", "revoke", "--token", &token]);
    assert_success(&revoke, "token revoke");

    let resolve_after = sd_output(&db_path, &["token", "resolve", "--token", &token]);
    assert!(
        !resolve_after.status.success(),
        "revoked token must no longer resolve"
    );

    let _ = std::fs::remove_file(&db_path);
}
