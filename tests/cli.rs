use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn base_cmd(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("rfs"));
    cmd.env_remove("RFS_CONFIG")
        .env_remove("RFS_PASSWORD")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config);
    cmd
}

struct Workspace {
    tmp: TempDir,
}

impl Workspace {
    /// Local-protocol setup: `remote/` plays the server, `spool/` is the
    /// source's local directory.
    fn new(extra_source: &str, extra_sink: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("remote/outbox")).unwrap();
        let config = format!(
            "[session]\nprotocol = \"local\"\nroot = \"remote\"\npassword = \"hunter2\"\n\n\
             [source]\nremote_dir = \"/outbox\"\nlocal_dir = \"spool\"\nmetadata_db = \"state/metadata.db\"\n\
             filename_pattern = \"*.txt\"\n{extra_source}\n\
             [sink]\nremote_dir = \"/inbox\"\n{extra_sink}\n"
        );
        fs::write(tmp.path().join("rfs.toml"), config).unwrap();
        Self { tmp }
    }

    fn config(&self) -> PathBuf {
        self.tmp.path().join("rfs.toml")
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }

    fn put_remote(&self, rel: &str, content: &str) {
        let path = self.path("remote").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn cmd(&self) -> Command {
        base_cmd(&self.config())
    }

    fn poll_once(&self) -> Vec<Value> {
        let output = self.cmd().args(["source", "--once"]).output().unwrap();
        assert!(
            output.status.success(),
            "source failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

#[test]
fn config_check_accepts_valid_file() {
    let ws = Workspace::new("", "");
    ws.cmd()
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(contains("Configuration OK"));
}

#[test]
fn config_check_rejects_sftp_without_username() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("rfs.toml");
    fs::write(&path, "[session]\nprotocol = \"sftp\"\nhost = \"files\"\n").unwrap();

    base_cmd(&path)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(contains("username"));
}

#[test]
fn config_show_redacts_password() {
    let ws = Workspace::new("", "");
    ws.cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("protocol = \"local\""))
        .stdout(contains("hunter2").not());
}

#[test]
fn missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    base_cmd(&tmp.path().join("nope.toml"))
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn source_ingests_each_file_once() {
    let ws = Workspace::new("", "");
    ws.put_remote("outbox/a.txt", "alpha");
    ws.put_remote("outbox/b.txt", "bravo");
    ws.put_remote("outbox/c.csv", "skipped");

    let events = ws.poll_once();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["source_remote_path"], "/outbox/a.txt");
    assert_eq!(events[1]["source_remote_path"], "/outbox/b.txt");
    assert_eq!(events[0]["payload"]["mode"], "ref");
    assert_eq!(events[0]["size"], 5);

    assert_eq!(fs::read_to_string(ws.path("spool/a.txt")).unwrap(), "alpha");
    assert_eq!(fs::read_to_string(ws.path("spool/b.txt")).unwrap(), "bravo");
    assert!(!ws.path("spool/c.csv").exists());

    // Records persist in SQLite, so a fresh process ingests nothing.
    assert!(ws.poll_once().is_empty());

    ws.put_remote("outbox/d.txt", "delta");
    let events = ws.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["source_remote_path"], "/outbox/d.txt");
}

#[test]
fn source_once_fails_when_the_only_cycle_failed() {
    let ws = Workspace::new("", "");
    fs::remove_dir(ws.path("remote/outbox")).unwrap();

    ws.cmd()
        .args(["source", "--once"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn source_lines_mode() {
    let ws = Workspace::new("reading_mode = \"lines\"", "");
    ws.put_remote("outbox/a.txt", "one\ntwo\n");

    let events = ws.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["payload"]["mode"], "lines");
    assert_eq!(events[0]["payload"]["lines"], serde_json::json!(["one", "two"]));
}

#[test]
fn metadata_forget_allows_reingestion() {
    let ws = Workspace::new("", "");
    ws.put_remote("outbox/a.txt", "alpha");
    assert_eq!(ws.poll_once().len(), 1);

    ws.cmd()
        .args(["metadata", "list"])
        .assert()
        .success()
        .stdout(contains("/outbox/a.txt"));

    ws.cmd()
        .args(["metadata", "forget", "/outbox/a.txt"])
        .assert()
        .success()
        .stdout(contains("Forgot /outbox/a.txt"));

    let events = ws.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["source_remote_path"], "/outbox/a.txt");

    ws.cmd()
        .args(["metadata", "clear"])
        .assert()
        .success()
        .stdout(contains("Removed 1 record"));
}

#[test]
fn sink_uploads_named_files() {
    let ws = Workspace::new("", "");
    let local = ws.path("report.csv");
    fs::write(&local, "a,b\n").unwrap();

    let output = ws.cmd().arg("sink").arg(&local).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let line: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(line["result"]["outcome"], "uploaded");
    assert_eq!(line["result"]["remote_path"], "/inbox/report.csv");

    assert_eq!(
        fs::read_to_string(ws.path("remote/inbox/report.csv")).unwrap(),
        "a,b\n"
    );
    assert!(!ws.path("remote/inbox/report.csv.tmp").exists());
}

#[test]
fn sink_reads_paths_from_stdin() {
    let ws = Workspace::new("", "filename_expression = \"{stem:upper}.{ext}\"");
    fs::write(ws.path("a.txt"), "1").unwrap();
    fs::write(ws.path("b.txt"), "2").unwrap();
    let stdin = format!(
        "{}\n\n{}\n",
        ws.path("a.txt").display(),
        ws.path("b.txt").display()
    );

    ws.cmd().arg("sink").write_stdin(stdin).assert().success();

    assert_eq!(fs::read_to_string(ws.path("remote/inbox/A.txt")).unwrap(), "1");
    assert_eq!(fs::read_to_string(ws.path("remote/inbox/B.txt")).unwrap(), "2");
}

#[test]
fn sink_fail_policy_keeps_existing_target() {
    let ws = Workspace::new("", "collision_policy = \"fail\"");
    ws.put_remote("inbox/a.txt", "old");
    fs::write(ws.path("a.txt"), "new").unwrap();

    ws.cmd()
        .arg("sink")
        .arg(ws.path("a.txt"))
        .assert()
        .failure()
        .stderr(contains("1 of 1 uploads failed"));

    assert_eq!(fs::read_to_string(ws.path("remote/inbox/a.txt")).unwrap(), "old");
}

#[test]
fn completions_are_generated() {
    Command::new(assert_cmd::cargo::cargo_bin!("rfs"))
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(contains("rfs"));
}
