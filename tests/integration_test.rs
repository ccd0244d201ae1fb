use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context as _};
use serde_json::json;
use tempfile::TempDir;
use test_bin::get_test_bin;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use nayduck::db::{BuildStatus, Db, TestStatus};

// End-to-end runs of the real binary: a run request goes in through the
// `request` subcommand, then builder and worker instances in --once mode
// work the queue against stub cargo/python scripts.

struct Fixture {
    temp_dir: TempDir,
    config_dir: PathBuf,
    db_path: PathBuf,
    sha: String,
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn must_git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.email=nayduck@example.com",
            "-c",
            "user.name=nayduck",
        ])
        .args(args)
        .output()
        .expect("git not runnable");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

impl Fixture {
    /// Sets up an upstream repository, a config directory and stub build
    /// and test commands.  `cargo_body` is the stub cargo's script body.
    fn new(cargo_body: &str) -> Self {
        let temp_dir = TempDir::with_prefix("nayduck-test-").unwrap();
        let root = temp_dir.path();

        // The upstream repository the whole pipeline revolves around.  The
        // pytest directory layout is what the worker expects.
        let upstream = root.join("upstream");
        fs::create_dir_all(upstream.join("pytest/tests/sanity")).unwrap();
        fs::write(
            upstream.join("pytest/tests/sanity/rpc.py"),
            "# exercised through the stub python\n",
        )
        .unwrap();
        must_git(&upstream, &["init"]);
        must_git(&upstream, &["add", "."]);
        must_git(&upstream, &["commit", "-m", "seed upstream"]);
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(&upstream)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let sha = String::from_utf8(output.stdout).unwrap().trim().to_owned();

        let cargo_stub = root.join("cargo-stub");
        write_script(&cargo_stub, cargo_body);
        // The stub python passes; tests needing other behaviour override it.
        let python_stub = root.join("python-stub");
        write_script(&python_stub, "echo test ran fine");

        let config_dir = root.join("config");
        fs::create_dir(&config_dir).unwrap();
        let db_path = root.join("nayduck.db");
        let upstream_url = upstream.to_string_lossy().into_owned();
        let configs = [
            ("database", json!({"path": db_path})),
            (
                "scheduler",
                json!({
                    "repo_url": upstream_url,
                    "repo_dir": root.join("scheduler-clone.git"),
                    "ui_url": "https://nayduck.example",
                }),
            ),
            (
                "builder",
                json!({
                    "workdir": root.join("builder"),
                    "repo_url": upstream_url,
                    "ip": "127.0.0.1",
                    "cargo": cargo_stub,
                    // The test host has no 50 GB to spare.
                    "min_free_bytes": 0,
                }),
            ),
            (
                "worker",
                json!({
                    "workdir": root.join("worker"),
                    "repo_url": upstream_url,
                    "python": python_stub,
                }),
            ),
        ];
        for (service, value) in configs {
            fs::write(
                config_dir.join(format!("{service}.json")),
                value.to_string(),
            )
            .unwrap();
        }

        Self {
            temp_dir,
            config_dir,
            db_path,
            sha,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd: Command = get_test_bin("nayduck").into();
        cmd.arg("--config-dir").arg(&self.config_dir).args(args);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Submits a run request through the binary and returns the parsed
    /// protocol response.
    async fn request(&self, tests: &[&str]) -> anyhow::Result<serde_json::Value> {
        let body = json!({
            "branch": "master",
            "sha": self.sha,
            "tests": tests,
        });
        let mut child = self
            .command(&["request", "--requester", "alice"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning request")?;
        child
            .stdin
            .take()
            .unwrap()
            .write_all(body.to_string().as_bytes())
            .await?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "request failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout).context("parsing response")
    }

    async fn run_daemon_once(&self, daemon: &str) -> anyhow::Result<()> {
        let output = self
            .command(&[daemon, "--once"])
            .output()
            .await
            .with_context(|| format!("running {daemon}"))?;
        if !output.status.success() {
            bail!(
                "{daemon} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    fn db(&self) -> Db {
        Db::open(&self.db_path).expect("couldn't open database")
    }
}

const STUB_CARGO_OK: &str = r#"
mkdir -p target/debug runtime/near-test-contracts/res
touch target/debug/neard target/debug/genesis-populate target/debug/restaked
touch runtime/near-test-contracts/res/test.wasm
echo built just fine
"#;

#[tokio::test]
async fn should_accept_build_and_run_a_test() {
    let fixture = Fixture::new(STUB_CARGO_OK);

    // One test which needs a build and one which doesn't.
    let response = fixture
        .request(&[
            "pytest sanity/rpc.py",
            "# a comment for good measure",
            "pytest --skip-build sanity/rpc.py",
        ])
        .await
        .unwrap();
    assert_eq!(json!(0), response["code"], "{response}");
    let response_text = response["response"].as_str().unwrap();
    assert!(
        response_text.starts_with("Success. https://nayduck.example/#/run/"),
        "{response_text}"
    );

    // Both tests share one (debug, no features) build which is pending.
    {
        let db = fixture.db();
        let run = db.all_runs().unwrap().pop().unwrap();
        assert_eq!("alice", run.requester);
        assert_eq!(fixture.sha, run.sha);
        assert_eq!(1, run.builds.len());
        assert_eq!(BuildStatus::Pending, run.builds[0].status);
        assert_eq!(2, run.builds[0].tests.pending);
    }

    // The builder claims it, runs the stub cargo and publishes artefacts.
    fixture.run_daemon_once("builder").await.unwrap();
    {
        let db = fixture.db();
        let run = db.all_runs().unwrap().pop().unwrap();
        assert_eq!(BuildStatus::Done, run.builds[0].status);
        let info = db.build_info(run.builds[0].build_id).unwrap().unwrap();
        assert!(info.stdout.contains("built just fine"), "{}", info.stdout);
        let build_dir = fixture
            .temp_dir
            .path()
            .join("builder/builds")
            .join(run.builds[0].build_id.to_string());
        assert!(build_dir.join("target/neard").exists());
        assert!(build_dir.join("near-test-contracts/test.wasm").exists());
    }

    // Two worker passes: the first claims the build-needing test and fails
    // it fetching artefacts (no builder host is reachable in a test
    // environment), the second claims the skip-build test which passes.
    fixture.run_daemon_once("worker").await.unwrap();
    fixture.run_daemon_once("worker").await.unwrap();
    {
        let db = fixture.db();
        let run_id = db.all_runs().unwrap().pop().unwrap().run_id;
        let run = db.run_info(run_id).unwrap().unwrap();
        let passed: Vec<_> = run
            .tests
            .iter()
            .filter(|test| test.status == TestStatus::Passed)
            .collect();
        let failed: Vec<_> = run
            .tests
            .iter()
            .filter(|test| test.status == TestStatus::Failed)
            .collect();
        assert_eq!((1, 1), (passed.len(), failed.len()), "{:?}", run.tests);

        // The passing test's stdout got collected.
        let log = db
            .test_log(passed[0].test_id, "stdout", false)
            .unwrap()
            .expect("no stdout log");
        assert_eq!(b"test ran fine\n".to_vec(), log.data);
        // The fetch failure left a synthetic log naming the problem.
        let info = db.test_info(failed[0].test_id).unwrap().unwrap();
        assert!(
            info.logs.iter().any(|log| log.log_type == "fetch"),
            "{:?}",
            info.logs
        );
    }
}

#[tokio::test]
async fn should_cascade_cancel_when_build_fails() {
    let fixture = Fixture::new("echo no compiler today >&2\nexit 1");

    fixture
        .request(&["pytest sanity/rpc.py", "pytest sanity/rpc.py arg"])
        .await
        .unwrap();
    fixture.run_daemon_once("builder").await.unwrap();

    {
        let db = fixture.db();
        let run = db.all_runs().unwrap().pop().unwrap();
        assert_eq!(BuildStatus::Failed, run.builds[0].status);
        assert_eq!(2, run.builds[0].tests.canceled);
        let info = db.build_info(run.builds[0].build_id).unwrap().unwrap();
        assert!(info.stderr.contains("no compiler today"), "{}", info.stderr);
    }

    // The worker finds nothing to do; the canceled tests stay canceled.
    fixture.run_daemon_once("worker").await.unwrap();
    let db = fixture.db();
    let run = db.all_runs().unwrap().pop().unwrap();
    assert_eq!(2, run.builds[0].tests.canceled);
}

#[tokio::test]
async fn should_reject_bad_requests_via_protocol() {
    let fixture = Fixture::new(STUB_CARGO_OK);

    let response = fixture.request(&["pytest"]).await.unwrap();
    assert_eq!(json!(1), response["code"], "{response}");
    let message = response["response"].as_str().unwrap();
    assert!(message.contains("missing test argument"), "{message}");

    // Nothing was committed.
    assert!(fixture.db().all_runs().unwrap().is_empty());

    // Only comments means no tests.
    let response = fixture.request(&["# nope", "  "]).await.unwrap();
    assert_eq!(json!(1), response["code"], "{response}");
}

#[tokio::test]
async fn should_requeue_postponed_test_and_pass_on_retry() {
    let fixture = Fixture::new(STUB_CARGO_OK);

    // The stub python asks to be postponed on its first invocation and
    // passes on the second, tracked through a marker file.
    let marker = fixture.temp_dir.path().join("postponed-once");
    let python_stub = fixture.temp_dir.path().join("python-stub");
    write_script(
        &python_stub,
        &format!(
            "if [ -e {marker} ]; then echo second time lucky; else touch {marker}; exit 13; fi",
            marker = marker.display()
        ),
    );

    fixture
        .request(&["pytest --skip-build sanity/rpc.py"])
        .await
        .unwrap();

    // First attempt: the test postpones itself.
    fixture.run_daemon_once("worker").await.unwrap();
    {
        let db = fixture.db();
        let run_id = db.all_runs().unwrap().pop().unwrap().run_id;
        let test = &db.run_info(run_id).unwrap().unwrap().tests[0];
        assert_eq!(TestStatus::Pending, test.status);
    }

    // The cool-off keeps it unclaimable for three minutes; wind the clock
    // forward rather than waiting.
    rusqlite::Connection::open(&fixture.db_path)
        .unwrap()
        .execute("UPDATE tests SET select_after = 0", [])
        .unwrap();

    // Second attempt passes with tries = 2.
    fixture.run_daemon_once("worker").await.unwrap();
    let db = fixture.db();
    let run_id = db.all_runs().unwrap().pop().unwrap().run_id;
    let test_id = db.run_info(run_id).unwrap().unwrap().tests[0].test_id;
    let info = db.test_info(test_id).unwrap().unwrap();
    assert_eq!(TestStatus::Passed, info.status);
    assert_eq!(2, info.tries);
    let log = db.test_log(test_id, "stdout", false).unwrap().unwrap();
    assert_eq!(b"second time lucky\n".to_vec(), log.data);
}
