use std::ffi::OsString;
use std::fs::File;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use log::{error, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::blobs::BlobStore;
use crate::builder::ip_to_string;
use crate::config::WorkerConfig;
use crate::db::{Db, ShortLog, TestClaim, TestStatus};
use crate::logs::{self, BACKTRACE_PATTERN, INTERESTING_PATTERNS};
use crate::process::CommandExt as _;
use crate::testspec::{Category, TestSpec};

/// How long to sleep when there is nothing to claim.
const IDLE_DELAY: Duration = Duration::from_secs(5);

/// After the watchdog interrupts a timed-out test, how long the process
/// group gets to wind down before it is killed outright.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How a test run ended.  Unlike [`TestStatus`] this includes POSTPONE,
/// which never reaches the tests table as a status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Ignored,
    Failed,
    Timeout,
    /// The test asked to be re-queued (exit code 13), e.g. because the
    /// cluster of machines it needs is not available right now.
    Postpone,
}

/// The test dispatcher daemon, identified by its hostname.
pub struct Worker {
    db: Db,
    config: WorkerConfig,
    hostname: String,
    blobs: Option<Box<dyn BlobStore>>,
    repo_dir: PathBuf,
    output_root: PathBuf,
}

impl Worker {
    pub fn new(
        db: Db,
        config: WorkerConfig,
        blobs: Option<Box<dyn BlobStore>>,
    ) -> anyhow::Result<Self> {
        let hostname = nix::unistd::gethostname()
            .context("couldn't read hostname")?
            .to_string_lossy()
            .into_owned();
        std::fs::create_dir_all(&config.workdir)
            .with_context(|| format!("creating {}", config.workdir.display()))?;
        let repo_dir = config.workdir.join("nearcore");
        let output_root = config.workdir.join("output");
        Ok(Self {
            db,
            config,
            hostname,
            blobs,
            repo_dir,
            output_root,
        })
    }

    /// The daemon loop.  With `once` set, processes at most one test and
    /// returns; used by tests and for manual smoke runs.
    pub async fn run(&mut self, cancel: CancellationToken, once: bool) -> anyhow::Result<()> {
        info!(
            "starting worker at {}{}",
            self.hostname,
            if self.config.mocknet { " (mocknet)" } else { "" },
        );
        self.db.recover_tests(&self.hostname)?;
        while !cancel.is_cancelled() {
            let claim = match self.db.claim_test(&self.hostname, self.config.mocknet) {
                Ok(claim) => claim,
                Err(err) => {
                    error!("claiming test failed: {err:#}");
                    None
                }
            };
            match claim {
                Some(test) => {
                    if let Err(err) = self.handle_test(&test).await {
                        // Not a test failure but us failing to process it;
                        // record what we know so the test doesn't stay
                        // RUNNING forever.
                        error!("test #{} broke the worker: {err:#}", test.test_id);
                        self.report_broken_test(test.test_id, "worker", format!("{err:#}"));
                    }
                    if once {
                        break;
                    }
                }
                None => {
                    if once {
                        break;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = sleep(IDLE_DELAY) => (),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_test(&mut self, test: &TestClaim) -> anyhow::Result<()> {
        info!("test #{}: {} (try {})", test.test_id, test.name, test.tries);
        let spec = match TestSpec::from_row(&test.name, test.timeout, test.skip_build) {
            Ok(spec) => spec,
            Err(err) => {
                self.report_broken_test(test.test_id, "worker", format!("{err:#}"));
                return Ok(());
            }
        };

        if let Err(err) = self.checkout(&test.sha).await {
            warn!("test #{}: checkout failed: {err:#}", test.test_id);
            self.report_broken_test(test.test_id, "checkout", format!("{err:#}"));
            return Ok(());
        }

        // One output directory per test id; everything from the previous
        // test on this host goes away first.
        if self.output_root.exists() {
            std::fs::remove_dir_all(&self.output_root).context("cleaning output directory")?;
        }
        let outdir = self.output_root.join(test.test_id.to_string());
        std::fs::create_dir_all(&outdir).context("creating output directory")?;

        if !spec.skip_build {
            if let Err(err) = self.fetch_artifacts(test, &spec).await {
                // Transient infrastructure trouble, but retrying is not
                // worth the complexity; the test is failed with the scp
                // error attached and a human can hit retry.
                warn!("test #{}: fetching artefacts failed: {err:#}", test.test_id);
                self.report_broken_test(test.test_id, "fetch", format!("{err:#}"));
                return Ok(());
            }
        }

        if spec.category == Category::Pytest {
            clean_node_homes().context("cleaning node homes")?;
        }

        let outcome = execute_test(&self.config.python, &self.repo_dir, &spec, &outdir).await?;
        info!("test #{}: {:?}", test.test_id, outcome);

        if outcome == Outcome::Postpone {
            return self.db.postpone_test(test.test_id);
        }

        if spec.category == Category::Pytest {
            if let Err(err) = collect_node_homes(&outdir) {
                warn!("test #{}: couldn't collect node logs: {err:#}", test.test_id);
            }
        }
        let logs = self.collect_logs(test.test_id, &outdir);
        self.db.save_short_logs(test.test_id, &logs)?;
        let status = match outcome {
            Outcome::Passed => TestStatus::Passed,
            Outcome::Ignored => TestStatus::Ignored,
            Outcome::Failed => TestStatus::Failed,
            Outcome::Timeout => TestStatus::Timeout,
            Outcome::Postpone => unreachable!("handled above"),
        };
        self.db.update_test_status(test.test_id, status)
    }

    /// Fails a test with a synthetic log carrying the reason.  Used when the
    /// worker could not even get to running the test.
    fn report_broken_test(&mut self, test_id: i64, log_type: &str, message: String) {
        let log = ShortLog {
            log_type: log_type.to_owned(),
            size: message.len() as u64,
            data: message.into_bytes(),
            storage: None,
            stack_trace: false,
            patterns: String::new(),
        };
        if let Err(err) = self
            .db
            .save_short_logs(test_id, &[log])
            .and_then(|()| self.db.update_test_status(test_id, TestStatus::Failed))
        {
            error!("couldn't record failure of test #{test_id}: {err:#}");
        }
    }

    /// Checks out the commit in the local clone, cloning from scratch when
    /// updating the existing one doesn't work out.
    async fn checkout(&self, sha: &str) -> anyhow::Result<()> {
        if self.repo_dir.is_dir() {
            // The target directories only hold artefacts fetched for the
            // previous test; they are stale now.
            for target in ["target", "target_expensive"] {
                let dir = self.repo_dir.join(target);
                if dir.exists() {
                    tokio::fs::remove_dir_all(&dir)
                        .await
                        .with_context(|| format!("removing {}", dir.display()))?;
                }
            }
            let updated = Command::new("git")
                .args(["remote", "update", "--prune"])
                .current_dir(&self.repo_dir)
                .execute_ok()
                .await
                .is_ok();
            if updated
                && Command::new("git")
                    .args(["checkout", sha])
                    .current_dir(&self.repo_dir)
                    .execute_ok()
                    .await
                    .is_ok()
            {
                return Ok(());
            }
            warn!("updating {:?} failed, recloning", self.repo_dir);
        }

        if self.repo_dir.exists() {
            tokio::fs::remove_dir_all(&self.repo_dir)
                .await
                .with_context(|| format!("removing {}", self.repo_dir.display()))?;
        }
        tokio::fs::create_dir_all(&self.config.workdir)
            .await
            .context("creating workdir")?;
        Command::new("git")
            .arg("clone")
            .arg(&self.config.repo_url)
            .arg("nearcore")
            .current_dir(&self.config.workdir)
            .execute_ok()
            .await
            .context("cloning repository")?;
        Command::new("git")
            .args(["checkout", sha])
            .current_dir(&self.repo_dir)
            .execute_ok()
            .await
            .with_context(|| format!("checking out {sha}"))?;
        Ok(())
    }

    /// Copies the build's artefacts from the owning builder into the local
    /// checkout, where the test expects to find them.
    async fn fetch_artifacts(&self, test: &TestClaim, spec: &TestSpec) -> anyhow::Result<()> {
        let host = ip_to_string(test.builder_ip);
        let build_type = spec.build_dir();
        self.scp(
            &host,
            &format!("{}/target/*", test.build_id),
            &format!("target/{build_type}"),
        )
        .await?;
        self.scp(
            &host,
            &format!("{}/near-test-contracts/*", test.build_id),
            "runtime/near-test-contracts/res",
        )
        .await?;
        if spec.category == Category::Expensive {
            let exe = spec.args[1].replace('-', "_");
            self.scp(
                &host,
                &format!("{}/expensive/{exe}-*", test.build_id),
                &format!("target_expensive/{build_type}/deps"),
            )
            .await?;
        }
        Ok(())
    }

    async fn scp(&self, host: &str, src: &str, dst: &str) -> anyhow::Result<()> {
        let dst = self.repo_dir.join(dst);
        tokio::fs::create_dir_all(&dst)
            .await
            .with_context(|| format!("creating {}", dst.display()))?;
        // BatchMode: a daemon must never sit on a password prompt.
        Command::new("scp")
            .args(["-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"])
            .arg(format!(
                "{}@{host}:{}/{src}",
                self.config.scp_user, self.config.remote_builds_dir
            ))
            .arg(&dst)
            .execute_ok()
            .await?;
        Ok(())
    }

    /// Turns every file in the output directory into a log row: size,
    /// interesting patterns, an inline snippet and (when a blob store is
    /// configured) the URL of the archived full file.
    fn collect_logs(&self, test_id: i64, outdir: &Path) -> Vec<ShortLog> {
        let files = match logs::list_output_files(outdir) {
            Ok(files) => files,
            Err(err) => {
                error!("couldn't scan {}: {err}", outdir.display());
                return Vec::new();
            }
        };
        let mut result = Vec::with_capacity(files.len());
        for file in files {
            let size = match file.path.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    warn!("couldn't stat {}: {err}", file.path.display());
                    continue;
                }
            };
            let mut patterns = logs::find_patterns(&file.path, INTERESTING_PATTERNS)
                .unwrap_or_else(|err| {
                    warn!("couldn't scan {}: {err}", file.path.display());
                    Vec::new()
                });
            let stack_trace = match patterns.iter().position(|p| *p == BACKTRACE_PATTERN) {
                Some(index) => {
                    patterns.remove(index);
                    true
                }
                None => false,
            };
            let data = logs::snippet(&file.path).unwrap_or_else(|err| {
                warn!("couldn't read {}: {err}", file.path.display());
                Vec::new()
            });
            let storage = self
                .blobs
                .as_ref()
                .and_then(|blobs| blobs.upload_test_log(test_id, &file.name, &file.path));
            result.push(ShortLog {
                log_type: file.name,
                size,
                data,
                storage,
                stack_trace,
                patterns: patterns.join(","),
            });
        }
        result
    }
}

/// Runs the test with a wall-clock watchdog and classifies the outcome.
///
/// The child gets its own process group so that the watchdog can take the
/// whole tree down, not just the leader: first SIGINT so nodes can shut
/// down cleanly, then after a grace period SIGKILL.  The timeout is
/// enforced from out here no matter what the child does with its streams.
pub async fn execute_test(
    python: &str,
    repo_dir: &Path,
    spec: &TestSpec,
    outdir: &Path,
) -> anyhow::Result<Outcome> {
    let (cwd, argv) = test_command(python, repo_dir, spec)?;
    let stdout = File::create(outdir.join("stdout")).context("creating stdout file")?;
    let stderr = File::create(outdir.join("stderr")).context("creating stderr file")?;

    let mut cmd = std::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&cwd)
        .env("RUST_BACKTRACE", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);
    let mut child = Command::from(cmd)
        .spawn()
        .with_context(|| format!("spawning {:?}", argv[0]))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow!("no pid for spawned test"))? as i32;

    let timeout = Duration::from_secs(u64::from(spec.full_timeout()));
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("waiting for test")?,
        Err(_) => {
            info!("test ran over its {timeout:?} budget; taking down the process group");
            terminate_group(pid, &mut child).await;
            return Ok(Outcome::Timeout);
        }
    };
    // The leader exited but background children may still hang around
    // holding ports; sweep the group.
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    classify_outcome(status, spec, outdir)
}

async fn terminate_group(pgid: i32, child: &mut tokio::process::Child) {
    let pgid = Pid::from_raw(pgid);
    if killpg(pgid, Signal::SIGINT).is_ok()
        && tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_ok()
    {
        // The leader reacted to the interrupt; stragglers get no say.
        let _ = killpg(pgid, Signal::SIGKILL);
        return;
    }
    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

/// Assembles the command line for a test.
fn test_command(
    python: &str,
    repo_dir: &Path,
    spec: &TestSpec,
) -> anyhow::Result<(PathBuf, Vec<OsString>)> {
    match spec.category {
        Category::Pytest | Category::Mocknet => {
            let script = spec
                .args
                .first()
                .ok_or_else(|| anyhow!("test has no script argument"))?;
            let mut argv = vec![OsString::from(python)];
            argv.push(format!("tests/{script}").into());
            argv.extend(spec.args[1..].iter().map(OsString::from));
            Ok((repo_dir.join("pytest"), argv))
        }
        Category::Expensive => {
            // The compiled test executable carries a metadata hash suffix,
            // e.g. test_tps-0a1b2c3d; match on the mangled prefix.
            let deps_dir = repo_dir
                .join("target_expensive")
                .join(spec.build_dir())
                .join("deps");
            let prefix = spec.args[1].replace('-', "_") + "-";
            let mut executable = None;
            for entry in std::fs::read_dir(&deps_dir)
                .with_context(|| format!("reading {}", deps_dir.display()))?
            {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    executable = Some(entry.path());
                    break;
                }
            }
            let executable = executable.ok_or_else(|| {
                anyhow!("no {prefix}* executable in {}", deps_dir.display())
            })?;
            let argv = vec![
                executable.into_os_string(),
                OsString::from(&spec.args[2]),
                "--exact".into(),
                "--nocapture".into(),
            ];
            Ok((repo_dir.to_owned(), argv))
        }
    }
}

/// Classifies a finished (non-timed-out) test run.
fn classify_outcome(
    status: ExitStatus,
    spec: &TestSpec,
    outdir: &Path,
) -> anyhow::Result<Outcome> {
    match status.code() {
        Some(0) => {
            if spec.category != Category::Expensive {
                return Ok(Outcome::Passed);
            }
            // The harness prints a summary as its last line; an empty stdout
            // or a "0 passed" summary means the filter matched nothing.
            let stdout = std::fs::read_to_string(outdir.join("stdout")).unwrap_or_default();
            let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
            let ignored = match last_line {
                None => true,
                Some(line) => line.contains("0 passed"),
            };
            // Some tests swallow panics from their threads; the backtrace in
            // stderr gives them away.
            let stderr = std::fs::read_to_string(outdir.join("stderr")).unwrap_or_default();
            if stderr.lines().any(|line| line.trim() == BACKTRACE_PATTERN) {
                return Ok(Outcome::Failed);
            }
            Ok(if ignored {
                Outcome::Ignored
            } else {
                Outcome::Passed
            })
        }
        Some(13) => Ok(Outcome::Postpone),
        _ => Ok(Outcome::Failed),
    }
}

/// Node homes from the previous pytest run must not leak into this one.
fn clean_node_homes() -> anyhow::Result<()> {
    for dir in node_home_dirs()? {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("removing {}", dir.display()))?;
    }
    Ok(())
}

/// Copies each node home's top-level files into the output directory so the
/// per-node logs get collected alongside the test's own streams.
fn collect_node_homes(outdir: &Path) -> anyhow::Result<()> {
    for dir in node_home_dirs()? {
        let Some(name) = dir.file_name() else {
            continue;
        };
        let dst = outdir.join(name);
        std::fs::create_dir_all(&dst)?;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), dst.join(entry.file_name()))?;
            }
        }
    }
    Ok(())
}

/// `~/.near/test*` directories, where the pytest framework puts node homes.
fn node_home_dirs() -> anyhow::Result<Vec<PathBuf>> {
    let Some(dirs) = directories::BaseDirs::new() else {
        return Ok(Vec::new());
    };
    let near = dirs.home_dir().join(".near");
    if !near.is_dir() {
        return Ok(Vec::new());
    }
    let mut result = Vec::new();
    for entry in std::fs::read_dir(&near)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("test") {
            result.push(entry.path());
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt as _;
    use std::os::unix::process::ExitStatusExt as _;
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    fn spec(line: &str) -> TestSpec {
        TestSpec::parse(line).unwrap()
    }

    fn exit_status(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn write_outputs(dir: &Path, stdout: &str, stderr: &str) {
        fs::write(dir.join("stdout"), stdout).unwrap();
        fs::write(dir.join("stderr"), stderr).unwrap();
    }

    #[test_case(0, "collected 3 items\n3 passed\n", "", Outcome::Passed; "pytest passes")]
    #[test_case(1, "", "Traceback (most recent call last):\n", Outcome::Failed; "pytest fails")]
    #[test_case(13, "", "", Outcome::Postpone; "pytest postpones")]
    fn should_classify_pytest(code: i32, stdout: &str, stderr: &str, want: Outcome) {
        let dir = TempDir::new().unwrap();
        write_outputs(dir.path(), stdout, stderr);
        let got =
            classify_outcome(exit_status(code), &spec("pytest sanity/rpc.py"), dir.path())
                .unwrap();
        assert_eq!(want, got);
    }

    #[test_case("running 1 test\ntest t ... ok\n1 passed\n", "", Outcome::Passed; "passes")]
    #[test_case("", "", Outcome::Ignored; "empty stdout is ignored")]
    #[test_case("running 0 tests\n0 passed; 0 failed\n\n\n", "", Outcome::Ignored; "zero passed is ignored")]
    #[test_case("1 passed\n", "thread panicked\nstack backtrace:\n", Outcome::Failed; "backtrace fails it")]
    fn should_classify_expensive(stdout: &str, stderr: &str, want: Outcome) {
        let dir = TempDir::new().unwrap();
        write_outputs(dir.path(), stdout, stderr);
        let got = classify_outcome(
            exit_status(0),
            &spec("expensive nearcore test_tps test::t"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(want, got);
    }

    #[test]
    fn should_treat_signal_death_as_failure() {
        let dir = TempDir::new().unwrap();
        write_outputs(dir.path(), "", "");
        // Raw wait status 9 = killed by SIGKILL.
        let got = classify_outcome(
            ExitStatus::from_raw(9),
            &spec("pytest sanity/rpc.py"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(Outcome::Failed, got);
    }

    #[test]
    fn should_assemble_pytest_command() {
        let (cwd, argv) = test_command(
            "python",
            Path::new("/work/nearcore"),
            &spec("pytest sanity/state_sync.py manytx 115"),
        )
        .unwrap();
        assert_eq!(Path::new("/work/nearcore/pytest"), cwd);
        let argv: Vec<String> = argv
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            vec![
                "python".to_owned(),
                "tests/sanity/state_sync.py".to_owned(),
                "manytx".to_owned(),
                "115".to_owned(),
            ],
            argv,
        );
    }

    #[test]
    fn should_locate_expensive_executable() {
        let dir = TempDir::new().unwrap();
        let deps = dir.path().join("target_expensive/debug/deps");
        fs::create_dir_all(&deps).unwrap();
        fs::write(deps.join("test_tps-77aa88bb"), "").unwrap();
        fs::write(deps.join("other-11223344"), "").unwrap();

        let (cwd, argv) = test_command(
            "python",
            dir.path(),
            &spec("expensive nearcore test-tps test::test_highload"),
        )
        .unwrap();
        assert_eq!(dir.path(), cwd);
        assert!(argv[0].to_string_lossy().ends_with("test_tps-77aa88bb"));
        assert_eq!(
            vec!["test::test_highload", "--exact", "--nocapture"],
            argv[1..]
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
        );

        // No matching executable is an error up front, not a spawn failure.
        assert!(test_command(
            "python",
            dir.path(),
            &spec("expensive nearcore missing test::t"),
        )
        .is_err());
    }

    // A stand-in python which the execute tests drive; the "script" argument
    // it gets is what controls its behaviour.
    fn fake_python(dir: &Path, body: &str) -> String {
        let path = dir.join("python");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn repo_with_pytest_dir(dir: &Path) -> PathBuf {
        let repo = dir.join("nearcore");
        fs::create_dir_all(repo.join("pytest")).unwrap();
        repo
    }

    #[test_log::test(tokio::test)]
    async fn should_run_and_capture_output() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with_pytest_dir(dir.path());
        let python = fake_python(dir.path(), "echo out went here; echo err went here >&2");
        let outdir = dir.path().join("out");
        fs::create_dir(&outdir).unwrap();

        let outcome = execute_test(&python, &repo, &spec("pytest sanity/rpc.py"), &outdir)
            .await
            .unwrap();
        assert_eq!(Outcome::Passed, outcome);
        assert_eq!(
            "out went here\n",
            fs::read_to_string(outdir.join("stdout")).unwrap()
        );
        assert_eq!(
            "err went here\n",
            fs::read_to_string(outdir.join("stderr")).unwrap()
        );
    }

    #[test_log::test(tokio::test)]
    async fn should_report_postpone() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with_pytest_dir(dir.path());
        let python = fake_python(dir.path(), "exit 13");
        let outdir = dir.path().join("out");
        fs::create_dir(&outdir).unwrap();

        let outcome = execute_test(&python, &repo, &spec("pytest sanity/rpc.py"), &outdir)
            .await
            .unwrap();
        assert_eq!(Outcome::Postpone, outcome);
    }

    #[test_log::test(tokio::test)]
    async fn should_enforce_timeout_on_process_group() {
        let dir = TempDir::new().unwrap();
        let repo = repo_with_pytest_dir(dir.path());
        // The child spawns a grandchild; both must die with the group.
        let pid_file = dir.path().join("grandchild_pid");
        let python = fake_python(
            dir.path(),
            &format!("sleep 600 & echo $! > {}\nwait", pid_file.display()),
        );
        let outdir = dir.path().join("out");
        fs::create_dir(&outdir).unwrap();

        let mut test_spec = spec("pytest sanity/rpc.py");
        test_spec.timeout = 1;

        let start = Instant::now();
        let outcome = execute_test(&python, &repo, &test_spec, &outdir)
            .await
            .unwrap();
        assert_eq!(Outcome::Timeout, outcome);
        // One second budget plus at most the grace period, not ten minutes.
        assert!(start.elapsed() < Duration::from_secs(30));

        let grandchild: i32 = fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // The grandchild must be gone too; poll for a bit since the reaper
        // may take a moment (a null signal probes for existence).
        let mut dead = false;
        for _ in 0..20 {
            if nix::sys::signal::kill(Pid::from_raw(grandchild), None).is_err() {
                dead = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(dead, "grandchild {grandchild} survived the group kill");
    }
}
