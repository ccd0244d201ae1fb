use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use log::{error, info};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::admission;
use crate::config::SchedulerConfig;
use crate::db::{Db, NIGHTLY_REQUESTER};
use crate::git::Repo;

/// Age at which the previous nightly run stops being fresh.
const NIGHTLY_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// How long to wait after an error or when master hasn't moved.
const RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Ticks never come closer together than this.
const MIN_DELAY: Duration = Duration::from_secs(3 * 60);

/// Delay before the first check after startup.
const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// The nightly scheduler loop.  Exactly one of these must run per
/// deployment; that is a deployment invariant, nothing here enforces it.
///
/// Once a day (and once more per new master commit) it reads the nightly
/// test manifest from the repository and submits it through admission as
/// the `NayDuck` requester.
pub async fn run(
    db: &mut Db,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let repo = Repo::new(config.repo_url.clone(), config.repo_dir.clone());
    let mut delay = STARTUP_DELAY;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = sleep(delay) => (),
        }
        delay = match tick(db, &repo, config).await {
            Ok(delay) => delay,
            Err(err) => {
                error!("nightly check failed: {err:#}");
                RETRY_DELAY
            }
        }
        .max(MIN_DELAY);
    }
}

/// One nightly check; returns how long to wait before the next one.
async fn tick(db: &mut Db, repo: &Repo, config: &SchedulerConfig) -> anyhow::Result<Duration> {
    let last = db.last_nightly_run()?;
    if let Some(last) = &last {
        let age = (Utc::now() - last.timestamp).to_std().unwrap_or_default();
        if age < NIGHTLY_INTERVAL {
            info!(
                "last nightly at {} ({age:.0?} ago); no need for a new run",
                last.timestamp
            );
            return Ok(NIGHTLY_INTERVAL - age);
        }
        info!("last nightly at {} ({age:.0?} ago); sha={}", last.timestamp, last.sha);
    }

    repo.update().await?;
    let commit = repo.for_commit(&config.branch).await?;
    if let Some(last) = &last {
        if last.sha == commit.sha {
            info!("{} sha={}; no need for a new run", config.branch, commit.sha);
            return Ok(RETRY_DELAY);
        }
    }

    let lines = repo.read_manifest_tests(&commit.sha).await?;
    let tests = admission::parse_test_lines(lines.iter().map(String::as_str))
        .context("nightly manifest contains invalid tests")?;
    let sha = hex::decode(&commit.sha)
        .with_context(|| format!("invalid commit sha {}", commit.sha))?;
    let run_id = db.schedule_run(
        &config.branch,
        &sha,
        &commit.title,
        NIGHTLY_REQUESTER,
        &tests,
    )?;
    info!("scheduled new nightly run: {}/#/run/{run_id}", config.ui_url);
    Ok(NIGHTLY_INTERVAL)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::process::Command as SyncCommand;

    use tempfile::TempDir;

    use super::*;

    fn must_git(dir: &Path, args: &[&str]) {
        let status = SyncCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.email=nayduck@example.com",
                "-c",
                "user.name=nayduck",
            ])
            .args(args)
            .status()
            .expect("git not runnable");
        assert!(status.success(), "git {args:?} failed");
    }

    struct Fixture {
        _temp_dir: TempDir,
        upstream: std::path::PathBuf,
        config: SchedulerConfig,
        db: Db,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::with_prefix("nightly-").expect("couldn't make tempdir");
            let upstream = temp_dir.path().join("upstream");
            std::fs::create_dir_all(upstream.join("nightly")).unwrap();
            std::fs::write(
                upstream.join("nightly/nightly.txt"),
                "pytest sanity/rpc.py\n2 pytest sanity/repro.py\n",
            )
            .unwrap();
            must_git(&upstream, &["init", "-b", "master"]);
            must_git(&upstream, &["add", "."]);
            must_git(&upstream, &["commit", "-m", "initial nightly manifest"]);

            let config = SchedulerConfig {
                repo_url: upstream.to_string_lossy().into_owned(),
                repo_dir: temp_dir.path().join("clone.git"),
                ui_url: "https://nayduck.example".to_owned(),
                branch: "master".to_owned(),
            };
            let db = Db::open(&temp_dir.path().join("nayduck.db")).unwrap();
            Self {
                _temp_dir: temp_dir,
                upstream,
                config,
                db,
            }
        }

        fn repo(&self) -> Repo {
            Repo::new(self.config.repo_url.clone(), self.config.repo_dir.clone())
        }
    }

    #[test_log::test(tokio::test)]
    async fn should_submit_first_nightly_run() {
        let mut fixture = Fixture::new();
        let repo = fixture.repo();
        let delay = tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        assert_eq!(NIGHTLY_INTERVAL, delay);

        let nightly = fixture.db.last_nightly_run().unwrap().expect("no run");
        let run = fixture.db.run_info(nightly.run_id).unwrap().unwrap();
        assert_eq!(NIGHTLY_REQUESTER, run.requester);
        // One rpc.py plus two repro.py.
        assert_eq!(3, run.tests.len());
    }

    #[test_log::test(tokio::test)]
    async fn should_not_resubmit_fresh_run() {
        let mut fixture = Fixture::new();
        let repo = fixture.repo();
        tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        let first = fixture.db.last_nightly_run().unwrap().unwrap();

        // The run we just made is fresh, so the next tick is a no-op telling
        // us to come back when the 24 hours are up.
        let delay = tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        assert!(delay <= NIGHTLY_INTERVAL);
        assert!(delay > NIGHTLY_INTERVAL - Duration::from_secs(60));
        assert_eq!(
            first.run_id,
            fixture.db.last_nightly_run().unwrap().unwrap().run_id
        );
    }

    #[test_log::test(tokio::test)]
    async fn should_skip_unchanged_master_and_catch_new_commits() {
        let mut fixture = Fixture::new();
        let repo = fixture.repo();
        tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        let first = fixture.db.last_nightly_run().unwrap().unwrap();

        // Age the run past the interval without touching master.
        fixture
            .db
            .conn_for_tests()
            .execute(
                "UPDATE runs SET timestamp = '2020-01-01T00:00:00+00:00'",
                [],
            )
            .unwrap();
        let delay = tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        assert_eq!(RETRY_DELAY, delay);
        assert_eq!(
            first.run_id,
            fixture.db.last_nightly_run().unwrap().unwrap().run_id
        );

        // A new commit on master does warrant a new run.
        std::fs::write(
            fixture.upstream.join("nightly/nightly.txt"),
            "pytest sanity/rpc.py\n",
        )
        .unwrap();
        must_git(&fixture.upstream, &["commit", "-am", "trim the manifest"]);
        let delay = tick(&mut fixture.db, &repo, &fixture.config).await.unwrap();
        assert_eq!(NIGHTLY_INTERVAL, delay);
        let second = fixture.db.last_nightly_run().unwrap().unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert_ne!(first.sha, second.sha);
    }
}
