use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension as _, ToSql, TransactionBehavior};
use serde::Serialize;

use crate::testspec::{Category, TestSpec};

/// How many times a test may be started before we give up on it.
pub const MAX_TRIES: u32 = 3;

/// Cool-off before a postponed test becomes claimable again.
const POSTPONE_DELAY_SECS: i64 = 180;

/// Authentication cookies live for ten minutes.
const AUTH_COOKIE_TTL_SECS: i64 = 600;

/// Identity the nightly scheduler submits runs under.
pub const NIGHTLY_REQUESTER: &str = "NayDuck";

const GZIP_MAGIC: &[u8] = b"\x1f\x8b";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "BUILDING")]
    Building,
    #[serde(rename = "BUILD DONE")]
    Done,
    #[serde(rename = "BUILD FAILED")]
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Done => "BUILD DONE",
            Self::Failed => "BUILD FAILED",
        }
    }

    fn from_str(status: &str) -> Option<Self> {
        match status {
            "PENDING" => Some(Self::Pending),
            "BUILDING" => Some(Self::Building),
            "BUILD DONE" => Some(Self::Done),
            "BUILD FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TestStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "IGNORED")]
    Ignored,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "BUILD FAILED")]
    BuildFailed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Ignored => "IGNORED",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::BuildFailed => "BUILD FAILED",
        }
    }

    fn from_str(status: &str) -> Option<Self> {
        match status {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PASSED" => Some(Self::Passed),
            "FAILED" => Some(Self::Failed),
            "IGNORED" => Some(Self::Ignored),
            "TIMEOUT" => Some(Self::Timeout),
            "CANCELED" => Some(Self::Canceled),
            "BUILD FAILED" => Some(Self::BuildFailed),
            _ => None,
        }
    }

    /// Statuses which count as the test being healthy when computing the
    /// first-bad/last-good markers of nightly history.
    fn is_success_like(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Ignored | Self::Running | Self::Pending
        )
    }
}

macro_rules! sql_text_enum {
    ($name:ident) => {
        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                Self::from_str(value.as_str()?).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

sql_text_enum!(BuildStatus);
sql_text_enum!(TestStatus);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id    INTEGER PRIMARY KEY,
    branch    TEXT NOT NULL,
    sha       BLOB NOT NULL,
    title     TEXT NOT NULL,
    requester TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS builds (
    build_id     INTEGER PRIMARY KEY,
    run_id       INTEGER NOT NULL REFERENCES runs (run_id),
    status       TEXT NOT NULL DEFAULT 'PENDING',
    is_release   INTEGER NOT NULL,
    features     TEXT NOT NULL,
    low_priority INTEGER NOT NULL,
    builder_ip   INTEGER NOT NULL DEFAULT 0,
    started      TEXT,
    finished     TEXT,
    stdout       BLOB,
    stderr       BLOB,
    UNIQUE (run_id, is_release, features)
);

CREATE TABLE IF NOT EXISTS tests (
    test_id         INTEGER PRIMARY KEY,
    run_id          INTEGER NOT NULL REFERENCES runs (run_id),
    build_id        INTEGER NOT NULL REFERENCES builds (build_id),
    name            TEXT NOT NULL,
    category        TEXT NOT NULL,
    timeout         INTEGER NOT NULL,
    skip_build      INTEGER NOT NULL,
    branch          TEXT NOT NULL,
    is_nightly      INTEGER NOT NULL,
    status          TEXT NOT NULL DEFAULT 'PENDING',
    tries           INTEGER NOT NULL DEFAULT 0,
    select_after    INTEGER NOT NULL DEFAULT 0,
    worker_hostname TEXT,
    started         TEXT,
    finished        TEXT
);

CREATE INDEX IF NOT EXISTS tests_by_status ON tests (status);
CREATE INDEX IF NOT EXISTS tests_history ON tests (name, branch, test_id DESC);
CREATE INDEX IF NOT EXISTS builds_by_status ON builds (status);

CREATE TABLE IF NOT EXISTS logs (
    test_id     INTEGER NOT NULL REFERENCES tests (test_id),
    type        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    storage     TEXT,
    log         BLOB,
    stack_trace INTEGER NOT NULL DEFAULT 0,
    patterns    TEXT NOT NULL DEFAULT '',
    UNIQUE (test_id, type)
);

CREATE TABLE IF NOT EXISTS auth_cookies (
    timestamp INTEGER NOT NULL,
    cookie    INTEGER NOT NULL
);
"#;

/// Converts data into its BLOB form for storage.
///
/// Non-trivial buffers are gzip-compressed when that actually saves space.
/// Data which already starts with the gzip magic is compressed
/// unconditionally so that sniffing the first two bytes on read stays
/// unambiguous.
pub fn blob_from_data(data: &[u8]) -> Vec<u8> {
    let must_compress = data.starts_with(GZIP_MAGIC);
    if must_compress || data.len() > 18 {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .unwrap_or_default();
        if !compressed.is_empty() && (must_compress || compressed.len() < data.len()) {
            return compressed;
        }
    }
    data.to_vec()
}

/// Converts a BLOB read from the database back into a string, decompressing
/// if necessary and replacing invalid UTF-8.
pub fn str_from_blob(blob: &[u8]) -> String {
    if blob.starts_with(GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        if GzDecoder::new(blob).read_to_end(&mut decompressed).is_ok() {
            return String::from_utf8_lossy(&decompressed).into_owned();
        }
    }
    String::from_utf8_lossy(blob).into_owned()
}

/// A build claimed by a builder.
#[derive(Debug)]
pub struct BuildClaim {
    pub build_id: i64,
    pub sha: String,
    pub features: String,
    pub is_release: bool,
    /// Whether any test bound to this build has the expensive category, in
    /// which case the expensive targets need compiling too.
    pub expensive: bool,
}

/// A test claimed by a worker, joined with its build and run.
#[derive(Debug)]
pub struct TestClaim {
    pub test_id: i64,
    pub run_id: i64,
    pub build_id: i64,
    pub name: String,
    pub timeout: u32,
    pub skip_build: bool,
    pub category: Category,
    pub tries: u32,
    pub builder_ip: u32,
    pub sha: String,
}

/// One log ready for storage, produced by the worker's log collection.
#[derive(Debug)]
pub struct ShortLog {
    pub log_type: String,
    pub size: u64,
    pub data: Vec<u8>,
    pub storage: Option<String>,
    pub stack_trace: bool,
    pub patterns: String,
}

#[derive(Debug, Clone)]
pub struct NightlyRun {
    pub run_id: i64,
    pub sha: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u32,
    pub running: u32,
    pub passed: u32,
    pub ignored: u32,
    pub failed: u32,
    pub build_failed: u32,
    pub canceled: u32,
    pub timeout: u32,
}

impl StatusCounts {
    fn add(&mut self, status: TestStatus, count: u32) {
        match status {
            TestStatus::Pending => self.pending += count,
            TestStatus::Running => self.running += count,
            TestStatus::Passed => self.passed += count,
            TestStatus::Ignored => self.ignored += count,
            TestStatus::Failed => self.failed += count,
            TestStatus::Canceled => self.canceled += count,
            TestStatus::Timeout => self.timeout += count,
            TestStatus::BuildFailed => {
                // Build failures show up both under their own counter and in
                // the failure total the UI headlines.
                self.build_failed += count;
                self.failed += count;
            }
        }
    }
}

/// Pass/fail shape of a test's recent history: how many of the last runs
/// passed, failed hard, or ended in some other state.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct HistoryStats {
    pub passed: u32,
    pub other: u32,
    pub failed: u32,
}

#[derive(Debug, Serialize)]
pub struct BuildSummary {
    pub build_id: i64,
    pub status: BuildStatus,
    pub is_release: bool,
    pub features: String,
    pub tests: StatusCounts,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub branch: String,
    pub sha: String,
    pub title: String,
    pub requester: String,
    pub timestamp: DateTime<Utc>,
    pub builds: Vec<BuildSummary>,
}

#[derive(Debug, Serialize)]
pub struct LogMetadata {
    #[serde(rename = "type")]
    pub log_type: String,
    pub size: u64,
    pub storage: Option<String>,
    pub stack_trace: bool,
}

#[derive(Debug, Serialize)]
pub struct TestSummary {
    pub test_id: i64,
    pub status: TestStatus,
    pub name: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub logs: Vec<LogMetadata>,
    pub history: HistoryStats,
}

#[derive(Debug, Serialize)]
pub struct RunInfo {
    pub run_id: i64,
    pub branch: String,
    pub sha: String,
    pub title: String,
    pub requester: String,
    pub timestamp: DateTime<Utc>,
    pub tests: Vec<TestSummary>,
}

#[derive(Debug, Serialize)]
pub struct TestLog {
    #[serde(rename = "type")]
    pub log_type: String,
    pub size: u64,
    pub storage: Option<String>,
    pub stack_trace: bool,
    /// Inline contents, decoded; absent when only the blob store has it.
    pub log: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestInfo {
    pub test_id: i64,
    pub run_id: i64,
    pub build_id: i64,
    pub status: TestStatus,
    pub name: String,
    pub timeout: u32,
    pub skip_build: bool,
    pub branch: String,
    pub is_nightly: bool,
    pub tries: u32,
    pub worker_hostname: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub sha: String,
    pub title: String,
    pub requester: String,
    pub logs: Vec<TestLog>,
    pub history: HistoryStats,
    /// For failing nightly tests: the earliest sha of the current failure
    /// streak and the latest sha known to be healthy, when both are known.
    pub first_bad: Option<String>,
    pub last_good: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub build_id: i64,
    pub run_id: i64,
    pub status: BuildStatus,
    pub is_release: bool,
    pub features: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub branch: String,
    pub sha: String,
    pub title: String,
    pub requester: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub test_id: i64,
    pub status: TestStatus,
}

#[derive(Debug, Default, Serialize)]
pub struct SystemStats {
    pub builds_pending: u32,
    pub builds_building: u32,
    pub tests_pending: u32,
    pub tests_running: u32,
}

/// A raw log fetched for serving; `compressed` tells the caller whether the
/// bytes still carry the gzip framing.
#[derive(Debug)]
pub struct RawLog {
    pub data: Vec<u8>,
    pub ctime: Option<DateTime<Utc>>,
    pub compressed: bool,
}

/// Connection to the shared state store.
///
/// Every daemon opens its own connection; the only coordination between
/// processes is through the transactions here.  Claim operations run with
/// `BEGIN IMMEDIATE` so the write lock is taken up front and two daemons can
/// never claim the same row.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("couldn't open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // A claim transaction on another connection holds the write lock for
        // well under a second; waiting out longer contention beats failing.
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA).context("creating schema")?;
        Ok(Self { conn })
    }

    // ---- Admission -------------------------------------------------------

    /// Inserts a run, its deduplicated builds and all its tests in a single
    /// transaction and returns the new run id.
    pub fn schedule_run(
        &mut self,
        branch: &str,
        sha: &[u8],
        title: &str,
        requester: &str,
        tests: &[TestSpec],
    ) -> anyhow::Result<i64> {
        let is_nightly = requester == NIGHTLY_REQUESTER;
        let now = Utc::now();

        let mut groups: HashMap<(bool, &str), Vec<&TestSpec>> = HashMap::new();
        for test in tests {
            groups
                .entry((test.is_release, test.features.as_str()))
                .or_default()
                .push(test);
        }
        // Biggest groups first so that the builds unblocking the most tests
        // get the lowest build ids and hence are claimed first.
        let mut groups: Vec<_> = groups.into_iter().collect();
        groups.sort_by_key(|(key, tests)| {
            (std::cmp::Reverse(tests.len()), key.0, key.1.to_owned())
        });

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO runs (branch, sha, title, requester, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![branch, sha, title, requester, now],
        )?;
        let run_id = tx.last_insert_rowid();

        for ((is_release, features), group) in groups {
            // A group skips the build only if every test in it does; one test
            // needing a build forces the compile for the whole group.
            let skip_build = group.iter().all(|test| test.skip_build);
            let status = if skip_build {
                BuildStatus::Done
            } else {
                BuildStatus::Pending
            };
            tx.execute(
                "INSERT INTO builds (run_id, status, is_release, features, low_priority)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, status, is_release, features, is_nightly],
            )?;
            let build_id = tx.last_insert_rowid();
            for test in group {
                tx.execute(
                    "INSERT INTO tests (run_id, build_id, name, category, timeout,
                                        skip_build, branch, is_nightly)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        run_id,
                        build_id,
                        test.short_name(),
                        test.category.as_str(),
                        test.timeout,
                        test.skip_build,
                        branch,
                        is_nightly,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(run_id)
    }

    /// Cancels all pending work in a run.  Pending tests become CANCELED and
    /// pending builds BUILD DONE so workers stop waiting on them; anything
    /// already running is left alone.  Returns the number of affected rows.
    pub fn cancel_run(&mut self, run_id: i64) -> anyhow::Result<usize> {
        let now = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut affected = tx.execute(
            "UPDATE tests SET finished = ?1, status = 'CANCELED'
              WHERE status = 'PENDING' AND run_id = ?2",
            params![now, run_id],
        )?;
        affected += tx.execute(
            "UPDATE builds SET finished = ?1, status = 'BUILD DONE'
              WHERE status = 'PENDING' AND run_id = ?2",
            params![now, run_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    /// Puts all FAILED and TIMEOUT tests of a run back into the queue,
    /// wiping their logs and reviving the builds they need.
    pub fn retry_run(&mut self, run_id: i64) -> anyhow::Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(i64, i64, bool)> = tx
            .prepare(
                "SELECT test_id, build_id, skip_build FROM tests
                  WHERE status IN ('FAILED', 'TIMEOUT') AND run_id = ?1",
            )?
            .query_map([run_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        if rows.is_empty() {
            return Ok(0);
        }
        for (test_id, _, _) in &rows {
            tx.execute("DELETE FROM logs WHERE test_id = ?1", [test_id])?;
            tx.execute(
                "UPDATE tests SET started = NULL, finished = NULL,
                                  status = 'PENDING', tries = 0, select_after = 0
                  WHERE test_id = ?1",
                [test_id],
            )?;
        }
        // Builds which failed (or were cleaned off their builder) need to be
        // made again; builds still sitting on a builder can be reused as-is.
        for (_, build_id, skip_build) in &rows {
            if !skip_build {
                tx.execute(
                    "UPDATE builds SET started = NULL, finished = NULL,
                                       stdout = NULL, stderr = NULL, status = 'PENDING'
                      WHERE build_id = ?1
                        AND (status = 'BUILD FAILED' OR
                             (status = 'BUILD DONE' AND builder_ip = 0))",
                    [build_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Returns the most recent nightly run, if any.
    pub fn last_nightly_run(&self) -> anyhow::Result<Option<NightlyRun>> {
        self.conn
            .query_row(
                "SELECT run_id, sha, timestamp FROM runs
                  WHERE requester = ?1
                  ORDER BY timestamp DESC LIMIT 1",
                [NIGHTLY_REQUESTER],
                |row| {
                    Ok(NightlyRun {
                        run_id: row.get(0)?,
                        sha: hex::encode(row.get::<_, Vec<u8>>(1)?),
                        timestamp: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("querying last nightly run")
    }

    // ---- Builder ---------------------------------------------------------

    /// Returns any BUILDING rows owned by this builder to the queue.  Called
    /// on builder startup; whatever we were doing before the restart is gone.
    pub fn recover_builds(&mut self, builder_ip: u32) -> anyhow::Result<usize> {
        let count = self.conn.execute(
            "UPDATE builds SET started = NULL, status = 'PENDING', builder_ip = 0
              WHERE status = 'BUILDING' AND builder_ip = ?1",
            [builder_ip],
        )?;
        if count > 0 {
            info!("requeued {count} builds left over from before restart");
        }
        Ok(count)
    }

    /// Claims the most urgent pending build for this builder, or None.
    pub fn claim_build(&mut self, builder_ip: u32) -> anyhow::Result<Option<BuildClaim>> {
        let now = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let build_id: Option<i64> = tx
            .query_row(
                "SELECT build_id FROM builds WHERE status = 'PENDING'
                  ORDER BY low_priority, build_id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(build_id) = build_id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE builds SET started = ?1, finished = NULL,
                               status = 'BUILDING', builder_ip = ?2
              WHERE build_id = ?3",
            params![now, builder_ip, build_id],
        )?;
        let claim = tx.query_row(
            "SELECT r.sha, b.features, b.is_release,
                    EXISTS (SELECT 1 FROM tests t
                             WHERE t.build_id = b.build_id
                               AND t.category = 'expensive')
               FROM builds b JOIN runs r ON r.run_id = b.run_id
              WHERE b.build_id = ?1",
            [build_id],
            |row| {
                Ok(BuildClaim {
                    build_id,
                    sha: hex::encode(row.get::<_, Vec<u8>>(0)?),
                    features: row.get(1)?,
                    is_release: row.get(2)?,
                    expensive: row.get(3)?,
                })
            },
        )?;
        tx.commit()?;
        Ok(Some(claim))
    }

    /// Records the outcome of a build.  A failed build atomically cancels
    /// every dependent test which is still pending.
    pub fn report_build(
        &mut self,
        build_id: i64,
        success: bool,
        stdout: &[u8],
        stderr: &[u8],
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let status = if success {
            BuildStatus::Done
        } else {
            BuildStatus::Failed
        };
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE builds SET finished = ?1, status = ?2, stdout = ?3, stderr = ?4
              WHERE build_id = ?5",
            params![
                now,
                status,
                blob_from_data(stdout),
                blob_from_data(stderr),
                build_id
            ],
        )?;
        if !success {
            tx.execute(
                "UPDATE tests SET status = 'CANCELED', finished = ?1
                  WHERE build_id = ?2 AND status = 'PENDING'",
                params![now, build_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Builds assigned to this builder on which no test still depends; their
    /// artefact directories are safe to delete.
    pub fn builds_without_pending_tests(&self, builder_ip: u32) -> anyhow::Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.build_id FROM builds b
              WHERE b.builder_ip = ?1
                AND NOT EXISTS (SELECT 1 FROM tests t
                                 WHERE t.build_id = b.build_id
                                   AND t.status IN ('PENDING', 'RUNNING'))",
        )?;
        let ids = stmt
            .query_map([builder_ip], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Releases ownership of the given builds, typically after their
    /// artefacts have been garbage-collected.
    pub fn unassign_builds(&mut self, build_ids: &[i64]) -> anyhow::Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for build_id in build_ids {
            tx.execute(
                "UPDATE builds SET builder_ip = 0 WHERE build_id = ?1",
                [build_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- Worker ----------------------------------------------------------

    /// Returns any RUNNING rows owned by this worker to the queue, refunding
    /// the try which the interrupted claim consumed.
    pub fn recover_tests(&mut self, hostname: &str) -> anyhow::Result<usize> {
        let count = self.conn.execute(
            "UPDATE tests SET started = NULL, status = 'PENDING',
                              worker_hostname = NULL, tries = MAX(tries - 1, 0)
              WHERE status = 'RUNNING' AND worker_hostname = ?1",
            [hostname],
        )?;
        if count > 0 {
            info!("requeued {count} tests left over from before restart");
        }
        Ok(count)
    }

    /// Claims the most urgent runnable test for this worker, or None.
    ///
    /// A test is runnable once its cool-off has passed, it has tries left
    /// and either it skips the build or its build is done and still owned by
    /// a builder.  Mocknet workers prefer mocknet tests and fall back to the
    /// rest; other workers never touch mocknet tests.
    pub fn claim_test(
        &mut self,
        hostname: &str,
        mocknet: bool,
    ) -> anyhow::Result<Option<TestClaim>> {
        let now = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Anything which has burnt through all its tries while pending (e.g.
        // by being postponed over and over) is never going to run; fail it
        // so the run can settle.
        tx.execute(
            "UPDATE tests SET status = 'FAILED', finished = ?1
              WHERE status = 'PENDING' AND tries >= ?2",
            params![now, MAX_TRIES],
        )?;

        fn candidate(
            tx: &rusqlite::Transaction<'_>,
            now: &DateTime<Utc>,
            category_filter: &str,
        ) -> rusqlite::Result<Option<i64>> {
            tx.query_row(
                &format!(
                    "SELECT t.test_id FROM tests t
                       JOIN builds b ON b.build_id = t.build_id
                      WHERE t.status = 'PENDING'
                        AND t.select_after <= ?1
                        AND t.tries < ?2
                        AND (t.skip_build OR
                             (b.status = 'BUILD DONE' AND b.builder_ip != 0))
                        {category_filter}
                      ORDER BY b.low_priority, t.test_id LIMIT 1"
                ),
                params![now.timestamp(), MAX_TRIES],
                |row| row.get(0),
            )
            .optional()
        }

        let test_id = if mocknet {
            match candidate(&tx, &now, "AND t.category = 'mocknet'")? {
                Some(test_id) => Some(test_id),
                None => candidate(&tx, &now, "")?,
            }
        } else {
            candidate(&tx, &now, "AND t.category != 'mocknet'")?
        };
        let Some(test_id) = test_id else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE tests SET started = ?1, finished = NULL, status = 'RUNNING',
                              worker_hostname = ?2, tries = tries + 1
              WHERE test_id = ?3",
            params![now, hostname, test_id],
        )?;
        let claim = tx.query_row(
            "SELECT t.run_id, t.build_id, t.name, t.timeout, t.skip_build,
                    t.category, t.tries, b.builder_ip, r.sha
               FROM tests t
               JOIN builds b ON b.build_id = t.build_id
               JOIN runs r ON r.run_id = t.run_id
              WHERE t.test_id = ?1",
            [test_id],
            |row| {
                let category: String = row.get(5)?;
                Ok(TestClaim {
                    test_id,
                    run_id: row.get(0)?,
                    build_id: row.get(1)?,
                    name: row.get(2)?,
                    timeout: row.get(3)?,
                    skip_build: row.get(4)?,
                    category: Category::from_str(&category)
                        .ok_or(FromSqlError::InvalidType)
                        .map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(
                                5,
                                rusqlite::types::Type::Text,
                                Box::new(err),
                            )
                        })?,
                    tries: row.get(6)?,
                    builder_ip: row.get(7)?,
                    sha: hex::encode(row.get::<_, Vec<u8>>(8)?),
                })
            },
        )?;
        // On a retry the logs of the previous attempt would otherwise linger
        // and get mixed up with the new ones.
        if claim.tries > 1 {
            tx.execute("DELETE FROM logs WHERE test_id = ?1", [test_id])?;
        }
        tx.commit()?;
        Ok(Some(claim))
    }

    /// Cooperative re-queue requested by the test process (exit code 13):
    /// back to PENDING, claimable again after a three minute cool-off.  The
    /// consumed try is kept so a test cannot postpone itself forever.
    pub fn postpone_test(&mut self, test_id: i64) -> anyhow::Result<()> {
        let select_after = Utc::now().timestamp() + POSTPONE_DELAY_SECS;
        self.conn.execute(
            "UPDATE tests SET started = NULL, worker_hostname = NULL,
                              status = 'PENDING', select_after = ?1
              WHERE test_id = ?2",
            params![select_after, test_id],
        )?;
        Ok(())
    }

    /// Final status write for a test.
    pub fn update_test_status(&mut self, test_id: i64, status: TestStatus) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE tests SET finished = ?1, status = ?2 WHERE test_id = ?3",
            params![Utc::now(), status, test_id],
        )?;
        Ok(())
    }

    /// Upserts log rows for a test; a retry's logs replace its predecessor's.
    pub fn save_short_logs(&mut self, test_id: i64, logs: &[ShortLog]) -> anyhow::Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for log in logs {
            tx.execute(
                "INSERT INTO logs (test_id, type, size, log, storage, stack_trace, patterns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (test_id, type) DO UPDATE
                     SET size = excluded.size, log = excluded.log,
                         storage = excluded.storage,
                         stack_trace = excluded.stack_trace,
                         patterns = excluded.patterns",
                params![
                    test_id,
                    log.log_type,
                    log.size,
                    blob_from_data(&log.data),
                    log.storage,
                    log.stack_trace,
                    log.patterns,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- Read API --------------------------------------------------------

    /// The latest 100 runs with per-build test status counters.
    pub fn all_runs(&self) -> anyhow::Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self
            .conn
            .prepare(
                "SELECT run_id, branch, sha, title, requester, timestamp
                   FROM runs ORDER BY run_id DESC LIMIT 100",
            )?
            .query_map([], |row| {
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    branch: row.get(1)?,
                    sha: hex::encode(row.get::<_, Vec<u8>>(2)?),
                    title: row.get(3)?,
                    requester: row.get(4)?,
                    timestamp: row.get(5)?,
                    builds: Vec::new(),
                })
            })?
            .collect::<Result<_, _>>()?;
        let Some(min_id) = runs.last().map(|run| run.run_id) else {
            return Ok(runs);
        };

        let mut counts: HashMap<(i64, i64), StatusCounts> = HashMap::new();
        self.conn
            .prepare(
                "SELECT run_id, build_id, status, COUNT(*) FROM tests
                  WHERE run_id >= ?1 GROUP BY 1, 2, 3",
            )?
            .query_map([min_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, TestStatus>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .try_for_each(|item| -> rusqlite::Result<()> {
                let (run_id, build_id, status, count) = item?;
                counts.entry((run_id, build_id)).or_default().add(status, count);
                Ok(())
            })?;

        let mut builds: HashMap<i64, Vec<BuildSummary>> = HashMap::new();
        self.conn
            .prepare(
                "SELECT run_id, build_id, status, is_release, features
                   FROM builds WHERE run_id >= ?1 ORDER BY build_id",
            )?
            .query_map([min_id], |row| {
                Ok((row.get::<_, i64>(0)?, BuildSummary {
                    build_id: row.get(1)?,
                    status: row.get(2)?,
                    is_release: row.get(3)?,
                    features: row.get(4)?,
                    tests: StatusCounts::default(),
                }))
            })?
            .try_for_each(|item| -> rusqlite::Result<()> {
                let (run_id, mut build) = item?;
                build.tests = counts
                    .remove(&(run_id, build.build_id))
                    .unwrap_or_default();
                builds.entry(run_id).or_default().push(build);
                Ok(())
            })?;

        for run in &mut runs {
            run.builds = builds.remove(&run.run_id).unwrap_or_default();
        }
        Ok(runs)
    }

    /// One run with its tests and their log metadata and history.
    pub fn run_info(&self, run_id: i64) -> anyhow::Result<Option<RunInfo>> {
        let run = self
            .conn
            .query_row(
                "SELECT branch, sha, title, requester, timestamp
                   FROM runs WHERE run_id = ?1",
                [run_id],
                |row| {
                    Ok(RunInfo {
                        run_id,
                        branch: row.get(0)?,
                        sha: hex::encode(row.get::<_, Vec<u8>>(1)?),
                        title: row.get(2)?,
                        requester: row.get(3)?,
                        timestamp: row.get(4)?,
                        tests: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut run) = run else {
            return Ok(None);
        };

        run.tests = self
            .conn
            .prepare(
                "SELECT test_id, status, name, started, finished FROM tests
                  WHERE run_id = ?1 ORDER BY status, started",
            )?
            .query_map([run_id], |row| {
                Ok(TestSummary {
                    test_id: row.get(0)?,
                    status: row.get(1)?,
                    name: row.get(2)?,
                    started: row.get(3)?,
                    finished: row.get(4)?,
                    logs: Vec::new(),
                    history: HistoryStats::default(),
                })
            })?
            .collect::<Result<_, _>>()?;
        for test in &mut run.tests {
            test.logs = self.log_metadata(test.test_id)?;
            test.history = history_stats(&self.test_history(&test.name, &run.branch)?);
        }
        Ok(Some(run))
    }

    fn log_metadata(&self, test_id: i64) -> anyhow::Result<Vec<LogMetadata>> {
        let logs = self
            .conn
            .prepare(
                "SELECT type, size, storage, stack_trace FROM logs
                  WHERE test_id = ?1 ORDER BY type",
            )?
            .query_map([test_id], |row| {
                Ok(LogMetadata {
                    log_type: row.get(0)?,
                    size: row.get(1)?,
                    storage: row.get(2)?,
                    stack_trace: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(logs)
    }

    /// The last 30 outcomes of a test name on a branch, newest first.
    pub fn test_history(&self, name: &str, branch: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        let entries = self
            .conn
            .prepare(
                "SELECT test_id, status FROM tests
                  WHERE name = ?1 AND branch = ?2
                  ORDER BY test_id DESC LIMIT 30",
            )?
            .query_map(params![name, branch], |row| {
                Ok(HistoryEntry {
                    test_id: row.get(0)?,
                    status: row.get(1)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(entries)
    }

    /// History of a test (by id) on an arbitrary branch: the summarised
    /// stats plus the id of the newest run of the same test name on that
    /// branch (-1 when it never ran there).  Backs cross-branch comparison
    /// in the UI.
    pub fn history_for_branch(
        &self,
        test_id: i64,
        branch: &str,
    ) -> anyhow::Result<Option<(HistoryStats, i64)>> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM tests WHERE test_id = ?1",
                [test_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Ok(None);
        };
        let history = self.test_history(&name, branch)?;
        let newest = history.first().map_or(-1, |entry| entry.test_id);
        Ok(Some((history_stats(&history), newest)))
    }

    /// One test with its run, decoded logs, history and (for failing nightly
    /// tests) the first-bad/last-good commit markers.
    pub fn test_info(&self, test_id: i64) -> anyhow::Result<Option<TestInfo>> {
        let test = self
            .conn
            .query_row(
                "SELECT t.run_id, t.build_id, t.status, t.name, t.timeout,
                        t.skip_build, t.branch, t.is_nightly, t.tries,
                        t.worker_hostname, t.started, t.finished,
                        r.sha, r.title, r.requester
                   FROM tests t JOIN runs r ON r.run_id = t.run_id
                  WHERE t.test_id = ?1",
                [test_id],
                |row| {
                    Ok(TestInfo {
                        test_id,
                        run_id: row.get(0)?,
                        build_id: row.get(1)?,
                        status: row.get(2)?,
                        name: row.get(3)?,
                        timeout: row.get(4)?,
                        skip_build: row.get(5)?,
                        branch: row.get(6)?,
                        is_nightly: row.get(7)?,
                        tries: row.get(8)?,
                        worker_hostname: row.get(9)?,
                        started: row.get(10)?,
                        finished: row.get(11)?,
                        sha: hex::encode(row.get::<_, Vec<u8>>(12)?),
                        title: row.get(13)?,
                        requester: row.get(14)?,
                        logs: Vec::new(),
                        history: HistoryStats::default(),
                        first_bad: None,
                        last_good: None,
                    })
                },
            )
            .optional()?;
        let Some(mut test) = test else {
            return Ok(None);
        };

        test.logs = self
            .conn
            .prepare(
                "SELECT type, size, storage, stack_trace, log FROM logs
                  WHERE test_id = ?1 ORDER BY type",
            )?
            .query_map([test_id], |row| {
                let blob: Option<Vec<u8>> = row.get(4)?;
                Ok(TestLog {
                    log_type: row.get(0)?,
                    size: row.get(1)?,
                    storage: row.get(2)?,
                    stack_trace: row.get(3)?,
                    log: blob.as_deref().map(str_from_blob).filter(|log| !log.is_empty()),
                })
            })?
            .collect::<Result<_, _>>()?;
        test.history = history_stats(&self.test_history(&test.name, &test.branch)?);

        if test.is_nightly && !test.status.is_success_like() {
            let (first_bad, last_good) = self.failure_streak(&test)?;
            test.first_bad = first_bad;
            test.last_good = last_good;
        }
        Ok(Some(test))
    }

    /// Walks nightly history backwards from a failing test to find the sha
    /// which started the failure streak and the last healthy one before it.
    fn failure_streak(
        &self,
        test: &TestInfo,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        let mut stmt = self.conn.prepare(
            "SELECT r.sha, t.status
               FROM tests t JOIN runs r ON r.run_id = t.run_id
              WHERE t.branch = 'master' AND t.name = ?1 AND t.test_id < ?2
                AND t.status NOT IN ('RUNNING', 'PENDING') AND t.is_nightly
              ORDER BY t.test_id DESC LIMIT 30",
        )?;
        let mut first_bad = test.sha.clone();
        let mut last_good = None;
        let rows = stmt.query_map(params![test.name, test.test_id], |row| {
            Ok((
                hex::encode(row.get::<_, Vec<u8>>(0)?),
                row.get::<_, TestStatus>(1)?,
            ))
        })?;
        for row in rows {
            let (sha, status) = row?;
            if status.is_success_like() {
                last_good = Some(sha);
                break;
            }
            first_bad = sha;
        }
        match last_good {
            Some(last_good) => Ok((Some(first_bad), Some(last_good))),
            None => Ok((None, None)),
        }
    }

    /// One build with its run and decoded output.
    pub fn build_info(&self, build_id: i64) -> anyhow::Result<Option<BuildInfo>> {
        self.conn
            .query_row(
                "SELECT b.run_id, b.status, b.is_release, b.features,
                        b.started, b.finished, b.stdout, b.stderr,
                        r.branch, r.sha, r.title, r.requester
                   FROM builds b JOIN runs r ON r.run_id = b.run_id
                  WHERE b.build_id = ?1",
                [build_id],
                |row| {
                    let stdout: Option<Vec<u8>> = row.get(6)?;
                    let stderr: Option<Vec<u8>> = row.get(7)?;
                    Ok(BuildInfo {
                        build_id,
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        is_release: row.get(2)?,
                        features: row.get(3)?,
                        started: row.get(4)?,
                        finished: row.get(5)?,
                        branch: row.get(8)?,
                        sha: hex::encode(row.get::<_, Vec<u8>>(9)?),
                        title: row.get(10)?,
                        requester: row.get(11)?,
                        stdout: stdout.as_deref().map(str_from_blob).unwrap_or_default(),
                        stderr: stderr.as_deref().map(str_from_blob).unwrap_or_default(),
                    })
                },
            )
            .optional()
            .context("querying build info")
    }

    /// Fetches a test's log for serving.  With `gzip_ok` the stored framing
    /// is preserved; otherwise the blob is decompressed first.
    pub fn test_log(
        &self,
        test_id: i64,
        log_type: &str,
        gzip_ok: bool,
    ) -> anyhow::Result<Option<RawLog>> {
        let row = self
            .conn
            .query_row(
                "SELECT t.finished, l.log
                   FROM logs l JOIN tests t ON t.test_id = l.test_id
                  WHERE l.test_id = ?1 AND l.type = ?2",
                params![test_id, log_type],
                |row| {
                    Ok((
                        row.get::<_, Option<DateTime<Utc>>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(ctime, blob)| raw_log(blob.unwrap_or_default(), ctime, gzip_ok)))
    }

    /// Fetches a build's stdout or stderr for serving.
    pub fn build_log(
        &self,
        build_id: i64,
        log_type: &str,
        gzip_ok: bool,
    ) -> anyhow::Result<Option<RawLog>> {
        let column = match log_type {
            "stdout" => "stdout",
            "stderr" => "stderr",
            _ => anyhow::bail!("no such build log '{log_type}'"),
        };
        let row = self
            .conn
            .query_row(
                &format!("SELECT finished, {column} FROM builds WHERE build_id = ?1"),
                [build_id],
                |row| {
                    Ok((
                        row.get::<_, Option<DateTime<Utc>>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(ctime, blob)| raw_log(blob.unwrap_or_default(), ctime, gzip_ok)))
    }

    /// Counts of in-flight builds and tests.
    pub fn system_stats(&self) -> anyhow::Result<SystemStats> {
        let mut stats = SystemStats::default();
        self.conn
            .prepare(
                "SELECT status, COUNT(*) FROM builds
                  WHERE status IN ('PENDING', 'BUILDING') GROUP BY 1",
            )?
            .query_map([], |row| {
                Ok((row.get::<_, BuildStatus>(0)?, row.get::<_, u32>(1)?))
            })?
            .try_for_each(|item| -> rusqlite::Result<()> {
                match item? {
                    (BuildStatus::Pending, count) => stats.builds_pending = count,
                    (BuildStatus::Building, count) => stats.builds_building = count,
                    _ => (),
                }
                Ok(())
            })?;
        self.conn
            .prepare(
                "SELECT status, COUNT(*) FROM tests
                  WHERE status IN ('PENDING', 'RUNNING') GROUP BY 1",
            )?
            .query_map([], |row| {
                Ok((row.get::<_, TestStatus>(0)?, row.get::<_, u32>(1)?))
            })?
            .try_for_each(|item| -> rusqlite::Result<()> {
                match item? {
                    (TestStatus::Pending, count) => stats.tests_pending = count,
                    (TestStatus::Running, count) => stats.tests_running = count,
                    _ => (),
                }
                Ok(())
            })?;
        Ok(stats)
    }

    /// Raw connection escape hatch for tests which need to fiddle with rows
    /// (e.g. backdating timestamps) without growing the real API.
    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    // ---- Auth cookies ----------------------------------------------------

    /// Stores a single-use authentication cookie, garbage-collecting expired
    /// ones while at it.
    pub fn add_auth_cookie(&mut self, timestamp: i64, cookie: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "DELETE FROM auth_cookies WHERE timestamp < ?1",
            [timestamp - AUTH_COOKIE_TTL_SECS],
        )?;
        self.conn.execute(
            "INSERT INTO auth_cookies (timestamp, cookie) VALUES (?1, ?2)",
            params![timestamp, cookie],
        )?;
        Ok(())
    }

    /// Consumes an authentication cookie.  Returns whether it existed; a
    /// second call for the same cookie always returns false.
    pub fn verify_auth_cookie(&mut self, timestamp: i64, cookie: i64) -> anyhow::Result<bool> {
        let found = self.conn.execute(
            "DELETE FROM auth_cookies WHERE timestamp = ?1 AND cookie = ?2",
            params![timestamp, cookie],
        )? > 0;
        self.conn.execute(
            "DELETE FROM auth_cookies WHERE timestamp < ?1",
            [Utc::now().timestamp() - AUTH_COOKIE_TTL_SECS],
        )?;
        Ok(found)
    }
}

fn raw_log(blob: Vec<u8>, ctime: Option<DateTime<Utc>>, gzip_ok: bool) -> RawLog {
    let compressed = blob.starts_with(GZIP_MAGIC);
    if compressed && !gzip_ok {
        let mut decompressed = Vec::new();
        if GzDecoder::new(&blob[..]).read_to_end(&mut decompressed).is_ok() {
            return RawLog {
                data: decompressed,
                ctime,
                compressed: false,
            };
        }
    }
    RawLog {
        data: blob,
        ctime,
        compressed,
    }
}

/// Summarises history entries into passed/other/failed buckets.
pub fn history_stats(history: &[HistoryEntry]) -> HistoryStats {
    let mut stats = HistoryStats::default();
    for entry in history {
        match entry.status {
            TestStatus::Passed => stats.passed += 1,
            TestStatus::Failed | TestStatus::BuildFailed | TestStatus::Timeout => {
                stats.failed += 1
            }
            _ => stats.other += 1,
        }
    }
    stats
}
