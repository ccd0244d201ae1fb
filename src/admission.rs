use std::fmt;

use log::error;
use serde_json::json;

use crate::db::Db;
use crate::git::{CommitInfo, Repo};
use crate::testspec::TestSpec;

/// Most tests a single request may expand to, counting multipliers.
pub const TEST_COUNT_LIMIT: usize = 1024;

/// A rejected run request.  The message is the single human-readable
/// sentence the caller gets back; anything more detailed goes to the log.
#[derive(Debug, PartialEq, Eq)]
pub struct Failure(pub String);

impl Failure {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The `{code: 1, response: …}` object of the run/new protocol.
    pub fn to_response(&self) -> serde_json::Value {
        json!({"code": 1, "response": self.0})
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Failure {}

/// The `{code: 0, response: …}` object of the run/new protocol.
pub fn success_response(ui_url: &str, run_id: i64) -> serde_json::Value {
    json!({"code": 0, "response": format!("Success. {ui_url}/#/run/{run_id}")})
}

/// A validated run request, ready to be scheduled.
#[derive(Debug)]
pub struct Request {
    pub branch: String,
    pub sha: String,
    pub requester: String,
    pub tests: Vec<TestSpec>,
}

impl Request {
    /// Validates a dynamically-shaped JSON request.
    ///
    /// The value comes straight from the network so nothing about its shape
    /// can be assumed; every field is checked explicitly and any problem is
    /// reported as a Failure rather than a panic or a silent coercion.
    pub fn from_value(value: &serde_json::Value, requester: &str) -> Result<Self, Failure> {
        let object = value
            .as_object()
            .ok_or_else(|| Failure::new("Invalid request object: not an object"))?;
        let branch = object
            .get("branch")
            .ok_or_else(|| Failure::new("Invalid request object: missing branch or sha field"))?;
        let sha = object
            .get("sha")
            .ok_or_else(|| Failure::new("Invalid request object: missing branch or sha field"))?;
        let tests = object.get("tests").filter(|tests| match tests {
            serde_json::Value::Array(tests) => !tests.is_empty(),
            _ => true,
        });
        let tests = tests.ok_or_else(|| Failure::new("No tests specified"))?;

        let (Some(branch), Some(sha), Some(tests)) =
            (branch.as_str(), sha.as_str(), tests.as_array())
        else {
            return Err(Failure::new(
                "Invalid request object: one of the fields has wrong type",
            ));
        };
        if branch.is_empty() || sha.is_empty() {
            return Err(Failure::new(
                "Invalid request object: missing branch or sha field",
            ));
        }

        let mut lines = Vec::with_capacity(tests.len());
        for test in tests {
            let line = test.as_str().ok_or_else(|| {
                Failure::new(format!("Invalid test: {test}; expected string"))
            })?;
            lines.push(line);
        }

        Ok(Self {
            branch: branch.to_owned(),
            sha: sha.to_owned(),
            requester: requester.to_owned(),
            tests: parse_test_lines(lines)?,
        })
    }

    /// Schedules the request, resolving the commit first unless the caller
    /// (i.e. the nightly scheduler) already has it.  Returns the run id.
    pub async fn schedule(
        &self,
        db: &mut Db,
        repo: &Repo,
        commit: Option<CommitInfo>,
    ) -> Result<i64, Failure> {
        let commit = match commit {
            Some(commit) => commit,
            None => {
                repo.update().await.map_err(internal_error)?;
                repo.for_commit(&self.sha)
                    .await
                    .map_err(|err| Failure::new(format!("Failed to fetch commit: {err}")))?
            }
        };
        let sha = hex::decode(&commit.sha)
            .map_err(|_| Failure::new(format!("Invalid commit sha: {}", commit.sha)))?;
        db.schedule_run(
            &self.branch,
            &sha,
            &commit.title,
            &self.requester,
            &self.tests,
        )
        .map_err(internal_error)
    }
}

fn internal_error(err: anyhow::Error) -> Failure {
    // The gory details are for the server log, not for the response.
    error!("scheduling failed: {err:#}");
    Failure::new("Internal error while scheduling the run")
}

/// Parses test lines into specs, expanding count prefixes.
///
/// Blank lines and lines whose first non-space character is `#` are
/// dropped.  At least one and at most [`TEST_COUNT_LIMIT`] tests must come
/// out of the expansion.
pub fn parse_test_lines<'a>(
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<TestSpec>, Failure> {
    let mut result = Vec::new();
    for line in lines {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (count, test) =
            TestSpec::parse_with_count(line).map_err(|err| Failure::new(err.to_string()))?;
        if count + result.len() > TEST_COUNT_LIMIT {
            return Err(Failure::new(format!(
                "Invalid request object: too many tests; max {TEST_COUNT_LIMIT} allowed"
            )));
        }
        result.extend(std::iter::repeat_with(|| test.clone()).take(count));
    }
    if result.is_empty() {
        return Err(Failure::new("Invalid request object: no tests specified"));
    }
    Ok(result)
}
