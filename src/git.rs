use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context as _};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use tokio::process::Command;

use crate::process::{CommandExt as _, OutputExt as _};

// We shell out to the git CLI rather than binding a library.  The CLI is
// git's only properly supported interface and it is what the rest of the
// pipeline (builders, workers) uses anyway.

/// Longest commit title we store; anything longer is shortened.
const MAX_TITLE_LEN: usize = 150;

/// Manifest listing the nightly tests, relative to the repository root.
pub const NIGHTLY_MANIFEST: &str = "nightly/nightly.txt";

const MAX_INCLUDE_DEPTH: usize = 16;

/// A commit resolved to its canonical sha and (shortened) title.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub title: String,
}

/// A bare local clone of the upstream repository, kept fresh on demand.
pub struct Repo {
    url: String,
    dir: PathBuf,
}

impl Repo {
    pub fn new(url: String, dir: PathBuf) -> Self {
        Self { url, dir }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir);
        cmd
    }

    /// Brings the local clone up to date with the upstream, creating it if
    /// necessary.  If updating an existing clone fails the clone is wiped
    /// and recreated from scratch, as if it had never been there.
    pub async fn update(&self) -> anyhow::Result<()> {
        if self.dir.is_dir() {
            match self.git().args(["remote", "update"]).execute_ok().await {
                Ok(_) => return Ok(()),
                Err(err) => warn!("updating {:?} failed, recloning: {err:#}", self.dir),
            }
        }
        if self.dir.exists() {
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .with_context(|| format!("removing stale clone {:?}", self.dir))?;
        }

        Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg(&self.dir)
            .execute_ok()
            .await
            .context("initialising bare repository")?;
        // Not `clone --mirror`: we don't want refs/remotes/origin/* (which
        // come from GitHub's internal remotes) nor refs/pull/*, just plain
        // heads, notes and tags.
        let config = format!(
            "[remote \"origin\"]\n\
             \turl = {}\n\
             \tfetch = +refs/heads/*:refs/heads/*\n\
             \tfetch = +refs/notes/*:refs/notes/*\n\
             \tfetch = +refs/tags/*:refs/tags/*\n\
             \ttagOpt = --no-tags\n\
             \tprune = true\n",
            self.url
        );
        let mut existing = tokio::fs::read_to_string(self.dir.join("config"))
            .await
            .unwrap_or_default();
        existing.push_str(&config);
        tokio::fs::write(self.dir.join("config"), existing)
            .await
            .context("writing remote configuration")?;
        self.git()
            .args(["remote", "update"])
            .execute_ok()
            .await
            .context("fetching origin")?;
        info!("cloned {} into {:?}", self.url, self.dir);
        Ok(())
    }

    /// Resolves a commit reference to its canonical sha and title.
    pub async fn for_commit(&self, commit_ref: &str) -> anyhow::Result<CommitInfo> {
        let output = self
            .git()
            .args(["log", "--format=%H\n%s", "-n1", commit_ref, "--"])
            .execute_ok()
            .await
            .with_context(|| format!("resolving commit '{commit_ref}'"))?;
        let stdout = output.stdout_string();
        let mut lines = stdout.lines();
        let sha = lines
            .next()
            .ok_or_else(|| anyhow!("no such commit '{commit_ref}'"))?;
        let title = lines.next().unwrap_or_default();
        Ok(CommitInfo {
            sha: sha.to_owned(),
            title: shorten_title(title),
        })
    }

    /// Reads a file at a given commit without checking anything out.
    pub async fn read_file(&self, sha: &str, path: &Path) -> anyhow::Result<String> {
        let output = self
            .git()
            .arg("show")
            .arg(format!("{sha}:{}", path.display()))
            .execute_ok()
            .await
            .with_context(|| format!("reading {} at {sha}", path.display()))?;
        Ok(output.stdout_string())
    }

    /// Reads the nightly test manifest at a commit, resolving includes.
    ///
    /// A line of the form `./<path>.txt` includes another manifest file,
    /// relative to the including file.  Includes which escape the repository
    /// or do not name a `.txt` file are skipped with a warning; everything
    /// else is returned verbatim for the admission parser to deal with.
    pub async fn read_manifest_tests(&self, sha: &str) -> anyhow::Result<Vec<String>> {
        self.read_manifest_file(sha, PathBuf::from(NIGHTLY_MANIFEST), 0)
            .await
    }

    fn read_manifest_file<'a>(
        &'a self,
        sha: &'a str,
        path: PathBuf,
        depth: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        async move {
            if depth > MAX_INCLUDE_DEPTH {
                bail!("manifest includes nested deeper than {MAX_INCLUDE_DEPTH}");
            }
            let Some(path) = normalize_manifest_path(&path) else {
                warn!("refusing to load tests from {path:?}");
                return Ok(Vec::new());
            };
            let content = self.read_file(sha, &path).await?;
            let mut lines = Vec::new();
            for line in content.lines() {
                if let Some(include) = line.trim().strip_prefix("./") {
                    let target = match path.parent() {
                        Some(parent) => parent.join(include),
                        None => PathBuf::from(include),
                    };
                    lines.extend(self.read_manifest_file(sha, target, depth + 1).await?);
                } else {
                    lines.push(line.to_owned());
                }
            }
            Ok(lines)
        }
        .boxed()
    }
}

/// Normalises a manifest path; None means the path is not acceptable
/// (escapes the repository root or is not a `.txt` file).
fn normalize_manifest_path(path: &Path) -> Option<PathBuf> {
    if path.extension().map_or(true, |ext| ext != "txt") {
        return None;
    }
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => (),
            // Popping past the repository root or any absolute weirdness is
            // out of the question.
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

/// Shortens a commit title to at most 150 characters, keeping a trailing
/// `(#NNN)` pull request marker if there is one.
fn shorten_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_LEN {
        return title.to_owned();
    }
    lazy_static! {
        static ref PR_SUFFIX: Regex = Regex::new(r"\s*(\(#\d+\))\s*$").unwrap();
    }
    let (title, suffix) = match PR_SUFFIX.captures(title) {
        Some(captures) => (
            &title[..captures.get(0).unwrap().start()],
            format!("… {}", &captures[1]),
        ),
        None => (title, "…".to_owned()),
    };
    let keep = MAX_TITLE_LEN - suffix.chars().count();
    let mut shortened: String = title.chars().take(keep).collect();
    shortened.push_str(&suffix);
    shortened
}
