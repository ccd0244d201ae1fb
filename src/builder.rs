use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use log::{debug, error, info, warn};
use nix::sys::statvfs::statvfs;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::BuilderConfig;
use crate::db::{BuildClaim, Db};
use crate::process::describe;

/// How long to sleep when there is nothing to claim.
const IDLE_DELAY: Duration = Duration::from_secs(10);

/// How long to sleep between disk-space re-checks while blocked.
const DISK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Captured build output is bounded; when a stream overflows we keep the
/// tail, which is where the errors are.
const MAX_CAPTURE_BYTES: usize = 4 << 20;

/// Renders the integer encoding of a builder's IPv4 back into dotted form.
pub fn ip_to_string(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

/// The address workers will be told to fetch artefacts from: the IPv4 of
/// the interface which routes towards the outside world.
fn detect_ipv4() -> anyhow::Result<u32> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding probe socket")?;
    // Connecting a UDP socket sends no packets; it just makes the kernel
    // pick a source address for us.
    socket
        .connect("8.8.8.8:53")
        .context("routing probe socket")?;
    match socket.local_addr().context("reading probe address")?.ip() {
        IpAddr::V4(ip) => Ok(u32::from(ip)),
        IpAddr::V6(ip) => bail!("got IPv6 address {ip}; builders must be reachable over IPv4"),
    }
}

/// Accumulates the combined output of the commands making up one build, the
/// way a terminal would have seen it, bounded in memory.
struct Runner {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Runner {
    fn new() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Runs a command, capturing its output; returns whether it exited
    /// successfully.  Spawn failures count as command failures.
    async fn run(&mut self, command: &mut Command) -> bool {
        let line = format!("$ {}\n", describe(command));
        append_bounded(&mut self.stderr, line.as_bytes());
        debug!("{}", line.trim_end());
        match command.output().await {
            Ok(output) => {
                append_bounded(&mut self.stdout, &output.stdout);
                append_bounded(&mut self.stderr, &output.stderr);
                if !output.status.success() {
                    let line = format!("# exited with {:?}\n", output.status.code());
                    append_bounded(&mut self.stderr, line.as_bytes());
                }
                output.status.success()
            }
            Err(err) => {
                let line = format!("# couldn't run command: {err}\n");
                append_bounded(&mut self.stderr, line.as_bytes());
                false
            }
        }
    }

    fn note_error(&mut self, err: &anyhow::Error) {
        let line = format!("# {err:#}\n");
        append_bounded(&mut self.stderr, line.as_bytes());
    }
}

fn append_bounded(buffer: &mut Vec<u8>, data: &[u8]) {
    buffer.extend_from_slice(data);
    if buffer.len() > MAX_CAPTURE_BYTES {
        let excess = buffer.len() - MAX_CAPTURE_BYTES;
        buffer.drain(..excess);
    }
}

/// The build dispatcher daemon.
///
/// Claims pending builds one at a time, compiles the commit, publishes the
/// artefacts under `<workdir>/builds/<build_id>/` for workers to fetch and
/// reports the outcome.  Identified by the host's IPv4 as a 32-bit integer.
pub struct Builder {
    db: Db,
    config: BuilderConfig,
    ip: u32,
    repo_dir: PathBuf,
    builds_dir: PathBuf,
}

impl Builder {
    pub fn new(db: Db, config: BuilderConfig) -> anyhow::Result<Self> {
        let ip = match &config.ip {
            Some(ip) => u32::from(
                ip.parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid builder ip '{ip}'"))?,
            ),
            None => detect_ipv4()?,
        };
        std::fs::create_dir_all(&config.workdir)
            .with_context(|| format!("creating {}", config.workdir.display()))?;
        let repo_dir = config.workdir.join("nearcore");
        let builds_dir = config.workdir.join("builds");
        Ok(Self {
            db,
            config,
            ip,
            repo_dir,
            builds_dir,
        })
    }

    /// The daemon loop.  With `once` set, processes at most one build and
    /// returns; used by tests and for manual smoke runs.
    pub async fn run(&mut self, cancel: CancellationToken, once: bool) -> anyhow::Result<()> {
        info!("starting builder at {}", ip_to_string(self.ip));
        self.db.recover_builds(self.ip)?;
        while !cancel.is_cancelled() {
            self.wait_for_free_space(&cancel).await?;
            let claim = match self.db.claim_build(self.ip) {
                Ok(claim) => claim,
                Err(err) => {
                    error!("claiming build failed: {err:#}");
                    None
                }
            };
            match claim {
                Some(build) => {
                    self.handle_build(build).await;
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

    /// Blocks until the scratch volume has room for a build, deleting
    /// artefacts nothing depends on any more (and, if that is not enough,
    /// the shared cargo target directories).
    async fn wait_for_free_space(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        if self.enough_space()? || self.clean_finished_builds()? {
            return Ok(());
        }

        for target in ["target", "target_expensive"] {
            let dir = self.repo_dir.join(target);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("removing {}", dir.display()))?;
            }
        }
        if self.enough_space()? {
            return Ok(());
        }

        warn!("not enough free space; waiting for tests to finish to clean up more builds");
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = sleep(DISK_RETRY_DELAY) => (),
            }
            if self.clean_finished_builds()? {
                info!("got enough free space; continuing");
                return Ok(());
            }
        }
    }

    fn enough_space(&self) -> anyhow::Result<bool> {
        let stats = statvfs(&self.config.workdir)
            .with_context(|| format!("statvfs({})", self.config.workdir.display()))?;
        let free = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        Ok(free >= self.config.min_free_bytes)
    }

    /// Deletes artefact directories of builds whose tests are all done and
    /// releases those builds; returns whether space is now sufficient.
    fn clean_finished_builds(&mut self) -> anyhow::Result<bool> {
        let build_ids = self.db.builds_without_pending_tests(self.ip)?;
        if !build_ids.is_empty() {
            for build_id in &build_ids {
                let dir = self.builds_dir.join(build_id.to_string());
                if let Err(err) = std::fs::remove_dir_all(&dir) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!("couldn't remove {}: {err}", dir.display());
                    }
                }
            }
            self.db.unassign_builds(&build_ids)?;
            info!("garbage collected {} builds", build_ids.len());
        }
        self.enough_space()
    }

    async fn handle_build(&mut self, build: BuildClaim) {
        info!(
            "build #{}: sha={}{}{}{}",
            build.build_id,
            build.sha,
            if build.is_release { " --release" } else { "" },
            if build.features.is_empty() {
                String::new()
            } else {
                format!(" --features {}", build.features)
            },
            if build.expensive {
                " (inc. expensive)"
            } else {
                ""
            },
        );

        let mut runner = Runner::new();
        let mut success = false;
        match self.checkout(&build.sha, &mut runner).await {
            Ok(true) => match self.build_target(&build, &mut runner).await {
                Ok(ok) => success = ok,
                Err(err) => runner.note_error(&err),
            },
            Ok(false) => (),
            Err(err) => runner.note_error(&err),
        }

        info!(
            "build #{} {}",
            build.build_id,
            if success { "succeeded" } else { "failed" }
        );
        if let Err(err) =
            self.db
                .report_build(build.build_id, success, &runner.stdout, &runner.stderr)
        {
            error!("reporting build #{} failed: {err:#}", build.build_id);
        }
    }

    /// Makes sure the shared checkout sits at the requested commit.  Tries
    /// to update the existing clone first and falls back to cloning from
    /// scratch; returns false (with the git output captured) if the commit
    /// cannot be checked out at all.
    async fn checkout(&self, sha: &str, runner: &mut Runner) -> anyhow::Result<bool> {
        if self.repo_dir.is_dir() {
            // The target directories hold state from whatever commit was
            // built last; builds must start from a clean slate.
            for target in ["target", "target_expensive"] {
                let dir = self.repo_dir.join(target);
                if dir.exists() {
                    tokio::fs::remove_dir_all(&dir)
                        .await
                        .with_context(|| format!("removing {}", dir.display()))?;
                }
            }
            if runner
                .run(
                    Command::new("git")
                        .args(["remote", "update", "--prune"])
                        .current_dir(&self.repo_dir),
                )
                .await
                && runner
                    .run(
                        Command::new("git")
                            .args(["checkout", sha])
                            .current_dir(&self.repo_dir),
                    )
                    .await
            {
                return Ok(true);
            }
        }

        if self.repo_dir.exists() {
            tokio::fs::remove_dir_all(&self.repo_dir)
                .await
                .with_context(|| format!("removing {}", self.repo_dir.display()))?;
        }
        tokio::fs::create_dir_all(&self.config.workdir)
            .await
            .context("creating workdir")?;
        let cloned = runner
            .run(
                Command::new("git")
                    .arg("clone")
                    .arg(&self.config.repo_url)
                    .arg("nearcore")
                    .current_dir(&self.config.workdir),
            )
            .await;
        Ok(cloned
            && runner
                .run(
                    Command::new("git")
                        .args(["checkout", sha])
                        .current_dir(&self.repo_dir),
                )
                .await)
    }

    /// Compiles the commit and hard-links the artefacts into the build's
    /// output directory.  Returns whether the compile succeeded; I/O
    /// trouble while publishing is an error instead.
    async fn build_target(
        &self,
        build: &BuildClaim,
        runner: &mut Runner,
    ) -> anyhow::Result<bool> {
        let build_type = if build.is_release { "release" } else { "debug" };
        let out_dir = self.builds_dir.join(build.build_id.to_string());
        if out_dir.exists() {
            tokio::fs::remove_dir_all(&out_dir)
                .await
                .with_context(|| format!("removing {}", out_dir.display()))?;
        }

        // The adversarial feature is always on; it is what the pytest
        // framework drives the nodes with.
        let mut neard_features = String::from("adversarial");
        if !build.features.is_empty() {
            neard_features.push(',');
            neard_features.push_str(&build.features);
        }
        let mut cmd = Command::new(&self.config.cargo);
        cmd.args(["build", "-pneard", "--bin", "neard", "--features"])
            .arg(&neard_features);
        if build.is_release {
            cmd.arg("--release");
        }
        if !runner.run(cmd.current_dir(&self.repo_dir)).await {
            return Ok(false);
        }

        let mut cmd = Command::new(&self.config.cargo);
        cmd.args([
            "build",
            "-pgenesis-populate",
            "-prestaked",
            "-pnear-test-contracts",
        ]);
        if build.is_release {
            cmd.arg("--release");
        }
        if !runner.run(cmd.current_dir(&self.repo_dir)).await {
            return Ok(false);
        }

        link_files(
            &self.repo_dir.join("target").join(build_type),
            &out_dir.join("target"),
            &mut ["neard", "genesis-populate", "restaked"]
                .into_iter()
                .map(PathBuf::from),
        )?;
        let contracts_dir = self.repo_dir.join("runtime/near-test-contracts/res");
        link_files(
            &contracts_dir,
            &out_dir.join("near-test-contracts"),
            &mut list_dir(&contracts_dir)?
                .into_iter()
                .filter(|name| name.extension().map_or(false, |ext| ext == "wasm")),
        )?;

        if !build.expensive {
            return Ok(true);
        }

        // Leftover test executables from an earlier commit would get mixed
        // up with the fresh ones; drop them but keep the directory so the
        // incremental build state survives.
        let deps_dir = self
            .repo_dir
            .join("target_expensive")
            .join(build_type)
            .join("deps");
        if deps_dir.is_dir() {
            for name in list_dir(&deps_dir)? {
                let path = deps_dir.join(&name);
                if is_test_executable(&path) {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("removing {}", path.display()))?;
                }
            }
        }

        let mut expensive_features = String::from("expensive_tests");
        if !build.features.is_empty() {
            expensive_features.push(',');
            expensive_features.push_str(&build.features);
        }
        let mut cmd = Command::new(&self.config.cargo);
        cmd.args(["build", "--tests", "--target-dir", "target_expensive", "--features"])
            .arg(&expensive_features);
        if build.is_release {
            cmd.arg("--release");
        }
        if !runner.run(cmd.current_dir(&self.repo_dir)).await {
            return Ok(false);
        }

        link_files(
            &deps_dir,
            &out_dir.join("expensive"),
            &mut list_dir(&deps_dir)?
                .into_iter()
                .filter(|name| is_test_executable(&deps_dir.join(name))),
        )?;
        Ok(true)
    }
}

fn list_dir(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut names = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?
    {
        names.push(PathBuf::from(entry?.file_name()));
    }
    Ok(names)
}

/// Hard-links files into the published build directory.  Hard links cost no
/// space, and the builds directory lives on the same volume as the target
/// directories by construction.
fn link_files(
    src_dir: &Path,
    dst_dir: &Path,
    files: &mut dyn Iterator<Item = PathBuf>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst_dir)
        .with_context(|| format!("creating {}", dst_dir.display()))?;
    for name in files {
        let src = src_dir.join(&name);
        let dst = dst_dir.join(&name);
        std::fs::hard_link(&src, &dst)
            .with_context(|| format!("linking {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// Whether the path looks like a compiled test executable: a regular file,
/// executable, with no dot in its stem (which weeds out `.d` files and
/// friends while keeping `name-<hash>` binaries).
fn is_test_executable(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt as _;
    if path
        .file_stem()
        .map_or(true, |stem| stem.to_string_lossy().contains('.'))
    {
        return false;
    }
    match path.metadata() {
        Ok(metadata) => metadata.is_file() && metadata.mode() & 0o100 != 0,
        Err(_) => false,
    }
}
