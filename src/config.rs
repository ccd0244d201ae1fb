use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Default configuration directory, `~/.nayduck`.
pub fn default_dir() -> anyhow::Result<PathBuf> {
    let dirs = directories::BaseDirs::new().context("couldn't determine home directory")?;
    Ok(dirs.home_dir().join(".nayduck"))
}

/// Loads `<dir>/<service>.json` into the service's config struct.
///
/// Each service keeps its own file so that credentials can be provisioned
/// per host; a worker host never sees the auth key, the API host never sees
/// builder credentials, and so on.
pub fn load<T: DeserializeOwned>(dir: &Path, service: &str) -> anyhow::Result<T> {
    let path = dir.join(format!("{service}.json"));
    let content =
        fs::read_to_string(&path).with_context(|| format!("couldn't read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("couldn't parse {}", path.display()))?;
    Ok(value)
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file shared by all daemons.
    pub path: PathBuf,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct BuilderConfig {
    /// Scratch volume the builder owns; the repository checkout and
    /// published artefacts all live under it.
    pub workdir: PathBuf,
    /// Upstream repository to build, e.g. `https://github.com/near/nearcore`.
    pub repo_url: String,
    /// IPv4 the workers will scp from.  Defaults to the address of the
    /// default route's interface.
    pub ip: Option<String>,
    /// Program to invoke in place of `cargo`.  Exists for tests.
    #[serde(default = "default_cargo")]
    pub cargo: String,
    /// Free-space low-water mark on the workdir volume.  Builds are not
    /// claimed below it; chosen so that even the worst build (under 15 GB)
    /// fits comfortably.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

fn default_cargo() -> String {
    "cargo".to_owned()
}

fn default_min_free_bytes() -> u64 {
    50_000_000_000
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Scratch volume the worker owns.
    pub workdir: PathBuf,
    /// Upstream repository to check out tests from.
    pub repo_url: String,
    /// Whether this host is reserved for mocknet tests.  Mocknet-capable
    /// workers prefer mocknet tests; other workers never claim them.
    #[serde(default)]
    pub mocknet: bool,
    /// Remote user for the artefact scp.
    #[serde(default = "default_scp_user")]
    pub scp_user: String,
    /// Where builder hosts keep their published builds; all builders are
    /// deployed with the same workdir layout.
    #[serde(default = "default_remote_builds_dir")]
    pub remote_builds_dir: String,
    /// Program to invoke in place of `python`.  Exists for tests.
    #[serde(default = "default_python")]
    pub python: String,
}

fn default_scp_user() -> String {
    "nayduck".to_owned()
}

fn default_remote_builds_dir() -> String {
    "/datadrive/builds".to_owned()
}

fn default_python() -> String {
    "python".to_owned()
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Upstream repository the nightly runs against.
    pub repo_url: String,
    /// Where the scheduler keeps its bare clone of the repository.
    pub repo_dir: PathBuf,
    /// Base URL of the UI; reported in the success response of an admission.
    pub ui_url: String,
    /// Branch the nightly follows.
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "master".to_owned()
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// URL-safe base64 of the 32-byte ChaCha20-Poly1305 key used to seal
    /// authentication tokens.
    pub key: String,
    #[serde(rename = "github-client-id")]
    pub github_client_id: String,
    #[serde(rename = "github-client-secret")]
    pub github_client_secret: String,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct BlobStoreConfig {
    /// Which storage backend to use.  `fs` is the only one built in.
    pub service: String,
    /// For `fs`: directory the blobs are copied into.
    pub root: Option<PathBuf>,
    /// For `fs`: URL prefix under which `root` is served.
    pub base_url: Option<String>,
}

impl BlobStoreConfig {
    pub fn require_root(&self) -> anyhow::Result<&Path> {
        match &self.root {
            Some(root) => Ok(root),
            None => bail!("blob-store config is missing \"root\""),
        }
    }

    pub fn require_base_url(&self) -> anyhow::Result<&str> {
        match &self.base_url {
            Some(url) => Ok(url),
            None => bail!("blob-store config is missing \"base_url\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, service: &str, content: &str) {
        fs::write(dir.join(format!("{service}.json")), content).unwrap();
    }

    #[test]
    fn should_load_database_config() {
        let dir = tempfile::TempDir::new().unwrap();
        write_config(dir.path(), "database", r#"{"path": "/var/lib/nayduck.db"}"#);
        let config: DatabaseConfig = load(dir.path(), "database").unwrap();
        assert_eq!(Path::new("/var/lib/nayduck.db"), config.path);
    }

    #[test]
    fn should_apply_worker_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        write_config(
            dir.path(),
            "worker",
            r#"{"workdir": "/datadrive", "repo_url": "https://example.com/repo"}"#,
        );
        let config: WorkerConfig = load(dir.path(), "worker").unwrap();
        assert!(!config.mocknet);
        assert_eq!("python", config.python);
    }

    #[test]
    fn should_reject_unknown_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        write_config(dir.path(), "database", r#"{"path": "x", "bogus": 1}"#);
        assert!(load::<DatabaseConfig>(dir.path(), "database").is_err());
    }

    #[test]
    fn should_name_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load::<DatabaseConfig>(dir.path(), "database").unwrap_err();
        assert!(format!("{err:#}").contains("database.json"));
    }
}
