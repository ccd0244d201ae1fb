use std::fs::{self, File};
use std::io::{self, BufRead as _, BufReader, Read as _, Seek as _, SeekFrom};
use std::path::{Path, PathBuf};

/// Marker rustc prints when a test binary panics with backtraces enabled.
pub const BACKTRACE_PATTERN: &str = "stack backtrace:";

/// Fixed strings worth flagging when they show up in a log.
pub const INTERESTING_PATTERNS: &[&str] = &[BACKTRACE_PATTERN, "LONG DELAY"];

/// Snippets keep this many bytes from each end of a big file.
const SNIPPET_HALF: u64 = 5 * 1024;

/// Files up to twice the half size are stored inline whole.
const SNIPPET_LIMIT: u64 = 2 * SNIPPET_HALF;

/// One file found in a test's output directory.
#[derive(Debug, PartialEq, Eq)]
pub struct OutputFile {
    /// The log type this file is stored under, e.g. `stderr` or `node0`.
    pub name: String,
    pub path: PathBuf,
}

/// Scans a test's output directory for logs worth keeping.
///
/// Top-level `stdout` and `stderr` are the test process' own streams.  Each
/// subdirectory is a node home of a test cluster; its `stderr` is stored
/// under the node's name and `remote.log` / `companion.log` files get a
/// suffix.  Node directory names carry a `_…` disambiguator which is not
/// part of the log type.
pub fn list_output_files(dir: &Path) -> io::Result<Vec<OutputFile>> {
    let mut files = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() {
            let node = name.split('_').next().unwrap_or(&name).to_owned();
            for (filename, log_name) in [
                ("remote.log", format!("{node}_remote")),
                ("companion.log", format!("{node}_companion")),
                ("stderr", node.clone()),
            ] {
                let file = path.join(filename);
                if file.is_file() {
                    files.push(OutputFile {
                        name: log_name,
                        path: file,
                    });
                }
            }
        } else if matches!(name.as_str(), "stdout" | "stderr") {
            files.push(OutputFile { name, path });
        }
    }
    Ok(files)
}

/// Searches a file for fixed patterns, line by line; returns the subset of
/// `patterns` which occurred.  Patterns must not span lines.
pub fn find_patterns(path: &Path, patterns: &[&'static str]) -> io::Result<Vec<&'static str>> {
    let mut found = vec![false; patterns.len()];
    let mut remaining = patterns.len();
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        // A log may well not be valid UTF-8 throughout; a lossy view is good
        // enough for substring search.
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
            Err(err) => return Err(err),
        };
        for (index, pattern) in patterns.iter().enumerate() {
            if !found[index] && line.contains(pattern) {
                found[index] = true;
                remaining -= 1;
            }
        }
        if remaining == 0 {
            break;
        }
    }
    Ok(patterns
        .iter()
        .zip(found)
        .filter_map(|(pattern, ok)| ok.then_some(*pattern))
        .collect())
}

/// Reads a file for inline storage.  Small files come back whole; larger
/// ones as a head + `\n...\n` + tail snippet, the full contents being the
/// blob store's job.
pub fn snippet(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size <= SNIPPET_LIMIT {
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;
        return Ok(data);
    }
    let mut data = vec![0; SNIPPET_HALF as usize];
    file.read_exact(&mut data)?;
    data.extend_from_slice(b"\n...\n");
    file.seek(SeekFrom::End(-(SNIPPET_HALF as i64)))?;
    file.read_to_end(&mut data)?;
    Ok(data)
}
