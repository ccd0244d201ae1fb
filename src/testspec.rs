use std::collections::BTreeSet;
use std::fmt;

use anyhow::{anyhow, bail};
use itertools::Itertools as _;
use lazy_static::lazy_static;
use regex::Regex;

pub const DEFAULT_TIMEOUT: u32 = 180;

// Extra wall-clock we grant tests which run against remote machines; spinning
// the machines up and down is not counted against the test's own budget.
const REMOTE_EXTRA_TIMEOUT: u32 = 15 * 60;

lazy_static! {
    static ref VALID_FEATURE: Regex = Regex::new(r"^[a-zA-Z0-9_][-a-zA-Z0-9_]*$").unwrap();
    static ref PYTEST_NAME: Regex = Regex::new(r"^[-_a-zA-Z0-9/]+\.py$").unwrap();
    static ref EXPENSIVE_NAME: Regex = Regex::new(r"^[-_a-zA-Z0-9]+$").unwrap();
    static ref COUNT_PREFIX: Regex = Regex::new(r"^\s*(\d+)\s+(.+)$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Pytest,
    Mocknet,
    Expensive,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pytest => "pytest",
            Self::Mocknet => "mocknet",
            Self::Expensive => "expensive",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "pytest" => Some(Self::Pytest),
            "mocknet" => Some(Self::Mocknet),
            "expensive" => Some(Self::Expensive),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single test to be run, parsed from a line such as
/// `pytest --timeout=7m sanity/rpc.py --features foo`.
///
/// The parsed form is normalised: features are sorted and deduplicated and
/// the timeout is rendered with the largest exact unit, so semantically
/// equivalent inputs produce identical [`full_name`](TestSpec::full_name)s.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TestSpec {
    pub category: Category,
    /// Timeout in seconds, excluding any provision for remote tests.
    pub timeout: u32,
    pub is_release: bool,
    pub is_remote: bool,
    pub skip_build: bool,
    /// Arguments past the category and category flags, excluding features.
    pub args: Vec<String>,
    /// Normalised comma-separated feature list; possibly empty.
    pub features: String,
}

/// Parses a timeout like `420`, `7m` or `2h` into seconds.
fn parse_timeout(arg: &str) -> anyhow::Result<u32> {
    let (digits, multiplier) = match arg.as_bytes().last() {
        Some(b'h') => (&arg[..arg.len() - 1], 3600),
        Some(b'm') => (&arg[..arg.len() - 1], 60),
        Some(b's') => (&arg[..arg.len() - 1], 1),
        _ => (arg, 1),
    };
    digits
        .parse::<u32>()
        .map(|value| value * multiplier)
        .map_err(|_| anyhow!("invalid timeout argument '{arg}'"))
}

/// Formats a timeout with the largest suffix which divides it exactly.
fn format_timeout(timeout: u32) -> String {
    if timeout % 3600 == 0 {
        format!("{}h", timeout / 3600)
    } else if timeout % 60 == 0 {
        format!("{}m", timeout / 60)
    } else {
        timeout.to_string()
    }
}

struct CategorySpec {
    category: Category,
    timeout: u32,
    is_release: bool,
    is_remote: bool,
    skip_build: bool,
}

/// Consumes the category word and category flags from the front of `words`.
fn extract_category(words: &mut Vec<String>) -> anyhow::Result<CategorySpec> {
    let mut timeout = DEFAULT_TIMEOUT;
    let mut is_release = false;
    let mut is_remote = false;
    let mut skip_build = false;

    let mut category = None;
    let mut args_start = None;
    for (index, word) in words.iter().enumerate() {
        if index == 0 {
            category = Some(word.clone());
        } else if word == "--release" {
            is_release = true;
        } else if word == "--remote" {
            is_remote = true;
        } else if word == "--skip-build" {
            skip_build = true;
        } else if let Some(arg) = word.strip_prefix("--timeout=") {
            timeout = parse_timeout(arg)?;
        } else if word.starts_with("--") {
            bail!("invalid argument '{word}'");
        } else {
            args_start = Some(index);
            break;
        }
    }

    // No word ever broke out of the loop, i.e. the spec consists of nothing
    // but the category and its flags.
    let args_start = args_start.ok_or_else(|| anyhow!("missing test argument"))?;
    let category = category.ok_or_else(|| anyhow!("empty specification"))?;
    let category =
        Category::from_str(&category).ok_or_else(|| anyhow!("invalid category '{category}'"))?;
    words.drain(..args_start);

    Ok(CategorySpec {
        category,
        timeout,
        is_release,
        is_remote,
        // mocknet tests run binaries from released builds on remote machines
        // so there is never anything to compile for them.
        skip_build: skip_build || category == Category::Mocknet,
    })
}

/// Consumes any `--features` arguments from the tail of `words` and returns
/// the normalised feature list.
fn extract_features(words: &mut Vec<String>) -> anyhow::Result<String> {
    let mut start = None;
    let mut want_features = false;
    let mut features = BTreeSet::new();
    for (index, word) in words.iter().enumerate() {
        if want_features {
            features.extend(word.split(',').map(str::to_owned));
            want_features = false;
        } else if let Some(list) = word.strip_prefix("--features=") {
            start.get_or_insert(index);
            features.extend(list.split(',').map(str::to_owned));
        } else if word == "--features" {
            start.get_or_insert(index);
            want_features = true;
        }
    }

    let Some(start) = start else {
        return Ok(String::new());
    };

    // These features are always enabled in the builds we make so drop them
    // from the set the user chose.  Keeping them would only fragment builds
    // which are in fact identical.
    for implicit in ["adversarial", "test_features", "rosetta_rpc"] {
        features.remove(implicit);
    }

    if want_features {
        bail!("missing features after --features argument");
    }
    for feature in &features {
        if !VALID_FEATURE.is_match(feature) {
            bail!("invalid feature '{feature}'");
        }
    }

    words.truncate(start);
    Ok(features.iter().join(","))
}

/// Verifies that the positional arguments look sane for the category.
///
/// Features are validated strictly because they end up more or less verbatim
/// on cargo command lines; for the test arguments we only check the name-like
/// argument since the rest is passed to the test itself.
fn check_args(category: Category, args: &[String]) -> anyhow::Result<()> {
    let (pattern, name): (&Regex, &str) = match category {
        Category::Expensive => {
            if args.len() != 3 {
                bail!(
                    "expensive test category requires three arguments: \
                     <package> <test-executable> <test-name>"
                );
            }
            (&EXPENSIVE_NAME, &args[1])
        }
        Category::Pytest | Category::Mocknet => (
            &PYTEST_NAME,
            args.first().map(String::as_str).unwrap_or_default(),
        ),
    };
    if !pattern.is_match(name) {
        bail!("invalid test name '{name}'");
    }
    Ok(())
}

impl TestSpec {
    /// Parses a test line.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        Self::parse_impl(line).map_err(|err| anyhow!("{err} in test '{line}'"))
    }

    fn parse_impl(line: &str) -> anyhow::Result<Self> {
        let mut words: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
        let category_spec = extract_category(&mut words)?;
        let features = extract_features(&mut words)?;
        check_args(category_spec.category, &words)?;
        Ok(Self {
            category: category_spec.category,
            timeout: category_spec.timeout,
            is_release: category_spec.is_release,
            is_remote: category_spec.is_remote,
            skip_build: category_spec.skip_build,
            args: words,
            features,
        })
    }

    /// Parses a test line with an optional multiplier prefix, e.g.
    /// `3 pytest sanity/rpc.py` parses to a count of 3.
    pub fn parse_with_count(line: &str) -> anyhow::Result<(usize, Self)> {
        if let Some(captures) = COUNT_PREFIX.captures(line) {
            let count = captures[1]
                .parse()
                .map_err(|_| anyhow!("invalid count in test '{line}'"))?;
            Ok((count, Self::parse(&captures[2])?))
        } else {
            Ok((1, Self::parse(line)?))
        }
    }

    /// Reconstructs a spec from columns stored in the tests table.
    ///
    /// The row's name is a short name so carries no timeout; the timeout
    /// column is authoritative as long as it holds a sane (≥ one minute)
    /// value.  Same story for skip_build which the short name omits.
    pub fn from_row(name: &str, timeout: u32, skip_build: bool) -> anyhow::Result<Self> {
        let mut spec = Self::parse(name)?;
        if timeout >= 60 {
            spec.timeout = timeout;
        }
        spec.skip_build = skip_build;
        Ok(spec)
    }

    /// Name without the `--timeout` and `--skip-build` flags.  This is what
    /// the tests table stores and what history lookups key on.
    pub fn short_name(&self) -> String {
        self.name(false)
    }

    /// Normalised full name; `parse(spec.full_name())` round-trips.
    pub fn full_name(&self) -> String {
        self.name(true)
    }

    fn name(&self, full: bool) -> String {
        let mut result = vec![self.category.as_str().to_owned()];
        if full {
            if self.skip_build {
                result.push("--skip-build".to_owned());
            }
            result.push(format!("--timeout={}", format_timeout(self.timeout)));
        }
        if self.is_release {
            result.push("--release".to_owned());
        }
        if self.is_remote {
            result.push("--remote".to_owned());
        }
        result.extend(self.args.iter().cloned());
        if !self.features.is_empty() {
            result.push(format!("--features {}", self.features));
        }
        result.join(" ")
    }

    /// Timeout the worker actually enforces, including the remote provision.
    pub fn full_timeout(&self) -> u32 {
        self.timeout + REMOTE_EXTRA_TIMEOUT * u32::from(self.is_remote)
    }

    /// Which cargo profile directory the test's binaries live in.
    pub fn build_dir(&self) -> &'static str {
        if self.is_release {
            "release"
        } else {
            "debug"
        }
    }
}

impl fmt::Display for TestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn parse_result(line: &str) -> String {
        match TestSpec::parse(line) {
            Ok(spec) => format!("{:>4} {}", spec.full_timeout(), spec),
            // Strip the " in test '…'" suffix so the expectations below stay
            // readable.
            Err(err) => {
                let msg = err.to_string();
                let msg = msg.split(" in test '").next().unwrap();
                format!("Err: {msg}")
            }
        }
    }

    const INVALID_EXPENSIVE: &str = "Err: expensive test category requires three arguments: \
                                     <package> <test-executable> <test-name>";

    #[test_case("pytest sanity/test.py",
                " 180 pytest --timeout=3m sanity/test.py"; "plain")]
    #[test_case("pytest sanity/state_sync_routed.py manytx 115",
                " 180 pytest --timeout=3m sanity/state_sync_routed.py manytx 115"; "extra args")]
    #[test_case("pytest --timeout=180 sanity/test.py",
                " 180 pytest --timeout=3m sanity/test.py"; "default timeout spelled out")]
    #[test_case("pytest --timeout=420 sanity/test.py",
                " 420 pytest --timeout=7m sanity/test.py"; "timeout")]
    #[test_case("pytest --release sanity/test.py",
                " 180 pytest --timeout=3m --release sanity/test.py"; "release")]
    #[test_case("pytest --remote sanity/test.py",
                "1080 pytest --timeout=3m --remote sanity/test.py"; "remote")]
    #[test_case("pytest --skip-build sanity/test.py",
                " 180 pytest --skip-build --timeout=3m sanity/test.py"; "skip build")]
    #[test_case("pytest --timeout=420 --release --remote sanity/test.py",
                "1320 pytest --timeout=7m --release --remote sanity/test.py"; "all flags")]
    #[test_case("pytest --timeout=420 --release --remote --skip-build s/test.py",
                "1320 pytest --skip-build --timeout=7m --release --remote s/test.py"; "all flags and skip build")]
    #[test_case("pytest sanity/test.py --features foo,bar --features=baz",
                " 180 pytest --timeout=3m sanity/test.py --features bar,baz,foo"; "features are sorted")]
    #[test_case("pytest sanity/test.py --features foo,adversarial --features=foo",
                " 180 pytest --timeout=3m sanity/test.py --features foo"; "implicit features dropped")]
    #[test_case("pytest --timeout 420 sanity/test.py",
                "Err: invalid argument '--timeout'"; "space separated timeout")]
    #[test_case("pytest --invalid-flag sanity/test.py",
                "Err: invalid argument '--invalid-flag'"; "unknown flag")]
    #[test_case("pytest", "Err: missing test argument"; "no args")]
    #[test_case("pytest sanity/test.py --features=`rm-rf`",
                "Err: invalid feature '`rm-rf`'"; "shell in features")]
    #[test_case("pytest /bin/destroy-the-world.py",
                " 180 pytest --timeout=3m /bin/destroy-the-world.py"; "absolute path allowed")]
    #[test_case("pytest ../../bin/destroy-the-world.py",
                "Err: invalid test name '../../bin/destroy-the-world.py'"; "dotdot path rejected")]
    #[test_case("mocknet mocknet/sanity.py",
                " 180 mocknet --skip-build --timeout=3m mocknet/sanity.py"; "mocknet implies skip build")]
    #[test_case("mocknet --skip-build mocknet/sanity.py",
                " 180 mocknet --skip-build --timeout=3m mocknet/sanity.py"; "mocknet explicit skip build")]
    #[test_case("expensive nearcore test_tps test::test_highload",
                " 180 expensive --timeout=3m nearcore test_tps test::test_highload"; "expensive")]
    #[test_case("expensive nearcore test_tps test::test_highload --features=foo",
                " 180 expensive --timeout=3m nearcore test_tps test::test_highload --features foo"; "expensive with features")]
    #[test_case("expensive nearcore /bin/destroy test::test_highload",
                "Err: invalid test name '/bin/destroy'"; "expensive bad executable")]
    #[test_case("expensive nearcore test_tps", INVALID_EXPENSIVE; "expensive two args")]
    #[test_case("expensive nearcore", INVALID_EXPENSIVE; "expensive one arg")]
    #[test_case("expensive nearcore test_tps test::test_highload bogus",
                INVALID_EXPENSIVE; "expensive four args")]
    #[test_case("invalid-category sanity/test.py",
                "Err: invalid category 'invalid-category'"; "bad category")]
    fn should_parse(line: &str, want: &str) {
        assert_eq!(want, parse_result(line));
    }

    #[test_case("pytest sanity/test.py", Ok((1, "pytest sanity/test.py")); "no count")]
    #[test_case("1 pytest sanity/test.py", Ok((1, "pytest sanity/test.py")); "count one")]
    #[test_case("0 pytest sanity/test.py", Ok((0, "pytest sanity/test.py")); "count zero")]
    #[test_case(" 5  pytest sanity/test.py", Ok((5, "pytest sanity/test.py")); "count with spaces")]
    #[test_case("-1 pytest sanity/test.py", Err("invalid category '-1'"); "negative count")]
    fn should_parse_with_count(line: &str, want: Result<(usize, &str), &str>) {
        match (TestSpec::parse_with_count(line), want) {
            (Ok((count, spec)), Ok((want_count, want_name))) => {
                assert_eq!((want_count, want_name.to_owned()), (count, spec.short_name()));
            }
            (Err(err), Err(want_msg)) => {
                let msg = err.to_string();
                assert_eq!(want_msg, msg.split(" in test '").next().unwrap());
            }
            (got, want) => panic!("got {got:?} want {want:?}"),
        }
    }

    #[test_case(0, false, "pytest --timeout=3m dir/test.py"; "zero timeout ignored")]
    #[test_case(180, false, "pytest --timeout=3m dir/test.py"; "default timeout")]
    #[test_case(180, true, "pytest --skip-build --timeout=3m dir/test.py"; "skip build honoured")]
    #[test_case(7200, false, "pytest --timeout=2h dir/test.py"; "timeout honoured")]
    fn should_reconstruct_from_row(timeout: u32, skip_build: bool, want: &str) {
        let spec = TestSpec::from_row("pytest dir/test.py", timeout, skip_build).unwrap();
        assert_eq!(want, spec.full_name());
    }

    #[test_case("2h", 7200)]
    #[test_case("120m", 7200)]
    #[test_case("7200", 7200)]
    #[test_case("7200s", 7200)]
    fn should_parse_timeout(arg: &str, want: u32) {
        assert_eq!(want, parse_timeout(arg).unwrap());
    }

    #[test]
    fn should_reject_bad_timeouts() {
        for arg in ["", "h", "12x", "-1", "two"] {
            assert!(parse_timeout(arg).is_err(), "{arg:?} parsed");
        }
    }

    #[test]
    fn should_round_trip_names() {
        for line in [
            "pytest sanity/test.py",
            "pytest --timeout=420 --release --remote --skip-build s/test.py",
            "mocknet mocknet/sanity.py",
            "expensive --timeout=2h nearcore test_tps test::test_highload --features foo",
        ] {
            let spec = TestSpec::parse(line).unwrap();
            assert_eq!(spec, TestSpec::parse(&spec.full_name()).unwrap());
            let short = TestSpec::parse(&spec.short_name()).unwrap();
            assert_eq!(spec.short_name(), short.short_name());
        }
    }

    #[test]
    fn should_normalise_features_order() {
        let a = TestSpec::parse("pytest x.py --features=a,b --features b").unwrap();
        let b = TestSpec::parse("pytest x.py --features b,a").unwrap();
        assert_eq!(a, b);
    }
}
