use std::ffi::OsStr;
use std::process::Output;

use anyhow::{anyhow, bail, Context as _};
use log::debug;
use tokio::process::Command;

// Renders a command line for error messages.  Lossy is fine, this is only
// ever read by humans.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

pub trait OutputExt {
    // Exit code of the process, as long as it terminated normally; a process
    // killed by a signal is an error.
    fn code_not_killed(&self) -> anyhow::Result<i32>;

    // Errors out unless the process exited with status zero.  The error
    // message carries the process' stderr.
    fn ok(self) -> anyhow::Result<Output>;

    fn stdout_string(&self) -> String;
    fn stderr_string(&self) -> String;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process killed by signal ({:?})", self.status))
    }

    fn ok(self) -> anyhow::Result<Output> {
        if self.status.success() {
            Ok(self)
        } else {
            bail!(
                "exit status {:?}; stderr:\n{}",
                self.status.code(),
                self.stderr_string()
            )
        }
    }

    fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait CommandExt {
    // Runs the command to completion, capturing output.  The returned error
    // names the command; the exit status is not checked.
    async fn execute(&mut self) -> anyhow::Result<Output>;

    // Like execute but additionally fails on non-zero exit status.
    async fn execute_ok(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let desc = describe(self);
        debug!("running <{desc}>");
        self.output()
            .await
            .with_context(|| format!("running <{desc}>"))
    }

    async fn execute_ok(&mut self) -> anyhow::Result<Output> {
        let desc = describe(self);
        self.execute()
            .await?
            .ok()
            .with_context(|| format!("command <{desc}> failed"))
    }
}
