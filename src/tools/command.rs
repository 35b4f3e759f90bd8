//! External programs as per-unit tools.
//!
//! The artifact is written to the program's stdin and its stdout becomes the
//! new artifact. Exit status decides the error tag:
//!
//! - exit 0 with output: success
//! - exit 0 without output, or an exit code listed in
//!   `recoverable_exit_codes`: recoverable ("no result")
//! - anything else (spawn failure, other exit code, killed by signal): fatal

use super::{Tool, ToolParams};
use crate::error::ToolError;
use crate::unit::{Payload, Unit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// How to launch an external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,

    /// Fixed arguments; stage params are appended as `--key value`
    #[serde(default)]
    pub args: Vec<String>,

    /// Exit codes the tool uses to report "no solution"
    #[serde(default)]
    pub recoverable_exit_codes: Vec<i32>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A [`Tool`] that runs an external program.
pub struct CommandTool {
    name: String,
    spec: CommandSpec,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    fn command(&self, unit: &Unit, params: &ToolParams) -> Command {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args);
        for (key, value) in params {
            cmd.arg(format!("--{}", key)).arg(value);
        }
        cmd.envs(&self.spec.env)
            .env("SG_PARENT", unit.parent_key().as_str())
            .env(
                "SG_SUB",
                unit.sub_key().map(|s| s.to_string()).unwrap_or_default(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Last line of stderr, for error reasons.
fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, unit: &Unit, params: &ToolParams) -> Result<Payload, ToolError> {
        let mut child = self.command(unit, params).spawn().map_err(|e| {
            ToolError::fatal(format!("failed to spawn '{}': {}", self.spec.program, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::fatal("child stdin unavailable"))?;
        let input = unit.payload().bytes().clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolError::fatal(format!("'{}' I/O error: {}", self.name, e)))?;

        match writer.await {
            Ok(Ok(())) => {}
            // Tools may exit without consuming all of stdin
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => {
                return Err(ToolError::fatal(format!("writing input to '{}': {}", self.name, e)))
            }
            Err(e) => return Err(ToolError::fatal(format!("stdin writer panicked: {}", e))),
        }

        let tail = stderr_tail(&output.stderr);
        match output.status.code() {
            Some(0) if output.stdout.is_empty() => Err(ToolError::recoverable(format!(
                "'{}' produced no output",
                self.name
            ))),
            Some(0) => Ok(Payload::from(output.stdout)),
            Some(code) if self.spec.recoverable_exit_codes.contains(&code) => Err(
                ToolError::recoverable(format!("'{}' exited {}: {}", self.name, code, tail)),
            ),
            Some(code) => Err(ToolError::fatal(format!(
                "'{}' exited {}: {}",
                self.name, code, tail
            ))),
            None => Err(ToolError::fatal(format!(
                "'{}' terminated by signal",
                self.name
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::unit::{Attributes, SubKey};

    fn sh(script: &str, recoverable: Vec<i32>) -> CommandTool {
        CommandTool::new(
            "sh",
            CommandSpec {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                recoverable_exit_codes: recoverable,
                env: BTreeMap::new(),
            },
        )
    }

    fn unit(data: &'static str) -> Unit {
        let parent = Unit::parent("A", Payload::from("raw"), Attributes::new());
        Unit::child(&parent, SubKey::Cluster(3), Payload::from(data), Attributes::new())
    }

    #[tokio::test]
    async fn test_stdout_becomes_artifact() {
        let tool = sh("tr a-z A-Z", vec![]);
        let out = tool.invoke(&unit("acgt\n"), &ToolParams::new()).await.unwrap();
        assert_eq!(out.bytes().as_ref(), b"ACGT\n");
    }

    #[tokio::test]
    async fn test_identity_env() {
        let tool = sh("cat >/dev/null; echo \"$SG_PARENT:$SG_SUB\"", vec![]);
        let out = tool.invoke(&unit("x"), &ToolParams::new()).await.unwrap();
        assert_eq!(out.bytes().as_ref(), b"A:3\n");
    }

    #[tokio::test]
    async fn test_exit_code_tagging() {
        let tool = sh("cat >/dev/null; echo 'too few reads' >&2; exit 3", vec![3]);
        let err = tool.invoke(&unit("x"), &ToolParams::new()).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.reason().contains("too few reads"));

        let tool = sh("cat >/dev/null; exit 2", vec![3]);
        let err = tool.invoke(&unit("x"), &ToolParams::new()).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_empty_output_is_recoverable() {
        let tool = sh("cat >/dev/null", vec![]);
        let err = tool.invoke(&unit("x"), &ToolParams::new()).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let tool = CommandTool::new(
            "missing",
            CommandSpec {
                program: "/nonexistent/tool".into(),
                args: vec![],
                recoverable_exit_codes: vec![],
                env: BTreeMap::new(),
            },
        );
        let err = tool.invoke(&unit("x"), &ToolParams::new()).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_stderr_tail() {
        assert_eq!(stderr_tail(b"first\nlast line\n\n"), "last line");
        assert_eq!(stderr_tail(b""), "");
    }
}
