use std::io;
use std::time::Duration;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub privileged: bool,
}

impl CommandRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            privileged: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rendered(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub program: String,
    pub args: Vec<String>,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// The tool's own words: stderr when it wrote any, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        partial_output: String,
    },
    #[error("{program} exited with status {status}: {diagnostic}")]
    Failed {
        program: String,
        status: i32,
        diagnostic: String,
        stdout: String,
        stderr: String,
    },
    #[error("{program} returned output that could not be read: {detail}")]
    Malformed { program: String, detail: String },
    #[error("{program} requires macOS")]
    Unsupported { program: String },
}

impl CommandError {
    pub fn failed(output: CommandOutput) -> Self {
        CommandError::Failed {
            diagnostic: output.diagnostic(),
            program: output.program,
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Verbatim diagnostic suitable for surfacing to the operator.
    pub fn diagnostic(&self) -> String {
        match self {
            CommandError::Failed { diagnostic, .. } => diagnostic.clone(),
            CommandError::TimedOut { partial_output, .. } if !partial_output.trim().is_empty() => {
                format!("{self}; last output: {}", partial_output.trim())
            }
            other => other.to_string(),
        }
    }
}
