use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum BlastError {
    ToolNotFound {
        executable: String,
    },
    Launch {
        executable: String,
        args: Vec<String>,
        message: String,
    },
    InvalidInvocation {
        executable: String,
        message: String,
    },
    StreamSetup {
        executable: String,
        message: String,
        stderr: String,
    },
    Decode {
        executable: String,
        message: String,
        stderr: String,
    },
    Cancelled {
        executable: String,
        stderr: String,
    },
    /// A saved XML report could be read but not decoded.
    XmlFile {
        path: String,
        message: String,
    },
    Io {
        message: String,
    },
}

impl BlastError {
    /// Standard error text the tool produced before the failure, if any.
    pub fn stderr(&self) -> &str {
        match self {
            Self::StreamSetup { stderr, .. }
            | Self::Decode { stderr, .. }
            | Self::Cancelled { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// The process never started.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::ToolNotFound { .. } | Self::Launch { .. })
    }

    /// The XML report was malformed, whether it came from a process or a file.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::XmlFile { .. })
    }

    fn description(&self) -> String {
        match self {
            Self::ToolNotFound { executable } => format!(
                "Could not find BLAST executable '{executable}'. Install BLAST+ or name it in the BLASTPIPE_*_BIN variable"
            ),
            Self::Launch {
                executable,
                args,
                message,
            } => format!(
                "Could not run BLAST executable '{}' with args [{}]: {}",
                executable,
                args.join(" "),
                message
            ),
            Self::InvalidInvocation {
                executable,
                message,
            } => format!("Invalid invocation of '{executable}': {message}"),
            Self::StreamSetup {
                executable,
                message,
                ..
            } => format!("Could not attach to the streams of '{executable}': {message}"),
            Self::Decode {
                executable,
                message,
                ..
            } => format!("Could not decode XML output of '{executable}': {message}"),
            Self::Cancelled { executable, .. } => format!("Search with '{executable}' was cancelled"),
            Self::XmlFile { path, message } => {
                format!("Could not decode XML file '{path}': {message}")
            }
            Self::Io { message } => message.clone(),
        }
    }
}

impl fmt::Display for BlastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stderr = self.stderr().trim();
        if stderr.is_empty() {
            write!(f, "{}", self.description())
        } else {
            write!(f, "{}\n\nstderr: {}", self.description(), stderr)
        }
    }
}

impl Error for BlastError {}

impl From<std::io::Error> for BlastError {
    fn from(err: std::io::Error) -> Self {
        BlastError::Io {
            message: err.to_string(),
        }
    }
}
