use std::fmt;
use std::path::PathBuf;

/// Custom configuration errors
#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String, String),
    UnknownKey(String),
    UnknownSection(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(key, value) => {
                write!(f, "Invalid value '{}' for key '{}'", value, key)
            }
            ConfigError::UnknownKey(key) => write!(f, "Unknown configuration key: '{}'", key),
            ConfigError::UnknownSection(section) => write!(f, "Unknown section: '{}'", section),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server-wide error type
#[derive(Debug)]
pub enum OutpostError {
    /// I/O related errors (network, file operations, etc.)
    Io(std::io::Error),

    /// TELNET protocol violation from the peer
    Protocol(String),

    /// Input rejected by the login or questionnaire machinery
    InputValidation(String),

    /// User-facing command failure
    ShellCommand(String),

    /// Restriction gate refused the command
    Permission(String),

    /// Command definition file could not be parsed
    CommandParse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    /// Two command files define the same name or synonym
    CommandNameConflict {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// Configuration error
    Configuration(String),

    /// Client disconnected unexpectedly
    ClientDisconnected,

    /// Anything that should not happen
    Internal(String),
}

impl fmt::Display for OutpostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutpostError::Io(err) => write!(f, "I/O error: {}", err),
            OutpostError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            OutpostError::InputValidation(msg) => write!(f, "Invalid input: {}", msg),
            OutpostError::ShellCommand(msg) => write!(f, "{}", msg),
            OutpostError::Permission(msg) => write!(f, "Permission denied: {}", msg),
            OutpostError::CommandParse {
                file,
                line,
                message,
            } => write!(f, "{}:{}: {}", file.display(), line, message),
            OutpostError::CommandNameConflict {
                name,
                first,
                second,
            } => write!(
                f,
                "Command '{}' defined in both {} and {}",
                name,
                first.display(),
                second.display()
            ),
            OutpostError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OutpostError::ClientDisconnected => write!(f, "Client disconnected"),
            OutpostError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for OutpostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutpostError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OutpostError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => OutpostError::ClientDisconnected,
            _ => OutpostError::Io(err),
        }
    }
}

impl From<ConfigError> for OutpostError {
    fn from(err: ConfigError) -> Self {
        OutpostError::Configuration(err.to_string())
    }
}

/// Result type alias for server operations
pub type OutpostResult<T> = Result<T, OutpostError>;
