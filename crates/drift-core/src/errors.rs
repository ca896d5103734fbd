use std::path::PathBuf;

/// Result type for drift engine operations
pub type Result<T> = std::result::Result<T, DriftError>;

/// Errors raised by the drift engine.
///
/// The variants follow the engine's failure taxonomy: transient I/O,
/// format corruption, sequencing conflicts and chain corruption are kept
/// distinct so callers can decide between retrying, rejecting and asking an
/// operator for a re-baseline.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("change-set format corrupt at line {line}: {reason}")]
    Format { line: usize, reason: FormatIssue },

    #[error("cannot encode {0:?}: names must not contain spaces or line breaks")]
    UnencodablePath(String),

    #[error("sequencing error for {definition}: {kind}")]
    Sequencing {
        definition: String,
        kind: SequencingIssue,
    },

    #[error("chain corrupt for {definition} at version {version}: {reason}")]
    ChainCorruption {
        definition: String,
        version: u32,
        reason: String,
    },

    #[error("scan cancelled")]
    Cancelled,

    #[error("unknown definition: {0}")]
    UnknownDefinition(String),

    #[error("version {version} not found for {definition}")]
    VersionNotFound { definition: String, version: u32 },

    #[error("definition {0} already has change-sets and cannot change identity")]
    DefinitionConflict(String),

    #[error("content mismatch: expected {expected}, got {actual}")]
    ContentMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DriftError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(line: usize, reason: FormatIssue) -> Self {
        Self::Format { line, reason }
    }

    pub fn sequencing(definition: impl Into<String>, kind: SequencingIssue) -> Self {
        Self::Sequencing {
            definition: definition.into(),
            kind,
        }
    }

    /// Only transient I/O failures are worth retrying; everything else needs
    /// a different input or operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::Sequencing {
                kind: SequencingIssue::Duplicate { .. },
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatIssue {
    #[error("unexpected end of input")]
    Truncated,
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("unknown category code {0:?}")]
    UnknownCategory(String),
    #[error("unknown change code {0:?}")]
    UnknownChangeCode(String),
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("malformed line {0:?}")]
    MalformedLine(String),
    #[error("directory {directory} declares {declared} entries but has {actual}")]
    CountMismatch {
        directory: String,
        declared: usize,
        actual: usize,
    },
    #[error("entry {file} violates digest rules for {kind}")]
    InvalidEntry { file: String, kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequencingIssue {
    #[error("version {version} already applied")]
    Duplicate { version: u32 },
    #[error("expected version {expected}, got {actual}")]
    OutOfOrder { expected: u32, actual: u32 },
    #[error("version 0 must be a coverage change-set")]
    InitialNotCoverage,
    #[error("change-set belongs to {0}")]
    DefinitionMismatch(String),
    #[error("version {version} already holds a different change-set")]
    Conflict { version: u32 },
}
