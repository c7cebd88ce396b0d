//! Error types for the ringhist metrics history engine.

use thiserror::Error;

/// The main error type for all ringhist operations.
///
/// Each variant wraps the error enum of one concern. Use [`HistoryError::code`]
/// to map any error onto the coarse codes reported at the admin boundary.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Error looking up, creating or deleting a series.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error applying a sample (write path).
    #[error("sample error: {0}")]
    Sample(#[from] SampleError),

    /// Error validating a series definition.
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Error encoding or decoding persisted series state.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error talking to the persistence backend.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Error during a collection cycle.
    #[error("collect error: {0}")]
    Collect(#[from] CollectError),

    /// Error validating an admin request.
    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl HistoryError {
    /// Maps this error onto the code reported at the admin boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(StoreError::NotFound { .. }) => ErrorCode::NotFound,
            Self::Request(_) | Self::Definition(_) | Self::Sample(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Internal,
        }
    }

    /// Returns `true` if this error means the named series does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }

    /// Returns `true` if this is a benign create-if-absent race.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Store(StoreError::AlreadyExists { .. }))
    }

    /// Returns `true` if this error is a stale-sample rejection.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Sample(SampleError::Stale { .. }))
    }
}

/// Coarse error codes reported to the admin layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown series name.
    NotFound,
    /// Unknown action, unknown format or otherwise malformed request.
    BadRequest,
    /// Backend or adapter failure; the caller may retry.
    Internal,
}

/// Errors that can occur when looking up, creating or deleting a series.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No series with this name exists.
    #[error("series '{name}' doesn't exist")]
    NotFound {
        /// The requested series name.
        name: String,
    },

    /// A series with this name already exists.
    #[error("series '{name}' already exists")]
    AlreadyExists {
        /// The conflicting series name.
        name: String,
    },

    /// Create-if-absent kept racing with another writer and gave up.
    #[error("series '{name}' could not be opened or created after {attempts} attempts")]
    CreateContended {
        /// The series name.
        name: String,
        /// How many open/create rounds were tried.
        attempts: u32,
    },
}

/// Errors that can occur when applying a sample.
#[derive(Error, Debug)]
pub enum SampleError {
    /// The sample is not newer than the last update of the series.
    #[error("stale sample at {timestamp}: last update was {last_update}")]
    Stale {
        /// The rejected timestamp.
        timestamp: u64,
        /// The series' last update time.
        last_update: u64,
    },

    /// The timestamp cannot be represented by the engine.
    #[error("invalid timestamp {timestamp}")]
    InvalidTimestamp {
        /// The invalid timestamp.
        timestamp: u64,
    },
}

/// Errors that can occur when validating a series definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// The base step is zero.
    #[error("step must be greater than zero")]
    ZeroStep,

    /// No datasources were configured.
    #[error("at least one datasource must be configured")]
    NoDatasources,

    /// No archives were configured.
    #[error("at least one archive must be configured")]
    NoArchives,

    /// A datasource name is empty or too long.
    #[error("invalid datasource name '{name}': {reason}")]
    InvalidDatasourceName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two datasources share a name.
    #[error("duplicate datasource '{name}'")]
    DuplicateDatasource {
        /// The duplicated name.
        name: String,
    },

    /// A datasource heartbeat is zero.
    #[error("datasource '{name}' must have a heartbeat greater than zero")]
    ZeroHeartbeat {
        /// The datasource name.
        name: String,
    },

    /// A datasource has `min > max`.
    #[error("datasource '{name}' has min {min} greater than max {max}")]
    InvalidBounds {
        /// The datasource name.
        name: String,
        /// Configured minimum.
        min: f64,
        /// Configured maximum.
        max: f64,
    },

    /// An archive definition is invalid.
    #[error("invalid archive {index}: {reason}")]
    InvalidArchive {
        /// Position of the archive in the definition.
        index: usize,
        /// Why it was rejected.
        reason: String,
    },

    /// Two archives share consolidation function and steps.
    #[error("duplicate archive {consolidation_fn:?} with {steps} steps")]
    DuplicateArchive {
        /// The consolidation function.
        consolidation_fn: crate::schema::ConsolidationFn,
        /// Steps per row.
        steps: u32,
    },
}

/// Errors that can occur when encoding or decoding persisted series state.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The blob does not start with the series magic.
    #[error("invalid magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Expected magic.
        expected: [u8; 4],
        /// Magic found in the blob.
        found: [u8; 4],
    },

    /// The blob was written by an unknown format version.
    #[error("unsupported format version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Version this build reads.
        expected: u32,
        /// Version found in the blob.
        found: u32,
    },

    /// The blob ended before a field could be read.
    #[error("truncated blob: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset of the failed read.
        offset: usize,
        /// Bytes needed.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// The blob decoded to an inconsistent state.
    #[error("corrupted blob: {reason}")]
    Invalid {
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Errors reported by a persistence backend.
///
/// Backend failures are retryable: the scheduler logs them and tries again on
/// the next cycle.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend could not serve the request.
    #[error("backend unavailable for '{name}': {reason}")]
    Unavailable {
        /// Series name (or `*` for store-wide operations).
        name: String,
        /// Description of the failure.
        reason: String,
    },

    /// An I/O error from a file-based backend.
    #[error("backend I/O error on '{path}': {source}")]
    Io {
        /// The file or directory involved.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur during a collection cycle.
#[derive(Error, Debug)]
pub enum CollectError {
    /// The backing store is absent or has no active replica.
    #[error("backing store is not ready")]
    NotReady,

    /// The readiness check itself failed.
    #[error("readiness check failed: {reason}")]
    Readiness {
        /// Description of the failure.
        reason: String,
    },

    /// The metric source could not produce a snapshot.
    #[error("metric source failed for group '{group}': {reason}")]
    Source {
        /// The group being collected.
        group: String,
        /// Description of the failure.
        reason: String,
    },

    /// The collection task panicked or was aborted.
    #[error("collection task failed: {reason}")]
    Task {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors that can occur when loading collector configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The config file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the config schema.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The config file path.
        path: String,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The configuration is well-formed but invalid.
    #[error("invalid config: {reason}")]
    Invalid {
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors that can occur when validating an admin request.
#[derive(Error, Debug)]
pub enum RequestError {
    /// The action is not one of the supported actions.
    #[error("unknown action '{given}', supported actions: {supported}")]
    UnknownAction {
        /// The action string that was given.
        given: String,
        /// Comma-separated list of supported actions.
        supported: String,
    },

    /// The output format is not one of the supported formats.
    #[error("unknown format '{given}', supported formats: {supported}")]
    UnknownFormat {
        /// The format string that was given.
        given: String,
        /// Comma-separated list of supported formats.
        supported: String,
    },

    /// A required parameter is missing.
    #[error("'{param}' is a required param")]
    MissingParam {
        /// Name of the missing parameter.
        param: &'static str,
    },

    /// A requested datasource is not part of the series.
    #[error("series '{series}' has no datasource '{datasource}'")]
    UnknownDatasource {
        /// The series name.
        series: String,
        /// The unknown datasource name.
        datasource: String,
    },

    /// Graph output was requested but no renderer is installed.
    #[error("no image renderer configured")]
    NoRenderer,
}

/// Type alias for `Result<T, HistoryError>`.
pub type Result<T> = std::result::Result<T, HistoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err: HistoryError = StoreError::NotFound {
            name: "jvm".to_string(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.is_not_found());

        let err: HistoryError = RequestError::UnknownFormat {
            given: "svg".to_string(),
            supported: "list, string, graph".to_string(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(err.to_string().contains("list, string, graph"));

        let err: HistoryError = BackendError::Unavailable {
            name: "jvm".to_string(),
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_not_found_message() {
        let err = StoreError::NotFound {
            name: "solr.node".to_string(),
        };
        assert_eq!(err.to_string(), "series 'solr.node' doesn't exist");
    }
}
