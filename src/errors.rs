//! Configuration error types.
//!
//! Every configuration problem (a URI that cannot be parsed, a scheme with
//! no driver, a store missing its bucket or path, a run URL no backend
//! recognizes) is reported as a [`ConfigError`]. These are raised before
//! any I/O happens and are never retryable. They travel inside
//! `anyhow::Error` like everything else, so callers that care can recover
//! them with `err.downcast_ref::<ConfigError>()`.

use std::fmt;

/// Errors detected while interpreting user supplied locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The string could not be parsed as a URI at all.
    InvalidUri {
        /// The offending input.
        uri: String,
        /// Parser message.
        reason: String,
    },

    /// No store driver is registered for this scheme.
    UnsupportedScheme(String),

    /// An object storage URI without a bucket (`gs:///path`).
    MissingBucket(String),

    /// A store URI without a path component.
    MissingPath(String),

    /// A registry reference that does not name an image.
    MissingImage(String),

    /// The run specification URL does not match any known build backend.
    UnknownBuilder(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUri { uri, reason } => write!(f, "invalid uri {uri}: {reason}"),
            Self::UnsupportedScheme(scheme) => {
                write!(f, "no artifact store driver for scheme '{scheme}'")
            }
            Self::MissingBucket(uri) => write!(f, "object storage uri has no bucket: {uri}"),
            Self::MissingPath(uri) => write!(f, "store uri has no path defined: {uri}"),
            Self::MissingImage(uri) => write!(f, "registry reference has no image: {uri}"),
            Self::UnknownBuilder(url) => {
                write!(f, "unable to find a build system for run url {url}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_unsupported_scheme() {
        let err = ConfigError::UnsupportedScheme("ftp".into());
        assert_eq!(err.to_string(), "no artifact store driver for scheme 'ftp'");
    }

    #[test]
    fn display_invalid_uri_mentions_input() {
        let err = ConfigError::InvalidUri {
            uri: "::nope".into(),
            reason: "relative URL without a base".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("::nope"));
        assert!(msg.contains("relative URL"));
    }

    #[test]
    fn survives_anyhow_round_trip() {
        let err: anyhow::Error = ConfigError::MissingBucket("gs:///x".into()).into();
        let err = err.context("resolving store");
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingBucket("gs:///x".into()))
        );
    }

    #[test]
    fn config_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConfigError>();
    }
}
