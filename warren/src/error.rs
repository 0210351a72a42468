//! Error taxonomy for channel synchronization.
//!
//! The split matters for retry behavior: a [`ConnectionError`] aborts the
//! current refresh and is retried on the normal schedule; a
//! [`ProtocolError`] or [`SizeLimitError`] on meta-data aborts that
//! followee's refresh only; a leaf-level failure never surfaces here at
//! all, it degrades the one affected record to metadata-only caching.

use nested_enum_utils::common_fields;
use snafu::Snafu;
use warren_base::ChannelKey;

/// The store daemon could not be reached or timed out.
#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ConnectionError {
    #[snafu(display("store node unreachable"))]
    Unreachable {},
    #[snafu(display("{op} timed out"))]
    Timeout { op: &'static str },
}

/// Remote data that violates the channel protocol.
#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ProtocolError {
    #[snafu(display("could not decode {context} document"))]
    Undecodable { context: &'static str },
    #[snafu(display("{context} reference missing from channel tree"))]
    MissingReference { context: &'static str },
}

/// An artifact is bigger than the ceiling configured for its type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(display("{context} is {size_bytes} bytes, over the {limit_bytes} byte ceiling"))]
pub struct SizeLimitError {
    /// Which artifact type hit its ceiling.
    pub context: &'static str,
    /// Observed size.
    pub size_bytes: u64,
    /// The configured ceiling.
    pub limit_bytes: u64,
    backtrace: Option<snafu::Backtrace>,
}

/// The channel key could not be resolved to a published root.
#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ResolveError {
    #[snafu(display("no published root found for {}", key.fmt_short()))]
    NoRecord { key: ChannelKey },
    #[snafu(transparent)]
    Connection { source: ConnectionError },
}

/// Any failure while synchronizing remote channel data.
///
/// This is what the reconciliation engine and the explicit cache loaders
/// propagate.  It is only ever caught at the session boundary, which turns
/// it into a logged, non-throwing outcome.
#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SyncError {
    #[snafu(transparent)]
    Connection { source: ConnectionError },
    #[snafu(transparent)]
    Protocol { source: ProtocolError },
    #[snafu(transparent)]
    SizeLimit { source: SizeLimitError },
    #[snafu(transparent)]
    Resolve { source: ResolveError },
}

impl SyncError {
    /// True if this failure is a transient connectivity problem rather
    /// than bad remote data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connection { .. } | SyncError::Resolve { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_conversions() {
        fn fails() -> Result<(), SyncError> {
            Err(UnreachableSnafu.build())?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(err.is_transient());

        let err: SyncError = UndecodableSnafu { context: "index" }.build().into();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("index"));
    }

    #[test]
    fn test_size_limit_display() {
        let err = SizeLimitSnafu {
            context: "description",
            size_bytes: 100_000u64,
            limit_bytes: 65_536u64,
        }
        .build();
        let text = err.to_string();
        assert!(text.contains("description"));
        assert!(text.contains("65536"));
    }
}
