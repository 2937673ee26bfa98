//! Error types for the xDS relay.

use thiserror::Error;

/// Error type for the xDS relay.
#[derive(Debug, Error)]
pub enum Error {
    /// No aggregation rule matched and the mapper requires a match.
    #[error("no aggregation rule matched request for type `{type_url}`")]
    NoMatchingRule {
        /// Type URL of the rejected request.
        type_url: String,
    },

    /// The aggregation rules are structurally invalid.
    #[error("invalid aggregation rules: {0}")]
    InvalidRules(String),

    /// A regular expression in the aggregation rules failed to compile.
    #[error("invalid regex `{pattern}`: {source}")]
    Regex {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The configuration document could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The log subscriber could not be installed.
    #[error("logging error: {0}")]
    Logging(String),

    /// Could not establish a connection to the origin server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The upstream stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The upstream stream failed with a gRPC status.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Status(#[from] tonic::Status),

    /// The upstream stream was closed by the peer.
    #[error("stream closed")]
    StreamClosed,

    /// The bounded outbound queue of an upstream stream overflowed.
    #[error("outbound queue full for `{type_url}`")]
    OutboundQueueFull {
        /// Type URL of the affected stream.
        type_url: String,
    },

    /// A protobuf payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The origin sent a response that is unusable for its stream.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The upstream client has been shut down.
    #[error("upstream client is shut down")]
    Shutdown,
}

/// Result type alias for xDS relay operations.
pub type Result<T> = std::result::Result<T, Error>;
