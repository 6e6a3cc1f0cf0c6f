//! Error taxonomy: configuration loading, item/link validation, value
//! coercion and handler I/O each get their own variant so a failure can be
//! attributed to the stage that produced it.

use std::io;

use thiserror::Error;

use crate::sml::SmlError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },

    #[error("config error: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Item(String),

    #[error("{0}")]
    Link(String),
}

impl From<String> for ValidationError {
    fn from(s: String) -> ValidationError {
        ValidationError::Item(s)
    }
}

#[derive(Debug, Error)]
pub enum CoercionError {
    #[error("value {value} has no unit conversion to {target}")]
    UnitMismatch { value: String, target: String },

    #[error("JSON pointer '{pointer}' did not resolve in {document}")]
    JsonPointerMiss { pointer: String, document: String },

    #[error("regex '{pattern}' did not match '{input}'")]
    RegexMiss { pattern: String, input: String },

    #[error("mapping has no entry for '{input}'")]
    MappingMiss { input: String },

    #[error("OBIS code '{code}' not present in datagram")]
    ObisMiss { code: String },

    #[error("malformed SML datagram: {0}")]
    Sml(#[from] SmlError),

    #[error("cannot coerce '{input}' to {target}")]
    TypeMismatch { input: String, target: String },
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("[{link_id}] I/O error: {source}")]
    Io { link_id: String, #[source] source: io::Error },

    #[error("[{link_id}] protocol error: {message}")]
    Protocol { link_id: String, message: String },

    #[error("[{link_id}] connection to {target} lost: {reason}")]
    ConnectionLost { link_id: String, target: String, reason: String },

    #[error("[{link_id}] request timed out after {millis}ms")]
    Timeout { link_id: String, millis: u64 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("epoll error: {0}")]
    Io(#[from] io::Error),
}
