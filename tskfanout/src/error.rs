use std::io;

/// Error kinds produced by the fan-out library. Mirrors the kinds catalogued in the
/// design doc: each library operation returns one of these rather than a bare string.
#[derive(thiserror::Error, Debug)]
pub enum TimeseriesError {
    #[error("config error: {0}")]
    Config(String),

    #[error("backend `{backend}` could not resolve key `{key}`")]
    Resolve { backend: &'static str, key: String },

    #[error("transient bus error on `{backend}`: {message}")]
    TransientBus { backend: &'static str, message: String },

    #[error("fatal bus error on `{backend}`: {message}")]
    FatalBus { backend: &'static str, message: String },

    #[error("malformed TSK message: {0}")]
    Parse(String),

    #[error("message channel `{got}` does not match configured channel `{expected}`")]
    ChannelMismatch { expected: String, got: String },

    #[error("flush failed on backend(s): {0:?}")]
    PartialFlush(Vec<&'static str>),

    #[error("operation not implemented by backend `{0}`")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TimeseriesError>;
