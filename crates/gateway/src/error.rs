use thiserror::Error;

/// Fatal, process-ending failures. Anything recoverable (a bad upstream, a
/// malformed client request) is captured elsewhere and never surfaces here.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("config: {0}")]
    Config(String),

    #[error("startup: {0}")]
    Startup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
