pub mod client;
pub mod decode;
pub mod gateway;

use futures::stream::BoxStream;
use thiserror::Error;

pub use self::client::{ChatBackend, ChatClient};
pub use self::gateway::{AskRequest, GenerationGateway};

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation service unreachable: {0}")]
    Transport(String),
    #[error("generation service timed out")]
    Timeout,
    #[error("generation service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("malformed fragment from generation service: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout
        } else {
            GenerationError::Transport(err.to_string())
        }
    }
}

/// One decoded unit of an incremental chat completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Delta(String),
    /// Completion marker, with whatever metadata the service attached.
    Done(Option<serde_json::Value>),
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, GenerationError>>;
