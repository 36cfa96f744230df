use crate::msg::MsgError;
use libsluice::error::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no hello has been exchanged with the peer")]
    NotConnected,
    #[error("a channel already exists")]
    ChannelExists,
    #[error("no channel exists")]
    NoChannel,
    #[error("hello named an unexpected {field}: {actual}, expected {expected}")]
    UnexpectedHello { field: &'static str, expected: String, actual: String },
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("message error: {0}")]
    Msg(#[from] MsgError),
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
