use thiserror::Error;

/// Input rejected before it reaches the message store. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content too long: {len} chars (max {max})")]
    ContentTooLong { len: usize, max: usize },

    #[error("Sender {sender} is not a participant of this conversation")]
    SenderNotParticipant { sender: String },

    #[error("A conversation needs two distinct participants")]
    SelfConversation,

    #[error("Identifier must not be empty")]
    EmptyIdentity,
}
