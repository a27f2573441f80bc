use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Realtime link is down")]
    Disconnected,

    #[error("Failed to encode bus event: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
