use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Envelope {0} has no recipient")]
    NoRecipient(uuid::Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
