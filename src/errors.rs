use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration validation failed: {0}")]
    Config(String),
    #[error("Configuration parse failed: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Account {id} has an invalid address: {account}")]
    InvalidAccount { id: String, account: String },
    #[error("Streaming service failure: {0}")]
    Streaming(String),
}
