use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<toml::de::Error> for FleetError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub fn config_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(FleetError::ConfigError(message.into()))
}
