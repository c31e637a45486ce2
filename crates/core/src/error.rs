#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {name} = {value:?} ({reason})")]
    Config {
        name: &'static str,
        value: String,
        reason: String,
    },
}
