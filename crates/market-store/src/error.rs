use consensus_core::ConsensusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{0}' in CSV header")]
    MissingColumn(String),

    #[error("Corrupt value in column {column}: '{value}'")]
    CorruptValue { column: String, value: String },
}

impl From<StoreError> for ConsensusError {
    fn from(e: StoreError) -> Self {
        ConsensusError::DatabaseError(e.to_string())
    }
}
