use chrono::NaiveDate;
use consensus_core::ConsensusError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Database error codes that signal a transient write-write conflict.
///
/// SQLite reports extended result codes (BUSY and LOCKED families), MySQL
/// reports deadlock / lock-wait timeout numbers and Postgres reports
/// SQLSTATE serialization failures.
const CONFLICT_CODES: &[&str] = &[
    "5", "6", "261", "262", "517", "773", // SQLite BUSY / LOCKED
    "1205", "1213", // MySQL lock wait timeout / deadlock
    "40001", "40P01", // serialization failure / deadlock detected
];

pub fn is_conflict_code(code: &str) -> bool {
    CONFLICT_CODES.contains(&code)
}

/// Failure of a single ledger operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt ledger value in column {column}: '{value}'")]
    Corrupt { column: String, value: String },
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_conflict_code(&code) => LedgerError::Conflict(e.to_string()),
                _ => LedgerError::Database(e.to_string()),
            },
            sqlx::Error::PoolTimedOut => LedgerError::Conflict(e.to_string()),
            _ => LedgerError::Database(e.to_string()),
        }
    }
}

/// Reasons a backtest run halts. Every variant that happens mid-run carries
/// the evaluation date so the run can be resumed from the last checkpoint.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Invalid backtest config: {0}")]
    InvalidConfig(String),

    #[error("Could not load ledger state for portfolio '{portfolio}': {source}")]
    State {
        portfolio: String,
        source: LedgerError,
    },

    #[error("Market data unavailable on {date}: {source}")]
    Source {
        date: NaiveDate,
        source: ConsensusError,
    },

    #[error("Reconciliation failed on {date}: carried value {expected}, redistributable capital {actual}")]
    Reconciliation {
        date: NaiveDate,
        expected: Decimal,
        actual: Decimal,
    },

    #[error("Ledger write on {date} failed: {source}")]
    Persistence { date: NaiveDate, source: LedgerError },

    #[error("Ledger write on {date} still conflicting after {attempts} attempts: {source}")]
    RetriesExhausted {
        date: NaiveDate,
        attempts: u32,
        source: LedgerError,
    },
}

impl BacktestError {
    /// Evaluation date the run halted at, when the failure happened mid-run.
    pub fn evaluation_date(&self) -> Option<NaiveDate> {
        match self {
            BacktestError::Source { date, .. }
            | BacktestError::Reconciliation { date, .. }
            | BacktestError::Persistence { date, .. }
            | BacktestError::RetriesExhausted { date, .. } => Some(*date),
            BacktestError::InvalidConfig(_) | BacktestError::State { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_codes_cover_all_backends() {
        for code in ["5", "517", "6", "1213", "1205", "40001", "40P01"] {
            assert!(is_conflict_code(code), "{code} should be a conflict");
        }
        for code in ["19", "2067", "23505", "1062"] {
            assert!(!is_conflict_code(code), "{code} is a constraint error");
        }
    }

    #[test]
    fn pool_timeout_is_retryable() {
        assert!(LedgerError::from(sqlx::Error::PoolTimedOut).is_conflict());
        assert!(!LedgerError::from(sqlx::Error::RowNotFound).is_conflict());
    }

    #[test]
    fn fatal_errors_report_the_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let err = BacktestError::RetriesExhausted {
            date,
            attempts: 4,
            source: LedgerError::Conflict("database is locked".into()),
        };
        assert_eq!(err.evaluation_date(), Some(date));
        assert!(err.to_string().contains("2024-03-03"));
    }
}
