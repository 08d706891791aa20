pub mod models;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod db;
pub mod memory;
pub mod metrics;
pub mod retry;


pub use models::*;
pub use engine::{run_backtest, BacktestDriver, DriverState};
pub use error::{BacktestError, LedgerError};
pub use ledger::LedgerStore;
pub use db::LedgerDb;
pub use memory::MemoryLedger;
pub use retry::{RetryError, RetryPolicy};
