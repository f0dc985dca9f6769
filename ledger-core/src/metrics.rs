//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_operations_total` - Ledger mutations by operation and outcome

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    /// Ledger mutations by operation and outcome
    pub static ref LEDGER_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_operations_total",
        "Total ledger mutations",
        &["operation", "status"]
    )
    .unwrap();
}
