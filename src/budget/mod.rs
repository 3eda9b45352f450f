//! Multi-period token budgets.
//!
//! Budget periods are calendar-aligned (midnight UTC, first of month)
//! rather than rolling, matching billing-period convention. The ledger is
//! built on the counter store and never mutates usage during a check.

mod ledger;
mod period;

pub use ledger::{
    BudgetDenyReason, BudgetLedger, BudgetResult, DeductOutcome, UsageSnapshot, crossed_thresholds,
};
pub use period::{day_key_part, month_key_part, next_daily_reset, next_monthly_reset};
