//! Cycle engine: reconciliation (update), creation, accumulation and
//! safe cancellation.

pub mod accumulate;
pub mod cancel;
pub mod create;
pub mod pricing;
pub mod update;

pub use accumulate::{available_profit, consider, AccumulationOutcome};
pub use cancel::{cancel_cycle, is_disguised_success, safe_cancel, CancelOutcome};
pub use create::create_cycle;
pub use update::{PassSummary, UpdateEngine};

use rust_decimal::Decimal;

/// Per-task strategy overrides (scheduled tasks may trade with offsets
/// or sizing different from the exchange defaults).
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyOverrides {
    pub buy_offset: Option<Decimal>,
    pub sell_offset: Option<Decimal>,
    pub percent: Option<Decimal>,
}

impl StrategyOverrides {
    pub fn from_task(task: &crate::domain::ScheduledTask) -> Self {
        Self {
            buy_offset: task.buy_offset,
            sell_offset: task.sell_offset,
            percent: task.percent,
        }
    }
}
