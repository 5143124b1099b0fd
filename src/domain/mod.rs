pub mod accumulation;
pub mod cycle;
pub mod task;

pub use accumulation::Accumulation;
pub use cycle::{Cycle, CycleStatus};
pub use task::{parse_specific_time, IntervalUnit, ScheduledTask, TaskKind};
