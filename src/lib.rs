pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod repository;
pub mod scheduler;

pub use config::AppConfig;
pub use domain::{Accumulation, Cycle, CycleStatus, ScheduledTask, TaskKind};
pub use engine::{StrategyOverrides, UpdateEngine};
pub use error::{CyclerError, Result};
pub use exchange::{Exchange, ExchangeClient};
pub use repository::{AccumulationRepository, CycleRepository};
pub use scheduler::Scheduler;
