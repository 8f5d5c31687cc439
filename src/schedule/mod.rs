pub mod classifier;
pub mod scheduler;

pub use classifier::{apply_schedule, classify, Transition};
pub use scheduler::{plan, CadenceTier, Plan, SchedulerState};
