//! Virtual machine: per-process evaluator, global state and scheduler.

pub mod channel;
pub mod executor;
pub mod process;
pub mod scheduler;
pub mod snapshot;
pub mod state;

pub use channel::{Channel, ChannelId};
pub use executor::{ChannelEvent, Executor, StepEffects, StepOutcome};
pub use process::{CodeRef, Frame, Process, ProcessStatus};
pub use scheduler::{EnabledStep, Scheduler};
pub use snapshot::{ProcessSnapshot, Snapshot};
pub use state::GlobalState;
