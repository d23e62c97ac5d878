pub mod action;
pub mod bus;
pub mod cancel;
pub mod capture;
pub mod classifier;
pub mod connectivity;
pub mod error;
pub mod kit;
pub mod logger;
pub mod matcher;
pub mod orchestrator;
pub mod platform;
pub mod profile;
pub mod quantity;
pub mod runtime;
pub mod scanner;
pub mod settings;
pub mod sleep;
pub mod template;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use cancel::CancellationToken;
pub use error::{ConfigError, DeviceError, RunError, StepError};
pub use orchestrator::{goals, Goal, GoalContext, Orchestrator, RunOutcome, RunSummary};
pub use runtime::{Runtime, RuntimeStatus};
