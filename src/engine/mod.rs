pub mod after_event;
pub mod errors;
pub mod registry;
pub mod runner;
pub mod step;
pub mod tracker;
pub mod types;

pub use after_event::{AfterEventManager, OperationStarter};
pub use errors::SchedulerError;
pub use registry::OperationRegistry;
pub use runner::Scheduler;
pub use step::{Operation, Step, StepGroup};
pub use tracker::{TaskResult, WorkerTracker};
