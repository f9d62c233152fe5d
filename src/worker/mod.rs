//! Job execution.
//!
//! - [`options`]: turns a claimed job's options snapshot into an invocation
//! - [`executor`]: runs the external command under a deadline
//! - [`queue_worker`]: the poll loop tying the store, executor and
//!   notifications together
//!
//! # Execution Flow
//!
//! 1. [`QueueWorker::tick`] claims the next job from the store
//! 2. [`OptionsResolver`] builds the flags, checking history for `--continue`
//! 3. [`CommandExecutor::execute`] spawns the command and waits
//! 4. The outcome is written back to the job row and execution history, and
//!    a completion event is handed to the notification dispatcher

pub mod executor;
pub mod options;
pub mod queue_worker;

pub use executor::{CommandExecutor, ExecutionError, FailureKind};
pub use options::{InvocationSpec, OptionsResolver, PermissionMode};
pub use queue_worker::{QueueWorker, TickOutcome, WorkerState};
