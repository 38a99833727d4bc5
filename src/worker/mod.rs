//! Execution side of the gate.
//!
//! - [`EnvironmentBuilder`]: prepends the logging/capability shim to an
//!   approved job and produces an [`ExecutionRequest`]
//! - [`Supervisor`]: stages the request in the single slot, runs it under
//!   the configured runtime and enforces the deadline
//!
//! # Execution Flow
//!
//! 1. The poll loop hands over source the policy engine accepted
//! 2. [`EnvironmentBuilder::compose`] builds `shim + "\n" + source`
//! 3. [`Supervisor::run`] writes it to the staging path and spawns the runtime
//!    in a fresh process group
//! 4. The child either exits, self-terminates via the shim's timer, or is
//!    killed by the watchdog at the deadline
//! 5. A [`RunResult`] describes what happened; nothing is retried

pub mod shim;
pub mod supervisor;

pub use shim::{EnvironmentBuilder, ExecutionRequest, SELF_TERMINATION_EXIT_CODE};
pub use supervisor::{RunOutcome, RunResult, Supervisor};
