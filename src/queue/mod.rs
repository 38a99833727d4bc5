//! Remote job queue access.
//!
//! - [`Job`] / [`JobId`]: the wire model, including the `"none"` sentinel
//! - [`JobSource`]: the seam the poll loop fetches through
//! - [`QueueClient`]: the HTTP implementation (`GET /latest`, `GET /cue`,
//!   `POST /speak`)

pub mod client;
pub mod job;

pub use client::{JobSource, QueueClient};
pub use job::{Job, JobId, NO_JOB_ID};
