pub mod config;
pub mod error;
pub mod poll;
pub mod policy;
pub mod queue;
pub mod shutdown;
pub mod worker;
