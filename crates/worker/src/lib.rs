//! Process wiring for the pipeline worker: environment configuration and
//! the collaborators it runs with.

pub mod collaborators;
pub mod config;
