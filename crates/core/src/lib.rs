//! Domain types and pure logic for the back-office action pipeline.
//!
//! This crate has no I/O. It holds the intent catalog, validation, plan
//! compilation and the run/stage/audit models shared by the store and
//! pipeline crates.

pub mod audit;
pub mod catalog;
pub mod error;
pub mod intent;
pub mod plan;
pub mod plan_builder;
pub mod run;
pub mod types;
pub mod validation;
