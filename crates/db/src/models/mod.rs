//! Row models and DTOs for the store layer.

pub mod audit;
pub mod conversation;
pub mod plan;
pub mod run;
