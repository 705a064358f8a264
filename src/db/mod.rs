//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those types.
//!
//! External modules should import from `dropwatch::db`, which re-exports the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ProductRow, RecipientRow, ScraperState};
