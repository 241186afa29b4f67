//! Agentbook: local customer and policy book for insurance agents.
//!
//! Spreadsheet exports are analyzed against the store (`import`), written
//! row by row, and anything the matchers cannot settle is parked in the hold
//! store for an operator (`holds`).

pub mod config;
pub mod contract_match;
pub mod corporate;
pub mod db;
pub mod error;
pub mod hashing;
pub mod holds;
pub mod identity;
pub mod import;
pub mod masked;
mod migrations;
pub mod name_match;
pub mod normalize;
pub mod reason;
pub mod roles;
pub mod sheet;
pub mod types;
