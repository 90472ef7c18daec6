//! Ladder, an automated DCA trading engine.
//!
//! Watches live crypto quotes and broker trade updates for a set of
//! configured assets and runs one persisted trading cycle per asset: a base
//! buy, safety buys into weakness, and a (optionally trailing) take-profit
//! sell. Periodic reconciliation workers keep the persisted state converged
//! with what the broker actually holds.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
