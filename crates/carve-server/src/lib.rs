//! HTTP control surface for carve: system state, queue, configs, evaluation
//! runs and extraction lookup. The binary also hosts the worker pool.

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;
