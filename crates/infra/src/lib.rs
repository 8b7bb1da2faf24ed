//! Infrastructure layer: event log, snapshots, dispatch, read models, sagas.

pub mod aggregate_runtime;
pub mod command_dispatcher;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod saga;
pub mod snapshot;
pub mod workers;

#[cfg(test)]
mod integration_tests;
