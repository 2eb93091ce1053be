// Public API - probe engine, aggregator and export types
pub mod config;
pub mod error;
pub mod export;
pub mod monitor;
pub mod state;

// Building blocks, public so the binary and integration tests can reach them
pub mod cli;
pub mod lookup;
pub mod probe;
pub mod trace;
