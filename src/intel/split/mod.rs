pub mod engine;
pub mod flip_log;
pub mod registry;
