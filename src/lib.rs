pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod progress;
pub mod recommendations;
pub mod replacement;
pub mod scan_locks;
pub mod unlock;
pub mod validate;

pub use engine::Engine;
pub use error::EngineError;
