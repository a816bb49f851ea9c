pub mod condition;
pub mod indicators;
pub mod library;
pub mod matcher;
pub mod regime;
pub mod scheduler;
pub mod store;
pub mod types;
