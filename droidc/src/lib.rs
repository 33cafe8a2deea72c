//! Ahead-of-time compiler from managed method bodies to a register based container.
pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod trees;
