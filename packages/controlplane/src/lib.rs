pub mod config;
pub mod content;
pub mod database;
pub mod deal;
pub mod entity;
pub mod gc;
pub mod pin;
pub mod repo;
pub mod shuttle;
pub mod tasks;

/// Location tag for content held by the control plane's own node rather
/// than a named shuttle.
pub const LOCATION_LOCAL: &str = "local";
