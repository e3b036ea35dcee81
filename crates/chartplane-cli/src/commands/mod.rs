//! CLI commands

pub mod deps;
pub mod push;
pub mod resolve_version;
pub mod show;
pub mod values;
