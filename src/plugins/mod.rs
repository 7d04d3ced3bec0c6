//! Built-in content-type plugins.

pub mod module;
pub mod package;
