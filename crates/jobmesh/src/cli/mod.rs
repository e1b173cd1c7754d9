//! Command tree, handlers and output formatting

pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::build_cli;
pub use handlers::run_cli;
