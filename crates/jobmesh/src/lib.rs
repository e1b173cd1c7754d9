//! jobmesh CLI library
//!
//! The binary is a thin shell over [`cli::run_cli`]; the library target
//! exists so the command tree can be inspected from tests.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod cli;
