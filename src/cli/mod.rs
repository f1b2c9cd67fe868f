//! Command-line interface for bench-fleet.
//!
//! Provides the `run`, `serve` and `show` commands.

mod commands;

pub use commands::{
    exit_code_for, parse_cli, run, run_with_cli, Cli, Commands, EXIT_CONFIG_ERROR, EXIT_FAILURE,
    EXIT_SUCCESS,
};
