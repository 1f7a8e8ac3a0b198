//! Workspace-level acceptance tests.

mod common;
mod config_test;
mod pulse_loop_test;
mod teardown_test;
