// Integration tests against throw-away projects

mod build_tests;
mod common;
mod incremental_tests;
