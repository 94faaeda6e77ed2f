//! Integration tests against a real Postgres server started through
//! testcontainers.

pub mod clone_tests;
pub mod fanout_tests;
pub mod router_tests;
