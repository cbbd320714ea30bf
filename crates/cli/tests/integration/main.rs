//! In-process HTTP tests: the router driven through `tower::ServiceExt::oneshot`
//! against a recording engine.

mod common;
mod http_tests;
