//! Shared utilities.
//!
//! Lexical path cleaning and, for tests, archive and engine fixtures.

pub mod path;

#[cfg(any(test, feature = "testing"))]
pub mod testutil;
