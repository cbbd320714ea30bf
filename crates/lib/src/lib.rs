//! venv-server-lib: build a Python virtual environment in a container and
//! stream it back as a tar archive.
//!
//! - `archive`: streaming tar transforms (header rewrite, content injection)
//! - `context`: build context assembly from a template directory
//! - `engine`: the container engine contract and its Docker implementation
//! - `pipeline`: the build, run, extract and cleanup sequence

pub mod archive;
pub mod consts;
pub mod context;
pub mod engine;
pub mod pipeline;
pub mod util;
