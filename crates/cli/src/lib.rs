//! venv-server-cli: the HTTP front end for venv-server-lib.

pub mod server;
