//! Fixed names and defaults shared by the library and the server.

/// Build file at the root of every template directory.
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Ignore file co-located with the build file.
pub const IGNORE_FILE_NAME: &str = ".dockerignore";

/// Context files that no ignore rule can exclude.
pub const ALWAYS_INCLUDED: &[&str] = &[DOCKERFILE_NAME, IGNORE_FILE_NAME];

/// Context entry replaced by the caller's manifest.
pub const MANIFEST_FILE_NAME: &str = "requirements.txt";

/// Build argument carrying the normalized target path.
pub const VENV_BUILD_ARG: &str = "VENV";

/// Directory holding the templates, relative to the working directory.
pub const DEFAULT_TEMPLATE_ROOT: &str = "docker";

/// Address the server binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
