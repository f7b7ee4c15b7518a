/// Filesystem helpers for dump files and checkpoint artifacts.
pub mod fs;
