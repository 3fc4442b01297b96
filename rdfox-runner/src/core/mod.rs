//! Pure, deterministic logic: output predicates, answer parsing, script
//! construction and version gating. No process or network I/O.

pub mod patterns;
pub mod results;
pub mod script;
pub mod types;
pub mod version;
