//! External program execution.
//!
//! [`process::exec_program`] runs a command to completion and captures its
//! output. Used by the remote scanner (ssh) and the extractor (tar, 7z).

pub mod process;

pub use process::{exec_program, ExecError, ExecResult};
