#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! seedsync library: the building blocks of the sync daemon.
//!
//! - `supervisor`: child-process workers with fatal-error propagation
//! - `model`: the merged file tree, listeners, and diffs
//! - `lftp`: transfer job status, `jobs -v` parsing, the lftp client
//! - `controller`: the tick loop that merges scans and drives transfers
//! - `scan`: local and remote snapshots
//! - `extract`: archive detection and extraction
//! - `config`: configuration loading
//! - `shell`: one-shot program execution

pub mod config;
pub mod controller;
pub mod extract;
pub mod lftp;
pub mod model;
pub mod scan;
pub mod shell;
pub mod supervisor;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use controller::{Action, Command, Controller, ControllerHandle};
pub use model::{FileState, Model, ModelFile};
pub use supervisor::{WorkerError, WorkerProcess};
