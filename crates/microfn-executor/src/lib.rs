//! Cold-path execution engine: one interpreter process per invocation.
//!
//! A call materializes user code and event into an ephemeral workspace,
//! generates a per-runtime bootstrap, spawns the interpreter bound to that
//! workspace, demultiplexes its output into logs and one structured result,
//! and reclaims the workspace on every exit path.

pub mod invoker;
pub mod process;
pub mod runner;
pub mod workspace;

pub use invoker::{Invoker, InvokerConfig, DEFAULT_MAX_CONCURRENCY};
pub use runner::{runner_for, LanguageRunner};
pub use workspace::EphemeralWorkspace;
