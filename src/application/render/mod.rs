//! Rendering of admitted workspaces through the external toolchain.
//!
//! The job owns sequencing and state; the toolchain only knows how to run a
//! wrapper script and report its exit code.

mod job;
pub mod markup;
mod toolchain;

pub use job::{RenderJob, RenderOutcome, ScriptExit};
pub use toolchain::{
    ProcessToolchain, Toolchain, ToolchainError, WrapperScript, diff_commands, pandoc_command,
    path_in_environment, shell_quote,
};
