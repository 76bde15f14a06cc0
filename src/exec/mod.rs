// src/exec/mod.rs

//! Shell-command stages.
//!
//! - [`template`] expands `{item}`-style placeholders in command templates.
//! - [`command`] builds stage functions that run the expanded command with
//!   `sh -c` (or `cmd /C` on Windows) and turn a non-zero exit into a
//!   failed call.

pub mod command;
pub mod template;

pub use command::shell_stage_fn;
pub use template::{expand, TemplateContext};
