//! promptplot: ask questions about a tabular dataset in plain language.
//!
//! A user prompt is augmented with a description of the configured CSV
//! dataset and sent to an OpenAI-compatible chat endpoint. The first fenced
//! code block of the reply is executed by [`executor::CodeRunner`] in an
//! isolated Python subprocess with resource limits, an import blacklist and a
//! wall-clock deadline; captured stdout (or the error message) and any
//! produced matplotlib figure are rendered on the page.

pub mod config;
pub mod dataset;
pub mod errors;
pub mod executor;
pub mod extract;
pub mod llm;
pub mod web;

pub use config::{AppConfig, ResourceLimits};
pub use errors::{AppError, Result, SandboxError};
pub use executor::{CodeRunner, ExecOutcome, RunRequest};
pub use extract::extract_code;
