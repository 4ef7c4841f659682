//! Building blocks shared by conversion and extraction.
//!
//! ## Data Flow
//!
//! ```text
//! document ──▶ backend ──▶ postprocess ──▶ name.md
//! name.md  ──▶ llm ──▶ structured ──▶ name.json
//! ```
//!
//! 1. [`document`]    : validate the input file and derive sibling paths
//! 2. [`postprocess`] : deterministic cleanup of backend Markdown
//! 3. [`llm`]         : provider resolution and the chat seam; the only
//!    stage with LLM network I/O
//! 4. [`structured`]  : one extraction call with validation and re-asks

pub mod document;
pub mod llm;
pub mod postprocess;
pub mod structured;
