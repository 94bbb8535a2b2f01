//! Core data models for the pipeline.
//!
//! Objects and version markers describe what the store holds, tables are the
//! structured copies and query results, and the sync models describe what a
//! run decided per candidate.

pub mod object;
pub mod sync;
pub mod table;
