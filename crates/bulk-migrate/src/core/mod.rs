//! Core data model shared by every stage of the transfer.
//!
//! - [`record`]: the unit of transfer and its typed payload values
//! - [`token`]: continuation tokens, pages and checkpointed scan positions

pub mod record;
pub mod token;

pub use record::{FieldValue, Record};
pub use token::{ContinuationToken, Page, ScanPosition};
