//! Scrollscan core types
//!
//! Everything downstream of the capture engine that needs no image
//! processing: reading amounts out of recognized text, cleaning OCR output
//! and the parsed record shape handed to the export layer.

pub mod amount;
pub mod records;
pub mod text;

pub use amount::{format_amount, Amount, AmountParseError, AmountParser, ParseMethod, Unit};
pub use records::{ParsedRecord, RecordOrigin, RecordSummary};
