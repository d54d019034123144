use crate::amount::{Amount, AmountParseError, AmountParser};
use crate::text::{clean_ocr_text, extract_player_name};
use serde::{Deserialize, Serialize};

/// Where an emitted record came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOrigin {
    /// Emission index within the session (0-based, gap-free).
    pub index: usize,
    pub source_frame: u64,
    pub template: String,
    pub category: Option<String>,
    pub fingerprint: String,
}

/// A record after text recognition and value parsing.
///
/// Parse failures are kept: `parse_success` is false and `parse_error`
/// says why, so one unreadable row never aborts a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub origin: RecordOrigin,
    pub raw_text: String,
    pub text: String,
    pub ocr_confidence: f32,
    pub player_name: Option<String>,
    pub amount: Option<Amount>,
    pub parse_success: bool,
    pub parse_error: Option<String>,
}

impl ParsedRecord {
    pub fn from_recognized(
        origin: RecordOrigin,
        raw_text: &str,
        ocr_confidence: f32,
        parser: &AmountParser,
    ) -> Self {
        let text = clean_ocr_text(raw_text);
        let player_name = extract_player_name(&text);
        let parsed: Result<Amount, AmountParseError> = parser.parse(&text);

        let (amount, parse_error) = match parsed {
            Ok(amount) => (Some(amount), None),
            Err(e) => {
                log::debug!("record {} has no amount: {}", origin.index, e);
                (None, Some(e.to_string()))
            }
        };

        Self {
            origin,
            raw_text: raw_text.to_string(),
            text,
            ocr_confidence,
            player_name,
            parse_success: amount.is_some(),
            amount,
            parse_error,
        }
    }

    /// Record whose text could not be recognized at all.
    pub fn unreadable(origin: RecordOrigin, reason: impl Into<String>) -> Self {
        Self {
            origin,
            raw_text: String::new(),
            text: String::new(),
            ocr_confidence: 0.0,
            player_name: None,
            amount: None,
            parse_success: false,
            parse_error: Some(reason.into()),
        }
    }
}

/// Totals over a batch of parsed records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub total_records: usize,
    pub parsed: usize,
    pub failed: usize,
    pub total_amount: f64,
}

impl RecordSummary {
    pub fn from_records(records: &[ParsedRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.total_records += 1;
            match &record.amount {
                Some(amount) => {
                    summary.parsed += 1;
                    summary.total_amount += amount.value;
                }
                None => summary.failed += 1,
            }
        }
        summary
    }
}
