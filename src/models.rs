//! Data types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Stream Events
// ============================================================================

/// Raw event from the feed. Only `transaction.from` is kept; every other field
/// is ignored by the deserializer.
#[derive(Debug, Deserialize)]
pub struct TransactionEvent {
    transaction: Option<TransactionBody>,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    from: Option<String>,
}

#[derive(Debug)]
pub enum ParseError {
    /// Not JSON, or a field has the wrong type
    InvalidJson(serde_json::Error),
    /// JSON object without the sender path
    MissingField(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidJson(e) => write!(f, "invalid event JSON: {}", e),
            ParseError::MissingField(path) => write!(f, "event is missing '{}'", path),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::InvalidJson(e) => Some(e),
            ParseError::MissingField(_) => None,
        }
    }
}

impl TransactionEvent {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        serde_json::from_str(raw).map_err(ParseError::InvalidJson)
    }

    /// Consume the event, keeping only the sender address
    pub fn into_sender(self) -> Result<String, ParseError> {
        let body = self
            .transaction
            .ok_or(ParseError::MissingField("transaction"))?;
        body.from
            .filter(|from| !from.is_empty())
            .ok_or(ParseError::MissingField("transaction.from"))
    }
}

/// Parse a feed message and extract its sender address
pub fn extract_sender(raw: &str) -> Result<String, ParseError> {
    TransactionEvent::parse(raw)?.into_sender()
}

// ============================================================================
// Aggregate Records
// ============================================================================

/// One row of the aggregate table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: String,
    pub occurrence_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// One element of the exported snapshot artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub address: String,
    pub occurrence_count: u64,
}

impl From<&AddressRecord> for SnapshotEntry {
    fn from(record: &AddressRecord) -> Self {
        Self {
            address: record.address.clone(),
            occurrence_count: record.occurrence_count,
        }
    }
}
