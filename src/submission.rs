// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Submission data structures.
//!
//! A [`QueuedSubmission`] is the unit held in the local durable queue while
//! the device is offline. A [`SubmissionRecord`] is the row written to (and
//! read back from) the remote history table.
//!
//! # Example
//!
//! ```
//! use healthing_sync::QueuedSubmission;
//!
//! let sub = QueuedSubmission::new(1, "P1", "K1", "2024-01-01T00:00:00.000Z");
//! assert_eq!(sub.private_id, "P1");
//! assert_eq!(sub.to_record().healthing_key, "K1");
//! ```

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Locally assigned queue id (SQLite rowid, never reused).
pub type SubmissionId = i64;

/// A submission waiting for reconciliation.
///
/// Immutable once enqueued. Removed only by the reconciler after a terminal
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    /// Local primary key
    pub id: SubmissionId,
    /// Subject identifier
    pub private_id: String,
    /// One-time credential
    pub healthing_key: String,
    /// ISO-8601 creation time, set at enqueue
    pub timestamp: String,
}

impl QueuedSubmission {
    pub fn new(
        id: SubmissionId,
        private_id: impl Into<String>,
        healthing_key: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id,
            private_id: private_id.into(),
            healthing_key: healthing_key.into(),
            timestamp: timestamp.into(),
        }
    }

    /// The history row this submission becomes once consumed remotely.
    #[must_use]
    pub fn to_record(&self) -> SubmissionRecord {
        SubmissionRecord {
            private_id: self.private_id.clone(),
            healthing_key: self.healthing_key.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// A row of the remote submission history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub private_id: String,
    pub healthing_key: String,
    pub timestamp: String,
}

impl SubmissionRecord {
    /// Build a record stamped with the current time.
    pub fn now(private_id: impl Into<String>, healthing_key: impl Into<String>) -> Self {
        Self {
            private_id: private_id.into(),
            healthing_key: healthing_key.into(),
            timestamp: now_iso8601(),
        }
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_now_is_parseable_utc_millis() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        // 2024-01-01T00:00:00.000Z
        assert_eq!(ts.len(), 24);
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_to_record_keeps_fields() {
        let sub = QueuedSubmission::new(7, "P7", "K7", "2024-01-01T00:00:00Z");
        let record = sub.to_record();
        assert_eq!(record.private_id, "P7");
        assert_eq!(record.healthing_key, "K7");
        assert_eq!(record.timestamp, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_record_now_stamps_time() {
        let record = SubmissionRecord::now("P1", "K1");
        assert!(DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn test_serde_shape() {
        let sub = QueuedSubmission::new(1, "P1", "K1", "2024-01-01T00:00:00Z");
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["private_id"], "P1");
        assert_eq!(json["healthing_key"], "K1");

        let back: QueuedSubmission = serde_json::from_value(json).unwrap();
        assert_eq!(back, sub);
    }
}
