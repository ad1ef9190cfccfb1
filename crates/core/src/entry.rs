//! Queue entry model.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::id::{OwnerId, RecordId, UserToken};

/// Processing state of a queue row.
///
/// `Available` and `InProcessing` live in the active table; every other state
/// is terminal and only ever appears in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Available,
    InProcessing,
    Processed,
    Failed,
    Removed,
    Reaped,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 6] = [
        ProcessingState::Available,
        ProcessingState::InProcessing,
        ProcessingState::Processed,
        ProcessingState::Failed,
        ProcessingState::Removed,
        ProcessingState::Reaped,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessingState::Available | ProcessingState::InProcessing)
    }

    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Available => "AVAILABLE",
            ProcessingState::InProcessing => "IN_PROCESSING",
            ProcessingState::Processed => "PROCESSED",
            ProcessingState::Failed => "FAILED",
            ProcessingState::Removed => "REMOVED",
            ProcessingState::Reaped => "REAPED",
        }
    }
}

impl core::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown processing state: {s}")))
    }
}

/// One row of pending or in-flight work.
///
/// `class_name` and `event_json` are opaque to the engine; only the handler
/// side ever interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub record_id: RecordId,
    pub class_name: String,
    pub event_json: String,
    pub queue_name: String,
    pub user_token: UserToken,
    pub future_user_token: Option<UserToken>,
    pub created_date: DateTime<Utc>,
    pub creating_owner: OwnerId,
    pub processing_owner: Option<OwnerId>,
    /// Claim expiry while `InProcessing`.
    pub processing_available_date: Option<DateTime<Utc>>,
    pub processing_state: ProcessingState,
    pub error_count: u32,
    pub search_key1: Option<i64>,
    pub search_key2: Option<i64>,
    /// Earliest instant the entry may be claimed.
    pub effective_date: DateTime<Utc>,
}

impl QueueEntry {
    /// A fresh `Available` entry, eligible immediately.
    pub fn new(
        queue_name: impl Into<String>,
        class_name: impl Into<String>,
        event_json: impl Into<String>,
        creating_owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: RecordId::UNASSIGNED,
            class_name: class_name.into(),
            event_json: event_json.into(),
            queue_name: queue_name.into(),
            user_token: UserToken::new(),
            future_user_token: None,
            created_date: now,
            creating_owner,
            processing_owner: None,
            processing_available_date: None,
            processing_state: ProcessingState::Available,
            error_count: 0,
            search_key1: None,
            search_key2: None,
            effective_date: now,
        }
    }

    /// Defer delivery until `at`.
    pub fn with_effective_date(mut self, at: DateTime<Utc>) -> Self {
        self.effective_date = at;
        self
    }

    pub fn with_search_keys(mut self, search_key1: Option<i64>, search_key2: Option<i64>) -> Self {
        self.search_key1 = search_key1;
        self.search_key2 = search_key2;
        self
    }

    pub fn with_user_token(mut self, token: UserToken) -> Self {
        self.user_token = token;
        self
    }

    pub fn with_future_user_token(mut self, token: Option<UserToken>) -> Self {
        self.future_user_token = token;
        self
    }

    /// Partition key scoping the ordering guarantee.
    pub fn partition(&self) -> (Option<i64>, Option<i64>) {
        (self.search_key1, self.search_key2)
    }

    /// Claimable right now (ignores ownership races).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.processing_state == ProcessingState::Available
            && self.processing_owner.is_none()
            && self.effective_date <= now
    }

    /// Claim lease expired at or before `cutoff`.
    pub fn is_claim_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.processing_state == ProcessingState::InProcessing
            && self
                .processing_available_date
                .is_some_and(|expiry| expiry <= cutoff)
    }

    /// Local mirror of a successful conditional claim.
    pub fn mark_claimed(&mut self, owner: &OwnerId, expiry: DateTime<Utc>) {
        self.processing_state = ProcessingState::InProcessing;
        self.processing_owner = Some(owner.clone());
        self.processing_available_date = Some(expiry);
    }

    /// Copy of this entry in a terminal state, ready for history.
    pub fn resolved(&self, state: ProcessingState) -> Self {
        let mut resolved = self.clone();
        resolved.processing_state = state;
        resolved
    }

    /// Back to `Available` for a later retry.
    pub fn rearm(&mut self, error_count: u32, effective_date: DateTime<Utc>) {
        self.processing_state = ProcessingState::Available;
        self.processing_owner = None;
        self.processing_available_date = None;
        self.error_count = error_count;
        self.effective_date = effective_date;
    }

    /// Replacement row for a reaped orphan: same payload, fresh ownership.
    pub fn redispatch_copy(&self, owner: &OwnerId, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.record_id = RecordId::UNASSIGNED;
        copy.created_date = now;
        copy.creating_owner = owner.clone();
        copy.processing_owner = None;
        copy.processing_available_date = None;
        copy.processing_state = ProcessingState::Available;
        copy.error_count = self.error_count.saturating_add(1);
        copy
    }
}
