//! The persistent store boundary.
//!
//! The engine never reads-then-writes a guarded field: every state change
//! that must not race goes through one of the conditional operations below,
//! which check and update under a single per-record lock.

mod event;
mod journal;

pub use event::EventStore;
pub use journal::Journal;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cas<T> {
    /// Guard held; carries the record after the update.
    Applied(T),
    /// Guard failed; carries the current record, unchanged.
    Conflict(T),
    /// No such record.
    Missing,
}

impl<T> Cas<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Cas::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("journal write failed: {0}")]
    Journal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Capacity` once the counselor holds the maximum number of slots.
    async fn insert_slot(&self, slot: AvailabilitySlot) -> Result<(), StoreError>;

    async fn slot(&self, id: Ulid) -> Result<Option<AvailabilitySlot>, StoreError>;

    /// Every slot the counselor has published, in no particular order.
    async fn slots_for_counselor(
        &self,
        counselor_id: Ulid,
    ) -> Result<Vec<AvailabilitySlot>, StoreError>;

    /// Atomically set `claimed` to `claimed` iff it currently equals `expected`.
    async fn set_claimed_if(
        &self,
        id: Ulid,
        expected: bool,
        claimed: bool,
    ) -> Result<Cas<AvailabilitySlot>, StoreError>;

    /// Clear a claim whose request was never written. The in-memory flag is
    /// cleared even if journaling the release fails; replay releases claims
    /// that no request references.
    async fn release_claim(&self, id: Ulid) -> Result<Cas<AvailabilitySlot>, StoreError>;

    /// Atomically delete the slot iff it is unclaimed.
    async fn remove_slot_if_unclaimed(&self, id: Ulid) -> Result<Cas<AvailabilitySlot>, StoreError>;

    async fn insert_request(&self, request: MeetingRequest) -> Result<(), StoreError>;

    async fn request(&self, id: Ulid) -> Result<Option<MeetingRequest>, StoreError>;

    async fn requests_for_owner(&self, owner_id: Ulid) -> Result<Vec<MeetingRequest>, StoreError>;

    async fn requests_for_requester(
        &self,
        requester_id: Ulid,
    ) -> Result<Vec<MeetingRequest>, StoreError>;

    /// Atomically apply `resolution` iff the request's status equals `expected`.
    async fn resolve_request_if(
        &self,
        id: Ulid,
        expected: RequestStatus,
        resolution: Resolution,
        at: Ms,
    ) -> Result<Cas<MeetingRequest>, StoreError>;

    /// Rewrite durable state to its minimal form. No-op for volatile stores.
    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        0
    }
}
