use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::store::{Cas, StoreError};

use super::{Engine, EngineError};

/// A counselor's open slots from a given date, in `(date, start_time)` order.
///
/// Holds a snapshot taken at query time. `iter()` can be called any number
/// of times; each pass filters the snapshot lazily.
#[derive(Debug, Clone)]
pub struct OpenSlots {
    /// All of the counselor's slots, sorted by `sort_key`.
    slots: Vec<AvailabilitySlot>,
    /// First index whose date is `>= from`.
    start: usize,
}

impl OpenSlots {
    fn new(mut slots: Vec<AvailabilitySlot>, from: NaiveDate) -> Self {
        slots.sort_by_key(|s| s.sort_key());
        let start = slots.partition_point(|s| s.date < from);
        Self { slots, start }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AvailabilitySlot> + '_ {
        self.slots[self.start..].iter().filter(|s| !s.claimed)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<AvailabilitySlot> {
        self.iter().cloned().collect()
    }
}

impl Engine {
    pub async fn list_open_slots(
        &self,
        counselor_id: Ulid,
        from: NaiveDate,
    ) -> Result<OpenSlots, EngineError> {
        let slots = self.store.slots_for_counselor(counselor_id).await?;
        Ok(OpenSlots::new(slots, from))
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        self.store
            .slot(slot_id)
            .await?
            .ok_or(EngineError::SlotNotFound(slot_id))
    }

    pub async fn publish_slot(
        &self,
        counselor_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<AvailabilitySlot, EngineError> {
        if start_time >= end_time {
            return Err(EngineError::InvalidRange {
                start: start_time,
                end: end_time,
            });
        }
        let starts_at = date.and_time(start_time);
        if starts_at < self.clock.now_naive() {
            return Err(EngineError::InThePast { starts_at });
        }

        self.detached(move |engine| async move {
            let slot = AvailabilitySlot {
                id: Ulid::new(),
                counselor_id,
                date,
                start_time,
                end_time,
                claimed: false,
            };
            if let Err(e) = engine.store.insert_slot(slot.clone()).await {
                if matches!(e, StoreError::Capacity(_)) {
                    warn!("counselor {counselor_id} is at the slot limit");
                }
                return Err(e.into());
            }
            debug!("published slot {} for {counselor_id} at {starts_at}", slot.id);
            Ok(slot)
        })
        .await
    }

    pub async fn remove_slot(&self, slot_id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        self.detached(move |engine| async move {
            match engine.store.remove_slot_if_unclaimed(slot_id).await? {
                Cas::Applied(slot) => {
                    info!("removed slot {slot_id}");
                    Ok(slot)
                }
                Cas::Conflict(_) => Err(EngineError::SlotInUse(slot_id)),
                Cas::Missing => Err(EngineError::SlotNotFound(slot_id)),
            }
        })
        .await
    }

    /// Atomically take an unclaimed slot. Only request creation calls this.
    pub(super) async fn claim_slot(&self, slot_id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        match self.store.set_claimed_if(slot_id, false, true).await? {
            Cas::Applied(slot) => Ok(slot),
            Cas::Conflict(_) => {
                metrics::counter!(observability::SLOT_CLAIM_CONFLICTS_TOTAL).increment(1);
                Err(EngineError::AlreadyClaimed(slot_id))
            }
            Cas::Missing => Err(EngineError::SlotNotFound(slot_id)),
        }
    }

    /// Undo `claim_slot` after the request could not be written.
    pub(super) async fn rollback_claim(&self, slot_id: Ulid) {
        metrics::counter!(observability::CLAIM_ROLLBACKS_TOTAL).increment(1);
        match self.store.release_claim(slot_id).await {
            Ok(Cas::Applied(_)) => debug!("rolled back claim on slot {slot_id}"),
            Ok(other) => warn!("claim rollback on slot {slot_id} found {other:?}"),
            Err(e) => tracing::error!("claim rollback on slot {slot_id} failed, slot stays claimed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(date: &str, start: &str, claimed: bool) -> AvailabilitySlot {
        AvailabilitySlot {
            id: Ulid::new(),
            counselor_id: Ulid::nil(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            start_time: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end_time: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            claimed,
        }
    }

    #[test]
    fn open_slots_skip_earlier_dates_and_claimed() {
        let from = NaiveDate::from_ymd_opt(2025, 12, 28).unwrap();
        let open = OpenSlots::new(
            vec![
                slot("2025-12-29", "08:00", false),
                slot("2025-12-27", "09:00", false),
                slot("2025-12-28", "10:00", true),
                slot("2025-12-28", "09:00", false),
            ],
            from,
        );
        let got: Vec<_> = open
            .iter()
            .map(|s| (s.date.to_string(), s.start_time.format("%H:%M").to_string()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("2025-12-28".to_string(), "09:00".to_string()),
                ("2025-12-29".to_string(), "08:00".to_string()),
            ]
        );
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn open_slots_are_restartable() {
        let from = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let open = OpenSlots::new(vec![slot("2030-01-02", "09:00", false)], from);
        assert_eq!(open.iter().count(), 1);
        assert_eq!(open.iter().count(), 1);
        assert_eq!(open.to_vec().len(), 1);
    }

    #[test]
    fn open_slots_all_before_from_is_empty() {
        let from = NaiveDate::from_ymd_opt(2031, 1, 1).unwrap();
        let open = OpenSlots::new(vec![slot("2030-01-02", "09:00", false)], from);
        assert!(open.is_empty());
    }
}
