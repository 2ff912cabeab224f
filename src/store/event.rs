use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_SLOTS_PER_COUNSELOR;
use crate::model::*;
use crate::wal::Wal;

use super::{Cas, Journal, Store, StoreError};

type Cell<T> = Arc<Mutex<T>>;

/// Event-sourced store: records in memory, durability from an optional WAL.
///
/// Each record sits behind its own async mutex. A conditional update holds
/// that mutex across guard check, journal append and apply, so two writers
/// on the same record are serialized while different records proceed in
/// parallel and share group commits.
pub struct EventStore {
    slots: DashMap<Ulid, Cell<AvailabilitySlot>>,
    requests: DashMap<Ulid, Cell<MeetingRequest>>,
    slots_by_counselor: DashMap<Ulid, Vec<Ulid>>,
    requests_by_owner: DashMap<Ulid, Vec<Ulid>>,
    requests_by_requester: DashMap<Ulid, Vec<Ulid>>,
    max_slots_per_counselor: usize,
    journal: Option<Journal>,
    /// Shared by mutations, exclusive for compaction.
    gate: RwLock<()>,
}

impl EventStore {
    /// A store with no WAL. State is lost on drop.
    pub fn ephemeral() -> Self {
        Self::from_records(HashMap::new(), HashMap::new(), None)
    }

    /// Replay the WAL at `path` (if any) and journal every later mutation to it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (mut slots, requests) = fold_events(&events);
        let orphans = release_orphaned_claims(&mut slots, &requests);
        if orphans > 0 {
            tracing::warn!("released {orphans} claimed slots with no request in {}", path.display());
        }
        let journal = Journal::start(wal);
        tracing::info!(
            "opened {} ({} events, {} slots, {} requests)",
            path.display(),
            events.len(),
            slots.len(),
            requests.len()
        );
        Ok(Self::from_records(slots, requests, Some(journal)))
    }

    #[cfg(test)]
    pub(crate) fn with_slot_limit(mut self, max_slots_per_counselor: usize) -> Self {
        self.max_slots_per_counselor = max_slots_per_counselor;
        self
    }

    fn from_records(
        slots: HashMap<Ulid, AvailabilitySlot>,
        requests: HashMap<Ulid, MeetingRequest>,
        journal: Option<Journal>,
    ) -> Self {
        let store = Self {
            slots: DashMap::new(),
            requests: DashMap::new(),
            slots_by_counselor: DashMap::new(),
            requests_by_owner: DashMap::new(),
            requests_by_requester: DashMap::new(),
            max_slots_per_counselor: MAX_SLOTS_PER_COUNSELOR,
            journal,
            gate: RwLock::new(()),
        };
        for slot in slots.into_values() {
            store.index_slot(&slot);
            store.slots.insert(slot.id, Arc::new(Mutex::new(slot)));
        }
        for request in requests.into_values() {
            store.index_request(&request);
            store.requests.insert(request.id, Arc::new(Mutex::new(request)));
        }
        store
    }

    async fn commit(&self, event: &Event) -> Result<(), StoreError> {
        match &self.journal {
            Some(journal) => journal.append(event).await,
            None => Ok(()),
        }
    }

    fn index_slot(&self, slot: &AvailabilitySlot) {
        self.slots_by_counselor
            .entry(slot.counselor_id)
            .or_default()
            .push(slot.id);
    }

    fn index_request(&self, request: &MeetingRequest) {
        self.requests_by_owner
            .entry(request.owner_id)
            .or_default()
            .push(request.id);
        self.requests_by_requester
            .entry(request.requester_id)
            .or_default()
            .push(request.id);
    }

    /// Lock a slot cell, returning `None` if the slot was removed while we waited.
    async fn lock_slot(&self, id: Ulid) -> Option<OwnedMutexGuard<AvailabilitySlot>> {
        let cell = self.slots.get(&id).map(|e| e.value().clone())?;
        let guard = cell.clone().lock_owned().await;
        let live = self
            .slots
            .get(&id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &cell));
        live.then_some(guard)
    }

    async fn lock_request(&self, id: Ulid) -> Option<OwnedMutexGuard<MeetingRequest>> {
        let cell = self.requests.get(&id).map(|e| e.value().clone())?;
        Some(cell.lock_owned().await)
    }

    async fn read_slot(&self, id: &Ulid) -> Option<AvailabilitySlot> {
        let cell = self.slots.get(id).map(|e| e.value().clone())?;
        let slot = cell.lock().await.clone();
        Some(slot)
    }

    async fn read_request(&self, id: &Ulid) -> Option<MeetingRequest> {
        let cell = self.requests.get(id).map(|e| e.value().clone())?;
        let request = cell.lock().await.clone();
        Some(request)
    }

    async fn read_requests(&self, index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid) -> Vec<MeetingRequest> {
        let ids = index.get(key).map(|e| e.value().clone()).unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(request) = self.read_request(id).await {
                out.push(request);
            }
        }
        out
    }

    /// The minimal event list that recreates the current state.
    async fn snapshot_events(&self) -> Vec<Event> {
        let slot_cells: Vec<Cell<AvailabilitySlot>> =
            self.slots.iter().map(|e| e.value().clone()).collect();
        let request_cells: Vec<Cell<MeetingRequest>> =
            self.requests.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::with_capacity(slot_cells.len() + request_cells.len());
        for cell in slot_cells {
            let slot = cell.lock().await.clone();
            events.push(Event::SlotPublished { slot });
        }
        for cell in request_cells {
            let request = cell.lock().await.clone();
            events.push(Event::RequestCreated { request });
        }
        events
    }
}

/// Replay events into plain maps. Events referencing unknown records are skipped.
fn fold_events(
    events: &[Event],
) -> (HashMap<Ulid, AvailabilitySlot>, HashMap<Ulid, MeetingRequest>) {
    let mut slots = HashMap::new();
    let mut requests = HashMap::new();
    for event in events {
        match event {
            Event::SlotPublished { slot } => {
                slots.insert(slot.id, slot.clone());
            }
            Event::SlotRemoved { id } => {
                slots.remove(id);
            }
            Event::SlotClaimed { id } => {
                if let Some(slot) = slots.get_mut(id) {
                    slot.claimed = true;
                }
            }
            Event::SlotReleased { id } => {
                if let Some(slot) = slots.get_mut(id) {
                    slot.claimed = false;
                }
            }
            Event::RequestCreated { request } => {
                requests.insert(request.id, request.clone());
            }
            Event::RequestResolved { id, resolution, at } => {
                if let Some(request) = requests.get_mut(id) {
                    request.apply_resolution(resolution, *at);
                }
            }
        }
    }
    (slots, requests)
}

/// Clear `claimed` on slots no request points at. A crash or a failed journal
/// write between claim and request insert leaves such slots behind.
fn release_orphaned_claims(
    slots: &mut HashMap<Ulid, AvailabilitySlot>,
    requests: &HashMap<Ulid, MeetingRequest>,
) -> usize {
    let referenced: HashSet<Ulid> = requests
        .values()
        .filter_map(|r| r.availability_slot_id)
        .collect();
    let mut released = 0;
    for slot in slots.values_mut() {
        if slot.claimed && !referenced.contains(&slot.id) {
            slot.claimed = false;
            released += 1;
        }
    }
    released
}

#[async_trait]
impl Store for EventStore {
    async fn insert_slot(&self, slot: AvailabilitySlot) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        // Limit check and reservation under one shard lock.
        {
            let mut ids = self.slots_by_counselor.entry(slot.counselor_id).or_default();
            if ids.len() >= self.max_slots_per_counselor {
                return Err(StoreError::Capacity("too many slots for counselor"));
            }
            ids.push(slot.id);
        }
        if let Err(e) = self.commit(&Event::SlotPublished { slot: slot.clone() }).await {
            if let Some(mut ids) = self.slots_by_counselor.get_mut(&slot.counselor_id) {
                ids.retain(|s| *s != slot.id);
            }
            return Err(e);
        }
        self.slots.insert(slot.id, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    async fn slot(&self, id: Ulid) -> Result<Option<AvailabilitySlot>, StoreError> {
        Ok(self.read_slot(&id).await)
    }

    async fn slots_for_counselor(
        &self,
        counselor_id: Ulid,
    ) -> Result<Vec<AvailabilitySlot>, StoreError> {
        let ids = self
            .slots_by_counselor
            .get(&counselor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(slot) = self.read_slot(id).await {
                out.push(slot);
            }
        }
        Ok(out)
    }

    async fn set_claimed_if(
        &self,
        id: Ulid,
        expected: bool,
        claimed: bool,
    ) -> Result<Cas<AvailabilitySlot>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(mut slot) = self.lock_slot(id).await else {
            return Ok(Cas::Missing);
        };
        if slot.claimed != expected {
            return Ok(Cas::Conflict(slot.clone()));
        }
        if expected != claimed {
            let event = if claimed {
                Event::SlotClaimed { id }
            } else {
                Event::SlotReleased { id }
            };
            self.commit(&event).await?;
            slot.claimed = claimed;
        }
        Ok(Cas::Applied(slot.clone()))
    }

    async fn release_claim(&self, id: Ulid) -> Result<Cas<AvailabilitySlot>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(mut slot) = self.lock_slot(id).await else {
            return Ok(Cas::Missing);
        };
        if !slot.claimed {
            return Ok(Cas::Conflict(slot.clone()));
        }
        if let Err(e) = self.commit(&Event::SlotReleased { id }).await {
            tracing::warn!("release of slot {id} not journaled, replay will release it: {e}");
        }
        slot.claimed = false;
        Ok(Cas::Applied(slot.clone()))
    }

    async fn remove_slot_if_unclaimed(&self, id: Ulid) -> Result<Cas<AvailabilitySlot>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(slot) = self.lock_slot(id).await else {
            return Ok(Cas::Missing);
        };
        if slot.claimed {
            return Ok(Cas::Conflict(slot.clone()));
        }
        self.commit(&Event::SlotRemoved { id }).await?;
        // Removed while still holding the cell lock so waiters see it as gone.
        self.slots.remove(&id);
        if let Some(mut ids) = self.slots_by_counselor.get_mut(&slot.counselor_id) {
            ids.retain(|s| *s != id);
        }
        Ok(Cas::Applied(slot.clone()))
    }

    async fn insert_request(&self, request: MeetingRequest) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.commit(&Event::RequestCreated {
            request: request.clone(),
        })
        .await?;
        self.index_request(&request);
        self.requests.insert(request.id, Arc::new(Mutex::new(request)));
        Ok(())
    }

    async fn request(&self, id: Ulid) -> Result<Option<MeetingRequest>, StoreError> {
        Ok(self.read_request(&id).await)
    }

    async fn requests_for_owner(&self, owner_id: Ulid) -> Result<Vec<MeetingRequest>, StoreError> {
        Ok(self.read_requests(&self.requests_by_owner, &owner_id).await)
    }

    async fn requests_for_requester(
        &self,
        requester_id: Ulid,
    ) -> Result<Vec<MeetingRequest>, StoreError> {
        Ok(self
            .read_requests(&self.requests_by_requester, &requester_id)
            .await)
    }

    async fn resolve_request_if(
        &self,
        id: Ulid,
        expected: RequestStatus,
        resolution: Resolution,
        at: Ms,
    ) -> Result<Cas<MeetingRequest>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(mut request) = self.lock_request(id).await else {
            return Ok(Cas::Missing);
        };
        if request.status != expected {
            return Ok(Cas::Conflict(request.clone()));
        }
        let event = Event::RequestResolved {
            id,
            resolution,
            at,
        };
        self.commit(&event).await?;
        if let Event::RequestResolved { resolution, .. } = &event {
            request.apply_resolution(resolution, at);
        }
        Ok(Cas::Applied(request.clone()))
    }

    async fn compact(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _gate = self.gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();
        journal.compact(events).await?;
        tracing::info!("compacted journal to {count} events");
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        match &self.journal {
            Some(journal) => journal.appends_since_compact().await,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn tmp_wal(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("counsel_desk_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn slot(counselor: Ulid) -> AvailabilitySlot {
        AvailabilitySlot {
            id: Ulid::new(),
            counselor_id: counselor,
            date: NaiveDate::from_ymd_opt(2030, 3, 4).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            claimed: false,
        }
    }

    fn request_for(slot: &AvailabilitySlot) -> MeetingRequest {
        MeetingRequest {
            id: Ulid::new(),
            requester_id: Ulid::new(),
            owner_id: slot.counselor_id,
            availability_slot_id: Some(slot.id),
            agenda: "course planning".into(),
            status: RequestStatus::Pending,
            rejection_reason: None,
            meeting_reference: None,
            requested_date: Some(slot.date),
            requested_time: Some(slot.start_time),
            created_at: 10,
            updated_at: 10,
        }
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let store = EventStore::ephemeral();
        let s = slot(Ulid::new());
        store.insert_slot(s.clone()).await.unwrap();

        assert!(store.set_claimed_if(s.id, false, true).await.unwrap().is_applied());
        match store.set_claimed_if(s.id, false, true).await.unwrap() {
            Cas::Conflict(current) => assert!(current.claimed),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(
            store.set_claimed_if(Ulid::new(), false, true).await.unwrap(),
            Cas::Missing
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(EventStore::ephemeral());
        let s = slot(Ulid::new());
        store.insert_slot(s.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_claimed_if(s.id, false, true).await.unwrap().is_applied()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn remove_only_when_unclaimed() {
        let store = EventStore::ephemeral();
        let counselor = Ulid::new();
        let s = slot(counselor);
        store.insert_slot(s.clone()).await.unwrap();
        store.set_claimed_if(s.id, false, true).await.unwrap();

        assert!(matches!(
            store.remove_slot_if_unclaimed(s.id).await.unwrap(),
            Cas::Conflict(_)
        ));

        store.set_claimed_if(s.id, true, false).await.unwrap();
        assert!(store.remove_slot_if_unclaimed(s.id).await.unwrap().is_applied());
        assert_eq!(store.slot(s.id).await.unwrap(), None);
        assert!(store.slots_for_counselor(counselor).await.unwrap().is_empty());
        // A claim racing the removal finds nothing.
        assert_eq!(
            store.set_claimed_if(s.id, false, true).await.unwrap(),
            Cas::Missing
        );
    }

    #[tokio::test]
    async fn resolve_is_guarded_on_status() {
        let store = EventStore::ephemeral();
        let s = slot(Ulid::new());
        let r = request_for(&s);
        store.insert_request(r.clone()).await.unwrap();

        let accepted = store
            .resolve_request_if(
                r.id,
                RequestStatus::Pending,
                Resolution::Accept {
                    meeting_reference: "https://call.example/a".into(),
                },
                20,
            )
            .await
            .unwrap();
        assert!(accepted.is_applied());

        match store
            .resolve_request_if(
                r.id,
                RequestStatus::Pending,
                Resolution::Reject { reason: "late".into() },
                30,
            )
            .await
            .unwrap()
        {
            Cas::Conflict(current) => {
                assert_eq!(current.status, RequestStatus::Accepted);
                assert_eq!(current.updated_at, 20);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn indexes_follow_requests() {
        let store = EventStore::ephemeral();
        let s = slot(Ulid::new());
        let r = request_for(&s);
        store.insert_request(r.clone()).await.unwrap();

        assert_eq!(store.requests_for_owner(r.owner_id).await.unwrap(), vec![r.clone()]);
        assert_eq!(
            store.requests_for_requester(r.requester_id).await.unwrap(),
            vec![r.clone()]
        );
        assert!(store.requests_for_requester(Ulid::new()).await.unwrap().is_empty());
        assert!(store.requests_for_owner(Ulid::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn durable_store_replays() {
        let path = tmp_wal("replay.wal");
        let counselor = Ulid::new();
        let kept = slot(counselor);
        let removed = slot(counselor);
        let r = request_for(&kept);
        {
            let store = EventStore::open(&path).unwrap();
            store.insert_slot(kept.clone()).await.unwrap();
            store.insert_slot(removed.clone()).await.unwrap();
            store.remove_slot_if_unclaimed(removed.id).await.unwrap();
            store.set_claimed_if(kept.id, false, true).await.unwrap();
            store.insert_request(r.clone()).await.unwrap();
            store
                .resolve_request_if(
                    r.id,
                    RequestStatus::Pending,
                    Resolution::Reject { reason: "conflict".into() },
                    99,
                )
                .await
                .unwrap();
        }

        let store = EventStore::open(&path).unwrap();
        let slots = store.slots_for_counselor(counselor).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert!(slots[0].claimed);
        let replayed = store.request(r.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, RequestStatus::Rejected);
        assert_eq!(replayed.rejection_reason.as_deref(), Some("conflict"));
        assert_eq!(replayed.updated_at, 99);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = tmp_wal("compact.wal");
        let counselor = Ulid::new();
        let s = slot(counselor);
        {
            let store = EventStore::open(&path).unwrap();
            for _ in 0..10 {
                let churn = slot(counselor);
                store.insert_slot(churn.clone()).await.unwrap();
                store.remove_slot_if_unclaimed(churn.id).await.unwrap();
            }
            store.insert_slot(s.clone()).await.unwrap();
            store.set_claimed_if(s.id, false, true).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 22);

            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
        let store = EventStore::open(&path).unwrap();
        let replayed = store.slot(s.id).await.unwrap().unwrap();
        assert!(replayed.claimed);
    }

    #[tokio::test]
    async fn slot_limit_holds_under_concurrent_inserts() {
        let store = Arc::new(EventStore::ephemeral().with_slot_limit(5));
        let counselor = Ulid::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.insert_slot(slot(counselor)).await }));
        }
        let mut inserted = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => inserted += 1,
                Err(e) => assert_eq!(e, StoreError::Capacity("too many slots for counselor")),
            }
        }
        assert_eq!(inserted, 5);
        assert_eq!(store.slots_for_counselor(counselor).await.unwrap().len(), 5);

        // Another counselor has their own budget.
        store.insert_slot(slot(Ulid::new())).await.unwrap();
    }

    #[tokio::test]
    async fn removal_frees_slot_budget() {
        let store = EventStore::ephemeral().with_slot_limit(1);
        let counselor = Ulid::new();
        let first = slot(counselor);
        store.insert_slot(first.clone()).await.unwrap();
        assert!(store.insert_slot(slot(counselor)).await.is_err());

        store.remove_slot_if_unclaimed(first.id).await.unwrap();
        store.insert_slot(slot(counselor)).await.unwrap();
    }

    #[tokio::test]
    async fn release_claim_survives_journal_failure() {
        let path = tmp_wal("release_down.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.inject_fault(0);

        let mut claimed = slot(Ulid::new());
        claimed.claimed = true;
        let store = EventStore::from_records(
            HashMap::from([(claimed.id, claimed.clone())]),
            HashMap::new(),
            Some(Journal::start(wal)),
        );

        let released = store.release_claim(claimed.id).await.unwrap();
        assert!(released.is_applied());
        assert!(!store.slot(claimed.id).await.unwrap().unwrap().claimed);
        assert!(matches!(
            store.release_claim(claimed.id).await.unwrap(),
            Cas::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn replay_releases_claims_without_requests() {
        let path = tmp_wal("orphan.wal");
        let counselor = Ulid::new();
        let orphan = slot(counselor);
        let booked = slot(counselor);
        let r = request_for(&booked);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.commit(&[
                Event::SlotPublished { slot: orphan.clone() },
                Event::SlotPublished { slot: booked.clone() },
                Event::SlotClaimed { id: orphan.id },
                Event::SlotClaimed { id: booked.id },
                Event::RequestCreated { request: r },
            ])
            .unwrap();
        }

        let store = EventStore::open(&path).unwrap();
        assert!(!store.slot(orphan.id).await.unwrap().unwrap().claimed);
        assert!(store.slot(booked.id).await.unwrap().unwrap().claimed);
    }

    #[tokio::test]
    async fn reopen_after_torn_tail_keeps_new_writes() {
        let path = tmp_wal("torn_reopen.wal");
        let counselor = Ulid::new();
        let first = slot(counselor);
        {
            let store = EventStore::open(&path).unwrap();
            store.insert_slot(first.clone()).await.unwrap();
        }
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200u8, 0, 0, 0, 7]).unwrap();
        }
        let second = slot(counselor);
        {
            let store = EventStore::open(&path).unwrap();
            store.insert_slot(second.clone()).await.unwrap();
        }

        let store = EventStore::open(&path).unwrap();
        assert_eq!(store.slots_for_counselor(counselor).await.unwrap().len(), 2);
    }

    #[test]
    fn fold_skips_events_for_unknown_records() {
        let (slots, requests) = fold_events(&[
            Event::SlotClaimed { id: Ulid::new() },
            Event::RequestResolved {
                id: Ulid::new(),
                resolution: Resolution::Reject { reason: "x".into() },
                at: 1,
            },
        ]);
        assert!(slots.is_empty());
        assert!(requests.is_empty());
    }
}
