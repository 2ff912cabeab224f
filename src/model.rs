use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every stored timestamp uses this.
pub type Ms = i64;

/// A block of counselor time that a single meeting request can claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: Ulid,
    pub counselor_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// True while a pending or accepted request references this slot.
    pub claimed: bool,
}

impl AvailabilitySlot {
    /// Listing order: date, then start time, then id for a stable tiebreak.
    pub fn sort_key(&self) -> (NaiveDate, NaiveTime, Ulid) {
        (self.date, self.start_time, self.id)
    }

    pub fn window(&self) -> SlotWindow {
        SlotWindow {
            date: self.date,
            start_time: self.start_time,
            end_time: Some(self.end_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// Only `Pending` has outgoing edges.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Accepted)
                | (RequestStatus::Pending, RequestStatus::Rejected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The side-effect data carried by a terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Accept { meeting_reference: String },
    Reject { reason: String },
}

impl Resolution {
    pub fn status(&self) -> RequestStatus {
        match self {
            Resolution::Accept { .. } => RequestStatus::Accepted,
            Resolution::Reject { .. } => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    /// The counselor who owns the slot and decides the request.
    pub owner_id: Ulid,
    pub availability_slot_id: Option<Ulid>,
    pub agenda: String,
    pub status: RequestStatus,
    /// Present iff `status == Rejected`.
    pub rejection_reason: Option<String>,
    /// Present iff `status == Accepted`.
    pub meeting_reference: Option<String>,
    /// Copied from the slot at creation so later slot changes don't rewrite history.
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl MeetingRequest {
    /// Pending and accepted requests hold their slot.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, RequestStatus::Rejected)
    }

    /// Apply a terminal transition. The caller has already checked the guard.
    pub fn apply_resolution(&mut self, resolution: &Resolution, at: Ms) {
        self.status = resolution.status();
        match resolution {
            Resolution::Accept { meeting_reference } => {
                self.meeting_reference = Some(meeting_reference.clone());
                self.rejection_reason = None;
            }
            Resolution::Reject { reason } => {
                self.rejection_reason = Some(reason.clone());
                self.meeting_reference = None;
            }
        }
        self.updated_at = at;
    }
}

/// Display record from the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

/// WAL record format. One variant per store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotPublished {
        slot: AvailabilitySlot,
    },
    SlotRemoved {
        id: Ulid,
    },
    SlotClaimed {
        id: Ulid,
    },
    SlotReleased {
        id: Ulid,
    },
    RequestCreated {
        request: MeetingRequest,
    },
    RequestResolved {
        id: Ulid,
        resolution: Resolution,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// The other party of a request. Name and email are absent when the
/// directory no longer knows the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub id: Ulid,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Party {
    pub fn unknown(id: Ulid) -> Self {
        Self {
            id,
            name: None,
            email: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.name.is_some()
    }
}

impl From<Identity> for Party {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            name: Some(identity.name),
            email: Some(identity.email),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Unknown when the slot record is gone and only the request's copy remains.
    pub end_time: Option<NaiveTime>,
}

/// A request joined with the counterpart's identity and slot display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub request: MeetingRequest,
    pub counterpart: Party,
    pub slot: Option<SlotWindow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub total: usize,
    pub pending: usize,
    pub accepted: usize,
    pub rejected: usize,
}

impl RequestStats {
    pub fn tally<'a>(requests: impl IntoIterator<Item = &'a MeetingRequest>) -> Self {
        let mut stats = Self::default();
        for r in requests {
            stats.total += 1;
            match r.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Accepted => stats.accepted += 1,
                RequestStatus::Rejected => stats.rejected += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn pending_request() -> MeetingRequest {
        MeetingRequest {
            id: Ulid::new(),
            requester_id: Ulid::new(),
            owner_id: Ulid::new(),
            availability_slot_id: Some(Ulid::new()),
            agenda: "discuss apps".into(),
            status: RequestStatus::Pending,
            rejection_reason: None,
            meeting_reference: None,
            requested_date: Some(date("2025-12-28")),
            requested_time: Some(time("09:00")),
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[test]
    fn only_pending_has_outgoing_edges() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Pending.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Accepted, Rejected] {
            assert!(terminal.is_terminal());
            for next in [Pending, Accepted, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn accept_sets_reference_and_timestamp() {
        let mut r = pending_request();
        r.apply_resolution(
            &Resolution::Accept {
                meeting_reference: "https://call.example/x".into(),
            },
            2_000,
        );
        assert_eq!(r.status, RequestStatus::Accepted);
        assert_eq!(r.meeting_reference.as_deref(), Some("https://call.example/x"));
        assert_eq!(r.rejection_reason, None);
        assert_eq!(r.updated_at, 2_000);
        assert_eq!(r.created_at, 1_000);
        assert!(r.is_live());
    }

    #[test]
    fn reject_sets_reason_and_releases_liveness() {
        let mut r = pending_request();
        r.apply_resolution(&Resolution::Reject { reason: "conflict".into() }, 3_000);
        assert_eq!(r.status, RequestStatus::Rejected);
        assert_eq!(r.rejection_reason.as_deref(), Some("conflict"));
        assert_eq!(r.meeting_reference, None);
        assert!(!r.is_live());
    }

    #[test]
    fn slot_sort_key_orders_by_date_then_time() {
        let counselor = Ulid::new();
        let mk = |d: &str, t: &str| AvailabilitySlot {
            id: Ulid::new(),
            counselor_id: counselor,
            date: date(d),
            start_time: time(t),
            end_time: time("23:00"),
            claimed: false,
        };
        let mut slots = vec![
            mk("2025-12-29", "08:00"),
            mk("2025-12-28", "10:00"),
            mk("2025-12-28", "09:00"),
        ];
        slots.sort_by_key(|s| s.sort_key());
        assert_eq!(slots[0].start_time, time("09:00"));
        assert_eq!(slots[1].start_time, time("10:00"));
        assert_eq!(slots[2].date, date("2025-12-29"));
    }

    #[test]
    fn stats_tally_partitions() {
        let mut a = pending_request();
        a.apply_resolution(&Resolution::Accept { meeting_reference: "x".into() }, 1);
        let mut b = pending_request();
        b.apply_resolution(&Resolution::Reject { reason: "y".into() }, 1);
        let c = pending_request();
        let stats = RequestStats::tally([&a, &b, &c]);
        assert_eq!(
            stats,
            RequestStats {
                total: 3,
                pending: 1,
                accepted: 1,
                rejected: 1
            }
        );
    }

    #[test]
    fn party_from_identity() {
        let id = Ulid::new();
        let party: Party = Identity {
            id,
            name: "Ada".into(),
            email: "ada@example.edu".into(),
        }
        .into();
        assert!(party.is_resolved());
        assert!(!Party::unknown(id).is_resolved());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RequestCreated {
            request: pending_request(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
