use std::collections::HashMap;

use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Which side of a request the caller is on. Decides whose identity is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Viewer {
    Counselor,
    Requester,
}

impl Viewer {
    fn counterpart_of(self, request: &MeetingRequest) -> Ulid {
        match self {
            Viewer::Counselor => request.requester_id,
            Viewer::Requester => request.owner_id,
        }
    }
}

impl Engine {
    /// A counselor's inbound queue, newest first, with requester identities joined.
    pub async fn list_for_counselor(&self, counselor_id: Ulid) -> Result<Vec<RequestView>, EngineError> {
        let requests = self.store.requests_for_owner(counselor_id).await?;
        self.project(requests, Viewer::Counselor).await
    }

    /// A requester's own requests, newest first, with counselor identities joined.
    pub async fn list_for_requester(&self, requester_id: Ulid) -> Result<Vec<RequestView>, EngineError> {
        let requests = self.store.requests_for_requester(requester_id).await?;
        self.project(requests, Viewer::Requester).await
    }

    pub async fn stats(&self, counselor_id: Ulid) -> Result<RequestStats, EngineError> {
        let requests = self.store.requests_for_owner(counselor_id).await?;
        Ok(RequestStats::tally(&requests))
    }

    async fn project(
        &self,
        mut requests: Vec<MeetingRequest>,
        viewer: Viewer,
    ) -> Result<Vec<RequestView>, EngineError> {
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut parties: HashMap<Ulid, Party> = HashMap::new();
        let mut views = Vec::with_capacity(requests.len());
        for request in requests {
            let counterpart_id = viewer.counterpart_of(&request);
            let counterpart = match parties.get(&counterpart_id) {
                Some(party) => party.clone(),
                None => {
                    let party = self.resolve_party(counterpart_id).await?;
                    parties.insert(counterpart_id, party.clone());
                    party
                }
            };
            let slot = self.slot_window(&request).await?;
            views.push(RequestView {
                request,
                counterpart,
                slot,
            });
        }
        Ok(views)
    }

    async fn resolve_party(&self, id: Ulid) -> Result<Party, EngineError> {
        match self.directory.lookup(id).await? {
            Some(identity) => Ok(identity.into()),
            None => {
                warn!("identity {id} not in directory, returning partial view");
                Ok(Party::unknown(id))
            }
        }
    }

    async fn slot_window(&self, request: &MeetingRequest) -> Result<Option<SlotWindow>, EngineError> {
        if let Some(slot_id) = request.availability_slot_id
            && let Some(slot) = self.store.slot(slot_id).await?
        {
            return Ok(Some(slot.window()));
        }
        Ok(match (request.requested_date, request.requested_time) {
            (Some(date), Some(start_time)) => Some(SlotWindow {
                date,
                start_time,
                end_time: None,
            }),
            _ => None,
        })
    }
}
