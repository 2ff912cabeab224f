use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::Cas;

use super::{Engine, EngineError};

impl Engine {
    /// Claim `slot_id` and record a pending request against it.
    ///
    /// Claim and insert form one unit: if the insert fails the claim is
    /// released again, so a slot is never left claimed without a request.
    pub async fn create_request(
        &self,
        requester_id: Ulid,
        counselor_id: Ulid,
        slot_id: Ulid,
        agenda: &str,
    ) -> Result<MeetingRequest, EngineError> {
        let agenda = agenda.trim();
        if agenda.is_empty() {
            return Err(EngineError::EmptyAgenda);
        }
        if agenda.len() > MAX_AGENDA_LEN {
            return Err(EngineError::LimitExceeded("agenda too long"));
        }
        let agenda = agenda.to_string();

        self.detached(move |engine| async move {
            let slot = engine.get_slot(slot_id).await?;
            if slot.counselor_id != counselor_id {
                return Err(EngineError::SlotNotFound(slot_id));
            }

            let slot = engine.claim_slot(slot_id).await.map_err(|e| match e {
                EngineError::AlreadyClaimed(id) => EngineError::SlotUnavailable(id),
                other => other,
            })?;

            let now = engine.clock.now_ms();
            let request = MeetingRequest {
                id: Ulid::new(),
                requester_id,
                owner_id: counselor_id,
                availability_slot_id: Some(slot.id),
                agenda,
                status: RequestStatus::Pending,
                rejection_reason: None,
                meeting_reference: None,
                requested_date: Some(slot.date),
                requested_time: Some(slot.start_time),
                created_at: now,
                updated_at: now,
            };

            if let Err(e) = engine.store.insert_request(request.clone()).await {
                engine.rollback_claim(slot_id).await;
                return Err(e.into());
            }

            metrics::counter!(observability::REQUESTS_CREATED_TOTAL).increment(1);
            info!(
                "request {} from {requester_id} claimed slot {slot_id} of {counselor_id}",
                request.id
            );
            Ok(request)
        })
        .await
    }

    pub async fn get_request(&self, request_id: Ulid) -> Result<MeetingRequest, EngineError> {
        self.store
            .request(request_id)
            .await?
            .ok_or(EngineError::RequestNotFound(request_id))
    }

    /// Pending → Accepted. The slot stays claimed.
    pub async fn accept(
        &self,
        request_id: Ulid,
        meeting_reference: &str,
    ) -> Result<MeetingRequest, EngineError> {
        let reference = meeting_reference.trim().to_string();
        self.resolve(request_id, Resolution::Accept {
            meeting_reference: reference,
        })
        .await
    }

    /// Pending → Rejected. The slot is not reopened.
    pub async fn reject(&self, request_id: Ulid, reason: &str) -> Result<MeetingRequest, EngineError> {
        let reason = reason.trim().to_string();
        self.resolve(request_id, Resolution::Reject { reason }).await
    }

    async fn resolve(
        &self,
        request_id: Ulid,
        resolution: Resolution,
    ) -> Result<MeetingRequest, EngineError> {
        self.detached(move |engine| async move {
            let target = resolution.status();
            let current = engine.get_request(request_id).await?;
            if !current.status.can_transition_to(target) {
                return Err(EngineError::NotPending {
                    id: request_id,
                    status: current.status,
                });
            }
            validate_resolution(&resolution)?;

            let at = engine.clock.now_ms();
            match engine
                .store
                .resolve_request_if(request_id, RequestStatus::Pending, resolution, at)
                .await?
            {
                Cas::Applied(request) => {
                    metrics::counter!(observability::REQUEST_TRANSITIONS_TOTAL, "to" => target.as_str())
                        .increment(1);
                    info!("request {request_id} {target}");
                    Ok(request)
                }
                Cas::Conflict(current) => {
                    debug!("request {request_id} lost transition race to {}", current.status);
                    Err(EngineError::InvalidTransition {
                        id: request_id,
                        from: current.status,
                        to: target,
                    })
                }
                Cas::Missing => Err(EngineError::RequestNotFound(request_id)),
            }
        })
        .await
    }
}

fn validate_resolution(resolution: &Resolution) -> Result<(), EngineError> {
    match resolution {
        Resolution::Accept { meeting_reference } => {
            if meeting_reference.is_empty() {
                return Err(EngineError::EmptyReference);
            }
            if meeting_reference.len() > MAX_REFERENCE_LEN {
                return Err(EngineError::LimitExceeded("meeting reference too long"));
            }
        }
        Resolution::Reject { reason } => {
            if reason.is_empty() {
                return Err(EngineError::EmptyReason);
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("rejection reason too long"));
            }
        }
    }
    Ok(())
}
