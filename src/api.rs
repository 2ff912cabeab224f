//! Transport-agnostic request/response surface over the engine.

use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListOpenSlots {
        counselor_id: Ulid,
        from: NaiveDate,
    },
    PublishSlot {
        counselor_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    },
    RemoveSlot {
        slot_id: Ulid,
    },
    CreateMeetingRequest {
        requester_id: Ulid,
        counselor_id: Ulid,
        slot_id: Ulid,
        agenda: String,
    },
    AcceptMeetingRequest {
        request_id: Ulid,
        meeting_reference: String,
    },
    RejectMeetingRequest {
        request_id: Ulid,
        reason: String,
    },
    ListCounselorRequests {
        counselor_id: Ulid,
    },
    ListRequesterRequests {
        requester_id: Ulid,
    },
    GetStats {
        counselor_id: Ulid,
    },
    GetRequest {
        request_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Slots(Vec<AvailabilitySlot>),
    Slot(AvailabilitySlot),
    Request(MeetingRequest),
    Requests(Vec<RequestView>),
    Stats(RequestStats),
}

impl Engine {
    pub async fn execute(&self, cmd: Command) -> Result<Outcome, EngineError> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.dispatch(cmd).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, cmd: Command) -> Result<Outcome, EngineError> {
        match cmd {
            Command::ListOpenSlots { counselor_id, from } => {
                let open = self.list_open_slots(counselor_id, from).await?;
                Ok(Outcome::Slots(open.to_vec()))
            }
            Command::PublishSlot {
                counselor_id,
                date,
                start_time,
                end_time,
            } => self
                .publish_slot(counselor_id, date, start_time, end_time)
                .await
                .map(Outcome::Slot),
            Command::RemoveSlot { slot_id } => self.remove_slot(slot_id).await.map(Outcome::Slot),
            Command::CreateMeetingRequest {
                requester_id,
                counselor_id,
                slot_id,
                agenda,
            } => self
                .create_request(requester_id, counselor_id, slot_id, &agenda)
                .await
                .map(Outcome::Request),
            Command::AcceptMeetingRequest {
                request_id,
                meeting_reference,
            } => self
                .accept(request_id, &meeting_reference)
                .await
                .map(Outcome::Request),
            Command::RejectMeetingRequest { request_id, reason } => {
                self.reject(request_id, &reason).await.map(Outcome::Request)
            }
            Command::ListCounselorRequests { counselor_id } => self
                .list_for_counselor(counselor_id)
                .await
                .map(Outcome::Requests),
            Command::ListRequesterRequests { requester_id } => self
                .list_for_requester(requester_id)
                .await
                .map(Outcome::Requests),
            Command::GetStats { counselor_id } => self.stats(counselor_id).await.map(Outcome::Stats),
            Command::GetRequest { request_id } => {
                self.get_request(request_id).await.map(Outcome::Request)
            }
        }
    }
}
