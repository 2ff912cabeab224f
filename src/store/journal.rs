use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

use super::StoreError;

enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Handle to the task that owns the WAL. Appends that arrive while a flush
/// is in progress are committed together with a single fsync.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<JournalCommand>,
}

impl Journal {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn start(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    pub async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?;
        rx.await
            .map_err(|_| StoreError::Journal("writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn compact(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Compact { events, response }).await?;
        rx.await
            .map_err(|_| StoreError::Journal("writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: JournalCommand) -> Result<(), StoreError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::Journal("writer shut down".into()))
    }
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        // Drain whatever is already queued into the same commit.
        while let Ok(next) = rx.try_recv() {
            match next {
                JournalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("journal writer for {} stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let (events, senders): (Vec<Event>, Vec<_>) = batch.into_iter().unzip();
    let result = wal.commit(&events);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("journal commit of {} events failed: {e}", events.len());
    }
    for tx in senders {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}
