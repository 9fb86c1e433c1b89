use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use accredit_core::clock::Clock;
use accredit_core::event::EventBus;
use accredit_core::types::WorkflowEvent;

/// JSONL journal of engine events.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{dir}/{YYYYMMDD}.jsonl`, switching files when the day changes. Lines are
/// flushed as they are written, so a crash loses at most the event in
/// flight. A notification dispatcher can tail these files.
pub struct EventJournal {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    event_type: &'static str,
    participant_id: &'a str,
    detail: &'a WorkflowEvent,
}

struct DayFile {
    day: String,
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
}

impl EventJournal {
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { dir, clock }
    }

    /// Subscribe now and write in a background task until `cancel` fires.
    ///
    /// Subscribing before the task starts means no event published after
    /// this call returns is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!(error = %e, dir = %self.dir.display(), "Failed to create journal directory");
            return;
        }
        info!(dir = %self.dir.display(), "Event journal started");

        let mut current: Option<DayFile> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Event journal cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Err(e) = self.append(&mut current, &event).await {
                                error!(error = %e, "Failed to write journal entry");
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Event journal lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, event journal stopping");
                            break;
                        }
                    }
                }
            }
        }

        // Drain what was published before cancellation.
        while let Ok(event) = rx.try_recv() {
            if self.append(&mut current, &event).await.is_err() {
                break;
            }
        }

        if let Some(mut file) = current {
            file.writer.flush().await.ok();
            debug!(path = %file.path.display(), "Event journal finished");
        }
    }

    async fn append(&self, current: &mut Option<DayFile>, event: &WorkflowEvent) -> std::io::Result<()> {
        let now = self.clock.now();
        let day = now.format("%Y%m%d").to_string();

        if current.as_ref().map(|f| f.day.as_str()) != Some(day.as_str()) {
            if let Some(mut previous) = current.take() {
                previous.writer.flush().await?;
            }
            *current = Some(DayFile::open(&self.dir, day).await?);
        }

        let entry = JournalEntry {
            timestamp: now.to_rfc3339(),
            event_type: event.kind(),
            participant_id: event.participant_id().as_str(),
            detail: event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        if let Some(file) = current.as_mut() {
            file.writer.write_all(line.as_bytes()).await?;
            file.writer.flush().await?;
        }
        Ok(())
    }
}

impl DayFile {
    async fn open(dir: &Path, day: String) -> std::io::Result<Self> {
        let path = dir.join(format!("{}.jsonl", day));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "Journal file opened");
        Ok(Self {
            day,
            path,
            writer: BufWriter::new(file),
        })
    }
}
