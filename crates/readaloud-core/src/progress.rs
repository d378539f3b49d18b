//! Debounced persistence of the reading position.
//!
//! A writer thread owns all backend writes so the control thread never waits
//! on storage except for an explicit [`ProgressStore::flush`].

use crate::capabilities::ProgressBackend;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FLUSH_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub book_id: String,
    pub chapter_index: usize,
    pub unit_index: usize,
    /// UTF-16 code units into the unit's text.
    pub char_offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingWrite {
    record: ProgressRecord,
    fraction: f64,
}

enum WriterMsg {
    Record(PendingWrite),
    Flush(Sender<()>),
    Reset {
        book_id: String,
        chapter_index: usize,
        done: Sender<()>,
    },
    Shutdown,
}

pub struct ProgressStore {
    backend: Arc<dyn ProgressBackend>,
    tx: Sender<WriterMsg>,
    writer: Option<JoinHandle<()>>,
}

impl ProgressStore {
    pub fn spawn(backend: Arc<dyn ProgressBackend>, debounce: Duration) -> Self {
        let (tx, rx) = unbounded();
        let writer_backend = Arc::clone(&backend);
        let writer = std::thread::Builder::new()
            .name("progress-writer".to_string())
            .spawn(move || writer_loop(writer_backend, rx, debounce))
            .map_err(|err| warn!("Failed to spawn progress writer: {err}"))
            .ok();
        Self {
            backend,
            tx,
            writer,
        }
    }

    /// Last persisted record for a chapter. Storage errors read as "none".
    pub fn load(&self, book_id: &str, chapter_index: usize) -> Option<ProgressRecord> {
        match self.backend.load(book_id, chapter_index) {
            Ok(record) => record,
            Err(err) => {
                warn!(book_id, chapter_index, "Failed to load progress: {err:#}");
                None
            }
        }
    }

    pub fn backend(&self) -> Arc<dyn ProgressBackend> {
        Arc::clone(&self.backend)
    }

    /// Queue a debounced write of `record` with its fractional position.
    pub fn record(&self, record: ProgressRecord, fraction: f64) {
        if self.writer.is_none() {
            write_now(self.backend.as_ref(), &PendingWrite { record, fraction });
            return;
        }
        let _ = self
            .tx
            .send(WriterMsg::Record(PendingWrite { record, fraction }));
    }

    /// Persist any pending record now and wait for the backend.
    pub fn flush(&self) {
        let (done_tx, done_rx) = bounded(1);
        if self.tx.send(WriterMsg::Flush(done_tx)).is_err() || self.writer.is_none() {
            return;
        }
        if done_rx.recv_timeout(FLUSH_WAIT).is_err() {
            warn!("Timed out waiting for progress flush");
        }
    }

    /// Drop any pending write and clear the stored record for a chapter.
    pub fn reset(&self, book_id: &str, chapter_index: usize) {
        if self.writer.is_none() {
            clear_now(self.backend.as_ref(), book_id, chapter_index);
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        let msg = WriterMsg::Reset {
            book_id: book_id.to_string(),
            chapter_index,
            done: done_tx,
        };
        if self.tx.send(msg).is_ok() && done_rx.recv_timeout(FLUSH_WAIT).is_err() {
            warn!(chapter_index, "Timed out waiting for progress reset");
        }
    }
}

impl Drop for ProgressStore {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterMsg::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn writer_loop(backend: Arc<dyn ProgressBackend>, rx: Receiver<WriterMsg>, debounce: Duration) {
    let mut pending: Option<PendingWrite> = None;
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = match deadline {
            Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(write) = pending.take() {
                        write_now(backend.as_ref(), &write);
                    }
                    deadline = None;
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => WriterMsg::Shutdown,
            },
            None => rx.recv().unwrap_or(WriterMsg::Shutdown),
        };
        match msg {
            WriterMsg::Record(write) => {
                pending = Some(write);
                // Each newer record pushes the write out again.
                deadline = Some(Instant::now() + debounce);
            }
            WriterMsg::Flush(done) => {
                if let Some(write) = pending.take() {
                    write_now(backend.as_ref(), &write);
                }
                deadline = None;
                let _ = done.send(());
            }
            WriterMsg::Reset {
                book_id,
                chapter_index,
                done,
            } => {
                if pending
                    .as_ref()
                    .map(|w| w.record.book_id == book_id && w.record.chapter_index == chapter_index)
                    .unwrap_or(false)
                {
                    pending = None;
                    deadline = None;
                }
                clear_now(backend.as_ref(), &book_id, chapter_index);
                let _ = done.send(());
            }
            WriterMsg::Shutdown => {
                if let Some(write) = pending.take() {
                    write_now(backend.as_ref(), &write);
                }
                debug!("Progress writer stopped");
                return;
            }
        }
    }
}

fn write_now(backend: &dyn ProgressBackend, write: &PendingWrite) {
    let record = &write.record;
    debug!(
        book_id = %record.book_id,
        chapter_index = record.chapter_index,
        unit_index = record.unit_index,
        char_offset = record.char_offset,
        "Persisting progress"
    );
    if let Err(err) = backend.save(record) {
        warn!(chapter_index = record.chapter_index, "Failed to save progress: {err:#}");
    }
    if let Err(err) = backend.report_position(&record.book_id, record.chapter_index, write.fraction)
    {
        warn!(chapter_index = record.chapter_index, "Failed to report position: {err:#}");
    }
}

fn clear_now(backend: &dyn ProgressBackend, book_id: &str, chapter_index: usize) {
    debug!(book_id, chapter_index, "Clearing progress");
    if let Err(err) = backend.clear(book_id, chapter_index) {
        warn!(chapter_index, "Failed to clear progress: {err:#}");
    }
}
