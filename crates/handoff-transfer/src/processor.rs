//! Receiver-side persistence pipeline.
//!
//! Decrypted message payloads are queued to a dedicated worker thread that
//! decodes them and calls the matching store insert. The network task never
//! waits on storage; it observes progress and errors through watch channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::{fs, io, thread};

use crossbeam_channel::{Receiver, Sender, unbounded};
use handoff_types::{RecordStore, StoreError, TransferItem};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::file_stream::file_path;

enum Job {
    Process(Vec<u8>),
    FileReceived { id: Uuid, path: PathBuf },
    Finish,
}

struct Counters {
    submitted: AtomicU64,
    done: AtomicU64,
    finishing: AtomicBool,
    cancelled: AtomicBool,
}

pub struct MessageProcessor {
    jobs: Sender<Job>,
    counters: Arc<Counters>,
    progress: watch::Receiver<f64>,
    errors: watch::Receiver<Option<StoreError>>,
}

impl MessageProcessor {
    pub fn spawn(store: Arc<dyn RecordStore>, attachments_dir: Option<PathBuf>) -> io::Result<Self> {
        let (jobs_tx, jobs_rx) = unbounded();
        let (progress_tx, progress) = watch::channel(0.0);
        let (errors_tx, errors) = watch::channel(None);
        let counters = Arc::new(Counters {
            submitted: AtomicU64::new(0),
            done: AtomicU64::new(0),
            finishing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });

        let worker = Worker {
            store,
            attachments_dir,
            counters: counters.clone(),
            progress: progress_tx,
            errors: errors_tx,
        };
        thread::Builder::new()
            .name("handoff-processor".into())
            .spawn(move || worker.run(jobs_rx))?;

        Ok(Self {
            jobs: jobs_tx,
            counters,
            progress,
            errors,
        })
    }

    /// Queue one decrypted transfer item payload.
    pub fn process(&self, payload: Vec<u8>) {
        self.submit(Job::Process(payload));
    }

    /// Queue a completed file. Counted separately from messages.
    pub fn report_file_received(&self, id: Uuid, path: PathBuf) {
        self.submit(Job::FileReceived { id, path });
    }

    /// No more work will arrive; progress starts publishing and reaches
    /// exactly 1.0 once the queue drains.
    pub fn finish_processing(&self) {
        self.counters.finishing.store(true, Ordering::SeqCst);
        let _ = self.jobs.send(Job::Finish);
    }

    /// Stop taking work. Whatever job is running finishes on its own.
    pub fn cancel(&self) {
        self.counters.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<StoreError>> {
        self.errors.clone()
    }

    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::SeqCst)
    }

    fn submit(&self, job: Job) {
        if self.counters.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(job).is_err() {
            debug!("Processor worker gone, job dropped");
        }
    }
}

struct Worker {
    store: Arc<dyn RecordStore>,
    attachments_dir: Option<PathBuf>,
    counters: Arc<Counters>,
    progress: watch::Sender<f64>,
    errors: watch::Sender<Option<StoreError>>,
}

impl Worker {
    fn run(self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            if self.counters.cancelled.load(Ordering::SeqCst) {
                info!("Processor cancelled");
                return;
            }
            match job {
                Job::Process(payload) => {
                    if let Err(e) = self.process(&payload) {
                        error!("Processor stopped: {}", e);
                        self.errors.send_replace(Some(e));
                        return;
                    }
                }
                Job::FileReceived { id, path } => self.store_file(id, &path),
                Job::Finish => {
                    info!(
                        "Processor drained {} jobs",
                        self.counters.done.load(Ordering::SeqCst)
                    );
                    self.progress.send_replace(1.0);
                    return;
                }
            }
            self.counters.done.fetch_add(1, Ordering::SeqCst);
            self.publish_progress();
        }
    }

    /// Errors only for failures that make further inserts pointless.
    fn process(&self, payload: &[u8]) -> Result<(), StoreError> {
        let item = match TransferItem::decode(payload) {
            Ok(item) => item,
            Err(e) => {
                warn!("Dropping undecodable item: {}", e);
                return Ok(());
            }
        };
        match persist(self.store.as_ref(), &item) {
            Err(e) if e.is_systemic() => Err(e),
            Err(e) => {
                warn!("Skipping {:?} record: {}", item.kind(), e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn store_file(&self, id: Uuid, path: &Path) {
        let Some(dir) = self.attachments_dir.as_deref() else {
            debug!("No attachments directory, leaving file {} in cache", id);
            return;
        };
        let dest = file_path(dir, &id);
        if let Err(e) = fs::create_dir_all(dir).and_then(|_| move_file(path, &dest)) {
            warn!("Unable to keep file {}: {}", id, e);
        }
    }

    fn publish_progress(&self) {
        if !self.counters.finishing.load(Ordering::SeqCst) {
            return;
        }
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let done = self.counters.done.load(Ordering::SeqCst);
        if submitted > 0 {
            self.progress.send_replace((done as f64 / submitted as f64).min(1.0));
        }
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Cache and attachments may sit on different filesystems.
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Route one item to its store insert. Unknown kinds are logged and dropped.
pub fn persist(store: &dyn RecordStore, item: &TransferItem) -> Result<(), StoreError> {
    match item {
        TransferItem::Conversation(r) => store.insert_conversation(r),
        TransferItem::Participant(r) => store.insert_participant(r),
        TransferItem::User(r) => store.insert_user(r),
        TransferItem::App(r) => store.insert_app(r),
        TransferItem::Asset(r) => store.insert_asset(r),
        TransferItem::Snapshot(r) => store.insert_snapshot(r),
        TransferItem::Sticker(r) => store.insert_sticker(r),
        TransferItem::PinMessage(r) => store.insert_pin_message(r),
        TransferItem::TranscriptMessage(r) => store.insert_transcript_message(r),
        TransferItem::Message(r) => store.insert_message(r),
        TransferItem::MessageMention(r) => store.insert_message_mention(r),
        TransferItem::ExpiredMessage(r) => store.insert_expired_message(r),
        TransferItem::Unknown(kind) => {
            warn!("Dropping item of unknown type {:?}", kind);
            Ok(())
        }
    }
}
