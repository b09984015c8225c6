//! Write-behind pipeline: commitments are batched per worker, coalesced per key and flushed
//! to the source's table by one consumer thread per worker.

use crate::commitment::Commitment;
use crate::driver::Table;
use crate::error::AppError;
use crate::redo::{RedoLog, RedoLogFile};
use crate::{error, warn};
use crossbeam::channel::{bounded, Receiver, Sender};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const BATCH_SIZE: usize = 256;
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const SPARE_BATCHES: usize = 2;

struct SyncSignal {
    // never sent on; dropping it releases every waiter
    _tx: Sender<()>,
    rx: Receiver<()>,
    aborted: Arc<AtomicBool>,
}

/// Blocks until the batch it was taken from has been handed to storage.
pub struct SyncWaiter {
    rx: Receiver<()>,
    aborted: Arc<AtomicBool>,
}

impl SyncWaiter {
    /// True when the batch was saved, false when saving was abandoned.
    pub fn wait(self) -> bool {
        let _ = self.rx.recv();
        !self.aborted.load(Ordering::Acquire)
    }
}

/// Up to [`BATCH_SIZE`] pending commitments of one worker.
pub struct CommitmentBatch {
    entries: Vec<Box<dyn Commitment>>,
    redo: Box<dyn RedoLogFile>,
    overtime: bool,
    sync: Option<SyncSignal>,
}

impl CommitmentBatch {
    pub fn new(redo: Box<dyn RedoLogFile>) -> Self {
        CommitmentBatch { entries: Vec::with_capacity(BATCH_SIZE), redo, overtime: false, sync: None }
    }

    /// Merges into the entry at `index` when it holds the same key, appends otherwise.
    /// Hands the commitment back when the batch is full.
    pub fn put(&mut self, commitment: Box<dyn Commitment>, index: Option<usize>) -> Result<usize, Box<dyn Commitment>> {
        let mut commitment = commitment;
        if let Some(i) = index {
            if let Some(entry) = self.entries.get_mut(i).filter(|e| e.absorbs(commitment.as_ref())) {
                self.redo.log(commitment.as_ref());
                match entry.merge(commitment) {
                    Ok(()) => return Ok(i),
                    Err(back) => commitment = back,
                }
            }
        }
        if self.entries.len() >= BATCH_SIZE {
            return Err(commitment);
        }
        self.redo.log(commitment.as_ref());
        self.entries.push(commitment);
        Ok(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Box<dyn Commitment>] {
        &self.entries
    }

    pub fn mark_overtime(&mut self) {
        self.overtime = true;
    }

    pub fn consumable(&self) -> bool {
        self.entries.len() >= BATCH_SIZE || self.overtime || self.sync.is_some()
    }

    pub fn sync_waiter(&mut self) -> SyncWaiter {
        let signal = self.sync.get_or_insert_with(|| {
            let (tx, rx) = bounded(0);
            SyncSignal { _tx: tx, rx, aborted: Arc::new(AtomicBool::new(false)) }
        });
        SyncWaiter { rx: signal.rx.clone(), aborted: Arc::clone(&signal.aborted) }
    }

    pub fn retire(&mut self) {
        self.redo.retire();
    }

    /// Empties the batch for reuse and releases its sync waiters.
    pub fn reset(&mut self, aborted: bool) {
        if !aborted {
            self.redo.destroy();
        }
        if let Some(signal) = self.sync.take() {
            signal.aborted.store(aborted, Ordering::Release);
        }
        self.entries.clear();
        self.overtime = false;
    }

    fn serve(&mut self, redo: Box<dyn RedoLogFile>) {
        self.redo = redo;
    }
}

struct WorkerState {
    receiving: Option<CommitmentBatch>,
    deadline: Option<Instant>,
    spare: Vec<CommitmentBatch>,
}

/// One shard of a saver: producers fill the receiving batch, a single consumer flushes it.
pub struct SaveWorker {
    id: usize,
    namespace: &'static str,
    table: Arc<dyn Table>,
    redo: Arc<dyn RedoLog>,
    save_timeout: Duration,
    sync_interval: Duration,
    running: AtomicBool,
    state: Mutex<WorkerState>,
    producers: Condvar,
    consumer: Condvar,
}

impl SaveWorker {
    fn new(id: usize, namespace: &'static str, table: Arc<dyn Table>, redo: Arc<dyn RedoLog>, save_timeout: Duration, sync_interval: Duration) -> Self {
        let receiving = CommitmentBatch::new(redo.serve(namespace, id));
        SaveWorker {
            id,
            namespace,
            table,
            redo,
            save_timeout,
            sync_interval,
            running: AtomicBool::new(false),
            state: Mutex::new(WorkerState { receiving: Some(receiving), deadline: None, spare: Vec::new() }),
            producers: Condvar::new(),
            consumer: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueues `commitment`, blocking while the receiving batch is full.
    /// Returns the index it landed on, None when the worker no longer accepts writes.
    pub fn put(&self, commitment: Box<dyn Commitment>, index: Option<usize>) -> Option<usize> {
        let mut commitment = commitment;
        let mut index = index;
        let mut state = self.lock();
        while self.is_running() {
            let Some(batch) = state.receiving.as_mut() else { break };
            match batch.put(commitment, index) {
                Ok(i) => {
                    if state.deadline.is_none() {
                        state.deadline = Some(Instant::now() + self.sync_interval);
                        self.consumer.notify_one();
                    }
                    return Some(i);
                }
                Err(back) => {
                    commitment = back;
                    index = None;
                    self.consumer.notify_one();
                    state = self.producers.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        warn!("{} worker {} is closed, dropping commitment of {}", self.namespace, self.id, commitment.pk());
        None
    }

    /// Asks the consumer to flush the receiving batch. None once the worker is closed.
    pub fn sync(&self) -> Option<SyncWaiter> {
        let mut state = self.lock();
        if !self.is_running() {
            return None;
        }
        let waiter = state.receiving.as_mut()?.sync_waiter();
        self.consumer.notify_one();
        Some(waiter)
    }

    pub fn ongoing(&self) -> usize {
        self.lock().receiving.as_ref().map_or(0, CommitmentBatch::len)
    }

    fn start(&self) {
        let _state = self.lock();
        self.running.store(true, Ordering::Release);
    }

    /// Stops accepting commitments and wakes everybody up.
    pub fn close(&self) {
        let _state = self.lock();
        self.running.store(false, Ordering::Release);
        self.consumer.notify_all();
        self.producers.notify_all();
    }

    fn fresh_batch(&self, state: &mut WorkerState) -> CommitmentBatch {
        let redo = self.redo.serve(self.namespace, self.id);
        match state.spare.pop() {
            Some(mut batch) => {
                batch.serve(redo);
                batch
            }
            None => CommitmentBatch::new(redo),
        }
    }

    /// Waits for a consumable batch and swaps it out. The flag tells whether the worker still runs;
    /// once it does not, whatever is left is handed out for a last flush.
    fn poll(&self) -> (Option<CommitmentBatch>, bool) {
        let mut state = self.lock();
        loop {
            if !self.is_running() {
                state.deadline = None;
                let mut last = state.receiving.take();
                if let Some(batch) = last.as_mut() {
                    batch.retire();
                }
                self.producers.notify_all();
                return (last, false);
            }
            if let Some(deadline) = state.deadline {
                if Instant::now() >= deadline {
                    if let Some(batch) = state.receiving.as_mut() {
                        batch.mark_overtime();
                    }
                }
            }
            if state.receiving.as_ref().is_some_and(CommitmentBatch::consumable) {
                let fresh = self.fresh_batch(&mut state);
                let mut retired = state.receiving.replace(fresh);
                state.deadline = None;
                if let Some(batch) = retired.as_mut() {
                    batch.retire();
                }
                self.producers.notify_all();
                return (retired, true);
            }
            state = match state.deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.consumer.wait_timeout(state, timeout).map(|(guard, _)| guard).unwrap_or_else(|e| e.into_inner().0)
                }
                None => self.consumer.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn recycle(&self, mut batch: CommitmentBatch, aborted: bool) {
        batch.reset(aborted);
        let mut state = self.lock();
        if state.spare.len() < SPARE_BATCHES {
            state.spare.push(batch);
        }
    }

    fn consume(&self) {
        loop {
            let (batch, running) = self.poll();
            if let Some(batch) = batch {
                let mut aborted = false;
                if !batch.is_empty() {
                    let started = Instant::now();
                    if self.table.save(batch.entries(), self.save_timeout, RETRY_INTERVAL, &|| self.is_running()) {
                        debug!("{} worker {} flushed {} commitments in {} ms", self.namespace, self.id, batch.len(), started.elapsed().as_millis());
                    } else {
                        aborted = true;
                        error!("{} worker {} abandoned a batch of {} commitments", self.namespace, self.id, batch.len());
                    }
                }
                self.recycle(batch, aborted);
                if aborted && running {
                    self.close();
                }
            }
            if !running {
                break;
            }
        }
        debug!("{} worker {} stopped", self.namespace, self.id);
    }
}

/// Write-behind saver of one source.
pub struct Saver {
    namespace: &'static str,
    table: Arc<dyn Table>,
    redo: Arc<dyn RedoLog>,
    workers: Vec<Arc<SaveWorker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Saver {
    pub fn new(namespace: &'static str, table: Arc<dyn Table>, redo: Arc<dyn RedoLog>, concurrence: usize, save_timeout: Duration, sync_interval: Duration) -> Self {
        let workers = (0..concurrence.max(1))
            .map(|id| Arc::new(SaveWorker::new(id, namespace, Arc::clone(&table), Arc::clone(&redo), save_timeout, sync_interval)))
            .collect();
        Saver { namespace, table, redo, workers, handles: Mutex::new(Vec::new()) }
    }

    pub fn concurrence(&self) -> usize {
        self.workers.len()
    }

    fn worker_for(&self, hash: u64) -> &Arc<SaveWorker> {
        &self.workers[(hash % self.workers.len() as u64) as usize]
    }

    /// Replays commitments the redo log never saw retired.
    pub fn recover(&self) -> Result<(), AppError> {
        let pending = self.redo.pending(self.namespace)?;
        if pending.is_empty() {
            return Ok(());
        }
        warn!("{} recovering {} pending commitments", self.namespace, pending.len());
        self.table.recover(pending)
    }

    /// Starts one consumer thread per worker.
    pub fn run(&self) -> Result<(), AppError> {
        let mut handles = self.handles.lock()?;
        for worker in &self.workers {
            worker.start();
            let consumer = Arc::clone(worker);
            let handle = thread::Builder::new()
                .name(format!("saver-{}-{}", self.namespace, worker.id))
                .spawn(move || consumer.consume())?;
            handles.push(handle);
        }
        Ok(())
    }

    pub fn put(&self, commitment: Box<dyn Commitment>, index: Option<usize>) -> Option<usize> {
        let hash = commitment.pk().routing_hash();
        self.worker_for(hash).put(commitment, index)
    }

    /// Flushes the batch of the worker owning `hash`, or of every worker, and waits for it.
    pub fn sync(&self, hash: Option<u64>) -> Result<(), AppError> {
        let workers: Vec<&Arc<SaveWorker>> = match hash {
            Some(h) => vec![self.worker_for(h)],
            None => self.workers.iter().collect(),
        };
        let mut waiters = Vec::with_capacity(workers.len());
        for worker in workers {
            waiters.push(worker.sync().ok_or_else(|| AppError::SaverClosed(self.namespace.to_string()))?);
        }
        let mut saved = true;
        for waiter in waiters {
            saved &= waiter.wait();
        }
        if saved {
            Ok(())
        } else {
            Err(AppError::SaveAborted(self.namespace.to_string()))
        }
    }

    pub fn ongoing(&self) -> usize {
        self.workers.iter().map(|w| w.ongoing()).sum()
    }

    /// Stops accepting writes, flushes what is pending once and joins the consumers.
    pub fn close(&self) -> Result<(), AppError> {
        for worker in &self.workers {
            worker.close();
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock()?.drain(..).collect();
        for handle in handles {
            handle.join().map_err(|_| AppError::Custom(format!("{} saver join failed", self.namespace)))?;
        }
        Ok(())
    }
}
