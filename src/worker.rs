//! Inference worker thread.
//!
//! Model inference can take tens of milliseconds, so accelerometer samples
//! destined for the classifier are queued to a dedicated thread instead of
//! running on the BLE callback. The queue is bounded; when it is full the
//! newest sample is dropped.
//!
//! Resets never wait on the queue. They bump a generation counter instead;
//! the worker clears its window when it notices the bump and discards every
//! sample queued under an older generation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::classifier::WindowedActivityClassifier;
use crate::types::{AccelSample, ActivityLabel, Classification, SensorSource};
use crate::{KineticError, Result};

enum WorkerMsg {
    Sample {
        sample: AccelSample,
        source: SensorSource,
        generation: u64,
    },
    /// Wake-up after a generation bump.
    Reset,
    Flush(Sender<()>),
}

/// Latest classifier output, readable from any thread.
#[derive(Debug)]
pub struct Diagnostics {
    model_loaded: AtomicBool,
    label: AtomicU8,
    confidence_bits: AtomicU32,
    processed: AtomicU64,
    dropped: AtomicU64,
    generation: AtomicU64,
}

impl Diagnostics {
    fn new(model_loaded: bool) -> Self {
        let initial = if model_loaded {
            ActivityLabel::CollectingData
        } else {
            ActivityLabel::AiNotLoaded
        };
        Self {
            model_loaded: AtomicBool::new(model_loaded),
            label: AtomicU8::new(initial as u8),
            confidence_bits: AtomicU32::new(0f32.to_bits()),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Relaxed)
    }

    pub fn last_label(&self) -> ActivityLabel {
        ActivityLabel::from_code(self.label.load(Ordering::Relaxed))
    }

    pub fn last_confidence(&self) -> f32 {
        f32::from_bits(self.confidence_bits.load(Ordering::Relaxed))
    }

    /// Samples classified since start.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Samples dropped because the queue was full or a reset made them stale.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Bumped by every reset.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn record_idle(&self, model_loaded: bool) {
        let label = if model_loaded {
            ActivityLabel::CollectingData
        } else {
            ActivityLabel::AiNotLoaded
        };
        self.record(&Classification::sentinel(label), 0.0);
    }

    fn record(&self, classification: &Classification, last_confidence: f32) {
        self.label
            .store(classification.label as u8, Ordering::Relaxed);
        self.confidence_bits
            .store(last_confidence.to_bits(), Ordering::Relaxed);
    }
}

/// Cloneable producer side of the worker queue.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Sender<WorkerMsg>,
    diagnostics: Arc<Diagnostics>,
}

impl WorkerHandle {
    /// Queue a sample without blocking. `source` is the active sensor at
    /// the time of the push and travels with the result.
    pub fn push(&self, sample: AccelSample, source: SensorSource) {
        let msg = WorkerMsg::Sample {
            sample,
            source,
            generation: self.diagnostics.generation(),
        };
        match self.sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.diagnostics.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Inference queue full, dropping sample");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("Inference worker gone, sample discarded");
            }
        }
    }

    /// Discard the classifier window and everything queued so far. Never
    /// blocks, so result callbacks on the worker thread may call it.
    pub fn reset(&self) {
        let generation = self.diagnostics.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("Inference reset requested (generation {})", generation);
        // A full queue wakes the worker anyway.
        let _ = self.sender.try_send(WorkerMsg::Reset);
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}

/// Owns the classifier thread. Dropping it drains the queue and joins once
/// every [`WorkerHandle`] clone is gone.
pub struct InferenceWorker {
    handle: Option<WorkerHandle>,
    diagnostics: Arc<Diagnostics>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl InferenceWorker {
    /// Move `classifier` onto a new thread. `on_result` runs there for every
    /// classified sample, with the source the sample was pushed under.
    pub fn start<F>(
        classifier: WindowedActivityClassifier,
        capacity: usize,
        on_result: F,
    ) -> Result<InferenceWorker>
    where
        F: FnMut(Classification, SensorSource) + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let diagnostics = Arc::new(Diagnostics::new(classifier.is_model_loaded()));
        let shared = diagnostics.clone();

        let thread = std::thread::Builder::new()
            .name("kinetic-infer".into())
            .spawn(move || worker_loop(classifier, receiver, shared, on_result))?;

        Ok(InferenceWorker {
            handle: Some(WorkerHandle {
                sender,
                diagnostics: diagnostics.clone(),
            }),
            diagnostics,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Option<WorkerHandle> {
        self.handle.clone()
    }

    pub fn push(&self, sample: AccelSample, source: SensorSource) {
        if let Some(handle) = &self.handle {
            handle.push(sample, source);
        }
    }

    /// See [`WorkerHandle::reset`].
    pub fn reset(&self) {
        if let Some(handle) = &self.handle {
            handle.reset();
        }
    }

    /// Wait until every sample queued before this call has been classified.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(KineticError::StreamStopped)?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        handle
            .sender
            .send_timeout(WorkerMsg::Flush(done_tx), timeout)
            .map_err(|_| KineticError::Timeout)?;
        done_rx.recv_timeout(timeout).map_err(|_| KineticError::Timeout)
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    fn shutdown(&mut self) {
        // The loop ends when the last sender is gone and the queue is drained.
        drop(self.handle.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(
    mut classifier: WindowedActivityClassifier,
    receiver: Receiver<WorkerMsg>,
    diagnostics: Arc<Diagnostics>,
    mut on_result: F,
) where
    F: FnMut(Classification, SensorSource),
{
    log::info!(
        "Inference worker started (model loaded: {})",
        classifier.is_model_loaded()
    );

    let mut applied = diagnostics.generation();
    for msg in receiver.iter() {
        let current = diagnostics.generation();
        if current != applied {
            classifier.reset();
            diagnostics.record_idle(classifier.is_model_loaded());
            log::debug!("Classifier window cleared (generation {})", current);
            applied = current;
        }

        match msg {
            WorkerMsg::Sample {
                sample,
                source,
                generation,
            } => {
                if generation != applied {
                    diagnostics.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Discarding sample from generation {}", generation);
                    continue;
                }
                let classification = classifier.push_sample(&sample);
                diagnostics.record(&classification, classifier.last_confidence());
                diagnostics.processed.fetch_add(1, Ordering::Relaxed);
                on_result(classification, source);
            }
            WorkerMsg::Reset => {}
            WorkerMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    log::info!("Inference worker stopped");
}
