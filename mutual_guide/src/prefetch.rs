use std::{thread::{self, JoinHandle}, time::{Duration, Instant}};

use burn::data::dataloader::batcher::Batcher;
use crossbeam_channel::{bounded, Receiver};

/// Keeps exactly one batch in flight ahead of the consumer.
///
/// A worker thread pulls host items from `source`, materializes them on the
/// device through the batcher and blocks on a rendezvous channel until the
/// consumer asks for the batch. As soon as a batch is handed over, the worker
/// starts on the next one, so materializing batch N+1 overlaps with compute on
/// batch N.
pub struct DataPrefetcher<O> {
    receiver: Option<Receiver<O>>,
    worker: Option<JoinHandle<()>>,
    waited: Duration,
}

impl<O: Send + 'static> DataPrefetcher<O> {
    pub fn new<I, S, T>(source: S, batcher: T) -> Self
    where
        I: Send + 'static,
        S: Iterator<Item = Vec<I>> + Send + 'static,
        T: Batcher<I, O> + 'static,
    {
        let (sender, receiver) = bounded(0);
        let worker = thread::spawn(move || {
            for items in source {
                let batch = batcher.batch(items);
                if sender.send(batch).is_err() {
                    // consumer went away
                    break;
                }
            }
        });

        Self {
            receiver: Some(receiver),
            worker: Some(worker),
            waited: Duration::ZERO,
        }
    }

    /// Returns the pending batch, blocking until its materialization finished.
    /// `None` once the source is exhausted.
    pub fn next(&mut self) -> Option<O> {
        let receiver = self.receiver.as_ref()?;
        let start = Instant::now();
        let batch = receiver.recv().ok();
        self.waited += start.elapsed();
        batch
    }

    /// Total time `next` spent blocked on the worker.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl<O> Drop for DataPrefetcher<O> {
    fn drop(&mut self) {
        // Disconnect first so a worker parked in `send` wakes up and exits.
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("prefetch worker panicked");
            }
        }
    }
}
