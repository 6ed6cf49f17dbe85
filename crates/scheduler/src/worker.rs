//! Background thread for frame conversion
//!
//! Colour conversion of a freshly rendered frame runs here so the control
//! thread never blocks on it. Jobs run one at a time in submission order.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};

/// Unit of work executed on the conversion thread
pub type ConversionJob = Box<dyn FnOnce() + Send + 'static>;

/// Single conversion thread fed through a channel
///
/// Dropping the worker closes the channel, lets queued jobs finish and
/// joins the thread.
pub struct ConversionWorker {
    jobs: Option<Sender<ConversionJob>>,
    thread: Option<JoinHandle<()>>,
}

impl ConversionWorker {
    /// Spawn the worker thread
    ///
    /// # Panics
    /// If the OS refuses to create the thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<ConversionJob>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
                tracing::trace!("conversion worker exiting");
            })
            .expect("Failed to spawn conversion worker thread");

        Self {
            jobs: Some(tx),
            thread: Some(thread),
        }
    }

    /// Queue `job`; returns false if the worker already shut down
    pub fn submit(&self, job: ConversionJob) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        }
    }

    /// Finish queued jobs and join the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("conversion worker panicked");
            }
        }
    }
}

impl Drop for ConversionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
