//! Single in-flight frame regeneration
//!
//! [`CacheRegenerator`] drives one request at a time through
//! `Idle -> Requested -> Converting -> Idle`:
//!
//! 1. [`request`](CacheRegenerator::request) asks the rendering pipeline for
//!    a time and arms the timeout.
//! 2. A matching [`RenderEvent::FrameReady`] fetches the projection on the
//!    control thread and ships the patches to the conversion worker.
//! 3. The worker converts the patches and prepares them for the swapper,
//!    which for the disk backend includes diffing and compression. It posts
//!    a [`ConvertedFrame`] into a single-slot mailbox; the control thread
//!    commits it to the cache.
//!
//! Cancellation, a timeout or a pipeline cancel return to `Idle` without
//! touching the cache. Results that do not belong to the current request
//! are dropped.

use std::time::{Duration, Instant};

use anim_frame_cache::{AnimationFrameCache, PreparedFrame, Rect};
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::cancel::CancellationToken;
use crate::render::{RenderEvent, RenderingCollaborator};
use crate::timeout::DeadManSwitch;
use crate::worker::ConversionWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationState {
    Idle,
    /// Waiting for the pipeline to render `time`
    Requested { time: i32 },
    /// Rendered, conversion running on the worker
    Converting { time: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationOutcome {
    /// `cached` is false when the swapper failed to keep the frame
    Completed { time: i32, cached: bool },
    Cancelled { time: i32 },
    TimedOut { time: i32 },
}

impl RegenerationOutcome {
    pub fn time(&self) -> i32 {
        match *self {
            RegenerationOutcome::Completed { time, .. }
            | RegenerationOutcome::Cancelled { time }
            | RegenerationOutcome::TimedOut { time } => time,
        }
    }
}

/// Conversion result travelling from the worker to the control thread
pub struct ConvertedFrame {
    request_id: u64,
    time: i32,
    frame: PreparedFrame,
}

impl ConvertedFrame {
    pub fn time(&self) -> i32 {
        self.time
    }

    pub fn frame(&self) -> &PreparedFrame {
        &self.frame
    }
}

struct InFlight {
    request_id: u64,
    region: Rect,
    token: CancellationToken,
}

/// Coordinates regeneration of one frame at a time
pub struct CacheRegenerator {
    // Dropped before the worker so a job blocked on a full mailbox wakes up
    mailbox: Receiver<ConvertedFrame>,
    results: Sender<ConvertedFrame>,
    worker: ConversionWorker,
    renderer: Box<dyn RenderingCollaborator>,
    timeout: DeadManSwitch,
    state: RegenerationState,
    in_flight: Option<InFlight>,
    next_request_id: u64,
}

impl CacheRegenerator {
    pub fn new(renderer: Box<dyn RenderingCollaborator>, timeout: Duration) -> Self {
        let (results, mailbox) = bounded(1);
        Self {
            mailbox,
            results,
            worker: ConversionWorker::new("anim-frame-conversion"),
            renderer,
            timeout: DeadManSwitch::new(timeout),
            state: RegenerationState::Idle,
            in_flight: None,
            next_request_id: 1,
        }
    }

    pub fn state(&self) -> RegenerationState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RegenerationState::Idle
    }

    /// Time currently being regenerated
    pub fn pending_time(&self) -> Option<i32> {
        match self.state {
            RegenerationState::Idle => None,
            RegenerationState::Requested { time } | RegenerationState::Converting { time } => Some(time),
        }
    }

    /// Receiving end of the conversion mailbox, for use in a select loop
    pub fn mailbox(&self) -> &Receiver<ConvertedFrame> {
        &self.mailbox
    }

    /// When the running request times out
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeout.deadline()
    }

    /// Ask the pipeline to regenerate `time` over `region`
    ///
    /// Ignored, returning false, while another request is in flight.
    pub fn request(&mut self, time: i32, region: Rect) -> bool {
        if let Some(pending) = self.pending_time() {
            tracing::debug!(time, pending, "regeneration already in flight, request ignored");
            return false;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.in_flight = Some(InFlight {
            request_id,
            region,
            token: CancellationToken::new(),
        });
        self.state = RegenerationState::Requested { time };
        self.timeout.start(Instant::now());

        tracing::debug!(time, request_id, ?region, "frame regeneration requested");
        self.renderer.request_regeneration(time, &region);
        true
    }

    /// React to a signal from the rendering pipeline
    pub fn handle_event(&mut self, event: RenderEvent, cache: &AnimationFrameCache) -> Option<RegenerationOutcome> {
        let RegenerationState::Requested { time } = self.state else {
            tracing::trace!(?event, state = ?self.state, "render event ignored");
            return None;
        };

        match event {
            RenderEvent::FrameReady { time: ready } if ready == time => self.start_conversion(time, cache),
            RenderEvent::FrameReady { time: ready } => {
                tracing::trace!(ready, pending = time, "stale frame ready ignored");
                None
            }
            RenderEvent::FrameCancelled => {
                tracing::debug!(time, "frame regeneration cancelled by the pipeline");
                Some(self.finish(RegenerationOutcome::Cancelled { time }))
            }
        }
    }

    fn start_conversion(&mut self, time: i32, cache: &AnimationFrameCache) -> Option<RegenerationOutcome> {
        let (request_id, region, token) = match &self.in_flight {
            Some(in_flight) => (in_flight.request_id, in_flight.region, in_flight.token.clone()),
            None => return None,
        };

        let Some(source) = self.renderer.fetch_projection(time, &region) else {
            tracing::warn!(time, "rendered projection unavailable");
            return Some(self.finish(RegenerationOutcome::Cancelled { time }));
        };

        let fetcher = cache.frame_data_fetcher();
        let data = fetcher.fetch(source.as_ref(), &region);
        let results = self.results.clone();

        let submitted = self.worker.submit(Box::new(move || {
            let tiles = fetcher.convert(data);
            if token.is_cancelled() {
                tracing::trace!(time, request_id, "conversion result discarded");
                return;
            }
            let frame = fetcher.prepare(tiles);
            // The control loop is gone if this fails
            let _ = results.send(ConvertedFrame { request_id, time, frame });
        }));

        if !submitted {
            tracing::warn!(time, "conversion worker unavailable");
            return Some(self.finish(RegenerationOutcome::Cancelled { time }));
        }

        self.state = RegenerationState::Converting { time };
        tracing::debug!(time, request_id, "frame conversion started");
        None
    }

    /// Insert a conversion result into `cache` if it is the awaited one
    pub fn handle_converted(
        &mut self,
        frame: ConvertedFrame,
        cache: &mut AnimationFrameCache,
    ) -> Option<RegenerationOutcome> {
        let current = match (&self.state, &self.in_flight) {
            (RegenerationState::Converting { time }, Some(in_flight)) => {
                in_flight.request_id == frame.request_id && *time == frame.time
            }
            _ => false,
        };
        if !current {
            tracing::trace!(time = frame.time, request_id = frame.request_id, "stale conversion result dropped");
            return None;
        }

        let time = frame.time;
        let cached = cache.add_prepared_frame(frame.frame, time);
        tracing::debug!(time, cached, "frame regeneration completed");
        Some(self.finish(RegenerationOutcome::Completed { time, cached }))
    }

    /// Fire the timeout if it is due
    pub fn poll_timeout(&mut self, now: Instant) -> Option<RegenerationOutcome> {
        if !self.timeout.poll(now) {
            return None;
        }
        let time = self.pending_time()?;
        tracing::warn!(time, "frame regeneration timed out");
        Some(self.finish(RegenerationOutcome::TimedOut { time }))
    }

    /// Drop the request in flight, if any
    pub fn cancel(&mut self) -> Option<RegenerationOutcome> {
        let time = self.pending_time()?;
        tracing::debug!(time, "frame regeneration cancelled");
        Some(self.finish(RegenerationOutcome::Cancelled { time }))
    }

    fn finish(&mut self, outcome: RegenerationOutcome) -> RegenerationOutcome {
        self.timeout.stop();
        if let Some(in_flight) = self.in_flight.take() {
            if !matches!(outcome, RegenerationOutcome::Completed { .. }) {
                in_flight.token.cancel();
            }
        }
        self.state = RegenerationState::Idle;
        outcome
    }
}
