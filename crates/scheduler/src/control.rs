//! The control-thread loop
//!
//! [`ControlLoop`] owns the frame cache and everything that mutates it. The
//! rendering pipeline, the conversion worker and the tile pool only talk to
//! it through channels, so the cache index never needs a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anim_frame_cache::{
    AnimationFrameCache, CacheResult, ColorConverter, FrameCacheConfig, PurgeRequest, PurgeScheduler, Rect,
    UpdateInfoBuilder,
};
use crossbeam::channel::{Receiver, Select, TryRecvError};

use crate::regenerator::{CacheRegenerator, ConvertedFrame, RegenerationOutcome};
use crate::render::{render_channel, RenderEvent, RenderEventSender, RenderingCollaborator};

enum Incoming {
    Event(RenderEvent),
    Converted(ConvertedFrame),
    Purge(PurgeRequest),
    Nothing,
}

/// Single-threaded owner of the cache, the regenerator and the purge timer
pub struct ControlLoop {
    cache: AnimationFrameCache,
    regenerator: CacheRegenerator,
    purges: PurgeScheduler,
    events: Receiver<RenderEvent>,
}

impl ControlLoop {
    pub fn new(
        cache: AnimationFrameCache,
        regenerator: CacheRegenerator,
        purges: PurgeScheduler,
        events: Receiver<RenderEvent>,
    ) -> Self {
        Self {
            cache,
            regenerator,
            purges,
            events,
        }
    }

    /// Wire up a complete cache from `config`
    ///
    /// Returns the loop and the sender the rendering pipeline posts its
    /// events through.
    ///
    /// # Errors
    /// If `config` is invalid.
    pub fn with_config(
        config: &FrameCacheConfig,
        image_bounds: Rect,
        renderer: Box<dyn RenderingCollaborator>,
        converter: Option<Arc<dyn ColorConverter>>,
    ) -> CacheResult<(Self, RenderEventSender)> {
        config.validate()?;

        let (pool, purges) = PurgeScheduler::with_pool(config.pool_config(), config.purge_debounce());
        let mut builder = UpdateInfoBuilder::new(config.tile_geometry(), pool);
        if let Some(converter) = converter {
            builder = builder.with_converter(converter);
        }

        let cache = AnimationFrameCache::new(config, Arc::new(builder), image_bounds);
        let regenerator = CacheRegenerator::new(renderer, config.regeneration_timeout());
        let (sender, events) = render_channel();

        tracing::debug!(
            on_disk = config.use_on_disk_swap,
            frame_size_limit = config.effective_frame_size_limit(),
            "frame cache control loop created"
        );
        Ok((Self::new(cache, regenerator, purges, events), sender))
    }

    pub fn cache(&self) -> &AnimationFrameCache {
        &self.cache
    }

    /// Direct access for control-thread callers
    pub fn cache_mut(&mut self) -> &mut AnimationFrameCache {
        &mut self.cache
    }

    pub fn regenerator(&self) -> &CacheRegenerator {
        &self.regenerator
    }

    pub fn purges(&self) -> &PurgeScheduler {
        &self.purges
    }

    /// Request regeneration of `time` over the whole image
    ///
    /// Returns false if a regeneration is already in flight.
    pub fn request_regeneration(&mut self, time: i32) -> bool {
        let bounds = self.cache.image_bounds();
        self.regenerator.request(time, bounds)
    }

    pub fn cancel_regeneration(&mut self) -> Option<RegenerationOutcome> {
        self.regenerator.cancel()
    }

    /// Wait up to `max_wait` for work, then handle everything pending
    ///
    /// Wakes up early for a due timeout or purge. Returns the regeneration
    /// outcomes observed during this call.
    pub fn pump(&mut self, max_wait: Duration) -> Vec<RegenerationOutcome> {
        let mut outcomes = Vec::new();

        let now = Instant::now();
        let deadline = [self.regenerator.next_deadline(), self.purges.next_deadline()]
            .into_iter()
            .flatten()
            .fold(now + max_wait, Instant::min);

        let incoming = self.wait(deadline.saturating_duration_since(now));
        self.dispatch(incoming, &mut outcomes);

        // Drain whatever else arrived
        loop {
            match self.events.try_recv() {
                Ok(event) => self.dispatch(Incoming::Event(event), &mut outcomes),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        loop {
            match self.regenerator.mailbox().try_recv() {
                Ok(frame) => self.dispatch(Incoming::Converted(frame), &mut outcomes),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let now = Instant::now();
        outcomes.extend(self.regenerator.poll_timeout(now));
        self.purges.pump_at(now);

        outcomes
    }

    fn wait(&self, timeout: Duration) -> Incoming {
        let mut select = Select::new();
        let events = select.recv(&self.events);
        let mailbox = select.recv(self.regenerator.mailbox());
        let purges = select.recv(self.purges.requests());

        let Ok(operation) = select.select_timeout(timeout) else {
            return Incoming::Nothing;
        };

        match operation.index() {
            i if i == events => operation.recv(&self.events).map_or(Incoming::Nothing, Incoming::Event),
            i if i == mailbox => operation
                .recv(self.regenerator.mailbox())
                .map_or(Incoming::Nothing, Incoming::Converted),
            i if i == purges => operation
                .recv(self.purges.requests())
                .map_or(Incoming::Nothing, Incoming::Purge),
            _ => Incoming::Nothing,
        }
    }

    fn dispatch(&mut self, incoming: Incoming, outcomes: &mut Vec<RegenerationOutcome>) {
        let outcome = match incoming {
            Incoming::Event(event) => self.regenerator.handle_event(event, &self.cache),
            Incoming::Converted(frame) => self.regenerator.handle_converted(frame, &mut self.cache),
            Incoming::Purge(request) => {
                self.purges.schedule(request);
                None
            }
            Incoming::Nothing => None,
        };
        outcomes.extend(outcome);
    }
}
