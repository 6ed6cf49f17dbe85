//! Boundary with the external rendering pipeline

use anim_frame_cache::{ProjectionSource, Rect};
use crossbeam::channel::{unbounded, Receiver, Sender};

/// The rendering pipeline, as seen from the control thread
pub trait RenderingCollaborator: Send {
    /// Ask the pipeline to render `time`; completion arrives as a [`RenderEvent`]
    fn request_regeneration(&mut self, time: i32, bounds: &Rect);

    /// Pixel source holding the rendered projection for `time`
    ///
    /// `None` if the pipeline no longer has it.
    fn fetch_projection(&self, time: i32, region: &Rect) -> Option<Box<dyn ProjectionSource>>;
}

/// Signal posted by the rendering pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    FrameReady { time: i32 },
    FrameCancelled,
}

/// Handle the rendering pipeline uses to post [`RenderEvent`]s
#[derive(Debug, Clone)]
pub struct RenderEventSender {
    events: Sender<RenderEvent>,
}

impl RenderEventSender {
    /// Returns false if the control loop is gone
    pub fn frame_ready(&self, time: i32) -> bool {
        self.events.send(RenderEvent::FrameReady { time }).is_ok()
    }

    pub fn frame_cancelled(&self) -> bool {
        self.events.send(RenderEvent::FrameCancelled).is_ok()
    }
}

/// Create the render event channel
pub fn render_channel() -> (RenderEventSender, Receiver<RenderEvent>) {
    let (events, rx) = unbounded();
    (RenderEventSender { events }, rx)
}
