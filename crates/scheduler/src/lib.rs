//! Animation Frame Scheduler Library
//!
//! Asynchronous regeneration of animation frames into the frame cache.
//!
//! The rendering pipeline renders one frame at a time on its own thread and
//! reports back through a [`RenderEventSender`]. Conversion of the rendered
//! tiles runs on a [`ConversionWorker`]. Everything that touches the cache
//! index happens on the thread calling [`ControlLoop::pump`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use anim_frame_cache::{FrameCacheConfig, ProjectionSource, Rect};
//! use anim_frame_scheduler::{ControlLoop, RenderingCollaborator};
//!
//! struct Offline;
//!
//! impl RenderingCollaborator for Offline {
//!     fn request_regeneration(&mut self, _time: i32, _bounds: &Rect) {}
//!
//!     fn fetch_projection(&self, _time: i32, _region: &Rect) -> Option<Box<dyn ProjectionSource>> {
//!         None
//!     }
//! }
//!
//! let config = FrameCacheConfig::default().with_on_disk_swap(false);
//! let (mut control, events) =
//!     ControlLoop::with_config(&config, Rect::new(0, 0, 640, 480), Box::new(Offline), None).unwrap();
//!
//! assert!(control.request_regeneration(10));
//! events.frame_cancelled();
//! let outcomes = control.pump(Duration::from_millis(100));
//! assert_eq!(outcomes.len(), 1);
//! ```

mod cancel;
mod control;
mod regenerator;
mod render;
mod timeout;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use control::ControlLoop;
pub use regenerator::{CacheRegenerator, ConvertedFrame, RegenerationOutcome, RegenerationState};
pub use render::{render_channel, RenderEvent, RenderEventSender, RenderingCollaborator};
pub use timeout::DeadManSwitch;
pub use worker::{ConversionJob, ConversionWorker};
