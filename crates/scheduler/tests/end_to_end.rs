//! Regeneration through the control loop, from request to upload

use std::sync::Arc;
use std::time::Duration;

use anim_frame_cache::{
    AnimationFrameCache, ColorSpaceTag, DiskFrameSwapper, FrameCacheConfig, FrameCacheStore, FrameCacheSwapper,
    FrameId, FramePreparer, FrameStatus, IdenticalFramesProvider, PixelFormat, PreparedFrame, ProjectionSource,
    PurgeScheduler, Rect, SharedTiles, TileUpdateInfo, TileUploader, TimeSpan, TimeSpanSet, UpdateInfoBuilder,
};
use anim_frame_scheduler::{
    render_channel, CacheRegenerator, ControlLoop, RegenerationOutcome, RenderEventSender, RenderingCollaborator,
};
use parking_lot::Mutex;
use tempfile::TempDir;

const BOUNDS: Rect = Rect::new(0, 0, 100, 100);

struct Checkerboard {
    time: i32,
}

impl ProjectionSource for Checkerboard {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::RGBA8
    }

    fn color_space(&self) -> ColorSpaceTag {
        ColorSpaceTag::new("sRGB")
    }

    fn read_pixels(&self, rect: &Rect, _level_of_detail: u32, dst: &mut [u8]) {
        let mut i = 0;
        for y in rect.top()..rect.bottom() {
            for x in rect.left()..rect.right() {
                let on = ((x / 8 + y / 8) % 2) as u8;
                dst[i..i + 4].copy_from_slice(&[on * 255, self.time as u8, 0, 255]);
                i += 4;
            }
        }
    }
}

#[derive(Clone, Default)]
struct FakeRenderer {
    requests: Arc<Mutex<Vec<(i32, Rect)>>>,
}

impl RenderingCollaborator for FakeRenderer {
    fn request_regeneration(&mut self, time: i32, bounds: &Rect) {
        self.requests.lock().push((time, *bounds));
    }

    fn fetch_projection(&self, time: i32, _region: &Rect) -> Option<Box<dyn ProjectionSource>> {
        Some(Box::new(Checkerboard { time }))
    }
}

struct Holds(Vec<TimeSpan>);

impl IdenticalFramesProvider for Holds {
    fn identical_frames(&self, time: i32) -> TimeSpanSet {
        self.0.iter().copied().filter(|span| span.contains(time)).collect()
    }
}

#[derive(Default)]
struct CountingUploader {
    calls: usize,
    rects: Vec<Rect>,
    first_pixel: Option<[u8; 4]>,
}

impl TileUploader for CountingUploader {
    fn upload(&mut self, tiles: &[TileUpdateInfo]) {
        self.calls += 1;
        self.rects = tiles.iter().map(|tile| tile.patch_rect).collect();
        self.first_pixel = tiles.first().map(|tile| {
            let px = tile.pixels();
            [px[0], px[1], px[2], px[3]]
        });
    }
}

fn config(temp_dir: &TempDir) -> FrameCacheConfig {
    FrameCacheConfig::default()
        .with_swap_directory(temp_dir.path())
        .with_tile_size(64, 64, 1)
}

fn setup(config: &FrameCacheConfig) -> (ControlLoop, RenderEventSender, FakeRenderer) {
    let renderer = FakeRenderer::default();
    let (control, events) = ControlLoop::with_config(config, BOUNDS, Box::new(renderer.clone()), None).unwrap();
    (control, events, renderer)
}

/// Pump until an outcome shows up
fn pump_until_outcome(control: &mut ControlLoop) -> RegenerationOutcome {
    for _ in 0..100 {
        if let Some(outcome) = control.pump(Duration::from_millis(50)).into_iter().next() {
            return outcome;
        }
    }
    panic!("no regeneration outcome");
}

#[test]
fn test_regenerate_then_upload_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let (mut control, events, renderer) = setup(&config(&temp_dir));

    assert!(control.request_regeneration(10));
    assert_eq!(*renderer.requests.lock(), vec![(10, BOUNDS)]);
    assert_eq!(control.cache().frame_status(10), FrameStatus::Uncached);

    assert!(events.frame_ready(10));
    let outcome = pump_until_outcome(&mut control);
    assert_eq!(outcome, RegenerationOutcome::Completed { time: 10, cached: true });
    assert_eq!(control.cache().frame_status(10), FrameStatus::Cached);
    assert_eq!(control.cache().frame_status(11), FrameStatus::Uncached);

    let mut uploader = CountingUploader::default();
    assert!(control.cache_mut().upload_frame(10, &mut uploader));
    assert_eq!(uploader.calls, 1);
    assert_eq!(
        uploader.rects,
        vec![
            Rect::new(0, 0, 65, 65),
            Rect::new(0, 63, 65, 37),
            Rect::new(63, 0, 37, 65),
            Rect::new(63, 63, 37, 37),
        ]
    );
    assert_eq!(uploader.first_pixel, Some([0, 10, 0, 255]));
}

#[test]
fn test_hold_is_cached_by_one_regeneration() {
    let temp_dir = TempDir::new().unwrap();
    let (mut control, events, _renderer) = setup(&config(&temp_dir).with_on_disk_swap(false));
    control
        .cache_mut()
        .set_identical_frames_provider(Box::new(Holds(vec![TimeSpan::new(10, 13)])));

    control.request_regeneration(11);
    events.frame_ready(11);
    pump_until_outcome(&mut control);

    for time in 10..13 {
        assert_eq!(control.cache().frame_status(time), FrameStatus::Cached);
    }
    assert_eq!(control.cache().stats().stored_frames, 1);
}

#[test]
fn test_stale_and_cancelled_events_leave_cache_alone() {
    let temp_dir = TempDir::new().unwrap();
    let (mut control, events, _renderer) = setup(&config(&temp_dir));

    control.request_regeneration(5);
    assert!(!control.request_regeneration(6));

    events.frame_ready(4);
    assert!(control.pump(Duration::from_millis(20)).is_empty());
    assert!(!control.regenerator().is_idle());

    events.frame_cancelled();
    let outcome = pump_until_outcome(&mut control);
    assert_eq!(outcome, RegenerationOutcome::Cancelled { time: 5 });
    assert_eq!(control.cache().frame_status(5), FrameStatus::Uncached);

    // A late completion for the cancelled request
    events.frame_ready(5);
    assert!(control.pump(Duration::from_millis(20)).is_empty());
    assert_eq!(control.cache().frame_status(5), FrameStatus::Uncached);
    assert!(control.regenerator().is_idle());
}

#[test]
fn test_cancel_from_control_side() {
    let temp_dir = TempDir::new().unwrap();
    let (mut control, events, _renderer) = setup(&config(&temp_dir));

    control.request_regeneration(3);
    assert_eq!(control.cancel_regeneration(), Some(RegenerationOutcome::Cancelled { time: 3 }));
    assert_eq!(control.cancel_regeneration(), None);

    events.frame_ready(3);
    assert!(control.pump(Duration::from_millis(20)).is_empty());
    assert_eq!(control.cache().frame_status(3), FrameStatus::Uncached);
}

#[test]
fn test_timeout_returns_to_idle() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir).with_regeneration_timeout(Duration::from_millis(30));
    let (mut control, events, _renderer) = setup(&config);

    control.request_regeneration(7);
    let outcome = pump_until_outcome(&mut control);
    assert_eq!(outcome, RegenerationOutcome::TimedOut { time: 7 });
    assert!(control.regenerator().is_idle());

    events.frame_ready(7);
    assert!(control.pump(Duration::from_millis(20)).is_empty());
    assert_eq!(control.cache().frame_status(7), FrameStatus::Uncached);

    // The regenerator accepts new work after a timeout
    assert!(control.request_regeneration(7));
}

#[test]
fn test_invalidation_after_regeneration() {
    let temp_dir = TempDir::new().unwrap();
    let (mut control, events, _renderer) = setup(&config(&temp_dir));

    for time in [1, 2] {
        control.request_regeneration(time);
        events.frame_ready(time);
        pump_until_outcome(&mut control);
    }
    assert_eq!(control.cache().stats().stored_frames, 2);

    control.cache_mut().frames_changed(TimeSpan::infinite_from(2));
    assert_eq!(control.cache().frame_status(1), FrameStatus::Cached);
    assert_eq!(control.cache().frame_status(2), FrameStatus::Uncached);
    assert_eq!(control.cache().swapper().frame_count(), 1);
    assert!(control.cache().check_invariants().is_ok());
}

#[test]
fn test_idle_pool_is_purged_after_debounce() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir)
        .with_on_disk_swap(false)
        .with_purge_debounce(Duration::from_millis(10));
    config.pool_purge_threshold = 1;
    let (mut control, events, _renderer) = setup(&config);

    control.request_regeneration(1);
    events.frame_ready(1);
    pump_until_outcome(&mut control);

    let pool = Arc::clone(control.cache().builder().pool());
    assert_eq!(pool.stats_for(4).unwrap().live, 4);

    control.cache_mut().clear();
    let stats = pool.stats_for(4).unwrap();
    assert_eq!(stats.live, 0);
    assert!(stats.free > 0);

    for _ in 0..100 {
        control.pump(Duration::from_millis(20));
        if pool.stats_for(4).unwrap().reserved == 0 {
            break;
        }
    }
    let stats = pool.stats_for(4).unwrap();
    assert_eq!(stats.reserved, 0);
    assert_eq!(stats.free, 0);
    assert_eq!(control.purges().pending_count(), 0);
}

/// How each save reached the swapper, and on which thread
#[derive(Debug, Clone, PartialEq, Eq)]
enum SaveCall {
    Tiles(Option<String>),
    Encoded(Option<String>),
}

/// Disk swapper that records its saves
struct RecordingSwapper {
    inner: DiskFrameSwapper,
    saves: Arc<Mutex<Vec<SaveCall>>>,
}

impl RecordingSwapper {
    fn record(&self, call: fn(Option<String>) -> SaveCall) {
        let thread = std::thread::current().name().map(str::to_string);
        self.saves.lock().push(call(thread));
    }
}

impl FrameCacheSwapper for RecordingSwapper {
    fn save_frame(&mut self, frame_id: FrameId, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) {
        self.record(SaveCall::Tiles);
        self.inner.save_frame(frame_id, tiles, image_bounds);
    }

    fn preparer(&self) -> FramePreparer {
        self.inner.preparer()
    }

    fn save_prepared(&mut self, frame_id: FrameId, frame: PreparedFrame, image_bounds: &Rect) {
        match &frame {
            PreparedFrame::Tiles(_) => self.record(SaveCall::Tiles),
            PreparedFrame::Encoded(_) => self.record(SaveCall::Encoded),
        }
        self.inner.save_prepared(frame_id, frame, image_bounds);
    }

    fn load_frame(&mut self, frame_id: FrameId) -> Option<SharedTiles> {
        self.inner.load_frame(frame_id)
    }

    fn move_frame(&mut self, src: FrameId, dst: FrameId) {
        self.inner.move_frame(src, dst);
    }

    fn forget_frame(&mut self, frame_id: FrameId) {
        self.inner.forget_frame(frame_id);
    }

    fn has_frame(&self, frame_id: FrameId) -> bool {
        self.inner.has_frame(frame_id)
    }

    fn frame_level_of_detail(&self, frame_id: FrameId) -> Option<u32> {
        self.inner.frame_level_of_detail(frame_id)
    }

    fn frame_dirty_rect(&self, frame_id: FrameId) -> Option<Rect> {
        self.inner.frame_dirty_rect(frame_id)
    }

    fn frame_count(&self) -> usize {
        self.inner.frame_count()
    }
}

#[test]
fn test_control_thread_only_commits_compressed_frames() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    let saves = Arc::new(Mutex::new(Vec::new()));

    let swap_directory = temp_dir.path().to_path_buf();
    let recorded = Arc::clone(&saves);

    let control = std::thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let (pool, purges) = PurgeScheduler::with_pool(config.pool_config(), config.purge_debounce());
            let builder = Arc::new(UpdateInfoBuilder::new(config.tile_geometry(), Arc::clone(&pool)));
            let store = FrameCacheStore::new(&swap_directory, pool).unwrap();
            let swapper = RecordingSwapper {
                inner: DiskFrameSwapper::new(store, Arc::clone(&builder)),
                saves: recorded,
            };
            let cache = AnimationFrameCache::with_swapper(Box::new(swapper), builder, BOUNDS, 0);
            let regenerator =
                CacheRegenerator::new(Box::new(FakeRenderer::default()), config.regeneration_timeout());
            let (events, receiver) = render_channel();
            let mut control = ControlLoop::new(cache, regenerator, purges, receiver);

            assert!(control.request_regeneration(10));
            assert!(events.frame_ready(10));
            let outcome = pump_until_outcome(&mut control);

            let mut uploader = CountingUploader::default();
            assert!(control.cache_mut().upload_frame(10, &mut uploader));
            (outcome, uploader.first_pixel)
        })
        .unwrap();

    let (outcome, first_pixel) = control.join().unwrap();
    assert_eq!(outcome, RegenerationOutcome::Completed { time: 10, cached: true });
    assert_eq!(first_pixel, Some([0, 10, 0, 255]));
    assert_eq!(*saves.lock(), vec![SaveCall::Encoded(Some("control".to_string()))]);
}
