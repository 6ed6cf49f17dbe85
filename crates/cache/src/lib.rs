//! Animation Frame Cache Library
//!
//! Converted animation frames indexed by time, with pooled tile buffers and
//! optional compressed on-disk swap.

pub mod builder;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_cache;
pub mod pool;
pub mod purge;
pub mod rect;
pub mod serializer;
pub mod store;
pub mod swapper;
pub mod tile;

pub use builder::{ColorConverter, ConversionOptions, PixelTransform, ProjectionSource, ProofingConfig, UpdateInfoBuilder};
pub use config::FrameCacheConfig;
pub use error::{CacheError, CacheResult};
pub use frame::{Frame, FrameId, FrameTile};
pub use frame_cache::{
    AnimationFrameCache, CacheEntry, FrameCacheStats, FrameData, FrameDataFetcher, FrameStatus,
    IdenticalFramesProvider, TileUploader, TimeSpan, TimeSpanSet,
};
pub use pool::{PurgeRequest, SubPoolStats, TileBuffer, TileBufferPool, TileBufferPoolConfig};
pub use purge::PurgeScheduler;
pub use rect::{effective_level_of_detail, Rect};
pub use serializer::{FrameDataSerializer, FramePayload};
pub use store::{EncodedFrame, FrameCacheStore, FrameEncoder, StoredFrameKind};
pub use swapper::{
    create_swapper, DiskFrameSwapper, FrameCacheSwapper, FramePreparer, InMemoryFrameSwapper, PreparedFrame,
    SharedTiles,
};
pub use tile::{ColorSpaceTag, PixelFormat, TileEdges, TileGeometry, TileUpdateInfo};
