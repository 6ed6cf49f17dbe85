//! On-disk frame files
//!
//! [`FrameDataSerializer`] is the lowest storage tier. It writes each
//! [`Frame`] into its own file and knows nothing about animation time.
//!
//! Files live under a per-instance directory and are bucketed by
//! `frame_id & 0xFF00` to bound directory fan-out:
//!
//! ```text
//! <swap_directory>/frame-cache-<pid>-<n>/<bucket:08x>/frame_<frame_id>
//! ```
//!
//! File layout, all integers little-endian `i32`:
//!
//! ```text
//! frame_id, pixel_size, tile_count
//! tile_count x { col, row, x, y, width, height, is_compressed: u8, payload_len, payload }
//! ```
//!
//! Each tile payload is LZ4 compressed when that makes it strictly smaller.
//! Compression is split from the file write: [`FrameDataSerializer::encode`]
//! needs no serializer and can run on any thread, and
//! [`FrameDataSerializer::save_payload`] only writes the bytes out.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};
use crate::frame::{Frame, FrameId, FrameTile};
use crate::pool::TileBufferPool;
use crate::rect::Rect;

static INSTANCE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Largest pixel size a stored frame may declare
pub const MAX_PIXEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
struct EncodedTile {
    col: i32,
    row: i32,
    rect: Rect,
    is_compressed: bool,
    bytes: Vec<u8>,
}

/// Tile payloads of one frame, compressed and ready to be written
#[derive(Debug, Clone)]
pub struct FramePayload {
    pixel_size: usize,
    tiles: Vec<EncodedTile>,
}

impl FramePayload {
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Bytes the tiles take in the file
    pub fn encoded_size(&self) -> usize {
        self.tiles.iter().map(|tile| tile.bytes.len()).sum()
    }
}

/// Compresses frames into files and back
pub struct FrameDataSerializer {
    root: PathBuf,
    pool: Arc<TileBufferPool>,
    next_frame_id: FrameId,
}

impl FrameDataSerializer {
    /// Create a serializer with a fresh directory under `swap_directory`
    ///
    /// The directory is removed again when the serializer is dropped.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(swap_directory: &Path, pool: Arc<TileBufferPool>) -> CacheResult<Self> {
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = swap_directory.join(format!("frame-cache-{}-{}", std::process::id(), instance));
        fs::create_dir_all(&root)?;

        tracing::debug!(root = %root.display(), "frame serializer created");

        Ok(Self {
            root,
            pool,
            next_frame_id: 1,
        })
    }

    /// Directory owned by this serializer
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool(&self) -> &Arc<TileBufferPool> {
        &self.pool
    }

    /// Path of the file holding `frame_id`
    pub fn frame_file_path(&self, frame_id: FrameId) -> PathBuf {
        self.root
            .join(format!("{:08x}", frame_id & 0xFF00))
            .join(format!("frame_{}", frame_id))
    }

    /// Compress the tiles of `frame`
    pub fn encode(frame: &Frame) -> FramePayload {
        let tiles = frame
            .tiles
            .iter()
            .map(|tile| {
                debug_assert_eq!(tile.data.len(), tile.rect.area() * frame.pixel_size);

                let compressed = lz4_flex::block::compress(&tile.data);
                let is_compressed = compressed.len() < tile.data.len();
                EncodedTile {
                    col: tile.col,
                    row: tile.row,
                    rect: tile.rect,
                    is_compressed,
                    bytes: if is_compressed { compressed } else { tile.data.to_vec() },
                }
            })
            .collect();

        FramePayload {
            pixel_size: frame.pixel_size,
            tiles,
        }
    }

    /// Write `frame` to disk under a new id
    ///
    /// The id stored in `frame` is ignored.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, frame: &Frame) -> CacheResult<FrameId> {
        self.save_payload(&Self::encode(frame))
    }

    /// Write an encoded frame to disk under a new id
    ///
    /// A partially written file is removed on failure.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_payload(&mut self, payload: &FramePayload) -> CacheResult<FrameId> {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let path = self.frame_file_path(frame_id);
        if let Err(err) = write_frame_file(&path, frame_id, payload) {
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        tracing::trace!(frame_id, tiles = payload.tiles.len(), "frame saved");
        Ok(frame_id)
    }

    /// Read the frame stored under `frame_id`
    ///
    /// # Errors
    /// Returns [`CacheError::MissingFrame`] if no such file exists and
    /// [`CacheError::Corrupted`] if the stored data does not describe
    /// `frame_id` or does not fit the pool.
    pub fn load(&self, frame_id: FrameId) -> CacheResult<Frame> {
        let path = self.frame_file_path(frame_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::MissingFrame(frame_id));
            }
            Err(err) => return Err(err.into()),
        };

        let mut reader = bytes.as_slice();

        let stored_id = read_i32(&mut reader)?;
        debug_assert_eq!(stored_id, frame_id, "stored frame id does not match the requested one");
        if stored_id != frame_id {
            return Err(CacheError::corrupted(
                frame_id,
                format!("file holds frame {}", stored_id),
            ));
        }

        let pixel_size = read_i32(&mut reader)?;
        let tile_count = read_i32(&mut reader)?;
        if pixel_size < 0
            || pixel_size as usize > MAX_PIXEL_SIZE
            || tile_count < 0
            || (pixel_size == 0 && tile_count > 0)
        {
            return Err(CacheError::corrupted(frame_id, "invalid header"));
        }
        let pixel_size = pixel_size as usize;

        let mut frame = Frame::new(frame_id, pixel_size);
        frame.tiles.reserve(tile_count as usize);

        for _ in 0..tile_count {
            let col = read_i32(&mut reader)?;
            let row = read_i32(&mut reader)?;
            let rect = Rect::new(
                read_i32(&mut reader)?,
                read_i32(&mut reader)?,
                read_i32(&mut reader)?,
                read_i32(&mut reader)?,
            );
            let is_compressed = read_u8(&mut reader)? != 0;
            let payload_len = read_i32(&mut reader)?;
            if payload_len < 0 || payload_len as usize > reader.len() {
                return Err(CacheError::corrupted(frame_id, "payload exceeds file size"));
            }
            let (payload, rest) = reader.split_at(payload_len as usize);
            reader = rest;

            let Some(mut data) = self.pool.allocate_pixels(pixel_size, rect.area()) else {
                return Err(CacheError::corrupted(frame_id, "tile does not fit a pooled chunk"));
            };

            if is_compressed {
                let written = lz4_flex::block::decompress_into(payload, &mut data)?;
                if written != data.len() {
                    return Err(CacheError::corrupted(frame_id, "decompressed size mismatch"));
                }
            } else {
                if payload.len() != data.len() {
                    return Err(CacheError::corrupted(frame_id, "raw payload size mismatch"));
                }
                data.copy_from_slice(payload);
            }

            frame.tiles.push(FrameTile::new(col, row, rect, data));
        }

        Ok(frame)
    }

    /// Re-key a stored frame from `src` to `dst`
    ///
    /// Rewrites the id stored in the file so the moved frame still loads,
    /// and makes sure later saves never hand out `dst` again.
    ///
    /// # Errors
    /// Returns an error if `src` does not exist or the file cannot be moved.
    pub fn move_frame(&mut self, src: FrameId, dst: FrameId) -> CacheResult<()> {
        let src_path = self.frame_file_path(src);
        if !src_path.exists() {
            return Err(CacheError::MissingFrame(src));
        }

        let dst_path = self.frame_file_path(dst);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src_path, &dst_path)?;

        let mut file = OpenOptions::new().write(true).open(&dst_path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&dst.to_le_bytes())?;

        self.next_frame_id = self.next_frame_id.max(dst.saturating_add(1));

        tracing::debug!(src, dst, "frame file moved");
        Ok(())
    }

    /// Delete the file of `frame_id`; forgetting an unknown id is a no-op
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be removed.
    pub fn forget(&mut self, frame_id: FrameId) -> CacheResult<()> {
        match fs::remove_file(self.frame_file_path(frame_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn has_frame(&self, frame_id: FrameId) -> bool {
        self.frame_file_path(frame_id).is_file()
    }
}

impl Drop for FrameDataSerializer {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(root = %self.root.display(), error = %err, "failed to remove frame cache directory");
            }
        }
    }
}

fn write_frame_file(path: &Path, frame_id: FrameId, payload: &FramePayload) -> CacheResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);

    write_i32(&mut writer, frame_id)?;
    write_i32(&mut writer, to_i32(payload.pixel_size, frame_id)?)?;
    write_i32(&mut writer, to_i32(payload.tiles.len(), frame_id)?)?;

    for tile in &payload.tiles {
        write_i32(&mut writer, tile.col)?;
        write_i32(&mut writer, tile.row)?;
        write_i32(&mut writer, tile.rect.x)?;
        write_i32(&mut writer, tile.rect.y)?;
        write_i32(&mut writer, tile.rect.width)?;
        write_i32(&mut writer, tile.rect.height)?;
        writer.write_all(&[u8::from(tile.is_compressed)])?;
        write_i32(&mut writer, to_i32(tile.bytes.len(), frame_id)?)?;
        writer.write_all(&tile.bytes)?;
    }

    writer.flush()?;
    Ok(())
}

fn to_i32(value: usize, frame_id: FrameId) -> CacheResult<i32> {
    i32::try_from(value).map_err(|_| CacheError::corrupted(frame_id, "value exceeds i32 range"))
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn read_i32(reader: &mut &[u8]) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_u8(reader: &mut &[u8]) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TileBufferPoolConfig;
    use crate::tile::TileGeometry;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn setup() -> (TempDir, FrameDataSerializer) {
        let temp_dir = TempDir::new().unwrap();
        let pool = TileBufferPool::new(TileBufferPoolConfig {
            geometry: TileGeometry::new(64, 64, 1),
            ..Default::default()
        });
        let serializer = FrameDataSerializer::new(temp_dir.path(), pool).unwrap();
        (temp_dir, serializer)
    }

    fn random_frame(pool: &TileBufferPool, rng: &mut StdRng, tile_count: usize) -> Frame {
        let pixel_size = 4;
        let mut frame = Frame::new(0, pixel_size);
        for i in 0..tile_count {
            let width = rng.gen_range(1..=66);
            let height = rng.gen_range(1..=66);
            let rect = Rect::new(i as i32 * 64, 0, width, height);
            let mut data = pool.allocate_pixels(pixel_size, rect.area()).unwrap();
            if rng.gen_bool(0.5) {
                rng.fill(&mut data[..]);
            } else {
                // Compressible: a few distinct values
                let value = rng.gen::<u8>();
                data.fill(value);
            }
            frame.tiles.push(FrameTile::new(i as i32, 0, rect, data));
        }
        frame
    }

    fn assert_same_tiles(lhs: &Frame, rhs: &Frame) {
        assert_eq!(lhs.pixel_size, rhs.pixel_size);
        assert_eq!(lhs.tiles.len(), rhs.tiles.len());
        for (a, b) in lhs.tiles.iter().zip(&rhs.tiles) {
            assert_eq!((a.col, a.row, a.rect), (b.col, b.row, b.rect));
            assert_eq!(&a.data[..], &b.data[..]);
        }
    }

    #[test]
    fn test_round_trip() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(42);

        for tile_count in [1, 2, 17, 100] {
            let frame = random_frame(&pool, &mut rng, tile_count);
            let frame_id = serializer.save(&frame).unwrap();
            let loaded = serializer.load(frame_id).unwrap();

            assert_eq!(loaded.frame_id, frame_id);
            assert_same_tiles(&frame, &loaded);
        }
    }

    #[test]
    fn test_ids_increase() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(1);
        let frame = random_frame(&pool, &mut rng, 1);

        let a = serializer.save(&frame).unwrap();
        let b = serializer.save(&frame).unwrap();
        let c = serializer.save(&frame).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_has_frame_after_save_and_forget() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(2);

        let f1 = serializer.save(&random_frame(&pool, &mut rng, 3)).unwrap();
        let f2 = serializer.save(&random_frame(&pool, &mut rng, 3)).unwrap();
        let f3 = serializer.save(&random_frame(&pool, &mut rng, 3)).unwrap();
        assert!(serializer.has_frame(f1) && serializer.has_frame(f2) && serializer.has_frame(f3));

        serializer.forget(f2).unwrap();
        assert!(serializer.has_frame(f1));
        assert!(!serializer.has_frame(f2));
        assert!(serializer.has_frame(f3));

        serializer.forget(f3).unwrap();
        assert!(serializer.has_frame(f1));
        assert!(!serializer.has_frame(f3));

        serializer.forget(f1).unwrap();
        assert!(!serializer.has_frame(f1));

        // Forgetting twice is harmless
        serializer.forget(f1).unwrap();
    }

    #[test]
    fn test_file_location_and_layout() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());

        // Incompressible tile is stored raw
        let mut rng = StdRng::seed_from_u64(3);
        let rect = Rect::new(0, 0, 8, 8);
        let mut data = pool.allocate_pixels(4, rect.area()).unwrap();
        rng.fill(&mut data[..]);
        let mut frame = Frame::new(0, 4);
        frame.tiles.push(FrameTile::new(0, 0, rect, data));

        let frame_id = serializer.save(&frame).unwrap();
        let path = serializer.frame_file_path(frame_id);
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "00000000");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("frame_{}", frame_id));

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &frame_id.to_le_bytes());
        assert_eq!(&bytes[4..8], &4i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1i32.to_le_bytes());
        // 3 header ints, 6 tile ints, flag byte, length, payload
        assert_eq!(bytes.len(), 12 + 24 + 1 + 4 + 256);
        assert_eq!(bytes[36], 0);
    }

    #[test]
    fn test_compressible_tile_is_smaller() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());

        let rect = Rect::new(0, 0, 64, 64);
        let mut data = pool.allocate_pixels(4, rect.area()).unwrap();
        data.fill(7);
        let mut frame = Frame::new(0, 4);
        frame.tiles.push(FrameTile::new(0, 0, rect, data));

        let frame_id = serializer.save(&frame).unwrap();
        let bytes = fs::read(serializer.frame_file_path(frame_id)).unwrap();
        assert_eq!(bytes[36], 1);
        assert!(bytes.len() < 64 * 64 * 4);

        let loaded = serializer.load(frame_id).unwrap();
        assert!(loaded.tiles[0].data.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_encode_on_another_thread() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(12);
        let frame = random_frame(&pool, &mut rng, 6);

        let payload = std::thread::scope(|scope| {
            scope
                .spawn(|| FrameDataSerializer::encode(&frame))
                .join()
                .unwrap()
        });
        assert_eq!(payload.tile_count(), 6);
        assert_eq!(payload.pixel_size(), 4);
        assert!(payload.encoded_size() <= frame.byte_size());

        let frame_id = serializer.save_payload(&payload).unwrap();
        assert_same_tiles(&frame, &serializer.load(frame_id).unwrap());
    }

    #[test]
    fn test_oversized_pixel_size_is_corrupted() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(13);
        let rect = Rect::new(0, 0, 1, 1);
        let mut data = pool.allocate_pixels(4, rect.area()).unwrap();
        rng.fill(&mut data[..]);
        let mut frame = Frame::new(0, 4);
        frame.tiles.push(FrameTile::new(0, 0, rect, data));
        let frame_id = serializer.save(&frame).unwrap();

        let path = serializer.frame_file_path(frame_id);
        let mut bytes = fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&0x7fff_ffffi32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(serializer.load(frame_id), Err(CacheError::Corrupted { .. })));
        // No sub-pool was created for the bogus pixel size
        assert!(pool.stats_for(0x7fff_ffff).is_none());
    }

    #[test]
    fn test_bucket_directory() {
        let (_temp, serializer) = setup();
        let path = serializer.frame_file_path(0x1234);
        assert!(path.ends_with("00001200/frame_4660"));
    }

    #[test]
    fn test_move_rewrites_id() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(4);
        let frame = random_frame(&pool, &mut rng, 5);

        let src = serializer.save(&frame).unwrap();
        serializer.move_frame(src, 300).unwrap();

        assert!(!serializer.has_frame(src));
        assert!(serializer.has_frame(300));

        let loaded = serializer.load(300).unwrap();
        assert_eq!(loaded.frame_id, 300);
        assert_same_tiles(&frame, &loaded);

        assert_eq!(serializer.save(&frame).unwrap(), 301);
    }

    #[test]
    fn test_move_missing_frame() {
        let (_temp, mut serializer) = setup();
        assert!(matches!(serializer.move_frame(5, 6), Err(CacheError::MissingFrame(5))));
    }

    #[test]
    fn test_load_missing_frame() {
        let (_temp, serializer) = setup();
        assert!(matches!(serializer.load(9), Err(CacheError::MissingFrame(9))));
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(5);
        let frame_id = serializer.save(&random_frame(&pool, &mut rng, 4)).unwrap();

        let path = serializer.frame_file_path(frame_id);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(serializer.load(frame_id).is_err());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "stored frame id"))]
    fn test_load_detects_id_mismatch() {
        let (_temp, mut serializer) = setup();
        let pool = Arc::clone(serializer.pool());
        let mut rng = StdRng::seed_from_u64(6);
        let a = serializer.save(&random_frame(&pool, &mut rng, 2)).unwrap();

        let target = serializer.frame_file_path(77);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::copy(serializer.frame_file_path(a), &target).unwrap();

        assert!(matches!(serializer.load(77), Err(CacheError::Corrupted { frame_id: 77, .. })));
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let (temp, serializer) = setup();
        let root = serializer.root().to_path_buf();
        assert!(root.starts_with(temp.path()));
        assert!(root.is_dir());

        drop(serializer);
        assert!(!root.exists());
    }

    #[test]
    fn test_instances_do_not_share_directories() {
        let temp_dir = TempDir::new().unwrap();
        let pool = TileBufferPool::new(TileBufferPoolConfig::default());
        let a = FrameDataSerializer::new(temp_dir.path(), Arc::clone(&pool)).unwrap();
        let b = FrameDataSerializer::new(temp_dir.path(), pool).unwrap();
        assert_ne!(a.root(), b.root());
    }
}
