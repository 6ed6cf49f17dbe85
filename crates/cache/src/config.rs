//! Frame cache configuration
//!
//! Settings can be loaded from a JSON file, environment variables, or
//! created programmatically. Missing file keys take their defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::pool::TileBufferPoolConfig;
use crate::tile::TileGeometry;

/// Configuration for the animation frame cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameCacheConfig {
    /// Store frames on disk instead of keeping them in memory
    pub use_on_disk_swap: bool,
    /// Directory under which frame files are written
    pub swap_directory: PathBuf,
    /// Largest frame dimension cached at full resolution (0 disables)
    pub frame_size_limit: u32,
    /// Master switch for `frame_size_limit`
    pub enable_frame_size_limit: bool,
    /// Tile width in pixels
    pub tile_width: i32,
    /// Tile height in pixels
    pub tile_height: i32,
    /// Border added around every physical tile
    pub texture_border: i32,
    /// Minimum chunks reserved per pool growth step
    pub pool_min_chunks_per_step: usize,
    /// Maximum chunks reserved per pool growth step
    pub pool_max_chunks_per_step: usize,
    /// High-water mark above which an idle sub-pool is purged
    pub pool_purge_threshold: usize,
    /// Quiescence window before a purge runs, in milliseconds
    pub purge_debounce_ms: u64,
    /// Time allowed for one regeneration, in milliseconds
    pub regeneration_timeout_ms: u64,
}

impl Default for FrameCacheConfig {
    fn default() -> Self {
        Self {
            use_on_disk_swap: true,
            swap_directory: Self::default_swap_directory(),
            frame_size_limit: 2500,
            enable_frame_size_limit: false,
            tile_width: 256,
            tile_height: 256,
            texture_border: 1,
            pool_min_chunks_per_step: 4,
            pool_max_chunks_per_step: 64,
            pool_purge_threshold: 16,
            purge_debounce_ms: 3000,
            regeneration_timeout_ms: 10_000,
        }
    }
}

impl FrameCacheConfig {
    /// Selects the disk-backed or the in-memory swapper.
    pub fn with_on_disk_swap(mut self, enabled: bool) -> Self {
        self.use_on_disk_swap = enabled;
        self
    }

    /// Sets the swap directory.
    pub fn with_swap_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.swap_directory = path.as_ref().to_path_buf();
        self
    }

    /// Sets the frame size limit and enables it.
    pub fn with_frame_size_limit(mut self, limit: u32) -> Self {
        self.frame_size_limit = limit;
        self.enable_frame_size_limit = true;
        self
    }

    /// Sets the tile grid.
    pub fn with_tile_size(mut self, width: i32, height: i32, border: i32) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self.texture_border = border;
        self
    }

    /// Sets the purge debounce window.
    pub fn with_purge_debounce(mut self, debounce: Duration) -> Self {
        self.purge_debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Sets the regeneration timeout.
    pub fn with_regeneration_timeout(mut self, timeout: Duration) -> Self {
        self.regeneration_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the default swap directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/anim-frame-cache/swap
    /// - Linux: ~/.cache/anim-frame-cache/swap
    /// - Windows: %LOCALAPPDATA%\anim-frame-cache\swap
    pub fn default_swap_directory() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("anim-frame-cache").join("swap")
        } else {
            std::env::temp_dir().join("anim-frame-cache").join("swap")
        }
    }

    /// Frame size limit to apply, 0 when the limit is switched off
    pub fn effective_frame_size_limit(&self) -> u32 {
        if self.enable_frame_size_limit {
            self.frame_size_limit
        } else {
            0
        }
    }

    pub fn tile_geometry(&self) -> TileGeometry {
        TileGeometry::new(self.tile_width, self.tile_height, self.texture_border)
    }

    pub fn pool_config(&self) -> TileBufferPoolConfig {
        TileBufferPoolConfig {
            geometry: self.tile_geometry(),
            min_chunks_per_step: self.pool_min_chunks_per_step,
            max_chunks_per_step: self.pool_max_chunks_per_step,
            purge_threshold: self.pool_purge_threshold,
        }
    }

    pub fn purge_debounce(&self) -> Duration {
        Duration::from_millis(self.purge_debounce_ms)
    }

    pub fn regeneration_timeout(&self) -> Duration {
        Duration::from_millis(self.regeneration_timeout_ms)
    }

    /// Checks that the tile grid and pool settings are usable.
    ///
    /// # Errors
    /// Returns the name of the first offending key.
    pub fn validate(&self) -> CacheResult<()> {
        if self.tile_width <= 0 {
            return Err(CacheError::InvalidConfig("tile_width".to_string()));
        }
        if self.tile_height <= 0 {
            return Err(CacheError::InvalidConfig("tile_height".to_string()));
        }
        if self.texture_border < 0 {
            return Err(CacheError::InvalidConfig("texture_border".to_string()));
        }
        if self.pool_min_chunks_per_step == 0 || self.pool_min_chunks_per_step > self.pool_max_chunks_per_step {
            return Err(CacheError::InvalidConfig("pool_min_chunks_per_step".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ANIM_CACHE_USE_DISK_SWAP`: `true`/`false` (default: true)
    /// - `ANIM_CACHE_SWAP_DIR`: swap directory path
    /// - `ANIM_CACHE_FRAME_SIZE_LIMIT`: pixel ceiling (default: 2500)
    /// - `ANIM_CACHE_ENABLE_FRAME_SIZE_LIMIT`: `true`/`false` (default: false)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> CacheResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ANIM_CACHE_USE_DISK_SWAP") {
            config.use_on_disk_swap = parse_bool(&val)
                .ok_or_else(|| CacheError::InvalidConfig("ANIM_CACHE_USE_DISK_SWAP".to_string()))?;
        }

        if let Ok(val) = std::env::var("ANIM_CACHE_SWAP_DIR") {
            config.swap_directory = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANIM_CACHE_FRAME_SIZE_LIMIT") {
            config.frame_size_limit = val
                .trim()
                .parse::<u32>()
                .map_err(|_| CacheError::InvalidConfig("ANIM_CACHE_FRAME_SIZE_LIMIT".to_string()))?;
        }

        if let Ok(val) = std::env::var("ANIM_CACHE_ENABLE_FRAME_SIZE_LIMIT") {
            config.enable_frame_size_limit = parse_bool(&val)
                .ok_or_else(|| CacheError::InvalidConfig("ANIM_CACHE_ENABLE_FRAME_SIZE_LIMIT".to_string()))?;
        }

        Ok(config)
    }

    /// Loads configuration from a JSON file.
    ///
    /// Expected file format:
    /// ```json
    /// {
    ///   "use_on_disk_swap": true,
    ///   "swap_directory": "/path/to/swap",
    ///   "frame_size_limit": 2500,
    ///   "enable_frame_size_limit": false
    /// }
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Saves configuration to a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> CacheResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 4] = [
        "ANIM_CACHE_USE_DISK_SWAP",
        "ANIM_CACHE_SWAP_DIR",
        "ANIM_CACHE_FRAME_SIZE_LIMIT",
        "ANIM_CACHE_ENABLE_FRAME_SIZE_LIMIT",
    ];

    #[test]
    fn test_default_config() {
        let config = FrameCacheConfig::default();
        assert!(config.use_on_disk_swap);
        assert_eq!(config.frame_size_limit, 2500);
        assert!(!config.enable_frame_size_limit);
        assert_eq!(config.tile_geometry(), TileGeometry::new(256, 256, 1));
        assert_eq!(config.regeneration_timeout(), Duration::from_secs(10));
        assert!(config.swap_directory.ends_with("anim-frame-cache/swap"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = FrameCacheConfig::default()
            .with_on_disk_swap(false)
            .with_swap_directory("/custom/path")
            .with_frame_size_limit(1024)
            .with_tile_size(64, 32, 2)
            .with_purge_debounce(Duration::from_millis(50))
            .with_regeneration_timeout(Duration::from_secs(1));

        assert!(!config.use_on_disk_swap);
        assert_eq!(config.swap_directory, PathBuf::from("/custom/path"));
        assert_eq!(config.effective_frame_size_limit(), 1024);
        assert_eq!(config.pool_config().geometry, TileGeometry::new(64, 32, 2));
        assert_eq!(config.purge_debounce(), Duration::from_millis(50));
        assert_eq!(config.regeneration_timeout_ms, 1000);
    }

    #[test]
    fn test_effective_frame_size_limit() {
        let mut config = FrameCacheConfig::default();
        assert_eq!(config.effective_frame_size_limit(), 0);

        config.enable_frame_size_limit = true;
        assert_eq!(config.effective_frame_size_limit(), 2500);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let config = FrameCacheConfig::default().with_tile_size(0, 64, 1);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(key)) if key == "tile_width"));

        let mut config = FrameCacheConfig::default();
        config.pool_min_chunks_per_step = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("ANIM_CACHE_USE_DISK_SWAP", "false");
        env::set_var("ANIM_CACHE_SWAP_DIR", "/tmp/test-swap");
        env::set_var("ANIM_CACHE_FRAME_SIZE_LIMIT", "1024");
        env::set_var("ANIM_CACHE_ENABLE_FRAME_SIZE_LIMIT", "1");

        let config = FrameCacheConfig::from_env().unwrap();
        assert!(!config.use_on_disk_swap);
        assert_eq!(config.swap_directory, PathBuf::from("/tmp/test-swap"));
        assert_eq!(config.frame_size_limit, 1024);
        assert_eq!(config.effective_frame_size_limit(), 1024);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);

        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("ANIM_CACHE_FRAME_SIZE_LIMIT", "512");

        let config = FrameCacheConfig::from_env().unwrap();
        assert_eq!(config.frame_size_limit, 512);
        assert!(config.use_on_disk_swap); // default
        assert_eq!(config.effective_frame_size_limit(), 0); // still disabled
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("ANIM_CACHE_FRAME_SIZE_LIMIT", "not_a_number");
        assert!(FrameCacheConfig::from_env().is_err());

        env::set_var("ANIM_CACHE_FRAME_SIZE_LIMIT", "10");
        env::set_var("ANIM_CACHE_USE_DISK_SWAP", "maybe");
        let result = FrameCacheConfig::from_env();
        assert!(matches!(result, Err(CacheError::InvalidConfig(key)) if key == "ANIM_CACHE_USE_DISK_SWAP"));
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("frame-cache.json");

        let config = FrameCacheConfig::default()
            .with_swap_directory("/tmp/swap")
            .with_frame_size_limit(4096);
        config.save_to_file(&path).unwrap();

        let loaded = FrameCacheConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_from_file_missing_keys_use_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("frame-cache.json");
        fs::write(&path, r#"{ "use_on_disk_swap": false, "frame_size_limit": 800 }"#).unwrap();

        let config = FrameCacheConfig::from_file(&path).unwrap();
        assert!(!config.use_on_disk_swap);
        assert_eq!(config.frame_size_limit, 800);
        assert_eq!(config.tile_width, 256);
        assert_eq!(config.purge_debounce_ms, 3000);
    }

    #[test]
    fn test_from_file_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(FrameCacheConfig::from_file(&path), Err(CacheError::ConfigParse(_))));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            FrameCacheConfig::from_file("/nonexistent/frame-cache.json"),
            Err(CacheError::Io(_))
        ));
    }
}
