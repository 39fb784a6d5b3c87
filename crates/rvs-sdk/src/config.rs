use std::path::{Path, PathBuf};
use std::time::Duration;

use rvs_log::LogConfig;
use rvs_repack::RepackOptions;
use rvs_store::delta::DEFAULT_MAX_DEPTH;
use rvs_union::UnionOptions;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// Where a finalized write buffer goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeTarget {
    /// The indexed log below `pack_threshold` entries, a pack at or above.
    #[default]
    Auto,
    Log,
    Pack,
}

/// Configuration of a [`RevisionStore`](crate::RevisionStore).
///
/// ```toml
/// local_path = "/repo/.hg/store"
/// cache_path = "/var/cache/rvs/repo"
///
/// [log]
/// max_segment_size = 67108864
/// sync_mode = "batched"
///
/// [buffer]
/// pack_threshold = 1000
/// finalize = "auto"
///
/// [remote]
/// timeout_ms = 30000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Private store root of this checkout.
    pub local_path: PathBuf,
    /// Cache root shared between checkouts, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    pub log: LogConfig,
    pub pack: PackConfig,
    pub buffer: BufferConfig,
    pub repack: RepackConfig,
    pub remote: RemoteConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from(".rvs"),
            cache_path: None,
            log: LogConfig::default(),
            pack: PackConfig::default(),
            buffer: BufferConfig::default(),
            repack: RepackConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Configuration with defaults rooted at `local_path`.
    pub fn at(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, cache_path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(cache_path.into());
        self
    }

    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> SdkResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SdkError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|e| SdkError::Config(format!("'{}': {e}", path.display())))
    }

    pub fn from_toml_str(contents: &str) -> SdkResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| SdkError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string_pretty(self).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn validate(&self) -> SdkResult<()> {
        if self.local_path.as_os_str().is_empty() {
            return Err(SdkError::Config("local_path must not be empty".into()));
        }
        if self.cache_path.as_deref() == Some(self.local_path.as_path()) {
            return Err(SdkError::Config(
                "cache_path must differ from local_path".into(),
            ));
        }
        if self.log.max_segment_size == 0 {
            return Err(SdkError::Config("log.max_segment_size must be positive".into()));
        }
        if self.repack.max_pack_size == 0 {
            return Err(SdkError::Config("repack.max_pack_size must be positive".into()));
        }
        if self.remote.max_delta_depth == 0 {
            return Err(SdkError::Config("remote.max_delta_depth must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Hash every pack body against its index fingerprint on open.
    pub verify_on_open: bool,
    /// Move packs that fail to open into `packs/corrupt/`.
    pub quarantine_corrupt: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Entry count at which [`FinalizeTarget::Auto`] writes a pack.
    pub pack_threshold: usize,
    pub finalize: FinalizeTarget,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pack_threshold: 1000,
            finalize: FinalizeTarget::Auto,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepackConfig {
    pub max_pack_size: u64,
    pub max_delta_chain: usize,
}

impl Default for RepackConfig {
    fn default() -> Self {
        let options = RepackOptions::default();
        Self {
            max_pack_size: options.max_pack_size,
            max_delta_chain: options.max_delta_chain,
        }
    }
}

impl RepackConfig {
    pub fn options(&self) -> RepackOptions {
        RepackOptions {
            max_pack_size: self.max_pack_size,
            max_delta_chain: self.max_delta_chain,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bound on one batched remote request, in milliseconds.
    pub timeout_ms: u64,
    /// Longest delta chain followed when materializing content.
    pub max_delta_depth: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_delta_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn union_options(&self) -> UnionOptions {
        UnionOptions {
            max_delta_depth: self.max_delta_depth,
            remote_timeout: self.timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvs_log::SyncMode;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.local_path, PathBuf::from(".rvs"));
        assert!(c.cache_path.is_none());
        assert_eq!(c.buffer.pack_threshold, 1000);
        assert_eq!(c.buffer.finalize, FinalizeTarget::Auto);
        assert_eq!(c.remote.timeout(), Duration::from_secs(30));
        assert_eq!(c.remote.max_delta_depth, 32);
        c.validate().unwrap();
    }

    #[test]
    fn parse_partial_toml() {
        let c = StoreConfig::from_toml_str(
            r#"
            local_path = "/tmp/local"
            cache_path = "/tmp/cache"

            [log]
            sync_mode = "every_append"
            max_segments = 4

            [buffer]
            finalize = "pack"
            "#,
        )
        .unwrap();
        assert_eq!(c.local_path, PathBuf::from("/tmp/local"));
        assert_eq!(c.cache_path, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(c.log.sync_mode, SyncMode::EveryAppend);
        assert_eq!(c.log.max_segments, Some(4));
        assert_eq!(c.log.max_segment_size, LogConfig::default().max_segment_size);
        assert_eq!(c.buffer.finalize, FinalizeTarget::Pack);
        assert_eq!(c.buffer.pack_threshold, 1000);
    }

    #[test]
    fn toml_roundtrip() {
        let c = StoreConfig::at("/data/store").with_cache("/data/cache");
        let text = c.to_toml_string().unwrap();
        assert_eq!(StoreConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = StoreConfig::from_toml_str("local_path = \"a\"\ncache_path = \"a\"").unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
        let err = StoreConfig::from_toml_str("[repack]\nmax_pack_size = 0").unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
        let err = StoreConfig::from_toml_str("[buffer]\nfinalize = \"sometimes\"").unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rvs.toml");
        std::fs::write(&path, "local_path = \"store\"\n[remote]\ntimeout_ms = 250\n").unwrap();
        let c = StoreConfig::load(&path).unwrap();
        assert_eq!(c.remote.timeout(), Duration::from_millis(250));
        assert!(StoreConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
