// config.rs: engine defaults and runtime configuration.
//
// The constants are the values used when no override is supplied. Each one
// can be replaced programmatically on `EngineConfig`, or through the matching
// IOSTORE_* environment variable when the config is built with `from_env`.

use crate::crypto::AES_BLOCK_SIZE;
use crate::error::{IoStoreError, Result};
use crate::mapped::platform_mapping_alignment;

pub const KB: usize = 1 << 10;
pub const MB: usize = 1 << 20;

// Size of one raw block, the unit of physical I/O.
// Overridden by IOSTORE_BUFFER_SIZE_KB.
pub const READ_BUFFER_SIZE_DEFAULT: usize = 256 * KB;

// Total memory carved into raw-block buffers. The buffer count is
// BUFFER_MEMORY / READ_BUFFER_SIZE. Overridden by IOSTORE_BUFFER_MEMORY_MB.
pub const BUFFER_MEMORY_DEFAULT: usize = 8 * MB;

// Memory reserved for the raw block cache; 0 disables caching.
// Overridden by IOSTORE_CACHE_SIZE_MB.
pub const CACHE_MEMORY_DEFAULT: usize = 0;

// Number of reusable decompression scratch contexts.
pub const DECOMPRESSION_CONTEXTS_DEFAULT: usize = 4;

// Upper bound on decode worker threads selectable at runtime.
pub const DECOMPRESSION_WORKERS_MAX: usize = 64;

// Reads the threaded backend keeps in flight at once.
pub const MAX_CONCURRENT_READS_DEFAULT: usize = 16;

pub const ENV_BUFFER_SIZE_KB: &str = "IOSTORE_BUFFER_SIZE_KB";
pub const ENV_BUFFER_MEMORY_MB: &str = "IOSTORE_BUFFER_MEMORY_MB";
pub const ENV_CACHE_SIZE_MB: &str = "IOSTORE_CACHE_SIZE_MB";
pub const ENV_DECOMPRESSION_WORKERS: &str = "IOSTORE_DECOMPRESSION_WORKERS";

/// Default decode worker count: physical cores minus a small reserve for the
/// service thread and callers, never below one.
pub fn default_decompression_workers() -> usize {
    let nb_cores = num_cpus::get_physical();
    let spared = 1 + (nb_cores >> 3);
    if nb_cores <= spared {
        1
    } else {
        (nb_cores - spared).min(DECOMPRESSION_WORKERS_MAX)
    }
}

/// How the service loop is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// A dedicated service thread plus a pool of decode workers.
    Threaded { decompression_workers: usize },
    /// No background threads; the caller drives progress with `Engine::pump`.
    Cooperative,
}

impl Scheduling {
    pub fn is_threaded(&self) -> bool {
        matches!(self, Scheduling::Threaded { .. })
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Raw block size in bytes. Must be a multiple of the AES block size.
    pub read_buffer_size: usize,
    /// Bytes of raw-block buffer memory; fixes the buffer pool capacity.
    pub buffer_memory: usize,
    /// Bytes of block-cache memory; 0 disables the cache.
    pub cache_memory: usize,
    /// Number of decompression scratch contexts.
    pub decompression_contexts: usize,
    pub scheduling: Scheduling,
    /// In-flight limit used by the threaded file backend.
    pub max_concurrent_reads: usize,
    /// Granularity a block offset must honour to be memory mapped.
    pub memory_mapping_alignment: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            read_buffer_size: READ_BUFFER_SIZE_DEFAULT,
            buffer_memory: BUFFER_MEMORY_DEFAULT,
            cache_memory: CACHE_MEMORY_DEFAULT,
            decompression_contexts: DECOMPRESSION_CONTEXTS_DEFAULT,
            scheduling: Scheduling::Threaded {
                decompression_workers: default_decompression_workers(),
            },
            max_concurrent_reads: MAX_CONCURRENT_READS_DEFAULT,
            memory_mapping_alignment: platform_mapping_alignment(),
        }
    }
}

impl EngineConfig {
    /// Single-threaded configuration driven by `Engine::pump`.
    pub fn cooperative() -> Self {
        EngineConfig { scheduling: Scheduling::Cooperative, ..Self::default() }
    }

    /// Defaults with IOSTORE_* environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Applies overrides read through `lookup`. Split out of [`from_env`]
    /// so the parsing is testable without touching the process environment.
    ///
    /// [`from_env`]: EngineConfig::from_env
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(kb) = parse_env_u64(ENV_BUFFER_SIZE_KB, lookup(ENV_BUFFER_SIZE_KB).as_deref()) {
            self.read_buffer_size = kb as usize * KB;
        }
        if let Some(mb) = parse_env_u64(ENV_BUFFER_MEMORY_MB, lookup(ENV_BUFFER_MEMORY_MB).as_deref()) {
            self.buffer_memory = mb as usize * MB;
        }
        if let Some(mb) = parse_env_u64(ENV_CACHE_SIZE_MB, lookup(ENV_CACHE_SIZE_MB).as_deref()) {
            self.cache_memory = mb as usize * MB;
        }
        if let Some(workers) =
            parse_env_u64(ENV_DECOMPRESSION_WORKERS, lookup(ENV_DECOMPRESSION_WORKERS).as_deref())
        {
            if let Scheduling::Threaded { decompression_workers } = &mut self.scheduling {
                *decompression_workers = (workers as usize).clamp(1, DECOMPRESSION_WORKERS_MAX);
            }
        }
    }

    /// Number of raw-block buffers the pool will hold.
    pub fn buffer_count(&self) -> usize {
        if self.read_buffer_size == 0 {
            0
        } else {
            self.buffer_memory / self.read_buffer_size
        }
    }

    /// Number of raw blocks the cache will hold.
    pub fn cache_block_count(&self) -> usize {
        if self.read_buffer_size == 0 {
            0
        } else {
            self.cache_memory / self.read_buffer_size
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 || self.read_buffer_size % AES_BLOCK_SIZE != 0 {
            return Err(IoStoreError::InvalidParameter(format!(
                "read buffer size {} must be a non-zero multiple of {}",
                self.read_buffer_size, AES_BLOCK_SIZE
            )));
        }
        if self.buffer_count() == 0 {
            return Err(IoStoreError::InvalidParameter(format!(
                "buffer memory {} is smaller than one read buffer ({})",
                self.buffer_memory, self.read_buffer_size
            )));
        }
        if self.decompression_contexts == 0 {
            return Err(IoStoreError::InvalidParameter(
                "at least one decompression context is required".to_owned(),
            ));
        }
        if let Scheduling::Threaded { decompression_workers: 0 } = self.scheduling {
            return Err(IoStoreError::InvalidParameter(
                "threaded scheduling needs at least one decompression worker".to_owned(),
            ));
        }
        if self.max_concurrent_reads == 0 {
            return Err(IoStoreError::InvalidParameter(
                "max_concurrent_reads must be at least 1".to_owned(),
            ));
        }
        if !self.memory_mapping_alignment.is_power_of_two() {
            return Err(IoStoreError::InvalidParameter(format!(
                "memory mapping alignment {} is not a power of two",
                self.memory_mapping_alignment
            )));
        }
        Ok(())
    }
}

/// Parses an unsigned decimal override. `None` or a non-numeric value yields
/// `None`; the latter is logged and ignored.
pub fn parse_env_u64(name: &str, value: Option<&str>) -> Option<u64> {
    let value = value?;
    match value.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignore environment variable setting {}={}: not a valid unsigned value", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.buffer_count(), 32);
        assert_eq!(config.cache_block_count(), 0);
    }

    #[test]
    fn default_workers_at_least_one() {
        assert!(default_decompression_workers() >= 1);
    }

    #[test]
    fn parse_env_numeric_and_garbage() {
        assert_eq!(parse_env_u64("X", Some("12")), Some(12));
        assert_eq!(parse_env_u64("X", Some(" 7 ")), Some(7));
        assert_eq!(parse_env_u64("X", Some("fast")), None);
        assert_eq!(parse_env_u64("X", None), None);
    }

    #[test]
    fn apply_env_overrides() {
        let mut config = EngineConfig::default();
        config.apply_env(|name| match name {
            ENV_BUFFER_SIZE_KB => Some("64".to_owned()),
            ENV_CACHE_SIZE_MB => Some("2".to_owned()),
            ENV_DECOMPRESSION_WORKERS => Some("3".to_owned()),
            _ => None,
        });
        assert_eq!(config.read_buffer_size, 64 * KB);
        assert_eq!(config.cache_memory, 2 * MB);
        assert_eq!(config.cache_block_count(), 32);
        assert_eq!(config.scheduling, Scheduling::Threaded { decompression_workers: 3 });
        assert_eq!(config.buffer_memory, BUFFER_MEMORY_DEFAULT);
    }

    #[test]
    fn apply_env_ignores_workers_in_cooperative_mode() {
        let mut config = EngineConfig::cooperative();
        config.apply_env(|name| (name == ENV_DECOMPRESSION_WORKERS).then(|| "8".to_owned()));
        assert_eq!(config.scheduling, Scheduling::Cooperative);
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        let mut config = EngineConfig::cooperative();
        config.read_buffer_size = 1000;
        assert!(matches!(config.validate(), Err(IoStoreError::InvalidParameter(_))));

        let mut config = EngineConfig::cooperative();
        config.buffer_memory = config.read_buffer_size - 1;
        assert!(matches!(config.validate(), Err(IoStoreError::InvalidParameter(_))));

        let mut config = EngineConfig::cooperative();
        config.decompression_contexts = 0;
        assert!(config.validate().is_err());

        let config = EngineConfig {
            scheduling: Scheduling::Threaded { decompression_workers: 0 },
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
