//! Manager configuration.

use crate::error::{Error, Result};

/// Tuning options for the arena manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of eagerly reserved arenas; `0` disables eager
    /// reservation. Rounded up to a whole number of blocks.
    pub arena_reserve: usize,

    /// Deferral delay for decommitting freed blocks, in milliseconds.
    /// `0` purges immediately on free.
    pub purge_delay_ms: u64,

    /// Purge by decommitting pages instead of resetting them.
    pub reset_decommits: bool,

    /// Disable the direct-OS fallback when no arena can satisfy a request.
    pub limit_os_alloc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_reserve: 1024 * 1024 * 1024,
            purge_delay_ms: 10,
            reset_decommits: false,
            limit_os_alloc: false,
        }
    }
}

impl Config {
    /// Start building a config.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.arena_reserve > usize::MAX / 2 {
            return Err(Error::config("arena_reserve too large"));
        }

        if self.purge_delay_ms > 3_600_000 {
            return Err(Error::config("purge_delay_ms must be at most one hour"));
        }

        Ok(())
    }
}

/// Chained builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from the default options.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Size of eagerly reserved arenas in bytes (`0` disables).
    pub fn arena_reserve(mut self, bytes: usize) -> Self {
        self.config.arena_reserve = bytes;
        self
    }

    /// Purge deferral delay in milliseconds (`0` purges on free).
    pub fn purge_delay_ms(mut self, ms: u64) -> Self {
        self.config.purge_delay_ms = ms;
        self
    }

    /// Purge by decommitting instead of resetting.
    pub fn reset_decommits(mut self, enable: bool) -> Self {
        self.config.reset_decommits = enable;
        self
    }

    /// Disable the direct-OS fallback.
    pub fn limit_os_alloc(mut self, limit: bool) -> Self {
        self.config.limit_os_alloc = limit;
        self
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
