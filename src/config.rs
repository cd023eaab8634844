//! Run configuration for the parallel map.

use std::sync::Arc;

use rayon::ThreadPool;

use crate::error::{Error, Result};

/// Environment variable read by [`MapConfig::from_env`].
pub const THREADS_ENV: &str = "NESTED_TAPE_NUM_THREADS";

/// Where and how parallel maps run.
#[derive(Clone, Debug)]
pub struct MapConfig {
    /// Dedicated pool; `None` runs on rayon's global pool.
    pub pool: Option<Arc<ThreadPool>>,
    /// Report indices whose tracked-variable count differs from index 0 as
    /// [`Error::WidthMismatch`]. When off, such an index panics.
    pub check_width: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            pool: None,
            check_width: true,
        }
    }
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run on a dedicated pool of `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::InvalidThreadCount(num_threads.to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("nested-tape-{}", i))
            .build()?;
        tracing::debug!(num_threads, "built parallel map thread pool");
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        MapConfig {
            pool: Some(pool),
            ..Self::default()
        }
    }

    pub fn check_width(mut self, check: bool) -> Self {
        self.check_width = check;
        self
    }

    /// Configuration from [`THREADS_ENV`]: unset means the global pool,
    /// otherwise a dedicated pool of that many threads.
    pub fn from_env() -> Result<Self> {
        match std::env::var(THREADS_ENV) {
            Ok(raw) => Self::with_threads(parse_thread_count(&raw)?),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(raw)) => {
                Err(Error::InvalidThreadCount(raw.to_string_lossy().into_owned()))
            }
        }
    }

    /// Threads available to a map run with this configuration.
    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    pub(crate) fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

fn parse_thread_count(raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| Error::InvalidThreadCount(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_parsing() {
        assert_eq!(parse_thread_count("4").unwrap(), 4);
        assert_eq!(parse_thread_count(" 2\n").unwrap(), 2);
        for bad in ["0", "-1", "four", ""] {
            assert!(matches!(
                parse_thread_count(bad),
                Err(Error::InvalidThreadCount(_))
            ));
        }
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(matches!(
            MapConfig::with_threads(0),
            Err(Error::InvalidThreadCount(_))
        ));
    }

    #[test]
    fn dedicated_pool_size() {
        let config = MapConfig::with_threads(3).unwrap();
        assert_eq!(config.num_threads(), 3);
        assert!(config.check_width);
    }
}
