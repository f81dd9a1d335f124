//! Hot-swappable GeoIP database handle.
//!
//! The current provider lives in an [`ArcSwap`] slot: requests take a
//! lock-free snapshot, the reloader atomically installs a freshly opened
//! provider and gets the previous one back to retire it later.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{LookupError, Result};
use crate::provider::{GeoLookupProvider, LookupResult};

/// One opened provider instance.
///
/// Closing takes the provider out under the write lock, so a close waits for
/// any lookup already running on this instance; later lookups fail with
/// [`LookupError::UseAfterClose`].
pub struct OpenedDatabase<P> {
    provider: RwLock<Option<P>>,
    generation: u64,
    opened_at: SystemTime,
}

impl<P: GeoLookupProvider> OpenedDatabase<P> {
    fn new(provider: P, generation: u64) -> Self {
        Self {
            provider: RwLock::new(Some(provider)),
            generation,
            opened_at: SystemTime::now(),
        }
    }

    /// Look up the country of an IP address.
    pub fn lookup(&self, ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
        match self.provider.read().as_ref() {
            Some(provider) => provider.lookup(ip),
            None => Err(LookupError::UseAfterClose),
        }
    }

    /// Release the provider. Calling this more than once is a no-op.
    pub fn close(&self) {
        let provider = self.provider.write().take();
        if provider.is_some() {
            log::debug!("Closed GeoIP database generation {}", self.generation);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.provider.read().is_none()
    }

    /// Sequence number of this instance (1 for the database opened at startup).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }
}

/// Shared slot holding the current provider.
pub struct DatabaseHandle<P> {
    path: PathBuf,
    current: ArcSwap<OpenedDatabase<P>>,
    /// Serializes writers; readers never touch it.
    swap_lock: Mutex<u64>,
}

impl<P: GeoLookupProvider> DatabaseHandle<P> {
    /// Open the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let provider = P::open(&path)?;
        log::info!("Loaded GeoIP database from {:?}", path);
        Ok(Self::with_provider(path, provider))
    }

    /// Wrap an already opened provider; `path` is used by [`reload`](Self::reload).
    pub fn with_provider(path: impl AsRef<Path>, provider: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: ArcSwap::from_pointee(OpenedDatabase::new(provider, 1)),
            swap_lock: Mutex::new(1),
        }
    }

    /// Get the provider to use for one request.
    pub fn snapshot(&self) -> Arc<OpenedDatabase<P>> {
        self.current.load_full()
    }

    /// Atomically install `provider` and return the previous one.
    ///
    /// Readers calling [`snapshot`](Self::snapshot) are never blocked. The
    /// returned instance is still open; the caller decides when to close it.
    pub fn swap(&self, provider: P) -> Arc<OpenedDatabase<P>> {
        let mut generation = self.swap_lock.lock();
        *generation += 1;
        self.current
            .swap(Arc::new(OpenedDatabase::new(provider, *generation)))
    }

    /// Open a fresh provider from the configured path and swap it in.
    ///
    /// On failure the current provider stays in place.
    pub fn reload(&self) -> Result<Arc<OpenedDatabase<P>>> {
        let provider = P::open(&self.path)?;
        Ok(self.swap(provider))
    }

    /// Close the current provider. Called once at shutdown.
    pub fn close(&self) {
        self.current.load().close();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation of the current provider.
    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }
}
