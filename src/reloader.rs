//! Periodic re-read of the GeoIP database file.
//!
//! An external downloader may replace the file at any time; the reloader
//! opens it again on a fixed period and swaps the new provider in. The
//! previous provider is closed only after a grace delay, so requests holding
//! a snapshot of it can finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::database::{DatabaseHandle, OpenedDatabase};
use crate::error::{Error, Result};
use crate::provider::GeoLookupProvider;

/// Default reload interval (1 hour).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default delay between retiring a provider and closing it.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Background task keeping the database fresh.
pub struct Reloader<P> {
    database: Arc<DatabaseHandle<P>>,
    interval: Duration,
    grace_period: Duration,
}

impl<P: GeoLookupProvider> Reloader<P> {
    /// Create a reloader with the default interval and grace period.
    pub fn new(database: Arc<DatabaseHandle<P>>) -> Self {
        Self {
            database,
            interval: DEFAULT_REFRESH_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Set a custom reload interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set a custom grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Re-read the database once.
    ///
    /// Returns the retired provider, still open. On failure the current
    /// provider is left untouched.
    pub async fn reload_once(&self) -> Result<Arc<OpenedDatabase<P>>> {
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || database.reload())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Spawn the reload loop on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run the reload loop until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if self.interval.is_zero() {
            log::warn!("Database refresh disabled (zero interval)");
            cancel.cancelled().await;
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retire_now = CancellationToken::new();
        let mut retiring = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                // Reap finished cleanup tasks
                Some(_) = retiring.join_next(), if !retiring.is_empty() => continue,
            }

            log::debug!("Trying to re-read the database from {:?}", self.database.path());
            match self.reload_once().await {
                Ok(retired) => {
                    log::info!(
                        "GeoIP database reloaded (generation {})",
                        self.database.generation()
                    );
                    retiring.spawn(retire(retired, self.grace_period, retire_now.clone()));
                }
                Err(e) => {
                    log::error!("Can't re-read GeoIP database, keeping the current one: {}", e);
                }
            }
        }

        // Cancelled after the HTTP server drained, no request holds a retired snapshot
        retire_now.cancel();
        while retiring.join_next().await.is_some() {}
        log::debug!("Database reloader stopped");
    }
}

/// Hold a retired provider for the grace period, then close it.
async fn retire<P: GeoLookupProvider>(
    retired: Arc<OpenedDatabase<P>>,
    grace_period: Duration,
    retire_now: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(grace_period) => {}
        _ = retire_now.cancelled() => {}
    }
    // close() waits for lookups still running on this provider
    let generation = retired.generation();
    if let Err(e) = tokio::task::spawn_blocking(move || retired.close()).await {
        log::error!("Closing retired database generation {} failed: {}", generation, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::provider::LookupResult;
    use std::net::IpAddr;
    use std::path::Path;

    /// Reads a single country code from the file; anything else fails to open.
    struct FileCountryProvider(String);

    impl GeoLookupProvider for FileCountryProvider {
        fn open(path: &Path) -> Result<Self> {
            let code = std::fs::read_to_string(path)?.trim().to_string();
            if code.len() != 2 {
                return Err(Error::DatabaseOpen {
                    path: path.to_path_buf(),
                    reason: format!("bad content {code:?}"),
                });
            }
            Ok(Self(code))
        }

        fn lookup(&self, _ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
            Ok(LookupResult::country(&self.0))
        }
    }

    /// Every lookup takes `self.0`, holding the provider open meanwhile.
    struct SlowProvider(Duration);

    impl GeoLookupProvider for SlowProvider {
        fn open(_path: &Path) -> Result<Self> {
            Ok(Self(Duration::ZERO))
        }

        fn lookup(&self, _ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
            std::thread::sleep(self.0);
            Ok(LookupResult::country("IT"))
        }
    }

    fn ip() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    fn setup(code: &str) -> (tempfile::TempDir, Arc<DatabaseHandle<FileCountryProvider>>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("country.db");
        std::fs::write(&path, code).unwrap();
        let handle = Arc::new(DatabaseHandle::open(&path).unwrap());
        (dir, handle)
    }

    #[test]
    fn test_defaults() {
        let (_dir, handle) = setup("IT");
        let reloader = Reloader::new(handle);
        assert_eq!(reloader.interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(reloader.grace_period, DEFAULT_GRACE_PERIOD);
    }

    #[tokio::test]
    async fn test_reload_once() {
        let (dir, handle) = setup("IT");
        let reloader = Reloader::new(handle.clone());

        std::fs::write(dir.path().join("country.db"), "FR").unwrap();
        let retired = reloader.reload_once().await.unwrap();
        assert_eq!(retired.generation(), 1);
        assert_eq!(handle.snapshot().lookup(ip()).unwrap().country_code(), "FR");
    }

    #[tokio::test]
    async fn test_reload_once_broken_file() {
        let (dir, handle) = setup("IT");
        let reloader = Reloader::new(handle.clone());

        std::fs::write(dir.path().join("country.db"), "not a database").unwrap();
        assert!(reloader.reload_once().await.is_err());
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.snapshot().lookup(ip()).unwrap().country_code(), "IT");
    }

    #[tokio::test]
    async fn test_loop_swaps_and_retires() {
        let (dir, handle) = setup("IT");
        let first = handle.snapshot();
        std::fs::write(dir.path().join("country.db"), "DE").unwrap();

        let cancel = CancellationToken::new();
        let task = Reloader::new(handle.clone())
            .with_interval(Duration::from_millis(50))
            .with_grace_period(Duration::from_millis(20))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(handle.generation() > 1);
        assert_eq!(handle.snapshot().lookup(ip()).unwrap().country_code(), "DE");
        assert!(first.is_closed());

        cancel.cancel();
        task.await.unwrap();
        assert!(!handle.snapshot().is_closed());
    }

    #[tokio::test]
    async fn test_cancel_closes_pending_retired() {
        let (_dir, handle) = setup("IT");
        let first = handle.snapshot();

        let cancel = CancellationToken::new();
        let task = Reloader::new(handle.clone())
            .with_interval(Duration::from_millis(30))
            .with_grace_period(Duration::from_secs(3600))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.generation() > 1);
        assert!(!first.is_closed());

        cancel.cancel();
        task.await.unwrap();
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_retire_does_not_block_runtime() {
        let handle = DatabaseHandle::with_provider(
            "slow.db",
            SlowProvider(Duration::from_millis(600)),
        );
        let busy = handle.snapshot();
        let lookup = {
            let busy = busy.clone();
            std::thread::spawn(move || busy.lookup(ip()))
        };
        std::thread::sleep(Duration::from_millis(50));

        let retired = handle.swap(SlowProvider(Duration::ZERO));
        let closing = tokio::spawn(retire(retired, Duration::ZERO, CancellationToken::new()));

        // close() is waiting for the lookup; timers must keep running
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        closing.await.unwrap();
        assert!(busy.is_closed());
        assert_eq!(lookup.join().unwrap().unwrap().country_code(), "IT");
    }
}
