//! Server orchestration and shutdown sequencing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::DatabaseHandle;
use crate::error::{Error, Result};
use crate::handler::{create_router, AppState};
use crate::provider::GeoLookupProvider;
use crate::reloader::Reloader;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The forward-auth server: listener, reloader and shared database.
pub struct Server<P> {
    state: Arc<AppState<P>>,
    listen_addr: SocketAddr,
    refresh_interval: Duration,
    grace_period: Duration,
    timeout: Duration,
}

impl<P: GeoLookupProvider> Server<P> {
    /// Validate the configuration and open the database.
    ///
    /// Any failure here is fatal: the process must not start serving.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let policy = config.policy()?;
        let listen_addr = config.listen_addr()?;

        let database = Arc::new(DatabaseHandle::<P>::open(&config.db)?);

        log::info!(
            "Policy: action={} countries={} allow-empty-countries={}",
            policy.action(),
            policy.count(),
            policy.allow_empty_country()
        );

        Ok(Self {
            state: Arc::new(AppState::new(database, policy)),
            listen_addr,
            refresh_interval: config.db_refresh_every,
            grace_period: config.db_grace_period,
            timeout: config.web_timeout,
        })
    }

    /// Build a server from already prepared state.
    pub fn with_state(state: Arc<AppState<P>>, listen_addr: SocketAddr, config: &Config) -> Self {
        Self {
            state,
            listen_addr,
            refresh_interval: config.db_refresh_every,
            grace_period: config.db_grace_period,
            timeout: config.web_timeout,
        }
    }

    pub fn state(&self) -> &Arc<AppState<P>> {
        &self.state
    }

    /// Run until SIGINT/SIGTERM.
    ///
    /// Returns `Ok` after a signal-triggered shutdown and `Err` when the
    /// listener or the HTTP server fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.listen_addr,
                source,
            })?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `signal` completes.
    ///
    /// Shutdown runs exactly once, whether triggered by `signal` or by a
    /// server fault: stop accepting, drain in-flight requests for at most the
    /// configured timeout, stop the reloader, close the database.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = std::io::Result<&'static str>> + Send,
    {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        // Stopped only after the drain: requests still running may hold a
        // snapshot of a retired provider.
        let stop_reloader = CancellationToken::new();

        let reloader = Reloader::new(self.state.database().clone())
            .with_interval(self.refresh_interval)
            .with_grace_period(self.grace_period)
            .spawn(stop_reloader.clone());

        let app = create_router(self.state.clone());
        let mut http_server = tokio::spawn(accept_loop(
            listener,
            app,
            self.timeout,
            shutdown.clone(),
        ));

        log::info!("http server listening on {}", local_addr);

        let outcome = tokio::select! {
            res = &mut http_server => {
                let err = match res {
                    Ok(()) => Error::Server("stopped unexpectedly".to_string()),
                    Err(e) => Error::Server(e.to_string()),
                };
                log::error!("{}", err);
                Err(err)
            }
            sig = signal => match sig {
                Ok(name) => {
                    log::info!("signal {} received, start shutdown", name);
                    Ok(())
                }
                Err(e) => {
                    log::error!("Can't listen for shutdown signals: {}", e);
                    Err(Error::Io(e))
                }
            },
        };

        shutdown.cancel();

        if !http_server.is_finished() {
            log::info!("stopping API server");
            match tokio::time::timeout(self.timeout, &mut http_server).await {
                Ok(Err(e)) => log::error!("http server failed during shutdown: {}", e),
                Ok(Ok(())) => {}
                Err(_) => {
                    log::warn!(
                        "In-flight requests still running after {:?}, aborting",
                        self.timeout
                    );
                    http_server.abort();
                }
            }
        }

        stop_reloader.cancel();
        if let Err(e) = reloader.await {
            log::error!("Database reloader task failed: {}", e);
        }

        let database = self.state.database().clone();
        if let Err(e) = tokio::task::spawn_blocking(move || database.close()).await {
            log::error!("Closing the database failed: {}", e);
        }
        log::info!("shutdown complete");

        outcome
    }
}

/// Accept connections until `shutdown` fires, then wait for the open ones.
async fn accept_loop(
    listener: TcpListener,
    app: Router,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        app.clone(),
                        timeout,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    log::error!("accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// Serve one connection.
///
/// Request headers must arrive within `timeout`, and the connection as a
/// whole is asked to close once `timeout` has elapsed. A connection that
/// doesn't finish within a further `timeout` is dropped.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout);
    builder.http2().timer(TokioTimer::new());

    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    let mut conn = std::pin::pin!(conn);
    let deadline = tokio::time::sleep(timeout);
    let mut deadline = std::pin::pin!(deadline);

    let finished = tokio::select! {
        res = conn.as_mut() => Some(res),
        _ = deadline.as_mut() => None,
        _ = shutdown.cancelled() => None,
    };

    let res = match finished {
        Some(res) => res,
        None => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(timeout, conn.as_mut()).await {
                Ok(res) => res,
                Err(_) => {
                    log::debug!("Dropping connection from {} after {:?}", peer, timeout);
                    return;
                }
            }
        }
    };

    if let Err(e) = res {
        log::debug!("Connection from {} closed: {}", peer, e);
    }
}

/// Wait for SIGINT or SIGTERM and return the signal name.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::provider::LookupResult;
    use std::net::IpAddr;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    struct NoCountryProvider;

    impl GeoLookupProvider for NoCountryProvider {
        fn open(path: &Path) -> Result<Self> {
            if path.exists() {
                Ok(Self)
            } else {
                Err(Error::DatabaseOpen {
                    path: path.to_path_buf(),
                    reason: "not found".to_string(),
                })
            }
        }

        fn lookup(&self, _ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
            Ok(LookupResult::empty())
        }
    }

    /// Lookups take 600ms and find no country.
    struct SlowProvider;

    impl GeoLookupProvider for SlowProvider {
        fn open(path: &Path) -> Result<Self> {
            NoCountryProvider::open(path).map(|_| Self)
        }

        fn lookup(&self, _ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
            std::thread::sleep(Duration::from_millis(600));
            Ok(LookupResult::empty())
        }
    }

    fn config_with_db(db: &Path) -> Config {
        Config {
            db: db.to_path_buf(),
            web_listen: "127.0.0.1:0".to_string(),
            web_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[test]
    fn test_new_missing_database() {
        let config = config_with_db(Path::new("/nonexistent/GeoLite2-Country.mmdb"));
        assert!(matches!(
            Server::<NoCountryProvider>::new(&config),
            Err(Error::DatabaseOpen { .. })
        ));
    }

    #[test]
    fn test_new_invalid_country() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config {
            countries: "IT,Italy".to_string(),
            ..config_with_db(file.path())
        };
        assert!(matches!(
            Server::<NoCountryProvider>::new(&config),
            Err(Error::InvalidCountryCode(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            web_listen: taken.local_addr().unwrap().to_string(),
            ..config_with_db(file.path())
        };

        let server = Server::<NoCountryProvider>::new(&config).unwrap();
        assert!(matches!(server.run().await, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_signal_shutdown_closes_database() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = config_with_db(file.path());
        let server = Server::<NoCountryProvider>::new(&config).unwrap();
        let state = server.state().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let signal = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, std::io::Error>("TEST")
        };

        server.serve(listener, signal).await.unwrap();
        assert!(state.database().snapshot().is_closed());
    }

    #[tokio::test]
    async fn test_signal_error_is_fault() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = config_with_db(file.path());
        let server = Server::<NoCountryProvider>::new(&config).unwrap();
        let state = server.state().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let signal = async { Err::<&'static str, _>(std::io::Error::other("no signals")) };

        assert!(matches!(
            server.serve(listener, signal).await,
            Err(Error::Io(_))
        ));
        assert!(state.database().snapshot().is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reloader_stops_after_drain() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config {
            allow_empty_countries: true,
            db_refresh_every: Duration::from_millis(20),
            db_grace_period: Duration::from_secs(3600),
            ..config_with_db(file.path())
        };
        let server = Server::<SlowProvider>::new(&config).unwrap();
        let state = server.state().clone();
        let first = state.database().snapshot();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
            Ok::<_, std::io::Error>("TEST")
        }));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(
                    b"GET / HTTP/1.1\r\nHost: geogate\r\nX-Forwarded-For: 192.0.2.1\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        // Shut down while the request is still in its lookup
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.send(()).unwrap();
        let at_signal = state.database().generation();

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(state.database().generation() > at_signal + 2);

        task.await.unwrap().unwrap();
        assert!(first.is_closed());
        assert!(state.database().snapshot().is_closed());
    }
}
