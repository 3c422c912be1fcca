//! Lifecycle of the single transport + session pair behind a client.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::ClientConfig;
use crate::error::{ClientError, RemoteError};
use crate::hostkeys::{HostKeyPolicy, InsecureHostKeyNotice};
use crate::metrics::ConnectionHealth;
use crate::remote::{ConnectContext, Connection, Connector, RemoteFs};

enum State {
    Disconnected,
    Connected(Connection),
}

/// What happened to an error passed through [`ConnectionManager::clear_on_error`].
#[derive(Debug)]
pub(crate) enum Recovery {
    /// The error broke the connection, which has since been re-established.
    /// Carries the original error; the operation that produced it did not
    /// complete.
    Reconnected(anyhow::Error),
    /// Either the error was not connection related, or reconnecting failed.
    Failed(anyhow::Error),
}

impl Recovery {
    pub(crate) fn into_error(self) -> anyhow::Error {
        match self {
            Recovery::Reconnected(e) | Recovery::Failed(e) => e,
        }
    }
}

/// Owns the connection state. Every method expects the client's instance
/// lock to be held; nothing here is safe to call concurrently.
pub(crate) struct ConnectionManager<C> {
    config: ClientConfig,
    connector: C,
    notice: Arc<InsecureHostKeyNotice>,
    health: Arc<ConnectionHealth>,
    state: State,
}

impl<C: Connector> ConnectionManager<C> {
    pub(crate) fn new(
        config: ClientConfig,
        connector: C,
        notice: Arc<InsecureHostKeyNotice>,
    ) -> Self {
        let health = Arc::new(ConnectionHealth::new(config.hostname.clone()));
        Self {
            config,
            connector,
            notice,
            health,
            state: State::Disconnected,
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn health(&self) -> &Arc<ConnectionHealth> {
        &self.health
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// Return a healthy session, probing an existing one with `getwd` and
    /// replacing it when the probe fails.
    pub(crate) fn acquire(&mut self) -> Result<&dyn RemoteFs> {
        let stale = match &self.state {
            State::Connected(conn) => match conn.session().getwd() {
                Ok(_) => false,
                Err(e) => {
                    let host = &self.config.hostname;
                    tracing::debug!("[sftp] health probe on {} failed: {}", host, e);
                    true
                }
            },
            State::Disconnected => false,
        };
        if stale {
            self.teardown();
        }
        if !self.is_connected() {
            self.connect()?;
        }
        self.session()
    }

    /// The live session, without probing it.
    pub(crate) fn session(&self) -> Result<&dyn RemoteFs> {
        match &self.state {
            State::Connected(conn) => Ok(conn.session()),
            State::Disconnected => Err(ClientError::NotConnected.into()),
        }
    }

    fn connect(&mut self) -> Result<()> {
        let res = self.establish();
        self.health.record(&res);
        self.state = State::Connected(res?);
        Ok(())
    }

    fn establish(&self) -> Result<Connection> {
        let policy = HostKeyPolicy::from_config(&self.config, &self.notice)?;
        let ctx = ConnectContext {
            config: &self.config,
            host_keys: &policy,
            health: &self.health,
        };
        self.connector
            .connect(&ctx)
            .with_context(|| format!("connecting to {}", self.config.hostname))
    }

    /// Pass an error from a remote call through the classifier. Errors that
    /// mean the connection is broken tear it down and trigger one reconnect.
    pub(crate) fn clear_on_error(&mut self, err: anyhow::Error) -> Recovery {
        if !crate::error::is_connection_error(&err) {
            return Recovery::Failed(err);
        }
        tracing::warn!("[sftp] connection to {} lost: {:#}", self.config.hostname, err);
        self.teardown();
        match self.connect() {
            Ok(()) => Recovery::Reconnected(err),
            Err(reconnect) => Recovery::Failed(
                reconnect.context(format!("sftp: reconnect after \"{:#}\" failed", err)),
            ),
        }
    }

    /// Acquire a healthy session and run `op` against it. Failures from
    /// either step go through [`clear_on_error`](Self::clear_on_error).
    pub(crate) fn try_run<T>(
        &mut self,
        op: impl FnOnce(&dyn RemoteFs) -> Result<T>,
    ) -> Result<T, Recovery> {
        let res = match self.acquire() {
            Ok(fs) => op(fs),
            Err(e) => Err(e),
        };
        res.map_err(|e| self.clear_on_error(e))
    }

    /// [`try_run`](Self::try_run), surfacing whichever error the caller
    /// should see.
    pub(crate) fn run<T>(&mut self, op: impl FnOnce(&dyn RemoteFs) -> Result<T>) -> Result<T> {
        self.try_run(op).map_err(Recovery::into_error)
    }

    /// Run `op` against the current session without probing it first.
    pub(crate) fn call<T>(
        &mut self,
        op: impl FnOnce(&dyn RemoteFs) -> Result<T, RemoteError>,
    ) -> Result<T> {
        let res = self.session().and_then(|fs| op(fs).map_err(anyhow::Error::new));
        self.classify(res)
    }

    /// Pass the outcome of an operation on an open stream through the classifier.
    pub(crate) fn classify<T, E: Into<anyhow::Error>>(&mut self, res: Result<T, E>) -> Result<T> {
        res.map_err(|e| self.clear_on_error(e.into()).into_error())
    }

    /// Forget the current connection, releasing it in the background.
    pub(crate) fn teardown(&mut self) {
        if let State::Connected(conn) = std::mem::replace(&mut self.state, State::Disconnected) {
            conn.release_in_background();
        }
    }

    /// Release the current connection synchronously. Never fails.
    pub(crate) fn close(&mut self) {
        if let State::Connected(conn) = std::mem::replace(&mut self.state, State::Disconnected) {
            conn.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use crate::remote::{DirEntry, FileStat, RemoteStream, Transport};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn unused<T>() -> Result<T, RemoteError> {
        Err(RemoteError::new(RemoteErrorKind::Other(0), "unused"))
    }

    struct Probe {
        alive: Arc<AtomicBool>,
    }

    impl RemoteFs for Probe {
        fn getwd(&self) -> Result<String, RemoteError> {
            if self.alive.load(Ordering::SeqCst) {
                Ok("/".to_string())
            } else {
                Err(RemoteError::connection_lost())
            }
        }
        fn stat(&self, _: &str) -> Result<FileStat, RemoteError> {
            unused()
        }
        fn read_dir(&self, _: &str) -> Result<Vec<DirEntry>, RemoteError> {
            unused()
        }
        fn open(&self, _: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
            unused()
        }
        fn open_write(&self, _: &str) -> Result<Box<dyn RemoteStream>, RemoteError> {
            unused()
        }
        fn remove(&self, _: &str) -> Result<(), RemoteError> {
            unused()
        }
        fn mkdir_all(&self, _: &str) -> Result<(), RemoteError> {
            unused()
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Scripted {
        connects: Arc<AtomicUsize>,
        refuse: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
    }

    impl Connector for Scripted {
        fn connect(&self, ctx: &ConnectContext<'_>) -> anyhow::Result<Connection> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ClientError::Dial(ctx.config.hostname.clone(), "refused".into()).into());
            }
            ctx.host_keys.verify(b"server-key")?;
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            Ok(Connection::new(
                Box::new(Probe {
                    alive: self.alive.clone(),
                }),
                Box::new(NullTransport),
            ))
        }
    }

    fn manager(script: &Scripted) -> ConnectionManager<Scripted> {
        let cfg = ClientConfig {
            hostname: "sftp:22".to_string(),
            ..Default::default()
        };
        ConnectionManager::new(cfg, script.clone(), Arc::new(InsecureHostKeyNotice::new()))
    }

    #[test]
    fn acquire_is_lazy_and_reuses_healthy_session() {
        let script = Scripted::default();
        let mut m = manager(&script);
        assert!(!m.is_connected());
        assert_eq!(m.health().is_up(), None);

        m.acquire().unwrap();
        m.acquire().unwrap();
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(m.health().is_up(), Some(true));
    }

    #[test]
    fn acquire_replaces_stale_session() {
        let script = Scripted::default();
        let mut m = manager(&script);
        m.acquire().unwrap();
        script.alive.store(false, Ordering::SeqCst);
        m.acquire().unwrap();
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unclassified_errors_pass_through() {
        let script = Scripted::default();
        let mut m = manager(&script);
        m.acquire().unwrap();
        let err = anyhow::Error::new(RemoteError::not_found("/x"));
        match m.clear_on_error(err) {
            Recovery::Failed(e) => assert!(crate::error::is_not_found(&e)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classified_errors_reconnect() {
        let script = Scripted::default();
        let mut m = manager(&script);
        m.acquire().unwrap();
        let err = anyhow::Error::new(RemoteError::connection_lost());
        let err = err.context("sftp: delete stat /x");
        match m.clear_on_error(err) {
            Recovery::Reconnected(e) => assert!(crate::error::is_connection_error(&e)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.is_connected());
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_reconnect_replaces_error_and_marks_down() {
        let script = Scripted::default();
        let mut m = manager(&script);
        m.acquire().unwrap();
        script.refuse.store(true, Ordering::SeqCst);

        let recovery = m.clear_on_error(anyhow::Error::new(RemoteError::connection_lost()));
        let err = match recovery {
            Recovery::Failed(e) => e,
            other => panic!("unexpected {:?}", other),
        };
        let msg = format!("{:#}", err);
        assert!(msg.contains("reconnect"), "{}", msg);
        assert!(msg.contains("refused"), "{}", msg);
        assert!(!m.is_connected());
        assert_eq!(m.health().is_up(), Some(false));

        script.refuse.store(false, Ordering::SeqCst);
        m.acquire().unwrap();
        assert_eq!(m.health().is_up(), Some(true));
    }

    #[test]
    fn close_is_repeatable() {
        let script = Scripted::default();
        let mut m = manager(&script);
        m.close();
        m.acquire().unwrap();
        m.close();
        m.close();
        assert!(!m.is_connected());
        assert!(m.session().is_err());
    }
}
