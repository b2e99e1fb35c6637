//! Connection controller
//!
//! Owns the socket, pumps inbound bytes through the splitter and assembler,
//! routes replies to the correlator and events to the registry, and runs the
//! startup refresh after every connect.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::AbortHandle;

use super::assembler::{Assembled, MessageAssembler};
use super::codec;
use super::correlator::Correlator;
use super::error::{RequestError, RequestResult, Result, StationError};
use super::notify::{Notification, NotificationKind, Notifier};
use super::registry::{EventRegistry, EventSink, SinkHandle};
use super::splitter::LineSplitter;
use super::value::{ObjectId, ObjectOption, OptionResult};
use super::{ConnectionState, DeviceInfo, EngineObject, ROSTER_ID, STATION_ID, StationConfig};

type Writer = Arc<AsyncMutex<OwnedWriteHalf>>;

/// One live TCP connection.
struct Link {
    generation: u64,
    peer: SocketAddr,
    writer: Writer,
    tasks: Vec<AbortHandle>,
}

struct Inner {
    config: StationConfig,
    correlator: Correlator,
    registry: EventRegistry,
    notifier: Notifier,
    state: Mutex<ConnectionState>,
    info: Mutex<DeviceInfo>,
    engines: Mutex<Vec<EngineObject>>,
    /// Ids with an acknowledged remote `request(id,view)` on this connection
    views: Mutex<BTreeSet<ObjectId>>,
    /// Serializes remote view changes per id
    view_gates: Mutex<HashMap<ObjectId, Arc<AsyncMutex<()>>>>,
    link: Mutex<Option<Link>>,
    next_generation: AtomicU64,
}

/// Client session with one command station.
///
/// Cheap to clone; clones share the connection, pending requests and
/// subscriptions.
#[derive(Clone)]
pub struct Station {
    inner: Arc<Inner>,
}

impl Station {
    /// Create an unconnected station client.
    pub fn new(config: StationConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let registry = EventRegistry::new();
            registry.subscribe(STATION_ID, Arc::new(StatusSink { inner: weak.clone() }));
            registry.subscribe(ROSTER_ID, Arc::new(RosterSink { inner: weak.clone() }));
            Inner {
                notifier: Notifier::new(config.notify_capacity),
                config,
                correlator: Correlator::new(),
                registry,
                state: Mutex::new(ConnectionState::Idle),
                info: Mutex::new(DeviceInfo::default()),
                engines: Mutex::new(Vec::new()),
                views: Mutex::new(BTreeSet::new()),
                view_gates: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                next_generation: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Open a connection to `target` (address or host name).
    ///
    /// Any existing connection is closed first. `None` uses the configured
    /// port. Returns once the socket is up; the startup refresh runs in the
    /// background and reports through [`Station::notifications`].
    pub async fn connect(&self, target: &str, port: Option<u16>) -> Result<()> {
        if self.is_connected() {
            self.close();
        }
        let port = port.unwrap_or(self.inner.config.port);
        self.inner.set_state(ConnectionState::Connecting);
        tracing::info!(%target, port, "connecting to command station");

        let (stream, peer) = match open(target, port).await {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(%target, port, error = %err, "connect failed");
                self.inner.set_state(ConnectionState::Closed);
                return Err(StationError::Transport(err));
            }
        };
        let (reader, writer) = stream.into_split();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.inner.link.lock() = Some(Link {
            generation,
            peer,
            writer: Arc::new(AsyncMutex::new(writer)),
            tasks: Vec::new(),
        });

        let read_task = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            reader,
            generation,
        ))
        .abort_handle();

        let station = self.clone();
        let startup = tokio::spawn(async move {
            if let Err(err) = station.refresh().await {
                tracing::warn!(error = %err, "startup refresh failed");
                station.inner.notifier.error(err);
                station.inner.shutdown(Some(generation));
            }
        })
        .abort_handle();

        self.inner.track(generation, [read_task, startup]);
        tracing::info!(%peer, generation, "connected to command station");
        Ok(())
    }

    /// Tear the connection down. Always succeeds; safe to call repeatedly.
    ///
    /// Pending requests are rejected with [`RequestError::Connectivity`]. No
    /// `release` commands are sent; local subscriptions are kept and
    /// re-requested on the next connect.
    pub fn close(&self) {
        self.inner.shutdown(None);
    }

    /// Send `name(id,options...)` and wait for the reply rows.
    pub async fn send(
        &self,
        name: &str,
        id: ObjectId,
        options: &[ObjectOption],
    ) -> RequestResult<Vec<OptionResult>> {
        if !self.is_connected() {
            return Err(RequestError::Connectivity);
        }
        let command = codec::write_command(name, id, options)?;
        self.inner.request(command).await
    }

    /// Send an already parsed command.
    pub async fn send_command(&self, command: &codec::Command) -> RequestResult<Vec<OptionResult>> {
        self.send(&command.name, command.id, &command.options).await
    }

    /// Route events for `id` to `sink`.
    ///
    /// The first consumer of an id triggers a remote `request(id,view)` in
    /// the background when connected; failures are notified. Returns true if
    /// `sink` was the first consumer.
    ///
    /// Must be called within a tokio runtime while connected.
    pub fn subscribe(&self, id: ObjectId, sink: SinkHandle) -> bool {
        let first = self.inner.registry.subscribe(id, sink);
        if first && self.is_connected() {
            let station = self.clone();
            tokio::spawn(async move { station.sync_view(id).await });
        }
        first
    }

    /// Stop routing events for `id` to `sink`.
    ///
    /// The last consumer of an id triggers a remote `release(id,view)`.
    /// Returns true if no consumers remain for `id`.
    pub fn unsubscribe(&self, id: ObjectId, sink: &SinkHandle) -> bool {
        let last = self.inner.registry.unsubscribe(id, sink);
        if last && self.is_connected() {
            let station = self.clone();
            tokio::spawn(async move { station.sync_view(id).await });
        }
        last
    }

    /// Re-read device info and status, re-request views for every
    /// subscribed id and re-read the engine roster.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self
            .send(
                "get",
                STATION_ID,
                &[ObjectOption::named("info"), ObjectOption::named("status")],
            )
            .await?;
        let info = DeviceInfo::from_results(&rows);
        tracing::info!(name = %info.name, protocol = %info.protocol_version, "device identified");
        *self.inner.info.lock() = info.clone();
        self.inner.notifier.publish(NotificationKind::InfoChanged(info));
        self.inner.apply_status(&rows, "get(1,info,status)")?;

        let ids = self.inner.registry.ids();
        join_all(ids.into_iter().map(|id| self.sync_view(id))).await;

        self.refresh_engines().await?;
        Ok(())
    }

    /// Re-read the station status.
    pub async fn refresh_status(&self) -> Result<ConnectionState> {
        let rows = self
            .send("get", STATION_ID, &[ObjectOption::named("status")])
            .await?;
        self.inner.apply_status(&rows, "get(1,status)")
    }

    /// Re-read the engine roster.
    pub async fn refresh_engines(&self) -> Result<Vec<EngineObject>> {
        let rows = self
            .send(
                "queryObjects",
                ROSTER_ID,
                &[ObjectOption::named("name"), ObjectOption::named("addr")],
            )
            .await?;
        let engines: Vec<EngineObject> = rows.iter().map(EngineObject::from_result).collect();
        tracing::debug!(count = engines.len(), "engine roster read");
        *self.inner.engines.lock() = engines.clone();
        self.inner
            .notifier
            .publish(NotificationKind::EnginesChanged(engines.clone()));
        Ok(engines)
    }

    /// Switch track power on.
    pub async fn start(&self) -> Result<ConnectionState> {
        self.send("set", STATION_ID, &[ObjectOption::named("go")])
            .await?;
        self.refresh_status().await
    }

    /// Switch track power off.
    pub async fn stop(&self) -> Result<ConnectionState> {
        self.send("set", STATION_ID, &[ObjectOption::named("stop")])
            .await?;
        self.refresh_status().await
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Last identification read from the device.
    pub fn device_info(&self) -> DeviceInfo {
        self.inner.info.lock().clone()
    }

    /// Last engine roster read from the device.
    pub fn engines(&self) -> Vec<EngineObject> {
        self.inner.engines.lock().clone()
    }

    /// Ids with an acknowledged remote view on the current connection.
    pub fn remote_views(&self) -> Vec<ObjectId> {
        self.inner.views.lock().iter().copied().collect()
    }

    /// Number of local consumers for `id`.
    pub fn consumer_count(&self, id: ObjectId) -> usize {
        self.inner.registry.consumer_count(id)
    }

    /// Number of distinct commands awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// True while a socket is open.
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Address of the connected device.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.link.lock().as_ref().map(|link| link.peer)
    }

    /// Active configuration.
    pub fn config(&self) -> &StationConfig {
        &self.inner.config
    }

    /// Listen for errors and session changes.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    /// Bring the remote view for `id` in line with its local consumers.
    ///
    /// Changes for one id run one at a time. The consumer count is re-read
    /// after every command, so a consumer that came back while a `release`
    /// was in flight gets its view requested again.
    async fn sync_view(&self, id: ObjectId) {
        let gate = self.inner.view_gate(id);
        let _serialized = gate.lock().await;

        loop {
            if !self.is_connected() {
                return;
            }
            let wanted = self.inner.registry.consumer_count(id) > 0;
            let held = self.inner.views.lock().contains(&id);
            if wanted == held {
                return;
            }

            let verb = if wanted { "request" } else { "release" };
            match self.send(verb, id, &[ObjectOption::named("view")]).await {
                Ok(_) => {
                    let mut views = self.inner.views.lock();
                    if wanted {
                        views.insert(id);
                    } else {
                        views.remove(&id);
                    }
                }
                Err(source) => {
                    self.inner
                        .notifier
                        .error(StationError::Subscription { id, source });
                    return;
                }
            }
        }
    }
}

impl Default for Station {
    fn default() -> Self {
        Self::new(StationConfig::default())
    }
}

impl Inner {
    fn view_gate(&self, id: ObjectId) -> Arc<AsyncMutex<()>> {
        self.view_gates.lock().entry(id).or_default().clone()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        self.notifier.state_changed(from, to);
    }

    /// Attach background tasks to the link of `generation`, or stop them if
    /// that link is already gone.
    fn track(&self, generation: u64, tasks: impl IntoIterator<Item = AbortHandle>) {
        let mut link = self.link.lock();
        match link.as_mut() {
            Some(link) if link.generation == generation => link.tasks.extend(tasks),
            _ => tasks.into_iter().for_each(|task| task.abort()),
        }
    }

    fn writer(&self) -> Option<(u64, Writer)> {
        self.link
            .lock()
            .as_ref()
            .map(|link| (link.generation, link.writer.clone()))
    }

    fn is_generation(&self, generation: u64) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    async fn request(&self, command: String) -> RequestResult<Vec<OptionResult>> {
        let (generation, writer) = self.writer().ok_or(RequestError::Connectivity)?;
        let waiter = self
            .correlator
            .enqueue(&command, self.config.request_timeout());

        if waiter.is_primary() {
            tracing::debug!(%command, "sending command");
            if self.config.echo_lines {
                tracing::trace!(target: "ecoslink::wire", ">> {command}");
            }
            let line = format!("{command}\n");
            let written = async {
                let mut writer = writer.lock().await;
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;

            match written {
                Err(err) => {
                    tracing::warn!(%command, error = %err, "write failed");
                    self.correlator.cancel(&waiter, RequestError::from(err));
                }
                Ok(()) if !self.is_generation(generation) => {
                    self.correlator.cancel(&waiter, RequestError::Connectivity);
                }
                Ok(()) => {}
            }
        } else {
            tracing::debug!(%command, "joining identical pending command");
        }

        let outcome = waiter.outcome().await;
        self.correlator.release(waiter);
        outcome
    }

    fn apply_status(&self, rows: &[OptionResult], command: &str) -> Result<ConnectionState> {
        let mut station_rows = rows.iter().filter(|row| row.id == STATION_ID).peekable();
        if station_rows.peek().is_none() {
            return Err(StationError::EmptyReply(command.to_string()));
        }
        // A missing status reads as an unrecognized one.
        let status = station_rows
            .find_map(|row| row.text_of("status"))
            .unwrap_or_default();
        let state = ConnectionState::parse(status);
        self.set_state(state);
        Ok(state)
    }

    fn handle(&self, message: Assembled) {
        match message {
            Assembled::Reply { command, outcome } => {
                tracing::debug!(%command, ok = outcome.is_ok(), "reply received");
                if !self.correlator.resolve(&command, outcome) {
                    tracing::debug!(%command, "reply without pending request dropped");
                }
            }
            Assembled::Event(results) => {
                for failure in self.registry.dispatch(&results) {
                    self.notifier.error(StationError::Consumer {
                        id: failure.id,
                        message: failure.message,
                    });
                }
            }
            Assembled::Notify(err) => self.notifier.error(err),
        }
    }

    /// Drop the connection. With `Some(generation)` only that connection is
    /// dropped; a newer one is left alone.
    fn shutdown(&self, generation: Option<u64>) {
        let link = {
            let mut slot = self.link.lock();
            let stale = match (generation, slot.as_ref()) {
                (Some(expected), Some(link)) => link.generation != expected,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if stale {
                return;
            }
            slot.take()
        };

        if link.is_none() && *self.state.lock() == ConnectionState::Idle {
            return;
        }
        if let Some(link) = link {
            for task in link.tasks {
                task.abort();
            }
            tracing::info!(peer = %link.peer, generation = link.generation, "connection closed");
        }
        self.views.lock().clear();
        self.engines.lock().clear();
        let rejected = self.correlator.reject_all(RequestError::Connectivity);
        if rejected > 0 {
            tracing::debug!(rejected, "pending requests rejected on close");
        }
        self.set_state(ConnectionState::Closed);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            for task in link.tasks {
                task.abort();
            }
        }
    }
}

async fn open(target: &str, port: u16) -> io::Result<(TcpStream, SocketAddr)> {
    let stream = TcpStream::connect((target, port)).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    Ok((stream, peer))
}

async fn read_loop(inner: Weak<Inner>, mut reader: OwnedReadHalf, generation: u64) {
    let (capacity, echo_lines) = match inner.upgrade() {
        Some(shared) => (shared.config.read_buffer.max(1), shared.config.echo_lines),
        None => return,
    };
    let mut splitter = LineSplitter::new();
    let mut assembler = MessageAssembler::new(echo_lines);
    let mut buf = vec![0u8; capacity];

    loop {
        let read = reader.read(&mut buf).await;
        let Some(shared) = inner.upgrade() else {
            return;
        };
        match read {
            Ok(0) => {
                shared.notifier.error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by command station",
                ));
                shared.shutdown(Some(generation));
                return;
            }
            Ok(n) => {
                for message in splitter.feed(&buf[..n], &mut assembler) {
                    shared.handle(message);
                }
            }
            Err(err) => {
                shared.notifier.error(err);
                shared.shutdown(Some(generation));
                return;
            }
        }
    }
}

/// Tracks the station status reported for object 1.
struct StatusSink {
    inner: Weak<Inner>,
}

impl EventSink for StatusSink {
    fn on_event(&self, _id: ObjectId, options: &[ObjectOption]) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if let Some(status) = options
            .iter()
            .find(|option| option.is("status"))
            .and_then(|option| option.text(0))
        {
            inner.set_state(ConnectionState::parse(status));
        }
        Ok(())
    }
}

/// Re-reads the engine roster whenever the engine manager reports a change.
struct RosterSink {
    inner: Weak<Inner>,
}

impl EventSink for RosterSink {
    fn on_event(&self, _id: ObjectId, _options: &[ObjectOption]) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let station = Station { inner };
        tokio::spawn(async move {
            if let Err(err) = station.refresh_engines().await {
                station.inner.notifier.error(err);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::Value;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let station = Station::default();
        let err = station
            .send("get", 1, &[ObjectOption::named("status")])
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Connectivity));
        assert_eq!(station.pending_requests(), 0);
    }

    #[tokio::test]
    async fn close_before_connect_changes_nothing() {
        let station = Station::default();
        let mut notifications = station.notifications();
        station.close();
        station.close();
        assert_eq!(station.state(), ConnectionState::Idle);
        assert!(!station.is_connected());
        assert!(notifications.try_recv().is_err());
    }

    /// Listener that accepts connections and never answers.
    async fn mute_device() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (addr, accept)
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (addr, accept) = mute_device().await;
        let station = Station::default();
        station.connect("127.0.0.1", Some(addr.port())).await.unwrap();
        let mut notifications = station.notifications();

        station.close();
        station.close();
        assert_eq!(station.state(), ConnectionState::Closed);
        assert!(!station.is_connected());
        assert_eq!(station.pending_requests(), 0);

        let first = notifications.recv().await.unwrap();
        assert!(matches!(
            first.kind,
            NotificationKind::StateChanged {
                to: ConnectionState::Closed,
                ..
            }
        ));
        assert!(notifications.try_recv().is_err());
        accept.abort();
    }

    #[tokio::test]
    async fn write_failure_rejects_with_transport_error() {
        let (addr, accept) = mute_device().await;
        let station = Station::default();
        station.connect("127.0.0.1", Some(addr.port())).await.unwrap();

        let (_, writer) = station.inner.writer().unwrap();
        writer.lock().await.shutdown().await.unwrap();

        let err = station
            .send("get", 7, &[ObjectOption::named("name")])
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)), "got {err:?}");
        assert_eq!(station.inner.correlator.waiter_count("get(7,name)"), None);
        station.close();
        assert_eq!(station.pending_requests(), 0);
        accept.abort();
    }

    #[tokio::test]
    async fn replaced_link_rejects_command_written_to_old_socket() {
        let (addr, accept) = mute_device().await;
        let station = Station::default();
        station.connect("127.0.0.1", Some(addr.port())).await.unwrap();

        let (old_generation, old_writer) = station.inner.writer().unwrap();
        let held = old_writer.lock().await;
        let pending = {
            let station = station.clone();
            tokio::spawn(async move { station.send("get", 7, &[ObjectOption::named("name")]).await })
        };
        while station.inner.correlator.waiter_count("get(7,name)").is_none() {
            tokio::task::yield_now().await;
        }

        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = stream.peer_addr().unwrap();
        let (_reader, writer) = stream.into_split();
        *station.inner.link.lock() = Some(Link {
            generation: old_generation + 1,
            peer,
            writer: Arc::new(AsyncMutex::new(writer)),
            tasks: Vec::new(),
        });
        drop(held);

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(RequestError::Connectivity)), "got {outcome:?}");
        assert_eq!(station.inner.correlator.waiter_count("get(7,name)"), None);
        accept.abort();
    }

    #[tokio::test]
    async fn refused_connect_reports_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let station = Station::default();
        let err = station.connect("127.0.0.1", Some(port)).await.unwrap_err();
        assert!(matches!(err, StationError::Transport(_)));
        assert_eq!(station.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn internal_consumers_watch_station_and_roster() {
        let station = Station::default();
        assert_eq!(station.consumer_count(STATION_ID), 1);
        assert_eq!(station.consumer_count(ROSTER_ID), 1);

        let sink: SinkHandle =
            Arc::new(|_id: ObjectId, _options: &[ObjectOption]| -> anyhow::Result<()> { Ok(()) });
        // Not connected: nothing is spawned, the roster is only updated locally.
        assert!(station.subscribe(1002, sink.clone()));
        assert!(station.unsubscribe(1002, &sink));
        assert!(station.remote_views().is_empty());
    }

    #[test]
    fn status_event_updates_state() {
        let station = Station::default();
        station.inner.handle(Assembled::Event(vec![OptionResult::new(
            1,
            vec![ObjectOption::named("status").with(Value::symbol("STOP"))],
        )]));
        assert_eq!(station.state(), ConnectionState::RunningHalted);
    }
}
