//! Connection state machine for the single supervised oximeter link.
//!
//! A worker task owns the link handle and serializes every status mutation.
//! Commands arrive over a channel, and hardware callbacks come back as
//! generation-tagged messages, so anything from a superseded session is
//! discarded instead of being applied to the wrong handle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::environment::{check_ready, EnvironmentSource, Precondition};
use super::events::{ConnectionStatus, DiscoveredPeripheral, OximeterEvent};
use super::reconnect::{ReconnectContext, ReconnectPolicy, RecoveryAction};
use super::scanner::ScanResults;
use super::transport::{LinkError, LinkHandle, LinkTransport};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::protocol::{decode_frame, Reading};

/// How often the streaming loop verifies the link is still up.
const LIVENESS_POLL: Duration = Duration::from_secs(10);

/// Commands posted into the worker task.
#[derive(Debug)]
enum Command {
    StartScan,
    StopScan,
    Connect { address: String },
    Disconnect,
    ClearDiscovered,
    Shutdown,
}

/// Control messages posted into a running session task.
#[derive(Debug, Clone, Copy)]
enum SessionCtrl {
    Disconnect { user: bool },
}

/// A progress report from a session task, tagged with the generation of the
/// handle it belongs to.
struct SessionMsg {
    generation: u64,
    update: SessionUpdate,
}

enum SessionUpdate {
    LinkUp,
    Subscribed,
    Frame(Bytes),
    Ended(SessionEnd),
}

/// Terminal outcome of a session task. The handle is already closed by the
/// time this is observed.
#[derive(Debug)]
enum SessionEnd {
    UserDisconnect,
    Superseded,
    NotFound,
    ConnectFailed(String),
    ServiceMissing,
    CharacteristicMissing,
    SubscribeFailed(String),
    LinkDropped(String),
}

struct ActiveSession {
    generation: u64,
    ctrl: mpsc::UnboundedSender<SessionCtrl>,
    task: JoinHandle<()>,
}

struct ScanWindow {
    deadline: Instant,
    rescan: bool,
}

/// Public handle to the connection state machine.
///
/// Commands are posted to a single worker task; status and the latest
/// reading are published through watch channels, so reads never block the
/// worker.
pub struct OximeterManager {
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    reading_rx: watch::Receiver<Option<Reading>>,
    discovered: Arc<RwLock<ScanResults>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<OximeterEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OximeterManager {
    /// Spawn the worker task against the given collaborators.
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        environment: Arc<dyn EnvironmentSource>,
        config: Config,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let (reading_tx, reading_rx) = watch::channel(None);
        let discovered = Arc::new(RwLock::new(ScanResults::new()));

        let worker = Worker {
            policy: ReconnectPolicy::new(config.max_reconnect_attempts),
            config,
            transport,
            environment,
            commands: cmd_rx,
            session_rx,
            session_tx,
            status_tx,
            reading_tx,
            events: event_tx,
            discovered: Arc::clone(&discovered),
            session: None,
            generation: 0,
            ctx: ReconnectContext::default(),
            scan: None,
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands: cmd_tx,
            status_rx,
            reading_rx,
            discovered,
            event_rx: Mutex::new(Some(event_rx)),
            worker: Mutex::new(Some(task)),
        }
    }

    /// Begin a discovery scan. No-op while a scan is already running.
    pub fn start_scan(&self) -> Result<()> {
        self.send(Command::StartScan)
    }

    /// Stop the current scan, if any.
    pub fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan)
    }

    /// Connect to the peripheral with this hardware address.
    pub fn connect(&self, address: impl Into<String>) -> Result<()> {
        self.send(Command::Connect {
            address: address.into(),
        })
    }

    /// Tear down the active link. Always safe, including with no link open.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Clear the discovered-peripheral list.
    pub fn clear_discovered(&self) -> Result<()> {
        self.send(Command::ClearDiscovered)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel following every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// The most recently decoded reading, if any.
    pub fn latest_reading(&self) -> Option<Reading> {
        self.reading_rx.borrow().clone()
    }

    /// Watch channel following the latest reading.
    pub fn watch_readings(&self) -> watch::Receiver<Option<Reading>> {
        self.reading_rx.clone()
    }

    /// Snapshot of the peripherals discovered in the current scan session.
    pub async fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.discovered.read().await.snapshot()
    }

    /// Take the event receiver. Yields `Some` exactly once.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<OximeterEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Stop the worker, tearing down any scan or link first.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(mut task) = self.worker.lock().await.take() {
            if timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!("worker did not stop in time, aborting");
                task.abort();
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CoreError::ManagerStopped)
    }
}

/// The single-writer task behind [`OximeterManager`].
struct Worker {
    config: Config,
    transport: Arc<dyn LinkTransport>,
    environment: Arc<dyn EnvironmentSource>,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    session_rx: mpsc::UnboundedReceiver<SessionMsg>,
    session_tx: mpsc::UnboundedSender<SessionMsg>,
    status_tx: watch::Sender<ConnectionStatus>,
    reading_tx: watch::Sender<Option<Reading>>,
    events: mpsc::UnboundedSender<OximeterEvent>,
    discovered: Arc<RwLock<ScanResults>>,
    session: Option<ActiveSession>,
    generation: u64,
    ctx: ReconnectContext,
    scan: Option<ScanWindow>,
}

impl Worker {
    async fn run(mut self) {
        debug!("connection manager worker started");
        let mut poll = interval(self.config.scan_poll());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::StartScan) => self.start_scan(false).await,
                    Some(Command::StopScan) => self.finish_scan().await,
                    Some(Command::Connect { address }) => self.handle_connect(address).await,
                    Some(Command::Disconnect) => self.handle_disconnect().await,
                    Some(Command::ClearDiscovered) => self.discovered.write().await.clear(),
                    Some(Command::Shutdown) | None => break,
                },
                Some(msg) = self.session_rx.recv() => self.handle_session_msg(msg).await,
                _ = poll.tick(), if self.scan.is_some() => self.poll_scan().await,
            }
        }

        self.teardown().await;
        debug!("connection manager worker stopped");
    }

    async fn teardown(&mut self) {
        self.abort_scan().await;
        self.supersede_session().await;
    }

    async fn start_scan(&mut self, rescan: bool) {
        if self.scan.is_some() {
            debug!("scan already running");
            return;
        }
        if self.session.is_some() {
            debug!("ignoring scan request while a connection is active");
            self.notice("disconnect before scanning for other devices");
            return;
        }
        if let Err(missing) = check_ready(self.environment.as_ref()) {
            self.report_precondition(missing);
            return;
        }

        // Stale entries from the previous session must not mask a device
        // that is no longer reachable.
        self.discovered.write().await.clear();

        if let Err(e) = self.transport.start_scan().await {
            warn!("could not start scan: {e}");
            self.notice(format!("could not start scan: {e}"));
            self.set_status(ConnectionStatus::Failed);
            return;
        }

        let window = if rescan {
            self.config.rescan_timeout()
        } else {
            self.config.scan_timeout()
        };
        self.scan = Some(ScanWindow {
            deadline: Instant::now() + window,
            rescan,
        });
        info!(rescan, window_secs = window.as_secs(), "scan started");
        self.set_status(ConnectionStatus::Scanning);
    }

    /// Harvest advertisements and stop the scan once its window has passed.
    async fn poll_scan(&mut self) {
        let Some(window) = self.scan.as_ref() else {
            return;
        };
        let deadline = window.deadline;

        match self.transport.advertisements().await {
            Ok(ads) => {
                let now = Utc::now();
                let mut results = self.discovered.write().await;
                for ad in ads {
                    let rssi = ad.rssi.unwrap_or(0);
                    if results.record(&ad.address, ad.name.as_deref(), rssi, now) {
                        debug!(address = %ad.address, rssi, "discovered peripheral");
                        let _ = self.events.send(OximeterEvent::DeviceDiscovered {
                            address: ad.address,
                            name: ad.name,
                            rssi,
                        });
                    }
                }
            }
            Err(e) => warn!("failed to poll scan results: {e}"),
        }

        if Instant::now() >= deadline {
            self.finish_scan().await;
        }
    }

    /// Stop the scan and return to idle unless a connection attempt owns
    /// the status.
    async fn finish_scan(&mut self) {
        if let Some(window) = self.scan.take() {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("failed to stop scan: {e}");
            }
            info!(rescan = window.rescan, "scan finished");
            if *self.status_tx.borrow() == ConnectionStatus::Scanning {
                self.set_status(ConnectionStatus::Idle);
            }
        }
    }

    /// Stop the scan without touching the status; used when a connect or
    /// disconnect supersedes the scan window.
    async fn abort_scan(&mut self) {
        if self.scan.take().is_some() {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("failed to stop scan: {e}");
            }
        }
    }

    async fn handle_connect(&mut self, address: String) {
        let address = address.trim().to_owned();
        if address.is_empty() {
            self.notice("cannot connect: empty device address");
            self.set_status(ConnectionStatus::DeviceNotFound);
            return;
        }

        if self.session.is_some() && self.ctx.address.as_deref() == Some(address.as_str()) {
            debug!(%address, "connect request ignored, already working on this target");
            return;
        }

        if let Err(missing) = check_ready(self.environment.as_ref()) {
            self.report_precondition(missing);
            return;
        }

        // A connect supersedes any scan window and any existing link.
        self.abort_scan().await;
        self.supersede_session().await;

        self.ctx = ReconnectContext::for_target(&address);
        info!(%address, "connecting");
        self.start_session(address, ConnectionStatus::Connecting);
    }

    async fn handle_disconnect(&mut self) {
        self.ctx.user_initiated = true;
        self.abort_scan().await;

        match &self.session {
            Some(session) => {
                debug!(generation = session.generation, "requesting disconnect");
                let _ = session.ctrl.send(SessionCtrl::Disconnect { user: true });
            }
            None => {
                // Nothing to close; settle in the terminal user state.
                self.reading_tx.send_replace(None);
                self.set_status(ConnectionStatus::DisconnectedByUser);
            }
        }
    }

    /// Ask the active session to stop and wait briefly for it to wind down.
    async fn supersede_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(generation = session.generation, "superseding active session");
            let _ = session.ctrl.send(SessionCtrl::Disconnect { user: false });
            if timeout(self.config.disconnect_grace(), &mut session.task)
                .await
                .is_err()
            {
                warn!("session did not stop within the grace period, aborting");
                session.task.abort();
            }
        }
    }

    fn start_session(&mut self, address: String, initial: ConnectionStatus) {
        self.generation += 1;
        let generation = self.generation;
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        self.set_status(initial);
        let task = tokio::spawn(run_session(SessionParams {
            transport: Arc::clone(&self.transport),
            address,
            generation,
            config: self.config.clone(),
            msg_tx: self.session_tx.clone(),
            ctrl: ctrl_rx,
        }));

        self.session = Some(ActiveSession {
            generation,
            ctrl: ctrl_tx,
            task,
        });
    }

    async fn handle_session_msg(&mut self, msg: SessionMsg) {
        if msg.generation != self.generation {
            debug!(
                generation = msg.generation,
                current = self.generation,
                "discarding stale session message"
            );
            return;
        }
        match msg.update {
            SessionUpdate::LinkUp => {
                info!("link established");
                self.set_status(ConnectionStatus::Connected);
            }
            SessionUpdate::Subscribed => {
                info!("telemetry notifications enabled");
                self.set_status(ConnectionStatus::Subscribed);
            }
            SessionUpdate::Frame(frame) => self.handle_frame(frame),
            SessionUpdate::Ended(end) => self.handle_session_end(end).await,
        }
    }

    fn handle_frame(&mut self, frame: Bytes) {
        match decode_frame(&frame, Utc::now()) {
            Ok(readings) => {
                for reading in readings {
                    let _ = self.events.send(OximeterEvent::ReadingUpdated {
                        reading: reading.clone(),
                    });
                    self.reading_tx.send_replace(Some(reading));
                }
            }
            // Protocol errors are recovered here; a corrupt frame must not
            // disturb the session.
            Err(e) => warn!("dropping malformed telemetry frame: {e}"),
        }
    }

    async fn handle_session_end(&mut self, end: SessionEnd) {
        self.session = None;
        self.reading_tx.send_replace(None);

        match end {
            SessionEnd::UserDisconnect => {
                info!("disconnected at user request");
                self.set_status(ConnectionStatus::DisconnectedByUser);
            }
            SessionEnd::Superseded => {
                debug!("session ended after being superseded");
            }
            SessionEnd::NotFound => {
                let target = self.ctx.address.clone().unwrap_or_default();
                self.notice(format!("device {target} not found"));
                self.set_status(ConnectionStatus::DeviceNotFound);
            }
            SessionEnd::ConnectFailed(reason) => {
                warn!("connect failed: {reason}");
                self.set_status(ConnectionStatus::DisconnectedError);
                self.recover().await;
            }
            SessionEnd::ServiceMissing => {
                warn!("oximeter service missing on peripheral");
                self.set_status(ConnectionStatus::ServiceNotFound);
                self.recover().await;
            }
            SessionEnd::CharacteristicMissing => {
                warn!("telemetry characteristic missing on peripheral");
                self.set_status(ConnectionStatus::CharacteristicNotFound);
                self.recover().await;
            }
            SessionEnd::SubscribeFailed(reason) => {
                warn!("subscribe failed: {reason}");
                self.set_status(ConnectionStatus::SubscribeFailed);
                self.recover().await;
            }
            SessionEnd::LinkDropped(reason) => {
                warn!("link dropped: {reason}");
                self.notice("connection to the oximeter was lost");
                self.set_status(ConnectionStatus::DisconnectedError);
                self.recover().await;
            }
        }
    }

    async fn recover(&mut self) {
        let action = self
            .policy
            .decide(&self.ctx, check_ready(self.environment.as_ref()));
        match action {
            RecoveryAction::Suppressed => {
                debug!("recovery suppressed, disconnect was user-initiated");
            }
            RecoveryAction::GiveUp => {
                warn!("no reconnect target known, giving up");
                self.notice("could not recover the connection");
                self.set_status(ConnectionStatus::Failed);
            }
            RecoveryAction::ReportPrecondition(missing) => self.report_precondition(missing),
            RecoveryAction::Retry { address } => {
                self.ctx.attempts_used += 1;
                info!(attempt = self.ctx.attempts_used, %address, "attempting automatic reconnect");
                self.notice(format!("connection lost, reconnecting to {address}"));
                self.start_session(address, ConnectionStatus::Reconnecting);
            }
            RecoveryAction::Rescan => {
                info!("reconnect attempts exhausted, refreshing the device list");
                self.notice("could not reconnect, scanning for nearby devices");
                self.start_scan(true).await;
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        debug!(%status, "connection status changed");
        self.status_tx.send_replace(status);
        let _ = self.events.send(OximeterEvent::StatusChanged { status });
    }

    fn report_precondition(&self, missing: Precondition) {
        warn!("radio operation refused: {missing}");
        self.set_status(ConnectionStatus::from(missing));
        self.notice(missing.to_string());
    }

    fn notice(&self, message: impl Into<String>) {
        let _ = self.events.send(OximeterEvent::Notice {
            message: message.into(),
        });
    }
}

struct SessionParams {
    transport: Arc<dyn LinkTransport>,
    address: String,
    generation: u64,
    config: Config,
    msg_tx: mpsc::UnboundedSender<SessionMsg>,
    ctrl: mpsc::UnboundedReceiver<SessionCtrl>,
}

enum StepOutcome<T> {
    Done(T),
    Cancelled { user: bool },
}

/// Await a link operation, racing it against the session control channel so
/// every suspension point stays cancellable.
async fn with_ctrl<F>(
    ctrl: &mut mpsc::UnboundedReceiver<SessionCtrl>,
    fut: F,
) -> StepOutcome<F::Output>
where
    F: std::future::Future,
{
    tokio::pin!(fut);
    tokio::select! {
        value = &mut fut => StepOutcome::Done(value),
        ctrl_msg = ctrl.recv() => {
            let user = matches!(ctrl_msg, Some(SessionCtrl::Disconnect { user: true }));
            StepOutcome::Cancelled { user }
        }
    }
}

fn cancel_end(user: bool) -> SessionEnd {
    if user {
        SessionEnd::UserDisconnect
    } else {
        SessionEnd::Superseded
    }
}

/// Close the handle exactly once, forcing the release if the radio does not
/// confirm within the grace period.
async fn close_link(handle: Box<dyn LinkHandle>, grace: Duration) {
    match timeout(grace, handle.disconnect()).await {
        Ok(Ok(())) => debug!("link closed"),
        Ok(Err(e)) => warn!("disconnect failed, releasing handle anyway: {e}"),
        Err(_) => warn!("disconnect unconfirmed after {grace:?}, forcing release"),
    }
}

/// Drive one connection attempt end to end.
///
/// Owns the link handle for its whole life and is the only place that closes
/// it, so the close happens exactly once on every exit path.
async fn run_session(mut p: SessionParams) {
    fn report(tx: &mpsc::UnboundedSender<SessionMsg>, generation: u64, update: SessionUpdate) {
        let _ = tx.send(SessionMsg { generation, update });
    }

    let grace = p.config.disconnect_grace();

    // Dial, unless a disconnect wins the race first.
    let outcome = with_ctrl(&mut p.ctrl, p.transport.connect(&p.address)).await;
    let handle = match outcome {
        StepOutcome::Done(Ok(handle)) => handle,
        StepOutcome::Done(Err(LinkError::DeviceNotFound(_))) => {
            report(&p.msg_tx, p.generation, SessionUpdate::Ended(SessionEnd::NotFound));
            return;
        }
        StepOutcome::Done(Err(e)) => {
            report(
                &p.msg_tx,
                p.generation,
                SessionUpdate::Ended(SessionEnd::ConnectFailed(e.to_string())),
            );
            return;
        }
        StepOutcome::Cancelled { user } => {
            report(&p.msg_tx, p.generation, SessionUpdate::Ended(cancel_end(user)));
            return;
        }
    };

    report(&p.msg_tx, p.generation, SessionUpdate::LinkUp);

    // Give the link a moment to settle before GATT work.
    let outcome = with_ctrl(&mut p.ctrl, sleep(p.config.settle_delay())).await;
    if let StepOutcome::Cancelled { user } = outcome {
        close_link(handle, grace).await;
        report(&p.msg_tx, p.generation, SessionUpdate::Ended(cancel_end(user)));
        return;
    }

    let outcome = with_ctrl(&mut p.ctrl, handle.discover_services()).await;
    match outcome {
        StepOutcome::Done(Ok(())) => {}
        StepOutcome::Done(Err(e)) => {
            close_link(handle, grace).await;
            report(
                &p.msg_tx,
                p.generation,
                SessionUpdate::Ended(SessionEnd::LinkDropped(format!(
                    "service discovery failed: {e}"
                ))),
            );
            return;
        }
        StepOutcome::Cancelled { user } => {
            close_link(handle, grace).await;
            report(&p.msg_tx, p.generation, SessionUpdate::Ended(cancel_end(user)));
            return;
        }
    }

    // Missing GATT pieces force an explicit teardown before reporting.
    if !handle.has_service(p.config.service_uuid) {
        close_link(handle, grace).await;
        report(
            &p.msg_tx,
            p.generation,
            SessionUpdate::Ended(SessionEnd::ServiceMissing),
        );
        return;
    }
    if !handle.has_characteristic(p.config.service_uuid, p.config.characteristic_uuid) {
        close_link(handle, grace).await;
        report(
            &p.msg_tx,
            p.generation,
            SessionUpdate::Ended(SessionEnd::CharacteristicMissing),
        );
        return;
    }

    let outcome = with_ctrl(&mut p.ctrl, handle.subscribe(p.config.characteristic_uuid)).await;
    match outcome {
        StepOutcome::Done(Ok(())) => {}
        StepOutcome::Done(Err(e)) => {
            close_link(handle, grace).await;
            report(
                &p.msg_tx,
                p.generation,
                SessionUpdate::Ended(SessionEnd::SubscribeFailed(e.to_string())),
            );
            return;
        }
        StepOutcome::Cancelled { user } => {
            close_link(handle, grace).await;
            report(&p.msg_tx, p.generation, SessionUpdate::Ended(cancel_end(user)));
            return;
        }
    }

    let outcome = with_ctrl(&mut p.ctrl, handle.notifications(p.config.characteristic_uuid)).await;
    let mut stream = match outcome {
        StepOutcome::Done(Ok(stream)) => stream,
        StepOutcome::Done(Err(e)) => {
            close_link(handle, grace).await;
            report(
                &p.msg_tx,
                p.generation,
                SessionUpdate::Ended(SessionEnd::SubscribeFailed(e.to_string())),
            );
            return;
        }
        StepOutcome::Cancelled { user } => {
            close_link(handle, grace).await;
            report(&p.msg_tx, p.generation, SessionUpdate::Ended(cancel_end(user)));
            return;
        }
    };

    report(&p.msg_tx, p.generation, SessionUpdate::Subscribed);

    // Forward frames until the link drops or a disconnect arrives.
    enum StreamExit {
        Dropped(String),
        Ctrl { user: bool },
    }

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(bytes) => report(&p.msg_tx, p.generation, SessionUpdate::Frame(bytes)),
                None => break StreamExit::Dropped("notification stream ended".to_owned()),
            },
            ctrl_msg = p.ctrl.recv() => {
                break StreamExit::Ctrl {
                    user: matches!(ctrl_msg, Some(SessionCtrl::Disconnect { user: true })),
                };
            }
            _ = sleep(LIVENESS_POLL) => {
                if !handle.is_connected().await {
                    break StreamExit::Dropped("link no longer connected".to_owned());
                }
            }
        }
    };

    close_link(handle, grace).await;
    let end = match reason {
        StreamExit::Dropped(why) => SessionEnd::LinkDropped(why),
        StreamExit::Ctrl { user } => cancel_end(user),
    };
    report(&p.msg_tx, p.generation, SessionUpdate::Ended(end));
}
