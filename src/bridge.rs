//! Tracker bridge core
//!
//! ```text
//!  serial reader threads ──┐
//!  BLE thread ─────────────┼─► transport channel ─┐
//!                          │                      ▼
//!  BridgeHandle ───────────┴─► command channel ─► bridge loop ──► UDP (IMU, battery)
//!                                                  │     │
//!                                   registration   │     └──► broadcast (BridgeEvent)
//!                                   queue (FIFO) ◄─┘
//!                                         │
//!                                         ▼
//!                             registration worker ──► UDP (handshake, sensor info)
//! ```
//!
//! The loop handles one transport event at a time, so frames of one tracker
//! leave in arrival order. Registrations run on their own worker, one at a
//! time, so slot numbers are handed out without gaps.

use crate::domain::ankle::AnkleSynthesizer;
use crate::domain::frame::{self, Frame, ImuFrame};
use crate::domain::models::{
    BridgeEvent, ButtonKind, ConnectionMode, StartRequest, StopRequest, TransportEvent,
};
use crate::domain::registry::{Admission, RegistrationKind, TrackerRegistry};
use crate::domain::settings::{BluetoothSettings, Settings};
use crate::domain::tracker_settings::TrackerSettings;
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::{self, BluetoothHandle};
use crate::infrastructure::serial::demux::PortWrite;
use crate::infrastructure::serial::service::SerialWriter;
use crate::infrastructure::serial::{self, PortOpener, SerialDemux, SerialService};
use crate::infrastructure::server::{BatteryReading, ServerConnection};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 1024;

enum Command {
    Start(StartRequest, oneshot::Sender<Vec<BridgeError>>),
    Stop(StopRequest, oneshot::Sender<()>),
    SetSettings {
        tracker_id: String,
        settings: TrackerSettings,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAllSettings(TrackerSettings, oneshot::Sender<Vec<BridgeError>>),
    Shutdown(oneshot::Sender<()>),
}

fn lock(registry: &Mutex<TrackerRegistry>) -> MutexGuard<'_, TrackerRegistry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cloneable control surface of a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    transport: mpsc::UnboundedSender<TransportEvent>,
    registry: Arc<Mutex<TrackerRegistry>>,
    events: broadcast::Sender<BridgeEvent>,
    server: Arc<ServerConnection>,
}

impl BridgeHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| BridgeError::BridgeStopped)?;
        response.await.map_err(|_| BridgeError::BridgeStopped)
    }

    /// Same as `call`, for threads outside the runtime
    fn blocking_call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| BridgeError::BridgeStopped)?;
        response
            .blocking_recv()
            .map_err(|_| BridgeError::BridgeStopped)
    }

    /// Open the requested transports. Channels that failed are returned;
    /// the others keep running.
    pub async fn start(&self, request: StartRequest) -> Result<Vec<BridgeError>> {
        self.call(|reply| Command::Start(request, reply)).await
    }

    pub async fn stop(&self, request: StopRequest) -> Result<()> {
        self.call(|reply| Command::Stop(request, reply)).await
    }

    pub async fn set_tracker_settings(
        &self,
        tracker_id: &str,
        settings: TrackerSettings,
    ) -> Result<()> {
        let tracker_id = tracker_id.to_string();
        self.call(|reply| Command::SetSettings {
            tracker_id,
            settings,
            reply,
        })
        .await?
    }

    /// Apply one configuration to every open port and BLE tracker
    pub async fn set_all_tracker_settings(
        &self,
        settings: TrackerSettings,
    ) -> Result<Vec<BridgeError>> {
        self.call(|reply| Command::SetAllSettings(settings, reply))
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }

    pub fn blocking_start(&self, request: StartRequest) -> Result<Vec<BridgeError>> {
        self.blocking_call(|reply| Command::Start(request, reply))
    }

    pub fn blocking_stop(&self, request: StopRequest) -> Result<()> {
        self.blocking_call(|reply| Command::Stop(request, reply))
    }

    pub fn blocking_set_tracker_settings(
        &self,
        tracker_id: &str,
        settings: TrackerSettings,
    ) -> Result<()> {
        let tracker_id = tracker_id.to_string();
        self.blocking_call(|reply| Command::SetSettings {
            tracker_id,
            settings,
            reply,
        })?
    }

    pub fn blocking_set_all_tracker_settings(
        &self,
        settings: TrackerSettings,
    ) -> Result<Vec<BridgeError>> {
        self.blocking_call(|reply| Command::SetAllSettings(settings, reply))
    }

    /// Active tracker ids ordered by slot
    pub fn active_trackers(&self) -> Vec<String> {
        lock(&self.registry).active_trackers()
    }

    /// Last known settings of a tracker, defaults if it never reported any
    pub fn tracker_settings(&self, tracker_id: &str) -> Result<TrackerSettings> {
        let registry = lock(&self.registry);
        match registry.settings(tracker_id) {
            Some(settings) => Ok(settings),
            None if registry.tracker(tracker_id).is_some() => Ok(TrackerSettings::default()),
            None => Err(BridgeError::UnknownTracker(tracker_id.to_string())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Input channel for transports, e.g. an external BLE backend
    pub fn transport(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.transport.clone()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }
}

pub struct TrackerBridge;

impl TrackerBridge {
    /// Bind the server socket and start the bridge tasks
    pub async fn spawn(settings: &Settings) -> Result<BridgeHandle> {
        Self::spawn_with_serial(settings, serial::port_opener(&settings.serial)).await
    }

    /// Same as `spawn`, with serial ports opened through `serial_opener`
    pub async fn spawn_with_serial(
        settings: &Settings,
        serial_opener: PortOpener,
    ) -> Result<BridgeHandle> {
        let server = Arc::new(ServerConnection::bind(&settings.server).await?);
        let registry = Arc::new(Mutex::new(TrackerRegistry::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport, transport_rx) = mpsc::unbounded_channel();
        let (registration, registration_rx) = mpsc::unbounded_channel();

        let background = vec![
            tokio::spawn(server.clone().run_receiver(events.clone())),
            tokio::spawn(server.clone().run_discovery_broadcast(Duration::from_millis(
                settings.server.discovery_interval_ms,
            ))),
            tokio::spawn(registration_worker(
                registration_rx,
                registry.clone(),
                server.clone(),
                events.clone(),
            )),
        ];

        let ankle = settings.ankle.enabled.then(|| {
            AnkleSynthesizer::new(settings.ankle.window, settings.ankle.virtual_suffix.clone())
        });

        let bridge = BridgeLoop {
            serial_opener,
            serial_generation: 0,
            bluetooth_settings: settings.bluetooth.clone(),
            registry: registry.clone(),
            server: server.clone(),
            events: events.clone(),
            registration,
            transport: transport.clone(),
            demux: SerialDemux::default(),
            serial: None,
            bluetooth: None,
            ankle,
            background,
        };
        tokio::spawn(bridge.run(command_rx, transport_rx));

        info!("Tracker bridge started");
        Ok(BridgeHandle {
            commands,
            transport,
            registry,
            events,
            server,
        })
    }
}

/// Drain the registration queue one tracker at a time
async fn registration_worker(
    mut queue: mpsc::UnboundedReceiver<String>,
    registry: Arc<Mutex<TrackerRegistry>>,
    server: Arc<ServerConnection>,
    events: broadcast::Sender<BridgeEvent>,
) {
    let mut unavailable_reported = false;

    while let Some(tracker_id) = queue.recv().await {
        let Some(plan) = lock(&registry).plan_registration(&tracker_id) else {
            trace!(tracker_id = %tracker_id, "Registration no longer needed");
            continue;
        };

        let sent = match plan.kind {
            RegistrationKind::Handshake => server.send_handshake().await,
            RegistrationKind::SensorInfo => server.send_sensor_info(plan.slot).await,
        };

        match sent {
            Ok(()) => {
                unavailable_reported = false;
                let mut registry = lock(&registry);
                if !registry.complete_registration(&plan) {
                    continue;
                }
                let Some(mode) = registry.tracker(&tracker_id).map(|t| t.mode) else {
                    continue;
                };
                drop(registry);

                info!(tracker_id = %tracker_id, slot = plan.slot, kind = ?plan.kind, "Tracker registered");
                let _ = events.send(BridgeEvent::Connect {
                    tracker_id,
                    mode,
                    slot: plan.slot,
                });
            }
            Err(e) => {
                lock(&registry).fail_registration(&tracker_id);
                let quiet = matches!(e, BridgeError::ServerUnavailable) && unavailable_reported;
                unavailable_reported |= matches!(e, BridgeError::ServerUnavailable);
                let failure = BridgeError::RegistrationFailure {
                    tracker_id,
                    reason: e.to_string(),
                };
                if quiet {
                    debug!("{}", failure);
                } else {
                    warn!("{}", failure);
                    let _ = events.send(BridgeEvent::error(failure.to_string()));
                }
            }
        }
    }
}

struct BridgeLoop {
    serial_opener: PortOpener,
    /// Generation of the current or last serial session
    serial_generation: u64,
    bluetooth_settings: BluetoothSettings,
    registry: Arc<Mutex<TrackerRegistry>>,
    server: Arc<ServerConnection>,
    events: broadcast::Sender<BridgeEvent>,
    registration: mpsc::UnboundedSender<String>,
    transport: mpsc::UnboundedSender<TransportEvent>,
    demux: SerialDemux,
    serial: Option<SerialService>,
    bluetooth: Option<BluetoothHandle>,
    ankle: Option<AnkleSynthesizer>,
    background: Vec<JoinHandle<()>>,
}

impl BridgeLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport.recv() => self.handle_transport(event).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
        info!("Tracker bridge stopped");
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, error: &BridgeError) {
        warn!("{}", error);
        self.emit(BridgeEvent::error(error.to_string()));
    }

    fn shutdown(&mut self) {
        self.stop_modes(StopRequest::all());
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(request, reply) => {
                let failures = self.start_modes(request).await;
                let _ = reply.send(failures);
            }
            Command::Stop(request, reply) => {
                self.stop_modes(request);
                let _ = reply.send(());
            }
            Command::SetSettings {
                tracker_id,
                settings,
                reply,
            } => self.set_settings(tracker_id, settings, reply),
            Command::SetAllSettings(settings, reply) => self.set_all_settings(settings, reply),
            Command::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    async fn start_modes(&mut self, request: StartRequest) -> Vec<BridgeError> {
        let mut failures = Vec::new();

        if let Some(serial) = request.serial {
            if self.serial.is_some() {
                self.stop_modes(StopRequest {
                    serial: true,
                    bluetooth: false,
                });
            }
            let ports = serial.ports;
            self.serial_generation += 1;
            let generation = self.serial_generation;
            let opener = self.serial_opener.clone();
            let tx = self.transport.clone();
            let opening = ports.clone();
            match tokio::task::spawn_blocking(move || {
                SerialService::start_with(&opening, generation, tx, |path| opener(path))
            })
            .await
            {
                Ok((service, port_failures)) => {
                    info!(
                        generation,
                        open = service.open_ports(),
                        requested = ports.len(),
                        "Serial mode started"
                    );
                    self.demux = SerialDemux::new(ports);
                    self.serial = Some(service);
                    failures.extend(port_failures);
                }
                Err(e) => failures.push(BridgeError::ChannelOpenFailure {
                    channel: "serial".to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        if request.bluetooth && self.bluetooth.is_none() {
            match bluetooth::start(&self.bluetooth_settings, self.transport.clone()) {
                Ok(handle) => {
                    info!("Bluetooth mode started");
                    self.bluetooth = Some(handle);
                }
                Err(e) => failures.push(e),
            }
        }

        for failure in &failures {
            self.report(failure);
        }
        failures
    }

    fn stop_modes(&mut self, request: StopRequest) {
        let mut removed = Vec::new();
        if request.serial {
            if let Some(service) = self.serial.take() {
                service.stop();
            }
            self.demux = SerialDemux::default();
            removed.extend(lock(&self.registry).remove_mode(ConnectionMode::Serial));
        }
        if request.bluetooth {
            if let Some(handle) = self.bluetooth.take() {
                handle.stop();
            }
            removed.extend(lock(&self.registry).remove_mode(ConnectionMode::Bluetooth));
        }

        for tracker_id in removed {
            if let Some(ankle) = self.ankle.as_mut() {
                ankle.forget(&tracker_id);
            }
            self.emit(BridgeEvent::Disconnect { tracker_id });
        }

        if self.serial.is_none() && self.bluetooth.is_none() {
            lock(&self.registry).clear();
            if let Some(ankle) = self.ankle.as_mut() {
                ankle.clear();
            }
            debug!("All modes stopped, slots released");
        }
    }

    fn mode_of(&self, tracker_id: &str) -> Option<ConnectionMode> {
        if let Some(tracker) = lock(&self.registry).tracker(tracker_id) {
            return Some(tracker.mode);
        }
        self.demux
            .locate(tracker_id)
            .map(|_| ConnectionMode::Serial)
    }

    fn set_settings(
        &mut self,
        tracker_id: String,
        settings: TrackerSettings,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let is_virtual = self
            .ankle
            .as_ref()
            .is_some_and(|a| a.is_virtual(&tracker_id));
        let mode = if is_virtual {
            None
        } else {
            self.mode_of(&tracker_id)
        };

        match mode {
            Some(ConnectionMode::Serial) => match self.serial_write(&tracker_id, &settings) {
                Ok((write, writer)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        let result = write_port(&writer, write, &tracker_id).await;
                        if result.is_ok() {
                            lock(&registry).record_settings(&tracker_id, settings);
                        }
                        let _ = reply.send(result);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Some(ConnectionMode::Bluetooth) => {
                let Some(handle) = self.bluetooth.clone() else {
                    let _ = reply.send(Err(BridgeError::SettingsWriteFailure {
                        target: tracker_id,
                        reason: "bluetooth mode is not running".to_string(),
                    }));
                    return;
                };
                let registry = self.registry.clone();
                tokio::spawn(async move {
                    let result = handle.write_settings(&tracker_id, &settings).await;
                    if result.is_ok() {
                        lock(&registry).record_settings(&tracker_id, settings);
                    }
                    let _ = reply.send(result);
                });
            }
            None => {
                let _ = reply.send(Err(BridgeError::UnknownTracker(tracker_id)));
            }
        }
    }

    fn serial_write(
        &mut self,
        tracker_id: &str,
        settings: &TrackerSettings,
    ) -> Result<(PortWrite, SerialWriter)> {
        let write = self
            .demux
            .settings_write(tracker_id, settings)
            .ok_or_else(|| BridgeError::UnknownTracker(tracker_id.to_string()))??;
        let writer = self
            .serial
            .as_ref()
            .and_then(|s| s.writer(write.port_index))
            .ok_or_else(|| BridgeError::SettingsWriteFailure {
                target: tracker_id.to_string(),
                reason: "serial port is not open".to_string(),
            })?;
        Ok((write, writer))
    }

    fn set_all_settings(
        &mut self,
        settings: TrackerSettings,
        reply: oneshot::Sender<Vec<BridgeError>>,
    ) {
        let mut failures = Vec::new();
        let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

        if let Some(service) = self.serial.as_ref() {
            match self.demux.settings_write_all(&settings) {
                Ok(writes) => {
                    for write in writes {
                        let ids = self.demux.trackers_on(write.port_index);
                        let Some(writer) = service.writer(write.port_index) else {
                            failures.push(BridgeError::SettingsWriteFailure {
                                target: self
                                    .demux
                                    .port_name(write.port_index)
                                    .unwrap_or_default()
                                    .to_string(),
                                reason: "serial port is not open".to_string(),
                            });
                            continue;
                        };
                        let registry = self.registry.clone();
                        tasks.push(tokio::spawn(async move {
                            let target = writer.port().to_string();
                            write_port(&writer, write, &target).await?;
                            let mut registry = lock(&registry);
                            for id in ids {
                                registry.record_settings(&id, settings);
                            }
                            Ok(())
                        }));
                    }
                }
                Err(e) => failures.push(e.into()),
            }
        }

        if let Some(handle) = self.bluetooth.clone() {
            let ble_trackers = lock(&self.registry).trackers_for(ConnectionMode::Bluetooth);
            for tracker_id in ble_trackers {
                if self
                    .ankle
                    .as_ref()
                    .is_some_and(|a| a.is_virtual(&tracker_id))
                {
                    continue;
                }
                let handle = handle.clone();
                let registry = self.registry.clone();
                tasks.push(tokio::spawn(async move {
                    handle.write_settings(&tracker_id, &settings).await?;
                    lock(&registry).record_settings(&tracker_id, settings);
                    Ok(())
                }));
            }
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(e) => failures.push(BridgeError::SettingsWriteFailure {
                        target: "settings task".to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
            for failure in &failures {
                warn!("{}", failure);
                let _ = events.send(BridgeEvent::error(failure.to_string()));
            }
            let _ = reply.send(failures);
        });
    }

    /// Serial input counts only while the session that produced it runs
    fn is_current_serial(&self, generation: u64) -> bool {
        self.serial
            .as_ref()
            .is_some_and(|s| s.generation() == generation)
    }

    fn port_label(&self, port_index: usize) -> String {
        self.demux
            .port_name(port_index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("port {port_index}"))
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SerialLine {
                generation,
                port_index,
                line,
            } => {
                if !self.is_current_serial(generation) {
                    trace!(generation, port_index, "Dropping line from a stopped serial session");
                    return;
                }
                match self.demux.route(port_index, &line) {
                    Ok(routed) => {
                        self.handle_frame(&routed.tracker_id, ConnectionMode::Serial, routed.frame)
                            .await
                    }
                    Err(error) => self.report(&BridgeError::MalformedFrame {
                        source_id: self.port_label(port_index),
                        error,
                    }),
                }
            }
            TransportEvent::SerialMalformed {
                generation,
                port_index,
                error,
            } => {
                if self.is_current_serial(generation) {
                    self.report(&BridgeError::MalformedFrame {
                        source_id: self.port_label(port_index),
                        error,
                    });
                }
            }
            TransportEvent::SerialLost {
                generation,
                port_index,
                reason,
            } => {
                if !self.is_current_serial(generation) {
                    return;
                }
                if let Some(service) = self.serial.as_mut() {
                    service.close_port(port_index);
                }
                for tracker_id in self.demux.trackers_on(port_index) {
                    self.disconnect(&tracker_id);
                }
                self.report(&BridgeError::ChannelOpenFailure {
                    channel: self.port_label(port_index),
                    reason,
                });
            }
            TransportEvent::BleConnected { tracker_id } => {
                self.emit(BridgeEvent::log(format!("{tracker_id} connected over Bluetooth")));
            }
            TransportEvent::BleNotification {
                tracker_id,
                characteristic,
                data,
            } => match frame::decode_ble(characteristic, &data) {
                Ok(frame) => {
                    self.handle_frame(&tracker_id, ConnectionMode::Bluetooth, frame)
                        .await
                }
                Err(error) => self.report(&BridgeError::MalformedFrame {
                    source_id: tracker_id,
                    error,
                }),
            },
            TransportEvent::BleDisconnected { tracker_id } => self.disconnect(&tracker_id),
            TransportEvent::ChannelFailed { channel, reason } => {
                self.report(&BridgeError::ChannelOpenFailure { channel, reason })
            }
        }
    }

    fn disconnect(&mut self, tracker_id: &str) {
        let mut ids = vec![tracker_id.to_string()];
        if let Some(ankle) = self.ankle.as_mut() {
            ankle.forget(tracker_id);
            ids.push(ankle.virtual_id(tracker_id));
        }

        for id in ids {
            if lock(&self.registry).disconnect(&id) {
                info!(tracker_id = %id, "Tracker disconnected");
                self.emit(BridgeEvent::Disconnect { tracker_id: id });
            }
        }
    }

    /// Admit the tracker; returns its slot once registered
    fn admit(&self, tracker_id: &str, mode: ConnectionMode) -> Option<u32> {
        match lock(&self.registry).admit(tracker_id, mode) {
            Admission::Active(slot) => Some(slot),
            Admission::Pending => None,
            Admission::Enqueue => {
                debug!(tracker_id, "Queueing registration");
                let _ = self.registration.send(tracker_id.to_string());
                None
            }
        }
    }

    async fn handle_frame(&mut self, tracker_id: &str, mode: ConnectionMode, frame: Frame) {
        match frame {
            Frame::Discovery(ref discovery) if discovery.searching => {
                trace!(tracker_id, "Dongle searching");
                self.disconnect(tracker_id);
                return;
            }
            Frame::SettingsEcho(raw) => {
                match TrackerSettings::decode(&raw) {
                    Ok(settings) => lock(&self.registry).record_settings(tracker_id, settings),
                    Err(e) => self.report(&BridgeError::Settings(e)),
                }
                return;
            }
            Frame::Unrecognized(raw) => {
                debug!(tracker_id, raw = %raw, "Unrecognized frame");
                return;
            }
            _ => {}
        }

        if self.admit(tracker_id, mode).is_none() {
            return;
        }

        match frame {
            Frame::Imu(imu) => self.handle_imu(tracker_id, mode, &imu).await,
            Frame::Battery(battery) => {
                let Some(merged) = lock(&self.registry).record_battery(tracker_id, &battery) else {
                    return;
                };
                let Some(percent) = merged.percent else {
                    return;
                };
                self.emit(BridgeEvent::Battery {
                    tracker_id: tracker_id.to_string(),
                    percent,
                    voltage_mv: merged.voltage_mv,
                    charge: merged.charge,
                });
                let reading = BatteryReading {
                    percent,
                    voltage_mv: merged.voltage_mv,
                };
                if let Err(e) = self.server.report_battery(reading).await {
                    self.send_failed(e);
                }
            }
            Frame::Button(buttons) => {
                let pressed: Vec<ButtonKind> = [
                    (ButtonKind::Main, buttons.main),
                    (ButtonKind::Sub, buttons.sub),
                ]
                .into_iter()
                .filter_map(|(kind, count)| {
                    let count = count?;
                    lock(&self.registry)
                        .record_button(tracker_id, kind, count)
                        .then_some(kind)
                })
                .collect();
                for button in pressed {
                    self.emit(BridgeEvent::Button {
                        tracker_id: tracker_id.to_string(),
                        button,
                    });
                }
            }
            Frame::Mag(status) => {
                if lock(&self.registry).record_mag(tracker_id, status) {
                    self.emit(BridgeEvent::Mag {
                        tracker_id: tracker_id.to_string(),
                        status,
                    });
                }
            }
            Frame::Discovery(_) => {}
            Frame::SettingsEcho(_) | Frame::Unrecognized(_) => {}
        }
    }

    async fn handle_imu(&mut self, tracker_id: &str, mode: ConnectionMode, imu: &ImuFrame) {
        let Some(slot) = lock(&self.registry).record_imu(tracker_id, imu) else {
            return;
        };
        self.emit(BridgeEvent::Imu {
            tracker_id: tracker_id.to_string(),
            rotation: imu.rotation,
            acceleration: imu.acceleration,
            euler: imu.rotation.to_euler().to_degrees(),
            ankle: imu.ankle,
        });
        if let Err(e) = self
            .server
            .send_imu(slot, &imu.rotation, &imu.acceleration)
            .await
        {
            self.send_failed(e);
        }

        let (Some(raw), Some(ankle)) = (imu.ankle, self.ankle.as_mut()) else {
            return;
        };
        let sample = ankle.synthesize(tracker_id, raw, imu.rotation);
        let Some(virtual_slot) = self.admit(&sample.tracker_id, mode) else {
            return;
        };
        let virtual_frame = ImuFrame {
            rotation: sample.rotation,
            acceleration: imu.acceleration,
            ankle: None,
        };
        lock(&self.registry).record_imu(&sample.tracker_id, &virtual_frame);
        self.emit(BridgeEvent::Imu {
            tracker_id: sample.tracker_id.clone(),
            rotation: sample.rotation,
            acceleration: imu.acceleration,
            euler: sample.rotation.to_euler().to_degrees(),
            ankle: None,
        });
        if let Err(e) = self
            .server
            .send_imu(virtual_slot, &sample.rotation, &imu.acceleration)
            .await
        {
            self.send_failed(e);
        }
    }

    fn send_failed(&self, e: BridgeError) {
        match e {
            BridgeError::ServerUnavailable => trace!("Dropping packet, no server yet"),
            other => {
                error!("UDP send failed: {}", other);
                self.emit(BridgeEvent::error(other.to_string()));
            }
        }
    }
}

async fn write_port(
    writer: &SerialWriter,
    write: PortWrite,
    target: &str,
) -> Result<()> {
    debug!(port = writer.port(), payload = %write.payload.trim_end(), "Serial settings write");
    writer
        .write(write.payload)
        .await
        .map_err(|e| match e {
            BridgeError::SettingsWriteFailure { .. } => e,
            other => BridgeError::SettingsWriteFailure {
                target: format!("{} ({})", target, writer.port()),
                reason: other.to_string(),
            },
        })
}
