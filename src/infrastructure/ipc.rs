//! Local control socket
//!
//! Newline-delimited JSON over a named local socket. Each client gets its
//! own thread; requests are answered in order. A `Subscribe` request turns
//! the connection into a one-way stream of bridge events.

use crate::bridge::BridgeHandle;
use crate::domain::models::{BridgeEvent, StartRequest, StopRequest};
use crate::domain::tracker_settings::{SettingsRequest, TrackerSettings};
use crate::infrastructure::serial;
use anyhow::{Context, Result};
use interprocess::local_socket::{
    traits::{ListenerExt, Stream as _},
    GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::thread;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum IpcRequest {
    Start(StartRequest),
    Stop(StopRequest),
    SetTrackerSettings {
        tracker_id: String,
        settings: SettingsRequest,
    },
    SetAllTrackerSettings(SettingsRequest),
    GetActiveTrackers,
    GetTrackerSettings(String),
    ListPorts,
    Subscribe,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum IpcResponse {
    Ok,
    /// Request went through but some channels failed
    Partial(Vec<String>),
    Trackers(Vec<String>),
    Settings(TrackerSettings),
    Ports(Vec<String>),
    Subscribed,
    Event(BridgeEvent),
    Error(String),
}

/// Serve requests on `socket_name` from a background thread
pub fn spawn_server(socket_name: &str, bridge: BridgeHandle) -> Result<()> {
    let name = socket_name
        .to_ns_name::<GenericNamespaced>()
        .with_context(|| format!("Invalid socket name {socket_name}"))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_sync()
        .with_context(|| format!("Failed to listen on {socket_name}"))?;
    info!(socket = socket_name, "IPC listening");

    thread::Builder::new()
        .name("ipc-accept".to_string())
        .spawn(move || {
            for conn in listener.incoming().filter_map(|x| x.ok()) {
                let bridge = bridge.clone();
                let spawned = thread::Builder::new()
                    .name("ipc-client".to_string())
                    .spawn(move || {
                        debug!("IPC client connected");
                        if let Err(e) = handle_connection(conn, &bridge) {
                            warn!("IPC connection error: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    error!("Failed to spawn IPC client thread: {}", e);
                }
            }
        })?;
    Ok(())
}

fn write_line(stream: &mut LocalStream, response: &IpcResponse) -> Result<()> {
    let json = serde_json::to_string(response)? + "\n";
    stream.write_all(json.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn handle_connection(mut stream: LocalStream, bridge: &BridgeHandle) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if reader.read_line(&mut buffer)? == 0 {
            return Ok(());
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<IpcRequest>(&buffer) {
            Ok(request) => request,
            Err(e) => {
                write_line(&mut stream, &IpcResponse::Error(format!("invalid request: {e}")))?;
                continue;
            }
        };
        debug!(?request, "IPC request");

        if request == IpcRequest::Subscribe {
            return stream_events(stream, bridge);
        }
        let response = execute(request, bridge);
        write_line(&mut stream, &response)?;
    }
}

/// Forward events until the client goes away
fn stream_events(mut stream: LocalStream, bridge: &BridgeHandle) -> Result<()> {
    let mut events = bridge.subscribe();
    write_line(&mut stream, &IpcResponse::Subscribed)?;
    loop {
        match events.blocking_recv() {
            Ok(event) => write_line(&mut stream, &IpcResponse::Event(event))?,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "IPC subscriber lagging"),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn settings_from(request: SettingsRequest) -> Result<TrackerSettings, IpcResponse> {
    TrackerSettings::try_from(request).map_err(|e| IpcResponse::Error(e.to_string()))
}

fn execute(request: IpcRequest, bridge: &BridgeHandle) -> IpcResponse {
    let outcome = |failures: Vec<crate::error::BridgeError>| {
        if failures.is_empty() {
            IpcResponse::Ok
        } else {
            IpcResponse::Partial(failures.iter().map(ToString::to_string).collect())
        }
    };

    match request {
        IpcRequest::Start(start) => match bridge.blocking_start(start) {
            Ok(failures) => outcome(failures),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::Stop(stop) => match bridge.blocking_stop(stop) {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::SetTrackerSettings {
            tracker_id,
            settings,
        } => {
            let settings = match settings_from(settings) {
                Ok(settings) => settings,
                Err(response) => return response,
            };
            match bridge.blocking_set_tracker_settings(&tracker_id, settings) {
                Ok(()) => IpcResponse::Ok,
                Err(e) => IpcResponse::Error(e.to_string()),
            }
        }
        IpcRequest::SetAllTrackerSettings(settings) => {
            let settings = match settings_from(settings) {
                Ok(settings) => settings,
                Err(response) => return response,
            };
            match bridge.blocking_set_all_tracker_settings(settings) {
                Ok(failures) => outcome(failures),
                Err(e) => IpcResponse::Error(e.to_string()),
            }
        }
        IpcRequest::GetActiveTrackers => IpcResponse::Trackers(bridge.active_trackers()),
        IpcRequest::GetTrackerSettings(tracker_id) => match bridge.tracker_settings(&tracker_id) {
            Ok(settings) => IpcResponse::Settings(settings),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::ListPorts => match serial::list_ports() {
            Ok(ports) => IpcResponse::Ports(ports),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::Subscribe => IpcResponse::Subscribed,
    }
}

/// Client side of the control socket
pub struct IpcClient {
    reader: BufReader<LocalStream>,
}

impl IpcClient {
    pub fn connect(socket_name: &str) -> Result<Self> {
        let name = socket_name.to_ns_name::<GenericNamespaced>()?;
        let stream = LocalStream::connect(name)
            .with_context(|| format!("Bridge is not listening on {socket_name}"))?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Send one request and wait for its response
    pub fn send(&mut self, request: &IpcRequest) -> Result<IpcResponse> {
        let json = serde_json::to_string(request)? + "\n";
        let stream = self.reader.get_mut();
        stream.write_all(json.as_bytes())?;
        stream.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<IpcResponse> {
        let mut buffer = String::new();
        if self.reader.read_line(&mut buffer)? == 0 {
            anyhow::bail!("Bridge closed the connection");
        }
        Ok(serde_json::from_str(&buffer)?)
    }

    /// Turn this connection into an event stream
    pub fn subscribe(mut self) -> Result<EventStream> {
        match self.send(&IpcRequest::Subscribe)? {
            IpcResponse::Subscribed => Ok(EventStream { client: self }),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }
}

pub struct EventStream {
    client: IpcClient,
}

impl EventStream {
    /// Block until the next event arrives
    pub fn next_event(&mut self) -> Result<BridgeEvent> {
        match self.client.read_response()? {
            IpcResponse::Event(event) => Ok(event),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        }
    }
}
