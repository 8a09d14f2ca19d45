//! # Monitor
//!
//! A dedicated thread that periodically publishes a [`StatusReport`] to the
//! server's [`StatusSink`], and, when `daemon/monitor/port` is set, answers
//! every connection on that port with one JSON report line.
//!
//! Nothing the monitor does can affect request serving: publication panics
//! are caught and I/O errors are logged.

use std::io::{self, Write};
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::endpoint::EndpointStatus;
use super::stopper::WaitResult;
use super::{ServerShared, ServerStatus};
use crate::error::panic_message;
use crate::pool::ThreadPoolInfo;

const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    #[serde(flatten)]
    pub info: ThreadPoolInfo,
}

/// Snapshot of the whole server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: ServerStatus,
    pub stopping: bool,
    pub active_threads: usize,
    pub pools: Vec<PoolStatus>,
    pub endpoints: Vec<EndpointStatus>,
}

impl StatusReport {
    pub fn pool(&self, name: &str) -> Option<&PoolStatus> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointStatus> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiver of periodic status reports.
pub trait StatusSink: Send + Sync {
    fn publish(&self, report: &StatusReport);
}

/// Default sink: one debug event per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn publish(&self, report: &StatusReport) {
        match report.to_json() {
            Ok(json) => debug!(target: "hearth::monitor", report = %json, "Server status"),
            Err(e) => warn!(error = %e, "Failed to serialize status report"),
        }
    }
}

/// Sink forwarding reports into a bounded channel.
///
/// Reports are dropped while the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: flume::Sender<StatusReport>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<StatusReport>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl StatusSink for ChannelSink {
    fn publish(&self, report: &StatusReport) {
        if let Err(e) = self.sender.try_send(report.clone()) {
            trace!(error = %e, "Status report dropped");
        }
    }
}

/// Body of the monitor thread.
pub(super) fn run_monitor(shared: &ServerShared, listener: Option<TcpListener>) {
    let interval = shared.globals.server_config().monitor_interval;
    let listener_fd = listener.as_ref().map(|listener| listener.as_raw_fd());
    let mut next_publish = Instant::now() + interval;

    loop {
        let timeout = next_publish.saturating_duration_since(Instant::now());
        match shared.stop_pipe.wait(listener_fd, Some(timeout)) {
            Ok(WaitResult::Stopped) => break,
            Ok(WaitResult::Ready) => {
                if let Some(listener) = &listener {
                    serve_status_queries(shared, listener);
                }
            }
            Ok(WaitResult::Timeout) => {
                publish(shared);
                next_publish = Instant::now() + interval;
            }
            Err(e) => {
                warn!(error = %e, "Monitor poll failed");
                thread::sleep(interval);
            }
        }
    }
    debug!("Monitor stopped");
}

fn publish(shared: &ServerShared) {
    let report = shared.status_report();
    let sink = shared.status_sink();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.publish(&report))) {
        warn!(panic = %panic_message(payload.as_ref()), "Status sink panicked");
    }
}

fn serve_status_queries(shared: &ServerShared, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = write_status(shared, stream) {
                    debug!(peer = %peer, error = %e, "Status query failed");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Monitor accept failed");
                return;
            }
        }
    }
}

fn write_status(shared: &ServerShared, mut stream: std::net::TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(STATUS_WRITE_TIMEOUT))?;
    let mut line = shared.status_report().to_json().map_err(io::Error::other)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()
}
