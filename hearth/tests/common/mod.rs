// Shared fixtures for the hearth integration tests.
//
// - `LineProtocol`: a request is one line holding the url; the response is
//   the status code on the first line followed by the body
// - test components registered under module `test`, all reporting their
//   lifecycle into a shared `Events` log
#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hearth::component::{ComponentContext, Loader};
use hearth::server::{Connection, EndpointAddress};
use hearth::Protocol;
use hearth_api::{Component, HandlerContext, LogLevel, Logger, Request, RequestHandler};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

// --- Events ---

#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Events starting with `prefix`, prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.all()
            .iter()
            .filter_map(|event| event.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// --- Line protocol ---

pub struct LineRequest {
    connection: Connection,
    url: String,
    status: u16,
    body: Vec<u8>,
}

impl Request for LineRequest {
    fn url(&self) -> &str {
        &self.url
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct LineProtocol {
    pub finished: AtomicUsize,
}

impl Protocol for LineProtocol {
    fn read_request(&self, connection: Connection) -> anyhow::Result<Box<dyn Request>> {
        connection.set_read_timeout(Some(IO_TIMEOUT))?;
        let mut reader = BufReader::new(connection);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(Box::new(LineRequest {
            connection: reader.into_inner(),
            url: line.trim().to_string(),
            status: 200,
            body: Vec::new(),
        }))
    }

    fn finish_request(&self, request: Box<dyn Request>) -> anyhow::Result<()> {
        let mut request = request
            .downcast::<LineRequest>()
            .map_err(|_| anyhow::anyhow!("not a line request"))?;
        let mut response = format!("{}\n", request.status).into_bytes();
        response.extend_from_slice(&request.body);
        request.connection.write_all(&response)?;
        request.connection.flush()?;
        let _ = request.connection.shutdown(Shutdown::Write);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Send one request and return `(status, body)`.
pub fn send_request(address: &EndpointAddress, url: &str) -> io::Result<(u16, String)> {
    let response = match address {
        EndpointAddress::Tcp(address) => {
            exchange(TcpStream::connect_timeout(address, IO_TIMEOUT)?, url)?
        }
        EndpointAddress::Unix(path) => exchange(UnixStream::connect(path)?, url)?,
    };
    let (status, body) = response.split_once('\n').unwrap_or((response.as_str(), ""));
    let status = status
        .trim()
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, response.clone()))?;
    Ok((status, body.to_string()))
}

/// Raw exchange: write the url line, read until the server closes.
pub fn exchange<S: Read + Write>(mut stream: S, url: &str) -> io::Result<String> {
    stream.write_all(format!("{}\n", url).as_bytes())?;
    stream.flush()?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

// --- Test components ---

/// Records its lifecycle; behavior driven by its configuration:
/// - `depends`: comma-separated components resolved during construction
/// - `fail-load` / `fail-unload`: make the hook fail
pub struct Recorder {
    name: String,
    events: Events,
    fail_load: bool,
    fail_unload: bool,
    pub dependencies: Vec<Arc<dyn Component>>,
}

impl Recorder {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Component for Recorder {
    fn on_load(&self) -> anyhow::Result<()> {
        self.events.push(format!("load:{}", self.name));
        if self.fail_load {
            anyhow::bail!("{} refuses to load", self.name);
        }
        Ok(())
    }

    fn on_unload(&self) -> anyhow::Result<()> {
        self.events.push(format!("unload:{}", self.name));
        if self.fail_unload {
            anyhow::bail!("{} refuses to unload", self.name);
        }
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.events.push(format!("drop:{}", self.name));
    }
}

/// Writes `echo:<url>`; urls containing `fail` return an error and urls
/// containing `panic` panic.
pub struct Echo;

impl Component for Echo {
    fn as_handler(&self) -> Option<&dyn RequestHandler> {
        Some(self)
    }
}

impl RequestHandler for Echo {
    fn handle_request(
        &self,
        request: &mut dyn Request,
        context: &mut HandlerContext,
    ) -> anyhow::Result<()> {
        let url = request.url().to_string();
        if url.contains("panic") {
            panic!("echo asked to panic");
        }
        if url.contains("fail") {
            anyhow::bail!("echo asked to fail");
        }
        if let Some(user) = context.param("user") {
            request.write(format!("{}@", user).as_bytes())?;
        }
        request.write(format!("echo:{}", url).as_bytes())?;
        Ok(())
    }
}

/// Stores `user=tester` in the handler context for handlers after it.
pub struct Auth;

impl Component for Auth {
    fn as_handler(&self) -> Option<&dyn RequestHandler> {
        Some(self)
    }
}

impl RequestHandler for Auth {
    fn handle_request(
        &self,
        _request: &mut dyn Request,
        context: &mut HandlerContext,
    ) -> anyhow::Result<()> {
        assert!(!context.request_id().is_empty());
        context.set_param("user", "tester");
        Ok(())
    }
}

/// Logger capability writing `log:<LEVEL>:<message>` events.
pub struct MemoryLogger {
    events: Events,
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.events.push(format!("log:{}:{}", level, message));
    }
}

impl Component for MemoryLogger {
    fn as_logger(&self) -> Option<&dyn Logger> {
        Some(self)
    }
}

fn flag(context: &ComponentContext<'_>, key: &str) -> anyhow::Result<bool> {
    Ok(context.config().as_bool_or(&context.key(key), false)?)
}

/// Loader with the built-in factories plus `test:recorder`, `test:echo`,
/// `test:auth`, `test:memory-logger` and `test:broken`.
pub fn test_loader(events: &Events) -> Loader {
    let mut loader = Loader::new();
    let mut registrar = loader.registrar("test");

    let recorder_events = events.clone();
    registrar.add("recorder", move |ctx| {
        let mut dependencies = Vec::new();
        if let Some(depends) = ctx.value("depends") {
            for name in depends.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                dependencies.push(ctx.find(name)?);
            }
        }
        recorder_events.push(format!("construct:{}", ctx.name()));
        Ok(Box::new(Recorder {
            name: ctx.name().to_string(),
            events: recorder_events.clone(),
            fail_load: flag(ctx, "fail-load")?,
            fail_unload: flag(ctx, "fail-unload")?,
            dependencies,
        }))
    });

    registrar.add("echo", |_ctx| Ok(Box::new(Echo)));
    registrar.add("auth", |_ctx| Ok(Box::new(Auth)));

    let logger_events = events.clone();
    registrar.add("memory-logger", move |_ctx| {
        Ok(Box::new(MemoryLogger {
            events: logger_events.clone(),
        }))
    });

    registrar.add("broken", |ctx| {
        anyhow::bail!("{} cannot be built", ctx.name())
    });

    loader
}
