// Integration tests for hearth::Server

mod common;

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{send_request, test_loader, wait_until, Events, LineProtocol, IO_TIMEOUT};
use hearth::server::{ChannelSink, EndpointAddress};
use hearth::{ComponentError, DaemonError, GlobalContext, Server, ServerError, ServerStatus};
use hearth_api::MemoryConfig;

const WAIT: Duration = Duration::from_secs(5);

fn echo_config() -> MemoryConfig {
    MemoryConfig::new()
        .with("pools/main/threads", "2")
        .with("pools/main/queue", "16")
        .with("endpoints/web/port", "0")
        .with("components/echo/type", "test:echo")
        .with("components/auth/type", "test:auth")
        .with("handlers/secure/url", "/secure")
        .with("handlers/secure/components", "auth,echo")
        .with("handlers/echo/url", "/echo")
        .with("handlers/echo/components", "echo")
}

fn new_server(config: MemoryConfig, events: &Events) -> Server {
    hearth::logging::init_test();
    let globals = GlobalContext::new(
        Arc::new(config),
        Arc::new(test_loader(events)),
        Arc::new(LineProtocol::default()),
    )
    .unwrap();
    Server::new(globals).unwrap()
}

fn started_server(config: MemoryConfig, events: &Events) -> Server {
    let server = new_server(config, events);
    server.start().unwrap();
    assert_eq!(server.status(), ServerStatus::Running);
    server
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hearth-{}-{}", std::process::id(), name))
}

#[test]
fn test_requests_are_routed_through_handler_chains() {
    let events = Events::default();
    let server = started_server(echo_config(), &events);
    let web = server.endpoint_address("web").unwrap();
    assert!(matches!(&web, EndpointAddress::Tcp(address) if address.port() != 0));

    assert_eq!(send_request(&web, "/echo/hello").unwrap(), (200, "echo:/echo/hello".into()));
    assert_eq!(
        send_request(&web, "/secure/data").unwrap(),
        (200, "tester@echo:/secure/data".into())
    );
    assert_eq!(send_request(&web, "/unknown").unwrap(), (404, String::new()));

    assert_eq!(server.status_report().endpoint("web").unwrap().accepted, 3);
    assert!(wait_until(WAIT, || {
        server.status_report().pool("main").unwrap().info.completed_tasks == 3
    }));

    server.stop().unwrap();
    server.join();
}

#[test]
fn test_failing_and_panicking_handlers_answer_500() {
    let events = Events::default();
    let config = echo_config()
        .with("components/log/type", "test:memory-logger")
        .with("daemon/logger", "log");
    let server = started_server(config, &events);
    let web = server.endpoint_address("web").unwrap();

    assert_eq!(send_request(&web, "/echo/fail").unwrap(), (500, String::new()));
    assert_eq!(send_request(&web, "/echo/panic").unwrap(), (500, String::new()));

    // The worker survives both and keeps serving.
    assert_eq!(send_request(&web, "/echo/ok").unwrap(), (200, "echo:/echo/ok".into()));

    let errors = events.with_prefix("log:ERROR:");
    assert_eq!(errors.len(), 2);
    assert!(errors[0].contains("echo asked to fail"));
    assert!(errors[1].contains("echo asked to panic"));
    assert!(wait_until(WAIT, || {
        server.status_report().pool("main").unwrap().info.failed_tasks == 2
    }));
}

#[test]
fn test_stop_and_join() {
    let events = Events::default();
    let config = echo_config().with("components/rec/type", "test:recorder");
    let server = started_server(config, &events);
    assert!(wait_until(WAIT, || server.status_report().active_threads == 2));

    server.stop().unwrap();
    assert!(server.is_stopping());
    server.stop().unwrap();
    server.join();

    let report = server.status_report();
    assert!(report.stopping);
    assert_eq!(report.status, ServerStatus::Running);
    assert_eq!(report.active_threads, 0);
    assert!(!report.pool("main").unwrap().info.started);
    assert_eq!(events.with_prefix("unload:"), vec!["rec"]);
    assert!(server.globals().pools().all(|(_, pool)| !pool.is_started()));
}

#[test]
fn test_start_is_accepted_once() {
    let events = Events::default();
    let server = started_server(echo_config(), &events);
    assert!(matches!(
        server.start(),
        Err(DaemonError::Server(ServerError::InvalidState { actual: "running", .. }))
    ));

    server.stop().unwrap();
    server.join();
    assert!(matches!(
        server.start(),
        Err(DaemonError::Server(ServerError::InvalidState { actual: "stopped", .. }))
    ));
}

#[test]
fn test_stop_before_start_prevents_start() {
    let server = new_server(echo_config(), &Events::default());
    server.stop().unwrap();
    assert!(server.start().is_err());
    assert_eq!(server.status(), ServerStatus::NotInited);
    assert!(server.endpoint_addresses().is_empty());
}

#[test]
fn test_unix_socket_endpoint() {
    let events = Events::default();
    let socket = temp_path("unix-endpoint.sock");
    let config = echo_config().with("endpoints/local/socket", &socket.display().to_string());
    let server = started_server(config, &events);

    let local = server.endpoint_address("local").unwrap();
    assert_eq!(local, EndpointAddress::Unix(socket.clone()));
    assert_eq!(server.endpoint_addresses().len(), 2);
    assert_eq!(send_request(&local, "/echo/unix").unwrap(), (200, "echo:/echo/unix".into()));

    drop(server);
    assert!(!socket.exists());
}

#[test]
fn test_failed_load_never_reaches_running() {
    let events = Events::default();
    let config = echo_config()
        .with("components/x/type", "test:recorder")
        .with("components/x/depends", "y")
        .with("components/y/type", "test:recorder")
        .with("components/y/depends", "x");
    let server = new_server(config, &events);

    assert!(matches!(
        server.start(),
        Err(DaemonError::Component(ComponentError::CyclicDependency(_)))
    ));
    assert_ne!(server.status(), ServerStatus::Running);
    assert!(server.is_stopping());
    assert!(server.endpoint_addresses().is_empty());
    assert_eq!(server.status_report().active_threads, 0);
    assert!(server.globals().pools().all(|(_, pool)| !pool.is_started()));
}

#[test]
fn test_endpoint_with_unknown_pool() {
    let config = echo_config().with("endpoints/web/pool", "missing");
    let server = new_server(config, &Events::default());
    match server.start() {
        Err(DaemonError::Server(ServerError::UnknownPool { endpoint, pool })) => {
            assert_eq!((endpoint.as_str(), pool.as_str()), ("web", "missing"));
        }
        other => panic!("expected unknown pool error, got {:?}", other),
    }
    assert_eq!(server.status(), ServerStatus::NotInited);
}

#[test]
fn test_endpoint_bind_conflict() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = echo_config().with("endpoints/web/port", &port.to_string());
    let server = new_server(config, &Events::default());

    match server.start() {
        Err(DaemonError::Server(ServerError::EndpointBind { endpoint, address, .. })) => {
            assert_eq!(endpoint, "web");
            assert_eq!(address, format!("tcp://127.0.0.1:{}", port));
        }
        other => panic!("expected bind error, got {:?}", other),
    }
}

#[test]
fn test_full_queue_rejects_connections() {
    let events = Events::default();
    let config = echo_config().with("pools/main/queue", "0");
    let server = started_server(config, &events);
    let web = server.endpoint_address("web").unwrap();

    // The connection is closed without a response.
    assert!(!matches!(send_request(&web, "/echo/x"), Ok((200, _))));
    assert!(wait_until(WAIT, || {
        let status = server.status_report().endpoint("web").cloned().unwrap();
        status.accepted == 1 && status.rejected == 1
    }));
}

#[test]
fn test_monitor_publishes_status_reports() {
    let events = Events::default();
    let config = echo_config().with("daemon/monitor/interval-ms", "20");
    let (sink, reports) = ChannelSink::bounded(64);
    let server = new_server(config, &events).with_status_sink(Arc::new(sink));
    server.start().unwrap();

    let running = std::iter::from_fn(|| reports.recv_timeout(WAIT).ok())
        .find(|report| report.status == ServerStatus::Running)
        .unwrap();
    assert!(!running.stopping);
    assert_eq!(running.pool("main").unwrap().info.thread_count, 2);
    assert!(running.endpoint("web").unwrap().address.starts_with("tcp://127.0.0.1:"));
}

#[test]
fn test_monitor_port_answers_with_json_report() {
    let events = Events::default();
    let config = echo_config().with("daemon/monitor/port", "0");
    let server = started_server(config, &events);
    let address = server.monitor_address().unwrap();

    let mut stream = TcpStream::connect_timeout(&address, IO_TIMEOUT).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).unwrap();
    assert!(body.ends_with('\n'));

    let report: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(report["status"], "running");
    assert_eq!(report["stopping"], false);
    assert_eq!(report["pools"][0]["name"], "main");
    assert_eq!(report["pools"][0]["thread_count"], 2);
    assert_eq!(report["endpoints"][0]["name"], "web");
}

#[test]
fn test_pid_file_lifecycle() {
    let pid_file = temp_path("server.pid");
    let config = echo_config().with("daemon/pidfile", &pid_file.display().to_string());
    let server = started_server(config, &Events::default());

    let written = std::fs::read_to_string(&pid_file).unwrap();
    assert_eq!(written.trim(), std::process::id().to_string());

    server.stop().unwrap();
    server.join();
    assert!(!pid_file.exists());
}

#[test]
fn test_response_times_served_as_json() {
    let events = Events::default();
    let config = echo_config()
        .with("components/stats/type", "hearth:response-time")
        .with("daemon/statistics", "stats")
        .with("daemon/log-times", "yes")
        .with("handlers/stats/url", "/stats")
        .with("handlers/stats/components", "stats");
    let server = started_server(config, &events);
    let web = server.endpoint_address("web").unwrap();

    for _ in 0..2 {
        send_request(&web, "/echo/timed").unwrap();
    }
    send_request(&web, "/secure/timed").unwrap();

    let (status, body) = send_request(&web, "/stats").unwrap();
    assert_eq!(status, 200);
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["echo"]["200"]["hits"], 2);
    assert_eq!(stats["secure"]["200"]["hits"], 1);
    assert!(stats.get("stats").is_none());
}
