//! # Request Routing and Dispatch
//!
//! Every accepted connection becomes a [`RequestTask`] on an endpoint's
//! request pool. The pool's task handler, [`RequestDispatcher`], decodes the
//! request through the [`Protocol`], picks the first [`HandlerDescriptor`]
//! whose url prefix matches, and runs the descriptor's components in order.
//!
//! ## Outcomes
//! - no descriptor matches: status 404
//! - a handler fails or panics: status 500, remaining handlers skipped, the
//!   failure logged through the designated logger
//! - in every case the request is passed back to
//!   [`Protocol::finish_request`]

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{anyhow, Context};
use hearth_api::{Config, ConfigError, HandlerContext, LogLevel, Request};
use tracing::trace;
use uuid::Uuid;

use crate::error::{panic_message, ComponentError};
use crate::globals::GlobalContext;
use crate::pool::TaskHandler;
use crate::protocol::Protocol;
use crate::server::Connection;

pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// One configured handler chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub id: String,

    /// Url prefix served by this chain; `None` matches every url.
    pub url_prefix: Option<String>,

    /// Component names run in order for every matching request.
    pub components: Vec<String>,
}

impl HandlerDescriptor {
    pub fn matches(&self, url: &str) -> bool {
        self.url_prefix
            .as_deref()
            .map_or(true, |prefix| url.starts_with(prefix))
    }
}

/// Handler chains in declaration order.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<HandlerDescriptor>,
}

impl HandlerSet {
    pub fn new(handlers: Vec<HandlerDescriptor>) -> Self {
        Self { handlers }
    }

    /// Build from `handlers/<id>/url` and `handlers/<id>/components`.
    pub fn from_config(config: &dyn Config) -> Result<Self, ConfigError> {
        let mut handlers = Vec::new();
        for id in config.subkeys("handlers") {
            let components_path = format!("handlers/{}/components", id);
            let components: Vec<String> = config
                .as_string(&components_path)?
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            if components.is_empty() {
                return Err(ConfigError::Invalid {
                    path: components_path,
                    value: String::new(),
                    expected: "comma-separated component names",
                });
            }
            handlers.push(HandlerDescriptor {
                url_prefix: config.value(&format!("handlers/{}/url", id)),
                id,
                components,
            });
        }
        Ok(Self { handlers })
    }

    /// First chain whose prefix matches `url`.
    pub fn find(&self, url: &str) -> Option<&HandlerDescriptor> {
        self.handlers.iter().find(|handler| handler.matches(url))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// An accepted connection waiting for a worker.
#[derive(Debug)]
pub struct RequestTask {
    pub id: Uuid,
    pub connection: Connection,
    pub endpoint: Arc<str>,
    pub accepted_at: Instant,
}

impl RequestTask {
    pub fn new(connection: Connection, endpoint: Arc<str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            endpoint,
            accepted_at: Instant::now(),
        }
    }
}

/// Task handler of every request pool.
pub struct RequestDispatcher {
    globals: Weak<GlobalContext>,
    protocol: Arc<dyn Protocol>,
}

impl RequestDispatcher {
    pub fn new(globals: Weak<GlobalContext>, protocol: Arc<dyn Protocol>) -> Self {
        Self { globals, protocol }
    }

    fn run_chain(
        globals: &GlobalContext,
        descriptor: &HandlerDescriptor,
        request: &mut dyn Request,
        context: &mut HandlerContext,
    ) -> anyhow::Result<()> {
        for name in &descriptor.components {
            let component = globals.components().find(name)?;
            let handler = component
                .as_handler()
                .ok_or_else(|| ComponentError::MissingCapability {
                    name: name.clone(),
                    capability: "request handler",
                })?;
            handler
                .handle_request(request, context)
                .with_context(|| format!("handler component {} failed", name))?;
        }
        Ok(())
    }
}

impl TaskHandler<RequestTask> for RequestDispatcher {
    fn handle_task(&self, task: RequestTask) -> anyhow::Result<()> {
        let globals = self
            .globals
            .upgrade()
            .ok_or_else(|| anyhow!("global context released before request {}", task.id))?;

        let span = crate::request_span!(task.id, task.endpoint);
        let _guard = span.enter();
        trace!(queued_us = task.accepted_at.elapsed().as_micros() as u64, "Request dequeued");

        let mut request = self
            .protocol
            .read_request(task.connection)
            .with_context(|| format!("failed to read request {}", task.id))?;
        let mut context = HandlerContext::new(task.id.to_string());

        let started = Instant::now();
        let descriptor = globals.handlers().find(request.url());
        let outcome = match descriptor {
            None => {
                request.set_status(STATUS_NOT_FOUND);
                Ok(())
            }
            Some(descriptor) => {
                let run = panic::catch_unwind(AssertUnwindSafe(|| {
                    Self::run_chain(&globals, descriptor, request.as_mut(), &mut context)
                }));
                run.unwrap_or_else(|payload| {
                    Err(anyhow!("handler panicked: {}", panic_message(payload.as_ref())))
                })
            }
        };

        if let Err(e) = &outcome {
            request.set_status(STATUS_INTERNAL_ERROR);
            globals.log(
                LogLevel::Error,
                &format!("request {} to {} failed: {:#}", task.id, request.url(), e),
            );
        }
        if let Some(descriptor) = descriptor {
            globals.record_response_time(&descriptor.id, request.status(), started.elapsed());
        }

        let finished = self
            .protocol
            .finish_request(request)
            .with_context(|| format!("failed to finish request {}", task.id));
        outcome.and(finished)
    }
}
