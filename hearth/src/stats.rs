//! `hearth:response-time`: handler latency statistics.
//!
//! Counters are kept per handler id and response status. The component is
//! also a request handler that answers with the current snapshot as JSON,
//! so it can be mounted on a url like any other handler.

use std::collections::BTreeMap;
use std::time::Duration;

use hearth_api::{Component, HandlerContext, Request, RequestHandler};
use parking_lot::Mutex;
use serde::Serialize;

use crate::component::ComponentContext;

/// Aggregated timings of one (handler, status) pair, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterData {
    pub min: u64,
    pub max: u64,
    pub total: u64,
    pub hits: u64,
}

impl CounterData {
    fn add(&mut self, micros: u64) {
        if self.hits == 0 || micros < self.min {
            self.min = micros;
        }
        self.max = self.max.max(micros);
        self.total = self.total.saturating_add(micros);
        self.hits += 1;
    }

    pub fn avg(&self) -> u64 {
        if self.hits == 0 {
            0
        } else {
            self.total / self.hits
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CounterView {
    min: u64,
    max: u64,
    avg: u64,
    hits: u64,
}

/// Handler id → status code → timings.
pub type StatsSnapshot = BTreeMap<String, BTreeMap<u16, CounterData>>;

#[derive(Debug, Default)]
pub struct ResponseTimeStats {
    counters: Mutex<StatsSnapshot>,
}

impl ResponseTimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_context(_context: &ComponentContext<'_>) -> anyhow::Result<Self> {
        Ok(Self::new())
    }

    pub fn add(&self, handler: &str, status: u16, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut counters = self.counters.lock();
        counters
            .entry(handler.to_string())
            .or_default()
            .entry(status)
            .or_default()
            .add(micros);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.counters.lock().clone()
    }

    pub fn reset(&self) {
        self.counters.lock().clear();
    }

    /// Snapshot rendered as `{"<handler>": {"<status>": {min, max, avg, hits}}}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let view: BTreeMap<String, BTreeMap<String, CounterView>> = self
            .snapshot()
            .into_iter()
            .map(|(handler, by_status)| {
                let by_status = by_status
                    .into_iter()
                    .map(|(status, data)| {
                        let view = CounterView {
                            min: data.min,
                            max: data.max,
                            avg: data.avg(),
                            hits: data.hits,
                        };
                        (status.to_string(), view)
                    })
                    .collect();
                (handler, by_status)
            })
            .collect();
        serde_json::to_string(&view)
    }
}

impl Component for ResponseTimeStats {
    fn as_handler(&self) -> Option<&dyn RequestHandler> {
        Some(self)
    }
}

impl RequestHandler for ResponseTimeStats {
    fn handle_request(
        &self,
        request: &mut dyn Request,
        _context: &mut HandlerContext,
    ) -> anyhow::Result<()> {
        let body = self.to_json()?;
        request.set_status(200);
        request.write(body.as_bytes())?;
        Ok(())
    }
}
