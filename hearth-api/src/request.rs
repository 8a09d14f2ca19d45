//! Request boundary seen by handlers.
//!
//! The concrete request type belongs to the wire protocol in use; handlers
//! only see this trait. The protocol gets its own type back with
//! `downcast::<T>()` when it finishes the request.

use std::collections::HashMap;
use std::io;

use downcast_rs::{impl_downcast, Downcast};

/// A decoded request together with its pending response.
pub trait Request: Downcast + Send {
    /// Request target, used for handler routing.
    fn url(&self) -> &str;

    /// A request header or parameter, if the protocol carries one.
    fn header(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Response status, 200 until changed.
    fn status(&self) -> u16;

    fn set_status(&mut self, status: u16);

    /// Append bytes to the response body.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}
impl_downcast!(Request);

/// Per-request scratch space shared by the handlers of one request.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    request_id: String,
    params: HashMap<String, String>,
}

impl HandlerContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            params: HashMap::new(),
        }
    }

    /// Identifier assigned to the request when its connection was accepted.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Store a value for handlers running later on the same request.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn remove_param(&mut self, name: &str) -> Option<String> {
        self.params.remove(name)
    }
}
