//! Wire protocol boundary.
//!
//! The daemon core never parses bytes itself. A [`Protocol`] turns an
//! accepted connection into a [`Request`], and writes the finished response
//! back once every handler has run.

use hearth_api::Request;

use crate::server::Connection;

pub trait Protocol: Send + Sync + 'static {
    /// Decode one request from a freshly accepted connection.
    ///
    /// The request takes ownership of the connection so that
    /// [`finish_request`](Self::finish_request) can answer on it.
    fn read_request(&self, connection: Connection) -> anyhow::Result<Box<dyn Request>>;

    /// Flush the response and release the connection.
    ///
    /// Called exactly once per request returned by `read_request`, whether or
    /// not its handlers succeeded.
    fn finish_request(&self, request: Box<dyn Request>) -> anyhow::Result<()>;
}
