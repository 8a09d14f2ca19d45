//! # Hearth Component API
//!
//! Interfaces shared between the hearth daemon core and the components it
//! hosts. A component is a named, configured unit of behavior created by a
//! factory at startup; it may expose any mix of capabilities.
//!
//! ## Core Pieces
//!
//! - [`Component`]: lifecycle hooks plus capability lookup
//! - [`Logger`]: the logging capability
//! - [`RequestHandler`]: the request handling capability
//! - [`Request`] / [`HandlerContext`]: what a handler works on
//! - [`Config`]: path-addressed configuration lookup
//!
//! ## Usage Example
//!
//! ```rust
//! use hearth_api::{Component, HandlerContext, Request, RequestHandler};
//!
//! struct Hello;
//!
//! impl Component for Hello {
//!     fn as_handler(&self) -> Option<&dyn RequestHandler> {
//!         Some(self)
//!     }
//! }
//!
//! impl RequestHandler for Hello {
//!     fn handle_request(
//!         &self,
//!         request: &mut dyn Request,
//!         _context: &mut HandlerContext,
//!     ) -> anyhow::Result<()> {
//!         request.set_status(200);
//!         request.write(b"hello")?;
//!         Ok(())
//!     }
//! }
//! ```

pub mod component;
pub mod config;
pub mod errors;
pub mod request;

pub use component::{Component, LogLevel, Logger, RequestHandler};
pub use config::{Config, MemoryConfig};
pub use errors::ConfigError;
pub use request::{HandlerContext, Request};
