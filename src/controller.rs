//! The controller seam: an owner identity, an instance-owned filter
//! registry, and async action dispatch.
//!
//! A controller is typically constructed fresh for every dispatch by its
//! [`ControllerFactory`]; its filters are registered in the constructor and
//! die with the instance. That instance scoping is what keeps concurrent
//! requests from ever seeing each other's filter state.
//!
//! ```rust
//! use async_trait::async_trait;
//! use plinth::{Context, Controller, Error, FilterOptions, FilterRegistry, Response};
//!
//! struct Users {
//!     filters: FilterRegistry,
//! }
//!
//! impl Users {
//!     fn new() -> Self {
//!         let mut filters = FilterRegistry::new("users");
//!         filters.register_before(
//!             "show",
//!             |ctx: Context| async move {
//!                 ctx.continue_to_action();
//!                 Ok(())
//!             },
//!             FilterOptions::named("allow"),
//!         );
//!         Self { filters }
//!     }
//! }
//!
//! #[async_trait]
//! impl Controller for Users {
//!     fn identity(&self) -> &str {
//!         "users"
//!     }
//!
//!     fn filters(&self) -> &FilterRegistry {
//!         &self.filters
//!     }
//!
//!     async fn invoke(&self, action: &str, ctx: Context) -> Result<(), Error> {
//!         match action {
//!             "show" => {
//!                 ctx.respond(Response::text("a user"));
//!                 Ok(())
//!             }
//!             other => Err(Error::stage(format!("unknown action `{other}`"))),
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Error;
use crate::filters::FilterRegistry;

/// An MVC-style controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The owner identity used to scope filter matching. Must be non-blank
    /// for filters to register.
    fn identity(&self) -> &str;

    /// This instance's filter registry.
    fn filters(&self) -> &FilterRegistry;

    /// Runs the named action. All effects go through `ctx` — commit the
    /// reply with [`Context::respond`].
    async fn invoke(&self, action: &str, ctx: Context) -> Result<(), Error>;
}

/// Builds one controller instance per dispatch.
pub type ControllerFactory = Arc<dyn Fn() -> Arc<dyn Controller> + Send + Sync>;
