//! # plinth
//!
//! A minimal MVC-flavored HTTP framework. The part plinth cares about —
//! the only part that is genuinely hard to get right — is request
//! **control flow**: an asynchronous middleware pipeline with conditional
//! branches and chained error recovery, plus per-controller action filters
//! with priorities, timeouts, and instance-scoped state.
//!
//! ## The contract
//!
//! - **Stages run in registration order**, each handed a continuation it
//!   can invoke at most once. A terminal stage ends the main line.
//! - **Filters run in descending priority**, ties by registration order,
//!   each raced against a deadline. A failing before-filter stops the
//!   dispatch cold; a failing after-filter is logged and contained.
//! - **Filter state is owned by the controller instance.** Concurrent
//!   requests cannot interleave or overwrite each other's registrations —
//!   there is no global filter table to corrupt.
//! - **Errors are never dropped.** Every failure is logged and walks the
//!   error chain; the client sees a fixed-shape JSON 500 with no internal
//!   detail, and never a second write to a committed response.
//!
//! What plinth leaves to its collaborators: TLS termination, static files,
//! sessions, CSRF storage, templating, body parsing. The proxy does proxy
//! things; the framework does framework things.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use plinth::{Context, Method, Pipeline, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let routes = Router::new()
//!         .on(Method::GET, "/users/{id}", get_user);
//!
//!     let app = Pipeline::new()
//!         .register_middleware(|ctx: Context, next| async move {
//!             // cross-cutting concerns live here
//!             next.run(ctx).await
//!         })
//!         .register_terminal(routes.into_stage());
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(ctx: Context) -> Response {
//!     let id = ctx.param("id").unwrap_or_default();
//!     Response::json(format!(r#"{{"id":"{id}"}}"#).into_bytes())
//! }
//! ```

mod context;
mod controller;
mod error;
mod executor;
mod filters;
mod handler;
mod pipeline;
mod request;
mod response;
mod router;
mod server;

pub mod health;

pub use context::Context;
pub use controller::{Controller, ControllerFactory};
pub use error::{Error, ErrorCode};
pub use executor::FilterExecutor;
pub use filters::{
    ActionNames, DEFAULT_FILTER_TIMEOUT, FilterDescriptor, FilterKind, FilterOptions,
    FilterRegistry,
};
pub use handler::Handler;
pub use http::{Method, StatusCode};
pub use pipeline::{ErrorNext, Next, PathPattern, Pipeline};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
