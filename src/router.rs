//! Radix-tree request router and the dispatch stage built on it.
//!
//! One tree per HTTP method, O(path-length) lookup. A route resolves to
//! either a plain async handler or a controller target — a factory plus an
//! action name. Controller dispatch is where the filter engine engages:
//!
//! 1. construct the instance via its factory (fresh per dispatch),
//! 2. stamp the requested action on the context,
//! 3. run matching before-filters in priority order,
//! 4. await the proceed gate the filters open via
//!    [`Context::continue_to_action`],
//! 5. invoke the action,
//! 6. run matching after-filters (only when the action succeeded).
//!
//! Unrouted paths commit a bare 404.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::context::Context;
use crate::controller::{Controller, ControllerFactory};
use crate::error::Error;
use crate::executor::FilterExecutor;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::response::Response;

/// What a route resolves to.
#[derive(Clone)]
enum RouteTarget {
    Handler(BoxedHandler),
    Controller { factory: ControllerFactory, action: String },
}

/// The application router.
///
/// Build it once at startup; turn it into the pipeline's terminal stage
/// with [`Router::into_stage`]. Each registration returns `self` so routes
/// chain naturally.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<RouteTarget>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Registers a plain handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax — `ctx.param("name")` retrieves
    /// them:
    ///
    /// ```rust,no_run
    /// # use plinth::{Context, Method, Response, Router};
    /// # async fn get_user(_: Context) -> Response { Response::text("") }
    /// Router::new().on(Method::GET, "/users/{id}", get_user);
    /// ```
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.add(method, path, RouteTarget::Handler(handler.into_boxed_handler()))
    }

    /// Registers a controller action for a method + path pair. `factory`
    /// constructs one instance per dispatch.
    pub fn controller<C, F>(self, method: Method, path: &str, action: &str, factory: F) -> Self
    where
        C: Controller + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let factory: ControllerFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Controller>);
        self.add(
            method,
            path,
            RouteTarget::Controller { factory, action: action.to_owned() },
        )
    }

    fn add(mut self, method: Method, path: &str, target: RouteTarget) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, target)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(RouteTarget, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((matched.value.clone(), params))
    }

    /// Routes one request. Used as the pipeline's terminal stage.
    pub async fn dispatch(&self, ctx: Context) -> Result<(), Error> {
        let Some((target, params)) = self.lookup(ctx.method(), ctx.path()) else {
            ctx.respond(Response::status(StatusCode::NOT_FOUND));
            return Ok(());
        };
        ctx.set_params(params);

        match target {
            RouteTarget::Handler(handler) => {
                let response = handler.call(ctx.clone()).await;
                ctx.respond(response);
                Ok(())
            }
            RouteTarget::Controller { factory, action } => {
                let instance = factory();
                dispatch_action(instance, &action, ctx).await
            }
        }
    }

    /// Wraps the router as a terminal stage for
    /// [`Pipeline::register_terminal`](crate::Pipeline::register_terminal).
    pub fn into_stage(
        self,
    ) -> impl Fn(Context) -> BoxFuture<Result<(), Error>> + Send + Sync + 'static {
        let router = Arc::new(self);
        move |ctx| {
            let router = Arc::clone(&router);
            Box::pin(async move { router.dispatch(ctx).await })
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_action(
    instance: Arc<dyn Controller>,
    action: &str,
    ctx: Context,
) -> Result<(), Error> {
    ctx.set_requested_action(action);

    let ran = FilterExecutor::run_before(instance.as_ref(), &ctx).await?;
    if ran > 0 {
        // The filters hold the proceed capability. A filter set that
        // resolved without calling continue_to_action leaves the request
        // parked here until the external request-timeout collaborator
        // intervenes.
        if !ctx.continue_called() {
            debug!(
                owner = instance.identity(),
                action,
                "before-filters finished without continue, awaiting gate"
            );
        }
        ctx.await_continue().await;
    }

    instance.invoke(action, ctx.clone()).await?;

    // After-filters observe a completed action; an action error went to the
    // error chain instead and skipped them.
    FilterExecutor::run_after(instance.as_ref(), &ctx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_plain_handlers_with_params() {
        let router = Router::new().on(Method::GET, "/users/{id}", |ctx: Context| async move {
            Response::text(format!("user {}", ctx.param("id").unwrap()))
        });

        let ctx = Context::new(crate::Request::new(Method::GET, "/users/42"));
        router.dispatch(ctx.clone()).await.unwrap();
        assert_eq!(ctx.take_response().unwrap().body(), b"user 42");
    }

    #[tokio::test]
    async fn unrouted_paths_get_404() {
        let router = Router::new();
        let ctx = Context::new(crate::Request::new(Method::GET, "/missing"));
        router.dispatch(ctx.clone()).await.unwrap();
        assert_eq!(ctx.take_response().unwrap().status_code(), StatusCode::NOT_FOUND);
    }
}
