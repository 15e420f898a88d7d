//! The request pipeline: ordered stages, conditional branches, and the
//! chained error handlers behind them.
//!
//! A pipeline is assembled once at startup and is immutable afterwards;
//! every request walks the same stage list with its own cursor. Control
//! transfer is continuation-passing: each non-terminal stage receives a
//! [`Next`] and decides whether the rest of the chain runs. `Next` is
//! consumed by value, so a stage can hand control forward **at most once**
//! — the call-once contract is enforced by ownership, not by a runtime
//! flag.
//!
//! ```rust
//! use plinth::{Context, Pipeline, Response};
//!
//! let app = Pipeline::new()
//!     .register_middleware(|ctx: Context, next| async move {
//!         ctx.set_state("request_id", "r-1");
//!         next.run(ctx).await
//!     })
//!     .branch("/api/*", |api| {
//!         api.register_middleware(|ctx, next| async move {
//!             // only runs for /api and /api/...
//!             next.run(ctx).await
//!         })
//!     })
//!     .register_terminal(|ctx: Context| async move {
//!         ctx.respond(Response::text("hello"));
//!         Ok(())
//!     });
//! ```

use std::sync::{Arc, OnceLock};

use http::StatusCode;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::response::Response;

type StageFn = Arc<dyn Fn(Context, Next) -> BoxFuture<Result<(), Error>> + Send + Sync>;
type TerminalFn = Arc<dyn Fn(Context) -> BoxFuture<Result<(), Error>> + Send + Sync>;
type ErrorHandlerFn =
    Arc<dyn Fn(Error, Context, ErrorNext) -> BoxFuture<Result<(), Error>> + Send + Sync>;

/// One unit of pipeline work.
#[derive(Clone)]
enum Stage {
    /// Non-terminal: receives the continuation and decides whether the rest
    /// of the chain runs.
    Use(StageFn),
    /// Terminal: completes the main line; never receives a continuation.
    Run(TerminalFn),
    /// Conditional: the nested stages run only when the path matches, then
    /// the outer continuation fires either way.
    Branch { pattern: PathPattern, chain: Arc<[Stage]> },
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// An ordered, conditional sequence of request-processing stages plus the
/// error chain that catches their failures.
///
/// Registration consumes `self` and chains, like route registration does.
/// The stage list freezes on first execution; there is no way to register
/// into a pipeline that is already serving traffic.
pub struct Pipeline {
    stages: Vec<Stage>,
    error_chain: Vec<ErrorHandlerFn>,
    frozen: OnceLock<Frozen>,
}

#[derive(Clone)]
struct Frozen {
    stages: Arc<[Stage]>,
    error_chain: Arc<[ErrorHandlerFn]>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            error_chain: Vec::new(),
            frozen: OnceLock::new(),
        }
    }

    /// Appends a non-terminal stage. The stage receives the [`Context`] and
    /// the [`Next`] continuation; it runs the remainder of the chain by
    /// calling `next.run(ctx).await`, or short-circuits by not doing so.
    pub fn register_middleware<F, Fut>(mut self, stage: F) -> Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.stages
            .push(Stage::Use(Arc::new(move |ctx, next| Box::pin(stage(ctx, next)))));
        self
    }

    /// Appends a terminal stage: the end of the main line for requests that
    /// reach it. A terminal stage receives no continuation.
    pub fn register_terminal<F, Fut>(mut self, stage: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.stages
            .push(Stage::Run(Arc::new(move |ctx| Box::pin(stage(ctx)))));
        self
    }

    /// Mounts a nested pipeline under `pattern`. `configure` populates the
    /// nested pipeline synchronously, at registration time.
    ///
    /// When a request's path matches, the nested stages run to completion
    /// and then the outer continuation fires; on no match the outer
    /// continuation fires immediately. Error handlers registered on the
    /// nested pipeline are hoisted into the outer error chain.
    pub fn branch(
        mut self,
        pattern: impl Into<PathPattern>,
        configure: impl FnOnce(Pipeline) -> Pipeline,
    ) -> Self {
        let nested = configure(Pipeline::new());
        self.stages.push(Stage::Branch {
            pattern: pattern.into(),
            chain: nested.stages.into(),
        });
        self.error_chain.extend(nested.error_chain);
        self
    }

    /// Appends a handler to the error chain. Handlers run in registration
    /// order; a handler claims an error by returning `Ok(())`, or delegates
    /// by calling `next.run(err, ctx).await` — or simply by returning the
    /// error, which passes it to the next handler.
    pub fn register_error_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Error, Context, ErrorNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.error_chain
            .push(Arc::new(move |err, ctx, next| Box::pin(handler(err, ctx, next))));
        self
    }

    /// Runs the stage list against `ctx`, cursor starting at 0. Running
    /// past the last stage resolves silently. Any stage failure is routed
    /// to [`Pipeline::handle_error`]; `execute` itself never fails.
    pub async fn execute(&self, ctx: Context) {
        let frozen = self.frozen();
        let first = Next { stages: frozen.stages, cursor: 0 };
        if let Err(err) = first.run(ctx.clone()).await {
            self.handle_error(err, ctx).await;
        }
    }

    /// Feeds `err` through the error chain from handler 0. Once the cursor
    /// runs past the last handler the error is logged and, only if the
    /// response slot is still empty, a generic 500 is committed.
    pub async fn handle_error(&self, err: Error, ctx: Context) {
        let frozen = self.frozen();
        debug!(error = %err, path = ctx.path(), "routing error to error chain");
        ErrorNext { handlers: frozen.error_chain, cursor: 0 }
            .run(err, ctx)
            .await;
    }

    // First execution freezes the lists; afterwards every request shares
    // the same immutable slices.
    fn frozen(&self) -> Frozen {
        self.frozen
            .get_or_init(|| Frozen {
                stages: self.stages.clone().into(),
                error_chain: self.error_chain.clone().into(),
            })
            .clone()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ── Next ─────────────────────────────────────────────────────────────────────

/// The continuation a non-terminal stage uses to run the remainder of the
/// chain. Consumed by value: forward-only, callable at most once.
pub struct Next {
    stages: Arc<[Stage]>,
    cursor: usize,
}

impl Next {
    /// Runs the stage at the cursor, handing it a continuation for the
    /// stage after it. Past the end of the list this resolves silently.
    pub fn run(self, ctx: Context) -> BoxFuture<Result<(), Error>> {
        Box::pin(async move {
            let Next { stages, cursor } = self;
            let Some(stage) = stages.get(cursor) else {
                return Ok(());
            };
            let next = Next { stages: Arc::clone(&stages), cursor: cursor + 1 };
            match stage {
                Stage::Use(f) => f(ctx, next).await,
                // Terminal: the continuation is dropped, never invoked.
                Stage::Run(f) => f(ctx).await,
                Stage::Branch { pattern, chain } => {
                    if pattern.matches(ctx.path()) {
                        Next { stages: Arc::clone(chain), cursor: 0 }
                            .run(ctx.clone())
                            .await?;
                    }
                    next.run(ctx).await
                }
            }
        })
    }
}

// ── ErrorNext ────────────────────────────────────────────────────────────────

/// Cursor over the error chain. A failing handler does not lose the error:
/// whatever it returns is handed to the handler after it.
pub struct ErrorNext {
    handlers: Arc<[ErrorHandlerFn]>,
    cursor: usize,
}

impl ErrorNext {
    pub fn run(self, err: Error, ctx: Context) -> BoxFuture<()> {
        Box::pin(async move {
            let ErrorNext { handlers, cursor } = self;
            let Some(handler) = handlers.get(cursor) else {
                // End of the chain: nothing claimed the error.
                error!(error = %err, path = ctx.path(), "unhandled pipeline error");
                if !ctx.is_committed() {
                    ctx.respond(Response::error_json(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        err.code(),
                        "internal server error",
                        ctx.path(),
                        ctx.method(),
                    ));
                }
                return;
            };
            let next = ErrorNext { handlers: Arc::clone(&handlers), cursor: cursor + 1 };
            if let Err(follow) = handler(err, ctx.clone(), next).await {
                warn!(error = %follow, "error handler failed, passing to next handler");
                ErrorNext { handlers, cursor: cursor + 1 }.run(follow, ctx).await;
            }
        })
    }
}

// ── PathPattern ──────────────────────────────────────────────────────────────

/// Branch matching rule.
///
/// Built from a string (`"/api"` and `"/api/*"` both match `/api` and
/// everything under it) or from an arbitrary predicate tested directly
/// against the normalized path.
#[derive(Clone)]
pub enum PathPattern {
    /// Matches the pattern itself or anything under `pattern/`.
    Prefix(String),
    /// Tested directly against the path.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl PathPattern {
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => {
                let path = normalize(path);
                if prefix == "/" {
                    return true;
                }
                path == *prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Predicate(test) => test(&normalize(path)),
        }
    }
}

impl From<&str> for PathPattern {
    fn from(pattern: &str) -> Self {
        let base = pattern.strip_suffix("/*").unwrap_or(pattern);
        Self::Prefix(normalize(base))
    }
}

impl From<String> for PathPattern {
    fn from(pattern: String) -> Self {
        Self::from(pattern.as_str())
    }
}

/// Strips at most one leading slash, then re-adds exactly one.
fn normalize(path: &str) -> String {
    format!("/{}", path.strip_prefix('/').unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use http::Method;

    use crate::request::Request;

    fn context(path: &str) -> Context {
        Context::new(Request::new(Method::GET, path))
    }

    fn log_stage(
        log: &Arc<Mutex<Vec<usize>>>,
        index: usize,
    ) -> impl Fn(Context, Next) -> BoxFuture<Result<(), Error>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |ctx, next| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(index);
                next.run(ctx).await
            })
        }
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .register_middleware(log_stage(&log, 0))
            .register_middleware(log_stage(&log, 1))
            .register_middleware(log_stage(&log, 2));

        pipeline.execute(context("/")).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn terminal_stage_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reached = Arc::clone(&log);
        let pipeline = Pipeline::new()
            .register_terminal(move |_ctx| {
                let reached = Arc::clone(&reached);
                async move {
                    reached.lock().unwrap().push(0);
                    Ok(())
                }
            })
            .register_middleware(log_stage(&log, 1));

        pipeline.execute(context("/")).await;
        assert_eq!(*log.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn branch_runs_only_on_matching_paths() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&log);
        let pipeline = Pipeline::new()
            .branch("/api/*", move |api| {
                api.register_middleware(log_stage(&inner, 10))
            })
            .register_middleware(log_stage(&log, 1));

        pipeline.execute(context("/api/users")).await;
        assert_eq!(*log.lock().unwrap(), vec![10, 1]);

        log.lock().unwrap().clear();
        pipeline.execute(context("/admin")).await;
        // nested stages never ran; the outer continuation still fired once
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn stage_error_falls_through_to_generic_500() {
        let pipeline = Pipeline::new().register_middleware(|_ctx, _next: Next| async move {
            Err(Error::stage("database unreachable"))
        });

        let ctx = context("/users");
        pipeline.execute(ctx.clone()).await;

        let response = ctx.take_response().expect("generic 500 committed");
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["code"], "INTERNAL_ERROR");
        // internal detail stays server-side
        assert_eq!(body["message"], "internal server error");
    }

    #[tokio::test]
    async fn error_handler_claims_error() {
        let pipeline = Pipeline::new()
            .register_middleware(|_ctx, _next: Next| async move { Err(Error::stage("boom")) })
            .register_error_handler(|_err, ctx: Context, _next| async move {
                ctx.respond(Response::status(StatusCode::SERVICE_UNAVAILABLE));
                Ok(())
            });

        let ctx = context("/");
        pipeline.execute(ctx.clone()).await;
        let response = ctx.take_response().unwrap();
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn failing_error_handler_passes_to_next() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let pipeline = Pipeline::new()
            .register_middleware(|_ctx, _next: Next| async move { Err(Error::stage("boom")) })
            .register_error_handler(move |_err, _ctx, _next| {
                let first = Arc::clone(&first);
                async move {
                    first.lock().unwrap().push("first");
                    Err(Error::stage("handler exploded"))
                }
            })
            .register_error_handler(move |err, ctx: Context, _next| {
                let second = Arc::clone(&second);
                async move {
                    second.lock().unwrap().push("second");
                    // the error we get is the one the first handler produced
                    assert!(err.to_string().contains("handler exploded"));
                    ctx.respond(Response::status(StatusCode::BAD_GATEWAY));
                    Ok(())
                }
            });

        let ctx = context("/");
        pipeline.execute(ctx.clone()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(ctx.take_response().unwrap().status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unhandled_error_never_overwrites_committed_response() {
        let pipeline = Pipeline::new().register_middleware(|ctx: Context, _next: Next| async move {
            ctx.respond(Response::text("already sent"));
            Err(Error::stage("late failure"))
        });

        let ctx = context("/");
        pipeline.execute(ctx.clone()).await;
        let response = ctx.take_response().unwrap();
        assert_eq!(response.body(), b"already sent");
    }

    #[test]
    fn path_pattern_matching() {
        let api: PathPattern = "/api/*".into();
        assert!(api.matches("/api"));
        assert!(api.matches("/api/users"));
        assert!(api.matches("api/users")); // normalized
        assert!(!api.matches("/apix"));
        assert!(!api.matches("/admin"));

        let exact: PathPattern = "/admin".into();
        assert!(exact.matches("/admin"));
        assert!(exact.matches("/admin/panel"));
        assert!(!exact.matches("/administrator"));

        let root: PathPattern = "/*".into();
        assert!(root.matches("/"));
        assert!(root.matches("/anything/at/all"));

        let predicate = PathPattern::predicate(|path| path.ends_with(".json"));
        assert!(predicate.matches("/data/export.json"));
        assert!(!predicate.matches("/data/export.csv"));
    }
}
