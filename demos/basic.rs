//! Minimal plinth example — a controller with filters behind a pipeline.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl http://localhost:3000/admin/stats
//!   curl http://localhost:3000/healthz

use async_trait::async_trait;
use plinth::{
    Context, Controller, Error, FilterOptions, FilterRegistry, Method, Pipeline, Response, Router,
    Server, StatusCode, health,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let routes = Router::new()
        .controller(Method::GET, "/users/{id}", "show", UsersController::new)
        .on(Method::GET, "/admin/stats", admin_stats)
        .on(Method::GET, "/healthz", health::liveness)
        .on(Method::GET, "/readyz", health::readiness);

    let app = Pipeline::new()
        .register_middleware(|ctx: Context, next| async move {
            ctx.set_state("request_id", format!("r-{}", fastrand_ish()));
            next.run(ctx).await
        })
        .branch("/admin/*", |admin| {
            admin.register_middleware(|ctx: Context, next| async move {
                // admin requests must present the operator header
                if ctx.request().header("x-operator").is_none() {
                    ctx.respond(Response::status(StatusCode::FORBIDDEN));
                    return Ok(());
                }
                next.run(ctx).await
            })
        })
        .register_terminal(routes.into_stage())
        .register_error_handler(|err, ctx: Context, next| async move {
            tracing::error!(error = %err, path = ctx.path(), "request failed");
            next.run(err, ctx).await;
            Ok(())
        });

    Server::bind("0.0.0.0:3000")
        .serve(app)
        .await
        .expect("server error");
}

// GET /users/{id} — dispatched through the filter engine.
struct UsersController {
    filters: FilterRegistry,
}

impl UsersController {
    fn new() -> Self {
        let mut filters = FilterRegistry::new("users");

        // priority 10: runs first, decides whether the action may proceed
        filters.register_before(
            "show",
            |ctx: Context| async move {
                if ctx.param("id").as_deref() == Some("0") {
                    return Err(Error::stage("id 0 is reserved"));
                }
                ctx.continue_to_action();
                Ok(())
            },
            FilterOptions::named_priority("validate_id", 10),
        );

        filters.register_after(
            "show",
            |ctx: Context| async move {
                tracing::info!(request_id = ?ctx.state("request_id"), "user served");
                Ok(())
            },
            FilterOptions::named("audit"),
        );

        Self { filters }
    }
}

#[async_trait]
impl Controller for UsersController {
    fn identity(&self) -> &str {
        "users"
    }

    fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    async fn invoke(&self, action: &str, ctx: Context) -> Result<(), Error> {
        match action {
            "show" => {
                let id = ctx.param("id").unwrap_or_default();
                ctx.respond(Response::json(
                    format!(r#"{{"id":"{id}","name":"alice"}}"#).into_bytes(),
                ));
                Ok(())
            }
            other => Err(Error::stage(format!("unknown action `{other}`"))),
        }
    }
}

// GET /admin/stats — a plain handler behind the /admin branch.
async fn admin_stats(_ctx: Context) -> Response {
    Response::json(br#"{"requests":12345}"#.to_vec())
}

// Good enough for a demo request id; use a real id generator in production.
fn fastrand_ish() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
