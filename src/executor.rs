//! Runs the filters that match a dispatch, in priority order, under a
//! deadline.
//!
//! Failure containment differs by phase. A failing **before**-filter is
//! fatal to the request: the client gets the fixed-shape JSON 500, and
//! neither the remaining before-filters nor the action run. A failing
//! **after**-filter is logged and swallowed — the response is typically
//! already committed by then, so the remaining after-filters still get
//! their turn.

use std::time::Instant;

use http::StatusCode;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::context::Context;
use crate::controller::Controller;
use crate::error::Error;
use crate::filters::{FilterDescriptor, FilterKind};
use crate::response::Response;

/// Matches and runs a controller's filters for one dispatch.
pub struct FilterExecutor;

impl FilterExecutor {
    /// Runs every matching before-filter. On the first failure the JSON 500
    /// is committed (unless a response already was) and the error returns to
    /// the caller, which must not invoke the action.
    pub async fn run_before(controller: &dyn Controller, ctx: &Context) -> Result<usize, Error> {
        Self::run_phase(FilterKind::Before, controller, ctx).await
    }

    /// Runs every matching after-filter. Failures are logged and swallowed;
    /// the committed response is never touched.
    pub async fn run_after(controller: &dyn Controller, ctx: &Context) -> usize {
        match Self::run_phase(FilterKind::After, controller, ctx).await {
            Ok(count) => count,
            // run_phase only returns Err for the Before kind
            Err(_) => unreachable!("after-filter failures are contained"),
        }
    }

    async fn run_phase(
        kind: FilterKind,
        controller: &dyn Controller,
        ctx: &Context,
    ) -> Result<usize, Error> {
        let registry = controller.filters();
        let owner = controller.identity();
        let action = ctx.requested_action().unwrap_or_default();
        let matches = registry.matching(kind, owner, &action);
        if matches.is_empty() {
            return Ok(0);
        }

        let threshold = registry.timeout();
        let mut executed = 0;
        for descriptor in matches {
            let started = Instant::now();
            let outcome = timeout(threshold, (descriptor.callback)(ctx.clone())).await;
            let elapsed = started.elapsed();
            executed += 1;

            let failure = match outcome {
                Ok(Ok(())) => {
                    debug!(
                        owner,
                        action = %action,
                        %kind,
                        filter = descriptor.label(),
                        ?elapsed,
                        "filter completed"
                    );
                    continue;
                }
                Ok(Err(cause)) => Error::Filter {
                    kind,
                    owner: owner.to_owned(),
                    action: action.clone(),
                    label: descriptor.label().to_owned(),
                    message: cause.to_string(),
                },
                // The callback may still resolve later; it has no further
                // effect on control flow, and its side effects are not
                // reverted.
                Err(_) => Error::FilterTimeout {
                    kind,
                    owner: owner.to_owned(),
                    action: action.clone(),
                    label: descriptor.label().to_owned(),
                    elapsed,
                    threshold,
                },
            };

            error!(
                owner,
                action = %action,
                %kind,
                filter = descriptor.label(),
                ?elapsed,
                error = %failure,
                "filter failed"
            );

            if kind == FilterKind::Before {
                Self::reject(ctx, descriptor);
                return Err(failure);
            }
            // After-filters: contained; keep going.
        }
        Ok(executed)
    }

    /// Commits the client-facing 500 for a failed before-filter. The real
    /// failure stays in the server log; the payload carries no internal
    /// detail.
    fn reject(ctx: &Context, descriptor: &FilterDescriptor) {
        if ctx.is_committed() {
            debug!(
                filter = descriptor.label(),
                "response already committed, skipping filter error payload"
            );
            return;
        }
        ctx.respond(Response::error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            crate::error::ErrorCode::FilterError,
            "request rejected",
            ctx.path(),
            ctx.method(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use http::Method;

    use crate::filters::{FilterOptions, FilterRegistry};
    use crate::request::Request;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Probe {
        filters: FilterRegistry,
    }

    #[async_trait]
    impl Controller for Probe {
        fn identity(&self) -> &str {
            "probe"
        }

        fn filters(&self) -> &FilterRegistry {
            &self.filters
        }

        async fn invoke(&self, _action: &str, _ctx: Context) -> Result<(), Error> {
            Ok(())
        }
    }

    fn context(action: &str) -> Context {
        let ctx = Context::new(Request::new(Method::GET, "/probe"));
        ctx.set_requested_action(action);
        ctx
    }

    fn log_filter(
        log: &Log,
        entry: &'static str,
    ) -> impl Fn(Context) -> std::future::Ready<Result<(), Error>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_ctx| {
            log.lock().unwrap().push(entry);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn before_filters_run_by_descending_priority() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterRegistry::new("probe");
        filters.register_before("show", log_filter(&log, "B"), FilterOptions::named("B"));
        filters.register_before(
            "show",
            log_filter(&log, "A"),
            FilterOptions::named_priority("A", 10),
        );
        let probe = Probe { filters };

        let ran = FilterExecutor::run_before(&probe, &context("show")).await.unwrap();
        assert_eq!(ran, 2);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn failing_before_filter_short_circuits() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterRegistry::new("probe");
        filters.register_before("show", log_filter(&log, "first"), FilterOptions::named_priority("first", 2));
        filters.register_before(
            "show",
            |_ctx| std::future::ready(Err(Error::stage("denied"))),
            FilterOptions::named_priority("second", 1),
        );
        filters.register_before("show", log_filter(&log, "third"), FilterOptions::named("third"));
        let probe = Probe { filters };

        let ctx = context("show");
        let err = FilterExecutor::run_before(&probe, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Filter { .. }));
        // filter #3 never ran
        assert_eq!(*log.lock().unwrap(), vec!["first"]);

        let response = ctx.take_response().expect("filter 500 committed");
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["statusCode"], 500);
        assert_eq!(body["code"], "FILTER_ERROR");
    }

    #[tokio::test]
    async fn after_filter_failures_are_contained() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterRegistry::new("probe");
        filters.register_after(
            "index",
            |_ctx| std::future::ready(Err(Error::stage("audit sink down"))),
            FilterOptions::named_priority("C", 1),
        );
        filters.register_after("index", log_filter(&log, "D"), FilterOptions::named("D"));
        let probe = Probe { filters };

        let ran = FilterExecutor::run_after(&probe, &context("index")).await;
        assert_eq!(ran, 2);
        // the failing filter did not stop the rest of the phase
        assert_eq!(*log.lock().unwrap(), vec!["D"]);
    }

    #[tokio::test]
    async fn hung_filter_times_out() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterRegistry::new("probe");
        filters.set_timeout(Duration::from_millis(50));
        filters.register_before(
            "show",
            |_ctx| std::future::pending::<Result<(), Error>>(),
            FilterOptions::named_priority("stuck", 1),
        );
        filters.register_before("show", log_filter(&log, "never"), FilterOptions::default());
        let probe = Probe { filters };

        let ctx = context("show");
        let err = FilterExecutor::run_before(&probe, &ctx).await.unwrap_err();
        match err {
            Error::FilterTimeout { threshold, .. } => {
                assert_eq!(threshold, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert!(log.lock().unwrap().is_empty());
        assert!(ctx.is_committed());
    }

    #[tokio::test]
    async fn no_matches_is_a_noop() {
        let probe = Probe { filters: FilterRegistry::new("probe") };
        let ctx = context("show");
        assert_eq!(FilterExecutor::run_before(&probe, &ctx).await.unwrap(), 0);
        assert!(!ctx.is_committed());
    }
}
