// End-to-end dispatch: pipeline → router → filters → action, driven the way
// the server drives it, asserting on what the client would see.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plinth::{
    Context, Controller, Error, FilterKind, FilterOptions, FilterRegistry, Method, Pipeline,
    Request, Response, Router,
};

type Log = Arc<Mutex<Vec<String>>>;

fn log(entries: &Log, entry: &str) {
    entries.lock().unwrap().push(entry.to_owned());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

struct ScenarioController {
    filters: FilterRegistry,
    log: Log,
}

#[async_trait]
impl Controller for ScenarioController {
    fn identity(&self) -> &str {
        "scenario"
    }

    fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    async fn invoke(&self, action: &str, ctx: Context) -> Result<(), Error> {
        log(&self.log, &format!("action:{action}"));
        ctx.respond(Response::text("done"));
        Ok(())
    }
}

async fn dispatch(router: Router, path: &str) -> Context {
    let pipeline = Pipeline::new().register_terminal(router.into_stage());
    let ctx = Context::new(Request::new(Method::GET, path));
    pipeline.execute(ctx.clone()).await;
    ctx
}

// Scenario A: before-filter A (priority 10) then B (priority 0), both on
// "show" — A runs first regardless of registration order.
#[tokio::test]
async fn before_filters_run_in_priority_order() {
    let trail: Log = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let trail = Arc::clone(&trail);
        move || {
            let mut filters = FilterRegistry::new("scenario");
            let b_trail = trail.clone();
            filters.register_before(
                "show",
                move |ctx: Context| {
                    let b_trail = b_trail.clone();
                    async move {
                        log(&b_trail, "B");
                        // the gate is already open; this is a no-op
                        ctx.continue_to_action();
                        Ok(())
                    }
                },
                FilterOptions::named("B"),
            );
            let a_trail = trail.clone();
            filters.register_before(
                "show",
                move |ctx: Context| {
                    let a_trail = a_trail.clone();
                    async move {
                        log(&a_trail, "A");
                        ctx.continue_to_action();
                        Ok(())
                    }
                },
                FilterOptions::named_priority("A", 10),
            );
            ScenarioController { filters, log: trail.clone() }
        }
    };

    let router = Router::new().controller(Method::GET, "/scenario", "show", factory);
    let ctx = dispatch(router, "/scenario").await;

    assert_eq!(entries(&trail), vec!["A", "B", "action:show"]);
    assert_eq!(ctx.take_response().unwrap().body(), b"done");
}

// Scenario B: after-filter C throws, after-filter D still runs; the error
// stays in the log sink and the committed response is untouched.
#[tokio::test]
async fn after_filter_failure_does_not_stop_the_phase() {
    let trail: Log = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let trail = Arc::clone(&trail);
        move || {
            let mut filters = FilterRegistry::new("scenario");
            filters.register_after(
                "index",
                |_ctx: Context| async move { Err(Error::stage("audit sink down")) },
                FilterOptions::named_priority("C", 1),
            );
            let d_trail = trail.clone();
            filters.register_after(
                "index",
                move |_ctx: Context| {
                    let d_trail = d_trail.clone();
                    async move {
                        log(&d_trail, "D");
                        Ok(())
                    }
                },
                FilterOptions::named("D"),
            );
            ScenarioController { filters, log: trail.clone() }
        }
    };

    let router = Router::new().controller(Method::GET, "/scenario", "index", factory);
    let ctx = dispatch(router, "/scenario").await;

    assert_eq!(entries(&trail), vec!["action:index", "D"]);
    let response = ctx.take_response().unwrap();
    assert_eq!(response.body(), b"done");
}

// A failing before-filter short-circuits: later filters and the action never
// run, and the client gets the fixed-shape JSON 500.
#[tokio::test]
async fn failing_before_filter_short_circuits_the_dispatch() {
    let trail: Log = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let trail = Arc::clone(&trail);
        move || {
            let mut filters = FilterRegistry::new("scenario");
            let first = trail.clone();
            filters.register_before(
                "show",
                move |ctx: Context| {
                    let first = first.clone();
                    async move {
                        log(&first, "first");
                        ctx.continue_to_action();
                        Ok(())
                    }
                },
                FilterOptions::named_priority("first", 3),
            );
            filters.register_before(
                "show",
                |_ctx: Context| async move { Err(Error::stage("token expired")) },
                FilterOptions::named_priority("second", 2),
            );
            let third = trail.clone();
            filters.register_before(
                "show",
                move |_ctx: Context| {
                    let third = third.clone();
                    async move {
                        log(&third, "third");
                        Ok(())
                    }
                },
                FilterOptions::named_priority("third", 1),
            );
            ScenarioController { filters, log: trail.clone() }
        }
    };

    let router = Router::new().controller(Method::GET, "/scenario", "show", factory);
    let ctx = dispatch(router, "/scenario").await;

    // filter #3 and the action were never invoked
    assert_eq!(entries(&trail), vec!["first"]);

    let response = ctx.take_response().unwrap();
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], true);
    assert_eq!(body["statusCode"], 500);
    assert_eq!(body["code"], "FILTER_ERROR");
    // internal detail never reaches the client
    assert_eq!(body["message"], "request rejected");
    assert_eq!(body["path"], "/scenario");
}

// A hung before-filter is failed by its deadline and takes the same path as
// a throwing one.
#[tokio::test]
async fn hung_before_filter_fails_after_its_deadline() {
    let trail: Log = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let trail = Arc::clone(&trail);
        move || {
            let mut filters = FilterRegistry::new("scenario");
            filters.set_timeout(Duration::from_millis(50));
            filters.register_before(
                "show",
                |_ctx: Context| std::future::pending::<Result<(), Error>>(),
                FilterOptions::named("stuck"),
            );
            ScenarioController { filters, log: trail.clone() }
        }
    };

    let router = Router::new().controller(Method::GET, "/scenario", "show", factory);
    let ctx = dispatch(router, "/scenario").await;

    assert!(entries(&trail).is_empty());
    let response = ctx.take_response().unwrap();
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["statusCode"], 500);
    assert_eq!(body["code"], "FILTER_ERROR");
}

// Filter state lives on the instance: two controllers never see each
// other's registrations.
#[tokio::test]
async fn filter_registrations_are_instance_scoped() {
    let noop = |_ctx: Context| async move { Ok(()) };

    let mut users = FilterRegistry::new("users");
    users.register_before("show", noop, FilterOptions::named("users_auth"));

    let mut posts = FilterRegistry::new("posts");
    posts.register_before("show", noop, FilterOptions::named("posts_auth"));
    posts.register_after("show", noop, FilterOptions::named("posts_audit"));

    let users_labels: Vec<_> = users.list(None).iter().map(|d| d.label().to_owned()).collect();
    let posts_labels: Vec<_> = posts.list(None).iter().map(|d| d.label().to_owned()).collect();

    assert_eq!(users_labels, vec!["users_auth"]);
    assert_eq!(posts_labels, vec!["posts_auth", "posts_audit"]);
    assert!(!users.is_registered(FilterKind::After, "show", None));
}

// A before-filter set that resolves without calling continue parks the
// dispatch — the documented stall, bounded by the caller's own timeout.
#[tokio::test]
async fn resolving_without_continue_stalls_the_dispatch() {
    let trail: Log = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let trail = Arc::clone(&trail);
        move || {
            let mut filters = FilterRegistry::new("scenario");
            filters.register_before(
                "show",
                |_ctx: Context| async move { Ok(()) }, // never calls continue
                FilterOptions::named("forgetful"),
            );
            ScenarioController { filters, log: trail.clone() }
        }
    };

    let router = Router::new().controller(Method::GET, "/scenario", "show", factory);
    let pipeline = Pipeline::new().register_terminal(router.into_stage());
    let ctx = Context::new(Request::new(Method::GET, "/scenario"));

    let outcome =
        tokio::time::timeout(Duration::from_millis(100), pipeline.execute(ctx.clone())).await;
    assert!(outcome.is_err(), "dispatch should stall until an external timeout");
    // the action never ran
    assert!(entries(&trail).is_empty());
}
