//! Event bus fan-out behind the command pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatchcore::testing::{CallLog, RecordingMiddleware};
use dispatchcore::{BoxError, BusError, Context, ErrorPolicy, EventBusConfig, TracingMiddleware};
use dispatchcore_integration_tests::{AccountOpened, Bank, OpenAccount};
use proptest::prelude::*;

fn open(owner: &str) -> OpenAccount {
    OpenAccount {
        owner: owner.to_string(),
        opening_balance: 0,
    }
}

#[tokio::test]
async fn every_projection_sees_the_event() {
    let bank = Bank::new().expect("bank wired");
    let log = CallLog::new();
    for name in ["ledger", "mailer", "audit"] {
        let sink = log.clone();
        bank.events
            .register(move |_ctx, event: Arc<AccountOpened>| {
                sink.record(format!("{name}:{}", event.owner));
                async { Ok::<_, BoxError>(()) }
            })
            .expect("projection registered");
    }

    bank.commands
        .execute(&Context::background(), open("ada"))
        .await
        .expect("account opened");

    let mut entries = log.entries();
    entries.sort();
    assert_eq!(entries, vec!["audit:ada", "ledger:ada", "mailer:ada"]);
}

#[tokio::test]
async fn collect_all_reports_every_failing_projection() {
    let config = EventBusConfig::default().with_error_policy(ErrorPolicy::CollectAll);
    let bank = Bank::with_config(config).expect("bank wired");
    let healthy = Arc::new(AtomicUsize::new(0));
    for reason in ["search index down", "mailer down"] {
        bank.events
            .register(move |_ctx, _event: Arc<AccountOpened>| async move { Err::<(), _>(reason) })
            .expect("registered");
    }
    let counter = Arc::clone(&healthy);
    bank.events
        .register(move |_ctx, _event: Arc<AccountOpened>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>(()) }
        })
        .expect("registered");

    let error = bank
        .commands
        .execute(&Context::background(), open("ada"))
        .await
        .expect_err("projections fail");

    let BusError::Aggregate(failures) = &error else {
        panic!("expected aggregate, got {error}");
    };
    let mut reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
    reasons.sort();
    assert_eq!(
        reasons,
        vec!["handler failed: mailer down", "handler failed: search index down"]
    );
    assert_eq!(healthy.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrency_limit_loaded_from_json_serializes_projections() {
    let config: EventBusConfig =
        serde_json::from_str(r#"{ "max_concurrent_handlers": 1 }"#).expect("valid config");
    let bank = Bank::with_config(config).expect("bank wired");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        bank.events
            .register(move |_ctx, _event: Arc<AccountOpened>| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
            .expect("registered");
    }

    bank.commands
        .execute(&Context::background(), open("ada"))
        .await
        .expect("account opened");

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn out_of_range_limit_is_rejected_when_loading() {
    let result = serde_json::from_str::<EventBusConfig>(r#"{ "max_concurrent_handlers": 0 }"#);

    assert!(result.is_err());
}

#[tokio::test]
async fn event_middleware_wraps_each_handler() {
    let bank = Bank::new().expect("bank wired");
    let log = CallLog::new();
    bank.events.use_middleware(TracingMiddleware::new());
    bank.events
        .use_middleware(RecordingMiddleware::new("events", log.clone()));
    let sink = log.clone();
    bank.events
        .register(move |_ctx, _event: Arc<AccountOpened>| {
            sink.record("projection");
            async { Ok::<_, BoxError>(()) }
        })
        .expect("registered");

    bank.commands
        .execute(&Context::background(), open("ada"))
        .await
        .expect("account opened");

    assert_eq!(log.entries(), vec!["events-pre", "projection", "events-post"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_number_of_projections_each_run_once(projections in 0usize..12) {
        let bank = Bank::new().expect("bank wired");
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..projections {
            let calls = Arc::clone(&calls);
            bank.events
                .register(move |_ctx, _event: Arc<AccountOpened>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, BoxError>(()) }
                })
                .expect("registered");
        }

        tokio_test::block_on(bank.commands.execute(&Context::background(), open("ada")))
            .expect("account opened");

        prop_assert_eq!(calls.load(Ordering::SeqCst), projections);
    }
}
