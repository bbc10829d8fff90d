use std::time::{Duration, Instant};

use serde_json::json;
use tccard_core::{ContactMessage, DataSource, ProfileIdentifier};
use tccard_resolver::contact::{ContactError, ContactFormClient};
use tccard_resolver::{ProfileResolver, ResolveError};
use tccard_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config(max_retries: usize, timeout: Duration) -> HttpClientConfig {
    HttpClientConfig {
        timeout,
        user_agent: None,
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
    }
}

fn source(server: &MockServer, name: &str, priority: i32) -> DataSource {
    DataSource::new(format!("{}/{name}/exec", server.uri()), priority).with_name(name)
}

async fn mount_json(server: &MockServer, name: &str, body: serde_json::Value, expect: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}/exec")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expect)
        .mount(server)
        .await;
}

// ── fallback ────────────────────────────────────────────────────

#[tokio::test]
async fn falls_back_past_error_envelopes_with_one_request_each() {
    let server = MockServer::start().await;
    mount_json(&server, "s1", json!({"status": "error", "message": "Profile not found"}), 1).await;
    mount_json(&server, "s2", json!({"status": "error"}), 1).await;
    Mock::given(method("GET"))
        .and(path("/s3/exec"))
        .and(query_param("link", "jane doe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"Name": "Jane Doe", "Link": "jane", "Status": "Active"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Priorities are deliberately out of order in the list.
    let resolver = ProfileResolver::new(
        vec![
            source(&server, "s3", 3),
            source(&server, "s1", 1),
            source(&server, "s2", 2),
        ],
        fast_config(3, Duration::from_secs(2)),
    )
    .expect("resolver");

    let (result, report) = resolver
        .resolve_with_report(&ProfileIdentifier::link("jane doe"))
        .await;
    let record = result.expect("resolved");
    assert_eq!(record.name, "Jane Doe");

    let order: Vec<_> = report.sources.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(order, vec!["s1", "s2", "s3"]);
    assert_eq!(report.sources[0].failure_code, Some("source_rejected"));
    assert_eq!(report.sources[2].failure_code, None);
    assert_eq!(report.total_requests(), 3);
}

#[tokio::test]
async fn first_valid_source_short_circuits() {
    let server = MockServer::start().await;
    mount_json(&server, "s1", json!({"Name": "Primary"}), 1).await;
    mount_json(&server, "s2", json!({"Name": "Secondary"}), 0).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "s1", 1), source(&server, "s2", 2)],
        fast_config(3, Duration::from_secs(2)),
    )
    .expect("resolver");

    let record = resolver
        .resolve(&ProfileIdentifier::id("7"))
        .await
        .expect("resolved");
    assert_eq!(record.name, "Primary");
}

// ── transient failures ──────────────────────────────────────────

#[tokio::test]
async fn transient_errors_retry_same_source_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/s1/exec"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_json(&server, "s1", json!({"Name": "Eventually"}), 1).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "s1", 1)],
        fast_config(3, Duration::from_secs(2)),
    )
    .expect("resolver");

    let (result, report) = resolver
        .resolve_with_report(&ProfileIdentifier::link("x"))
        .await;
    assert_eq!(result.expect("resolved").name, "Eventually");
    assert_eq!(report.sources[0].requests, 3);
}

#[tokio::test]
async fn unresponsive_source_is_abandoned_within_bounded_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow/exec"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .expect(3)
        .mount(&server)
        .await;
    mount_json(&server, "fast", json!({"Name": "Backup"}), 1).await;

    let timeout = Duration::from_millis(150);
    let resolver = ProfileResolver::new(
        vec![source(&server, "slow", 1), source(&server, "fast", 2)],
        fast_config(2, timeout),
    )
    .expect("resolver");

    let started = Instant::now();
    let (result, report) = resolver
        .resolve_with_report(&ProfileIdentifier::link("x"))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.expect("resolved").name, "Backup");
    assert_eq!(report.sources[0].failure_code, Some("unreachable"));
    assert_eq!(report.sources[0].requests, 3);
    // three timed-out attempts plus 10ms + 20ms of backoff, with slack
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
}

// ── validation ──────────────────────────────────────────────────

#[tokio::test]
async fn validation_rejections_are_not_retried() {
    let server = MockServer::start().await;
    mount_json(&server, "blank", json!({"name": ""}), 1).await;
    mount_json(&server, "inactive", json!({"Name": "Jo", "Status": "Inactive"}), 1).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "blank", 1), source(&server, "inactive", 2)],
        fast_config(3, Duration::from_secs(2)),
    )
    .expect("resolver");

    let (result, report) = resolver
        .resolve_with_report(&ProfileIdentifier::link("jo"))
        .await;
    assert_eq!(report.sources[0].requests, 1);
    assert_eq!(report.sources[0].failure_code, Some("missing_name"));
    assert_eq!(report.sources[1].requests, 1);

    let err = result.expect_err("no valid profile");
    assert_eq!(err.reason_code(), "not_found");
    assert_eq!(err.last_failure_code(), Some("inactive"));
    assert_eq!(err.user_message(), "This profile is currently inactive");
}

#[tokio::test]
async fn all_error_envelopes_end_in_not_found() {
    let server = MockServer::start().await;
    for name in ["s1", "s2", "s3"] {
        mount_json(&server, name, json!({"status": "error"}), 1).await;
    }

    let resolver = ProfileResolver::new(
        vec![
            source(&server, "s1", 1),
            source(&server, "s2", 2),
            source(&server, "s3", 3),
        ],
        fast_config(3, Duration::from_secs(2)),
    )
    .expect("resolver");

    let err = resolver
        .resolve_token("#id_99")
        .await
        .expect_err("nothing found");
    assert!(matches!(err, ResolveError::NotFound { .. }));
    assert_eq!(err.last_failure_code(), Some("source_rejected"));
}

#[tokio::test]
async fn empty_routing_token_fails_before_any_request() {
    let server = MockServer::start().await;
    mount_json(&server, "s1", json!({"Name": "Never"}), 0).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "s1", 1)],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");

    let err = resolver.resolve_token("#").await.expect_err("empty");
    assert_eq!(err.reason_code(), "missing_identifier");
}

// ── parallel + cancellation ─────────────────────────────────────

#[tokio::test]
async fn parallel_variant_takes_first_validated_answer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow/exec"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"Name": "Slow"}))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rejects/exec"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "error"})))
        .mount(&server)
        .await;
    mount_json(&server, "quick", json!({"Name": "Quick"}), 1).await;

    let resolver = ProfileResolver::new(
        vec![
            source(&server, "slow", 1),
            source(&server, "rejects", 2),
            source(&server, "quick", 3),
        ],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");

    let record = resolver
        .resolve_parallel(&ProfileIdentifier::link("x"))
        .await
        .expect("resolved");
    assert_eq!(record.name, "Quick");
}

#[tokio::test]
async fn parallel_exhaustion_reports_highest_priority_failure() {
    let server = MockServer::start().await;
    mount_json(&server, "blank", json!({"Name": ""}), 1).await;
    mount_json(&server, "rejects", json!({"status": "error"}), 1).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "rejects", 2), source(&server, "blank", 1)],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");

    let err = resolver
        .resolve_parallel(&ProfileIdentifier::link("x"))
        .await
        .expect_err("nothing valid");
    assert_eq!(err.last_failure_code(), Some("missing_name"));
}

#[tokio::test]
async fn inactive_profile_outranks_a_later_unreachable_source() {
    let server = MockServer::start().await;
    mount_json(&server, "primary", json!({"Name": "Jo", "Status": "Inactive"}), 1).await;
    Mock::given(method("GET"))
        .and(path("/backup/exec"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "primary", 1), source(&server, "backup", 2)],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");

    let (result, report) = resolver
        .resolve_with_report(&ProfileIdentifier::link("jo"))
        .await;
    let err = result.expect_err("inactive everywhere it answered");
    assert_eq!(report.sources[1].failure_code, Some("unreachable"));
    assert_eq!(err.last_failure_code(), Some("inactive"));
    assert_eq!(err.user_message(), "This profile is currently inactive");
}

#[tokio::test]
async fn unreachable_is_reported_only_when_nothing_else_answered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down/exec"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_json(&server, "rejects", json!({"status": "error"}), 1).await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "down", 1), source(&server, "rejects", 2)],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");
    let err = resolver
        .resolve_parallel(&ProfileIdentifier::link("x"))
        .await
        .expect_err("nothing valid");
    assert_eq!(err.last_failure_code(), Some("source_rejected"));
    assert_eq!(err.user_message(), "Profile not found");

    let only_down = ProfileResolver::new(
        vec![source(&server, "down", 1)],
        fast_config(0, Duration::from_secs(2)),
    )
    .expect("resolver");
    let err = only_down
        .resolve(&ProfileIdentifier::link("x"))
        .await
        .expect_err("unreachable");
    assert_eq!(err.last_failure_code(), Some("unreachable"));
}

#[tokio::test]
async fn lookup_can_be_cancelled_mid_flight() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow/exec"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let resolver = ProfileResolver::new(
        vec![source(&server, "slow", 1)],
        fast_config(3, Duration::from_secs(10)),
    )
    .expect("resolver");

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(());
    });

    let started = Instant::now();
    let err = resolver
        .resolve_until(&ProfileIdentifier::link("x"), async {
            let _ = rx.await;
        })
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ResolveError::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

// ── contact form ────────────────────────────────────────────────

fn contact_message() -> ContactMessage {
    ContactMessage {
        name: "Sam Visitor".into(),
        email: "sam@example.org".into(),
        phone: None,
        message: "I'd like to book a meeting next week.".into(),
    }
}

#[tokio::test]
async fn contact_form_submits_expected_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/form"))
        .and(query_param("action", "sendContactEmail"))
        .and(query_param("recipient", "jane@example.com"))
        .and(query_param("subject", "New message from Sam Visitor"))
        .and(query_param("profileUrl", "https://card.tccards.tn/@jane"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .expect(1)
        .mount(&server)
        .await;

    let http = HttpFetcher::new(fast_config(0, Duration::from_secs(2))).expect("fetcher");
    let client = ContactFormClient::new(http, format!("{}/form", server.uri()));
    client
        .submit(
            &contact_message(),
            "jane@example.com",
            "https://card.tccards.tn/@jane",
        )
        .await
        .expect("sent");
}

#[tokio::test]
async fn contact_form_surfaces_rejection_and_skips_invalid_input() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/form"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "error", "message": "Quota exceeded"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let http = HttpFetcher::new(fast_config(0, Duration::from_secs(2))).expect("fetcher");
    let client = ContactFormClient::new(http, format!("{}/form", server.uri()));

    let err = client
        .submit(&contact_message(), "jane@example.com", "https://x")
        .await
        .expect_err("rejected");
    assert!(matches!(err, ContactError::Rejected(ref m) if m == "Quota exceeded"));

    let mut invalid = contact_message();
    invalid.message = "hi".into();
    let err = client
        .submit(&invalid, "jane@example.com", "https://x")
        .await
        .expect_err("invalid");
    assert!(matches!(err, ContactError::Invalid(_)));
}
