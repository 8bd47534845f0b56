// Property-based tests for webhook signing, plus delivery tests against a
// local mock receiver

use common::webhook::{
    build_payload, canonical_json, deliver_once, sign_payload, signature_header_value,
    verify_webhook_signature,
};
use proptest::prelude::*;
use std::time::Duration;

mod signature_properties {
    use super::*;

    fn arbitrary_payload() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(serde_json::Value::Bool),
            any::<i64>().prop_map(|n| serde_json::json!(n)),
            "[a-zA-Z0-9 ]{0,20}".prop_map(serde_json::Value::String),
        ];
        leaf.prop_recursive(3, 32, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4)
                    .prop_map(serde_json::Value::Array),
                proptest::collection::hash_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        // verify(sign(payload, secret), payload, secret) holds for any
        // payload and secret.
        #[test]
        fn sign_verify_round_trip(
            payload in arbitrary_payload(),
            secret in "[a-f0-9]{8,64}",
        ) {
            let body = canonical_json(&payload);
            let header = signature_header_value(&sign_payload(body.as_bytes(), &secret));
            prop_assert!(verify_webhook_signature(body.as_bytes(), &header, None, &secret, 0));
        }

        // A signature made with one secret never verifies under another.
        #[test]
        fn cross_secret_verification_fails(
            payload in arbitrary_payload(),
            secret_a in "[a-f]{16}",
            secret_b in "[0-9]{16}",
        ) {
            let body = canonical_json(&payload);
            let header = signature_header_value(&sign_payload(body.as_bytes(), &secret_a));
            prop_assert!(!verify_webhook_signature(body.as_bytes(), &header, None, &secret_b, 0));
        }

        // Canonical serialization is stable under object key insertion order.
        #[test]
        fn canonical_json_ignores_insertion_order(
            keys in proptest::collection::hash_set("[a-z]{1,6}", 2..8),
        ) {
            let keys: Vec<String> = keys.into_iter().collect();

            let mut forward = serde_json::Map::new();
            for (i, key) in keys.iter().enumerate() {
                forward.insert(key.clone(), serde_json::json!(i));
            }
            let mut reverse = serde_json::Map::new();
            for (i, key) in keys.iter().enumerate().rev() {
                reverse.insert(key.clone(), serde_json::json!(i));
            }

            prop_assert_eq!(
                canonical_json(&serde_json::Value::Object(forward)),
                canonical_json(&serde_json::Value::Object(reverse))
            );
        }
    }
}

mod delivery {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn delivery_succeeds_on_200_with_signature_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let body = r#"{"id":"batch_x","status":"completed"}"#;
        let signature = sign_payload(body.as_bytes(), "secret");

        let outcome = deliver_once(
            &client,
            &format!("{}/hook", server.uri()),
            body,
            Some(&signature),
            Some(1_700_000_000),
            Duration::from_secs(5),
        )
        .await;
        assert!(outcome.is_ok());

        let received = &server.received_requests().await.unwrap()[0];
        let sig_header = received.headers.get("X-Webhook-Signature").unwrap();
        assert_eq!(sig_header.to_str().unwrap(), format!("sha256={}", signature));
        assert!(received.headers.get("X-Webhook-Timestamp").is_some());

        // The receiver can verify the exact bytes it was sent
        assert!(verify_webhook_signature(
            &received.body,
            sig_header.to_str().unwrap(),
            None,
            "secret",
            0
        ));
    }

    #[tokio::test]
    async fn delivery_accepts_all_success_statuses() {
        for status in [200u16, 201, 202, 204] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let client = reqwest::Client::new();
            let outcome = deliver_once(
                &client,
                &server.uri(),
                "{}",
                None,
                None,
                Duration::from_secs(5),
            )
            .await;
            assert!(outcome.is_ok(), "status {} should count as delivered", status);
        }
    }

    #[tokio::test]
    async fn delivery_fails_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = deliver_once(
            &client,
            &server.uri(),
            "{}",
            None,
            None,
            Duration::from_secs(5),
        )
        .await;

        let err = outcome.unwrap_err().to_string();
        assert!(err.contains("502"), "error should carry the status: {}", err);
    }
}

mod payload_shape {
    use super::*;
    use common::models::{BatchJob, BatchStatus};

    fn job(status: BatchStatus) -> BatchJob {
        BatchJob {
            batch_id: "batch_feedface00000000".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            input_file_id: "file-in".to_string(),
            output_file_id: None,
            completion_window: "24h".to_string(),
            status,
            created_at: 1_700_000_000,
            in_progress_at: None,
            expires_at: 1_700_086_400,
            finalizing_at: None,
            completed_at: Some(1_700_001_000),
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            total_requests: 10,
            completed_requests: 10,
            failed_requests: 0,
            errors_json: None,
            metadata_json: None,
            model: "llama-3".to_string(),
            priority: 0,
            tokens_processed: 1234,
            total_tokens: Some(1234),
            throughput_tokens_per_sec: Some(80.0),
            last_progress_update: None,
            estimated_completion_time: None,
            webhook_url: Some("http://example.invalid/hook".to_string()),
            webhook_secret: None,
            webhook_events: None,
            webhook_max_retries: None,
            webhook_timeout: None,
            webhook_status: None,
            webhook_attempts: 0,
            webhook_last_attempt: None,
            webhook_error: None,
        }
    }

    #[test]
    fn completed_payload_links_results() {
        let payload = build_payload(&job(BatchStatus::Completed));
        assert_eq!(payload["status"], "completed");
        assert_eq!(
            payload["output_file_url"],
            "/v1/batches/batch_feedface00000000/results"
        );
        assert_eq!(payload["error_file_url"], serde_json::Value::Null);
        assert_eq!(payload["metadata"], serde_json::json!({}));
        assert_eq!(payload["request_counts"]["completed"], 10);
    }

    #[test]
    fn failed_payload_has_no_results_link() {
        let payload = build_payload(&job(BatchStatus::Failed));
        assert_eq!(payload["status"], "failed");
        assert_eq!(payload["output_file_url"], serde_json::Value::Null);
    }

    #[test]
    fn metadata_passes_through_when_present() {
        let mut job = job(BatchStatus::Completed);
        job.metadata_json = Some(r#"{"team":"evals"}"#.to_string());
        let payload = build_payload(&job);
        assert_eq!(payload["metadata"]["team"], "evals");
    }
}
