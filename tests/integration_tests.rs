//! Integration tests for the traceline core.
//!
//! These drive the full router end-to-end: identity, lifecycle, audit,
//! telemetry and governor behave together the way the HTTP contract
//! promises.

use assert_cmd::Command;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use predicates::prelude::*;
use serde_json::{Value, json};
use tower::ServiceExt;

use traceline::api::server::{build_router, build_state};
use traceline::config::TracelineConfig;
use traceline::store::{CoreDb, DbHandle};

/// Helper to create a traceline Command
fn traceline() -> Command {
    Command::cargo_bin("traceline").unwrap()
}

/// Full application router over a fresh in-memory store.
fn test_app() -> Router {
    let db = DbHandle::new(CoreDb::new_in_memory().unwrap());
    build_router(build_state(db, &TracelineConfig::default()))
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_chain(app: &Router) -> (String, String, String, String) {
    let (status, mission) = request(app, "POST", "/v1/identity/mission", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let mission_id = mission["id"].as_str().unwrap().to_string();

    let (status, plan) = request(
        app,
        "POST",
        "/v1/identity/plan",
        Some(json!({"mission_id": mission_id, "plan_type": "course_outline"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let plan_id = plan["id"].as_str().unwrap().to_string();

    let (status, job) = request(
        app,
        "POST",
        "/v1/identity/job",
        Some(json!({"plan_id": plan_id, "job_type": "generate_lesson"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id = job["id"].as_str().unwrap().to_string();

    let (status, attempt) = request(
        app,
        "POST",
        "/v1/identity/attempt",
        Some(json!({"job_id": job_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let attempt_id = attempt["id"].as_str().unwrap().to_string();

    (mission_id, plan_id, job_id, attempt_id)
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_traceline_help() {
        traceline()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_traceline_version() {
        traceline().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        traceline().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        traceline()
            .args(["--config", "/nonexistent/traceline.toml", "serve"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Identity & trace chain
// =============================================================================

mod identity {
    use super::*;

    #[tokio::test]
    async fn test_create_plan_with_missing_mission_is_404() {
        let app = test_app();
        let (status, body) = request(
            &app,
            "POST",
            "/v1/identity/plan",
            Some(json!({"mission_id": "m_missing", "plan_type": "course_outline"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NR-E002");
        assert_eq!(body["retriable"], false);
    }

    #[tokio::test]
    async fn test_caller_supplied_id_collision_is_409() {
        let app = test_app();
        let (status, _) = request(
            &app,
            "POST",
            "/v1/identity/mission",
            Some(json!({"id": "m_fixed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = request(
            &app,
            "POST",
            "/v1/identity/mission",
            Some(json!({"id": "m_fixed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NR-E003");
    }

    #[tokio::test]
    async fn test_trace_chain_from_fresh_attempt_is_fully_populated() {
        let app = test_app();
        let (mission_id, plan_id, job_id, attempt_id) = create_chain(&app).await;

        let (status, chain) = request(
            &app,
            "GET",
            &format!("/v1/identity/trace/attempt/{}", attempt_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chain["mission"]["id"], mission_id.as_str());
        assert_eq!(chain["plan"]["id"], plan_id.as_str());
        assert_eq!(chain["job"]["id"], job_id.as_str());
        assert_eq!(chain["attempt"]["id"], attempt_id.as_str());
        assert!(chain["resources"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trace_chain_for_unknown_entity_is_404() {
        let app = test_app();
        let (status, body) =
            request(&app, "GET", "/v1/identity/trace/attempt/a_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NR-E002");
    }

    #[tokio::test]
    async fn test_concurrent_attempts_get_contiguous_numbers() {
        let app = test_app();
        let (_, _, job_id, _first) = create_chain(&app).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let app = app.clone();
            let job_id = job_id.clone();
            handles.push(tokio::spawn(async move {
                let (status, attempt) = request(
                    &app,
                    "POST",
                    "/v1/identity/attempt",
                    Some(json!({"job_id": job_id, "retry_reason": "retry"})),
                )
                .await;
                assert_eq!(status, StatusCode::CREATED);
                attempt["attempt_number"].as_i64().unwrap()
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        // The seed attempt took number 1; the five retries must be 2..=6
        // with no gaps or duplicates regardless of completion order.
        assert_eq!(numbers, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_resource_appears_in_trace_chain() {
        let app = test_app();
        let (_, _, _, attempt_id) = create_chain(&app).await;

        let (status, resource) = request(
            &app,
            "POST",
            "/v1/identity/resource",
            Some(json!({
                "attempt_id": attempt_id,
                "resource_type": "artifact",
                "metadata": {"path": "out/lesson.md"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(resource["uuid"].as_str().unwrap().starts_with("r_"));

        let (_, chain) = request(
            &app,
            "GET",
            &format!("/v1/identity/trace/resource/{}", resource["uuid"].as_str().unwrap()),
            None,
        )
        .await;
        assert_eq!(chain["attempt"]["id"], attempt_id.as_str());
        assert_eq!(chain["resources"][0]["uuid"], resource["uuid"]);
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_mission_lifecycle_scenario() {
        let app = test_app();
        let (status, mission) = request(&app, "POST", "/v1/identity/mission", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let mission_id = mission["id"].as_str().unwrap().to_string();

        // Fresh mission is pending.
        let (status, state) = request(
            &app,
            "GET",
            &format!("/v1/lifecycle/state/mission/{}", mission_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["state"], "pending");

        // pending -> planning is allowed.
        let (status, _) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/mission",
            Some(json!({"entity_id": mission_id, "target_state": "planning"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Jumping straight to completed from planning must fail.
        let (status, body) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/mission",
            Some(json!({"entity_id": mission_id, "target_state": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NR-E001");
        assert_eq!(body["details"]["current_state"], "planning");

        // planned -> executing -> completed all succeed.
        for target in ["planned", "executing", "completed"] {
            let (status, transition) = request(
                &app,
                "POST",
                "/v1/lifecycle/transition/mission",
                Some(json!({"entity_id": mission_id, "target_state": target})),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "transition to {} must succeed", target);
            assert_eq!(transition["to_state"], target);
        }

        // Four successful calls, four ordered rows.
        let (status, history) = request(
            &app,
            "GET",
            &format!("/v1/lifecycle/history/mission/{}", mission_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let targets: Vec<&str> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["to_state"].as_str().unwrap())
            .collect();
        assert_eq!(targets, vec!["planning", "planned", "executing", "completed"]);
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_all_transitions() {
        let app = test_app();
        let (_, _, _, attempt_id) = create_chain(&app).await;

        let (status, _) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/attempt",
            Some(json!({"entity_id": attempt_id, "target_state": "running"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/attempt",
            Some(json!({"entity_id": attempt_id, "target_state": "succeeded"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/attempt",
            Some(json!({"entity_id": attempt_id, "target_state": "running"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NR-E001");

        let (_, history) = request(
            &app,
            "GET",
            &format!("/v1/lifecycle/history/attempt/{}", attempt_id),
            None,
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_target_state_is_422() {
        let app = test_app();
        let (status, mission) = request(&app, "POST", "/v1/identity/mission", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = request(
            &app,
            "POST",
            "/v1/lifecycle/transition/mission",
            Some(json!({
                "entity_id": mission["id"].as_str().unwrap(),
                "target_state": "warp_speed"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "NR-E004");
        assert_eq!(body["category"], "system");
    }
}

// =============================================================================
// Audit ledger
// =============================================================================

mod audit {
    use super::*;

    fn event(severity: &str, mission_id: &str) -> Value {
        json!({
            "mission_id": mission_id,
            "event_type": "generator_output",
            "event_category": "content",
            "severity": severity,
            "message": "generator emitted a section",
        })
    }

    #[tokio::test]
    async fn test_n_logs_are_all_queryable_and_counted() {
        let app = test_app();
        for severity in ["debug", "info", "warning", "error", "critical"] {
            let (status, logged) =
                request(&app, "POST", "/v1/audit/log", Some(event(severity, "m_1"))).await;
            assert_eq!(status, StatusCode::CREATED);
            assert!(logged["audit_id"].as_str().unwrap().starts_with("evt_"));
        }

        let (status, page) = request(&app, "GET", "/v1/audit/events?mission_id=m_1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 5);
        assert_eq!(page["events"].as_array().unwrap().len(), 5);

        let (status, stats) = request(&app, "GET", "/v1/audit/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_events"], 5);
        assert_eq!(stats["by_severity"]["error"], 1);
        assert_eq!(stats["by_category"]["content"], 5);
        assert_eq!(stats["recent_errors"], 2);
    }

    #[tokio::test]
    async fn test_severity_filter_and_pagination() {
        let app = test_app();
        for _ in 0..3 {
            request(&app, "POST", "/v1/audit/log", Some(event("error", "m_2"))).await;
        }
        request(&app, "POST", "/v1/audit/log", Some(event("info", "m_2"))).await;

        let (_, page) = request(
            &app,
            "GET",
            "/v1/audit/events?severity=error&limit=2&offset=0",
            None,
        )
        .await;
        assert_eq!(page["total"], 3);
        assert_eq!(page["events"].as_array().unwrap().len(), 2);

        let (status, body) = request(&app, "GET", "/v1/audit/events?severity=fatal", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "NR-E010");
    }

    #[tokio::test]
    async fn test_ledger_exposes_no_mutation_routes() {
        let app = test_app();
        let (_, logged) = request(&app, "POST", "/v1/audit/log", Some(event("info", "m_3"))).await;
        let audit_id = logged["audit_id"].as_str().unwrap();

        for method in ["PUT", "PATCH", "DELETE"] {
            let (status, _) = request(
                &app,
                method,
                &format!("/v1/audit/events/{}", audit_id),
                None,
            )
            .await;
            assert_eq!(
                status,
                StatusCode::NOT_FOUND,
                "{} on a ledger row must not exist",
                method
            );
        }
    }
}

// =============================================================================
// Telemetry & governor
// =============================================================================

mod telemetry_and_governor {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_reflects_created_entities() {
        let app = test_app();
        create_chain(&app).await;

        let (status, snapshot) = request(&app, "GET", "/v1/telemetry/snapshot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["entity_counts"]["mission"], 1);
        assert_eq!(snapshot["entity_counts"]["attempt"], 1);
        assert_eq!(snapshot["active"]["queued_jobs"], 1);
        assert_eq!(snapshot["active"]["active_missions"], 1);
        assert!(snapshot["metrics"]["execution_duration_ms"]["buckets"].is_array());
    }

    #[tokio::test]
    async fn test_metrics_route_serves_raw_series() {
        let app = test_app();
        let (status, metrics) = request(&app, "GET", "/v1/telemetry/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(metrics["attempts_total"].is_object());
        assert_eq!(
            metrics["execution_duration_ms"]["buckets"]
                .as_array()
                .unwrap()
                .last()
                .unwrap()["le"],
            "+Inf"
        );
    }

    #[tokio::test]
    async fn test_personal_data_context_selects_rail() {
        let app = test_app();
        let (status, decision) = request(
            &app,
            "POST",
            "/v1/governor/decide",
            Some(json!({
                "job_type": "generate_lesson",
                "context": {"uses_personal_data": true}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["mode"], "rail");
        assert!(
            decision["matched_rules"]
                .as_array()
                .unwrap()
                .iter()
                .any(|r| r == "personal_data_rail")
        );

        let (_, decision) = request(
            &app,
            "POST",
            "/v1/governor/decide",
            Some(json!({
                "job_type": "generate_lesson",
                "context": {"uses_personal_data": false}
            })),
        )
        .await;
        assert_eq!(decision["mode"], "direct");
        assert!(decision["matched_rules"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decide_is_deterministic_for_same_input() {
        let app = test_app();
        let body = json!({
            "job_type": "render_media",
            "context": {"incurs_external_cost": true}
        });
        let (_, first) = request(&app, "POST", "/v1/governor/decide", Some(body.clone())).await;
        let (_, second) = request(&app, "POST", "/v1/governor/decide", Some(body)).await;
        assert_eq!(first["mode"], second["mode"]);
        assert_eq!(first["matched_rules"], second["matched_rules"]);
        assert_ne!(first["decision_id"], second["decision_id"]);
    }
}
