//! Router tests over the in-memory ledger

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::test_support::*;

    fn delivery(body: serde_json::Value) -> axum::http::Request<axum::body::Body> {
        json_request("POST", "/webhooks/lead-delivery", Some(LEAD_TOKEN), &body.to_string())
    }

    // =========================================================================
    // Lead delivery
    // =========================================================================

    #[tokio::test]
    async fn test_delivery_recorded_and_billed() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "sourceExternalId": "lead-1001" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["duplicate"], false);
        assert_eq!(body["portalKey"], "acme-roofing");
        assert_eq!(body["sourceExternalId"], "lead-1001");
        assert_eq!(body["billableQuantity"], 1);
        assert!(body["leadEventId"].is_string());
        assert_eq!(app.usage.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_body_answered_as_duplicate() {
        let app = test_app().await;
        let payload = json!({ "portalKey": "acme-roofing", "leadId": "lead-7" });

        let (_, first) = send(&app, delivery(payload.clone())).await;
        let (status, second) = send(&app, delivery(payload)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["leadEventId"], first["leadEventId"]);
        assert_eq!(app.store.lead_event_count().await, 1);
        assert_eq!(app.usage.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_with_new_body_dedups_in_ledger() {
        let app = test_app().await;
        send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "leadId": "lead-8", "attempt": 1 })),
        )
        .await;
        let (_, second) = send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "leadId": "lead-8", "attempt": 2 })),
        )
        .await;
        assert_eq!(second["duplicate"], true);
        assert_eq!(app.store.lead_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_bad_request() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            json_request("POST", "/webhooks/lead-delivery", Some(LEAD_TOKEN), "{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "invalid_input");
        assert_eq!(app.store.lead_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_portal_is_not_found() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            delivery(json!({ "portalKey": "nobody-plumbing", "leadId": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert!(!body["error"].as_str().unwrap().contains("nobody-plumbing"));
    }

    // =========================================================================
    // Replacement requests
    // =========================================================================

    #[tokio::test]
    async fn test_replacement_submit_and_resolve() {
        let app = test_app().await;
        let (_, receipt) = send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "leadId": "lead-20" })),
        )
        .await;

        let (status, decision) = send(
            &app,
            json_request(
                "POST",
                "/api/replacement-requests",
                Some(REPLACEMENT_TOKEN),
                &json!({
                    "portalKey": "acme-roofing",
                    "leadEventId": receipt["leadEventId"],
                    "reason": "wrong_number",
                })
                .to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["status"], "submitted");
        assert_eq!(decision["eligibleForReview"], true);
        assert_eq!(decision["policy"]["withinOneWeek"], true);
        assert_eq!(decision["policy"]["contactedWithin15m"], true);

        let uri = format!(
            "/api/admin/replacement-requests/{}/resolve",
            decision["requestId"].as_str().unwrap()
        );
        let resolve = json!({ "decision": "approve", "resolvedBy": "ops@leadgen.test" }).to_string();

        let (status, first) = send(&app, json_request("POST", &uri, Some(ADMIN_TOKEN), &resolve)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["updated"], true);

        let (_, second) = send(&app, json_request("POST", &uri, Some(ADMIN_TOKEN), &resolve)).await;
        assert_eq!(second["updated"], false);
    }

    #[tokio::test]
    async fn test_unknown_reason_is_bad_request() {
        let app = test_app().await;
        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/replacement-requests",
                Some(REPLACEMENT_TOKEN),
                &json!({ "portalKey": "acme-roofing", "sourceExternalId": "x", "reason": "meh" })
                    .to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_resolve_with_bad_id_is_bad_request() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/admin/replacement-requests/not-a-uuid/resolve",
                Some(ADMIN_TOKEN),
                r#"{"decision":"approve","resolvedBy":"ops"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "invalid_input");
    }

    // =========================================================================
    // Admin
    // =========================================================================

    #[tokio::test]
    async fn test_invalidate_lead_event() {
        let app = test_app().await;
        let (_, receipt) = send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "leadId": "lead-30" })),
        )
        .await;
        let uri = format!(
            "/api/admin/lead-events/{}/invalidate",
            receipt["leadEventId"].as_str().unwrap()
        );

        let (status, event) = send(&app, json_request("POST", &uri, Some(ADMIN_TOKEN), "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event["status"], "invalid");

        let (status, body) = send(&app, json_request("POST", &uri, Some(ADMIN_TOKEN), "")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "conflict");
    }

    #[tokio::test]
    async fn test_billing_model_change_requires_migration_flag() {
        let app = test_app().await;
        send(
            &app,
            delivery(json!({ "portalKey": "acme-roofing", "leadId": "lead-40" })),
        )
        .await;
        let uri = "/api/admin/organizations/acme-roofing/billing-model";

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                uri,
                Some(ADMIN_TOKEN),
                r#"{"billingModel":"package_40_paid_in_full"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, org) = send(
            &app,
            json_request(
                "POST",
                uri,
                Some(ADMIN_TOKEN),
                r#"{"billingModel":"package_40_paid_in_full","migration":true}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(org["billingModel"], "package_40_paid_in_full");
    }

    #[tokio::test]
    async fn test_manual_activation_invites_once() {
        let app = test_app().await;
        let body = json!({
            "customerEmail": "owner@bobhvac.test",
            "portalKey": "bob-hvac",
            "companyName": "Bob HVAC",
            "billingModel": "package_40_paid_in_full",
        })
        .to_string();

        let (status, first) = send(
            &app,
            json_request("POST", "/api/admin/activations", Some(ADMIN_TOKEN), &body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "activated");

        let (_, second) = send(
            &app,
            json_request("POST", "/api/admin/activations", Some(ADMIN_TOKEN), &body),
        )
        .await;
        assert_eq!(second["status"], "skipped");
        assert_eq!(second["reason"], "already_invited");
        assert_eq!(app.invitations.created().len(), 1);
    }

    #[tokio::test]
    async fn test_invariants_unavailable_without_postgres() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            json_request("GET", "/api/admin/invariants", Some(ADMIN_TOKEN), ""),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "unavailable");
    }

    // =========================================================================
    // Payment webhook and onboarding
    // =========================================================================

    #[tokio::test]
    async fn test_stripe_webhook_requires_signature() {
        let app = test_app().await;
        let (status, body) = send(&app, json_request("POST", "/webhooks/stripe", None, "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "invalid_signature");

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("Stripe-Signature", "t=1700000000,v1=deadbeef")
            .body(axum::body::Body::from(r#"{"id":"evt_1"}"#))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_checkout_intent_reused_for_same_customer() {
        let app = test_app().await;
        let body = json!({
            "companyName": "Bob HVAC",
            "billingEmail": "owner@bobhvac.test",
            "billingModel": "package_40_paid_in_full",
        })
        .to_string();

        let (status, first) =
            send(&app, json_request("POST", "/api/leadgen/intents", None, &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "checkout_created");
        assert_eq!(first["portalKey"], "bob-hvac");
        assert!(first.get("token").is_none());

        let (_, second) = send(&app, json_request("POST", "/api/leadgen/intents", None, &body)).await;
        assert_eq!(second["intentId"], first["intentId"]);
    }

    #[tokio::test]
    async fn test_unknown_onboarding_token_is_not_found() {
        let app = test_app().await;
        let (status, _) = send(
            &app,
            json_request("GET", "/api/leadgen/onboarding/does-not-exist", None, ""),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
