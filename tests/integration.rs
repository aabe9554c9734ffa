use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use order_sync::api::rest::router;
use order_sync::config::DispatchSettings;
use order_sync::engine::assignment::run_assignment_engine;
use order_sync::models::actor::Actor;
use order_sync::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
}

impl TestApp {
    fn spawn(settings: DispatchSettings) -> Self {
        let (state, order_rx) = AppState::new(settings, 1024, 1024);
        let state = Arc::new(state);
        tokio::spawn(run_assignment_engine(Arc::clone(&state), order_rx));
        Self {
            app: router(Arc::clone(&state)),
            state,
        }
    }

    fn new() -> Self {
        Self::spawn(DispatchSettings::default())
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        actor: Option<&Actor>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self.send(request(method, uri, actor, body)).await;
        let status = response.status();
        (status, body_json(response).await)
    }

    async fn create_rider(&self, operator: &Actor, name: &str, lat: f64, lng: f64) -> Uuid {
        let (status, body) = self
            .call(
                "POST",
                "/riders",
                Some(operator),
                Some(json!({
                    "name": name,
                    "location": { "lat": lat, "lng": lng },
                    "capacity": 2,
                    "rating": 4.5,
                    "completed_deliveries": 40
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["id"].as_str().unwrap().parse().unwrap()
    }

    async fn place_order(&self, customer: &Actor, payment_method: &str) -> Value {
        let (status, body) = self
            .call("POST", "/orders", Some(customer), Some(order_body(payment_method)))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    /// Waits until the latest offer of `order_id` has `outcome`.
    async fn wait_for_offer(&self, order_id: &str, outcome: &str) -> Value {
        let operator = Actor::operator(Uuid::new_v4());
        let uri = format!("/orders/{order_id}/offer");
        for _ in 0..200 {
            let (status, body) = self.call("GET", &uri, Some(&operator), None).await;
            if status == StatusCode::OK && body["outcome"] == outcome {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("offer for {order_id} never became {outcome}");
    }
}

fn request(method: &str, uri: &str, actor: Option<&Actor>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder.header("authorization", format!("Bearer {}", actor.credential()));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

fn order_body(payment_method: &str) -> Value {
    json!({
        "items": [
            { "name": "Jollof rice", "quantity": 2, "unit_price": "15.00" },
            { "name": "Kelewele", "quantity": 1, "unit_price": "15.00" }
        ],
        "delivery": {
            "location": { "lat": 5.6037, "lng": -0.1870 },
            "address": "12 Oxford Street, Osu"
        },
        "payment_method": payment_method
    })
}

fn decimal(value: &Value) -> f64 {
    value.as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_reports_counts() {
    let app = TestApp::new();
    let (status, body) = app.call("GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["riders"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["pending_offers"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let app = TestApp::new();
    let response = app.send(request("GET", "/metrics", None, None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_json(response).await;
    assert!(body.as_str().unwrap().contains("orders_in_queue"));
}

#[tokio::test]
async fn requests_without_credentials_are_unauthorized() {
    let app = TestApp::new();

    let (status, _) = app.call("POST", "/orders", None, Some(order_body("cash"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = app
        .send(
            Request::builder()
                .method("GET")
                .uri(format!("/orders/{}", Uuid::new_v4()))
                .header("authorization", "Bearer pilot:not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn riders_are_registered_by_operators_only() {
    let app = TestApp::new();
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let rider_body = json!({
        "name": "Kwame",
        "location": { "lat": 5.6, "lng": -0.18 },
        "capacity": 3,
        "rating": 7.0
    });

    let (status, _) = app.call("POST", "/riders", Some(&customer), Some(rider_body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.call("POST", "/riders", Some(&operator), Some(rider_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Kwame");
    assert_eq!(body["status"], "available");
    assert_eq!(body["current_load"], 0);
    assert_eq!(body["completed_deliveries"], 0);
    // Ratings are clamped to five stars.
    assert_eq!(body["rating"], 5.0);

    let (status, _) = app
        .call(
            "POST",
            "/riders",
            Some(&operator),
            Some(json!({
                "name": " ",
                "location": { "lat": 5.6, "lng": -0.18 },
                "capacity": 1,
                "rating": 4.0
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(
            "POST",
            "/riders",
            Some(&operator),
            Some(json!({
                "name": "Ama",
                "location": { "lat": 95.0, "lng": -0.18 },
                "capacity": 1,
                "rating": 4.0
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.call("GET", "/riders", Some(&operator), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn order_totals_use_the_default_delivery_fee() {
    let app = TestApp::new();
    let customer = Actor::customer(Uuid::new_v4());

    let order = app.place_order(&customer, "card").await;

    assert_eq!(order["status"], "pending");
    assert_eq!(order["customer_id"], customer.id.to_string());
    assert_eq!(decimal(&order["payment"]["subtotal"]), 45.0);
    assert_eq!(decimal(&order["payment"]["total"]), 55.0);
    assert_eq!(order["payment"]["status"], "pending");
    assert_eq!(order["status_history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn orders_are_private_to_their_customer() {
    let app = TestApp::new();
    let customer = Actor::customer(Uuid::new_v4());
    let stranger = Actor::customer(Uuid::new_v4());
    let order = app.place_order(&customer, "cash").await;
    let uri = format!("/orders/{}", order["id"].as_str().unwrap());

    let (status, _) = app.call("GET", &uri, Some(&customer), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.call("GET", &uri, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call("GET", &format!("/orders/{}", Uuid::new_v4()), Some(&customer), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn accepted_order_runs_to_delivery() {
    let app = TestApp::new();
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let rider_id = app.create_rider(&operator, "Kofi", 5.6040, -0.1860).await;
    let rider = Actor::rider(rider_id);

    let order = app.place_order(&customer, "cash").await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let offer = app.wait_for_offer(&order_id, "pending").await;
    assert_eq!(offer["rider_id"], rider_id.to_string());

    // The offered rider may read the order before deciding.
    let (status, body) = app.call("GET", &format!("/orders/{order_id}"), Some(&rider), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "assigned");

    let (status, body) = app
        .call("POST", &format!("/orders/{order_id}/offer/accept"), Some(&rider), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"], "accepted");

    let (status, _) = app
        .call("POST", &format!("/orders/{order_id}/offer/reject"), Some(&rider), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let status_uri = format!("/orders/{order_id}/status");
    for next in ["picked_up", "in_transit", "nearby"] {
        let (status, body) = app
            .call("PUT", &status_uri, Some(&rider), Some(json!({ "status": next })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], next);
    }

    let (status, body) = app
        .call(
            "PUT",
            &status_uri,
            Some(&rider),
            Some(json!({
                "status": "delivered",
                "location": { "lat": 5.6037, "lng": -0.1870 },
                "note": "left with guard"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "delivered");
    assert_eq!(body["payment"]["status"], "paid");
    assert!(body["payment"]["paid_at"].is_string());
    assert!(body["tracking"]["delivered_at"].is_string());
    assert_eq!(body["tracking"]["current_location"]["location"]["lat"], 5.6037);

    let history: Vec<&str> = body["status_history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["status"].as_str().unwrap())
        .collect();
    assert_eq!(
        history,
        vec!["pending", "assigned", "accepted", "picked_up", "in_transit", "nearby", "delivered"]
    );

    let stored = app.state.riders.get(&rider_id).unwrap().clone();
    assert_eq!(stored.current_load, 0);
    assert_eq!(stored.completed_deliveries, 41);
    assert_eq!(stored.earnings.to_string(), "10");

    let (status, _) = app
        .call("PUT", &status_uri, Some(&operator), Some(json!({ "status": "cancelled" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn status_route_refuses_acceptance_and_skips() {
    let app = TestApp::new();
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let order = app.place_order(&customer, "card").await;
    let status_uri = format!("/orders/{}/status", order["id"].as_str().unwrap());

    let (status, _) = app
        .call("PUT", &status_uri, Some(&operator), Some(json!({ "status": "accepted" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call("PUT", &status_uri, Some(&operator), Some(json!({ "status": "delivered" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .call(
            "PUT",
            &status_uri,
            Some(&customer),
            Some(json!({ "status": "cancelled", "note": "changed my mind" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["cancellation"]["by"], "customer");
    assert_eq!(body["cancellation"]["reason"], "changed my mind");
}

#[tokio::test]
async fn rejected_offer_moves_to_the_next_rider() {
    let app = TestApp::new();
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let near = app.create_rider(&operator, "Near", 5.6038, -0.1871).await;
    let far = app.create_rider(&operator, "Far", 5.6400, -0.1500).await;

    let order = app.place_order(&customer, "momo").await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let first = app.wait_for_offer(&order_id, "pending").await;
    assert_eq!(first["rider_id"], near.to_string());

    let (status, body) = app
        .call(
            "POST",
            &format!("/orders/{order_id}/offer/reject"),
            Some(&Actor::rider(near)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "rejected");

    let second = app.wait_for_offer(&order_id, "pending").await;
    assert_eq!(second["rider_id"], far.to_string());
    assert_ne!(second["id"], first["id"]);

    // Someone else's offer cannot be answered.
    let (status, _) = app
        .call(
            "POST",
            &format!("/orders/{order_id}/offer/accept"),
            Some(&Actor::rider(near)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unanswered_offer_expires_and_waits_for_redispatch() {
    let app = TestApp::spawn(DispatchSettings {
        offer_timeout: Duration::from_millis(200),
        ..DispatchSettings::default()
    });
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let rider_id = app.create_rider(&operator, "Solo", 5.6040, -0.1860).await;

    let order = app.place_order(&customer, "cash").await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let first = app.wait_for_offer(&order_id, "pending").await;
    let expired = app.wait_for_offer(&order_id, "expired").await;
    assert_eq!(expired["id"], first["id"]);

    // The only rider already had this round, so the order waits.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let order_uuid: Uuid = order_id.parse().unwrap();
    assert!(app.state.offers.get(&order_uuid).unwrap().delayed);

    let uri = format!("/orders/{order_id}");
    let (status, body) = app.call("GET", &uri, Some(&operator), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "assigned");
    assert!(body["rider_id"].is_null());

    // Late accept loses.
    let (status, _) = app
        .call(
            "POST",
            &format!("/orders/{order_id}/offer/accept"),
            Some(&Actor::rider(rider_id)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .call("POST", &format!("/orders/{order_id}/redispatch"), Some(&customer), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call("POST", &format!("/orders/{order_id}/redispatch"), Some(&operator), None)
        .await;
    assert!(status.is_success());

    let again = app.wait_for_offer(&order_id, "pending").await;
    assert_ne!(again["id"], first["id"]);
    assert_eq!(again["rider_id"], rider_id.to_string());
}

#[tokio::test]
async fn rider_location_reaches_active_orders() {
    let app = TestApp::new();
    let operator = Actor::operator(Uuid::new_v4());
    let customer = Actor::customer(Uuid::new_v4());
    let rider_id = app.create_rider(&operator, "Yaw", 5.6040, -0.1860).await;
    let rider = Actor::rider(rider_id);

    let order = app.place_order(&customer, "card").await;
    let order_id = order["id"].as_str().unwrap().to_string();
    app.wait_for_offer(&order_id, "pending").await;

    let (status, body) = app
        .call("GET", &format!("/riders/{rider_id}/orders"), Some(&rider), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = app
        .call("POST", &format!("/orders/{order_id}/offer/accept"), Some(&rider), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let location_uri = format!("/riders/{rider_id}/location");
    let sample = json!({
        "latitude": 5.6039,
        "longitude": -0.1865,
        "captured_at": chrono::Utc::now().to_rfc3339()
    });

    let (status, _) = app
        .call("PATCH", &location_uri, Some(&customer), Some(sample.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.call("PATCH", &location_uri, Some(&rider), Some(sample)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["orders_updated"], 1);

    let (_, body) = app
        .call("GET", &format!("/riders/{rider_id}/orders?scope=active"), Some(&rider), None)
        .await;
    let active = body.as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["tracking"]["current_location"]["location"]["lat"], 5.6039);
}
