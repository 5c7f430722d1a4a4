use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use unveil_api::{AppState, router};
use unveil_db::{Database, NewGuest};
use unveil_engine::signature::{SIGNATURE_HEADER, sign};
use unveil_engine::{DispatchSettings, Engine, ProviderSet};
use unveil_messaging::ComplianceConfig;
use unveil_types::api::Claims;
use unveil_types::{Event, Guest, User};

const JWT_SECRET: &str = "test-jwt-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

struct TestApp {
    app: Router,
    db: Arc<Database>,
    host: User,
    event: Event,
}

fn setup() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let engine = Engine::new(
        db.clone(),
        ProviderSet::logging(),
        ComplianceConfig::default(),
        DispatchSettings::default(),
        50,
    );
    let state = AppState {
        engine,
        jwt_secret: JWT_SECRET.into(),
        webhook_secret: Some(WEBHOOK_SECRET.into()),
    };

    let host = user(&db, "Sarah Host");
    let event = Event {
        id: Uuid::new_v4(),
        title: "Test Wedding".into(),
        host_user_id: host.id,
        sms_tag: Some("TestWed".into()),
        created_at: Utc::now(),
    };
    db.create_event(&event).unwrap();

    TestApp {
        app: router(state),
        db,
        host,
        event,
    }
}

fn user(db: &Database, name: &str) -> User {
    let user = User {
        id: Uuid::new_v4(),
        full_name: Some(name.into()),
        phone: None,
        created_at: Utc::now(),
    };
    db.create_user(&user).unwrap();
    user
}

impl TestApp {
    fn member(&self, name: &str, phone: &str) -> (User, Guest) {
        let account = user(&self.db, name);
        let mut new = NewGuest::new(self.event.id, name, phone);
        new.user_id = Some(account.id);
        let guest = self.db.insert_guest(new, Utc::now()).unwrap();
        (account, guest)
    }

    async fn call(&self, method: &str, uri: &str, as_user: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = as_user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(user_id)));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = self.app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        read(resp).await
    }

    async fn send_all(&self, content: &str) -> Value {
        let (status, body) = self
            .call(
                "POST",
                &format!("/events/{}/messages/send", self.event.id),
                Some(self.host.id),
                Some(json!({
                    "content": content,
                    "filter": { "all_guests": true },
                    "channels": { "sms": true }
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    async fn callback(&self, body: &Value, signature: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/delivery-status")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        read(resp).await
    }
}

fn token(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id,
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

async fn read(resp: axum::response::Response) -> (StatusCode, Value) {
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

#[tokio::test]
async fn requests_without_a_token_are_rejected() {
    let t = setup();
    let (status, _) = t
        .call("GET", &format!("/events/{}/messages", t.event.id), None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri(format!("/events/{}/messages", t.event.id))
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn host_send_reaches_guest_inbox() {
    let t = setup();
    let (alice, _) = t.member("Alice", "+15551111111");

    let sent = t.send_all("Welcome to our wedding!").await;
    assert_eq!(sent["recipient_count"], 1);
    assert_eq!(sent["sms"]["accepted"], 1);

    let (status, page) = t
        .call("GET", &format!("/events/{}/messages", t.event.id), Some(alice.id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "Welcome to our wedding!");
    assert_eq!(messages[0]["sender_name"], "Sarah Host");
    assert_eq!(messages[0]["is_own_message"], false);
}

#[tokio::test]
async fn non_members_and_removed_guests_get_forbidden() {
    let t = setup();
    let (alice, guest) = t.member("Alice", "+15551111111");
    let outsider = user(&t.db, "Mallory");
    let uri = format!("/events/{}/messages", t.event.id);

    let (status, body) = t.call("GET", &uri, Some(outsider.id), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("access denied"));

    t.db.remove_guest(guest.id, Utc::now()).unwrap();
    let (status, _) = t.call("GET", &uri, Some(alice.id), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn host_endpoints_require_the_host() {
    let t = setup();
    let (alice, _) = t.member("Alice", "+15551111111");

    let (status, _) = t
        .call(
            "POST",
            &format!("/events/{}/messages/send", t.event.id),
            Some(alice.id),
            Some(json!({ "content": "Hi", "filter": { "all_guests": true }, "channels": { "sms": true } })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let sent = t.send_all("Hello").await;
    let stats_uri = format!("/messages/{}/stats", sent["message_id"].as_str().unwrap());
    let (status, _) = t.call("GET", &stats_uri, Some(alice.id), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, stats) = t.call("GET", &stats_uri, Some(t.host.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["delivered"], 1);
}

#[tokio::test]
async fn empty_filter_is_unprocessable() {
    let t = setup();
    t.member("Alice", "+15551111111");
    let (status, _) = t
        .call(
            "POST",
            &format!("/events/{}/messages/send", t.event.id),
            Some(t.host.id),
            Some(json!({ "content": "Hi", "filter": {}, "channels": { "sms": true } })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn preview_counts_without_sending() {
    let t = setup();
    t.member("Alice", "+15551111111");
    t.member("Bob", "+15552222222");

    let (status, preview) = t
        .call(
            "POST",
            &format!("/events/{}/recipients/preview", t.event.id),
            Some(t.host.id),
            Some(json!({ "filter": { "all_guests": true }, "channels": { "sms": true } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["recipient_count"], 2);
    assert_eq!(preview["guest_ids"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn schedule_list_and_cancel() {
    let t = setup();
    t.member("Alice", "+15551111111");
    let send_at = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
    let uri = format!("/events/{}/scheduled-messages", t.event.id);

    let (status, scheduled) = t
        .call(
            "POST",
            &uri,
            Some(t.host.id),
            Some(json!({
                "content": "See you tomorrow",
                "filter": { "all_guests": true },
                "channels": { "sms": true },
                "send_at": send_at
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{scheduled}");
    assert_eq!(scheduled["status"], "scheduled");
    assert_eq!(scheduled["recipient_count"], 1);

    let (status, list) = t.call("GET", &uri, Some(t.host.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let cancel_uri = format!("/scheduled-messages/{}/cancel", scheduled["id"].as_str().unwrap());
    let (status, cancelled) = t.call("POST", &cancel_uri, Some(t.host.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (status, _) = t.call("POST", &cancel_uri, Some(t.host.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = t
        .call("POST", &format!("/scheduled-messages/{}/cancel", Uuid::new_v4()), Some(t.host.id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn past_send_time_is_a_bad_request() {
    let t = setup();
    t.member("Alice", "+15551111111");
    let (status, _) = t
        .call(
            "POST",
            &format!("/events/{}/scheduled-messages", t.event.id),
            Some(t.host.id),
            Some(json!({
                "content": "Too late",
                "filter": { "all_guests": true },
                "channels": { "sms": true },
                "send_at": (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339()
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn guest_reply_needs_a_delivery() {
    let t = setup();
    let (alice, _) = t.member("Alice", "+15551111111");
    let sent = t.send_all("Can you make it?").await;
    let message_id = sent["message_id"].as_str().unwrap();

    let late = t.member("Bob", "+15552222222").0;
    let reply_uri = format!("/events/{}/messages/{}/reply", t.event.id, message_id);

    let (status, _) = t
        .call("POST", &reply_uri, Some(late.id), Some(json!({ "content": "Me too" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, reply) = t
        .call("POST", &reply_uri, Some(alice.id), Some(json!({ "content": "Yes!" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, page) = t
        .call("GET", &format!("/events/{}/messages", t.event.id), Some(alice.id), None)
        .await;
    let own = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["message_id"] == reply["message_id"])
        .unwrap()
        .clone();
    assert_eq!(own["is_own_message"], true);
}

#[tokio::test]
async fn signed_callbacks_advance_status() {
    let t = setup();
    let (_, guest) = t.member("Alice", "+15551111111");
    let sent = t.send_all("Hello").await;
    let message_id: Uuid = sent["message_id"].as_str().unwrap().parse().unwrap();
    let delivery = t.db.find_delivery(message_id, guest.id).unwrap().unwrap();
    let provider_id = delivery.sms.provider_message_id.unwrap();

    let body = json!({ "channel": "sms", "provider_message_id": provider_id, "status": "delivered" });

    let (status, _) = t.callback(&body, "deadbeef").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = sign(WEBHOOK_SECRET.as_bytes(), body.to_string().as_bytes()).unwrap();
    let (status, result) = t.callback(&body, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["applied"], true);

    let (status, result) = t.callback(&body, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["applied"], false);

    let unknown = json!({ "channel": "sms", "provider_message_id": "nope", "status": "delivered" });
    let signature = sign(WEBHOOK_SECRET.as_bytes(), unknown.to_string().as_bytes()).unwrap();
    let (status, _) = t.callback(&unknown, &signature).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn untracked_send_is_a_server_error() {
    let t = setup();
    t.member("Alice", "+15551111111");
    t.db
        .with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_deliveries BEFORE INSERT ON deliveries
                 BEGIN SELECT RAISE(ABORT, 'deliveries table is read-only'); END;",
            )?;
            Ok(())
        })
        .unwrap();

    let (status, body) = t
        .call(
            "POST",
            &format!("/events/{}/messages/send", t.event.id),
            Some(t.host.id),
            Some(json!({
                "content": "Hello",
                "filter": { "all_guests": true },
                "channels": { "sms": true }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("nothing was sent"));
}
