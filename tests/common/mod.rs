//! Common test utilities for E2E tests
//!
//! Spins up the real router against a temporary SQLite database, plus
//! fake Gmail and WhatsApp Graph API servers on ephemeral ports.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use mailrelay::data::{EntityId, GmailAccount, User, UserRole, WhatsAppConfig};
use mailrelay::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const SESSION_SECRET: &str = "test-secret-key-that-is-32-bytes!";
pub const WEBHOOK_TOKEN: &str = "push-token";

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// =============================================================================
// Fake Gmail API
// =============================================================================

/// In-memory mailbox served in the Gmail REST API shape
#[derive(Clone, Default)]
pub struct FakeGmail {
    messages: Arc<Mutex<Vec<Value>>>,
    /// Message ids that answer 500 on fetch
    broken: Arc<Mutex<Vec<String>>>,
    /// Bearer tokens seen on any request
    pub tokens_seen: Arc<Mutex<Vec<String>>>,
}

impl FakeGmail {
    /// Add a plain-text message
    pub fn add_message(&self, id: &str, subject: &str, from: &str, body: &str) {
        self.messages.lock().unwrap().push(json!({
            "id": id,
            "threadId": id,
            "internalDate": Utc::now().timestamp_millis().to_string(),
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": subject},
                    {"name": "From", "value": from}
                ],
                "body": {"size": 0},
                "parts": [{
                    "mimeType": "text/plain",
                    "body": {"size": body.len(), "data": URL_SAFE_NO_PAD.encode(body)}
                }]
            }
        }));
    }

    /// List the message but fail to serve it
    pub fn add_broken_message(&self, id: &str) {
        self.add_message(id, "broken", "nobody@example.com", "");
        self.broken.lock().unwrap().push(id.to_string());
    }

    fn record_token(&self, headers: &HeaderMap) {
        if let Some(token) = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
        {
            self.tokens_seen.lock().unwrap().push(token.to_string());
        }
    }

    async fn start(&self) -> String {
        let app = Router::new()
            .route("/gmail/v1/users/me/messages", get(gmail_list))
            .route("/gmail/v1/users/me/messages/:id", get(gmail_get))
            .with_state(self.clone());
        serve(app).await
    }
}

async fn gmail_list(State(gmail): State<FakeGmail>, headers: HeaderMap) -> Json<Value> {
    gmail.record_token(&headers);
    let ids: Vec<Value> = gmail
        .messages
        .lock()
        .unwrap()
        .iter()
        .map(|m| json!({"id": m["id"], "threadId": m["threadId"]}))
        .collect();
    Json(json!({"messages": ids, "resultSizeEstimate": ids.len()}))
}

async fn gmail_get(
    State(gmail): State<FakeGmail>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    gmail.record_token(&headers);
    if gmail.broken.lock().unwrap().contains(&id) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let message = gmail
        .messages
        .lock()
        .unwrap()
        .iter()
        .find(|m| m["id"] == id.as_str())
        .cloned();
    match message {
        Some(message) => Json(message).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// =============================================================================
// Fake WhatsApp Graph API
// =============================================================================

/// One request received by the fake Graph API
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub phone_number_id: String,
    pub bearer: String,
    pub body: Value,
}

/// Graph API double: answers 200 unless a status is scripted
#[derive(Clone, Default)]
pub struct FakeGraph {
    pub sent: Arc<Mutex<Vec<SentMessage>>>,
    scripted: Arc<Mutex<VecDeque<u16>>>,
}

impl FakeGraph {
    /// Answer the next calls with these statuses, in order
    pub fn script(&self, statuses: &[u16]) {
        self.scripted.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    async fn start(&self) -> String {
        let app = Router::new()
            .route("/:version/:phone_number_id/messages", post(graph_send))
            .with_state(self.clone());
        serve(app).await
    }
}

async fn graph_send(
    State(graph): State<FakeGraph>,
    Path((_version, phone_number_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    let count = {
        let mut sent = graph.sent.lock().unwrap();
        sent.push(SentMessage {
            phone_number_id,
            bearer,
            body,
        });
        sent.len()
    };

    let status = graph.scripted.lock().unwrap().pop_front().unwrap_or(200);
    let status = StatusCode::from_u16(status).unwrap();
    if status.is_success() {
        return Json(json!({
            "messaging_product": "whatsapp",
            "contacts": [{"input": "+15551234567", "wa_id": "15551234567"}],
            "messages": [{"id": format!("wamid.test{count}")}]
        }))
        .into_response();
    }

    (
        status,
        Json(json!({
            "error": {
                "message": format!("scripted failure {}", status.as_u16()),
                "type": "OAuthException",
                "code": 100
            }
        })),
    )
        .into_response()
}

// =============================================================================
// Test server
// =============================================================================

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub gmail: FakeGmail,
    pub graph: FakeGraph,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_webhook_token(None).await
    }

    pub async fn with_webhook_token(webhook_token: Option<&str>) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let gmail = FakeGmail::default();
        let graph = FakeGraph::default();
        let gmail_url = gmail.start().await;
        let graph_url = graph.start().await;

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                public_origin: None,
            },
            database: config::DatabaseConfig { path: db_path },
            auth: config::AuthConfig {
                session_secret: SESSION_SECRET.to_string(),
                bootstrap_admin_email: Some("admin@example.com".to_string()),
            },
            gmail: config::GmailConfig {
                api_base_url: gmail_url,
                query: "is:unread".to_string(),
                max_results: 10,
                fetch_concurrency: 4,
                webhook_token: webhook_token.map(ToOwned::to_owned),
                listing_window_days: 7,
            },
            whatsapp: config::WhatsAppApiConfig {
                api_base_url: graph_url,
                api_version: "v18.0".to_string(),
                request_timeout_seconds: 5,
            },
            dispatch: config::DispatchConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                ..config::DispatchConfig::default()
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let addr = serve(mailrelay::build_router(state.clone())).await;

        Self {
            addr,
            state,
            gmail,
            graph,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a user and a bearer token for them
    pub async fn create_user(&self, email: &str, role: UserRole) -> (User, String) {
        let now = Utc::now();
        let user = User {
            id: EntityId::new().0,
            email: email.to_string(),
            name: Some("Test User".to_string()),
            role: role.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.state.db.upsert_user(&user).await.unwrap();
        let token = self.token_for(&user);
        (user, token)
    }

    /// Token for the admin created from `auth.bootstrap_admin_email`
    pub async fn admin_token(&self) -> (User, String) {
        let admin = self
            .state
            .db
            .get_user_by_email("admin@example.com")
            .await
            .unwrap()
            .expect("bootstrap admin exists");
        let token = self.token_for(&admin);
        (admin, token)
    }

    pub fn token_for(&self, user: &User) -> String {
        use chrono::Duration;
        use mailrelay::auth::session::{Session, create_session_token};

        let session = Session {
            user_id: user.id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(7),
        };
        create_session_token(&session, SESSION_SECRET).expect("Failed to create test token")
    }

    /// Link a mailbox and a valid WhatsApp config to `user`
    pub async fn connect_user(&self, user: &User, mailbox: &str) {
        let now = Utc::now();
        self.state
            .db
            .upsert_gmail_account(&GmailAccount {
                user_id: user.id.clone(),
                email_address: mailbox.to_string(),
                access_token: "ya29.gmail-token".to_string(),
                last_history_id: None,
                updated_at: now,
            })
            .await
            .unwrap();
        self.state
            .db
            .upsert_whatsapp_config(&WhatsAppConfig {
                user_id: user.id.clone(),
                access_token: "EAAG-graph-token".to_string(),
                phone_number_id: "1234567890".to_string(),
                target_number: "+15551234567".to_string(),
                updated_at: now,
            })
            .await
            .unwrap();
    }

    /// Create a rule through the API, returning its JSON
    pub async fn create_rule(&self, token: &str, name: &str, filter: &str, template: &str) -> Value {
        let response = self
            .client
            .post(self.url("/api/rules"))
            .bearer_auth(token)
            .json(&json!({
                "name": name,
                "subject_filter": filter,
                "message_template": template,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    }

    /// Poll until `check` passes or two seconds elapse
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..40 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

/// Pub/Sub push envelope announcing a change to `mailbox`
pub fn push_body(mailbox: &str, history_id: u64) -> Value {
    let data = STANDARD.encode(
        json!({"emailAddress": mailbox, "historyId": history_id}).to_string(),
    );
    json!({
        "message": {
            "data": data,
            "messageId": "2070443601311540",
            "publishTime": "2024-01-01T00:00:00Z"
        },
        "subscription": "projects/test/subscriptions/gmail-push"
    })
}
