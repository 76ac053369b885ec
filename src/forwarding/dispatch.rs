//! Dispatch coordinator
//!
//! Sends one (email, rule) pair through the delivery transport at most
//! once. The ledger claim is what makes repeated notifications and
//! concurrent runs safe: whoever acquires the key does the work, everyone
//! else gets the recorded attempt back untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;

use super::store::{DeliveryLedger, RuleStore};
use super::template::{TemplateFields, render_with_limit};
use crate::config::DispatchConfig;
use crate::data::{DeliveryAttempt, DeliveryClaim, DeliveryStatus, ForwardingRule, WhatsAppConfig};
use crate::error::AppError;
use crate::mail::Email;
use crate::metrics::{DISPATCHES_TOTAL, observe_transport_call};
use crate::whatsapp::{DeliveryTransport, TransportError, WhatsAppCredentials, validate_config};

/// Retry, timeout and rendering policy for dispatches
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub transport_timeout: Duration,
    pub lease: Duration,
    pub max_body_chars: usize,
}

impl From<&DispatchConfig> for DispatchPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            transport_timeout: config.transport_timeout(),
            lease: config.lease(),
            max_body_chars: config.max_body_chars,
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl DispatchPolicy {
    /// Exponential delay before retrying after attempt `attempt` (1-based),
    /// without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay actually slept: base plus up to 10% jitter, raised to the
    /// provider's `Retry-After`, never above `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter_cap = (base.as_millis() / 10) as u64;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        (base + jitter)
            .max(retry_after.unwrap_or_default())
            .min(self.max_backoff)
    }
}

/// Result of one dispatch call
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Ledger state after the call
    pub attempt: DeliveryAttempt,
    /// False when the key was already handled or owned by another run
    pub performed: bool,
}

impl DispatchOutcome {
    pub fn status(&self) -> DeliveryStatus {
        self.attempt.status
    }
}

/// Delivers matched emails, with idempotency and retries
pub struct Dispatcher {
    store: Arc<dyn RuleStore>,
    ledger: Arc<dyn DeliveryLedger>,
    transport: Arc<dyn DeliveryTransport>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RuleStore>,
        ledger: Arc<dyn DeliveryLedger>,
        transport: Arc<dyn DeliveryTransport>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            transport,
            policy,
        }
    }

    /// Deliver `email` for `rule` unless that pair was already handled.
    ///
    /// Transport failures end up in the returned attempt, not in `Err`.
    /// `Err` means the ledger or store could not be used.
    #[tracing::instrument(skip_all, fields(email_id = %email.id, rule_id = %rule.id))]
    pub async fn dispatch(
        &self,
        email: &Email,
        rule: &ForwardingRule,
    ) -> Result<DispatchOutcome, AppError> {
        let mut attempt = match self
            .ledger
            .claim(&email.id, &rule.id, self.policy.lease)
            .await?
        {
            DeliveryClaim::Acquired(attempt) => attempt,
            DeliveryClaim::Held(attempt) => {
                tracing::debug!(status = attempt.status.as_str(), "Delivery already handled");
                DISPATCHES_TOTAL.with_label_values(&["skipped"]).inc();
                return Ok(DispatchOutcome {
                    attempt,
                    performed: false,
                });
            }
        };

        let config = match self.store.whatsapp_config(&rule.owner_user_id).await {
            Ok(config) => config,
            Err(e) => {
                attempt.status = DeliveryStatus::FailedRetryable;
                attempt.last_error = Some(e.to_string());
                attempt.updated_at = Utc::now();
                self.ledger.release(&attempt).await?;
                DISPATCHES_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        let config = match usable_config(config) {
            Ok(config) => config,
            Err(reason) => {
                tracing::warn!(owner = %rule.owner_user_id, %reason, "Cannot deliver");
                return self
                    .finish(attempt, DeliveryStatus::FailedPermanent, Some(reason), None)
                    .await;
            }
        };

        let text = render_with_limit(
            &rule.message_template,
            &TemplateFields {
                subject: &email.subject,
                from: &email.sender,
                body: &email.body,
            },
            self.policy.max_body_chars,
        );
        let credentials = WhatsAppCredentials::from(&config);

        while attempt.attempt_count < i64::from(self.policy.max_attempts) {
            attempt.attempt_count += 1;
            let attempt_number = attempt.attempt_count as u32;

            match self.send_once(&config.target_number, &text, &credentials).await {
                Ok(message_id) => {
                    tracing::info!(attempts = attempt_number, "Email forwarded");
                    return self
                        .finish(attempt, DeliveryStatus::Sent, None, message_id)
                        .await;
                }
                Err(TransportError::Permanent { detail }) => {
                    tracing::warn!(attempts = attempt_number, error = %detail, "Delivery rejected");
                    return self
                        .finish(attempt, DeliveryStatus::FailedPermanent, Some(detail), None)
                        .await;
                }
                Err(TransportError::Transient {
                    detail,
                    retry_after,
                }) => {
                    if attempt_number >= self.policy.max_attempts {
                        tracing::warn!(attempts = attempt_number, error = %detail, "Giving up on delivery");
                        let reason = format!("gave up after {attempt_number} attempts: {detail}");
                        return self
                            .finish(attempt, DeliveryStatus::FailedPermanent, Some(reason), None)
                            .await;
                    }

                    attempt.status = DeliveryStatus::FailedRetryable;
                    attempt.last_error = Some(detail);
                    attempt.updated_at = Utc::now();
                    self.ledger.record(&attempt, self.policy.lease).await?;

                    let delay = self.policy.backoff_delay(attempt_number, retry_after);
                    tracing::debug!(
                        attempts = attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        error = attempt.last_error.as_deref().unwrap_or_default(),
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Reclaimed after a crash with the retry budget already spent
        let reason = attempt
            .last_error
            .take()
            .unwrap_or_else(|| "retry budget exhausted".to_string());
        self.finish(attempt, DeliveryStatus::FailedPermanent, Some(reason), None)
            .await
    }

    /// One transport call under the per-call timeout.
    async fn send_once(
        &self,
        target_number: &str,
        text: &str,
        credentials: &WhatsAppCredentials,
    ) -> Result<Option<String>, TransportError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.policy.transport_timeout,
            self.transport.send(target_number, text, credentials),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::transient(format!(
                "transport call timed out after {}s",
                self.policy.transport_timeout.as_secs_f64()
            )))
        });

        let label = match &result {
            Ok(_) => "success",
            Err(TransportError::Transient { .. }) => "transient",
            Err(TransportError::Permanent { .. }) => "permanent",
        };
        observe_transport_call(label, started.elapsed());

        result.map(|receipt| receipt.message_id)
    }

    /// Write a terminal state and build the outcome.
    async fn finish(
        &self,
        mut attempt: DeliveryAttempt,
        status: DeliveryStatus,
        last_error: Option<String>,
        provider_message_id: Option<String>,
    ) -> Result<DispatchOutcome, AppError> {
        attempt.status = status;
        attempt.last_error = last_error;
        attempt.provider_message_id = provider_message_id;
        attempt.updated_at = Utc::now();
        self.ledger.record(&attempt, self.policy.lease).await?;

        DISPATCHES_TOTAL.with_label_values(&[status.as_str()]).inc();
        Ok(DispatchOutcome {
            attempt,
            performed: true,
        })
    }
}

fn usable_config(config: Option<WhatsAppConfig>) -> Result<WhatsAppConfig, String> {
    let config = config.ok_or_else(|| "WhatsApp is not configured for this user".to_string())?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Database, EntityId, User, UserRole};
    use crate::whatsapp::{DeliveryReceipt, MockDeliveryTransport};
    use async_trait::async_trait;
    use mockall::Sequence;
    use tempfile::TempDir;

    fn test_policy() -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            transport_timeout: Duration::from_secs(2),
            lease: Duration::from_secs(60),
            max_body_chars: 500,
        }
    }

    async fn setup(target_number: &str) -> (Arc<Database>, ForwardingRule, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let now = Utc::now();

        let user = User {
            id: EntityId::new().0,
            email: "owner@example.com".to_string(),
            name: None,
            role: UserRole::User.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        db.upsert_user(&user).await.unwrap();

        db.upsert_whatsapp_config(&WhatsAppConfig {
            user_id: user.id.clone(),
            access_token: "EAAG-token".to_string(),
            phone_number_id: "1234567890".to_string(),
            target_number: target_number.to_string(),
            updated_at: now,
        })
        .await
        .unwrap();

        let rule = ForwardingRule {
            id: EntityId::new().0,
            owner_user_id: user.id.clone(),
            name: "Urgent".to_string(),
            subject_filter: "URGENT".to_string(),
            message_template: "Alert: {subject} from {from}".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        db.insert_rule(&rule).await.unwrap();

        (Arc::new(db), rule, temp_dir)
    }

    fn email() -> Email {
        Email {
            id: "msg-1".to_string(),
            subject: "URGENT: server down".to_string(),
            sender: "ops@x.com".to_string(),
            body: "disk full".to_string(),
            received_at: Utc::now(),
        }
    }

    fn dispatcher(db: &Arc<Database>, transport: MockDeliveryTransport) -> Dispatcher {
        Dispatcher::new(db.clone(), db.clone(), Arc::new(transport), test_policy())
    }

    #[tokio::test]
    async fn sends_rendered_message_once() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        transport
            .expect_send()
            .withf(|target, text, credentials| {
                target == "+15551234567"
                    && text == "Alert: URGENT: server down from ops@x.com"
                    && credentials.phone_number_id == "1234567890"
                    && credentials.access_token == "EAAG-token"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(DeliveryReceipt {
                    message_id: Some("wamid.1".to_string()),
                })
            });
        let dispatcher = dispatcher(&db, transport);

        let first = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert!(first.performed);
        assert_eq!(first.status(), DeliveryStatus::Sent);
        assert_eq!(first.attempt.attempt_count, 1);
        assert_eq!(first.attempt.provider_message_id.as_deref(), Some("wamid.1"));

        // Second notification for the same email: no transport call
        let second = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert!(!second.performed);
        assert_eq!(second.status(), DeliveryStatus::Sent);

        let stored = db
            .get_delivery_attempt("msg-1", &rule.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn concurrent_dispatches_send_once() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _, _| Ok(DeliveryReceipt::default()));
        let dispatcher = dispatcher(&db, transport);
        let email = email();

        let (a, b) = tokio::join!(
            dispatcher.dispatch(&email, &rule),
            dispatcher.dispatch(&email, &rule)
        );
        let performed = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|outcome| outcome.performed)
            .count();
        assert_eq!(performed, 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retries() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        transport.expect_send().times(3).returning(|_, _, _| {
            Err(TransportError::transient("WhatsApp API returned HTTP 503"))
        });
        let dispatcher = dispatcher(&db, transport);

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(outcome.status(), DeliveryStatus::FailedPermanent);
        assert_eq!(outcome.attempt.attempt_count, 3);
        assert!(outcome.attempt.last_error.unwrap().contains("HTTP 503"));

        // Terminal: a later notification does not retry
        let again = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert!(!again.performed);
        assert_eq!(again.attempt.attempt_count, 3);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Err(TransportError::Transient {
                    detail: "rate limited".to_string(),
                    retry_after: Some(Duration::from_millis(2)),
                })
            });
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(DeliveryReceipt::default()));
        let dispatcher = dispatcher(&db, transport);

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(outcome.status(), DeliveryStatus::Sent);
        assert_eq!(outcome.attempt.attempt_count, 2);
        assert_eq!(outcome.attempt.last_error, None);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _, _| Err(TransportError::permanent("HTTP 400: invalid recipient")));
        let dispatcher = dispatcher(&db, transport);

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(outcome.status(), DeliveryStatus::FailedPermanent);
        assert_eq!(outcome.attempt.attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_target_number_never_calls_transport() {
        let (db, rule, _temp_dir) = setup("").await;
        let mut transport = MockDeliveryTransport::new();
        transport.expect_send().never();
        let dispatcher = dispatcher(&db, transport);

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(outcome.status(), DeliveryStatus::FailedPermanent);
        assert_eq!(outcome.attempt.attempt_count, 0);
        assert!(outcome.attempt.last_error.unwrap().contains("target number"));
    }

    #[tokio::test]
    async fn missing_config_never_calls_transport() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        db.delete_whatsapp_config(&rule.owner_user_id).await.unwrap();
        let mut transport = MockDeliveryTransport::new();
        transport.expect_send().never();
        let dispatcher = dispatcher(&db, transport);

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(outcome.status(), DeliveryStatus::FailedPermanent);
    }

    struct UnavailableStore;

    #[async_trait]
    impl RuleStore for UnavailableStore {
        async fn load_active_rules(
            &self,
            _owner_user_id: Option<&str>,
        ) -> Result<Vec<ForwardingRule>, AppError> {
            Err(AppError::StoreUnavailable("down".to_string()))
        }

        async fn whatsapp_config(&self, _user_id: &str) -> Result<Option<WhatsAppConfig>, AppError> {
            Err(AppError::StoreUnavailable("down".to_string()))
        }

        async fn gmail_account_by_address(
            &self,
            _email_address: &str,
        ) -> Result<Option<crate::data::GmailAccount>, AppError> {
            Err(AppError::StoreUnavailable("down".to_string()))
        }

        async fn record_history_id(&self, _user_id: &str, _history_id: &str) -> Result<(), AppError> {
            Err(AppError::StoreUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn store_error_releases_claim_for_retry() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let mut transport = MockDeliveryTransport::new();
        transport.expect_send().never();
        let dispatcher = Dispatcher::new(
            Arc::new(UnavailableStore),
            db.clone(),
            Arc::new(transport),
            test_policy(),
        );

        let result = dispatcher.dispatch(&email(), &rule).await;
        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));

        let stored = db
            .get_delivery_attempt("msg-1", &rule.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeliveryStatus::FailedRetryable);

        // Released: the next run can claim it immediately
        let claim = db
            .claim_delivery_attempt("msg-1", &rule.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(claim, DeliveryClaim::Acquired(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DispatchPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
            ..test_policy()
        };
        assert_eq!(policy.base_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.base_backoff(10), Duration::from_millis(8_000));
        assert_eq!(policy.base_backoff(u32::MAX), Duration::from_millis(8_000));
    }

    #[test]
    fn backoff_jitter_and_retry_after_stay_within_cap() {
        let policy = DispatchPolicy {
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(8_000),
            ..test_policy()
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(1, None);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_100));
        }
        assert_eq!(
            policy.backoff_delay(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.backoff_delay(1, Some(Duration::from_secs(60))),
            Duration::from_millis(8_000)
        );
    }

    /// Never answers within the dispatch timeout
    struct HangingTransport {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DeliveryTransport for HangingTransport {
        async fn send(
            &self,
            _target_number: &str,
            _message_text: &str,
            _credentials: &WhatsAppCredentials,
        ) -> Result<DeliveryReceipt, TransportError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DeliveryReceipt::default())
        }
    }

    #[tokio::test]
    async fn transport_timeouts_are_retried_then_given_up() {
        let (db, rule, _temp_dir) = setup("+15551234567").await;
        let transport = Arc::new(HangingTransport {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(
            db.clone(),
            db.clone(),
            transport.clone(),
            DispatchPolicy {
                transport_timeout: Duration::from_millis(20),
                ..test_policy()
            },
        );

        let outcome = dispatcher.dispatch(&email(), &rule).await.unwrap();
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(outcome.status(), DeliveryStatus::FailedPermanent);
        assert_eq!(outcome.attempt.attempt_count, 3);

        let stored = db
            .get_delivery_attempt("msg-1", &rule.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeliveryStatus::FailedPermanent);
        assert_eq!(stored.attempt_count, 3);
        let error = stored.last_error.unwrap();
        assert!(error.starts_with("gave up after 3 attempts"), "{error}");
        assert!(error.contains("timed out"), "{error}");
    }
}
