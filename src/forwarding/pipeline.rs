//! Forwarding pipeline
//!
//! One run per push notification: resolve the mailbox, load its owner's
//! active rules, fetch new mail, match, and dispatch every matched pair
//! with bounded concurrency.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use super::dispatch::Dispatcher;
use super::matcher::match_rules;
use super::store::RuleStore;
use crate::data::{DeliveryStatus, ForwardingRule};
use crate::error::AppError;
use crate::mail::{Email, MailboxNotification, NotificationIntake, decode_notification};
use crate::metrics::NOTIFICATIONS_RECEIVED_TOTAL;

/// Counts for one pipeline run
///
/// `dispatches_attempted` is always `sent + failed + skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    /// Mailbox named by the notification
    pub mailbox: String,
    pub emails_processed: usize,
    pub fetch_failures: usize,
    pub dispatches_attempted: usize,
    pub dispatches_sent: usize,
    pub dispatches_failed: usize,
    /// Pairs already handled by an earlier or concurrent run
    pub dispatches_skipped: usize,
}

pub struct Pipeline {
    store: Arc<dyn RuleStore>,
    intake: NotificationIntake,
    dispatcher: Dispatcher,
    dispatch_concurrency: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RuleStore>,
        intake: NotificationIntake,
        dispatcher: Dispatcher,
        dispatch_concurrency: usize,
    ) -> Self {
        Self {
            store,
            intake,
            dispatcher,
            dispatch_concurrency: dispatch_concurrency.max(1),
        }
    }

    /// Decode a raw push body and run the pipeline for it.
    ///
    /// # Errors
    /// - [`AppError::MalformedNotification`] if the body cannot be decoded
    /// - [`AppError::StoreUnavailable`] if rules cannot be loaded
    /// - [`AppError::ProviderFetch`] if messages cannot be listed
    pub async fn process_notification(&self, raw: &[u8]) -> Result<PipelineSummary, AppError> {
        let notification = match decode_notification(raw) {
            Ok(notification) => notification,
            Err(e) => {
                NOTIFICATIONS_RECEIVED_TOTAL
                    .with_label_values(&["malformed"])
                    .inc();
                return Err(e);
            }
        };

        let result = self.process(&notification).await;
        let outcome = if result.is_ok() { "processed" } else { "failed" };
        NOTIFICATIONS_RECEIVED_TOTAL
            .with_label_values(&[outcome])
            .inc();
        result
    }

    /// Run the pipeline for an already-decoded notification.
    #[tracing::instrument(skip_all, fields(mailbox = %notification.email_address, history_id = %notification.history_id))]
    pub async fn process(
        &self,
        notification: &MailboxNotification,
    ) -> Result<PipelineSummary, AppError> {
        let mut summary = PipelineSummary {
            mailbox: notification.email_address.clone(),
            ..Default::default()
        };

        let Some(account) = self
            .store
            .gmail_account_by_address(&notification.email_address)
            .await?
        else {
            tracing::warn!("Notification for a mailbox with no linked account");
            return Ok(summary);
        };

        // Operator-facing only; intake does not page by history
        if let Err(e) = self
            .store
            .record_history_id(&account.user_id, &notification.history_id)
            .await
        {
            tracing::warn!(error = %e, "Failed to record history id");
        }

        let rules = self.store.load_active_rules(Some(&account.user_id)).await?;
        if rules.is_empty() {
            tracing::debug!("No active rules, skipping fetch");
            return Ok(summary);
        }

        let batch = self.intake.intake(&account).await?;
        summary.emails_processed = batch.emails.len();
        summary.fetch_failures = batch.failures.len();

        let pairs = matched_pairs(&batch.emails, &rules);
        summary.dispatches_attempted = pairs.len();

        let dispatcher = &self.dispatcher;
        let outcomes: Vec<_> = stream::iter(pairs)
            .map(|(email, rule)| async move {
                let outcome = dispatcher.dispatch(&email, &rule).await;
                (email, rule, outcome)
            })
            .buffer_unordered(self.dispatch_concurrency)
            .collect()
            .await;

        for (email, rule, outcome) in outcomes {
            match outcome {
                Ok(outcome) if !outcome.performed => summary.dispatches_skipped += 1,
                Ok(outcome) if outcome.status() == DeliveryStatus::Sent => {
                    summary.dispatches_sent += 1
                }
                Ok(_) => summary.dispatches_failed += 1,
                Err(e) => {
                    tracing::error!(
                        email_id = %email.id,
                        rule_id = %rule.id,
                        error = %e,
                        "Dispatch failed"
                    );
                    summary.dispatches_failed += 1;
                }
            }
        }

        tracing::info!(
            emails = summary.emails_processed,
            fetch_failures = summary.fetch_failures,
            sent = summary.dispatches_sent,
            failed = summary.dispatches_failed,
            skipped = summary.dispatches_skipped,
            "Notification processed"
        );

        Ok(summary)
    }
}

/// Every (email, rule) pair to dispatch, emails in listing order.
///
/// Pairs are owned so the dispatch futures stay `Send` for spawned runs.
fn matched_pairs(emails: &[Email], rules: &[ForwardingRule]) -> Vec<(Email, ForwardingRule)> {
    emails
        .iter()
        .flat_map(|email| {
            match_rules(email, rules)
                .into_iter()
                .map(move |rule| (email.clone(), rule.clone()))
        })
        .collect()
}
