//! SQLite database operations
//!
//! All database access goes through this module.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use super::models::*;
use crate::error::AppError;

const DELIVERY_ATTEMPT_COLUMNS: &str = "email_id, rule_id, status, attempt_count, last_error, \
     provider_message_id, created_at, updated_at";

fn lease_deadline_millis(now: DateTime<Utc>, lease: Duration) -> i64 {
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(lease_ms)
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Insert or update a user by ID
    pub async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, role, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                role = excluded.role,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.role)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get user by ID
    pub async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Get user by email address
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// List all users, newest first
    pub async fn list_users(&self) -> Result<Vec<User>, AppError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await?;

        Ok(users)
    }

    /// Change a user's role. Returns false if the user does not exist.
    pub async fn update_user_role(&self, id: &str, role: UserRole) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a user and everything they own. Returns false if absent.
    pub async fn delete_user(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Gmail accounts
    // =========================================================================

    /// Link (or relink) a mailbox to a user
    pub async fn upsert_gmail_account(&self, account: &GmailAccount) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO gmail_accounts (user_id, email_address, access_token, last_history_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                email_address = excluded.email_address,
                access_token = excluded.access_token,
                last_history_id = excluded.last_history_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.user_id)
        .bind(&account.email_address)
        .bind(&account.access_token)
        .bind(&account.last_history_id)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the mailbox linked to a user
    pub async fn get_gmail_account(&self, user_id: &str) -> Result<Option<GmailAccount>, AppError> {
        let account =
            sqlx::query_as::<_, GmailAccount>("SELECT * FROM gmail_accounts WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(account)
    }

    /// Find the mailbox a push notification refers to (case-insensitive)
    pub async fn get_gmail_account_by_address(
        &self,
        email_address: &str,
    ) -> Result<Option<GmailAccount>, AppError> {
        let account = sqlx::query_as::<_, GmailAccount>(
            "SELECT * FROM gmail_accounts WHERE email_address = ? COLLATE NOCASE",
        )
        .bind(email_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Remember the latest history ID announced for a mailbox
    pub async fn update_gmail_history_id(
        &self,
        user_id: &str,
        history_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE gmail_accounts SET last_history_id = ?, updated_at = ? WHERE user_id = ?")
            .bind(history_id)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Unlink a user's mailbox. Returns false if none was linked.
    pub async fn delete_gmail_account(&self, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM gmail_accounts WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Forwarding rules
    // =========================================================================

    /// Insert a new rule
    pub async fn insert_rule(&self, rule: &ForwardingRule) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO forwarding_rules (
                id, owner_user_id, name, subject_filter, message_template,
                is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.owner_user_id)
        .bind(&rule.name)
        .bind(&rule.subject_filter)
        .bind(&rule.message_template)
        .bind(rule.is_active)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get rule by ID
    pub async fn get_rule(&self, id: &str) -> Result<Option<ForwardingRule>, AppError> {
        let rule = sqlx::query_as::<_, ForwardingRule>("SELECT * FROM forwarding_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(rule)
    }

    /// List a user's rules in creation order
    pub async fn list_rules_for_user(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<ForwardingRule>, AppError> {
        let rules = sqlx::query_as::<_, ForwardingRule>(
            "SELECT * FROM forwarding_rules WHERE owner_user_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    /// List every rule in creation order
    pub async fn list_all_rules(&self) -> Result<Vec<ForwardingRule>, AppError> {
        let rules = sqlx::query_as::<_, ForwardingRule>(
            "SELECT * FROM forwarding_rules ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    /// List active rules, optionally for one owner, oldest first
    pub async fn list_active_rules(
        &self,
        owner_user_id: Option<&str>,
    ) -> Result<Vec<ForwardingRule>, AppError> {
        let rules = match owner_user_id {
            Some(owner) => {
                sqlx::query_as::<_, ForwardingRule>(
                    r#"
                    SELECT * FROM forwarding_rules
                    WHERE is_active = 1 AND owner_user_id = ?
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ForwardingRule>(
                    "SELECT * FROM forwarding_rules WHERE is_active = 1 ORDER BY created_at ASC, id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rules)
    }

    /// Overwrite a rule's editable fields. Returns false if absent.
    pub async fn update_rule(&self, rule: &ForwardingRule) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE forwarding_rules
            SET name = ?, subject_filter = ?, message_template = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.name)
        .bind(&rule.subject_filter)
        .bind(&rule.message_template)
        .bind(rule.is_active)
        .bind(rule.updated_at)
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Toggle a rule on or off. Returns false if absent.
    pub async fn set_rule_active(&self, id: &str, is_active: bool) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE forwarding_rules SET is_active = ?, updated_at = ? WHERE id = ?")
                .bind(is_active)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a rule. Returns false if absent.
    pub async fn delete_rule(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM forwarding_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // WhatsApp configs
    // =========================================================================

    /// Store a user's WhatsApp credentials and destination
    pub async fn upsert_whatsapp_config(&self, config: &WhatsAppConfig) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_configs (user_id, access_token, phone_number_id, target_number, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                phone_number_id = excluded.phone_number_id,
                target_number = excluded.target_number,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.user_id)
        .bind(&config.access_token)
        .bind(&config.phone_number_id)
        .bind(&config.target_number)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a user's WhatsApp config
    pub async fn get_whatsapp_config(
        &self,
        user_id: &str,
    ) -> Result<Option<WhatsAppConfig>, AppError> {
        let config =
            sqlx::query_as::<_, WhatsAppConfig>("SELECT * FROM whatsapp_configs WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(config)
    }

    /// Remove a user's WhatsApp config. Returns false if none existed.
    pub async fn delete_whatsapp_config(&self, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM whatsapp_configs WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Delivery attempts
    // =========================================================================

    /// Get the delivery record for one (email, rule) pair
    pub async fn get_delivery_attempt(
        &self,
        email_id: &str,
        rule_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        let query = format!(
            "SELECT {DELIVERY_ATTEMPT_COLUMNS} FROM delivery_attempts WHERE email_id = ? AND rule_id = ?"
        );
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(email_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(attempt)
    }

    /// Try to take ownership of an (email, rule) delivery.
    ///
    /// A single statement inserts a fresh `pending` row, or takes over a
    /// `pending`/`failed_retryable` row whose lease has expired. Rows that
    /// are `sent`, `failed_permanent` or still leased are left untouched
    /// and returned as [`DeliveryClaim::Held`].
    pub async fn claim_delivery_attempt(
        &self,
        email_id: &str,
        rule_id: &str,
        lease: Duration,
    ) -> Result<DeliveryClaim, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                email_id, rule_id, status, attempt_count, last_error,
                provider_message_id, lease_expires_at, created_at, updated_at
            ) VALUES (?, ?, 'pending', 0, NULL, NULL, ?, ?, ?)
            ON CONFLICT(email_id, rule_id) DO UPDATE SET
                status = 'pending',
                lease_expires_at = excluded.lease_expires_at,
                updated_at = excluded.updated_at
            WHERE delivery_attempts.status IN ('pending', 'failed_retryable')
              AND delivery_attempts.lease_expires_at <= ?
            "#,
        )
        .bind(email_id)
        .bind(rule_id)
        .bind(lease_deadline_millis(now, lease))
        .bind(now)
        .bind(now)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let attempt = self
            .get_delivery_attempt(email_id, rule_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "delivery attempt {email_id}/{rule_id} vanished after claim"
                ))
            })?;

        if result.rows_affected() == 1 {
            Ok(DeliveryClaim::Acquired(attempt))
        } else {
            Ok(DeliveryClaim::Held(attempt))
        }
    }

    /// Persist the current state of a claimed delivery.
    ///
    /// Terminal states release the lease; `pending` and `failed_retryable`
    /// extend it by `lease` from now.
    pub async fn record_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
        lease: Duration,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let lease_expires_at = if attempt.status.is_terminal() {
            0
        } else {
            lease_deadline_millis(now, lease)
        };

        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = ?, attempt_count = ?, last_error = ?, provider_message_id = ?,
                lease_expires_at = ?, updated_at = ?
            WHERE email_id = ? AND rule_id = ? AND status != 'sent'
            "#,
        )
        .bind(attempt.status)
        .bind(attempt.attempt_count)
        .bind(&attempt.last_error)
        .bind(&attempt.provider_message_id)
        .bind(lease_expires_at)
        .bind(attempt.updated_at)
        .bind(&attempt.email_id)
        .bind(&attempt.rule_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "delivery attempt {}/{} is missing or already sent",
                attempt.email_id,
                attempt.rule_id
            )));
        }

        Ok(())
    }

    /// Give up ownership without reaching a terminal state
    pub async fn release_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
    ) -> Result<(), AppError> {
        self.record_delivery_attempt(attempt, Duration::ZERO).await
    }

    /// Delete `sent` and `failed_permanent` records last touched before `cutoff`.
    ///
    /// Returns the number of rows removed. Pending and retryable rows are kept.
    pub async fn prune_delivery_attempts(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM delivery_attempts WHERE status IN ('sent', 'failed_permanent') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Most recent delivery record for a rule
    pub async fn latest_delivery_for_rule(
        &self,
        rule_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        let query = format!(
            "SELECT {DELIVERY_ATTEMPT_COLUMNS} FROM delivery_attempts WHERE rule_id = ? ORDER BY updated_at DESC LIMIT 1"
        );
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(attempt)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Aggregate counts for the admin dashboard
    pub async fn get_stats(&self) -> Result<DatabaseStats, AppError> {
        let signup_cutoff = Utc::now() - chrono::Duration::days(7);

        let (total_users, recent_signups) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0) FROM users",
        )
        .bind(signup_cutoff)
        .fetch_one(&self.pool)
        .await?;

        let (total_rules, active_rules) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM forwarding_rules",
        )
        .fetch_one(&self.pool)
        .await?;

        let (deliveries_sent, deliveries_failed) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed_permanent' THEN 1 ELSE 0 END), 0)
            FROM delivery_attempts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            total_users,
            total_rules,
            active_rules,
            recent_signups,
            deliveries_sent,
            deliveries_failed,
        })
    }

    #[cfg(test)]
    pub(crate) async fn expire_delivery_lease_for_test(
        &self,
        email_id: &str,
        rule_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_attempts SET lease_expires_at = 0 WHERE email_id = ? AND rule_id = ?",
        )
        .bind(email_id)
        .bind(rule_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
