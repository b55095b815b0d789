//! Database-backed settings store.
//!
//! Runtime flags, secrets under rotation, OAuth tokens and the persisted
//! circuit-breaker record all live in the `settings` table so every worker
//! process shares them. Reads go through a per-process cache populated on
//! first read; writes update the row and the local cache. Other processes
//! converge on their next uncached read (`get_fresh`).

use std::collections::HashMap;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Well-known settings keys.
pub mod keys {
    pub const QUEUE_KILL_ALL: &str = "queue.kill_all";
    pub const QUEUE_MAX_ATTEMPTS: &str = "queue.max_attempts";

    pub const HTTP_KILL_SWITCH: &str = "http.kill_switch";
    pub const HTTP_MOCK_MODE: &str = "http.mock_mode";
    pub const HTTP_RETRY_ATTEMPTS: &str = "http.retry_attempts";
    pub const HTTP_REWRITE_RULE: &str = "http.rewrite_rule";
    pub const HTTP_RETRY_REWRITE_ON_404: &str = "http.retry_rewrite_on_404";

    pub const CIRCUIT_BREAKER: &str = "vendor.circuit_breaker";
    pub const VERIFY_TIMEOUT_SECONDS: &str = "vendor.verify_timeout_seconds";

    pub const OAUTH_ACCESS_TOKEN: &str = "oauth_access_token";
    pub const OAUTH_REFRESH_TOKEN: &str = "oauth_refresh_token";
    pub const OAUTH_TOKEN_EXPIRES_AT: &str = "oauth_token_expires_at";
    pub const OAUTH_AUTH_CODE: &str = "oauth_auth_code";
    pub const OAUTH_BUNDLE: &str = "oauth_bundle";

    pub const ADMIN_BEARER_TOKEN: &str = "admin_bearer_token";
    pub const ADMIN_AUTH_DISABLED: &str = "admin.auth_disabled";

    pub const WEBHOOK_ENABLED: &str = "webhook.enabled";
    pub const WEBHOOK_SECRET: &str = "webhook.secret";
    pub const WEBHOOK_VERIFY_POLICY: &str = "webhook.verify_policy";
    pub const WEBHOOK_OPEN_MODE_UNTIL: &str = "webhook.open_mode_until";
    pub const WEBHOOK_QUEUE_HANDOFF: &str = "webhook.queue_handoff";
    pub const WEBHOOK_INLINE: &str = "webhook.inline";
    pub const WEBHOOK_RESPOND_204: &str = "webhook.respond_204";
    pub const WEBHOOK_LAST_VERIFY_WARNING: &str = "webhook.last_verify_warning";

    pub const RUNNER_ENABLED: &str = "runner.enabled";
    pub const RUNNER_CONTINUOUS: &str = "runner.continuous";

    pub const WATCHDOG_AUTO_FIX: &str = "watchdog.auto_fix";
    pub const WATCHDOG_STALE_LOG_SECONDS: &str = "watchdog.stale_log_seconds";
    pub const WATCHDOG_DEGRADE_PENDING: &str = "watchdog.degrade_pending_threshold";
    pub const WATCHDOG_HEALTHY_MINUTES: &str = "watchdog.healthy_minutes";
    pub const WATCHDOG_HEALTHY_SINCE: &str = "watchdog.healthy_since";
    pub const WATCHDOG_BANNER: &str = "watchdog.banner";
    pub const WATCHDOG_LOG_FILE: &str = "watchdog.log_file";
    pub const WATCHDOG_LOCK_FILE: &str = "watchdog.lock_file";
    pub const WATCHDOG_SPAWN_RUNNER: &str = "watchdog.spawn_runner";
    pub const FEATURES_HIGH_RISK_DISABLED: &str = "features.high_risk_disabled";

    pub const RATE_LIMIT_PER_MINUTE: &str = "rate_limit.per_minute";

    /// Suffixes for secrets under rotation overlap.
    pub const PREV_SUFFIX: &str = "_prev";
    pub const PREV_EXPIRES_SUFFIX: &str = "_prev_expires_at";

    pub fn pause_flag(job_type: &str) -> String {
        format!("queue_pause.{}", job_type)
    }

    pub fn concurrency_cap(job_type: &str) -> String {
        format!("queue.max_concurrency.{}", job_type)
    }
}

pub struct SettingsStore {
    pool: PgPool,
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl SettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached read. The first read of a key populates the per-process cache;
    /// subsequent reads are served from memory until a write or `get_fresh`.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.read().await.get(key) {
            return Ok(cached.clone());
        }
        self.get_fresh(key).await
    }

    /// Uncached read straight from the database, refreshing the cache.
    pub async fn get_fresh(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        self.cache.write().await.insert(key.to_string(), None);
        Ok(())
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self
            .get(key)
            .await?
            .map(|v| parse_bool(&v))
            .unwrap_or(default))
    }

    /// Uncached boolean read, for flags flipped by other processes
    /// (pause switches, kill switches).
    pub async fn get_bool_fresh(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self
            .get_fresh(key)
            .await?
            .map(|v| parse_bool(&v))
            .unwrap_or(default))
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub async fn get_i64_fresh(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get_fresh(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" }).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_fresh(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?).await
    }

    /// Read the canonical key, then fall back through aliases in order and
    /// finally an environment variable. Used by the OAuth manager, where
    /// legacy deployments stored tokens under dot-form keys or a JSON bundle.
    pub async fn get_with_aliases(
        &self,
        canonical: &str,
        aliases: &[&str],
        env_var: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(v) = self.get(canonical).await? {
            return Ok(Some(v));
        }
        for alias in aliases {
            if let Some(v) = self.get(alias).await? {
                return Ok(Some(v));
            }
        }
        Ok(env_var.and_then(|name| std::env::var(name).ok()))
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_forms() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_bool(v), "{v} should parse true");
        }
        for v in ["0", "false", "off", "", "no", "maybe"] {
            assert!(!parse_bool(v), "{v} should parse false");
        }
    }

    #[test]
    fn pause_and_cap_keys_embed_the_type() {
        assert_eq!(keys::pause_flag("sync_product"), "queue_pause.sync_product");
        assert_eq!(
            keys::concurrency_cap("webhook.event"),
            "queue.max_concurrency.webhook.event"
        );
    }
}
