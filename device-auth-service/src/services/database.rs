//! PostgreSQL persistence for devices, tokens and security events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use uuid::Uuid;

use crate::models::{AuthToken, DeviceRegistration, SecurityEvent, TokenRegistryEntry};
use crate::services::{DeviceStore, SecurityEventStore, TokenStore};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                anyhow::anyhow!("Database health check failed: {}", e)
            })?;
        Ok(())
    }
}

async fn insert_token_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    token: &AuthToken,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO auth_tokens
            (token_id, user_id, device_id, token_hash, kind, abilities, created_at, expires_at, last_used_at, revoked)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(token.token_id)
    .bind(token.user_id)
    .bind(&token.device_id)
    .bind(&token.token_hash)
    .bind(&token.kind)
    .bind(&token.abilities)
    .bind(token.created_at)
    .bind(token.expires_at)
    .bind(token.last_used_at)
    .bind(token.revoked)
    .execute(&mut **tx)
    .await
    .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[async_trait]
impl DeviceStore for Database {
    async fn insert_device(&self, device: &DeviceRegistration) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO device_registrations
                (user_id, device_id, device_info, device_secret, is_trusted, registered_at, trusted_at, trusted_until, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, device_id) DO NOTHING
            "#,
        )
        .bind(device.user_id)
        .bind(&device.device_id)
        .bind(&device.device_info)
        .bind(&device.device_secret)
        .bind(device.is_trusted)
        .bind(device.registered_at)
        .bind(device.trusted_at)
        .bind(device.trusted_until)
        .bind(device.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error> {
        sqlx::query_as::<_, DeviceRegistration>(
            "SELECT * FROM device_registrations WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn find_device_by_id(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceRegistration>, anyhow::Error> {
        sqlx::query_as::<_, DeviceRegistration>(
            r#"
            SELECT * FROM device_registrations
            WHERE device_id = $1
            ORDER BY registered_at DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRegistration>, anyhow::Error> {
        sqlx::query_as::<_, DeviceRegistration>(
            "SELECT * FROM device_registrations WHERE user_id = $1 ORDER BY registered_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn count_devices(&self, user_id: Uuid) -> Result<i64, anyhow::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM device_registrations WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn count_registered_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM device_registrations WHERE user_id = $1 AND registered_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn set_trust(
        &self,
        user_id: Uuid,
        device_id: &str,
        is_trusted: bool,
        trusted_at: Option<DateTime<Utc>>,
        trusted_until: Option<DateTime<Utc>>,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE device_registrations
            SET is_trusted = $3, trusted_at = $4, trusted_until = $5
            WHERE user_id = $1 AND device_id = $2
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(is_trusted)
        .bind(trusted_at)
        .bind(trusted_until)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_device(&self, user_id: Uuid, device_id: &str) -> Result<(), anyhow::Error> {
        sqlx::query(
            "UPDATE device_registrations SET last_used_at = NOW() WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    async fn delete_device(&self, user_id: Uuid, device_id: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "DELETE FROM device_registrations WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TokenStore for Database {
    async fn insert_token(&self, token: &AuthToken) -> Result<(), anyhow::Error> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow::anyhow!(e))?;
        insert_token_tx(&mut tx, token).await?;
        tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<AuthToken>, anyhow::Error> {
        sqlx::query_as::<_, AuthToken>("SELECT * FROM auth_tokens WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn touch_token(&self, token_id: Uuid) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE auth_tokens SET last_used_at = NOW() WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    async fn find_registry_entry(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<TokenRegistryEntry>, anyhow::Error> {
        sqlx::query_as::<_, TokenRegistryEntry>(
            "SELECT * FROM token_registry WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))
    }

    async fn supersede_pair(
        &self,
        entry: &TokenRegistryEntry,
        access: &AuthToken,
        refresh: &AuthToken,
        expected_prior: Option<(Uuid, Uuid)>,
    ) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow::anyhow!(e))?;

        // Row lock serializes concurrent supersessions for the same device
        let prior = sqlx::query_as::<_, TokenRegistryEntry>(
            "SELECT * FROM token_registry WHERE user_id = $1 AND device_id = $2 FOR UPDATE",
        )
        .bind(entry.user_id)
        .bind(&entry.device_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

        if let Some(expected) = expected_prior {
            match &prior {
                Some(p) if (p.access_token_id, p.refresh_token_id) == expected => {}
                _ => {
                    tx.rollback().await.map_err(|e| anyhow::anyhow!(e))?;
                    return Ok(false);
                }
            }
        }

        if let Some(p) = &prior {
            sqlx::query("UPDATE auth_tokens SET revoked = TRUE WHERE token_id = ANY($1)")
                .bind(vec![p.access_token_id, p.refresh_token_id])
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }

        insert_token_tx(&mut tx, access).await?;
        insert_token_tx(&mut tx, refresh).await?;

        sqlx::query(
            r#"
            INSERT INTO token_registry (user_id, device_id, access_token_id, refresh_token_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                access_token_id = EXCLUDED.access_token_id,
                refresh_token_id = EXCLUDED.refresh_token_id,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.device_id)
        .bind(entry.access_token_id)
        .bind(entry.refresh_token_id)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
        Ok(true)
    }

    async fn revoke_device_tokens(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<u64, anyhow::Error> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow::anyhow!(e))?;

        sqlx::query("DELETE FROM token_registry WHERE user_id = $1 AND device_id = $2")
            .bind(user_id)
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let result = sqlx::query(
            "UPDATE auth_tokens SET revoked = TRUE WHERE user_id = $1 AND device_id = $2 AND NOT revoked",
        )
        .bind(user_id)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_tokens(&self, user_id: Uuid) -> Result<u64, anyhow::Error> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow::anyhow!(e))?;

        sqlx::query("DELETE FROM token_registry WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let result =
            sqlx::query("UPDATE auth_tokens SET revoked = TRUE WHERE user_id = $1 AND NOT revoked")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow::anyhow!(e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SecurityEventStore for Database {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO security_events
                (event_id, event_type, user_id, tenant_id, ip_address, user_agent, device_id, session_id, context, risk_score, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(event.user_id)
        .bind(event.tenant_id)
        .bind(&event.ip_address)
        .bind(event.user_agent.as_deref())
        .bind(event.device_id.as_deref())
        .bind(event.session_id.as_deref())
        .bind(&event.context)
        .bind(event.risk_score)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }
}
