//! Initial schema for the device auth service.
//!
//! Idempotent - every statement is IF NOT EXISTS, so running it on every
//! startup is safe.

use sqlx::postgres::PgPool;

use service_core::error::AppError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS device_registrations (
        user_id        UUID        NOT NULL,
        device_id      TEXT        NOT NULL,
        device_info    JSONB       NOT NULL DEFAULT '{}'::jsonb,
        device_secret  TEXT        NOT NULL,
        is_trusted     BOOLEAN     NOT NULL DEFAULT FALSE,
        registered_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        trusted_at     TIMESTAMPTZ,
        trusted_until  TIMESTAMPTZ,
        last_used_at   TIMESTAMPTZ,
        PRIMARY KEY (user_id, device_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_device_registrations_device_id
        ON device_registrations (device_id, registered_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_tokens (
        token_id     UUID        PRIMARY KEY,
        user_id      UUID        NOT NULL,
        device_id    TEXT        NOT NULL,
        token_hash   TEXT        NOT NULL,
        kind         TEXT        NOT NULL,
        abilities    TEXT[]      NOT NULL DEFAULT '{}',
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at   TIMESTAMPTZ NOT NULL,
        last_used_at TIMESTAMPTZ,
        revoked      BOOLEAN     NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_auth_tokens_user_device
        ON auth_tokens (user_id, device_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_auth_tokens_expires_at
        ON auth_tokens (expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_registry (
        user_id          UUID        NOT NULL,
        device_id        TEXT        NOT NULL,
        access_token_id  UUID        NOT NULL,
        refresh_token_id UUID        NOT NULL,
        expires_at       TIMESTAMPTZ NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, device_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_token_registry_expires_at
        ON token_registry (expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS security_events (
        event_id    UUID             PRIMARY KEY,
        event_type  TEXT             NOT NULL,
        user_id     UUID,
        tenant_id   UUID,
        ip_address  TEXT             NOT NULL,
        user_agent  TEXT,
        device_id   TEXT,
        session_id  TEXT,
        context     JSONB            NOT NULL DEFAULT 'null'::jsonb,
        risk_score  DOUBLE PRECISION NOT NULL,
        occurred_at TIMESTAMPTZ      NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_security_events_occurred_at
        ON security_events (occurred_at, event_type)
    "#,
];

/// Apply the v1 schema.
pub async fn apply_v1_device_auth(pool: &PgPool) -> Result<(), AppError> {
    tracing::info!("Applying device auth schema (v1)");

    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
    }

    tracing::info!("Device auth schema up to date");
    Ok(())
}
