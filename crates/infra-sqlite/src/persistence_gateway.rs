// SQLite PersistenceGateway Implementation

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use hostbay_core::domain::{App, AppKey, AppSource, ExitStatus, SlotState, Tenant};
use hostbay_core::error::{AppError, Result};
use hostbay_core::port::PersistenceGateway;

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => AppError::Persistence(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" => AppError::Persistence(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => {
                        AppError::Persistence(format!("Database full: {}", db_err.message()))
                    }
                    _ => AppError::Persistence(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Persistence(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::Persistence("Row not found".to_string()),
        _ => AppError::Persistence(err.to_string()),
    }
}

fn encode_exit(exit: &Option<ExitStatus>) -> Result<Option<String>> {
    exit.as_ref()
        .map(|e| serde_json::to_string(e).map_err(AppError::from))
        .transpose()
}

fn decode_exit(raw: Option<String>) -> Result<Option<ExitStatus>> {
    raw.map(|s| serde_json::from_str(&s).map_err(AppError::from))
        .transpose()
}

fn row_to_app(row: &sqlx::sqlite::SqliteRow) -> Result<App> {
    let tenant: String = row.try_get("tenant_id").map_err(map_sqlx_error)?;
    let app_id: String = row.try_get("app_id").map_err(map_sqlx_error)?;
    let policy_raw: String = row.try_get("policy").map_err(map_sqlx_error)?;
    let state_raw: String = row.try_get("last_state").map_err(map_sqlx_error)?;
    let last_exit_raw: Option<String> = row.try_get("last_exit").map_err(map_sqlx_error)?;

    let mut app = App::new(
        AppKey::new(tenant, app_id),
        row.try_get::<String, _>("entry_point")
            .map_err(map_sqlx_error)?,
        policy_raw.parse().map_err(AppError::Persistence)?,
        row.try_get("created_at").map_err(map_sqlx_error)?,
    );
    app.restart_count = row.try_get("restart_count").map_err(map_sqlx_error)?;
    app.crash_backoff = row
        .try_get::<i64, _>("crash_backoff")
        .map_err(map_sqlx_error)? as u32;
    app.last_exit = decode_exit(last_exit_raw)?;
    app.last_state = state_raw
        .parse::<SlotState>()
        .map_err(AppError::Persistence)?;
    Ok(app)
}

pub struct SqlitePersistenceGateway {
    pool: SqlitePool,
}

impl SqlitePersistenceGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceGateway for SqlitePersistenceGateway {
    async fn save_app_meta(&self, app: &App) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO apps (
                tenant_id, app_id, entry_point, policy, created_at,
                restart_count, crash_backoff, last_exit, last_state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, app_id) DO UPDATE SET
                entry_point = excluded.entry_point,
                policy = excluded.policy,
                restart_count = excluded.restart_count,
                crash_backoff = excluded.crash_backoff,
                last_exit = excluded.last_exit,
                last_state = excluded.last_state
            "#,
        )
        .bind(&app.key.tenant)
        .bind(&app.key.app)
        .bind(&app.entry_point)
        .bind(app.policy.to_string())
        .bind(app.created_at)
        .bind(app.restart_count)
        .bind(app.crash_backoff as i64)
        .bind(encode_exit(&app.last_exit)?)
        .bind(app.last_state.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn load_all_app_meta(&self) -> Result<Vec<App>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, app_id, entry_point, policy, created_at,
                   restart_count, crash_backoff, last_exit, last_state
            FROM apps
            ORDER BY tenant_id, app_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_app).collect()
    }

    async fn save_app_source(&self, key: &AppKey, source: &AppSource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_sources (tenant_id, app_id, entry_point, bytes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (tenant_id, app_id) DO UPDATE SET
                entry_point = excluded.entry_point,
                bytes = excluded.bytes
            "#,
        )
        .bind(&key.tenant)
        .bind(&key.app)
        .bind(&source.entry_point)
        .bind(&source.bytes)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn load_app_source(&self, key: &AppKey) -> Result<Option<AppSource>> {
        let row = sqlx::query(
            "SELECT entry_point, bytes FROM app_sources WHERE tenant_id = ? AND app_id = ?",
        )
        .bind(&key.tenant)
        .bind(&key.app)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| {
            Ok(AppSource {
                entry_point: row.try_get("entry_point").map_err(map_sqlx_error)?,
                bytes: row.try_get("bytes").map_err(map_sqlx_error)?,
            })
        })
        .transpose()
    }

    async fn delete_app(&self, key: &AppKey) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM apps WHERE tenant_id = ? AND app_id = ?")
            .bind(&key.tenant)
            .bind(&key.app)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM app_sources WHERE tenant_id = ? AND app_id = ?")
            .bind(&key.tenant)
            .bind(&key.app)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn save_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_id, quota_override, admin, active, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                quota_override = excluded.quota_override,
                admin = excluded.admin,
                active = excluded.active
            "#,
        )
        .bind(&tenant.id)
        .bind(tenant.quota_override.map(|q| q as i64))
        .bind(tenant.admin)
        .bind(tenant.active)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn load_all_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query(
            "SELECT tenant_id, quota_override, admin, active, created_at FROM tenants",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                Ok(Tenant {
                    id: row.try_get("tenant_id").map_err(map_sqlx_error)?,
                    quota_override: row
                        .try_get::<Option<i64>, _>("quota_override")
                        .map_err(map_sqlx_error)?
                        .map(|q| q as usize),
                    admin: row.try_get("admin").map_err(map_sqlx_error)?,
                    active: row.try_get("active").map_err(map_sqlx_error)?,
                    created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }
}
