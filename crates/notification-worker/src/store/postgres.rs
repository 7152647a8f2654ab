//! Postgres 仓储
//!
//! 状态迁移全部写成带前置状态条件的单条 UPDATE，
//! 由数据库行锁保证并发的桥接消费者与工作池不会互相覆盖。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::Channel;
use notify_shared::models::{
    Client, Content, Notification, NotificationStatus, Recipient, UsageStats,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{AttemptStart, ClientRepository, NotificationFilter, NotificationRepository};

/// notifications 表的一行，recipient/content 以 JSONB 存储
#[derive(Debug, FromRow)]
struct NotificationRow {
    id: Uuid,
    client_id: Uuid,
    channel: Channel,
    recipient: Json<Recipient>,
    content: Json<Content>,
    status: NotificationStatus,
    retry_count: i32,
    error_message: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            client_id: row.client_id,
            channel: row.channel,
            recipient: row.recipient.0,
            content: row.content.0,
            status: row.status,
            retry_count: row.retry_count,
            error_message: row.error_message,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    // ==================== 写入操作 ====================

    async fn create(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, client_id, channel, recipient, content, status,
                                       retry_count, error_message, sent_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(notification.id)
        .bind(notification.client_id)
        .bind(notification.channel)
        .bind(Json(&notification.recipient))
        .bind(Json(&notification.content))
        .bind(notification.status)
        .bind(notification.retry_count)
        .bind(&notification.error_message)
        .bind(notification.sent_at)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== 查询操作 ====================

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, client_id, channel, recipient, content, status, retry_count,
                   error_message, sent_at, created_at, updated_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Notification::from))
    }

    async fn get_for_client(&self, client_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, client_id, channel, recipient, content, status, retry_count,
                   error_message, sent_at, created_at, updated_at
            FROM notifications
            WHERE id = $1 AND client_id = $2
            "#,
        )
        .bind(id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Notification::from))
    }

    async fn list(
        &self,
        client_id: Uuid,
        filter: &NotificationFilter,
    ) -> Result<(Vec<Notification>, u64)> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT id, client_id, channel, recipient, content, status, retry_count,
                   error_message, sent_at, created_at, updated_at
            FROM notifications
            WHERE client_id = $1
              AND ($2::varchar IS NULL OR channel = $2)
              AND ($3::varchar IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(client_id)
        .bind(filter.channel)
        .bind(filter.status)
        .bind(i64::from(filter.limit()))
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notifications
            WHERE client_id = $1
              AND ($2::varchar IS NULL OR channel = $2)
              AND ($3::varchar IS NULL OR status = $3)
            "#,
        )
        .bind(client_id)
        .bind(filter.channel)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        Ok((
            rows.into_iter().map(Notification::from).collect(),
            total.max(0) as u64,
        ))
    }

    // ==================== 状态迁移 ====================

    async fn mark_processing(&self, id: Uuid) -> Result<Option<NotificationStatus>> {
        // 未命中条件时返回当前状态，已是 PROCESSING/SENT/FAILED 的记录保持不变
        let status = sqlx::query_scalar::<_, NotificationStatus>(
            r#"
            WITH claimed AS (
                UPDATE notifications
                SET status = 'PROCESSING', updated_at = NOW()
                WHERE id = $1 AND status = 'PENDING'
                RETURNING status
            )
            SELECT status FROM claimed
            UNION ALL
            SELECT status FROM notifications
            WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM claimed)
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn begin_attempt(&self, id: Uuid, max_attempts: u32) -> Result<AttemptStart> {
        let started = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE notifications
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1
              AND (status = 'PROCESSING' OR (status = 'FAILED' AND retry_count < $2))
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(retry_count) = started {
            return Ok(AttemptStart::Started { retry_count });
        }

        let current = sqlx::query_as::<_, (NotificationStatus, i32)>(
            "SELECT status, retry_count FROM notifications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match current {
            None => AttemptStart::NotFound,
            Some((NotificationStatus::Sent, _)) => AttemptStart::AlreadySent,
            Some((NotificationStatus::Pending, _)) => AttemptStart::NotClaimed,
            Some((_, retry_count)) => AttemptStart::Exhausted { retry_count },
        })
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'SENT', sent_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<i32>> {
        let retry_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE notifications
            SET status = 'FAILED',
                error_message = $2,
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(retry_count)
    }

    async fn record_error(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notifications SET error_message = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NotifyError::not_found("Notification", id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 接入方
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    email: String,
    api_key_hash: String,
    is_active: bool,
    emails_sent: i64,
    sms_sent: i64,
    whatsapp_sent: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            api_key_hash: row.api_key_hash,
            is_active: row.is_active,
            usage_stats: UsageStats {
                emails_sent: row.emails_sent,
                sms_sent: row.sms_sent,
                whatsapp_sent: row.whatsapp_sent,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn usage_column(channel: Channel) -> &'static str {
    match channel {
        Channel::Email => "emails_sent",
        Channel::Sms => "sms_sent",
        Channel::Whatsapp => "whatsapp_sent",
    }
}

pub struct PgClientRepository {
    pool: PgPool,
}

impl PgClientRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientRepository for PgClientRepository {
    async fn create(&self, client: &Client) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO clients (id, name, email, api_key_hash, is_active,
                                 emails_sent, sms_sent, whatsapp_sent, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(client.id)
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.api_key_hash)
        .bind(client.is_active)
        .bind(client.usage_stats.emails_sent)
        .bind(client.usage_stats.sms_sent)
        .bind(client.usage_stats.whatsapp_sent)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(NotifyError::AlreadyExists {
                    entity: "Client".to_string(),
                    field: "email".to_string(),
                    value: client.email.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Client>> {
        let row = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT id, name, email, api_key_hash, is_active,
                   emails_sent, sms_sent, whatsapp_sent, created_at, updated_at
            FROM clients
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Client::from))
    }

    async fn increment_usage(&self, client_id: Uuid, channel: Channel) -> Result<()> {
        let column = usage_column(channel);
        let sql = format!(
            "UPDATE clients SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
        );

        let result = sqlx::query(&sql).bind(client_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(NotifyError::not_found("Client", client_id));
        }
        Ok(())
    }
}
