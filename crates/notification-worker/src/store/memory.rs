//! 内存存储
//!
//! 基于 DashMap 的仓储实现，用于测试和本地运行。
//! 单条记录的条件更新在 DashMap 分片锁内完成，语义与 Postgres 的条件 UPDATE 一致。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::Channel;
use notify_shared::models::{Client, Notification, NotificationStatus};
use uuid::Uuid;

use super::{AttemptStart, ClientRepository, NotificationFilter, NotificationRepository};

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    notifications: DashMap<Uuid, Notification>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.notifications.entry(notification.id) {
            Entry::Occupied(_) => Err(NotifyError::AlreadyExists {
                entity: "Notification".to_string(),
                field: "id".to_string(),
                value: notification.id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(notification.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.get(&id).map(|n| n.clone()))
    }

    async fn get_for_client(&self, client_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
        Ok(self
            .notifications
            .get(&id)
            .filter(|n| n.client_id == client_id)
            .map(|n| n.clone()))
    }

    async fn list(
        &self,
        client_id: Uuid,
        filter: &NotificationFilter,
    ) -> Result<(Vec<Notification>, u64)> {
        let mut matched: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.client_id == client_id && filter.matches(n))
            .map(|n| n.clone())
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect();

        Ok((items, total))
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<NotificationStatus>> {
        let Some(mut n) = self.notifications.get_mut(&id) else {
            return Ok(None);
        };

        if n.status == NotificationStatus::Pending {
            n.status = NotificationStatus::Processing;
            n.updated_at = Utc::now();
        }
        Ok(Some(n.status))
    }

    async fn begin_attempt(&self, id: Uuid, max_attempts: u32) -> Result<AttemptStart> {
        let Some(mut n) = self.notifications.get_mut(&id) else {
            return Ok(AttemptStart::NotFound);
        };

        let outcome = match n.status {
            NotificationStatus::Processing => AttemptStart::Started {
                retry_count: n.retry_count,
            },
            NotificationStatus::Failed if (n.retry_count as u32) < max_attempts => {
                n.status = NotificationStatus::Processing;
                n.updated_at = Utc::now();
                AttemptStart::Started {
                    retry_count: n.retry_count,
                }
            }
            NotificationStatus::Failed => AttemptStart::Exhausted {
                retry_count: n.retry_count,
            },
            NotificationStatus::Sent => AttemptStart::AlreadySent,
            NotificationStatus::Pending => AttemptStart::NotClaimed,
        };
        Ok(outcome)
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut n) = self.notifications.get_mut(&id) else {
            return Ok(false);
        };

        if n.status != NotificationStatus::Processing {
            return Ok(false);
        }
        n.status = NotificationStatus::Sent;
        n.sent_at = Some(sent_at);
        n.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<i32>> {
        let Some(mut n) = self.notifications.get_mut(&id) else {
            return Ok(None);
        };

        if n.status != NotificationStatus::Processing {
            return Ok(None);
        }
        n.status = NotificationStatus::Failed;
        n.error_message = Some(error.to_string());
        n.retry_count += 1;
        n.updated_at = Utc::now();
        Ok(Some(n.retry_count))
    }

    async fn record_error(&self, id: Uuid, error: &str) -> Result<()> {
        let mut n = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("Notification", id))?;
        n.error_message = Some(error.to_string());
        n.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryClientRepository {
    clients: DashMap<Uuid, Client>,
}

impl InMemoryClientRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRepository for InMemoryClientRepository {
    async fn create(&self, client: &Client) -> Result<()> {
        let email_taken = self
            .clients
            .iter()
            .any(|c| c.email == client.email && c.id != client.id);
        if email_taken {
            return Err(NotifyError::AlreadyExists {
                entity: "Client".to_string(),
                field: "email".to_string(),
                value: client.email.clone(),
            });
        }
        self.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Client>> {
        Ok(self.clients.get(&id).map(|c| c.clone()))
    }

    async fn increment_usage(&self, client_id: Uuid, channel: Channel) -> Result<()> {
        let mut client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| NotifyError::not_found("Client", client_id))?;
        client.usage_stats.increment(channel);
        client.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::models::{Content, Recipient};

    fn sms(client_id: Uuid) -> Notification {
        Notification::new(
            client_id,
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("code 1234"),
        )
    }

    #[tokio::test]
    async fn test_status_walk_to_sent() {
        let repo = InMemoryNotificationRepository::new();
        let n = sms(Uuid::now_v7());
        repo.create(&n).await.unwrap();

        // PENDING 不能直接 SENT
        assert!(!repo.mark_sent(n.id, Utc::now()).await.unwrap());

        assert_eq!(
            repo.mark_processing(n.id).await.unwrap(),
            Some(NotificationStatus::Processing)
        );
        assert_eq!(
            repo.begin_attempt(n.id, 3).await.unwrap(),
            AttemptStart::Started { retry_count: 0 }
        );
        assert!(repo.mark_sent(n.id, Utc::now()).await.unwrap());
        // 第二次 mark_sent 不再生效
        assert!(!repo.mark_sent(n.id, Utc::now()).await.unwrap());

        let stored = repo.get(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(
            repo.begin_attempt(n.id, 3).await.unwrap(),
            AttemptStart::AlreadySent
        );
        // SENT 之后桥接消费者也不会改写状态
        assert_eq!(
            repo.mark_processing(n.id).await.unwrap(),
            Some(NotificationStatus::Sent)
        );
    }

    #[tokio::test]
    async fn test_failed_retries_until_exhausted() {
        let repo = InMemoryNotificationRepository::new();
        let n = sms(Uuid::now_v7());
        repo.create(&n).await.unwrap();
        repo.mark_processing(n.id).await.unwrap();

        for expected in 1..=3 {
            assert!(matches!(
                repo.begin_attempt(n.id, 3).await.unwrap(),
                AttemptStart::Started { .. }
            ));
            assert_eq!(
                repo.mark_failed(n.id, "HTTP 503").await.unwrap(),
                Some(expected)
            );
        }

        assert_eq!(
            repo.begin_attempt(n.id, 3).await.unwrap(),
            AttemptStart::Exhausted { retry_count: 3 }
        );
        let stored = repo.get(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_get_scoped_to_client_and_list_pagination() {
        let repo = InMemoryNotificationRepository::new();
        let owner = Uuid::now_v7();
        let other = Uuid::now_v7();

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut n = sms(owner);
            n.created_at += chrono::Duration::seconds(i);
            ids.push(n.id);
            repo.create(&n).await.unwrap();
        }
        let foreign = sms(other);
        repo.create(&foreign).await.unwrap();

        assert!(repo.get_for_client(owner, foreign.id).await.unwrap().is_none());
        assert!(repo.get_for_client(other, foreign.id).await.unwrap().is_some());

        let filter = NotificationFilter {
            page: 1,
            limit: 2,
            ..Default::default()
        };
        let (page, total) = repo.list(owner, &filter).await.unwrap();
        assert_eq!(total, 5);
        // 最新的在前
        assert_eq!(page.iter().map(|n| n.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let filter = NotificationFilter {
            page: 3,
            limit: 2,
            ..Default::default()
        };
        let (page, _) = repo.list(owner, &filter).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, ids[0]);
    }

    #[tokio::test]
    async fn test_client_usage_increment() {
        let repo = InMemoryClientRepository::new();
        let client = Client::new("Acme", "ops@acme.com", "hash");
        repo.create(&client).await.unwrap();

        repo.increment_usage(client.id, Channel::Email).await.unwrap();
        repo.increment_usage(client.id, Channel::Email).await.unwrap();

        let stored = repo.get(client.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_stats.emails_sent, 2);
        assert_eq!(stored.usage_stats.sms_sent, 0);

        let duplicate = Client::new("Acme 2", "OPS@acme.com", "hash2");
        assert!(matches!(
            repo.create(&duplicate).await,
            Err(NotifyError::AlreadyExists { .. })
        ));
        assert!(repo.increment_usage(Uuid::now_v7(), Channel::Sms).await.is_err());
    }
}
