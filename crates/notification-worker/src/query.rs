//! 通知状态查询
//!
//! 只返回属于调用方接入方的通知；列表按创建时间倒序分页。

use std::sync::Arc;

use notify_shared::error::{NotifyError, Result};
use notify_shared::models::Notification;
use serde::Serialize;
use uuid::Uuid;

use crate::store::{NotificationFilter, NotificationRepository};

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    /// 总页数，向上取整
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        Self {
            items,
            total,
            page,
            limit,
            pages: total.div_ceil(u64::from(limit.max(1))),
        }
    }
}

pub struct NotificationQuery {
    notifications: Arc<dyn NotificationRepository>,
}

impl NotificationQuery {
    pub fn new(notifications: Arc<dyn NotificationRepository>) -> Self {
        Self { notifications }
    }

    pub async fn get(&self, client_id: Uuid, id: Uuid) -> Result<Notification> {
        self.notifications
            .get_for_client(client_id, id)
            .await?
            .ok_or_else(|| NotifyError::not_found("Notification", id))
    }

    pub async fn list(
        &self,
        client_id: Uuid,
        filter: &NotificationFilter,
    ) -> Result<Page<Notification>> {
        let (items, total) = self.notifications.list(client_id, filter).await?;
        Ok(Page::new(items, total, filter.page(), filter.limit()))
    }
}
