//! 邮件发送器
//!
//! 通过 SMTP 中继发送 HTML 邮件，同时附带纯文本版本。

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use notify_shared::config::SmtpConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::Channel;
use notify_shared::models::{Content, Recipient};
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChannelSender, DeliveryReceipt, ProviderError, recipient_address};

const PROVIDER: &str = "smtp";
const DEFAULT_SUBJECT: &str = "Notification";

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("HTML 标签正则无效"));

/// 去掉 HTML 标签得到纯文本
pub fn strip_html(html: &str) -> String {
    TAG_RE.replace_all(html, "").trim().to_string()
}

/// 邮件组装，不依赖 SMTP 连接
struct MessageComposer {
    from: Mailbox,
    /// Message-ID 的域名部分
    domain: String,
}

impl MessageComposer {
    fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from_address: Address =
            config
                .from_email
                .parse()
                .map_err(|e| NotifyError::InvalidArgument {
                    field: "providers.smtp.from_email".to_string(),
                    message: format!("{e}"),
                })?;

        Ok(Self {
            domain: from_address.domain().to_string(),
            from: Mailbox::new(Some(config.from_name.clone()), from_address),
        })
    }

    /// 组装邮件：主题缺省为 "Notification"，纯文本缺省由 HTML 去标签得到
    fn compose(&self, to: &str, content: &Content) -> Result<(Message, String), ProviderError> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| ProviderError::permanent(PROVIDER, format!("收件地址无效: {e}")))?;

        let subject = content
            .subject
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SUBJECT);
        let text = content
            .text
            .clone()
            .unwrap_or_else(|| strip_html(&content.body));
        let message_id = format!("<{}@{}>", Uuid::now_v7(), self.domain);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .multipart(MultiPart::alternative_plain_html(text, content.body.clone()))
            .map_err(|e| ProviderError::permanent(PROVIDER, format!("邮件构造失败: {e}")))?;

        Ok((message, message_id))
    }
}

/// SMTP 邮件发送器
///
/// lettre 的连接池在 tokio 运行时中创建，必须在运行时内构造。
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    composer: MessageComposer,
}

impl EmailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let composer = MessageComposer::new(config)?;

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                NotifyError::ExternalService {
                    service: PROVIDER.to_string(),
                    message: e.to_string(),
                }
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(host = %config.host, port = config.port, "SMTP 发送器已初始化");
        Ok(Self {
            transport: builder.build(),
            composer,
        })
    }
}

/// SMTP 错误分类：5xx 应答与客户端错误不可重试，其余（4xx、网络、TLS、超时）可重试
fn classify(err: lettre::transport::smtp::Error) -> ProviderError {
    if err.is_permanent() || err.is_client() {
        ProviderError::permanent(PROVIDER, err.to_string())
    } else {
        ProviderError::transient(PROVIDER, err.to_string())
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let to = recipient_address(PROVIDER, Channel::Email, recipient)?;
        let (message, message_id) = self.composer.compose(to, content)?;

        let response = self.transport.send(message).await.map_err(classify)?;
        debug!(to, code = %response.code(), "SMTP 应答");

        Ok(DeliveryReceipt::delivered(message_id))
    }
}
