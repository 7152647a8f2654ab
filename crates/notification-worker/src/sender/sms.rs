//! 短信发送器
//!
//! 按配置选择服务商：twilio、msg91，或只记录日志的 log。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::SmsProviderConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::Channel;
use notify_shared::models::{Content, Recipient};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{ChannelSender, DeliveryReceipt, LogSender, ProviderError, digits_only, recipient_address};

fn required(value: &Option<String>, field: &str) -> Result<String, NotifyError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NotifyError::InvalidArgument {
            field: format!("providers.sms.{field}"),
            message: "当前短信服务商需要该配置".to_string(),
        })
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, NotifyError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| NotifyError::Internal(format!("创建 HTTP 客户端失败: {e}")))
}

/// 从错误应答中提取服务商给出的说明
fn error_detail(body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| body.to_string())
}

/// 按 `providers.sms.provider` 创建发送器
pub fn from_config(config: &SmsProviderConfig) -> Result<Arc<dyn ChannelSender>, NotifyError> {
    let sender: Arc<dyn ChannelSender> = match config.provider.as_str() {
        "twilio" => Arc::new(TwilioSmsSender::new(config)?),
        "msg91" => Arc::new(Msg91SmsSender::new(config)?),
        "log" => Arc::new(LogSender::new(Channel::Sms)),
        other => {
            return Err(NotifyError::InvalidArgument {
                field: "providers.sms.provider".to_string(),
                message: format!("不支持的短信服务商 {other}，可选值: twilio, msg91, log"),
            });
        }
    };
    info!(provider = %config.provider, "短信发送器已初始化");
    Ok(sender)
}

// ---------------------------------------------------------------------------
// Twilio
// ---------------------------------------------------------------------------

pub struct TwilioSmsSender {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSmsSender {
    const PROVIDER: &'static str = "twilio";

    pub fn new(config: &SmsProviderConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            api_base: config.twilio_api_base.trim_end_matches('/').to_string(),
            account_sid: required(&config.twilio_account_sid, "twilio_account_sid")?,
            auth_token: required(&config.twilio_auth_token, "twilio_auth_token")?,
            from_number: required(&config.twilio_from_number, "twilio_from_number")?,
        })
    }
}

#[async_trait]
impl ChannelSender for TwilioSmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let to = recipient_address(Self::PROVIDER, Channel::Sms, recipient)?;
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", self.from_number.as_str()),
                ("Body", content.body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::from_request(Self::PROVIDER, &e))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ProviderError::from_status(
                Self::PROVIDER,
                status,
                &error_detail(&body),
            ));
        }

        let sid = body.get("sid").and_then(Value::as_str).map(String::from);
        debug!(to, sid = ?sid, "Twilio 已受理短信");
        Ok(DeliveryReceipt {
            success: true,
            provider_message_id: sid,
        })
    }
}

// ---------------------------------------------------------------------------
// MSG91
// ---------------------------------------------------------------------------

pub struct Msg91SmsSender {
    http: reqwest::Client,
    api_base: String,
    auth_key: String,
    sender_id: String,
}

impl Msg91SmsSender {
    const PROVIDER: &'static str = "msg91";

    pub fn new(config: &SmsProviderConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            api_base: config.msg91_api_base.trim_end_matches('/').to_string(),
            auth_key: required(&config.msg91_auth_key, "msg91_auth_key")?,
            sender_id: required(&config.msg91_sender_id, "msg91_sender_id")?,
        })
    }
}

#[async_trait]
impl ChannelSender for Msg91SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let to = recipient_address(Self::PROVIDER, Channel::Sms, recipient)?;
        let payload = json!({
            "sender": self.sender_id,
            "route": "4",
            "country": "91",
            "sms": [{
                "message": content.body,
                "to": [digits_only(to)],
            }],
        });

        let response = self
            .http
            .post(format!("{}/api/v5/flow/", self.api_base))
            .header("authkey", &self.auth_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_request(Self::PROVIDER, &e))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ProviderError::from_status(
                Self::PROVIDER,
                status,
                &error_detail(&body),
            ));
        }
        // MSG91 对业务错误也返回 200，以 type 字段区分
        if body.get("type").and_then(Value::as_str) == Some("error") {
            return Err(ProviderError::permanent(Self::PROVIDER, error_detail(&body)));
        }

        let request_id = body
            .get("request_id")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(String::from);
        debug!(to, request_id = ?request_id, "MSG91 已受理短信");
        Ok(DeliveryReceipt {
            success: true,
            provider_message_id: request_id,
        })
    }
}
