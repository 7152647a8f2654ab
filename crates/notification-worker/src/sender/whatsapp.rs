//! WhatsApp 发送器
//!
//! 调用 Meta WhatsApp Cloud API。content 带 template_name 时发送模板消息，
//! 否则发送文本消息。

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::WhatsappConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::Channel;
use notify_shared::models::{Content, Recipient};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{ChannelSender, DeliveryReceipt, ProviderError, digits_only, recipient_address};

const PROVIDER: &str = "whatsapp";

pub struct WhatsappSender {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
    template_language: String,
}

impl WhatsappSender {
    pub fn new(config: &WhatsappConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Internal(format!("创建 HTTP 客户端失败: {e}")))?;

        let endpoint = format!(
            "{}/{}/{}/messages",
            config.api_base.trim_end_matches('/'),
            config.api_version,
            config.phone_number_id
        );
        info!(endpoint = %endpoint, "WhatsApp 发送器已初始化");

        Ok(Self {
            http,
            endpoint,
            access_token: config.access_token.clone(),
            template_language: config.template_language.clone(),
        })
    }

    /// 组装 Cloud API 请求体
    pub fn payload(&self, to: &str, content: &Content) -> Value {
        match content.template_name.as_deref() {
            Some(template) => json!({
                "messaging_product": "whatsapp",
                "to": digits_only(to),
                "type": "template",
                "template": {
                    "name": template,
                    "language": { "code": self.template_language },
                },
            }),
            None => json!({
                "messaging_product": "whatsapp",
                "to": digits_only(to),
                "type": "text",
                "text": { "body": content.body },
            }),
        }
    }
}

#[async_trait]
impl ChannelSender for WhatsappSender {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let to = recipient_address(PROVIDER, Channel::Whatsapp, recipient)?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&self.payload(to, content))
            .send()
            .await
            .map_err(|e| ProviderError::from_request(PROVIDER, &e))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("WhatsApp API error");
            return Err(ProviderError::from_status(PROVIDER, status, detail));
        }

        let message_id = body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .map(String::from);
        debug!(to, message_id = ?message_id, "WhatsApp 已受理消息");
        Ok(DeliveryReceipt {
            success: true,
            provider_message_id: message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: &str) -> WhatsappConfig {
        WhatsappConfig {
            api_base: api_base.to_string(),
            phone_number_id: "1055".to_string(),
            access_token: "tok".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_payload_shapes() {
        let sender = WhatsappSender::new(&config("https://graph.facebook.com")).unwrap();

        let text = sender.payload("+14155550100", &Content::body("hello"));
        assert_eq!(text["type"], "text");
        assert_eq!(text["to"], "14155550100");
        assert_eq!(text["text"]["body"], "hello");

        let content = Content {
            template_name: Some("order_update".to_string()),
            ..Content::body("ignored")
        };
        let template = sender.payload("+14155550100", &content);
        assert_eq!(template["type"], "template");
        assert_eq!(template["template"]["name"], "order_update");
        assert_eq!(template["template"]["language"]["code"], "en");
    }

    #[tokio::test]
    async fn test_send_text_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v17.0/1055/messages"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({
                "messaging_product": "whatsapp",
                "to": "14155550100",
                "type": "text",
                "text": { "body": "hello" },
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"messages": [{"id": "wamid.HBgL"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sender = WhatsappSender::new(&config(&server.uri())).unwrap();
        let receipt = sender
            .send(&Recipient::phone("+14155550100"), &Content::body("hello"))
            .await
            .unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("wamid.HBgL"));
    }

    #[tokio::test]
    async fn test_api_error_message_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Template name does not exist", "code": 132001}
            })))
            .mount(&server)
            .await;

        let sender = WhatsappSender::new(&config(&server.uri())).unwrap();
        let err = sender
            .send(&Recipient::phone("+14155550100"), &Content::body("hello"))
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(err.to_string().contains("Template name does not exist"));
    }
}
