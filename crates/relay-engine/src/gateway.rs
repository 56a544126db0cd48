//! Gateway - delivery of one message to the messaging provider
//!
//! The HTTP implementation talks to an Evolution-API style REST gateway:
//! `POST {base}/message/{endpoint}/{instance}` with an `apikey` header and a
//! JSON body carrying the destination number and the type-specific fields.

use async_trait::async_trait;
use relay_common::{duration_ms, MessageContent, SendOptions};
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Typing-presence options sent with every message
const PRESENCE: &str = "paused";
const PRESENCE_DELAY_MS: u64 = 1200;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// The gateway answered with a non-2xx status
    #[error("{message} (HTTP {status_code})")]
    Status {
        status_code: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("Failed to decode gateway response (HTTP {status_code}): {message}")]
    Decode { status_code: u16, message: String },

    #[error("Gateway request failed: {0}")]
    Transport(String),
}

impl GatewayError {
    /// HTTP status to report. Transport failures have none and report 500.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Status { status_code, .. } => *status_code,
            GatewayError::Decode { status_code, .. } => *status_code,
            GatewayError::Transport(_) => 500,
        }
    }
}

/// Gateway endpoint for each message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    SendText,
    SendMedia,
    SendWhatsAppAudio,
    SendButtons,
    SendList,
    SendPoll,
}

impl Endpoint {
    pub fn for_content(content: &MessageContent) -> Self {
        match content {
            MessageContent::Text(_) => Endpoint::SendText,
            MessageContent::Media(_) => Endpoint::SendMedia,
            MessageContent::Audio(_) => Endpoint::SendWhatsAppAudio,
            MessageContent::Buttons(_) => Endpoint::SendButtons,
            MessageContent::List(_) => Endpoint::SendList,
            MessageContent::Poll(_) => Endpoint::SendPoll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::SendText => "sendText",
            Endpoint::SendMedia => "sendMedia",
            Endpoint::SendWhatsAppAudio => "sendWhatsAppAudio",
            Endpoint::SendButtons => "sendButtons",
            Endpoint::SendList => "sendList",
            Endpoint::SendPoll => "sendPoll",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built gateway request body
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub endpoint: Endpoint,
    pub number: String,
    pub body: Value,
}

fn insert_opt<T: Into<Value>>(body: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        body.insert(key.to_string(), value.into());
    }
}

fn insert_send_options(body: &mut Map<String, Value>, options: &SendOptions) {
    insert_opt(body, "delay", options.delay);
    insert_opt(body, "linkPreview", options.link_preview);
    insert_opt(body, "mentionsEveryOne", options.mentions_every_one);
    insert_opt(body, "mentioned", options.mentioned.clone());
}

impl OutboundMessage {
    /// Build the request for `content` addressed to an already normalized number.
    pub fn build(number: &str, content: &MessageContent) -> Self {
        let mut body = Map::new();
        body.insert("number".to_string(), json!(number));
        body.insert(
            "options".to_string(),
            json!({ "presence": PRESENCE, "delay": PRESENCE_DELAY_MS }),
        );

        let options = match content {
            MessageContent::Text(text) => {
                insert_opt(&mut body, "text", text.message.clone());
                &text.options
            }
            MessageContent::Media(media) => {
                body.insert("media".to_string(), json!(media.media_url));
                insert_opt(&mut body, "mediatype", media.mediatype.clone());
                insert_opt(&mut body, "mimetype", media.mimetype.clone());
                insert_opt(&mut body, "caption", media.caption.clone());
                insert_opt(&mut body, "fileName", media.file_name.clone());
                &media.options
            }
            MessageContent::Audio(audio) => {
                body.insert("audio".to_string(), json!(audio.audio_url));
                &audio.options
            }
            MessageContent::Buttons(buttons) => {
                insert_opt(&mut body, "title", buttons.title.clone());
                insert_opt(&mut body, "description", buttons.description.clone());
                insert_opt(&mut body, "footer", buttons.footer.clone());
                body.insert("buttons".to_string(), Value::Array(buttons.buttons.clone()));
                &buttons.options
            }
            MessageContent::List(list) => {
                insert_opt(&mut body, "title", list.title.clone());
                insert_opt(&mut body, "description", list.description.clone());
                insert_opt(&mut body, "buttonText", list.button_text.clone());
                insert_opt(&mut body, "footerText", list.footer_text.clone());
                body.insert("values".to_string(), Value::Array(list.values.clone()));
                &list.options
            }
            MessageContent::Poll(poll) => {
                body.insert("name".to_string(), json!(poll.name));
                insert_opt(&mut body, "selectableCount", poll.selectable_count);
                body.insert("values".to_string(), json!(poll.values));
                &poll.options
            }
        };
        insert_send_options(&mut body, options);

        Self {
            endpoint: Endpoint::for_content(content),
            number: number.to_string(),
            body: Value::Object(body),
        }
    }
}

/// Raw provider response body
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse(pub Value);

impl ProviderResponse {
    /// The provider confirmed the send: `status: true` or a message key id.
    pub fn is_accepted(&self) -> bool {
        let status_ok = self.0.get("status").and_then(Value::as_bool) == Some(true);
        let has_key = self
            .0
            .get("key")
            .and_then(|key| key.get("id"))
            .is_some_and(|id| !id.is_null());
        status_ok || has_key
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Trait for message delivery
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(
        &self,
        channel_instance: &str,
        message: &OutboundMessage,
    ) -> Result<ProviderResponse, GatewayError>;
}

/// Configuration for the HTTP gateway
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Request timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl HttpGatewayConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// reqwest-based gateway client
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GatewayError::Transport(format!("invalid gateway url {:?}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Transport(format!(
                "gateway url {:?} cannot be used as a base",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))?;

        info!(
            base_url = %base_url,
            timeout_ms = duration_ms(config.timeout),
            "HttpGateway initialized"
        );

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    fn endpoint_url(&self, endpoint: Endpoint, channel_instance: &str) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Transport("gateway url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["message", endpoint.as_str(), channel_instance]);
        Ok(url)
    }
}

/// Error text from a gateway error body: `message`, then `error`.
fn error_message(body: &Value, status_code: u16) -> String {
    ["message", "error"]
        .iter()
        .find_map(|field| match body.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Array(items)) if !items.is_empty() => Some(
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            Some(other) if !other.is_null() && !other.is_string() && !other.is_array() => {
                Some(other.to_string())
            }
            _ => None,
        })
        .unwrap_or_else(|| format!("gateway returned HTTP {}", status_code))
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send(
        &self,
        channel_instance: &str,
        message: &OutboundMessage,
    ) -> Result<ProviderResponse, GatewayError> {
        let url = self.endpoint_url(message.endpoint, channel_instance)?;

        debug!(
            endpoint = %message.endpoint,
            instance = %channel_instance,
            number = %message.number,
            "Sending message to gateway"
        );

        let response = self
            .client
            .post(url)
            .header("apikey", &self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&message.body)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    endpoint = %message.endpoint,
                    instance = %channel_instance,
                    error = %e,
                    is_timeout = e.is_timeout(),
                    is_connect = e.is_connect(),
                    "Gateway request failed"
                );
                GatewayError::Transport(e.to_string())
            })?;

        let status = response.status();
        let status_code = status.as_u16();
        let text = response.text().await.map_err(|e| GatewayError::Decode {
            status_code,
            message: e.to_string(),
        })?;
        let parsed = serde_json::from_str::<Value>(&text);

        if !status.is_success() {
            let body = parsed.ok();
            let message_text = body
                .as_ref()
                .map(|body| error_message(body, status_code))
                .unwrap_or_else(|| format!("gateway returned HTTP {}", status_code));
            warn!(
                endpoint = %message.endpoint,
                instance = %channel_instance,
                status_code,
                error = %message_text,
                "Gateway rejected message"
            );
            return Err(GatewayError::Status {
                status_code,
                message: message_text,
                body,
            });
        }

        let body = parsed.map_err(|e| {
            warn!(status_code, error = %e, "Gateway response is not JSON");
            GatewayError::Decode {
                status_code,
                message: e.to_string(),
            }
        })?;

        debug!(
            endpoint = %message.endpoint,
            instance = %channel_instance,
            status_code,
            "Gateway accepted request"
        );
        Ok(ProviderResponse(body))
    }
}
