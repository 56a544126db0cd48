//! DispatchEngine - runs one leased job to a result
//!
//! - Single: one message, fixed pause before the gateway call, gateway errors
//!   fail the job so the queue retries it
//! - Bulk: one personalized message per recipient, failures recorded per
//!   recipient, a pause between sends
//! - MultiBlock: ordered blocks to one phone, failures recorded per block
//!
//! Units inside a job are always sent one after another.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use relay_common::{
    duration_ms, BulkDispatch, Content, DispatchJob, DispatchSummary, JobOutput, JobPayload,
    MessageContent, MultiBlockDispatch, SendResult, SingleDispatch, Variables,
};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::gateway::{Gateway, GatewayError, OutboundMessage, ProviderResponse};
use crate::phone;
use crate::template::expand;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const NOT_CONFIRMED: &str = "provider did not confirm the send";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause before every single-mode gateway call
    pub api_call_delay: Duration,
    /// Fail (and retry) bulk/multi-block jobs in which no unit succeeded
    pub fail_when_all_units_fail: bool,
    /// Shared cap on gateway calls from this engine
    pub rate_limit_per_minute: Option<NonZeroU32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_call_delay: Duration::from_millis(1000),
            fail_when_all_units_fail: false,
            rate_limit_per_minute: None,
        }
    }
}

pub struct DispatchEngine {
    gateway: Arc<dyn Gateway>,
    config: EngineConfig,
    rate_limiter: Option<Arc<DirectLimiter>>,
}

impl DispatchEngine {
    pub fn new(gateway: Arc<dyn Gateway>, config: EngineConfig) -> Self {
        let rate_limiter = config
            .rate_limit_per_minute
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        if let Some(rpm) = config.rate_limit_per_minute {
            info!(rate_limit_per_minute = rpm.get(), "Gateway rate limit enabled");
        }

        Self {
            gateway,
            config,
            rate_limiter,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `job` to completion. Per-unit failures of bulk and multi-block jobs
    /// are part of the returned summary, not errors.
    pub async fn execute(&self, job: &DispatchJob) -> Result<JobOutput, EngineError> {
        match &job.payload {
            JobPayload::Single(single) => self
                .run_single(&job.channel_instance, single)
                .await
                .map(JobOutput::Delivered),
            JobPayload::Bulk(bulk) => {
                let summary = self.run_bulk(&job.channel_instance, bulk).await?;
                self.check_summary(summary).map(JobOutput::Summary)
            }
            JobPayload::MultiBlock(multi) => {
                let summary = self.run_multi_block(&job.channel_instance, multi).await?;
                self.check_summary(summary).map(JobOutput::Summary)
            }
        }
    }

    async fn run_single(&self, instance: &str, single: &SingleDispatch) -> Result<Value, EngineError> {
        let number = phone::normalize(&single.phone)
            .map_err(|rejected| EngineError::InvalidPhone(rejected.raw))?;
        let content = supported(&single.content)
            .ok_or_else(|| EngineError::UnsupportedMessage(single.content.kind().to_string()))?;

        if !self.config.api_call_delay.is_zero() {
            debug!(delay_ms = duration_ms(self.config.api_call_delay), "Waiting before gateway call");
            tokio::time::sleep(self.config.api_call_delay).await;
        }

        let message = OutboundMessage::build(&number, content);
        let response = self.send(instance, &message).await?;

        info!(number = %number, message_type = content.kind(), "Message sent");
        Ok(response.into_value())
    }

    async fn run_bulk(&self, instance: &str, bulk: &BulkDispatch) -> Result<DispatchSummary, EngineError> {
        if bulk.recipients.is_empty() {
            return Err(EngineError::NoRecipients);
        }

        let total = bulk.recipients.len();
        let pause = Duration::from_millis(bulk.delay_between_ms);
        let mut results = Vec::with_capacity(total);

        for (index, recipient) in bulk.recipients.iter().enumerate() {
            let identifier = recipient.phone.clone();

            let number = match phone::normalize(&recipient.phone) {
                Ok(number) => number,
                Err(rejected) => {
                    warn!(recipient = index + 1, total, phone = %recipient.phone, "Skipping recipient with invalid phone");
                    results.push(SendResult::failed(identifier, rejected.to_string()));
                    continue;
                }
            };

            let Some(template) = supported(&bulk.content) else {
                warn!(recipient = index + 1, total, message_type = bulk.content.kind(), "Skipping unsupported message type");
                results.push(SendResult::failed(identifier, unsupported_reason(&bulk.content)));
                continue;
            };

            let content = personalize(template, recipient.variables.as_ref());
            let message = OutboundMessage::build(&number, &content);
            let result = self.deliver(instance, identifier, &message).await;
            debug!(recipient = index + 1, total, success = result.success, "Recipient processed");
            results.push(result);

            if index + 1 < total && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        let summary = DispatchSummary::from_results(results);
        info!(
            total = summary.total_units,
            successful = summary.successful_sends,
            failed = summary.failed_sends,
            "Bulk dispatch finished"
        );
        Ok(summary)
    }

    async fn run_multi_block(
        &self,
        instance: &str,
        multi: &MultiBlockDispatch,
    ) -> Result<DispatchSummary, EngineError> {
        if multi.blocks.is_empty() {
            return Err(EngineError::NoBlocks);
        }

        let number = phone::normalize(&multi.phone)
            .map_err(|rejected| EngineError::InvalidPhone(rejected.raw))?;

        if let Some(start_delay_ms) = multi.start_delay_ms.filter(|ms| *ms > 0) {
            debug!(start_delay_ms, "Waiting before first block");
            tokio::time::sleep(Duration::from_millis(start_delay_ms)).await;
        }

        // Stable, so equal orders keep their input order
        let mut blocks: Vec<_> = multi.blocks.iter().collect();
        blocks.sort_by_key(|block| block.order);

        let total = blocks.len();
        let pause = Duration::from_millis(multi.block_delay_ms);
        let mut results = Vec::with_capacity(total);

        for (index, block) in blocks.into_iter().enumerate() {
            let identifier = block.order.to_string();

            let Some(content) = supported(&block.content) else {
                warn!(order = block.order, message_type = block.content.kind(), "Skipping block with unsupported message type");
                results.push(SendResult::failed(identifier, unsupported_reason(&block.content)));
                continue;
            };

            let message = OutboundMessage::build(&number, content);
            let result = self.deliver(instance, identifier, &message).await;
            debug!(order = block.order, success = result.success, "Block processed");
            results.push(result);

            if index + 1 < total && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        let summary = DispatchSummary::from_results(results);
        info!(
            number = %number,
            total = summary.total_units,
            successful = summary.successful_sends,
            failed = summary.failed_sends,
            "Multi-block dispatch finished"
        );
        Ok(summary)
    }

    fn check_summary(&self, summary: DispatchSummary) -> Result<DispatchSummary, EngineError> {
        if self.config.fail_when_all_units_fail
            && summary.successful_sends == 0
            && summary.failed_sends > 0
        {
            return Err(EngineError::AllUnitsFailed(summary.failed_sends));
        }
        Ok(summary)
    }

    /// Send one unit and turn the outcome into a result record
    async fn deliver(&self, instance: &str, identifier: String, message: &OutboundMessage) -> SendResult {
        match self.send(instance, message).await {
            Ok(response) if response.is_accepted() => {
                SendResult::sent(identifier, response.into_value())
            }
            Ok(response) => {
                warn!(number = %message.number, "Gateway response did not confirm the send");
                SendResult::failed(identifier, NOT_CONFIRMED).with_provider_response(response.into_value())
            }
            Err(e) => {
                warn!(
                    number = %message.number,
                    status_code = e.status_code(),
                    error = %e,
                    "Unit send failed"
                );
                SendResult::failed(identifier, e.to_string())
            }
        }
    }

    async fn send(&self, instance: &str, message: &OutboundMessage) -> Result<ProviderResponse, GatewayError> {
        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                debug!("Rate limited - waiting for permit");
                limiter.until_ready().await;
            }
        }
        self.gateway.send(instance, message).await
    }
}

fn supported(content: &Content) -> Option<&MessageContent> {
    match content {
        Content::Supported(content) => Some(content),
        Content::Unsupported(_) => None,
    }
}

fn unsupported_reason(content: &Content) -> String {
    format!("unsupported message type: {}", content.kind())
}

/// Expand every text field of `content` with one recipient's variables
pub fn personalize(content: &MessageContent, vars: Option<&Variables>) -> MessageContent {
    let fill = |field: &Option<String>| expand(field.as_deref(), vars);

    match content {
        MessageContent::Text(text) => {
            let mut text = text.clone();
            text.message = fill(&text.message);
            MessageContent::Text(text)
        }
        MessageContent::Media(media) => {
            let mut media = media.clone();
            media.caption = fill(&media.caption);
            MessageContent::Media(media)
        }
        MessageContent::Audio(audio) => MessageContent::Audio(audio.clone()),
        MessageContent::Buttons(buttons) => {
            let mut buttons = buttons.clone();
            buttons.title = fill(&buttons.title);
            buttons.description = fill(&buttons.description);
            buttons.footer = fill(&buttons.footer);
            MessageContent::Buttons(buttons)
        }
        MessageContent::List(list) => {
            let mut list = list.clone();
            list.title = fill(&list.title);
            list.description = fill(&list.description);
            list.button_text = fill(&list.button_text);
            list.footer_text = fill(&list.footer_text);
            MessageContent::List(list)
        }
        MessageContent::Poll(poll) => {
            let mut poll = poll.clone();
            poll.name = expand(Some(&poll.name), vars).unwrap_or_default();
            MessageContent::Poll(poll)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{ListContent, MediaContent, SendOptions};
    use serde_json::json;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.insert("name".to_string(), json!("Ana"));
        vars
    }

    #[test]
    fn test_personalize_media_caption_only() {
        let content = MessageContent::Media(MediaContent {
            media_url: "https://cdn.example.com/{{name}}.png".to_string(),
            mediatype: Some("image".to_string()),
            mimetype: None,
            caption: Some("For {{name}}".to_string()),
            file_name: None,
            options: SendOptions::default(),
        });

        match personalize(&content, Some(&vars())) {
            MessageContent::Media(media) => {
                assert_eq!(media.caption.as_deref(), Some("For Ana"));
                assert_eq!(media.media_url, "https://cdn.example.com/{{name}}.png");
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_personalize_list_fields() {
        let content = MessageContent::List(ListContent {
            title: Some("Hi {{name}}".to_string()),
            description: Some("{{name}}, pick one".to_string()),
            button_text: Some("Open, {{name}}".to_string()),
            footer_text: None,
            values: vec![json!({"title": "{{name}}"})],
            options: SendOptions::default(),
        });

        match personalize(&content, Some(&vars())) {
            MessageContent::List(list) => {
                assert_eq!(list.title.as_deref(), Some("Hi Ana"));
                assert_eq!(list.description.as_deref(), Some("Ana, pick one"));
                assert_eq!(list.button_text.as_deref(), Some("Open, Ana"));
                assert_eq!(list.footer_text, None);
                // Sections are passed through untouched
                assert_eq!(list.values, vec![json!({"title": "{{name}}"})]);
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_personalize_without_variables() {
        let content = MessageContent::text("Hi {{name}}");
        assert_eq!(personalize(&content, None), content);
    }
}
