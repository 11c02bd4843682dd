use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::core::config::Settings;
use crate::schemas::print::{DetectedAnswer, Detection};

const DETECTION_SYSTEM_PROMPT: &str = r#"You read hand-filled multiple-choice bubble sheets.
Each row is numbered and has four bubbles A, B, C, D.

Return strict JSON:
{
  "answers": [{"q": <row number>, "sel": <0 for A, 1 for B, 2 for C, 3 for D>, "conf": <0.0..1.0>}],
  "warnings": ["free-text notes about unreadable or ambiguous rows"]
}

Rules:
- Report only rows where a bubble is filled. Leave blank rows out.
- If a row has several filled bubbles or a mark you cannot read, report your best guess with a low conf and add a warning.
- Never invent answers for rows you cannot see.
"#;

#[derive(Debug, Error)]
pub(crate) enum VisionError {
    #[error("vision provider error: {0}")]
    Provider(String),
    #[error("malformed vision response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct PageImage {
    pub(crate) bytes: Vec<u8>,
    pub(crate) media_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SheetMeta {
    pub(crate) question_count: usize,
    pub(crate) start_index: u32,
}

/// Turns page images into validated detections. Implementations never return
/// provider-shaped data.
#[async_trait]
pub(crate) trait VisionAdapter: Send + Sync {
    async fn detect(&self, pages: Vec<PageImage>, meta: SheetMeta)
        -> Result<Detection, VisionError>;
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiVision {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    image_detail: String,
}

impl OpenAiVision {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let vision = settings.vision();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(vision.request_timeout))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: vision.openai_api_key.clone(),
            base_url: vision.openai_base_url.trim_end_matches('/').to_string(),
            model: vision.model.clone(),
            max_tokens: vision.max_tokens,
            image_detail: vision.image_detail.clone(),
        })
    }

    fn build_payload(&self, pages: &[PageImage], meta: SheetMeta) -> Value {
        let last = meta.start_index as usize + meta.question_count.saturating_sub(1);
        let user_prompt = format!(
            "The sheet has {count} questions numbered {first}..={last} across {pages} page(s). \
             Read every filled bubble and answer in the JSON format from the system prompt.",
            count = meta.question_count,
            first = meta.start_index,
            pages = pages.len(),
        );

        let mut content = vec![json!({"type": "text", "text": user_prompt})];
        for (index, page) in pages.iter().enumerate() {
            let data_url = format!("data:{};base64,{}", page.media_type, STANDARD.encode(&page.bytes));
            if page.media_type == "application/pdf" {
                content.push(json!({
                    "type": "file",
                    "file": {"filename": format!("page-{}.pdf", index + 1), "file_data": data_url}
                }));
            } else {
                content.push(json!({
                    "type": "image_url",
                    "image_url": {"url": data_url, "detail": self.image_detail}
                }));
            }
        }

        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": DETECTION_SYSTEM_PROMPT},
                {"role": "user", "content": content}
            ],
            "max_completion_tokens": self.max_tokens,
            "response_format": {"type": "json_object"}
        })
    }
}

#[async_trait]
impl VisionAdapter for OpenAiVision {
    async fn detect(
        &self,
        pages: Vec<PageImage>,
        meta: SheetMeta,
    ) -> Result<Detection, VisionError> {
        if self.api_key.is_empty() {
            return Err(VisionError::Provider("OPENAI_API_KEY is not configured".to_string()));
        }

        let payload = self.build_payload(&pages, meta);
        let url = format!("{}/chat/completions", self.base_url);
        let timer = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| VisionError::Provider(err.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        metrics::histogram!("print_vision_duration_seconds").record(timer.elapsed().as_secs_f64());

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(VisionError::Provider(format!("HTTP {}: {message}", status.as_u16())));
        }

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| VisionError::Provider("empty completion".to_string()))?;

        let tokens = body.pointer("/usage/total_tokens").and_then(Value::as_u64);
        tracing::debug!(model = %self.model, tokens, "Vision completion received");

        parse_detection(content, pages.len())
    }
}

/// The only path from provider text to a typed [`Detection`].
pub(crate) fn parse_detection(content: &str, page_count: usize) -> Result<Detection, VisionError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|err| VisionError::Malformed(format!("response is not JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| VisionError::Malformed("response is not a JSON object".to_string()))?;

    let answers = object
        .get("answers")
        .and_then(Value::as_array)
        .ok_or_else(|| VisionError::Malformed("answers must be an array".to_string()))?;

    let mut parsed = Vec::with_capacity(answers.len());
    let mut seen = HashSet::with_capacity(answers.len());
    for (index, entry) in answers.iter().enumerate() {
        let entry = entry
            .as_object()
            .ok_or_else(|| VisionError::Malformed(format!("answers[{index}] is not an object")))?;

        let q = integral_field(entry, "q", index)?;
        if q < 1 || q > i64::from(u32::MAX) {
            return Err(VisionError::Malformed(format!("answers[{index}].q must be >= 1, got {q}")));
        }
        let sel = integral_field(entry, "sel", index)?;
        if !(0..=3).contains(&sel) {
            return Err(VisionError::Malformed(format!(
                "answers[{index}].sel must be within 0..=3, got {sel}"
            )));
        }
        let conf = entry
            .get("conf")
            .and_then(Value::as_f64)
            .ok_or_else(|| VisionError::Malformed(format!("answers[{index}].conf must be numeric")))?;
        if !conf.is_finite() || !(0.0..=1.0).contains(&conf) {
            return Err(VisionError::Malformed(format!(
                "answers[{index}].conf must be within [0, 1], got {conf}"
            )));
        }
        if !seen.insert(q) {
            return Err(VisionError::Malformed(format!("answers[{index}].q duplicates question {q}")));
        }

        parsed.push(DetectedAnswer { q: q as u32, sel: sel as u8, conf });
    }

    let warnings = match object.get("warnings") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    VisionError::Malformed("warnings must be an array of strings".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(VisionError::Malformed("warnings must be an array of strings".to_string()))
        }
    };

    Ok(Detection { answers: parsed, warnings, pages: page_count as u32 })
}

fn integral_field(entry: &Map<String, Value>, field: &str, index: usize) -> Result<i64, VisionError> {
    let value = entry
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| VisionError::Malformed(format!("answers[{index}].{field} must be numeric")))?;
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(VisionError::Malformed(format!(
            "answers[{index}].{field} must be an integer, got {value}"
        )));
    }
    Ok(value as i64)
}
