//! Classification dispatch: a local marketplace heuristic first, then the
//! external classifier through the retry primitive.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{BusinessConfig, ClassifierConfig};
use crate::error::{Result, TriageError};
use crate::models::{MessageSnapshot, Verdict};
use crate::retry::{execute_with_retry, RetryPolicy};

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Marketplace + hardware keyword rule
///
/// A message matches when the sender or subject mentions a marketplace
/// and the subject or body mentions a hardware term. Substring tests,
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct BusinessRule {
    enabled: bool,
    marketplace_terms: Vec<String>,
    hardware_terms: Vec<String>,
}

impl BusinessRule {
    pub fn from_config(config: &BusinessConfig) -> Self {
        let lower = |terms: &[String]| {
            terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            enabled: config.enabled,
            marketplace_terms: lower(&config.marketplace_terms),
            hardware_terms: lower(&config.hardware_terms),
        }
    }

    pub fn matches(&self, sender: &str, subject: &str, body: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let sender = sender.to_lowercase();
        let subject = subject.to_lowercase();

        let from_marketplace = self
            .marketplace_terms
            .iter()
            .any(|term| sender.contains(term.as_str()) || subject.contains(term.as_str()));
        if !from_marketplace {
            return false;
        }

        let combined = format!("{} {}", subject, body.to_lowercase());
        self.hardware_terms
            .iter()
            .any(|term| combined.contains(term.as_str()))
    }
}

/// Repair common LLM damage to JSON output
pub fn fix_json(input: &str) -> String {
    input
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace("```json", "")
        .replace('`', "'")
        .replace("\\_", "_")
        .replace("'''json\n", "")
        .replace("'''json", "")
        .replace("'''", "")
        .trim()
        .to_string()
}

fn truthiness(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Map raw classifier output onto a verdict
///
/// Unknown, malformed or missing judgments are `Undetermined`.
pub fn normalize_verdict(raw: &str) -> Verdict {
    let fixed = fix_json(raw);

    let parsed = serde_json::from_str::<Value>(&fixed).ok().or_else(|| {
        JSON_OBJECT
            .find(&fixed)
            .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
    });

    let (judgment, category) = match parsed {
        Some(Value::Object(map)) => {
            let judgment = map.get("judgment").and_then(truthiness);
            let category = map
                .get("category")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|c| {
                    !c.is_empty() && !matches!(c.to_lowercase().as_str(), "null" | "none" | "unknown")
                })
                .map(str::to_string);
            (judgment, category)
        }
        Some(other) => (truthiness(&other), None),
        None => (truthiness(&Value::String(fixed.clone())), None),
    };

    match judgment {
        Some(true) => Verdict::WorthReading { category },
        Some(false) => Verdict::NotWorthReading { category },
        None => Verdict::Undetermined,
    }
}

/// Input to one external classification call
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRequest {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
}

/// External classifier; returns raw model output
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String>;
}

/// OpenAI-compatible chat completion classifier
pub struct OpenAiClassifier {
    client: async_openai::Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    categories: Vec<String>,
}

impl OpenAiClassifier {
    pub fn new(config: &ClassifierConfig, api_key: String, categories: Vec<String>) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = &config.api_base {
            openai_config = openai_config.with_api_base(base);
        }

        // retries are owned by the caller's RetryPolicy
        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Self {
            client: async_openai::Client::with_config(openai_config).with_backoff(no_retry),
            model: config.model.clone(),
            temperature: config.temperature,
            categories,
        }
    }

    /// Reads the key from `OPENAI_API_KEY`
    pub fn from_env(config: &ClassifierConfig, categories: Vec<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| TriageError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self::new(config, api_key, categories))
    }

    fn system_prompt(&self) -> String {
        let categories = if self.categories.is_empty() {
            "none".to_string()
        } else {
            self.categories.join(", ")
        };
        format!(
            "You triage a personal mailbox. Decide whether the email below is worth its \
             recipient's time to read. Respond with JSON only, no prose: \
             {{\"judgment\": true | false | \"unknown\", \"category\": \"<folder>\"}}. \
             Use \"unknown\" when you cannot tell. Pick the category from: {}.",
            categories
        )
    }

    fn user_prompt(request: &ClassificationRequest) -> String {
        format!(
            "From: {}\nSubject: {}\nDate: {}\n\n{}",
            request.sender,
            request.subject,
            request.date.to_rfc2822(),
            request.body
        )
    }
}

#[async_trait]
impl ClassificationService for OpenAiClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt())
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(Self::user_prompt(request))
                .build()?
                .into(),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(chat_request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| TriageError::Classification("Empty completion".to_string()))
    }
}

/// Truncate to at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Decides a verdict per message
pub struct ClassificationDispatcher {
    business: BusinessRule,
    service: Arc<dyn ClassificationService>,
    policy: RetryPolicy,
    max_body_chars: usize,
    categories: Vec<String>,
}

impl ClassificationDispatcher {
    pub fn new(
        business: BusinessRule,
        service: Arc<dyn ClassificationService>,
        policy: RetryPolicy,
        max_body_chars: usize,
        categories: Vec<String>,
    ) -> Self {
        Self {
            business,
            service,
            policy,
            max_body_chars,
            categories,
        }
    }

    /// Business heuristic first; otherwise one classifier call under the retry policy
    pub async fn classify(&self, message: &MessageSnapshot) -> Result<Verdict> {
        if self
            .business
            .matches(&message.sender, &message.subject, &message.body)
        {
            info!(
                "Business email detected (uid {}): '{}' from {}",
                message.uid, message.subject, message.sender
            );
            return Ok(Verdict::BusinessAutoRoute);
        }

        let request = ClassificationRequest {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            body: truncate_chars(&message.body, self.max_body_chars).to_string(),
            date: message.date,
        };

        let service = &self.service;
        let request = &request;
        let raw = execute_with_retry("classification", &self.policy, move || {
            service.classify(request)
        })
        .await?;

        let verdict = self.canonicalize(normalize_verdict(&raw));
        debug!("Classifier verdict for uid {}: {:?}", message.uid, verdict);
        Ok(verdict)
    }

    /// Use the configured spelling of a category folder when one matches
    fn canonicalize(&self, verdict: Verdict) -> Verdict {
        let fix = |category: Option<String>| {
            category.map(|c| {
                self.categories
                    .iter()
                    .find(|known| known.eq_ignore_ascii_case(&c))
                    .cloned()
                    .unwrap_or(c)
            })
        };
        match verdict {
            Verdict::WorthReading { category } => Verdict::WorthReading {
                category: fix(category),
            },
            Verdict::NotWorthReading { category } => Verdict::NotWorthReading {
                category: fix(category),
            },
            other => other,
        }
    }
}
