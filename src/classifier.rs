//! Triage classification of a pre-consultation chat.
//!
//! The remote model is reached through [`TriageClassifier`]. Callers go through
//! [`assess_with_fallback`], which retries transient failures a bounded number
//! of times and then degrades to a summary built from the patient's own turns,
//! so a submission never waits on the model indefinitely.
//!
//! The same endpoint also drives the intake chat itself through
//! [`AssistantReply`] and [`next_assistant_turn`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ChatTurn, Speaker, TriageCode};

pub const FALLBACK_NEXT_STEPS: &str = "Conduct full examination and review patient history.";
const FALLBACK_SYMPTOM_CHARS: usize = 200;

pub const ASSISTANT_REPEAT_REPLY: &str = "I apologize, could you repeat that?";
pub const ASSISTANT_UNAVAILABLE_REPLY: &str =
    "I apologize, but I'm having trouble connecting. Please try again.";

const ASSISTANT_PROMPT: &str = "You are a helpful medical triage assistant for MediQ hospital. \
Ask relevant questions about symptoms, duration, and severity. Keep responses to 2-3 sentences. \
Do not provide medical diagnoses.";

const SYSTEM_PROMPT: &str = r#"You are a medical triage AI assistant. Analyze the following pre-consultation conversation and provide:

1. A concise summary of the patient's symptoms, medical history, and concerns (2-3 sentences)
2. A triage code based on urgency:
   - RED: Emergency - life-threatening symptoms, severe pain, difficulty breathing, chest pain, severe bleeding, loss of consciousness
   - YELLOW: Urgent - moderate symptoms requiring prompt attention, persistent pain, high fever, suspected fractures
   - GREEN: Non-urgent - minor symptoms, routine check-ups, mild discomfort, preventive care
3. Suggested next steps for the doctor (1-2 sentences)

Respond ONLY with valid JSON in this exact format:
{
  "summary": "Brief summary of symptoms and patient concerns",
  "triageCode": "red" | "yellow" | "green",
  "nextSteps": "Recommended actions for the doctor"
}"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub summary_text: String,
    pub triage_code: TriageCode,
    pub next_steps: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageOutcome {
    pub assessment: Assessment,
    /// True when the assessment is the local fallback.
    pub degraded: bool,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("classifier returned HTTP {0}")]
    Status(u16),

    #[error("classifier returned no content")]
    EmptyResponse,

    #[error("classifier response malformed: {0}")]
    Malformed(String),

    #[error("classifier is not configured (missing API key)")]
    NotConfigured,
}

impl ClassifierError {
    /// Rate limits, timeouts, server errors and empty replies are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            ClassifierError::Transport(_) | ClassifierError::EmptyResponse => true,
            ClassifierError::Status(code) => *code == 408 || *code == 429 || *code >= 500,
            ClassifierError::Malformed(_) | ClassifierError::NotConfigured => false,
        }
    }
}

#[async_trait]
pub trait TriageClassifier: Send + Sync {
    async fn classify(&self, turns: &[ChatTurn]) -> Result<Assessment, ClassifierError>;
}

/// Produces the assistant's next turn in a pre-consultation chat.
#[async_trait]
pub trait AssistantReply: Send + Sync {
    async fn reply(&self, turns: &[ChatTurn]) -> Result<String, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling each time.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        self.initial_backoff.saturating_mul(factor)
    }
}

pub async fn assess_with_fallback(
    classifier: &dyn TriageClassifier,
    turns: &[ChatTurn],
    policy: &RetryPolicy,
) -> TriageOutcome {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match classifier.classify(turns).await {
            Ok(assessment) => {
                debug!(attempt, triage = %assessment.triage_code, "classifier answered");
                return TriageOutcome {
                    assessment,
                    degraded: false,
                };
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff_after(attempt);
                warn!(attempt, ?delay, error = %err, "classifier call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(attempt, error = %err, "classifier unavailable, using fallback triage");
                break;
            }
        }
    }

    TriageOutcome {
        assessment: fallback_assessment(turns),
        degraded: true,
    }
}

/// Next assistant turn, retried like classification. A model that is still
/// rate limited or overloaded after the last attempt is reported as an error
/// so the caller can ask the patient to wait; any other failure yields a
/// canned apology.
pub async fn next_assistant_turn(
    assistant: &dyn AssistantReply,
    turns: &[ChatTurn],
    policy: &RetryPolicy,
) -> Result<String, ClassifierError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match assistant.reply(turns).await {
            Ok(text) => {
                debug!(attempt, chars = text.len(), "assistant answered");
                return Ok(text);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff_after(attempt);
                warn!(attempt, ?delay, error = %err, "assistant call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err @ ClassifierError::Status(429 | 503)) => {
                warn!(attempt, error = %err, "assistant is busy");
                return Err(err);
            }
            Err(err) => {
                warn!(attempt, error = %err, "assistant unavailable");
                return Ok(ASSISTANT_UNAVAILABLE_REPLY.to_string());
            }
        }
    }
}

/// Deterministic triage used when the classifier cannot answer: yellow, with
/// the patient's own words as the summary.
pub fn fallback_assessment(turns: &[ChatTurn]) -> Assessment {
    let symptoms = turns
        .iter()
        .filter(|turn| turn.speaker == Speaker::Patient)
        .map(|turn| turn.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(". ");

    let summary_text = if symptoms.is_empty() {
        "Patient did not describe any symptoms.".to_string()
    } else {
        let clipped: String = symptoms.chars().take(FALLBACK_SYMPTOM_CHARS).collect();
        format!("Patient reported: {clipped}...")
    };

    Assessment {
        summary_text,
        triage_code: TriageCode::Yellow,
        next_steps: FALLBACK_NEXT_STEPS.to_string(),
    }
}

pub fn render_transcript(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let label = match turn.speaker {
                Speaker::Patient => "Patient",
                Speaker::Assistant => "Assistant",
            };
            format!("{label}: {}", turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the model's JSON reply. Unknown triage codes become yellow.
pub fn parse_assessment(content: &str) -> Result<Assessment, ClassifierError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RawAssessment {
        summary: Option<String>,
        triage_code: Option<String>,
        next_steps: Option<String>,
    }

    let raw: RawAssessment = serde_json::from_str(content.trim())
        .map_err(|err| ClassifierError::Malformed(err.to_string()))?;

    let non_empty = |value: Option<String>, field: &str| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ClassifierError::Malformed(format!("missing {field}")))
    };

    let summary_text = non_empty(raw.summary, "summary")?;
    let code = non_empty(raw.triage_code, "triageCode")?;
    let next_steps = non_empty(raw.next_steps, "nextSteps")?;

    let triage_code = code.parse().unwrap_or_else(|_| {
        warn!(code = %code, "invalid triage code from classifier, defaulting to yellow");
        TriageCode::Yellow
    });

    Ok(Assessment {
        summary_text,
        triage_code,
        next_steps,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
}

/// Classifier backed by an OpenAI-compatible chat-completions endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    config: HttpClassifierConfig,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct CompletionMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionContent,
}

#[derive(Deserialize)]
struct CompletionContent {
    content: Option<String>,
}

impl HttpClassifier {
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// First choice's content, or `None` when the model sent nothing usable.
    async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Option<String>, ClassifierError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ClassifierError::NotConfigured)?;

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let body: CompletionResponse = response.json().await?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty()))
    }
}

#[async_trait]
impl TriageClassifier for HttpClassifier {
    async fn classify(&self, turns: &[ChatTurn]) -> Result<Assessment, ClassifierError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages: vec![
                CompletionMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                CompletionMessage {
                    role: "user",
                    content: format!("Conversation:\n{}", render_transcript(turns)),
                },
            ],
            temperature: 0.3,
            max_tokens: 300,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let content = self
            .complete(&request)
            .await?
            .ok_or(ClassifierError::EmptyResponse)?;
        parse_assessment(&content)
    }
}

#[async_trait]
impl AssistantReply for HttpClassifier {
    async fn reply(&self, turns: &[ChatTurn]) -> Result<String, ClassifierError> {
        let mut messages = vec![CompletionMessage {
            role: "system",
            content: ASSISTANT_PROMPT.to_string(),
        }];
        messages.extend(turns.iter().map(|turn| CompletionMessage {
            role: match turn.speaker {
                Speaker::Patient => "user",
                Speaker::Assistant => "assistant",
            },
            content: turn.text.clone(),
        }));

        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            temperature: 0.7,
            max_tokens: 150,
            response_format: None,
        };

        let content = self.complete(&request).await?;
        Ok(content.unwrap_or_else(|| ASSISTANT_REPEAT_REPLY.to_string()))
    }
}
