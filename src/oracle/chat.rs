//! Oracle over a chat-completion client.
//!
//! # Prompt Shape
//! ```text
//! system:    instruction + required JSON output fields
//! user:      demo 1 inputs        } repeated per
//! assistant: demo 1 outputs (JSON) } demonstration
//! user:      real inputs
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use super::{LanguageOracle, OracleError, Prompt};
use crate::llm::{ChatMessage, ChatOptions, LlmClient, LlmError, LlmErrorKind};
use crate::signature::{FieldSpec, Fields};

/// [`LanguageOracle`] that talks JSON to a chat model.
pub struct ChatOracle {
    llm: Arc<dyn LlmClient>,
    model: String,
    options: ChatOptions,
}

impl ChatOracle {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            options: ChatOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Render a prompt into chat messages.
    pub fn render(prompt: &Prompt) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2 + prompt.demonstrations.len() * 2);
        messages.push(ChatMessage::system(render_system(
            &prompt.instruction,
            &prompt.outputs,
        )));

        for demo in &prompt.demonstrations {
            messages.push(ChatMessage::user(render_inputs(&demo.inputs)));
            let outputs = serde_json::to_string(&demo.outputs).unwrap_or_default();
            messages.push(ChatMessage::assistant(outputs));
        }

        messages.push(ChatMessage::user(render_inputs(&prompt.inputs)));
        messages
    }

    /// Extract the requested fields from a model reply.
    pub fn parse_reply(reply: &str, outputs: &[FieldSpec]) -> Result<Fields, OracleError> {
        let body = extract_json_object(reply).ok_or_else(|| {
            OracleError::non_conforming(format!(
                "reply contains no JSON object: {}",
                truncate(reply, 200)
            ))
        })?;

        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| OracleError::non_conforming(format!("invalid JSON in reply: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| OracleError::non_conforming("reply is not a JSON object"))?;

        let mut fields = Fields::new();
        for spec in outputs {
            let text = match object.get(&spec.name) {
                None | Some(serde_json::Value::Null) => {
                    return Err(OracleError::non_conforming(format!(
                        "reply is missing field '{}'",
                        spec.name
                    )))
                }
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            fields.insert(spec.name.clone(), text);
        }
        Ok(fields)
    }
}

#[async_trait]
impl LanguageOracle for ChatOracle {
    async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError> {
        let messages = Self::render(prompt);
        let response = self
            .llm
            .chat_completion(&self.model, &messages, self.options.clone())
            .await
            .map_err(from_llm_error)?;

        let content = response
            .content
            .ok_or_else(|| OracleError::non_conforming("empty completion"))?;
        Self::parse_reply(&content, &prompt.outputs)
    }
}

fn from_llm_error(err: LlmError) -> OracleError {
    let mut mapped = match err.kind {
        LlmErrorKind::Timeout => OracleError::timeout(err.to_string()),
        LlmErrorKind::RateLimited => {
            OracleError::new(super::OracleErrorKind::RateLimited, err.to_string())
        }
        LlmErrorKind::ServerError | LlmErrorKind::NetworkError => {
            OracleError::unavailable(err.to_string())
        }
        LlmErrorKind::ClientError => OracleError::rejected(err.to_string()),
        LlmErrorKind::ParseError => OracleError::non_conforming(err.to_string()),
    };
    mapped.retry_after = err.retry_after;
    mapped
}

fn render_system(instruction: &str, outputs: &[FieldSpec]) -> String {
    let mut text = String::from(instruction.trim());
    text.push_str(
        "\n\nRespond with a single JSON object and nothing else. It must have exactly these string fields:\n",
    );
    for spec in outputs {
        if spec.description.is_empty() {
            text.push_str(&format!("- \"{}\"\n", spec.name));
        } else {
            text.push_str(&format!("- \"{}\": {}\n", spec.name, spec.description));
        }
    }
    text
}

fn render_inputs(inputs: &Fields) -> String {
    inputs
        .iter()
        .map(|(name, value)| format!("## {}\n{}", name, value))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Slice from the first `{` to the last `}`; tolerates code fences and chatter.
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, Role};
    use crate::oracle::{Exemplar, OracleErrorKind};
    use std::sync::Mutex;

    struct ScriptedLlm {
        reply: Result<String, LlmErrorKind>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        options: Mutex<Vec<ChatOptions>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            options: ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.options.lock().unwrap().push(options);
            match &self.reply {
                Ok(text) => Ok(ChatResponse {
                    content: Some(text.clone()),
                }),
                Err(LlmErrorKind::RateLimited) => Err(LlmError::rate_limited("slow".into(), None)),
                Err(_) => Err(LlmError::client_error(400, "bad".into())),
            }
        }
    }

    fn outputs() -> Vec<FieldSpec> {
        vec![FieldSpec::new("code", "the snippet"), FieldSpec::named("note")]
    }

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_reply_tolerates_fences_and_numbers() {
        let reply = "Sure:\n```json\n{\"code\": \"x = 1\", \"note\": 3, \"extra\": true}\n```";
        let parsed = ChatOracle::parse_reply(reply, &outputs()).unwrap();
        assert_eq!(parsed, fields(&[("code", "x = 1"), ("note", "3")]));
    }

    #[test]
    fn test_parse_reply_missing_field_is_non_conforming() {
        let err = ChatOracle::parse_reply("{\"code\": \"x\"}", &outputs()).unwrap_err();
        assert_eq!(err.kind, OracleErrorKind::NonConforming);

        let err = ChatOracle::parse_reply("no json here", &outputs()).unwrap_err();
        assert_eq!(err.kind, OracleErrorKind::NonConforming);
    }

    #[test]
    fn test_render_places_demonstrations_before_inputs() {
        let prompt = Prompt::new("Write code.", fields(&[("task", "real")]), outputs())
            .with_demonstrations(vec![Exemplar {
                inputs: fields(&[("task", "demo")]),
                outputs: fields(&[("code", "c"), ("note", "n")]),
            }]);

        let messages = ChatOracle::render(&prompt);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("\"code\": the snippet"));
        assert!(messages[1].content.contains("demo"));
        assert_eq!(messages[2].role, Role::Assistant);
        assert!(messages[3].content.contains("real"));
    }

    #[tokio::test]
    async fn test_llm_errors_are_classified() {
        let llm = Arc::new(ScriptedLlm {
            reply: Err(LlmErrorKind::RateLimited),
            seen: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        });
        let oracle = ChatOracle::new(llm, "test-model");
        let prompt = Prompt::new("x", Fields::new(), outputs());
        let err = oracle.complete(&prompt).await.unwrap_err();
        assert_eq!(err.kind, OracleErrorKind::RateLimited);

        let llm = Arc::new(ScriptedLlm {
            reply: Err(LlmErrorKind::ClientError),
            seen: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        });
        let oracle = ChatOracle::new(llm, "test-model");
        let err = oracle.complete(&prompt).await.unwrap_err();
        assert_eq!(err.kind, OracleErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_complete_round_trip() {
        let llm = Arc::new(ScriptedLlm {
            reply: Ok("{\"code\": \"for k, v in d.items(): ...\", \"note\": \"ok\"}".into()),
            seen: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        });
        let oracle = ChatOracle::new(llm.clone(), "test-model");
        let prompt = Prompt::new("x", fields(&[("task", "iterate")]), outputs());
        let out = oracle.complete(&prompt).await.unwrap();
        assert_eq!(out["note"], "ok");
        assert_eq!(llm.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_options_reach_the_client() {
        let llm = Arc::new(ScriptedLlm {
            reply: Ok("{\"code\": \"x\", \"note\": \"y\"}".into()),
            seen: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        });
        let oracle = ChatOracle::new(llm.clone(), "test-model").with_options(ChatOptions {
            temperature: Some(0.3),
            max_tokens: Some(256),
        });
        oracle
            .complete(&Prompt::new("x", Fields::new(), outputs()))
            .await
            .unwrap();

        let options = llm.options.lock().unwrap();
        assert_eq!(options[0].temperature, Some(0.3));
        assert_eq!(options[0].max_tokens, Some(256));
    }
}
