//! Request/response body shapes for model extraction and the aggregate
//! listing endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The routing-relevant slice of a request body. Most endpoints carry the
/// model under `model`; copy/create-style endpoints use `name`.
#[derive(Debug, Clone, Deserialize)]
struct ExtractedModel {
    model: Option<String>,
    name: Option<String>,
}

/// Extract the model name from a request body. Malformed JSON or a missing
/// field is not an error: the request simply routes without model affinity.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let extracted: ExtractedModel = serde_json::from_slice(body).ok()?;
    extracted.model.or(extracted.name)
}

/// Legacy-style model list, as served by `/api/tags` and `/api/ps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<Value>,
}

/// OpenAI-style model list, as served by `/v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiModelList {
    #[serde(default = "list_object")]
    pub object: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

fn list_object() -> String {
    "list".to_string()
}

impl OpenAiModelList {
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            object: list_object(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_field() {
        let body = br#"{"model": "llama3:8b", "prompt": "hi"}"#;
        assert_eq!(extract_model(body), Some("llama3:8b".to_string()));
    }

    #[test]
    fn falls_back_to_name_field() {
        let body = br#"{"name": "mistral", "source": "mistral:7b"}"#;
        assert_eq!(extract_model(body), Some("mistral".to_string()));
    }

    #[test]
    fn model_takes_precedence_over_name() {
        let body = br#"{"model": "a", "name": "b"}"#;
        assert_eq!(extract_model(body), Some("a".to_string()));
    }

    #[test]
    fn malformed_json_yields_none() {
        assert_eq!(extract_model(b"not json"), None);
        assert_eq!(extract_model(b""), None);
        assert_eq!(extract_model(br#"{"prompt": "no model here"}"#), None);
    }
}
