//! HTTP implementation of the collaborator traits.
//!
//! Every call is a JSON POST against `backend_url`. Synthesis responses are
//! newline-delimited JSON objects of the form `{"token": "..."}`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broadcast::TokenSink;
use crate::engine::state::{Augmentation, Decision, DecisionSource, RetrievedItem, ToolOutput};
use crate::error::CollaboratorError;

use super::{
    Augmenter, DecisionProvider, Reranker, Retriever, SynthesisRequest, Synthesizer, ToolBackend, ToolRequest,
    ToolResult,
};

#[derive(Clone, Debug)]
pub struct HttpBackend {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ItemsResponse {
    items: Vec<RetrievedItem>,
}

#[derive(Deserialize)]
struct DecisionResponse {
    needs_tool: bool,
    #[serde(default)]
    rationale: String,
    confidence: f64,
}

#[derive(Deserialize)]
struct TokenLine {
    #[serde(default)]
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, CollaboratorError> {
        let res = self.http.post(self.url(path)).json(body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!("POST {} returned {} - {}", path, status, text)));
        }
        Ok(res)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        let res = self.post(path, body).await?;
        let text = res.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Retriever for HttpBackend {
    async fn retrieve(
        &self,
        query: &str,
        datasource_ref: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError> {
        let body = json!({ "query": query, "datasource_ref": datasource_ref, "top_k": top_k });
        let res: ItemsResponse = self.post_json("/retrieve", &body).await?;
        Ok(res.items)
    }
}

#[async_trait]
impl Reranker for HttpBackend {
    async fn rerank(
        &self,
        query: &str,
        items: &[RetrievedItem],
        top_n: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError> {
        let body = json!({ "query": query, "items": items, "top_n": top_n });
        let res: ItemsResponse = self.post_json("/rerank", &body).await?;
        Ok(res.items)
    }
}

#[async_trait]
impl DecisionProvider for HttpBackend {
    async fn decide(&self, query: &str, context: &[RetrievedItem]) -> Result<Decision, CollaboratorError> {
        let body = json!({ "query": query, "context": context });
        let res: DecisionResponse = self.post_json("/decide", &body).await?;
        if !(0.0..=1.0).contains(&res.confidence) {
            return Err(CollaboratorError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                res.confidence
            )));
        }
        Ok(Decision {
            needs_tool: res.needs_tool,
            rationale: res.rationale,
            confidence: res.confidence,
            source: DecisionSource::Primary,
        })
    }
}

#[async_trait]
impl ToolBackend for HttpBackend {
    async fn execute(&self, request: &ToolRequest) -> Result<ToolResult, CollaboratorError> {
        self.post_json("/tool", request).await
    }
}

#[async_trait]
impl Augmenter for HttpBackend {
    async fn augment(&self, query: &str, output: &ToolOutput) -> Result<Augmentation, CollaboratorError> {
        let body = json!({ "query": query, "columns": output.columns, "rows": output.rows });
        self.post_json("/augment", &body).await
    }
}

#[async_trait]
impl Synthesizer for HttpBackend {
    async fn synthesize(&self, request: &SynthesisRequest, sink: &TokenSink) -> Result<String, CollaboratorError> {
        let mut res = self.post("/synthesize", request).await?;
        let mut answer = String::new();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = res.chunk().await? {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(token) = parse_token_line(&line)? {
                    sink.send(&token).await;
                    answer.push_str(&token);
                }
            }
        }
        if let Some(token) = parse_token_line(&buffer)? {
            sink.send(&token).await;
            answer.push_str(&token);
        }

        Ok(answer)
    }
}

fn parse_token_line(line: &[u8]) -> Result<Option<String>, CollaboratorError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    let parsed: TokenLine = serde_json::from_str(text)?;
    Ok((!parsed.token.is_empty()).then_some(parsed.token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let backend = HttpBackend::new("http://localhost:8090/");
        assert_eq!(backend.url("/retrieve"), "http://localhost:8090/retrieve");
    }

    #[test]
    fn test_parse_token_line() {
        assert_eq!(parse_token_line(b"{\"token\":\"Hel\"}\n").unwrap(), Some("Hel".to_string()));
        assert_eq!(parse_token_line(b"  \n").unwrap(), None);
        assert_eq!(parse_token_line(b"{\"token\":\"\"}").unwrap(), None);
        assert!(parse_token_line(b"not json").is_err());
    }
}
