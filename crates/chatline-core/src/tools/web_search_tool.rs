use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::completion::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{ToolError, ToolHandler};

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

#[derive(Deserialize, Serialize)]
pub struct WebSearchArgs {
    pub query: String,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    5
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchImage {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Ranked results for one query, best match first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub images: Vec<SearchImage>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> Result<SearchResults, ToolError>;
}

/// Brave Search API client.
pub struct HttpSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpSearchProvider {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        Self::with_endpoint(BRAVE_SEARCH_URL, api_key, timeout)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("chatline/0.1")
            .build()
            .map_err(|e| ToolError::SearchFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(&self, query: &str, count: usize) -> Result<SearchResults, ToolError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", count.to_string().as_str())])
            .send()
            .await
            .map_err(|e| ToolError::SearchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ToolError::SearchFailed(format!(
                "Search API HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::SearchFailed(e.to_string()))?;

        Ok(parse_search_response(query, &data, count))
    }
}

/// Extract ranked web results and images from a Brave-style response body.
pub fn parse_search_response(query: &str, data: &serde_json::Value, count: usize) -> SearchResults {
    let text = |v: &serde_json::Value, key: &str| {
        v.get(key)
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let results = data
        .pointer("/web/results")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("url").is_some())
                .take(count)
                .map(|item| SearchResult {
                    title: text(item, "title"),
                    url: text(item, "url"),
                    snippet: text(item, "description"),
                })
                .collect()
        })
        .unwrap_or_default();

    let images = data
        .pointer("/images/results")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = item
                        .pointer("/properties/url")
                        .or_else(|| item.get("url"))
                        .and_then(|u| u.as_str())?;
                    Some(SearchImage {
                        url: url.to_string(),
                        title: text(item, "title"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    SearchResults {
        query: query.to_string(),
        results,
        images,
    }
}

/// Automatic web search, bounded by `timeout`.
#[derive(Clone)]
pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    timeout: Duration,
}

impl WebSearchTool {
    pub const NAME: &'static str = "web_search";

    pub fn new(provider: Arc<dyn SearchProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Search the web. Returns ranked results with title, URL and snippet, \
                          plus related images when available."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query"
                    },
                    "count": {
                        "type": "integer",
                        "description": "Number of results",
                        "default": 5
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: WebSearchArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let query = args.query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".into()));
        }

        info!(query = %query, count = args.count, "Running web search");

        let results = tokio::time::timeout(self.timeout, self.provider.search(query, args.count))
            .await
            .map_err(|_| {
                warn!(query = %query, timeout_secs = self.timeout.as_secs(), "Web search timed out");
                ToolError::SearchFailed(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        serde_json::to_value(results).map_err(|e| ToolError::SearchFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSearch(SearchResults);

    #[async_trait]
    impl SearchProvider for FixedSearch {
        async fn search(&self, query: &str, _count: usize) -> Result<SearchResults, ToolError> {
            Ok(SearchResults {
                query: query.to_string(),
                ..self.0.clone()
            })
        }
    }

    struct StalledSearch;

    #[async_trait]
    impl SearchProvider for StalledSearch {
        async fn search(&self, _query: &str, _count: usize) -> Result<SearchResults, ToolError> {
            futures::future::pending().await
        }
    }

    #[test]
    fn test_parse_brave_response() {
        let body = json!({
            "web": {"results": [
                {"title": "Rust", "url": "https://rust-lang.org", "description": "A language"},
                {"title": "No url"},
                {"title": "Docs", "url": "https://doc.rust-lang.org", "description": "Docs"}
            ]},
            "images": {"results": [
                {"title": "Logo", "properties": {"url": "https://img/logo.png"}}
            ]}
        });

        let parsed = parse_search_response("rust", &body, 5);
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].url, "https://rust-lang.org");
        assert_eq!(parsed.images[0].url, "https://img/logo.png");
    }

    #[tokio::test]
    async fn test_execute_returns_results() {
        let provider = FixedSearch(SearchResults {
            query: String::new(),
            results: vec![SearchResult {
                title: "Weather".into(),
                url: "https://weather.example".into(),
                snippet: "Sunny".into(),
            }],
            images: Vec::new(),
        });
        let tool = WebSearchTool::new(Arc::new(provider), Duration::from_secs(60));

        let value = tool.execute(json!({"query": "weather"})).await.unwrap();
        assert_eq!(value["query"], "weather");
        assert_eq!(value["results"][0]["snippet"], "Sunny");
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let tool = WebSearchTool::new(Arc::new(StalledSearch), Duration::from_secs(60));
        let err = tool.execute(json!({"query": "  "})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_is_bounded_by_timeout() {
        let tool = WebSearchTool::new(Arc::new(StalledSearch), Duration::from_secs(60));
        let err = tool.execute(json!({"query": "slow"})).await.unwrap_err();
        assert!(matches!(err, ToolError::SearchFailed(msg) if msg.contains("timed out")));
    }
}
