//! Web search tool.
//!
//! One external HTTP call against a Brave-style search API, invoked when
//! a streamed response requests the `web_search` tool. Results are
//! folded into the follow-up request as a numbered text list.

use serde::Deserialize;
use serde_json::Value;

const SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("search API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("search API returned invalid JSON: {0}")]
    InvalidJson(String),
}

/// Query the search API and return up to `count` results.
pub async fn web_search(
    client: &reqwest::Client,
    query: &str,
    api_key: &str,
    count: usize,
) -> Result<Vec<SearchResult>, SearchError> {
    let count_param = count.to_string();
    let response = client
        .get(SEARCH_ENDPOINT)
        .query(&[("q", query), ("count", count_param.as_str())])
        .header("accept", "application/json")
        .header("accept-encoding", "gzip")
        .header("x-subscription-token", api_key)
        .send()
        .await
        .map_err(|e| SearchError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        return Err(SearchError::Api { status, body });
    }

    let data: Value = response
        .json()
        .await
        .map_err(|e| SearchError::InvalidJson(e.to_string()))?;

    Ok(parse_results(&data, count))
}

/// Extract results from the API response body. Missing fields become
/// empty strings rather than dropping the hit.
fn parse_results(data: &Value, count: usize) -> Vec<SearchResult> {
    data.get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
        .map(|results| {
            results
                .iter()
                .take(count)
                .map(|r| SearchResult {
                    title: str_field(r, "title"),
                    url: str_field(r, "url"),
                    description: str_field(r, "description"),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Format results as the numbered list sent back to the model.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, r.description))
        .collect::<Vec<_>>()
        .join("\n")
}
