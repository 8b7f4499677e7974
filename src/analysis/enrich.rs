//! Supplementary web lookup for descriptions that name something searchable

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::mode::Mode;
use crate::{Error, Result};

/// Longest summary appended to a description
const MAX_SUMMARY_CHARS: usize = 200;

/// Longest query sent to the search provider
const MAX_QUERY_CHARS: usize = 120;

/// Subjects worth looking up
static SEARCHABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(signs?|labels?|logos?|brands?|books?|posters?|landmarks?|monuments?|products?|menus?|covers?|titled|called|named)\b",
    )
    .expect("valid regex")
});

/// Quoted text in a description
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["“]([^"”]{2,80})["”]"#).expect("valid regex"));

/// Whether a description is worth a supplementary lookup
///
/// Only narration is enriched; guidance favors short, immediate output.
#[must_use]
pub fn should_enrich(text: &str, mode: Mode) -> bool {
    mode == Mode::Narration && SEARCHABLE.is_match(text)
}

/// Looks up extra context for a description
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Produce a short summary to append, if anything useful was found
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails
    async fn enrich(&self, description: &str) -> Result<Option<String>>;
}

/// Search provider configuration
#[derive(Debug)]
pub enum SearchProvider {
    /// Brave Search API
    Brave {
        /// API key for Brave Search
        api_key: SecretString,
    },
    /// Serper (Google) Search API
    Serper {
        /// API key for Serper
        api_key: SecretString,
    },
}

/// Enriches descriptions with the top web search snippet
pub struct SearchEnricher {
    provider: SearchProvider,
    client: reqwest::Client,
}

/// Brave Search API response
#[derive(Debug, Deserialize)]
struct BraveSearchResponse {
    web: Option<BraveWebResults>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResults {
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    description: String,
}

/// Serper API response
#[derive(Debug, Deserialize)]
struct SerperSearchResponse {
    organic: Option<Vec<SerperResult>>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    snippet: String,
}

/// Serper API request body
#[derive(Debug, Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

impl SearchEnricher {
    /// Create an enricher backed by Brave Search
    #[must_use]
    pub fn new_brave(api_key: SecretString) -> Self {
        Self::new(SearchProvider::Brave { api_key })
    }

    /// Create an enricher backed by Serper
    #[must_use]
    pub fn new_serper(api_key: SecretString) -> Self {
        Self::new(SearchProvider::Serper { api_key })
    }

    /// Create an enricher for a provider
    #[must_use]
    pub fn new(provider: SearchProvider) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
        }
    }

    async fn top_snippet_brave(&self, api_key: &SecretString, query: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", api_key.expose_secret())
            .query(&[("q", query), ("count", "3")])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Enrichment(e.to_string()))?;

        let body: BraveSearchResponse = response.json().await?;
        Ok(body
            .web
            .and_then(|web| web.results.into_iter().next())
            .map(|r| r.description))
    }

    async fn top_snippet_serper(&self, api_key: &SecretString, query: &str) -> Result<Option<String>> {
        let response = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", api_key.expose_secret())
            .json(&SerperRequest { q: query, num: 3 })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Enrichment(e.to_string()))?;

        let body: SerperSearchResponse = response.json().await?;
        Ok(body
            .organic
            .and_then(|organic| organic.into_iter().next())
            .map(|r| r.snippet))
    }
}

#[async_trait]
impl Enricher for SearchEnricher {
    async fn enrich(&self, description: &str) -> Result<Option<String>> {
        let query = search_query(description);
        if query.is_empty() {
            return Ok(None);
        }

        tracing::debug!(query = %query, "enriching description");

        let snippet = match &self.provider {
            SearchProvider::Brave { api_key } => self.top_snippet_brave(api_key, &query).await?,
            SearchProvider::Serper { api_key } => self.top_snippet_serper(api_key, &query).await?,
        };

        Ok(snippet.map(|s| summarize(&s)).filter(|s| !s.is_empty()))
    }
}

/// Build a search query, preferring quoted text in the description
fn search_query(description: &str) -> String {
    if let Some(quoted) = QUOTED.captures(description).and_then(|c| c.get(1)) {
        return quoted.as_str().trim().to_string();
    }

    let first_sentence = description
        .split_terminator(['.', '!', '?'])
        .next()
        .unwrap_or(description)
        .trim();

    truncate_at_word(first_sentence, MAX_QUERY_CHARS)
}

/// Strip markup left in search snippets and bound the length
fn summarize(snippet: &str) -> String {
    let plain = snippet.replace("<strong>", "").replace("</strong>", "");
    let plain = plain.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_at_word(&plain, MAX_SUMMARY_CHARS)
}

/// Truncate to at most `max` characters, backing off to a word boundary
fn truncate_at_word(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }

    let cut: String = text.chars().take(max).collect();
    match cut.rfind(' ') {
        Some(space) if space > 0 => format!("{}…", cut[..space].trim_end_matches([',', ';', ':'])),
        _ => format!("{cut}…"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_narration_is_enriched() {
        assert!(should_enrich("A poster for a jazz concert.", Mode::Narration));
        assert!(!should_enrich("A poster for a jazz concert.", Mode::Guidance));
        assert!(!should_enrich("An empty hallway.", Mode::Narration));
    }

    #[test]
    fn query_prefers_quoted_text() {
        assert_eq!(
            search_query(r#"A book with the title "The Left Hand of Darkness" on a table."#),
            "The Left Hand of Darkness"
        );
        assert_eq!(
            search_query("A sign for Blue Bottle Coffee. People are inside."),
            "A sign for Blue Bottle Coffee"
        );
    }

    #[test]
    fn summaries_are_bounded() {
        let long = "word ".repeat(100);
        let summary = summarize(&long);
        assert!(summary.chars().count() <= MAX_SUMMARY_CHARS + 1);
        assert!(summary.ends_with('…'));

        assert_eq!(summarize("<strong>Dune</strong> is a  novel."), "Dune is a novel.");
    }

    #[test]
    fn providers_are_selected() {
        let enricher = SearchEnricher::new_brave(SecretString::from("key".to_string()));
        assert!(matches!(enricher.provider, SearchProvider::Brave { .. }));

        let enricher = SearchEnricher::new_serper(SecretString::from("key".to_string()));
        assert!(matches!(enricher.provider, SearchProvider::Serper { .. }));
    }
}
