use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::error::PreviewError;

const PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Open Graph style metadata scraped from a case-study page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagePreview {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub site_name: Option<String>,
}

#[async_trait]
pub trait PreviewFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<PagePreview, PreviewError>;
}

pub struct HttpPreviewFetcher {
    http: reqwest::Client,
}

impl HttpPreviewFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PreviewFetcher for HttpPreviewFetcher {
    async fn fetch(&self, url: &str) -> Result<PagePreview, PreviewError> {
        let response = self
            .http
            .get(url)
            .timeout(PREVIEW_TIMEOUT)
            .header("user-agent", "lead-chat-preview/1.0")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PreviewError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        Ok(parse_preview(&body))
    }
}

pub fn parse_preview(html: &str) -> PagePreview {
    PagePreview {
        title: extract_meta_tag(html, "og:title")
            .or_else(|| extract_meta_tag(html, "twitter:title"))
            .or_else(|| extract_title_tag(html)),
        description: extract_meta_tag(html, "og:description")
            .or_else(|| extract_meta_tag(html, "description"))
            .or_else(|| extract_meta_tag(html, "twitter:description")),
        image: extract_meta_tag(html, "og:image"),
        site_name: extract_meta_tag(html, "og:site_name"),
    }
}

fn extract_meta_tag(html: &str, property: &str) -> Option<String> {
    let pattern = format!(
        r#"(?is)<meta[^>]+(?:property|name)\s*=\s*["']{}["'][^>]+content\s*=\s*["']([^"']+)["'][^>]*>"#,
        regex::escape(property)
    );
    let regex = Regex::new(&pattern).ok()?;
    regex
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn extract_title_tag(html: &str) -> Option<String> {
    let regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    regex
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace('\n', " ").trim().to_string())
        .filter(|v| !v.is_empty())
}
