use std::sync::Arc;

use async_trait::async_trait;
use reqwest_cookie_store::CookieStoreMutex;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::availability::{OperationEvent, OperationEvents};

pub const LIVE_URL_PREFIX: &str = "https://live.nicovideo.jp/watch/";
const PROGRAMS_API_URL: &str = "https://live2.nicovideo.jp/api/v2/programs";

pub struct HttpClient {
    pub client: ClientWithMiddleware,
    pub cookies: Arc<CookieStoreMutex>,
}

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("could not parse response: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// The platform endpoints the download flow reads from.
///
/// [`HttpClient`] talks to niconico; tests substitute canned responses.
#[async_trait]
pub trait NicoApi: Send + Sync {
    /// Fetch the HTML of a broadcast's watch page.
    async fn fetch_watch_page(&self, live_id: &str) -> Result<String, HttpError>;

    /// Fetch the operation event schedule (trial watch windows and the like).
    async fn fetch_operation_events(&self, live_id: &str)
        -> Result<Vec<OperationEvent>, HttpError>;
}

impl HttpClient {
    pub fn new() -> reqwest::Result<HttpClient> {
        let cookies = Arc::new(CookieStoreMutex::default());
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client, cookies })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, HttpError> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
            .map_err(|e| e.into())
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        let text = self.fetch_text(url).await?;
        serde_json::from_str(&text).map_err(|e| e.into())
    }

    /// POST a urlencoded form, following redirects. The final response is
    /// returned so callers can inspect where the redirects ended up.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, HttpError> {
        Ok(self.client.post(url).form(form).send().await?)
    }
}

#[async_trait]
impl NicoApi for HttpClient {
    async fn fetch_watch_page(&self, live_id: &str) -> Result<String, HttpError> {
        self.fetch_text(&format!("{}{}", LIVE_URL_PREFIX, live_id))
            .await
    }

    async fn fetch_operation_events(
        &self,
        live_id: &str,
    ) -> Result<Vec<OperationEvent>, HttpError> {
        let events: OperationEvents = self
            .fetch_json(&format!("{}/{}/operation/events", PROGRAMS_API_URL, live_id))
            .await?;

        Ok(events.data)
    }
}

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Names Windows refuses as a file name, with or without an extension.
const RESERVED_FILENAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make a broadcast title usable as a file name on Windows, Linux and macOS.
///
/// Runs of invalid or control characters become a single `_`, leading and
/// trailing spaces and dots are dropped, and reserved device names get a `_`
/// prefix. Never returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    let mut replacing = false;

    for c in name.chars() {
        if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
            if !replacing {
                cleaned.push('_');
                replacing = true;
            }
        } else {
            cleaned.push(c);
            replacing = false;
        }
    }

    let cleaned = cleaned.trim_matches(|c| c == ' ' || c == '.');
    if cleaned.is_empty() {
        return "unnamed".to_string();
    }

    let upper = cleaned.to_uppercase();
    let reserved = RESERVED_FILENAMES.iter().any(|r| {
        upper == *r
            || upper
                .strip_prefix(r)
                .is_some_and(|rest| rest.starts_with('.'))
    });
    if reserved {
        format!("_{}", cleaned)
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("  title?.. "), "title_");
        assert_eq!(sanitize_filename("【歌枠】 live"), "【歌枠】 live");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename("line\nbreak"), "line_break");
        assert_eq!(sanitize_filename("a??b"), "a_b");
        assert_eq!(sanitize_filename("<>:\"/"), "_");
    }

    #[test]
    fn sanitize_reserved_names() {
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("nul.txt"), "_nul.txt");
        assert_eq!(sanitize_filename("com1.live.ts"), "_com1.live.ts");
        assert_eq!(sanitize_filename("CONCERT"), "CONCERT");
        assert_eq!(sanitize_filename("AUX "), "_AUX");
    }
}
