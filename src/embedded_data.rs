use serde::Deserialize;
use serde_aux::prelude::*;

// Only the fields the download flow needs; the real blob is much larger.

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedData {
    pub program: Program,
    pub site: Site,
    pub user: User,
    pub user_program_watch: UserProgramWatch,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub nicolive_program_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub relive: Relive,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relive {
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub web_socket_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub is_trial_watch_target: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgramWatch {
    pub can_watch: bool,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub rejected_reasons: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum EmbeddedDataError {
    #[error("Not found #embedded-data")]
    NoEmbeddedData,
    #[error("#embedded-data has no data-props attribute")]
    NoProps,
    #[error("Could not percent-decode data-props")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("Could not parse data-props")]
    Parse(#[from] serde_json::Error),
    #[error("Embedded data has no WebSocket URL")]
    NoWebSocketUrl,
}

const EMBEDDED_ID: &str = "id=\"embedded-data\"";
const PROPS_ATTR: &str = "data-props=\"";

fn get_props_str(html: &str) -> Result<&str, EmbeddedDataError> {
    let idx_id = html
        .find(EMBEDDED_ID)
        .ok_or(EmbeddedDataError::NoEmbeddedData)?;

    // The attribute may come before or after the id, so search the whole tag
    let idx_tag = html[..idx_id]
        .rfind('<')
        .ok_or(EmbeddedDataError::NoEmbeddedData)?;
    let tag_len = html[idx_tag + 1..]
        .find('<')
        .map(|n| n + 1)
        .unwrap_or(html.len() - idx_tag);
    let tag = &html[idx_tag..idx_tag + tag_len];

    let idx_start = tag.find(PROPS_ATTR).ok_or(EmbeddedDataError::NoProps)? + PROPS_ATTR.len();
    let len = tag[idx_start..]
        .find('"')
        .ok_or(EmbeddedDataError::NoProps)?;

    Ok(&tag[idx_start..idx_start + len])
}

fn unescape_html(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

impl EmbeddedData {
    pub fn from_html(html: &str) -> Result<Self, EmbeddedDataError> {
        let props = unescape_html(get_props_str(html)?);
        let decoded = urlencoding::decode(&props)?;

        serde_json::from_str(&decoded).map_err(EmbeddedDataError::Parse)
    }

    pub fn web_socket_url(&self) -> Result<&str, EmbeddedDataError> {
        match self.site.relive.web_socket_url.as_str() {
            "" => Err(EmbeddedDataError::NoWebSocketUrl),
            url => Ok(url),
        }
    }
}
