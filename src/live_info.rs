use std::fmt;

use crate::{
    availability::{self, AccessLevel, AvailabilityError},
    embedded_data::{EmbeddedData, EmbeddedDataError},
    util::{HttpError, NicoApi, LIVE_URL_PREFIX},
};

/// A broadcast id such as `lv123456789`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveId(String);

impl LiveId {
    /// Accepts either a bare id or a full watch URL.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let id = input.strip_prefix(LIVE_URL_PREFIX).unwrap_or(input);
        let id = id.split(['?', '#']).next().unwrap_or(id);

        LiveId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start recording a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveInfo {
    pub id: LiveId,
    pub title: String,
    pub web_socket_url: String,
    pub access: AccessLevel,
}

#[derive(thiserror::Error, Debug)]
pub enum LiveInfoError {
    #[error("Could not fetch watch page")]
    Http(#[from] HttpError),
    #[error("Live {live_id} not found: {source}")]
    NotFound {
        live_id: LiveId,
        #[source]
        source: EmbeddedDataError,
    },
    #[error(transparent)]
    Availability(#[from] AvailabilityError),
}

/// Fetch and check a broadcast. Nothing is returned unless the account is
/// allowed to watch at least part of it.
pub async fn resolve(api: &dyn NicoApi, live_id: &LiveId) -> Result<LiveInfo, LiveInfoError> {
    let not_found = |source| LiveInfoError::NotFound {
        live_id: live_id.clone(),
        source,
    };

    debug!("Fetching watch page for {}", live_id);
    let html = api.fetch_watch_page(live_id.as_str()).await?;
    let data = EmbeddedData::from_html(&html).map_err(not_found)?;

    let access = availability::ensure_watchable(&data, api).await?;

    let web_socket_url = data.web_socket_url().map_err(not_found)?.to_string();

    Ok(LiveInfo {
        id: live_id.clone(),
        title: data.program.title,
        web_socket_url,
        access,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        availability::tests::{trial, FakeApi},
        embedded_data::tests::{props, watch_page},
    };

    #[test]
    fn parse_live_id() {
        assert_eq!(LiveId::parse("lv123456789").as_str(), "lv123456789");
        assert_eq!(
            LiveId::parse("https://live.nicovideo.jp/watch/lv123456789").as_str(),
            "lv123456789"
        );
        assert_eq!(
            LiveId::parse(" https://live.nicovideo.jp/watch/lv123456789?ref=top#x ").as_str(),
            "lv123456789"
        );
        assert_eq!(LiveId::parse("ch2646436").to_string(), "ch2646436");
    }

    #[tokio::test]
    async fn resolve_from_url() {
        let api = FakeApi::new(watch_page(&props(true, false)), vec![]);
        let live_id = LiveId::parse("https://live.nicovideo.jp/watch/lv123456789");

        let info = resolve(&api, &live_id).await.unwrap();

        assert_eq!(*api.requested_ids.lock().unwrap(), vec!["lv123456789"]);
        assert_eq!(info.id.as_str(), "lv123456789");
        assert_eq!(info.title, "Test <Live> & more");
        assert_eq!(
            info.web_socket_url,
            "wss://a.live2.nicovideo.jp/wsapi/v2/watch/lv123456789"
        );
        assert_eq!(info.access, AccessLevel::Full);
        assert_eq!(api.event_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolve_partial() {
        let api = FakeApi::new(
            watch_page(&props(true, true)),
            vec![trial(true), trial(false)],
        );

        let info = resolve(&api, &LiveId::parse("lv123456789")).await.unwrap();

        assert_eq!(info.access, AccessLevel::Partial);
    }

    #[tokio::test]
    async fn resolve_missing_embedded_data() {
        let api = FakeApi::new("<html></html>".to_string(), vec![]);

        let err = resolve(&api, &LiveId::parse("lv1")).await.unwrap_err();

        assert!(matches!(
            err,
            LiveInfoError::NotFound {
                source: EmbeddedDataError::NoEmbeddedData,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resolve_unavailable_passes_through() {
        let api = FakeApi::new(watch_page(&props(false, false)), vec![]);

        let err = resolve(&api, &LiveId::parse("lv123456789")).await.unwrap_err();

        assert!(matches!(
            err,
            LiveInfoError::Availability(AvailabilityError::Unavailable { .. })
        ));
        assert_eq!(
            err.to_string(),
            "Live lv123456789 is unavailable. Reason: notHaveTimeshiftTicket"
        );
    }
}
