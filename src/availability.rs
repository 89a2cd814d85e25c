//! Watch eligibility checks for a broadcast.
//!
//! The platform's own `canWatch` flag is authoritative. Channel members are
//! never restricted further; non-members may only see the parts of a broadcast
//! the broadcaster opened up for trial watching ("チラ見せ").

use serde::Deserialize;

use crate::{
    embedded_data::EmbeddedData,
    util::{HttpError, NicoApi},
};

pub const TRIAL_WATCH_STATE: &str = "trialWatchState";

/// How much of a broadcast the current account is able to record.
///
/// Variants are declared from most to least restrictive so that the derived
/// ordering reads `None < Partial < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None,
    Partial,
    Full,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationEvents {
    pub data: Vec<OperationEvent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub elapsed_millisecond: Option<i64>,
}

#[derive(thiserror::Error, Debug)]
pub enum AvailabilityError {
    #[error("Live {live_id} is unavailable. Reason: {reason}")]
    Unavailable { live_id: String, reason: String },
    #[error("Could not fetch trial watch schedule")]
    TrialWatchSchedule(#[from] HttpError),
}

/// Collapse a trial watch schedule into an access level.
///
/// Only `trialWatchState` events count. The elapsed time of each event is not
/// taken into account: a schedule that is open at some point and closed at
/// another is `Partial` no matter where the windows fall.
pub fn aggregate(events: &[OperationEvent]) -> AccessLevel {
    let (enabled, total) = events
        .iter()
        .filter(|e| e.kind == TRIAL_WATCH_STATE)
        .fold((0, 0), |(enabled, total), e| {
            (enabled + usize::from(e.enabled), total + 1)
        });

    if enabled == total {
        AccessLevel::Full
    } else if enabled == 0 {
        AccessLevel::None
    } else {
        AccessLevel::Partial
    }
}

/// Work out the access level for `data`, fetching the trial watch schedule
/// only when the account is a trial watch target.
pub async fn resolve(
    data: &EmbeddedData,
    api: &dyn NicoApi,
) -> Result<AccessLevel, AvailabilityError> {
    let live_id = &data.program.nicolive_program_id;

    if !data.user_program_watch.can_watch {
        return Err(AvailabilityError::Unavailable {
            live_id: live_id.clone(),
            reason: data.user_program_watch.rejected_reasons.join(", "),
        });
    }

    if !data.user.is_trial_watch_target {
        return Ok(AccessLevel::Full);
    }

    debug!("Account is a trial watch target for {}", live_id);
    let events = api.fetch_operation_events(live_id).await?;

    Ok(aggregate(&events))
}

/// Like [`resolve`], but turns `AccessLevel::None` into an error and warns
/// about partial access.
pub async fn ensure_watchable(
    data: &EmbeddedData,
    api: &dyn NicoApi,
) -> Result<AccessLevel, AvailabilityError> {
    let live_id = &data.program.nicolive_program_id;

    match resolve(data, api).await? {
        AccessLevel::None => Err(AvailabilityError::Unavailable {
            live_id: live_id.clone(),
            reason: "payment needed".to_string(),
        }),
        AccessLevel::Partial => {
            warn!(
                "Live {} has trial watch part. Download may be incomplete on your account",
                live_id
            );
            Ok(AccessLevel::Partial)
        }
        AccessLevel::Full => Ok(AccessLevel::Full),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::embedded_data::tests::{props, watch_page};

    /// Serves a fixed watch page and trial watch schedule, counting requests.
    pub(crate) struct FakeApi {
        pub page: String,
        pub events: Vec<OperationEvent>,
        pub page_requests: AtomicUsize,
        pub event_requests: AtomicUsize,
        pub requested_ids: std::sync::Mutex<Vec<String>>,
    }

    impl FakeApi {
        pub(crate) fn new(page: String, events: Vec<OperationEvent>) -> Self {
            Self {
                page,
                events,
                page_requests: AtomicUsize::new(0),
                event_requests: AtomicUsize::new(0),
                requested_ids: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NicoApi for FakeApi {
        async fn fetch_watch_page(&self, live_id: &str) -> Result<String, HttpError> {
            self.page_requests.fetch_add(1, Ordering::SeqCst);
            self.requested_ids.lock().unwrap().push(live_id.to_string());
            Ok(self.page.clone())
        }

        async fn fetch_operation_events(
            &self,
            live_id: &str,
        ) -> Result<Vec<OperationEvent>, HttpError> {
            self.event_requests.fetch_add(1, Ordering::SeqCst);
            self.requested_ids.lock().unwrap().push(live_id.to_string());
            Ok(self.events.clone())
        }
    }

    pub(crate) fn trial(enabled: bool) -> OperationEvent {
        OperationEvent {
            kind: TRIAL_WATCH_STATE.to_string(),
            enabled,
            elapsed_millisecond: Some(6108),
        }
    }

    fn other(enabled: bool) -> OperationEvent {
        OperationEvent {
            kind: "commentState".to_string(),
            enabled,
            elapsed_millisecond: None,
        }
    }

    fn data(can_watch: bool, trial_watch_target: bool) -> EmbeddedData {
        EmbeddedData::from_html(&watch_page(&props(can_watch, trial_watch_target))).unwrap()
    }

    #[test]
    fn aggregate_schedules() {
        assert_eq!(aggregate(&[]), AccessLevel::Full);
        assert_eq!(aggregate(&[trial(true), trial(true)]), AccessLevel::Full);
        assert_eq!(aggregate(&[trial(false)]), AccessLevel::None);
        assert_eq!(aggregate(&[trial(false), trial(false)]), AccessLevel::None);
        assert_eq!(aggregate(&[trial(true), trial(false)]), AccessLevel::Partial);
        assert_eq!(aggregate(&[trial(false), trial(true), trial(false)]), AccessLevel::Partial);
    }

    #[test]
    fn aggregate_ignores_other_events() {
        assert_eq!(aggregate(&[other(false)]), AccessLevel::Full);
        assert_eq!(aggregate(&[other(true), trial(false)]), AccessLevel::None);
        assert_eq!(aggregate(&[other(false), trial(true)]), AccessLevel::Full);
    }

    #[test]
    fn severity_order() {
        assert!(AccessLevel::Full > AccessLevel::Partial);
        assert!(AccessLevel::Partial > AccessLevel::None);
    }

    #[test]
    fn parse_operation_events() {
        let events: OperationEvents = serde_json::from_str(
            r#"{"data":[{"elapsedMillisecond":6108,"type":"trialWatchState","commentMode":"transparent","enabled":false},{"type":"somethingElse"}]}"#,
        )
        .unwrap();

        assert_eq!(events.data.len(), 2);
        assert_eq!(events.data[0], trial(false));
        assert_eq!(aggregate(&events.data), AccessLevel::None);
    }

    #[tokio::test]
    async fn member_skips_trial_watch() {
        // Contradictory schedule: members must not be affected by it
        let api = FakeApi::new(String::new(), vec![trial(false)]);

        let level = resolve(&data(true, false), &api).await.unwrap();

        assert_eq!(level, AccessLevel::Full);
        assert_eq!(api.event_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cannot_watch_short_circuits() {
        let api = FakeApi::new(String::new(), vec![trial(true)]);

        let err = resolve(&data(false, true), &api).await.unwrap_err();

        match err {
            AvailabilityError::Unavailable { live_id, reason } => {
                assert_eq!(live_id, "lv123456789");
                assert_eq!(reason, "notHaveTimeshiftTicket");
            }
            e => panic!("unexpected error: {}", e),
        }
        assert_eq!(api.event_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trial_watch_partial() {
        let api = FakeApi::new(String::new(), vec![trial(true), trial(false)]);

        let level = ensure_watchable(&data(true, true), &api).await.unwrap();

        assert_eq!(level, AccessLevel::Partial);
        assert_eq!(api.event_requests.load(Ordering::SeqCst), 1);
        assert_eq!(*api.requested_ids.lock().unwrap(), vec!["lv123456789"]);
    }

    #[tokio::test]
    async fn trial_watch_closed_needs_payment() {
        let api = FakeApi::new(String::new(), vec![trial(false), trial(false)]);

        let err = ensure_watchable(&data(true, true), &api).await.unwrap_err();

        assert!(matches!(
            err,
            AvailabilityError::Unavailable { ref reason, .. } if reason == "payment needed"
        ));
    }

    #[tokio::test]
    async fn trial_watch_open() {
        let api = FakeApi::new(String::new(), vec![]);
        assert_eq!(
            ensure_watchable(&data(true, true), &api).await.unwrap(),
            AccessLevel::Full
        );

        let api = FakeApi::new(String::new(), vec![trial(true), other(false)]);
        assert_eq!(
            ensure_watchable(&data(true, true), &api).await.unwrap(),
            AccessLevel::Full
        );
    }
}
