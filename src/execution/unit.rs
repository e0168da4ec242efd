//! Unit-of-work envelope and warm-up expansion.

use bytes::Bytes;
use http::Method;
use rand::Rng;
use url::Url;

use crate::identity::Identity;

/// Label attached to warm-up visits so handler routing can recognise them.
pub const WARMUP_LABEL: &str = "visit";

/// Distinguishes warm-up visits from regular work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    /// Pre-run visit used to warm a specific session up.
    BeforeStart,
    Work,
}

/// One request-like task to be executed.
#[derive(Debug, Clone)]
pub struct RequestUnit {
    pub url: Url,
    pub method: Method,
    pub payload: Option<Bytes>,
    /// Pins the unit to a specific session; cleared on rotation so the next
    /// attempt picks a fresh one.
    pub sticky_session_id: Option<String>,
    pub work_type: WorkType,
    pub label: String,
    pub unique_key: String,
    /// How many times this unit has already rotated away from a blocked
    /// session.
    pub session_rotation_count: u32,
}

impl RequestUnit {
    /// A plain GET work unit; the session is chosen dynamically at dispatch.
    pub fn work(url: Url) -> Self {
        let unique_key = url.to_string();
        Self {
            url,
            method: Method::GET,
            payload: None,
            sticky_session_id: None,
            work_type: WorkType::Work,
            label: "default".to_string(),
            unique_key,
            session_rotation_count: 0,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_sticky_session(mut self, session_id: impl Into<String>) -> Self {
        self.sticky_session_id = Some(session_id.into());
        self
    }

    fn warmup(url: Url, session_id: String) -> Self {
        // Salted key: the same URL is visited once per identity.
        let salt: u32 = rand::thread_rng().gen_range(0..10_000);
        let unique_key = format!("{WARMUP_LABEL}-{session_id}-{salt}");
        Self {
            url,
            method: Method::GET,
            payload: None,
            sticky_session_id: Some(session_id),
            work_type: WorkType::BeforeStart,
            label: WARMUP_LABEL.to_string(),
            unique_key,
            session_rotation_count: 0,
        }
    }
}

/// Expand the submitted work into the full dispatch list: one `BeforeStart`
/// visit per identity per warm-up URL, all ahead of the regular work units.
pub fn expand_units(
    work: Vec<RequestUnit>,
    warmup_urls: &[Url],
    identities: &[Identity],
) -> Vec<RequestUnit> {
    let mut units = Vec::with_capacity(identities.len() * warmup_urls.len() + work.len());
    for identity in identities {
        for url in warmup_urls {
            units.push(RequestUnit::warmup(url.clone(), identity.session_id()));
        }
    }
    units.extend(work);
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn expands_one_warmup_per_identity_per_url() {
        let identities: Vec<Identity> = (0..3)
            .map(|i| Identity::new(i, "http://p:1", "agent"))
            .collect();
        let warmups = vec![url("https://example.com/a"), url("https://example.com/b")];
        let work = vec![RequestUnit::work(url("https://example.com/item/1"))];

        let units = expand_units(work, &warmups, &identities);

        assert_eq!(units.len(), 7);
        let before_start = &units[..6];
        assert!(before_start
            .iter()
            .all(|u| u.work_type == WorkType::BeforeStart && u.label == WARMUP_LABEL));
        assert!(before_start.iter().all(|u| u.sticky_session_id.is_some()));
        assert_eq!(units[6].work_type, WorkType::Work);
    }

    #[test]
    fn warmup_keys_are_distinct_per_identity() {
        let identities: Vec<Identity> = (0..2)
            .map(|i| Identity::new(i, "http://p:1", "agent"))
            .collect();
        let warmups = vec![url("https://example.com/")];

        let units = expand_units(Vec::new(), &warmups, &identities);
        assert_ne!(units[0].unique_key, units[1].unique_key);
    }

    #[test]
    fn work_unit_defaults() {
        let unit = RequestUnit::work(url("https://example.com/x"));
        assert_eq!(unit.method, Method::GET);
        assert!(unit.sticky_session_id.is_none());
        assert_eq!(unit.session_rotation_count, 0);
        assert_eq!(unit.unique_key, "https://example.com/x");
    }
}
