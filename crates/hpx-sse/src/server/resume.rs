//! Resumption information sent by reconnecting clients.

use http::{HeaderMap, Uri, header::HeaderName};

/// Standard resumption header.
pub const LAST_EVENT_ID_HEADER: HeaderName = HeaderName::from_static("last-event-id");

/// Query parameter carrying the last event id when headers cannot be set.
pub const LAST_EVENT_ID_PARAM: &str = "lastEventId";

/// Query parameter identifying a logical client across reconnects.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Where a client asked the stream to continue from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumeInfo {
    /// Last event id the client received, `None` on a fresh connect.
    pub last_event_id: Option<String>,
    /// Client identity supplied via the `clientId` query parameter.
    pub client_id: Option<String>,
}

impl ResumeInfo {
    /// Extract resumption info from an inbound request.
    ///
    /// The `Last-Event-ID` header takes precedence over the `lastEventId`
    /// query parameter. Empty values count as absent.
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let mut info = Self {
            last_event_id: headers
                .get(&LAST_EVENT_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            client_id: None,
        };

        if let Some(query) = uri.query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if value.is_empty() {
                    continue;
                }
                match key.as_ref() {
                    LAST_EVENT_ID_PARAM if info.last_event_id.is_none() => {
                        info.last_event_id = Some(value.into_owned());
                    }
                    CLIENT_ID_PARAM if info.client_id.is_none() => {
                        info.client_id = Some(value.into_owned());
                    }
                    _ => {}
                }
            }
        }

        info
    }

    /// The id to use for the first frame of a resumed stream: one past the
    /// client's last numeric id. Endpoints configured with
    /// [`SessionConfig::continue_ids`](super::SessionConfig::continue_ids)
    /// number the session's frames from it.
    pub fn resume_from(&self) -> Option<u64> {
        self.last_event_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
            .and_then(|id| id.checked_add(1))
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_fresh_connect_has_no_resumption() {
        let info = ResumeInfo::from_request(&HeaderMap::new(), &Uri::from_static("/sse"));
        assert_eq!(info, ResumeInfo::default());
        assert!(info.resume_from().is_none());
    }

    #[test]
    fn test_header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID_HEADER, HeaderValue::from_static("17"));
        let uri = Uri::from_static("/sse?lastEventId=3&clientId=abc");

        let info = ResumeInfo::from_request(&headers, &uri);
        assert_eq!(info.last_event_id.as_deref(), Some("17"));
        assert_eq!(info.client_id.as_deref(), Some("abc"));
        assert_eq!(info.resume_from(), Some(18));
    }

    #[test]
    fn test_query_parameters_are_decoded() {
        let uri = Uri::from_static("/sse?clientId=tab%201&lastEventId=41");
        let info = ResumeInfo::from_request(&HeaderMap::new(), &uri);
        assert_eq!(info.client_id.as_deref(), Some("tab 1"));
        assert_eq!(info.last_event_id.as_deref(), Some("41"));
    }

    #[test]
    fn test_non_numeric_id_has_no_resume_offset() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID_HEADER, HeaderValue::from_static("evt-9"));
        let info = ResumeInfo::from_request(&headers, &Uri::from_static("/sse"));
        assert_eq!(info.last_event_id.as_deref(), Some("evt-9"));
        assert!(info.resume_from().is_none());
    }
}
