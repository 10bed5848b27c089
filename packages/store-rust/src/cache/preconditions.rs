//! Client validators carried by a conditional request.

use chrono::{DateTime, Utc};
use http::header::{HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::HeaderMap;

use super::entry::EntityTag;

/// Formats a timestamp as an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`).
#[must_use]
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP-date. Returns `None` for anything unparseable.
#[must_use]
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Parsed `If-None-Match` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagCondition {
    /// `*`: matches any existing representation.
    Any,
    /// Listed tags, weak prefixes stripped.
    Tags(Vec<EntityTag>),
}

impl TagCondition {
    /// Parses a header value: `*` or a comma-separated list of
    /// optionally weak (`W/`) quoted tags. Unquoted tags are taken as is.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value == "*" {
            return Some(TagCondition::Any);
        }
        let tags: Vec<EntityTag> = value
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(|tag| {
                let tag = tag.strip_prefix("W/").unwrap_or(tag);
                let tag = tag
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .unwrap_or(tag);
                EntityTag::new(tag)
            })
            .collect();
        (!tags.is_empty()).then_some(TagCondition::Tags(tags))
    }

    /// Whether the condition matches the current tag.
    #[must_use]
    pub fn matches(&self, current: &EntityTag) -> bool {
        match self {
            TagCondition::Any => true,
            TagCondition::Tags(tags) => tags.contains(current),
        }
    }
}

/// Validators a client sent with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_none_match: Option<TagCondition>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    /// No validators: the client holds no copy.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Validators with only an entity tag.
    #[must_use]
    pub fn if_none_match(tag: EntityTag) -> Self {
        Self {
            if_none_match: Some(TagCondition::Tags(vec![tag])),
            if_modified_since: None,
        }
    }

    /// Validators with only a timestamp.
    #[must_use]
    pub fn if_modified_since(at: DateTime<Utc>) -> Self {
        Self {
            if_none_match: None,
            if_modified_since: Some(at),
        }
    }

    /// Reads `If-None-Match` and `If-Modified-Since` from request headers.
    ///
    /// Malformed or non-UTF-8 values are ignored, so the request falls back
    /// to an unconditional fetch.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
        Self {
            if_none_match: text(IF_NONE_MATCH).and_then(TagCondition::parse),
            if_modified_since: text(IF_MODIFIED_SINCE).and_then(parse_http_date),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use http::HeaderValue;

    use super::*;

    #[test]
    fn http_date_round_trips() {
        let at = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let text = http_date(at);
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&text), Some(at));
    }

    #[test]
    fn garbage_dates_are_ignored() {
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn tag_list_strips_quotes_and_weak_prefix() {
        let parsed = TagCondition::parse(r#""abc", W/"def" ,ghi"#).unwrap();
        assert_eq!(
            parsed,
            TagCondition::Tags(vec![
                EntityTag::new("abc"),
                EntityTag::new("def"),
                EntityTag::new("ghi"),
            ])
        );
        assert!(parsed.matches(&EntityTag::new("def")));
        assert!(!parsed.matches(&EntityTag::new("xyz")));
    }

    #[test]
    fn star_matches_anything() {
        let parsed = TagCondition::parse(" * ").unwrap();
        assert_eq!(parsed, TagCondition::Any);
        assert!(parsed.matches(&EntityTag::new("whatever")));
    }

    #[test]
    fn empty_list_is_no_condition() {
        assert_eq!(TagCondition::parse(" , "), None);
    }

    #[test]
    fn reads_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        let pre = Preconditions::from_headers(&headers);
        assert_eq!(
            pre.if_none_match,
            Some(TagCondition::Tags(vec![EntityTag::new("abc")]))
        );
        assert_eq!(
            pre.if_modified_since,
            Some(Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap())
        );
    }

    #[test]
    fn missing_headers_mean_no_validators() {
        assert_eq!(Preconditions::from_headers(&HeaderMap::new()), Preconditions::none());
    }
}
