// Profile field extraction from what the browser hands back: the
// `web_profile_info` JSON document, or the profile page HTML.
//
// Missing values stay `None`. Nothing here defaults a follower count.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::types::RawProfile;

static RE_ADDITIONAL_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)window\.__additionalDataLoaded\(\s*'[^']*'\s*,\s*(\{.*?\})\s*\);").unwrap()
});
static RE_SHARED_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)window\._sharedData\s*=\s*(\{.*?\});").unwrap());
static RE_FOLLOWERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""edge_followed_by"\s*:\s*\{\s*"count"\s*:\s*(\d+)\s*\}"#).unwrap()
});
static RE_PIC_HD: LazyLock<Regex> = LazyLock::new(|| json_string_field("profile_pic_url_hd"));
static RE_PIC: LazyLock<Regex> = LazyLock::new(|| json_string_field("profile_pic_url"));
static RE_FULL_NAME: LazyLock<Regex> = LazyLock::new(|| json_string_field("full_name"));
static RE_BIOGRAPHY: LazyLock<Regex> = LazyLock::new(|| json_string_field("biography"));

fn json_string_field(name: &str) -> Regex {
    Regex::new(&format!(r#""{name}"\s*:\s*"((?:[^"\\]|\\.)*)""#)).unwrap()
}

/// Parse a `web_profile_info` response body. Chrome shows JSON documents
/// inside a `<pre>`, so an HTML-wrapped body is accepted too.
pub fn from_api_payload(body: &str) -> Option<RawProfile> {
    let payload = parse_json_document(body)?;
    let user = payload.pointer("/data/user").filter(|u| u.is_object())?;
    Some(from_user(user))
}

/// Map a `user` object (API or embedded GraphQL) onto a RawProfile.
pub fn from_user(user: &Value) -> RawProfile {
    let followers = user
        .pointer("/edge_followed_by/count")
        .or_else(|| user.get("follower_count"))
        .and_then(Value::as_u64);

    RawProfile {
        full_name: non_empty_str(user.get("full_name")),
        biography: non_empty_str(user.get("biography")),
        followers,
        profile_pic_url: non_empty_str(user.get("profile_pic_url_hd"))
            .or_else(|| non_empty_str(user.get("profile_pic_url"))),
    }
}

/// Extract a profile from the rendered profile page. Tries embedded JSON
/// blobs first, then field-level regexes. `None` when the page carries
/// neither a follower count nor a picture.
pub fn from_profile_html(html: &str) -> Option<RawProfile> {
    if let Some(user) = embedded_user(html) {
        let raw = from_user(&user);
        if !raw.is_empty() {
            return Some(raw);
        }
    }

    let followers = RE_FOLLOWERS
        .captures(html)
        .and_then(|c| c[1].parse::<u64>().ok());
    let profile_pic_url = capture_string(&RE_PIC_HD, html).or_else(|| capture_string(&RE_PIC, html));

    if followers.is_none() && profile_pic_url.is_none() {
        return None;
    }

    Some(RawProfile {
        full_name: capture_string(&RE_FULL_NAME, html),
        biography: capture_string(&RE_BIOGRAPHY, html),
        followers,
        profile_pic_url,
    })
}

fn embedded_user(html: &str) -> Option<Value> {
    let blob = RE_ADDITIONAL_DATA
        .captures(html)
        .or_else(|| RE_SHARED_DATA.captures(html))?;
    let payload: Value = serde_json::from_str(&blob[1]).ok()?;

    [
        "/entry_data/ProfilePage/0/graphql/user",
        "/graphql/user",
        "/data/user",
    ]
    .iter()
    .find_map(|p| payload.pointer(p).filter(|u| u.is_object()).cloned())
}

fn parse_json_document(body: &str) -> Option<Value> {
    let trimmed = body.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&html_unescape(&trimmed[start..=end])).ok()
}

fn capture_string(re: &Regex, haystack: &str) -> Option<String> {
    let raw = re.captures(haystack)?.get(1)?.as_str();
    // Reuse the JSON string grammar for \uXXXX and \/ escapes.
    let decoded = serde_json::from_str::<String>(&format!("\"{raw}\""))
        .unwrap_or_else(|_| raw.to_string());
    let value = html_unescape(&decoded);
    (!value.is_empty()).then_some(value)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode the handful of entities Chrome and Instagram emit.
pub(crate) fn html_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_payload_maps_user_fields() {
        let body = json!({
            "data": { "user": {
                "full_name": "PewDiePie",
                "biography": "",
                "edge_followed_by": { "count": 20292783 },
                "profile_pic_url": "https://scontent.example/small.jpg",
                "profile_pic_url_hd": "https://scontent.example/p.jpg"
            }},
            "status": "ok"
        })
        .to_string();

        let raw = from_api_payload(&body).unwrap();
        assert_eq!(raw.followers, Some(20_292_783));
        assert_eq!(raw.profile_pic_url.as_deref(), Some("https://scontent.example/p.jpg"));
        assert_eq!(raw.full_name.as_deref(), Some("PewDiePie"));
        assert_eq!(raw.biography, None);
    }

    #[test]
    fn api_payload_inside_pre_is_unwrapped() {
        let html = r#"<html><head></head><body><pre>{"data":{"user":{"edge_followed_by":{"count":5},"profile_pic_url":"https://x.example/a.jpg?a=1&amp;b=2"}}}</pre></body></html>"#;
        let raw = from_api_payload(html).unwrap();
        assert_eq!(raw.followers, Some(5));
        assert_eq!(raw.profile_pic_url.as_deref(), Some("https://x.example/a.jpg?a=1&b=2"));
    }

    #[test]
    fn api_payload_without_user_is_none() {
        assert!(from_api_payload(r#"{"data":{"user":null},"status":"ok"}"#).is_none());
        assert!(from_api_payload("<html>Login</html>").is_none());
    }

    #[test]
    fn missing_follower_count_is_not_invented() {
        let raw = from_user(&json!({ "profile_pic_url": "https://x.example/p.jpg" }));
        assert_eq!(raw.followers, None);
        assert!(!raw.is_empty());
    }

    #[test]
    fn shared_data_blob_is_preferred() {
        let html = r#"<script>window._sharedData = {"entry_data":{"ProfilePage":[{"graphql":{"user":{"full_name":"Blob","edge_followed_by":{"count":42},"profile_pic_url_hd":"https://x.example/hd.jpg"}}}]}};</script>"#;
        let raw = from_profile_html(html).unwrap();
        assert_eq!(raw.followers, Some(42));
        assert_eq!(raw.full_name.as_deref(), Some("Blob"));
    }

    #[test]
    fn regex_fallback_decodes_escapes() {
        let html = r#"<script>{"edge_followed_by":{"count":1234},"profile_pic_url_hd":"https:\/\/x.example\/p.jpg?a=1&b=2","full_name":"Café \"Owner\"","biography":"line one\nline two"}</script>"#;
        let raw = from_profile_html(html).unwrap();
        assert_eq!(raw.followers, Some(1234));
        assert_eq!(raw.profile_pic_url.as_deref(), Some("https://x.example/p.jpg?a=1&b=2"));
        assert_eq!(raw.full_name.as_deref(), Some("Café \"Owner\""));
        assert_eq!(raw.biography.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn page_without_profile_data_is_none() {
        assert!(from_profile_html("<html><body>Log in to Instagram</body></html>").is_none());
    }
}
