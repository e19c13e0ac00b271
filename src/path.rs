//! REST path construction.
//!
//! A path is an ordered list of segments. Segments written as `:name` are
//! placeholders filled from the params of the same name; every other param
//! is sent as a query or form field.

use crate::error::StreamError;
use http::Method;

/// Endpoint suffixes that must be called with POST.
pub(crate) const POST_ACTIONS: &[&str] = &[
    // statuses
    "update",
    "retweet",
    "unretweet",
    "update_with_media",
    "statuses/lookup",
    // direct messages
    "new",
    // account
    "update_profile_image",
    "update_delivery_device",
    "update_profile",
    "update_profile_background_image",
    "update_profile_colors",
    "update_location",
    "end_session",
    "settings",
    "update_profile_banner",
    "remove_profile_banner",
    // notifications
    "leave",
    "follow",
    // statuses, blocks, direct messages, friendships, favorites
    "destroy",
    "destroy_all",
    "create",
    "create_all",
    // users
    "users/lookup",
    "report_spam",
    // streaming
    "filter",
    "user",
    "site",
    // oauth
    "token",
    "access_token",
    "request_token",
    "invalidate_token",
    // uploads
    "media/upload",
    "media/metadata/create",
    // collections
    "collections/create",
    "collections/destroy",
    "collections/update",
    "collections/entries/add",
    "collections/entries/curate",
    "collections/entries/move",
    "collections/entries/remove",
];

/// Builder for an API path and its parameters.
///
/// # Example
/// ```
/// use chirpstream::ApiPath;
///
/// let resolved = ApiPath::parse("statuses/:id/retweets")
///     .param("id", 230429161729163264u64)
///     .param("count", 3)
///     .resolve()
///     .unwrap();
/// assert_eq!(resolved.path, "statuses/230429161729163264/retweets");
/// assert_eq!(resolved.params, vec![("count".to_string(), "3".to_string())]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use = "paths do nothing until passed to a client"]
pub struct ApiPath {
    segments: Vec<String>,
    params: Vec<(String, String)>,
    method: Option<Method>,
}

/// A path with placeholders filled in and its HTTP method decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub method: Method,
    pub path: String,
    /// Params not consumed by placeholders, in insertion order.
    pub params: Vec<(String, String)>,
}

impl ApiPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a slash-separated path into segments.
    pub fn parse(path: &str) -> Self {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(Self::new(), |p, s| p.segment(s))
    }

    /// Append one segment.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Add a parameter. A later value for the same key replaces the
    /// earlier one.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    /// Force the HTTP method instead of inferring it from the path.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Fill placeholders and decide the method.
    pub fn resolve(&self) -> Result<ResolvedPath, StreamError> {
        let mut params = self.params.clone();
        let mut parts = Vec::with_capacity(self.segments.len());

        for segment in &self.segments {
            match segment.strip_prefix(':') {
                Some(name) => {
                    let pos = params
                        .iter()
                        .position(|(k, _)| k == name)
                        .ok_or_else(|| StreamError::MissingParameter(name.to_string()))?;
                    parts.push(params.remove(pos).1);
                }
                None => parts.push(segment.clone()),
            }
        }

        let path = parts.join("/");
        let method = self
            .method
            .clone()
            .unwrap_or_else(|| method_for_path(&path));

        Ok(ResolvedPath {
            method,
            path,
            params,
        })
    }
}

/// POST for paths ending in a known write action, GET otherwise.
pub fn method_for_path(path: &str) -> Method {
    let is_post = POST_ACTIONS.iter().any(|action| {
        path == *action
            || path
                .strip_suffix(action)
                .map_or(false, |rest| rest.ends_with('/'))
    });
    if is_post {
        Method::POST
    } else {
        Method::GET
    }
}

/// Where a family of API calls lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub domain: String,
    pub api_version: Option<String>,
    /// Suffix appended to the path, e.g. `json` for `.json`.
    pub format: Option<String>,
}

impl Endpoint {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            secure: true,
            domain: domain.into(),
            api_version: None,
            format: Some("json".to_string()),
        }
    }

    pub fn rest() -> Self {
        Self {
            api_version: Some("1.1".to_string()),
            ..Self::new("api.twitter.com")
        }
    }

    pub fn stream() -> Self {
        Self {
            api_version: Some("1.1".to_string()),
            ..Self::new("stream.twitter.com")
        }
    }

    /// `http[s]://{domain}/{version}/{path}.{format}`
    pub fn url_for(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let mut url = format!("{}://{}/", scheme, self.domain.trim_end_matches('/'));
        if let Some(version) = self.api_version.as_deref().filter(|v| !v.is_empty()) {
            url.push_str(version);
            url.push('/');
        }
        url.push_str(path.trim_start_matches('/'));
        if let Some(format) = self.format.as_deref().filter(|f| !f.is_empty()) {
            url.push('.');
            url.push_str(format);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_substitution() {
        let resolved = ApiPath::new()
            .segment("statuses")
            .segment(":id")
            .segment("retweeted_by")
            .param("count", 3)
            .param("id", 42)
            .resolve()
            .unwrap();
        assert_eq!(resolved.path, "statuses/42/retweeted_by");
        assert_eq!(resolved.params, vec![("count".to_string(), "3".to_string())]);
        assert_eq!(resolved.method, Method::GET);
    }

    #[test]
    fn missing_placeholder_param() {
        let err = ApiPath::parse("users/:screen_name/show").resolve().unwrap_err();
        assert!(matches!(err, StreamError::MissingParameter(name) if name == "screen_name"));
    }

    #[test]
    fn infers_post_for_write_actions() {
        assert_eq!(method_for_path("statuses/update"), Method::POST);
        assert_eq!(method_for_path("direct_messages/new"), Method::POST);
        assert_eq!(method_for_path("friendships/create"), Method::POST);
        assert_eq!(method_for_path("statuses/filter"), Method::POST);
        assert_eq!(method_for_path("users/lookup"), Method::POST);
        assert_eq!(method_for_path("media/metadata/create"), Method::POST);

        assert_eq!(method_for_path("statuses/home_timeline"), Method::GET);
        assert_eq!(method_for_path("statuses/sample"), Method::GET);
        assert_eq!(method_for_path("users/show"), Method::GET);
        // Suffix match is per segment, not per character.
        assert_eq!(method_for_path("statuses/userx"), Method::GET);
        assert_eq!(method_for_path("statuses/xuser"), Method::GET);
    }

    #[test]
    fn explicit_method_wins() {
        let resolved = ApiPath::parse("statuses/home_timeline")
            .method(Method::DELETE)
            .resolve()
            .unwrap();
        assert_eq!(resolved.method, Method::DELETE);
    }

    #[test]
    fn later_param_replaces_earlier() {
        let resolved = ApiPath::parse("search/tweets")
            .param("q", "a")
            .param("q", "b")
            .resolve()
            .unwrap();
        assert_eq!(resolved.params, vec![("q".to_string(), "b".to_string())]);
    }

    #[test]
    fn endpoint_urls() {
        assert_eq!(
            Endpoint::rest().url_for("statuses/home_timeline"),
            "https://api.twitter.com/1.1/statuses/home_timeline.json"
        );
        let search = Endpoint {
            secure: false,
            api_version: None,
            ..Endpoint::new("search.twitter.com")
        };
        assert_eq!(search.url_for("search"), "http://search.twitter.com/search.json");

        let raw = Endpoint {
            format: None,
            ..Endpoint::stream()
        };
        assert_eq!(
            raw.url_for("/statuses/sample"),
            "https://stream.twitter.com/1.1/statuses/sample"
        );
    }
}
