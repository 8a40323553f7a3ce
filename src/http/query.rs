//! Query-string and form-body parameters.
//!
//! Both use `application/x-www-form-urlencoded` decoding. They differ in how a
//! key without a value reads back: in a URI query (`?a&b=`) it is absent
//! (`None`), in a form body it is the empty string.

use url::form_urlencoded;

/// Which part of the request the parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Query,
    Form,
}

/// Ordered, multi-valued parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters {
    params: Vec<(String, Vec<Option<String>>)>,
}

impl QueryParameters {
    /// Parses the query component of a request target (`/path?a=b`).
    /// A target without `?` has no parameters.
    pub fn from_uri(uri: &str) -> Self {
        match uri.split_once('?') {
            Some((_, query)) => {
                let query = query.split_once('#').map_or(query, |(q, _)| q);
                Self::parse(query, ParamSource::Query)
            }
            None => Self::parse("", ParamSource::Query),
        }
    }

    /// Parses a raw query string without a path (`a=b&c=d`).
    pub fn from_query(query: &str) -> Self {
        Self::parse(query, ParamSource::Query)
    }

    /// Parses a urlencoded form body.
    pub fn from_form(body: &str) -> Self {
        Self::parse(body, ParamSource::Form)
    }

    fn parse(input: &str, source: ParamSource) -> Self {
        let mut params: Vec<(String, Vec<Option<String>>)> = Vec::new();

        for (key, value) in form_urlencoded::parse(input.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            let value = match source {
                ParamSource::Query if value.is_empty() => None,
                _ => Some(value.into_owned()),
            };
            match params.iter_mut().find(|(k, _)| k.as_str() == &*key) {
                Some((_, values)) => values.push(value),
                None => params.push((key.into_owned(), vec![value])),
            }
        }

        Self { params }
    }

    /// First value for `key`. `None` when the key is missing or its first
    /// occurrence had no value.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key)
            .and_then(|values| values.first())
            .and_then(|v| v.as_deref())
    }

    /// Every occurrence of `key`, in order.
    pub fn all(&self, key: &str) -> Vec<Option<&str>> {
        self.values(key)
            .map(|values| values.iter().map(|v| v.as_deref()).collect())
            .unwrap_or_default()
    }

    /// Keys in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        self.params.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn values(&self, key: &str) -> Option<&Vec<Option<String>>> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_parameter() {
        assert_eq!(QueryParameters::from_form("foo=bar").first("foo"), Some("bar"));
    }

    #[test]
    fn repeated_keys_keep_order() {
        let params = QueryParameters::from_form("a=b&c=d&a=e");
        assert_eq!(params.all("a"), vec![Some("b"), Some("e")]);
        assert_eq!(params.keys(), vec!["a", "c"]);
    }

    #[test]
    fn empty_values_differ_between_query_and_form() {
        let query = QueryParameters::from_query("a=b&a=&a=e");
        assert_eq!(query.all("a"), vec![Some("b"), None, Some("e")]);

        let form = QueryParameters::from_form("a=b&a=&a=e");
        assert_eq!(form.all("a"), vec![Some("b"), Some(""), Some("e")]);
    }

    #[test]
    fn uri_query_is_decoded() {
        let params = QueryParameters::from_uri("/search?q=rust+lang&page=2&flag#top");
        assert_eq!(params.first("q"), Some("rust lang"));
        assert_eq!(params.first("page"), Some("2"));
        assert_eq!(params.all("flag"), vec![None]);
        assert!(QueryParameters::from_uri("/plain").is_empty());
    }
}
