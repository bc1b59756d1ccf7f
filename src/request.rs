use std::{
    fmt::{self, Write as _},
    sync::Arc,
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{
    header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, Url,
};
use serde::Serialize;

use crate::{ResilientError, Result};

/// Deferred operation applied to the materialized wire request.
pub type Mutator = Arc<dyn Fn(&mut reqwest::Request) + Send + Sync>;

/// Ordered multi-value map used for query parameters and headers.
///
/// Distinct keys keep the order in which they were first inserted; values of
/// one key keep insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values {
    entries: Vec<(String, Vec<String>)>,
}

impl Values {
    /// Replaces every value of `key`.
    pub fn set<I, V>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        let key = key.into();
        match self.position(&key) {
            Some(index) => self.entries[index].1 = values,
            None => self.entries.push((key, values)),
        }
    }

    /// Appends to the values of `key`, creating it if absent.
    pub fn add<I, V>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let key = key.into();
        let index = match self.position(&key) {
            Some(index) => index,
            None => {
                self.entries.push((key, Vec::new()));
                self.entries.len() - 1
            }
        };
        self.entries[index]
            .1
            .extend(values.into_iter().map(Into::into));
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.position(key)
            .map(|index| self.entries[index].1.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Returns `true` when no key carries a value.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, values)| values.is_empty())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(existing, _)| existing == key)
    }
}

/// Declarative description of an HTTP request.
///
/// Nothing is validated until the request is sent: the URL, method and
/// headers are resolved into a wire request by the executor on each call.
#[derive(Clone)]
pub struct Request {
    method: String,
    host: String,
    path: String,
    query: Values,
    headers: Values,
    body: Vec<u8>,
    mutators: Vec<Mutator>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("mutators", &self.mutators.len())
            .finish()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET.as_str().to_owned(),
            host: String::new(),
            path: String::new(),
            query: Values::default(),
            headers: Values::default(),
            body: Vec::new(),
            mutators: Vec::new(),
        }
    }
}

impl Request {
    /// Creates a `GET` request with no host.
    ///
    /// A request without a host inherits the host of the client it is sent
    /// through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the base host, e.g. `http://localhost:3000`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the path appended to the host.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the path from a template, replacing each `{}` with the next
    /// argument.
    ///
    /// Placeholders without a matching argument are kept verbatim; surplus
    /// arguments are ignored.
    ///
    /// ```
    /// use resilient_http::Request;
    ///
    /// let request = Request::new()
    ///     .host("http://localhost:3000")
    ///     .path_args("/orders/{}/items/{}", &[&1231, &"a"]);
    /// assert_eq!(
    ///     request.url().unwrap().as_str(),
    ///     "http://localhost:3000/orders/1231/items/a"
    /// );
    /// ```
    pub fn path_args(self, template: &str, args: &[&dyn fmt::Display]) -> Self {
        let path = substitute_placeholders(template, args);
        self.path(path)
    }

    /// Replaces every value of a query parameter.
    pub fn set_query(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_query_values(key, [value.into()])
    }

    pub fn set_query_values<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.query.set(key, values);
        self
    }

    /// Appends a query parameter value, keeping existing ones.
    pub fn add_query(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_query_values(key, [value.into()])
    }

    pub fn add_query_values<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.query.add(key, values);
        self
    }

    /// Replaces every value of a header. Names are case-insensitive.
    pub fn set_header(self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.set_header_values(name, [value.into()])
    }

    pub fn set_header_values<I, V>(mut self, name: impl AsRef<str>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.headers
            .set(name.as_ref().to_ascii_lowercase(), values);
        self
    }

    /// Appends a header value, keeping existing ones.
    pub fn add_header(self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.add_header_values(name, [value.into()])
    }

    pub fn add_header_values<I, V>(mut self, name: impl AsRef<str>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.headers
            .add(name.as_ref().to_ascii_lowercase(), values);
        self
    }

    /// Appends an operation run on the wire request right before it is sent.
    pub fn mutate<F>(mut self, mutator: F) -> Self
    where
        F: Fn(&mut reqwest::Request) + Send + Sync + 'static,
    {
        self.mutators.push(Arc::new(mutator));
        self
    }

    /// Sets HTTP basic authentication on the wire request.
    pub fn basic_auth(self, username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        let credentials = STANDARD.encode(format!("{}:{}", username.as_ref(), password.as_ref()));
        let header = HeaderValue::from_str(&format!("Basic {credentials}"))
            .ok()
            .map(|mut value| {
                value.set_sensitive(true);
                value
            });
        self.mutate(move |request| {
            // Base64 output is always a valid header value.
            if let Some(value) = &header {
                request.headers_mut().insert(AUTHORIZATION, value.clone());
            }
        })
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn query_values(&self, key: &str) -> Option<&[String]> {
        self.query.get(key)
    }

    pub fn header_values(&self, name: &str) -> Option<&[String]> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Resolves `host + path` and the query map into the canonical URL.
    ///
    /// Side-effect free; may be called any number of times.
    pub fn url(&self) -> Result<Url> {
        resolve_url(&self.host, &self.path, &self.query)
    }

    pub(crate) fn json_body<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let bytes =
            serde_json::to_vec(body).map_err(|err| ResilientError::InvalidBody(err.to_string()))?;
        Ok(self
            .set_header(CONTENT_TYPE.as_str(), "application/json")
            .body(bytes))
    }

    /// Builds the wire request. `fallback_host` is used when the descriptor
    /// has no host of its own.
    pub(crate) fn materialize(
        &self,
        fallback_host: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Request> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| ResilientError::InvalidMethod(self.method.clone()))?;
        let host = if self.host.is_empty() {
            fallback_host
        } else {
            &self.host
        };
        let url = resolve_url(host, &self.path, &self.query)?;

        let mut request = reqwest::Request::new(method, url);
        for (name, values) in self.headers.iter() {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                    ResilientError::InvalidHeader {
                        name: name.to_owned(),
                        reason: err.to_string(),
                    }
                })?;
            for value in values {
                let header_value =
                    HeaderValue::from_str(value).map_err(|err| ResilientError::InvalidHeader {
                        name: name.to_owned(),
                        reason: err.to_string(),
                    })?;
                request
                    .headers_mut()
                    .append(header_name.clone(), header_value);
            }
        }

        if !self.body.is_empty() {
            *request.body_mut() = Some(self.body.clone().into());
        }
        *request.timeout_mut() = timeout;

        for mutator in &self.mutators {
            mutator(&mut request);
        }
        Ok(request)
    }
}

fn resolve_url(host: &str, path: &str, query: &Values) -> Result<Url> {
    let raw = format!("{host}{path}");
    let malformed = |reason: String| ResilientError::MalformedUrl {
        url: raw.clone(),
        reason,
    };

    let mut url = Url::parse(&raw).map_err(|err| malformed(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(malformed(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(malformed("missing host".to_owned()));
    }

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, values) in query.iter() {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }
    Ok(url)
}

fn substitute_placeholders(template: &str, args: &[&dyn fmt::Display]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(index) = rest.find("{}") {
        out.push_str(&rest[..index]);
        match args.next() {
            Some(arg) => {
                let _ = write!(out, "{arg}");
            }
            None => out.push_str("{}"),
        }
        rest = &rest[index + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::{substitute_placeholders, Request};
    use crate::ResilientError;

    fn base() -> Request {
        Request::new().host("http://localhost:3000")
    }

    #[test]
    fn url_resolution_cases() {
        let cases = [
            (
                base()
                    .path_args("/orders/{}", &[&1231])
                    .add_query("clientId", "1231321")
                    .add_query("deviceId", "45555"),
                "http://localhost:3000/orders/1231?clientId=1231321&deviceId=45555",
            ),
            (
                base()
                    .host("http://0.0.0.0:3000")
                    .method("POST")
                    .path_args("/orders/{}", &[&1]),
                "http://0.0.0.0:3000/orders/1",
            ),
            (
                base()
                    .path("/orders")
                    .add_query("customerId", "first")
                    .add_query("customerId", "last"),
                "http://localhost:3000/orders?customerId=first&customerId=last",
            ),
            (
                base()
                    .path("/orders")
                    .add_query("customerId", "first")
                    .set_query("customerId", "last"),
                "http://localhost:3000/orders?customerId=last",
            ),
        ];

        for (request, expected) in cases {
            let url = request.url().expect("url must resolve");
            assert_eq!(url.as_str(), expected);
        }
    }

    #[test]
    fn query_keys_keep_first_use_order() {
        let request = base()
            .add_query("b", "1")
            .add_query("a", "2")
            .add_query("b", "3");
        assert_eq!(
            request.url().expect("url must resolve").query(),
            Some("b=1&b=3&a=2")
        );
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let request = base().path("/search").add_query("q", "a b&c=d");
        assert_eq!(
            request.url().expect("url must resolve").as_str(),
            "http://localhost:3000/search?q=a+b%26c%3Dd"
        );
    }

    #[test]
    fn url_is_idempotent() {
        let request = base().path("/x").add_query("id", "1");
        let first = request.url().expect("url must resolve");
        let second = request.url().expect("url must resolve");
        assert_eq!(first, second);
        assert_eq!(request.query_values("id"), Some(&["1".to_owned()][..]));
    }

    #[test]
    fn malformed_hosts_are_rejected() {
        for host in ["local:host:3000", "http://localhost:30a0", "not a url", ""] {
            let err = Request::new()
                .host(host)
                .url()
                .expect_err("host must be rejected");
            assert!(
                matches!(err, ResilientError::MalformedUrl { .. }),
                "unexpected error for '{host}': {err:?}"
            );
        }
    }

    #[test]
    fn header_set_and_add_are_case_insensitive() {
        let request = base()
            .add_header("X-Redirect", "12.13.22.100")
            .set_header_values("x-redirect", ["0.0.0.0", "8.8.8.8"])
            .add_header("X-REDIRECT", "1.1.1.1");
        assert_eq!(
            request.header_values("X-Redirect"),
            Some(&["0.0.0.0".to_owned(), "8.8.8.8".to_owned(), "1.1.1.1".to_owned()][..])
        );
    }

    #[test]
    fn add_values_append_several_at_once() {
        let request = base()
            .add_query("id", "1")
            .add_query_values("id", ["2", "3"])
            .add_header("X-Tag", "a")
            .add_header_values("x-tag", ["b", "c"]);

        assert_eq!(
            request.url().expect("url must resolve").query(),
            Some("id=1&id=2&id=3")
        );
        assert_eq!(
            request.header_values("X-Tag"),
            Some(&["a".to_owned(), "b".to_owned(), "c".to_owned()][..])
        );
    }

    #[test]
    fn materialize_builds_wire_request() {
        let request = Request::new()
            .method("POST")
            .path_args("/basket/{}", &[&1])
            .add_query("customerId", "12321")
            .set_header_values("X-Redirect", ["0.0.0.0", "8.8.8.8"])
            .basic_auth("test", "test")
            .body("hello world");

        let wire = request
            .materialize("http://localhost:3000", None)
            .expect("request must materialize");

        assert_eq!(wire.method(), &reqwest::Method::POST);
        assert_eq!(
            wire.url().as_str(),
            "http://localhost:3000/basket/1?customerId=12321"
        );
        let redirects: Vec<_> = wire
            .headers()
            .get_all("x-redirect")
            .iter()
            .map(|value| value.to_str().expect("ascii header"))
            .collect();
        assert_eq!(redirects, ["0.0.0.0", "8.8.8.8"]);
        assert_eq!(
            wire.headers()["authorization"],
            "Basic dGVzdDp0ZXN0"
        );
        assert_eq!(
            wire.body().and_then(|body| body.as_bytes()),
            Some(&b"hello world"[..])
        );
    }

    #[test]
    fn descriptor_host_wins_over_fallback() {
        let wire = Request::new()
            .host("http://override:1")
            .materialize("http://fallback:2", None)
            .expect("request must materialize");
        assert_eq!(wire.url().host_str(), Some("override"));
    }

    #[test]
    fn later_descriptor_changes_do_not_touch_wire_request() {
        let request = base().path("/a");
        let wire = request
            .materialize("", None)
            .expect("request must materialize");
        let _changed = request.path("/b").add_header("x-late", "1");
        assert_eq!(wire.url().path(), "/a");
        assert!(wire.headers().get("x-late").is_none());
    }

    #[test]
    fn invalid_method_is_rejected() {
        let err = base()
            .method(",")
            .materialize("", None)
            .expect_err("method must be rejected");
        assert!(matches!(err, ResilientError::InvalidMethod(ref m) if m == ","));
        assert!(err.is_request_construction());
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let err = base()
            .set_header("x-bad", "line\nbreak")
            .materialize("", None)
            .expect_err("header must be rejected");
        assert!(matches!(err, ResilientError::InvalidHeader { .. }));
    }

    #[test]
    fn placeholders_without_arguments_are_kept() {
        assert_eq!(
            substitute_placeholders("/a/{}/b/{}", &[&"x"]),
            "/a/x/b/{}"
        );
        assert_eq!(substitute_placeholders("/plain", &[&1]), "/plain");
    }
}
