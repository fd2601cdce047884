//! Availability checks of HTTP endpoints.
//!
//! A check is configured with a string of the form `url[,route[,search[,Header:v1;v2...]]]`:
//!
//! - `url`: the URL to request
//! - `route`: an optional name for the check, added as the `route` tag
//! - `search`: an optional string to look for in the response body
//! - every further field is a request header, `Name:value`, where several values for the same
//!   header are separated by `;`
//!
//! The host of the URL is resolved, and the URL is requested once per address, carrying the
//! original host name in the `Host` header. This reports every backend behind a DNS name
//! separately.
use std::{
    collections::HashSet,
    fmt,
    net::IpAddr,
    str::FromStr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Empty};
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    http::uri::PathAndQuery,
    Method, Request, StatusCode, Uri,
};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::{debug, warn};
use tsrelay::{DataPoint, TagSet};

use crate::{add, Collector, CollectorError, CollectorFuture};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = concat!("tsrelay-collectors/", env!("CARGO_PKG_VERSION"));

/// Configuration of a single HTTP check.
#[derive(Clone, Debug)]
pub struct HttpCheckConfig {
    url: Uri,
    host: String,
    route: Option<String>,
    search: Option<String>,
    headers: HeaderMap,
}

impl HttpCheckConfig {
    /// The URL being checked.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The host name sent in the `Host` header, and reported as the `dst_host` tag.
    ///
    /// This is the host of the URL unless an explicit `Host` header was configured.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The route name, if any.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// The string searched for in response bodies, if any.
    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    /// Extra request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn url_host(&self) -> &str {
        self.url.host().map_or("", |h| h.trim_start_matches('[').trim_end_matches(']'))
    }

    fn port(&self) -> u16 {
        self.url.port_u16().unwrap_or(if self.url.scheme_str() == Some("https") { 443 } else { 80 })
    }
}

impl FromStr for HttpCheckConfig {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: String| CollectorError::InvalidConfig { config: s.to_string(), reason };

        let mut fields = s.split(',');
        let url = fields.next().map(str::trim).unwrap_or_default();
        let url = Uri::from_str(url).map_err(|e| invalid(format!("invalid URL: {e}")))?;
        match url.scheme_str() {
            Some("http" | "https") => {}
            _ => return Err(invalid("URL scheme must be http or https".to_string())),
        }
        let url_host = match url.host() {
            Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(invalid("URL has no host".to_string())),
        };

        let non_empty = |field: Option<&str>| field.filter(|f| !f.is_empty()).map(String::from);
        let route = non_empty(fields.next());
        let search = non_empty(fields.next());

        let mut headers = HeaderMap::new();
        for pair in fields {
            let parts: Vec<&str> = pair.split(':').collect();
            let [name, values] = parts.as_slice() else {
                return Err(invalid(format!("header '{pair}' must be of the form Name:value")));
            };
            let name = HeaderName::from_str(name.trim())
                .map_err(|e| invalid(format!("invalid header name in '{pair}': {e}")))?;
            for value in values.split(';') {
                let value = HeaderValue::from_str(value.trim())
                    .map_err(|e| invalid(format!("invalid header value in '{pair}': {e}")))?;
                headers.append(name.clone(), value);
            }
        }

        let host = match headers.get(header::HOST) {
            Some(value) => value
                .to_str()
                .map_err(|e| invalid(format!("invalid Host header: {e}")))?
                .to_string(),
            None => url_host.to_string(),
        };

        Ok(HttpCheckConfig { url, host, route, search, headers })
    }
}

impl fmt::Display for HttpCheckConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Checks an HTTP endpoint on every address its host resolves to.
///
/// Every round emits, per address:
///
/// - `http.check.response_time`: time until the response headers arrived, in milliseconds
/// - `http.check.response_code`: the response status code
/// - `http.check.failed`: `0`
/// - `http.check.string_found`: `1` if the search string was found in the body, `0` otherwise,
///   only when a search string is configured
///
/// If a request fails, `http.check.failed` is reported as `1` for that address and the remaining
/// addresses are skipped until the next round.
pub struct HttpCheck {
    name: String,
    config: HttpCheckConfig,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl HttpCheck {
    /// Creates a new `HttpCheck`.
    ///
    /// # Errors
    ///
    /// If the native root certificates cannot be loaded, an error is returned.
    pub fn new(config: HttpCheckConfig) -> Result<Self, CollectorError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| CollectorError::Client(e.to_string()))?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(HttpCheck { name: format!("http-{config}"), config, client, timeout: DEFAULT_TIMEOUT })
    }

    /// Sets the timeout of a single request, including reading the response body.
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn resolve(&self) -> Result<Vec<IpAddr>, CollectorError> {
        let host = self.config.url_host();
        let addrs = tokio::net::lookup_host((host, self.config.port()))
            .await
            .map_err(|source| CollectorError::Resolve { host: host.to_string(), source })?;

        let mut seen = HashSet::new();
        Ok(addrs.map(|addr| addr.ip()).filter(|ip| seen.insert(*ip)).collect())
    }

    async fn check(&self, ip: IpAddr, points: &mut Vec<DataPoint>) -> Result<(), String> {
        let tags = check_tags(&self.config, ip);
        let request = build_request(&self.config, ip).map_err(|e| e.to_string())?;

        let start = Instant::now();
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| e.to_string())?;
            let elapsed = start.elapsed();
            let status = response.status();
            let body = match response.into_body().collect().await.map(Collected::to_bytes) {
                Ok(body) => body,
                Err(e) => {
                    warn!(url = %self.config.url, %ip, error = %e, "Failed to read response body.");
                    Bytes::new()
                }
            };
            Ok::<_, String>((elapsed, status, body))
        };

        let (elapsed, status, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(format!("timed out after {:?}", self.timeout)),
        };

        report(points, &self.config, &tags, elapsed, status, &body);
        Ok(())
    }
}

impl Collector for HttpCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&mut self) -> CollectorFuture<'_> {
        Box::pin(async move {
            let ips = self.resolve().await?;
            let mut points = Vec::new();
            for ip in ips {
                if let Err(reason) = self.check(ip, &mut points).await {
                    debug!(url = %self.config.url, %ip, %reason, "HTTP check failed.");
                    add(&mut points, "http.check.failed", 1, &check_tags(&self.config, ip));
                    break;
                }
            }
            Ok(points)
        })
    }
}

fn report(
    points: &mut Vec<DataPoint>,
    config: &HttpCheckConfig,
    tags: &TagSet,
    elapsed: Duration,
    status: StatusCode,
    body: &[u8],
) {
    add(points, "http.check.response_time", elapsed.as_secs_f64() * 1000.0, tags);
    add(points, "http.check.response_code", status.as_u16(), tags);
    add(points, "http.check.failed", 0, tags);
    if let Some(search) = config.search() {
        let found = String::from_utf8_lossy(body).contains(search);
        add(points, "http.check.string_found", found, tags);
    }
}

fn check_tags(config: &HttpCheckConfig, ip: IpAddr) -> TagSet {
    let mut tags =
        TagSet::new().with("dst_host", config.host()).with("ip", ip.to_string().replace(':', "."));
    if let Some(route) = config.route() {
        tags.insert("route", route);
    }
    tags
}

/// Points `url` at a specific address, keeping its scheme, port, path and query.
fn target_uri(url: &Uri, ip: IpAddr) -> Result<Uri, hyper::http::Error> {
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    let authority = match url.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };
    let path = url.path_and_query().map_or("/", PathAndQuery::as_str);

    Uri::builder()
        .scheme(url.scheme_str().unwrap_or("http"))
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
}

fn build_request(
    config: &HttpCheckConfig,
    ip: IpAddr,
) -> Result<Request<Empty<Bytes>>, hyper::http::Error> {
    let mut request =
        Request::builder().method(Method::GET).uri(target_uri(&config.url, ip)?).body(Empty::new())?;

    let headers = request.headers_mut();
    headers.extend(config.headers.clone());
    headers.insert(header::HOST, HeaderValue::from_str(config.host())?);
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, time::Duration};

    use hyper::{header, StatusCode};
    use tsrelay::{TagSet, Value};

    use super::{build_request, check_tags, report, target_uri, HttpCheckConfig, DEFAULT_USER_AGENT};

    fn config(s: &str) -> HttpCheckConfig {
        s.parse().unwrap_or_else(|e| panic!("failed to parse '{s}': {e}"))
    }

    #[test]
    fn parse_config() {
        struct Case {
            input: &'static str,
            host: &'static str,
            route: Option<&'static str>,
            search: Option<&'static str>,
            headers: usize,
        }

        let cases = [
            Case {
                input: "http://example.com/health",
                host: "example.com",
                route: None,
                search: None,
                headers: 0,
            },
            Case {
                input: "https://example.com:8443/,api",
                host: "example.com",
                route: Some("api"),
                search: None,
                headers: 0,
            },
            Case {
                input: "http://example.com/,,OK",
                host: "example.com",
                route: None,
                search: Some("OK"),
                headers: 0,
            },
            Case {
                input: "http://10.0.0.1/,api,OK,Host:www.example.com,Accept:text/html; text/plain",
                host: "www.example.com",
                route: Some("api"),
                search: Some("OK"),
                headers: 3,
            },
            Case {
                input: "http://[::1]:8080/status",
                host: "::1",
                route: None,
                search: None,
                headers: 0,
            },
        ];

        for case in cases {
            let config = config(case.input);
            assert_eq!(config.host(), case.host, "input: {}", case.input);
            assert_eq!(config.route(), case.route, "input: {}", case.input);
            assert_eq!(config.search(), case.search, "input: {}", case.input);
            assert_eq!(config.headers().len(), case.headers, "input: {}", case.input);
        }
    }

    #[test]
    fn parse_config_errors() {
        let cases = [
            "",
            "example.com/health",
            "ftp://example.com/",
            "http://example.com/,api,OK,NoSeparator",
            "http://example.com/,api,OK,Too:many:colons",
            "http://example.com/,api,OK,Bad Name:value",
        ];

        for input in cases {
            assert!(input.parse::<HttpCheckConfig>().is_err(), "input should be rejected: {input}");
        }
    }

    #[test]
    fn header_values_are_split_and_trimmed() {
        let config = config("http://example.com/,,,X-Env: prod ; canary");
        let values: Vec<_> = config
            .headers()
            .get_all("x-env")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, ["prod", "canary"]);
    }

    #[test]
    fn target_uri_keeps_port_and_path() {
        let url = config("https://example.com:8443/status?verbose=1").url().clone();
        let v4: IpAddr = "192.0.2.7".parse().unwrap();
        let v6: IpAddr = "2001:db8::7".parse().unwrap();

        assert_eq!(target_uri(&url, v4).unwrap().to_string(), "https://192.0.2.7:8443/status?verbose=1");
        assert_eq!(
            target_uri(&url, v6).unwrap().to_string(),
            "https://[2001:db8::7]:8443/status?verbose=1"
        );

        let bare = config("http://example.com").url().clone();
        assert_eq!(target_uri(&bare, v4).unwrap().to_string(), "http://192.0.2.7/");
    }

    #[test]
    fn request_carries_host_and_default_user_agent() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        let request = build_request(&config("http://example.com/,,,Accept:text/html"), ip).unwrap();
        assert_eq!(request.headers()[header::HOST], "example.com");
        assert_eq!(request.headers()[header::USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(request.headers()[header::ACCEPT], "text/html");

        let request = build_request(
            &config("http://example.com/,,,Host:internal.example.com,User-Agent:probe/1.0"),
            ip,
        )
        .unwrap();
        assert_eq!(request.headers().get_all(header::HOST).iter().count(), 1);
        assert_eq!(request.headers()[header::HOST], "internal.example.com");
        assert_eq!(request.headers()[header::USER_AGENT], "probe/1.0");
    }

    #[test]
    fn tags_identify_host_address_and_route() {
        let v6: IpAddr = "2001:db8::7".parse().unwrap();
        let tags = check_tags(&config("http://example.com/,checkout"), v6);
        assert_eq!(
            tags,
            TagSet::new()
                .with("dst_host", "example.com")
                .with("ip", "2001.db8..7")
                .with("route", "checkout")
        );

        let tags = check_tags(&config("http://example.com/"), "192.0.2.7".parse().unwrap());
        assert!(!tags.contains_key("route"));
    }

    #[test]
    fn report_emits_string_found_only_with_search() {
        let tags = TagSet::new().with("dst_host", "example.com");
        let elapsed = Duration::from_millis(1500);

        let mut points = Vec::new();
        report(&mut points, &config("http://example.com/"), &tags, elapsed, StatusCode::OK, b"ok");
        let metrics: Vec<_> = points.iter().map(|p| p.metric()).collect();
        assert_eq!(
            metrics,
            ["http.check.response_time", "http.check.response_code", "http.check.failed"]
        );
        assert_eq!(points[0].value(), Value::Float(1500.0));
        assert_eq!(points[1].value(), Value::Integer(200));
        assert_eq!(points[2].value(), Value::Integer(0));

        let mut points = Vec::new();
        let searching = config("http://example.com/,,healthy");
        report(&mut points, &searching, &tags, elapsed, StatusCode::OK, b"status: healthy");
        report(&mut points, &searching, &tags, elapsed, StatusCode::OK, b"status: degraded");
        let found: Vec<_> = points
            .iter()
            .filter(|p| p.metric() == "http.check.string_found")
            .map(|p| p.value())
            .collect();
        assert_eq!(found, [Value::Integer(1), Value::Integer(0)]);
    }
}
