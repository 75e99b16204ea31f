//! SSRF-safe HTTP for scripts.
//!
//! DNS is resolved before any socket opens, every returned address is
//! screened (loopback, private, link-local, multicast, unspecified — all
//! refused), and the validated address is pinned into the client so the
//! actual connection cannot go anywhere else. That pinning closes the
//! TOCTOU window between lookup and connect: a racing DNS answer changes
//! nothing because the dialer never resolves again. Redirects are disabled
//! for the same reason.
//!
//! Everything here is blocking; script invocations already run on blocking
//! threads.

use std::io::Read;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Requests one invocation may make.
pub const MAX_REQUESTS_PER_INVOCATION: u8 = 3;
/// Response body cap.
pub const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;
/// Per-request deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-invocation request counter, shared by the injected `http` functions.
#[derive(Clone, Default)]
pub struct RequestBudget(Arc<AtomicU8>);

impl RequestBudget {
    fn spend(&self) -> Result<()> {
        let used = self.0.fetch_add(1, Ordering::Relaxed);
        if used >= MAX_REQUESTS_PER_INVOCATION {
            return Err(Error::Forbidden(format!(
                "http request limit ({MAX_REQUESTS_PER_INVOCATION}) exceeded"
            )));
        }
        Ok(())
    }
}

/// A fetched response, as surfaced to scripts.
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// True when connecting to `ip` must be refused.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local_v6(&v6)
                || is_link_local_v6(&v6)
                || v6.to_ipv4_mapped().is_some_and(|v4| {
                    is_blocked_ip(IpAddr::V4(v4))
                })
        }
    }
}

fn is_unique_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Screen a resolved address set. *Any* blocked address poisons the whole
/// answer — a hostname half-pointing at localhost is an attack, not a
/// routing choice. Returns the address to pin.
pub fn check_addrs(addrs: &[SocketAddr]) -> Result<SocketAddr> {
    if addrs.is_empty() {
        return Err(Error::Unreachable("hostname resolved to no addresses".into()));
    }
    for addr in addrs {
        if is_blocked_ip(addr.ip()) {
            return Err(Error::Forbidden(format!(
                "private/loopback address blocked: {}",
                addr.ip()
            )));
        }
    }
    Ok(addrs[0])
}

/// Validate a script-supplied URL and resolve its host. Only `http` and
/// `https` pass.
fn resolve(url: &Url) -> Result<(String, SocketAddr)> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Forbidden(format!("scheme not allowed: {other}")));
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Invalid("url has no host".into()))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Invalid("url has no port".into()))?;
    let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| Error::Unreachable(format!("resolve {host}: {e}")))?
        .collect();
    let pinned = check_addrs(&addrs)?;
    Ok((host, pinned))
}

/// Perform one GET or POST on behalf of a script.
pub fn fetch(
    budget: &RequestBudget,
    method: &str,
    raw_url: &str,
    body: Option<String>,
) -> Result<HttpResponse> {
    budget.spend()?;

    let url = Url::parse(raw_url).map_err(|e| Error::Invalid(format!("url: {e}")))?;
    let (host, pinned) = resolve(&url)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&host, pinned)
        .build()
        .map_err(|e| Error::Invalid(format!("http client: {e}")))?;

    let request = match method {
        "GET" => client.get(url),
        "POST" => {
            let mut req = client.post(url);
            if let Some(body) = body {
                req = req.body(body);
            }
            req
        }
        other => return Err(Error::Invalid(format!("method not allowed: {other}"))),
    };

    let response = request
        .send()
        .map_err(|e| Error::Unreachable(format!("request failed: {e}")))?;
    let status = response.status().as_u16();

    let mut buf = Vec::new();
    response
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut buf)
        .map_err(|e| Error::Unreachable(format!("read body: {e}")))?;

    Ok(HttpResponse {
        status,
        body: String::from_utf8_lossy(&buf).into_owned(),
    })
}
