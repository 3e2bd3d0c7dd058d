use tracing::debug;

use crate::http::{is_http, path_and_query, Exchange, HttpService, RawRequest, RawResponse};

/// Builds the follow-up exchange for a 3xx response, or `None` when there is
/// nothing to follow.
///
/// The new request is a `GET` carrying the original headers with `Host` rewritten.
/// `Content-Length` and `Cookie` are dropped; with `carry_cookies` a fresh `Cookie`
/// header is built from the response's `Set-Cookie` pairs.
pub fn follow_up(
    service: &HttpService,
    request: &[u8],
    response: &RawResponse,
    carry_cookies: bool,
) -> Option<Exchange> {
    if !(300..400).contains(&response.status) {
        return None;
    }
    let location = response.location()?;
    let original = RawRequest::parse(request)?;
    let base = service.url_for(&original.target)?;
    let resolved = match base.join(location) {
        Ok(url) => url,
        Err(e) => {
            debug!(location, "dropping malformed redirect target: {e}");
            return None;
        }
    };
    let Some(next_service) = HttpService::from_url(&resolved) else {
        debug!(location, "dropping non-http redirect target");
        return None;
    };

    let (service, target) = if is_http(&original.target) {
        (service.clone(), resolved.to_string())
    } else {
        (next_service.clone(), path_and_query(&resolved))
    };

    let mut out = format!("GET {target} HTTP/1.1\r\n");
    out.push_str(&format!("Host: {}\r\n", next_service.host_port()));
    for (k, v) in original.headers.iter() {
        let skip = ["host", "content-length", "cookie"]
            .iter()
            .any(|h| k.eq_ignore_ascii_case(h));
        if !skip {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
    }
    if carry_cookies {
        let cookies = response.cookies();
        if !cookies.is_empty() {
            out.push_str(&format!("Cookie: {}\r\n", cookies.join("; ")));
        }
    }
    out.push_str("\r\n");
    Some(Exchange::new(service, out))
}
