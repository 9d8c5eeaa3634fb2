//! Header filtering shared by the outbound requests and the relayed response.

use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers that only describe one connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Extra hop-by-hop names a message declares in its `Connection` header.
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// End-to-end headers of a message: the fixed hop-by-hop list and every
/// header named in `Connection` are skipped.
pub fn end_to_end(headers: &HeaderMap) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> + '_ {
    let listed = connection_listed(headers);
    headers
        .iter()
        .filter(move |(name, _)| !is_hop_by_hop(name) && !listed.contains(name))
}

/// Copy the inbound headers for one outbound request.
///
/// Every value of a repeated header is kept, in order. `host` and
/// `content-length` are left to the outbound transport, which derives them
/// from the destination URL and the body copy. `user-agent` is never sent.
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len());
    for (name, value) in end_to_end(inbound) {
        if name == HOST || name == CONTENT_LENGTH || name == USER_AGENT {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}
