use crate::compression::{parse_extensions, Extensions};
use crate::config::{
    clamp_outbound_frame_size, HANDSHAKE_TIMEOUT, HANDSHAKE_WRITE_TIMEOUT, MAX_HANDSHAKE_SIZE,
    MAX_OUTGOING_FRAME_SIZE, WS_GUID,
};
use crate::error::Error;
use crate::stream::ServerStream;
use base64::prelude::*;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Everything the core needs out of an HTTP upgrade request.
#[derive(Debug, Clone)]
pub(crate) struct UpgradeRequest {
    pub key: String,
    pub path: String,
    pub query: Option<String>,
    /// Tokens of the `Sec-WebSocket-Protocol` header, in client order.
    pub protocols: Vec<String>,
    /// Parsed `permessage-deflate` offer, if any.
    pub extensions: Option<Extensions>,
    /// Raw `Authorization` header, opaque to the core.
    pub authorization: Option<String>,
}

impl UpgradeRequest {
    /// First URL path segment, used as the sub-protocol fallback when the
    /// client sent no `Sec-WebSocket-Protocol` header.
    pub fn path_protocol(&self) -> Option<&str> {
        let segment = self.path.trim_start_matches('/');
        let segment = segment.split('/').next().unwrap_or("");
        if segment.is_empty() {
            None
        } else {
            Some(segment)
        }
    }

    /// The `max_frame_size` query parameter, clamped to sane bounds.
    pub fn max_outbound_frame_size(&self) -> usize {
        let Some(query) = &self.query else {
            return MAX_OUTGOING_FRAME_SIZE;
        };
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == "max_frame_size" {
                if let Ok(requested) = value.parse::<usize>() {
                    if requested > 0 {
                        return clamp_outbound_frame_size(requested);
                    }
                }
            }
        }
        MAX_OUTGOING_FRAME_SIZE
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key:
/// base64(SHA-1(key ++ GUID)).
pub fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

fn header_value_contains(value: &[u8], needle: &str) -> bool {
    std::str::from_utf8(value)
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(needle))
        })
        .unwrap_or(false)
}

/// Parse a complete upgrade request out of raw header bytes.
pub(crate) fn parse_upgrade_request(buf: &[u8]) -> Result<Option<UpgradeRequest>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);

    if request.parse(buf)?.is_partial() {
        return Ok(None);
    }

    if request.method != Some("GET") || request.version != Some(1) {
        return Err(Error::InvalidHTTPHandshake);
    }

    let target = request.path.ok_or(Error::InvalidHTTPHandshake)?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut key = None;
    let mut protocols = Vec::new();
    let mut extensions = None;
    let mut authorization = None;

    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("Upgrade") {
            upgrade_ok = header_value_contains(header.value, "websocket");
        } else if header.name.eq_ignore_ascii_case("Connection") {
            connection_ok = header_value_contains(header.value, "upgrade");
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
            version_ok = std::str::from_utf8(header.value)
                .map(|value| value.trim() == "13")
                .unwrap_or(false);
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            key = std::str::from_utf8(header.value)
                .ok()
                .map(|value| value.trim().to_owned());
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
            if let Ok(value) = std::str::from_utf8(header.value) {
                protocols.extend(
                    value
                        .split(',')
                        .map(|token| token.trim().to_owned())
                        .filter(|token| !token.is_empty()),
                );
            }
        } else if header.name.eq_ignore_ascii_case("Sec-WebSocket-Extensions") {
            if let Ok(value) = std::str::from_utf8(header.value) {
                extensions = parse_extensions(value);
            }
        } else if header.name.eq_ignore_ascii_case("Authorization") {
            authorization = std::str::from_utf8(header.value)
                .ok()
                .map(|value| value.to_owned());
        }
    }

    if !upgrade_ok {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !connection_ok {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !version_ok {
        return Err(Error::UnsupportedWebsocketVersion);
    }
    let key = key.ok_or(Error::NoSecWebsocketKey)?;

    Ok(Some(UpgradeRequest {
        key,
        path,
        query,
        protocols,
        extensions,
        authorization,
    }))
}

/// Read the upgrade request off the socket. The read is bounded in both
/// size and time so a stalled or malicious peer cannot pin the accept
/// path.
pub(crate) async fn read_upgrade_request(stream: &mut ServerStream) -> Result<UpgradeRequest, Error> {
    let mut header_buf = BytesMut::with_capacity(1024);
    let mut tmp_buf = [0u8; 1024];

    while header_buf.len() <= MAX_HANDSHAKE_SIZE {
        let n = match timeout(HANDSHAKE_TIMEOUT, stream.read(&mut tmp_buf)).await {
            Ok(Ok(0)) => return Err(Error::IncompleteHTTPRequest),
            Ok(Ok(n)) => n,
            Ok(Err(source)) => return Err(source.into()),
            Err(_) => return Err(Error::HandshakeTimeout),
        };
        header_buf.extend_from_slice(&tmp_buf[..n]);

        if let Some(request) = parse_upgrade_request(&header_buf)? {
            return Ok(request);
        }
    }

    Err(Error::IncompleteHTTPRequest)
}

/// Build the `101 Switching Protocols` response. The sub-protocol is
/// echoed only when it was chosen through the header (not the URL path),
/// and the extension line carries exactly the agreed parameters.
pub(crate) fn build_accept_response(
    accept_key: &str,
    protocol: Option<&str>,
    extensions_reply: Option<&str>,
) -> String {
    let mut response = String::with_capacity(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key));
    if let Some(protocol) = protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    if let Some(extensions) = extensions_reply {
        response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions));
    }
    response.push_str("Sec-WebSocket-Version: 13\r\n");
    response.push_str("\r\n");
    response
}

pub(crate) fn build_reject_response() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
}

/// Write a handshake response on the still-synchronous path, bounded so a
/// peer that never drains its socket cannot hold the accept loop.
pub(crate) async fn write_response(stream: &mut ServerStream, response: &str) -> Result<(), Error> {
    match timeout(HANDSHAKE_WRITE_TIMEOUT, async {
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(source.into()),
        Err(_) => Err(Error::HandshakeTimeout),
    }
}
