const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

pub(crate) const DEFAULT_WINDOW_BITS: u8 = 15;

/// The empty-block flush sentinel of RFC 7692: stripped from outgoing
/// compressed frames after a sync flush, re-appended before inflating
/// incoming ones.
pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// A `permessage-deflate` offer parsed from the `Sec-WebSocket-Extensions`
/// request header.
///
/// The no-context-takeover parameters control whether the compression
/// history is carried across messages in each direction; disabling takeover
/// forces a stream reset per message. The window-bit parameters bound the
/// LZ77 window each side may use. Larger windows (closer to 15) compress
/// better but cost more memory; smaller ones (closer to 8) are cheaper but
/// compress worse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub permessage_deflate: bool,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Parse a `Sec-WebSocket-Extensions` header value. Only the first
/// `permessage-deflate` offer is considered; window bits are clamped to
/// the 8-15 range RFC 7692 allows, and a valueless `client_max_window_bits`
/// means the client can accept any window, i.e. 15.
pub fn parse_extensions(extensions_header_value: &str) -> Option<Extensions> {
    for offer in extensions_header_value.split(',') {
        let mut extensions = Extensions::default();

        for extension_str in offer.split(';') {
            let extension_str = extension_str.trim();
            if extension_str == PERMESSAGE_DEFLATE {
                extensions.permessage_deflate = true;
            } else if extension_str.starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
                extensions.client_no_context_takeover = true;
            } else if extension_str.starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
                extensions.server_no_context_takeover = true;
            } else if extension_str.starts_with(CLIENT_MAX_WINDOW_BITS) {
                extensions.client_max_window_bits = parse_window_bits(extension_str);
            } else if extension_str.starts_with(SERVER_MAX_WINDOW_BITS) {
                extensions.server_max_window_bits = parse_window_bits(extension_str);
            }
        }

        if extensions.permessage_deflate {
            return Some(extensions);
        }
    }

    None
}

fn parse_window_bits(param: &str) -> Option<u8> {
    if !param.contains('=') {
        return Some(DEFAULT_WINDOW_BITS);
    }
    param
        .split('=')
        .last()?
        .trim()
        .trim_matches('"')
        .parse::<u8>()
        .ok()
        .map(|bits| bits.clamp(8, DEFAULT_WINDOW_BITS))
}

/// The compression parameters a client and this server agreed on.
#[derive(Debug, Clone)]
pub(crate) struct CompressionConfig {
    pub client_context_takeover: bool,
    pub server_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
    pub level: u32,
}

/// Negotiate `permessage-deflate` against a client offer. Returns the
/// agreed configuration plus the exact `Sec-WebSocket-Extensions` value to
/// place in the 101 response; the server must only echo parameters it will
/// honour.
///
/// zlib cannot produce raw deflate with a 256-byte window, so an offer
/// demanding `server_max_window_bits=8` is declined entirely rather than
/// answered with a window the peer did not agree to.
pub(crate) fn negotiate(offer: &Extensions, level: u32) -> Option<(CompressionConfig, String)> {
    if !offer.permessage_deflate {
        return None;
    }

    let server_max_window_bits = offer.server_max_window_bits.unwrap_or(DEFAULT_WINDOW_BITS);
    if server_max_window_bits < 9 {
        return None;
    }
    let client_max_window_bits = offer.client_max_window_bits.unwrap_or(DEFAULT_WINDOW_BITS);

    let config = CompressionConfig {
        client_context_takeover: !offer.client_no_context_takeover,
        server_context_takeover: !offer.server_no_context_takeover,
        client_max_window_bits,
        server_max_window_bits,
        level,
    };

    let mut reply = String::from(PERMESSAGE_DEFLATE);
    if !config.client_context_takeover {
        reply.push_str("; ");
        reply.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
    }
    if !config.server_context_takeover {
        reply.push_str("; ");
        reply.push_str(SERVER_NO_CONTEXT_TAKEOVER);
    }
    if offer.server_max_window_bits.is_some() {
        reply.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, server_max_window_bits));
    }
    if offer.client_max_window_bits.is_some() {
        reply.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, client_max_window_bits));
    }

    Some((config, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_offer() {
        let ext = parse_extensions("permessage-deflate").unwrap();
        assert!(ext.permessage_deflate);
        assert!(!ext.client_no_context_takeover);
        assert!(!ext.server_no_context_takeover);
        assert_eq!(ext.client_max_window_bits, None);
        assert_eq!(ext.server_max_window_bits, None);
    }

    #[test]
    fn test_parse_full_offer() {
        let ext = parse_extensions(
            "permessage-deflate; client_no_context_takeover; server_no_context_takeover; \
             client_max_window_bits=12; server_max_window_bits=10",
        )
        .unwrap();
        assert!(ext.client_no_context_takeover);
        assert!(ext.server_no_context_takeover);
        assert_eq!(ext.client_max_window_bits, Some(12));
        assert_eq!(ext.server_max_window_bits, Some(10));
    }

    #[test]
    fn test_parse_valueless_window_bits() {
        let ext = parse_extensions("permessage-deflate; client_max_window_bits").unwrap();
        assert_eq!(ext.client_max_window_bits, Some(15));
    }

    #[test]
    fn test_parse_clamps_window_bits() {
        let ext = parse_extensions("permessage-deflate; client_max_window_bits=20").unwrap();
        assert_eq!(ext.client_max_window_bits, Some(15));
        let ext = parse_extensions("permessage-deflate; client_max_window_bits=4").unwrap();
        assert_eq!(ext.client_max_window_bits, Some(8));
    }

    #[test]
    fn test_parse_unrelated_extension() {
        assert!(parse_extensions("x-webkit-deflate-frame").is_none());
        // the deflate offer is picked out of a list
        assert!(parse_extensions("x-webkit-deflate-frame, permessage-deflate").is_some());
    }

    #[test]
    fn test_negotiate_defaults() {
        let offer = parse_extensions("permessage-deflate").unwrap();
        let (config, reply) = negotiate(&offer, 6).unwrap();
        assert!(config.client_context_takeover);
        assert!(config.server_context_takeover);
        assert_eq!(config.client_max_window_bits, 15);
        assert_eq!(config.server_max_window_bits, 15);
        // no parameters the client did not send
        assert_eq!(reply, "permessage-deflate");
    }

    #[test]
    fn test_negotiate_echoes_agreed_parameters() {
        let offer = parse_extensions(
            "permessage-deflate; server_no_context_takeover; client_max_window_bits=11",
        )
        .unwrap();
        let (config, reply) = negotiate(&offer, 6).unwrap();
        assert!(!config.server_context_takeover);
        assert_eq!(config.client_max_window_bits, 11);
        assert_eq!(
            reply,
            "permessage-deflate; server_no_context_takeover; client_max_window_bits=11"
        );
    }

    #[test]
    fn test_negotiate_declines_tiny_server_window() {
        let offer = parse_extensions("permessage-deflate; server_max_window_bits=8").unwrap();
        assert!(negotiate(&offer, 6).is_none());
    }
}
