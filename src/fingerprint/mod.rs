//! Coherent browser fingerprint profiles.
//!
//! Anti-bot systems correlate three signals: the TLS ClientHello (JA3), the
//! HTTP/2 connection prologue (SETTINGS values, initial WINDOW_UPDATE,
//! pseudo-header order), and the request header set. A Chrome-shaped
//! ClientHello combined with a Firefox User-Agent is a reliable automation
//! tell, so all three always derive from one [`Profile`] and transports are
//! pinned to exactly one profile at construction.
//!
//! The ClientHello spec is carried as data (cipher-suite ids, extension ids,
//! groups, signature schemes, ALPN, version advertisement) and applied as
//! far as the TLS stack allows; the HTTP/2 values are applied through the
//! client builder's flow-control knobs. `SETTINGS_HEADER_TABLE_SIZE` and
//! pseudo-header emission order are not configurable through hyper; the
//! profile records the target values so integrators that need full
//! wire-level fidelity know what to match.

pub mod sensor;

use crate::client::headers::{chrome_headers, OrderedHeaderMap};

/// HTTP/2 pseudo-header names in the order Chrome 120 emits them. hyper
/// writes `:method, :scheme, :authority, :path`; this constant documents the
/// target order for stacks that can reorder.
pub const PSEUDO_HEADER_ORDER: [&str; 4] = [":method", ":authority", ":scheme", ":path"];

/// TLS ClientHello shape for one browser build.
///
/// Values are IANA code points. GREASE placeholders are not listed: stacks
/// that support GREASE inject and randomise them per RFC 8701, and their
/// placement (first cipher, first/last extension) is part of the parroted
/// browser behaviour rather than profile data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    /// Cipher suites in preference order.
    pub cipher_suites: Vec<u16>,
    /// Extension ids in emission order.
    pub extensions: Vec<u16>,
    /// supported_groups (named curves) in preference order.
    pub supported_groups: Vec<u16>,
    /// Groups for which key shares are sent in the first flight.
    pub key_shares: Vec<u16>,
    /// signature_algorithms in preference order.
    pub signature_algorithms: Vec<u16>,
    /// supported_versions advertisement, newest first.
    pub supported_versions: Vec<u16>,
    /// ALPN protocols in preference order.
    pub alpn: Vec<&'static str>,
}

/// HTTP/2 connection prologue values sent immediately after the preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Prologue {
    /// SETTINGS_HEADER_TABLE_SIZE.
    pub header_table_size: u32,
    /// SETTINGS_INITIAL_WINDOW_SIZE (stream-level).
    pub initial_window_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_header_list_size: u32,
    /// Connection-level WINDOW_UPDATE increment sent right after SETTINGS.
    pub connection_window_update: u32,
}

/// One internally consistent browser fingerprint: TLS hello, HTTP/2
/// prologue, and request header set.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub tls: ClientHelloSpec,
    pub h2: Http2Prologue,
    headers: OrderedHeaderMap,
}

impl Profile {
    /// Chrome 120 on Windows. The default profile for every session.
    pub fn chrome_120() -> Self {
        Self {
            name: "chrome-120-windows",
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            tls: ClientHelloSpec {
                cipher_suites: vec![
                    0x1301, // TLS_AES_128_GCM_SHA256
                    0x1302, // TLS_AES_256_GCM_SHA384
                    0x1303, // TLS_CHACHA20_POLY1305_SHA256
                    0xc02b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
                    0xc02f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
                    0xc02c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
                    0xc030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
                    0xcca9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
                    0xcca8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
                ],
                extensions: vec![
                    0x0000, // server_name
                    0x0017, // extended_master_secret
                    0xff01, // renegotiation_info
                    0x000a, // supported_groups
                    0x000b, // ec_point_formats
                    0x0023, // session_ticket
                    0x0010, // ALPN
                    0x0005, // status_request
                    0x000d, // signature_algorithms
                    0x0012, // signed_certificate_timestamp
                    0x002b, // supported_versions
                    0x002d, // psk_key_exchange_modes
                    0x0033, // key_share
                    0x001b, // compress_certificate
                ],
                supported_groups: vec![0x001d, 0x0017, 0x0018], // x25519, secp256r1, secp384r1
                key_shares: vec![0x001d],
                signature_algorithms: vec![
                    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
                ],
                supported_versions: vec![0x0304, 0x0303], // TLS 1.3, TLS 1.2
                alpn: vec!["h2", "http/1.1"],
            },
            h2: Http2Prologue {
                header_table_size: 65536,
                initial_window_size: 6_291_456,
                max_header_list_size: 262_144,
                connection_window_update: 15_663_105,
            },
            headers: chrome_headers(),
        }
    }

    /// Firefox 121 on Windows.
    pub fn firefox_121() -> Self {
        let mut headers = OrderedHeaderMap::new();
        headers.add(
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
        );
        headers.add(
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        );
        headers.add("Accept-Language", "en-US,en;q=0.5");
        headers.add("Accept-Encoding", "gzip, deflate, br");
        headers.add("Upgrade-Insecure-Requests", "1");
        headers.add("Sec-Fetch-Dest", "document");
        headers.add("Sec-Fetch-Mode", "navigate");
        headers.add("Sec-Fetch-Site", "none");
        headers.add("Sec-Fetch-User", "?1");

        Self {
            name: "firefox-121-windows",
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
            tls: ClientHelloSpec {
                cipher_suites: vec![
                    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030,
                ],
                extensions: vec![
                    0x0000, 0x0017, 0xff01, 0x000a, 0x000b, 0x0023, 0x0010, 0x0005, 0x000d,
                    0x002b, 0x002d, 0x0033, 0x001c,
                ],
                supported_groups: vec![0x001d, 0x0017, 0x0018, 0x0019],
                key_shares: vec![0x001d, 0x0017],
                signature_algorithms: vec![
                    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601,
                ],
                supported_versions: vec![0x0304, 0x0303],
                alpn: vec!["h2", "http/1.1"],
            },
            h2: Http2Prologue {
                header_table_size: 65536,
                initial_window_size: 131_072,
                max_header_list_size: 393_216,
                connection_window_update: 12_517_377,
            },
            headers,
        }
    }

    /// The profile's base request header set, in emission order. Sessions
    /// clone this once at construction and overlay their own entries.
    pub fn base_headers(&self) -> OrderedHeaderMap {
        self.headers.clone()
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::chrome_120()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_profile_is_internally_consistent() {
        let profile = Profile::chrome_120();
        // The header set's User-Agent must match the profile's.
        assert_eq!(profile.base_headers().get("User-Agent"), Some(profile.user_agent));
        assert_eq!(profile.h2.header_table_size, 65536);
        assert_eq!(profile.h2.initial_window_size, 6_291_456);
        assert_eq!(profile.h2.max_header_list_size, 262_144);
        assert_eq!(profile.h2.connection_window_update, 15_663_105);
    }

    #[test]
    fn tls13_suites_lead_the_cipher_list() {
        for profile in [Profile::chrome_120(), Profile::firefox_121()] {
            assert_eq!(profile.tls.cipher_suites[0], 0x1301, "{}", profile.name);
            assert_eq!(profile.tls.supported_versions[0], 0x0304, "{}", profile.name);
            assert_eq!(profile.tls.alpn[0], "h2", "{}", profile.name);
        }
    }

    #[test]
    fn pseudo_header_order_matches_chrome() {
        assert_eq!(PSEUDO_HEADER_ORDER, [":method", ":authority", ":scheme", ":path"]);
    }
}
