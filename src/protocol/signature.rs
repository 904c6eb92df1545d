//! Builtin fixed-signature probes
//!
//! Each signature tests a deterministic byte condition of a protocol's first
//! message. A probe answers `NeedMoreData` only while the bytes seen so far are
//! still consistent with the signature.

use std::fmt;
use std::str::FromStr;

use super::detector::ProbeResult;

/// HTTP request methods recognised at the start of a connection
const HTTP_METHODS: &[&[u8]] = &[
    b"OPTIONS ", b"GET ", b"HEAD ", b"POST ", b"PUT ", b"DELETE ",
    b"TRACE ", b"CONNECT ", b"PATCH ", b"PRI * HTTP/2.0",
];

/// How far into the stream the XMPP probe looks for its marker
const XMPP_PROBE_LEN: usize = 64;

/// OpenVPN opcodes for a client hard reset (v2 and v3)
const OPENVPN_HARD_RESET_CLIENT_V2: u8 = 7;
const OPENVPN_HARD_RESET_CLIENT_V3: u8 = 10;
/// opcode/key id (1) + session id (8) + ack array length (1) + packet id (4)
const OPENVPN_MIN_PACKET: usize = 14;

/// Builtin protocol signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signature {
    Ssh,
    OpenVpn,
    Tinc,
    Xmpp,
    Http,
    Adb,
    Socks5,
    Syslog,
}

impl Signature {
    /// All builtin signatures
    pub const ALL: [Signature; 8] = [
        Self::Ssh, Self::OpenVpn, Self::Tinc, Self::Xmpp,
        Self::Http, Self::Adb, Self::Socks5, Self::Syslog,
    ];

    /// Name used in configuration files
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::OpenVpn => "openvpn",
            Self::Tinc => "tinc",
            Self::Xmpp => "xmpp",
            Self::Http => "http",
            Self::Adb => "adb",
            Self::Socks5 => "socks5",
            Self::Syslog => "syslog",
        }
    }

    /// Classify the bytes received so far
    pub fn probe(&self, data: &[u8]) -> ProbeResult {
        match self {
            Self::Ssh => prefix(data, b"SSH-"),
            Self::OpenVpn => probe_openvpn(data),
            Self::Tinc => prefix(data, b"0 "),
            Self::Xmpp => probe_xmpp(data),
            Self::Http => probe_http(data),
            Self::Adb => prefix(data, b"CNXN"),
            Self::Socks5 => probe_socks5(data),
            Self::Syslog => probe_syslog(data),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|sig| sig.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown builtin probe: {}", s))
    }
}

/// Match a fixed byte prefix
fn prefix(data: &[u8], signature: &[u8]) -> ProbeResult {
    let n = data.len().min(signature.len());
    if data[..n] != signature[..n] {
        ProbeResult::Rejected
    } else if data.len() >= signature.len() {
        ProbeResult::Matched
    } else {
        ProbeResult::NeedMoreData
    }
}

/// OpenVPN over TCP: 16-bit packet length, then opcode in the top five bits
fn probe_openvpn(data: &[u8]) -> ProbeResult {
    if data.len() < 2 {
        return ProbeResult::NeedMoreData;
    }
    let packet_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if packet_len < OPENVPN_MIN_PACKET {
        return ProbeResult::Rejected;
    }
    if data.len() < 3 {
        return ProbeResult::NeedMoreData;
    }

    let opcode = data[2] >> 3;
    let key_id = data[2] & 0x07;
    if key_id == 0
        && (opcode == OPENVPN_HARD_RESET_CLIENT_V2 || opcode == OPENVPN_HARD_RESET_CLIENT_V3)
    {
        ProbeResult::Matched
    } else {
        ProbeResult::Rejected
    }
}

fn probe_xmpp(data: &[u8]) -> ProbeResult {
    if data.first().is_some_and(|&b| b != b'<') {
        return ProbeResult::Rejected;
    }
    if data.windows(6).any(|w| w == b"jabber") {
        return ProbeResult::Matched;
    }
    if data.len() < XMPP_PROBE_LEN {
        ProbeResult::NeedMoreData
    } else {
        ProbeResult::Rejected
    }
}

fn probe_http(data: &[u8]) -> ProbeResult {
    let mut result = ProbeResult::Rejected;
    for method in HTTP_METHODS {
        match prefix(data, method) {
            ProbeResult::Matched => return ProbeResult::Matched,
            ProbeResult::NeedMoreData => result = ProbeResult::NeedMoreData,
            ProbeResult::Rejected => {}
        }
    }
    result
}

/// SOCKS5 greeting: version 5, method count, then that many method ids
fn probe_socks5(data: &[u8]) -> ProbeResult {
    match data.first() {
        None => return ProbeResult::NeedMoreData,
        Some(&5) => {}
        Some(_) => return ProbeResult::Rejected,
    }
    let Some(&nmethods) = data.get(1) else {
        return ProbeResult::NeedMoreData;
    };
    let nmethods = nmethods as usize;
    if !(1..=10).contains(&nmethods) {
        return ProbeResult::Rejected;
    }
    let Some(methods) = data.get(2..2 + nmethods) else {
        return ProbeResult::NeedMoreData;
    };

    // 0x00-0x09 are IANA assigned, 0x80-0xFE are private
    if methods.iter().all(|&m| m <= 0x09 || (0x80..=0xFE).contains(&m)) {
        ProbeResult::Matched
    } else {
        ProbeResult::Rejected
    }
}

/// Syslog over TCP: `<PRI>` with PRI in 0..=191
fn probe_syslog(data: &[u8]) -> ProbeResult {
    match data.first() {
        None => return ProbeResult::NeedMoreData,
        Some(&b'<') => {}
        Some(_) => return ProbeResult::Rejected,
    }

    let mut priority: u32 = 0;
    for (digits, &byte) in data[1..].iter().enumerate() {
        match byte {
            b'0'..=b'9' if digits < 3 => priority = priority * 10 + u32::from(byte - b'0'),
            b'>' if digits > 0 => {
                return if priority <= 191 {
                    ProbeResult::Matched
                } else {
                    ProbeResult::Rejected
                };
            }
            _ => return ProbeResult::Rejected,
        }
    }
    ProbeResult::NeedMoreData
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProbeResult::*;

    #[test]
    fn test_ssh_banner() {
        assert_eq!(Signature::Ssh.probe(b"SS"), NeedMoreData);
        assert_eq!(Signature::Ssh.probe(b"SSH-2.0-OpenSSH_9.6\r\n"), Matched);
        assert_eq!(Signature::Ssh.probe(b"SSX"), Rejected);
        assert_eq!(Signature::Ssh.probe(b"GET / HTTP/1.1"), Rejected);
    }

    #[test]
    fn test_openvpn_hard_reset() {
        // length 14, opcode 7 key 0
        let packet = [0x00, 0x0e, 0x38, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Signature::OpenVpn.probe(&packet[..1]), NeedMoreData);
        assert_eq!(Signature::OpenVpn.probe(&packet[..2]), NeedMoreData);
        assert_eq!(Signature::OpenVpn.probe(&packet), Matched);

        // opcode 10 (v3)
        assert_eq!(Signature::OpenVpn.probe(&[0x00, 0x20, 0x50]), Matched);
        // data packet opcode
        assert_eq!(Signature::OpenVpn.probe(&[0x00, 0x20, 0x30]), Rejected);
        // "GE" read as a length is large but the opcode byte 'T' is wrong
        assert_eq!(Signature::OpenVpn.probe(b"GET "), Rejected);
        // too short to be a reset packet
        assert_eq!(Signature::OpenVpn.probe(&[0x00, 0x02]), Rejected);
    }

    #[test]
    fn test_tinc_and_adb() {
        assert_eq!(Signature::Tinc.probe(b"0 "), Matched);
        assert_eq!(Signature::Tinc.probe(b"0"), NeedMoreData);
        assert_eq!(Signature::Tinc.probe(b"1 "), Rejected);
        assert_eq!(Signature::Adb.probe(b"CNXN\x00\x00\x00\x01"), Matched);
        assert_eq!(Signature::Adb.probe(b"CN"), NeedMoreData);
    }

    #[test]
    fn test_xmpp_marker() {
        let stream = b"<?xml version='1.0'?><stream:stream to='example.com' xmlns='jabber:client'";
        assert_eq!(Signature::Xmpp.probe(&stream[..20]), NeedMoreData);
        assert_eq!(Signature::Xmpp.probe(stream), Matched);
        assert_eq!(Signature::Xmpp.probe(b"SSH-2.0"), Rejected);

        let long = [b'<'; XMPP_PROBE_LEN];
        assert_eq!(Signature::Xmpp.probe(&long), Rejected);
    }

    #[test]
    fn test_http_methods() {
        assert_eq!(Signature::Http.probe(b"G"), NeedMoreData);
        assert_eq!(Signature::Http.probe(b"GET "), Matched);
        assert_eq!(Signature::Http.probe(b"P"), NeedMoreData);
        assert_eq!(Signature::Http.probe(b"PU"), NeedMoreData);
        assert_eq!(Signature::Http.probe(b"PUT /x HTTP/1.1"), Matched);
        assert_eq!(Signature::Http.probe(b"PRI * HTTP/2.0\r\n\r\nSM"), Matched);
        assert_eq!(Signature::Http.probe(b"GETX"), Rejected);
        assert_eq!(Signature::Http.probe(b"\x16\x03\x01"), Rejected);
    }

    #[test]
    fn test_socks5_greeting() {
        assert_eq!(Signature::Socks5.probe(&[0x05]), NeedMoreData);
        assert_eq!(Signature::Socks5.probe(&[0x05, 0x02, 0x00]), NeedMoreData);
        assert_eq!(Signature::Socks5.probe(&[0x05, 0x02, 0x00, 0x02]), Matched);
        assert_eq!(Signature::Socks5.probe(&[0x05, 0x01, 0x80]), Matched);
        assert_eq!(Signature::Socks5.probe(&[0x05, 0x00]), Rejected);
        assert_eq!(Signature::Socks5.probe(&[0x05, 0x01, 0x42]), Rejected);
        assert_eq!(Signature::Socks5.probe(&[0x04, 0x01]), Rejected);
    }

    #[test]
    fn test_syslog_priority() {
        assert_eq!(Signature::Syslog.probe(b"<"), NeedMoreData);
        assert_eq!(Signature::Syslog.probe(b"<13"), NeedMoreData);
        assert_eq!(Signature::Syslog.probe(b"<13>Oct 11 22:14:15"), Matched);
        assert_eq!(Signature::Syslog.probe(b"<191>"), Matched);
        assert_eq!(Signature::Syslog.probe(b"<192>"), Rejected);
        assert_eq!(Signature::Syslog.probe(b"<>"), Rejected);
        assert_eq!(Signature::Syslog.probe(b"<1234>"), Rejected);
        assert_eq!(Signature::Syslog.probe(b"<?xml"), Rejected);
    }

    #[test]
    fn test_signature_names_round_trip() {
        for sig in Signature::ALL {
            assert_eq!(sig.name().parse::<Signature>().unwrap(), sig);
        }
        assert_eq!("SSH".parse::<Signature>().unwrap(), Signature::Ssh);
        assert!("tls".parse::<Signature>().is_err());
    }
}
