//! TLS ClientHello inspection
//!
//! Parses the TLS record layer and the ClientHello handshake message just far
//! enough to extract the Server Name Indication and the ALPN protocol list.
//! Nothing cryptographic is validated.
//!
//! Record layout:
//! - byte 0: content type (0x16 = handshake)
//! - bytes 1-2: record version (major 3)
//! - bytes 3-4: fragment length
//!
//! ClientHello body:
//! - 2 bytes: client version
//! - 32 bytes: random
//! - 1 byte length + session id (at most 32 bytes)
//! - 2 byte length + cipher suites
//! - 1 byte length + compression methods
//! - 2 byte length + extensions (optional)
//!
//! The handshake message may be split across several records and arrive over
//! several reads; both cases report `Incomplete` until the message is whole.

use log::trace;

use super::detector::ProbeResult;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER_LEN: usize = 5;
/// Largest plaintext fragment a record may carry
const MAX_RECORD_LEN: usize = 1 << 14;
/// One full-size record including its header
pub const MAX_RECORD_FRAME: usize = RECORD_HEADER_LEN + MAX_RECORD_LEN;
/// Upper bound on the ClientHello message we are willing to reassemble
const MAX_HANDSHAKE_LEN: usize = 1 << 16;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const SNI_HOST_NAME: u8 = 0x00;

/// Fields extracted from a ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// Version from the first record header
    pub record_version: u16,
    /// Legacy client version from the handshake body
    pub client_version: u16,
    /// Server name, lowercased without a trailing dot
    pub server_name: Option<String>,
    /// Offered application protocols, in client order
    pub alpn: Vec<String>,
}

impl ClientHello {
    /// Human readable name of the client version
    pub fn version_name(&self) -> String {
        match self.client_version {
            0x0300 => "SSLv3".to_string(),
            0x0301 => "TLSv1.0".to_string(),
            0x0302 => "TLSv1.1".to_string(),
            0x0303 => "TLSv1.2".to_string(),
            0x0304 => "TLSv1.3".to_string(),
            v => format!("Unknown ({}.{})", v >> 8, v & 0xff),
        }
    }
}

/// Outcome of parsing the bytes received so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloParse {
    /// The whole ClientHello is present
    Complete(ClientHello),
    /// Everything seen so far is consistent, more bytes are needed
    Incomplete,
    /// The bytes cannot be a TLS ClientHello
    Malformed(&'static str),
}

/// Parse a (possibly partial) TLS ClientHello
pub fn parse_client_hello(data: &[u8]) -> HelloParse {
    let mut handshake = Vec::new();
    let mut pos = 0;
    let mut record_version = 0;

    loop {
        let header = &data[pos..data.len().min(pos + RECORD_HEADER_LEN)];
        if let Err(reason) = check_record_header(header) {
            return HelloParse::Malformed(reason);
        }
        if header.len() < RECORD_HEADER_LEN {
            return HelloParse::Incomplete;
        }
        if pos == 0 {
            record_version = u16::from_be_bytes([header[1], header[2]]);
        }

        let fragment_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let fragment_start = pos + RECORD_HEADER_LEN;
        let fragment_end = fragment_start + fragment_len;
        handshake.extend_from_slice(&data[fragment_start..data.len().min(fragment_end)]);

        if let Some(&msg_type) = handshake.first() {
            if msg_type != HANDSHAKE_CLIENT_HELLO {
                return HelloParse::Malformed("handshake is not a ClientHello");
            }
        }
        if handshake.len() >= 4 {
            let body_len = read_u24(&handshake[1..4]);
            if body_len > MAX_HANDSHAKE_LEN {
                return HelloParse::Malformed("ClientHello too large");
            }
            if handshake.len() >= 4 + body_len {
                return match parse_body(&handshake[4..4 + body_len]) {
                    Ok(mut hello) => {
                        hello.record_version = record_version;
                        HelloParse::Complete(hello)
                    }
                    Err(reason) => HelloParse::Malformed(reason),
                };
            }
        }

        if data.len() < fragment_end {
            return HelloParse::Incomplete;
        }
        pos = fragment_end;
    }
}

/// Validate as much of a record header as is present
fn check_record_header(header: &[u8]) -> Result<(), &'static str> {
    if header.first().is_some_and(|&b| b != CONTENT_TYPE_HANDSHAKE) {
        return Err("not a handshake record");
    }
    if header.get(1).is_some_and(|&b| b != 0x03) {
        return Err("unsupported record version");
    }
    if header.get(2).is_some_and(|&b| b > 0x04) {
        return Err("unsupported record version");
    }
    if header.len() == RECORD_HEADER_LEN {
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Err("invalid record length");
        }
    }
    Ok(())
}

fn read_u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize)
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }
}

fn parse_body(body: &[u8]) -> Result<ClientHello, &'static str> {
    let mut reader = Reader::new(body);
    let truncated = "truncated ClientHello";

    let client_version = reader.u16().ok_or(truncated)?;
    if client_version >> 8 != 0x03 {
        return Err("unsupported client version");
    }
    reader.bytes(32).ok_or(truncated)?;

    let session_id = reader.vec8().ok_or(truncated)?;
    if session_id.len() > 32 {
        return Err("session id too long");
    }

    let cipher_suites = reader.vec16().ok_or(truncated)?;
    if cipher_suites.is_empty() || cipher_suites.len() % 2 != 0 {
        return Err("invalid cipher suite list");
    }

    let compression = reader.vec8().ok_or(truncated)?;
    if compression.is_empty() {
        return Err("empty compression method list");
    }

    let mut hello = ClientHello {
        client_version,
        ..ClientHello::default()
    };

    // Pre-extension ClientHellos simply end here
    if reader.is_empty() {
        return Ok(hello);
    }

    let extensions = reader.vec16().ok_or(truncated)?;
    if !reader.is_empty() {
        return Err("trailing bytes after extensions");
    }

    let mut extensions = Reader::new(extensions);
    while !extensions.is_empty() {
        let ext_type = extensions.u16().ok_or("truncated extension")?;
        let ext_data = extensions.vec16().ok_or("truncated extension")?;
        match ext_type {
            EXT_SERVER_NAME => hello.server_name = parse_server_name(ext_data)?,
            EXT_ALPN => hello.alpn = parse_alpn(ext_data)?,
            _ => trace!("Skipping TLS extension {:#06x}", ext_type),
        }
    }

    Ok(hello)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, &'static str> {
    let mut reader = Reader::new(data);
    let list = reader.vec16().ok_or("truncated server name list")?;

    let mut names = Reader::new(list);
    while !names.is_empty() {
        let name_type = names.u8().ok_or("truncated server name")?;
        let name = names.vec16().ok_or("truncated server name")?;
        if name_type == SNI_HOST_NAME {
            let host = std::str::from_utf8(name).map_err(|_| "server name is not UTF-8")?;
            return Ok(Some(normalize_host(host)));
        }
    }
    Ok(None)
}

fn parse_alpn(data: &[u8]) -> Result<Vec<String>, &'static str> {
    let mut reader = Reader::new(data);
    let list = reader.vec16().ok_or("truncated ALPN list")?;

    let mut protocols = Vec::new();
    let mut entries = Reader::new(list);
    while !entries.is_empty() {
        let protocol = entries.vec8().ok_or("truncated ALPN entry")?;
        protocols.push(String::from_utf8_lossy(protocol).into_owned());
    }
    Ok(protocols)
}

/// Lowercase and strip the trailing dot of a host name
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Does `host` satisfy the allow-list entry `pattern`?
///
/// A leading `*.` matches one or more labels.
fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.',
        None => pattern == host,
    }
}

/// TLS probe with optional SNI and ALPN allow-lists
#[derive(Debug, Clone, Default)]
pub struct TlsProbe {
    server_names: Vec<String>,
    alpn_protocols: Vec<String>,
}

impl TlsProbe {
    pub fn new(server_names: &[String], alpn_protocols: &[String]) -> Self {
        Self {
            server_names: server_names.iter().map(|n| normalize_host(n)).collect(),
            alpn_protocols: alpn_protocols.to_vec(),
        }
    }

    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn_protocols
    }

    /// Check a parsed ClientHello against the configured allow-lists
    pub fn accepts(&self, hello: &ClientHello) -> bool {
        let sni_ok = self.server_names.is_empty()
            || hello
                .server_name
                .as_deref()
                .is_some_and(|host| self.server_names.iter().any(|p| host_matches(p, host)));

        let alpn_ok = self.alpn_protocols.is_empty()
            || hello.alpn.iter().any(|offered| self.alpn_protocols.contains(offered));

        sni_ok && alpn_ok
    }

    pub fn probe(&self, data: &[u8]) -> ProbeResult {
        match parse_client_hello(data) {
            HelloParse::Incomplete => ProbeResult::NeedMoreData,
            HelloParse::Malformed(reason) => {
                trace!("TLS probe rejected: {}", reason);
                ProbeResult::Rejected
            }
            HelloParse::Complete(hello) => {
                trace!(
                    "ClientHello {} sni={:?} alpn={:?}",
                    hello.version_name(),
                    hello.server_name,
                    hello.alpn
                );
                if self.accepts(&hello) {
                    ProbeResult::Matched
                } else {
                    ProbeResult::Rejected
                }
            }
        }
    }
}
