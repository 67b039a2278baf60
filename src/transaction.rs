use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Method identifies the HTTP request method of a transaction.
/// Values must match the kernel probe's method classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Unknown = 0,
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Head = 5,
    Options = 6,
    Patch = 7,
}

impl Method {
    /// Returns the canonical request-line token.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }

    /// Convert from a raw u8 value. Unrecognized values decode to `Unknown`
    /// so a newer probe never breaks an older consumer.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Get,
            2 => Self::Post,
            3 => Self::Put,
            4 => Self::Delete,
            5 => Self::Head,
            6 => Self::Options,
            7 => Self::Patch,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family of a connection tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpFamily {
    V4 = 0,
    V6 = 1,
}

/// The 5-tuple of the TCP connection that carried a transaction.
///
/// IPv4 addresses occupy the low 32 bits of the `*_low` half; IPv6 addresses
/// span both halves (`high` holds the most significant 64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTuple {
    pub src_ip_high: u64,
    pub src_ip_low: u64,
    pub dst_ip_high: u64,
    pub dst_ip_low: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub family: IpFamily,
}

impl ConnTuple {
    pub fn is_ipv4(&self) -> bool {
        self.family == IpFamily::V4
    }

    fn fmt_addr(&self, high: u64, low: u64) -> String {
        match self.family {
            IpFamily::V4 => Ipv4Addr::from(low as u32).to_string(),
            IpFamily::V6 => Ipv6Addr::from((u128::from(high) << 64) | u128::from(low)).to_string(),
        }
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.fmt_addr(self.src_ip_high, self.src_ip_low),
            self.src_port,
            self.fmt_addr(self.dst_ip_high, self.dst_ip_low),
            self.dst_port,
        )
    }
}

/// One observed HTTP transaction, copied out of a kernel page.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub tuple: ConnTuple,
    pub method: Method,
    pub status_code: u16,
    /// Monotonic timestamp (ns) of the first request byte.
    pub request_started: u64,
    /// Monotonic timestamp (ns) of the last response byte seen so far.
    pub response_last_seen: u64,
    /// Leading bytes of the request buffer, NUL-trimmed.
    pub request_fragment: Vec<u8>,
    /// Source port of the connection owner, used to attribute the
    /// transaction when the tuple is NAT-translated.
    pub owner_src_port: u16,
    /// TCP sequence number of the request, carried for de-duplication by
    /// downstream correlation.
    pub tcp_seq: u32,
    /// Bitmap of probe-assigned tags (TLS library, protocol version, ...).
    pub static_tags: u64,
    /// Tags resolved in userspace, e.g. from TLS library hooks.
    pub dynamic_tags: Vec<String>,
}

impl Transaction {
    /// Status class of the response: 100, 200, 300, 400 or 500.
    pub fn status_class(&self) -> u16 {
        (self.status_code / 100) * 100
    }

    /// Request latency in nanoseconds. Zero when the clocks are inconsistent.
    pub fn latency_ns(&self) -> u64 {
        self.response_last_seen.saturating_sub(self.request_started)
    }

    /// A transaction is incomplete until the probe has seen a response
    /// status line.
    pub fn incomplete(&self) -> bool {
        self.status_code == 0 || self.response_last_seen == 0
    }

    /// Extracts the request path from the captured fragment.
    ///
    /// The fragment starts with the request line ("GET /foo?q=1 HTTP/1.1").
    /// Returns the path bytes up to but excluding any query string, or
    /// `None` when the fragment does not contain a well-formed path.
    pub fn path(&self) -> Option<&[u8]> {
        let b = &self.request_fragment;

        let space = b.iter().position(|&c| c == b' ')?;
        let rest = b.get(space + 1..)?;
        if rest.first() != Some(&b'/') {
            return None;
        }

        let end = rest
            .iter()
            .position(|&c| c == b' ' || c == b'?' || c == 0)
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }

        rest.get(..end)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} status={} latency_ns={}",
            self.tuple,
            self.method,
            String::from_utf8_lossy(self.path().unwrap_or(b"<no path>")),
            self.status_code,
            self.latency_ns(),
        )
    }
}
