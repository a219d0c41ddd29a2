//! Address matching for accept/deny lists and routing rules.
//!
//! An [`AddressSet`] is built once from configuration entries and is read-only
//! afterwards. Each entry is one of:
//!
//! - a single address (`10.0.0.1`, `fd00::1`)
//! - a network in CIDR notation (`10.0.0.0/24`)
//! - a range template with one or more numeric spans, either bracketed
//!   (`10.0.[1-4].1`) or bare (`10.0.0.1-5`). Templates expand to the
//!   cartesian product of all spans before each result is parsed.
//!
//! A template may not also carry a network prefix, and a bare span that
//! would equally read as a network (`10.0.0.0-24`) is rejected; the
//! bracketed form (`10.0.0.[0-24]`) is always unambiguous and is the way to
//! write such a range.

use crate::{Error, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Upper bound on the number of entries a single template may expand to.
pub const MAX_TEMPLATE_EXPANSION: usize = 65_536;

/// A network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    addr: IpAddr,
    prefix_len: u8,
}

impl Network {
    /// Parse `addr/len`, masking off host bits.
    pub fn parse(text: &str) -> Result<Self> {
        let (ip, len) = text
            .split_once('/')
            .ok_or_else(|| Error::parse(text, "missing prefix length"))?;
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::parse(text, format!("invalid network address '{ip}'")))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| Error::parse(text, format!("invalid prefix length '{len}'")))?;

        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(Error::parse(
                text,
                format!("prefix length must be 0-{max}, got {prefix_len}"),
            ));
        }

        let addr = match addr {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & v4_mask(prefix_len)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & v6_mask(prefix_len)).into()),
        };
        Ok(Self { addr, prefix_len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn v4_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(len))
    }
}

fn v6_mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        !0u128 << (128 - u32::from(len))
    }
}

/// Immutable set of addresses and networks.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    addrs: HashSet<IpAddr>,
    nets: Vec<Network>,
}

impl AddressSet {
    /// Build a set from configuration entries.
    ///
    /// Any malformed entry fails the whole build; no partial set is returned.
    pub fn build<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = AddressSet::default();
        for entry in entries {
            for expanded in expand_template(entry.as_ref().trim())? {
                if expanded.contains('/') {
                    let net = Network::parse(&expanded)?;
                    if !set.nets.contains(&net) {
                        set.nets.push(net);
                    }
                } else {
                    let addr: IpAddr = expanded
                        .parse()
                        .map_err(|_| Error::parse(&expanded, "invalid address"))?;
                    set.addrs.insert(addr.to_canonical());
                }
            }
        }
        Ok(set)
    }

    /// Whether `ip` is one of the stored addresses or inside a stored network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.addrs.contains(&ip) || self.nets.iter().any(|net| net.contains(ip))
    }

    /// Like [`contains`](Self::contains) for textual input.
    ///
    /// Accepts a bare address or `address:port`; anything unparsable is not
    /// contained.
    pub fn contains_str(&self, text: &str) -> bool {
        if let Ok(ip) = text.parse::<IpAddr>() {
            return self.contains(ip);
        }
        match text.parse::<SocketAddr>() {
            Ok(addr) => self.contains(addr.ip()),
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.nets.is_empty()
    }

    /// Number of point addresses plus number of networks.
    pub fn len(&self) -> usize {
        self.addrs.len() + self.nets.len()
    }
}

/// A numeric span located inside a template.
#[derive(Debug, Clone, Copy)]
struct Span {
    /// Byte offset of the first character of the span (including `[`).
    begin: usize,
    /// Byte offset one past the span (including `]`).
    end: usize,
    lo: u32,
    hi: u32,
}

/// Expand every numeric span in `token` into concrete strings.
///
/// Bracketed spans are expanded first, left to right, then bare spans.
/// A token without spans expands to itself.
pub fn expand_template(token: &str) -> Result<Vec<String>> {
    if token.is_empty() {
        return Err(Error::parse(token, "empty address entry"));
    }
    let has_span = token.contains('[') || find_bare_span(token)?.is_some();
    if has_span && token.contains('/') {
        return Err(Error::parse(
            token,
            "range templates cannot be combined with network prefixes",
        ));
    }

    let mut out = Vec::new();
    expand_into(token, token, &mut out)?;
    Ok(out)
}

fn expand_into(original: &str, text: &str, out: &mut Vec<String>) -> Result<()> {
    let span = match find_bracketed_span(text)? {
        Some(span) => span,
        None => {
            reject_network_lookalike(text)?;
            match find_bare_span(text)? {
                Some(span) => span,
                None => {
                    out.push(text.to_string());
                    return Ok(());
                }
            }
        }
    };

    if span.lo > span.hi {
        return Err(Error::parse(
            original,
            format!("inverted range {}-{}", span.lo, span.hi),
        ));
    }

    for value in span.lo..=span.hi {
        let next = format!("{}{}{}", &text[..span.begin], value, &text[span.end..]);
        expand_into(original, &next, out)?;
        if out.len() > MAX_TEMPLATE_EXPANSION {
            return Err(Error::parse(
                original,
                format!("expands to more than {MAX_TEMPLATE_EXPANSION} entries"),
            ));
        }
    }
    Ok(())
}

fn find_bracketed_span(text: &str) -> Result<Option<Span>> {
    let Some(open) = text.find('[') else {
        return Ok(None);
    };
    let close = text[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| Error::parse(text, "unterminated '[' in range"))?;
    let inner = &text[open + 1..close];
    let (lo, hi) = inner
        .split_once('-')
        .ok_or_else(|| Error::parse(text, format!("malformed range '[{inner}]'")))?;
    Ok(Some(Span {
        begin: open,
        end: close + 1,
        lo: parse_bound(text, lo)?,
        hi: parse_bound(text, hi)?,
    }))
}

/// Locate the first `digits-digits` run.
fn find_bare_span(text: &str) -> Result<Option<Span>> {
    let bytes = text.as_bytes();
    for (dash, _) in text.match_indices('-') {
        let begin = bytes[..dash]
            .iter()
            .rposition(|b| !b.is_ascii_digit())
            .map_or(0, |i| i + 1);
        let end = bytes[dash + 1..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |i| dash + 1 + i);
        if begin == dash || end == dash + 1 {
            continue;
        }
        return Ok(Some(Span {
            begin,
            end,
            lo: parse_bound(text, &text[begin..dash])?,
            hi: parse_bound(text, &text[dash + 1..end])?,
        }));
    }
    Ok(None)
}

fn parse_bound(text: &str, digits: &str) -> Result<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::parse(text, format!("invalid range bound '{digits}'")));
    }
    digits
        .parse()
        .map_err(|_| Error::parse(text, format!("range bound '{digits}' out of range")))
}

/// `10.0.0.0-24` reads as both "addresses .0 through .24" and the network
/// `10.0.0.0/24`; refuse to guess.
fn reject_network_lookalike(text: &str) -> Result<()> {
    let Some((addr, len)) = text.rsplit_once('-') else {
        return Ok(());
    };
    let (Ok(std::net::IpAddr::V4(v4)), Ok(len)) = (addr.parse::<IpAddr>(), len.parse::<u8>())
    else {
        return Ok(());
    };
    if len <= 32 && u32::from(v4) & !v4_mask(len) == 0 {
        return Err(Error::parse(
            text,
            format!(
                "ambiguous: mixes range and network notation (did you mean {addr}/{len}, or the range {}?)",
                bracketed(addr, len)
            ),
        ));
    }
    Ok(())
}

/// `10.0.0.0`, `16` -> `10.0.0.[0-16]`.
fn bracketed(addr: &str, end: u8) -> String {
    match addr.rsplit_once('.') {
        Some((head, start)) => format!("{head}.[{start}-{end}]"),
        None => format!("[{addr}-{end}]"),
    }
}
