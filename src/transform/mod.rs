use std::str::FromStr;

use itertools::iproduct;
use serde::{Deserialize, Serialize};

/// How bypass wordlists are combined with scan candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BypassMode {
    #[default]
    None,
    /// prefix/suffix variants of the original request path only
    Single,
    /// prefix/suffix variants of every wordlist payload, scanned like payloads
    Multi,
}

impl FromStr for BypassMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(BypassMode::None),
            "single" => Ok(BypassMode::Single),
            "multi" => Ok(BypassMode::Multi),
            other => Err(format!(
                "unknown bypass mode '{other}', expected none, single or multi"
            )),
        }
    }
}

// default prefix list, inserted between the base path and the last segment
pub fn default_bypass_prefixes() -> Vec<String> {
    [
        "%2e/", "./", "..;/", ";/", "%20/", "%09/", "/", "%2f", ";foo=bar/", ".;/", "%252e/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// default suffix list, appended after the last segment
pub fn default_bypass_suffixes() -> Vec<String> {
    [
        "/", "/.", "//", "%20", "%09", "%00", "?", "#", ";", "..;/", ".json", "%2f", "/*", "~",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Splits a path into `(base, last)` where `base` ends with `/`.
///
/// A trailing `/` is ignored. A path without any `/` yields `(path + "/", "")`.
pub fn split_url_path(url_path: &str) -> Option<(String, String)> {
    if url_path.is_empty() {
        return None;
    }
    let processed = url_path.strip_suffix('/').unwrap_or(url_path);
    match processed.rfind('/') {
        None => Some((format!("{processed}/"), String::new())),
        Some(idx) => Some((
            processed[..=idx].to_string(),
            processed[idx + 1..].to_string(),
        )),
    }
}

fn join_base(base: &str, item: &str) -> String {
    if !item.starts_with('/') && !base.ends_with('/') {
        format!("{base}/{item}")
    } else {
        format!("{base}{item}")
    }
}

fn prefixed(base: &str, last: &str, item: &str) -> String {
    format!("{}{}", join_base(base, item), last)
}

fn suffixed(base: &str, last: &str, item: &str) -> String {
    format!("{}{}", join_base(base, last), item)
}

/// Prefix and suffix bypass variants for every payload.
///
/// Prefix variants come first, in `payload x prefix` order, then the suffix variants.
pub fn bypass_variants(payloads: &[String], prefixes: &[String], suffixes: &[String]) -> Vec<String> {
    let split: Vec<(String, String)> = payloads
        .iter()
        .filter_map(|p| split_url_path(p))
        .collect();

    let mut out = Vec::with_capacity(split.len() * (prefixes.len() + suffixes.len()));
    for ((base, last), item) in iproduct!(split.iter(), prefixes.iter()) {
        out.push(prefixed(base, last, item));
    }
    for ((base, last), item) in iproduct!(split.iter(), suffixes.iter()) {
        out.push(suffixed(base, last, item));
    }
    out
}

/// Bypass variants of the request path itself.
///
/// Paths that already carry an encoding (`%`) or a file extension (`.`) are left alone.
pub fn single_bypass(url_path: &str, prefixes: &[String], suffixes: &[String]) -> Vec<String> {
    if url_path.contains('%') || url_path.contains('.') {
        return Vec::new();
    }
    let Some((base, last)) = split_url_path(url_path) else {
        return Vec::new();
    };
    prefixes
        .iter()
        .map(|item| prefixed(&base, &last, item))
        .chain(suffixes.iter().map(|item| format!("{base}{last}{item}")))
        .collect()
}

// the encoders below are shared with the payload processing transforms

pub fn percent_encode_lower(input: &str) -> String {
    let mut out = String::new();
    for b in input.as_bytes() {
        match *b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'~' | b'.' => {
                out.push(*b as char)
            }
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

pub fn percent_encode_upper(input: &str) -> String {
    let mut out = String::new();
    for b in input.as_bytes() {
        match *b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'~' | b'.' => {
                out.push(*b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Strict percent-decoding; a dangling or non-hex escape is an error.
pub fn percent_decode(input: &str) -> Result<String, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| format!("invalid escape at offset {i}"))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| e.to_string())
}
