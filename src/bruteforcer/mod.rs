use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::http::is_http;
use crate::transform::{self, BypassMode};

/// Which end of the path the level cap is counted from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    /// shallow-first: keep prefixes up to `level` slashes deep
    #[default]
    Left,
    /// deep-first: keep the `level` directories closest to the file
    Right,
}

impl FromStr for ScanDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(ScanDirection::Left),
            "right" => Ok(ScanDirection::Right),
            other => Err(format!("unknown scan direction '{other}', expected left or right")),
        }
    }
}

/// Expands a request path into the directory prefixes to scan under.
///
/// `/admin/api/test` at level 2 going left gives `["/", "/admin/"]`.
pub fn path_dict(url_path: &str, level: usize, direction: ScanDirection) -> Vec<String> {
    let mut result = vec!["/".to_string()];
    if url_path.is_empty() || url_path == "/" {
        return result;
    }
    if direction == ScanDirection::Left && level <= 1 {
        return result;
    }

    // drop the trailing file name
    let dir = if url_path.ends_with('/') {
        url_path
    } else {
        &url_path[..url_path.rfind('/').map_or(0, |idx| idx + 1)]
    };
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        return result;
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    let total = segments.len() as i64;
    let level = level as i64;
    if direction == ScanDirection::Right && level < total {
        result.clear();
    }

    let mut prefix = String::from("/");
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        prefix.push_str(segment);
        prefix.push('/');
        let depth = prefix.matches('/').count() as i64;
        let keep = match direction {
            ScanDirection::Left => depth <= level,
            ScanDirection::Right => total - depth < level,
        };
        if keep {
            result.push(prefix.clone());
        }
    }
    result
}

/// Joins one wordlist payload onto a directory prefix.
///
/// Absolute-URL payloads only apply at the root. `absolute_origin` is set when the
/// request line itself carried an absolute URL; relative candidates then keep that form.
pub fn join_payload(prefix: &str, item: &str, absolute_origin: Option<&str>) -> Option<String> {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    let item_is_http = is_http(item);
    if !prefix.is_empty() && item_is_http {
        return None;
    }
    let mut url_path = if prefix.is_empty() && !item.starts_with('/') && !item_is_http {
        format!("/{item}")
    } else {
        format!("{prefix}{item}")
    };
    if let Some(origin) = absolute_origin {
        if !item_is_http {
            url_path = format!("{origin}{url_path}");
        }
    }
    Some(url_path)
}

/// Every `prefix x payload` candidate, deepest prefix first.
pub fn combine_with_dict(
    dict: &[String],
    payloads: &[String],
    absolute_origin: Option<&str>,
) -> Vec<String> {
    dict.iter()
        .rev()
        .flat_map(|prefix| {
            payloads
                .iter()
                .filter_map(move |item| join_payload(prefix, item, absolute_origin))
        })
        .collect()
}

/// Inputs for candidate generation of one inbound request.
#[derive(Clone, Debug)]
pub struct CandidatePlan<'a> {
    pub path: &'a str,
    pub level: usize,
    pub direction: ScanDirection,
    pub dir_scan: bool,
    pub bypass: BypassMode,
    pub payloads: &'a [String],
    pub bypass_prefixes: &'a [String],
    pub bypass_suffixes: &'a [String],
    pub absolute_origin: Option<&'a str>,
}

impl CandidatePlan<'_> {
    /// Candidate request targets, in dispatch order.
    ///
    /// Query strings never take part: only the path is combined.
    pub fn candidates(&self) -> Vec<String> {
        let bypass_payloads = if self.bypass == BypassMode::Multi {
            transform::bypass_variants(self.payloads, self.bypass_prefixes, self.bypass_suffixes)
        } else {
            Vec::new()
        };

        if !self.dir_scan {
            return match self.bypass {
                BypassMode::Multi => {
                    let base = self.path.strip_suffix('/').unwrap_or(self.path);
                    self.payloads
                        .iter()
                        .chain(bypass_payloads.iter())
                        .filter_map(|item| join_payload(base, item, self.absolute_origin))
                        .collect()
                }
                BypassMode::Single => {
                    transform::single_bypass(self.path, self.bypass_prefixes, self.bypass_suffixes)
                }
                BypassMode::None => Vec::new(),
            };
        }

        let dict = path_dict(self.path, self.level, self.direction);
        let mut out = combine_with_dict(&dict, self.payloads, self.absolute_origin);
        out.extend(combine_with_dict(&dict, &bypass_payloads, self.absolute_origin));
        out
    }
}
