//! Parsers for the two endpoint-configuration wire formats.
//!
//! `Report-To` (legacy) is a comma-joined JSON fragment the service wraps in
//! brackets before parsing; `Reporting-Endpoints` (V1) is a structured-fields
//! dictionary of `name="url"`. Both write into the cache and return nothing;
//! malformed input is dropped element by element.

use crate::cache::ReportingCache;
use crate::types::{Endpoint, Expiry, PartitionKey};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use url::Url;

/// Headers larger than this are dropped before parsing.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;
/// Container nesting limit for the bracket-wrapped `Report-To` document.
pub const MAX_JSON_DEPTH: usize = 5;

const DEFAULT_GROUP_NAME: &str = "default";
const DEFAULT_PRIORITY: u32 = 1;
const DEFAULT_WEIGHT: u32 = 1;

/// Container nesting depth of a parsed JSON document. Scalars contribute
/// nothing; `[{"a":[1]}]` has depth 3.
pub(crate) fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(members) => 1 + members.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Whether a collector URL is acceptable: HTTPS, or plain HTTP to a
/// loopback host.
pub(crate) fn is_potentially_trustworthy(url: &Url) -> bool {
    match url.scheme() {
        "https" => true,
        "http" => match url.host() {
            Some(url::Host::Domain(domain)) => {
                domain == "localhost" || domain.ends_with(".localhost")
            }
            Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
            Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
            None => false,
        },
        _ => false,
    }
}

#[derive(Deserialize)]
struct RawEndpointGroup {
    group: Option<String>,
    max_age: Option<i64>,
    include_subdomains: Option<bool>,
    endpoints: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct RawEndpoint {
    url: String,
    priority: Option<i64>,
    weight: Option<i64>,
}

/// Applies a parsed, bracket-wrapped `Report-To` header to the cache.
/// `value` is the wrapped JSON array; the caller has already enforced the
/// size and depth limits. `origin` is the origin form of the response URL
/// the header arrived on.
pub(crate) fn parse_report_to_header(
    cache: &mut ReportingCache,
    partition: &PartitionKey,
    origin: &Url,
    value: &Value,
) {
    let Some(groups) = value.as_array() else {
        return;
    };

    let now = SystemTime::now();
    for group_value in groups {
        let Ok(raw) = serde_json::from_value::<RawEndpointGroup>(group_value.clone()) else {
            tracing::debug!(origin = %origin, "dropping malformed Report-To group");
            continue;
        };
        process_endpoint_group(cache, partition, origin, raw, now);
    }
}

fn process_endpoint_group(
    cache: &mut ReportingCache,
    partition: &PartitionKey,
    origin: &Url,
    raw: RawEndpointGroup,
    now: SystemTime,
) {
    let name = raw.group.unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());

    let max_age = match raw.max_age {
        Some(age) if age >= 0 => age as u64,
        _ => {
            tracing::debug!(origin = %origin, group = %name, "group without usable max_age");
            return;
        }
    };

    if max_age == 0 {
        cache.remove_endpoint_group(partition, origin, &name);
        return;
    }

    let endpoints: Vec<Endpoint> = raw
        .endpoints
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| parse_endpoint(origin, v))
        .collect();

    cache.set_endpoints_for_origin(
        partition.clone(),
        origin.clone(),
        name,
        raw.include_subdomains.unwrap_or(false),
        Expiry::At(now + Duration::from_secs(max_age)),
        endpoints,
    );
}

fn parse_endpoint(origin: &Url, value: Value) -> Option<Endpoint> {
    let raw: RawEndpoint = serde_json::from_value(value).ok()?;

    let url = Url::parse(&raw.url).ok()?;
    if !is_potentially_trustworthy(&url) {
        tracing::debug!(origin = %origin, endpoint = %url, "dropping non-secure endpoint");
        return None;
    }

    let priority = match raw.priority {
        None => DEFAULT_PRIORITY,
        Some(p) if p >= 0 => p as u32,
        Some(_) => return None,
    };
    let weight = match raw.weight {
        None => DEFAULT_WEIGHT,
        Some(w) if w >= 1 => w as u32,
        Some(_) => return None,
    };

    Some(Endpoint::new(url, priority, weight))
}

/// Validates a V1 name→URL map against the registering origin. URLs may be
/// relative to the origin; untrustworthy entries are dropped individually.
pub(crate) fn validate_document_endpoints(
    origin: &Url,
    raw: &BTreeMap<String, String>,
) -> Vec<(String, Url)> {
    raw.iter()
        .filter_map(|(name, value)| {
            let url = Url::options().base_url(Some(origin)).parse(value).ok()?;
            if !is_potentially_trustworthy(&url) {
                tracing::debug!(origin = %origin, endpoint = %url, "dropping non-secure endpoint");
                return None;
            }
            Some((name.clone(), url))
        })
        .collect()
}

/// Parses the `Reporting-Endpoints` structured-fields dictionary subset
/// `name="url", name2="url2"`. Any malformed member fails the whole header,
/// per the structured-fields parsing rules. Duplicate keys keep the last
/// value.
pub fn parse_reporting_endpoints(header: &str) -> Option<BTreeMap<String, String>> {
    let mut rest = header.trim_matches(is_ows);
    if rest.is_empty() {
        return None;
    }

    let mut map = BTreeMap::new();
    loop {
        let (key, after_key) = parse_sf_key(rest)?;
        rest = after_key.strip_prefix('=')?;
        let (value, after_value) = parse_sf_string(rest)?;
        map.insert(key, value);

        rest = after_value.trim_start_matches(is_ows);
        if rest.is_empty() {
            return Some(map);
        }
        rest = rest.strip_prefix(',')?;
        rest = rest.trim_start_matches(is_ows);
    }
}

fn is_ows(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn parse_sf_key(input: &str) -> Option<(String, &str)> {
    let mut end = 0;
    for (idx, c) in input.char_indices() {
        let valid = if idx == 0 {
            c.is_ascii_lowercase() || c == '*'
        } else {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.' | '*')
        };
        if !valid {
            break;
        }
        end = idx + c.len_utf8();
    }
    if end == 0 {
        return None;
    }
    Some((input[..end].to_string(), &input[end..]))
}

fn parse_sf_string(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, '"')) => {}
        _ => return None,
    }

    let mut value = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Some((value, &input[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\\'))) => value.push(escaped),
                _ => return None,
            },
            c if c.is_ascii() && !c.is_ascii_control() => value.push(c),
            _ => return None,
        }
    }
    None
}
