//! URL normalization and prefix matching.
//!
//! A prefix is a normalized URL without query whose path ends on a segment
//! boundary, e.g. `https://example.com/blog`. It covers itself and every URL
//! below it, but not `https://example.com/blogroll`.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::error::AppError;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref", "ref_src"];

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("built-in selector is valid"));

fn parse(raw: &str) -> Result<Url, AppError> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else if raw.contains("://") {
        return Err(AppError::InvalidUrl(format!("unsupported scheme in {raw}")));
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| AppError::InvalidUrl(format!("{raw}: {e}")))?;
    if url.host_str().is_none() {
        return Err(AppError::InvalidUrl(format!("no host in {raw}")));
    }
    Ok(url)
}

/// Canonical form of a URL.
///
/// Adds `https://` when no scheme is given, lowercases scheme and host,
/// strips `www.`, default ports, the fragment, tracking parameters and a
/// trailing slash, and sorts the remaining query parameters.
pub fn normalize_url(raw: &str) -> Result<String, AppError> {
    let mut url = parse(raw)?;
    url.set_fragment(None);

    if let Some(host) = url.host_str().and_then(|h| h.strip_prefix("www.")) {
        let host = host.to_string();
        url.set_host(Some(&host))
            .map_err(|e| AppError::InvalidUrl(format!("{raw}: {e}")))?;
    }

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();
    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(params);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut out = url.to_string();
    // Root URLs render as `https://host/`; keep them slash-free too.
    if url.path() == "/" && url.query().is_none() {
        out.pop();
    }
    Ok(out)
}

/// The URL minus its query and last path segment: the narrowest prefix a
/// page can belong to. A site root is its own prefix.
pub fn deepest_prefix(raw: &str) -> Result<String, AppError> {
    let normalized = normalize_url(raw)?;
    let url = parse(&normalized)?;
    let origin = url.origin().ascii_serialization();
    let segments: Vec<&str> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if segments.len() <= 1 {
        return Ok(origin);
    }
    Ok(format!("{origin}/{}", segments[..segments.len() - 1].join("/")))
}

/// Every prefix covering `raw`, longest first, ending with the origin.
/// The normalized URL itself (without query) comes first.
pub fn candidate_prefixes(raw: &str) -> Result<Vec<String>, AppError> {
    let normalized = normalize_url(raw)?;
    let url = parse(&normalized)?;
    let origin = url.origin().ascii_serialization();
    let segments: Vec<&str> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = Vec::with_capacity(segments.len() + 1);
    for len in (1..=segments.len()).rev() {
        out.push(format!("{origin}/{}", segments[..len].join("/")));
    }
    out.push(origin);
    Ok(out)
}

/// Segment-aware prefix test on normalized URLs.
pub fn prefix_matches(prefix: &str, url: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match url.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Host without `www.`, used to group samples by site.
pub fn domain_of(raw: &str) -> Result<String, AppError> {
    let url = parse(raw)?;
    let host = url.host_str().unwrap_or_default().to_lowercase();
    Ok(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Normalized `http(s)` links of a page that fall under `prefix`, in
/// document order, without duplicates and without the page itself.
pub fn discover_links(raw_html: &str, page_url: &str, prefix: &str) -> Vec<String> {
    let Ok(base) = parse(page_url) else {
        return Vec::new();
    };
    let self_url = normalize_url(page_url).ok();
    let document = Html::parse_document(raw_html);

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for el in document.select(&LINK_SELECTOR) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(joined) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(joined.scheme(), "http" | "https") {
            continue;
        }
        let Ok(normalized) = normalize_url(joined.as_str()) else {
            continue;
        };
        if Some(&normalized) == self_url.as_ref() || !prefix_matches(prefix, &normalized) {
            continue;
        }
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}
