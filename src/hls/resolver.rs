//! HLS Manifest Resolver (component B). Stateless: fetches manifest text and either
//! returns a replacement URL (master playlist) or an ordered list of segment URLs
//! (media playlist). Has no side effects other than the one HTTP request it issues.

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{FetchError, ResolverError};

pub enum ResolvedManifest {
    /// Master playlist: caller should re-resolve against this URL.
    Redirect(Url),
    /// Media playlist: ordered, absolute segment URLs.
    Segments(Vec<Url>),
}

/// Fetch `manifest_url` and classify/parse it per §4.2.
pub async fn resolve(
    client: &reqwest::Client,
    manifest_url: &Url,
    token: &CancellationToken,
) -> Result<ResolvedManifest, ResolverError> {
    let text = fetch_text(client, manifest_url, token).await?;
    Ok(parse(&text, manifest_url))
}

async fn fetch_text(
    client: &reqwest::Client,
    url: &Url,
    token: &CancellationToken,
) -> Result<String, ResolverError> {
    let response = tokio::select! {
        _ = token.cancelled() => return Err(ResolverError::Cancelled),
        result = client.get(url.clone()).header("Accept", "application/x-mpegURL, */*").send() => result,
    };
    let response = response.map_err(FetchError::from)?;
    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()).into());
    }
    let text = tokio::select! {
        _ = token.cancelled() => return Err(ResolverError::Cancelled),
        result = response.text() => result,
    };
    text.map_err(|e| FetchError::from(e).into())
}

/// Pure parsing/classification step, separated from the fetch for testability.
fn parse(text: &str, base: &Url) -> ResolvedManifest {
    if text.contains("#EXT-X-STREAM-INF") {
        ResolvedManifest::Redirect(best_variant(text, base))
    } else {
        ResolvedManifest::Segments(media_segments(text, base))
    }
}

fn resolve_uri(raw: &str, base: &Url) -> Option<Url> {
    base.join(raw.trim()).ok()
}

fn best_variant(text: &str, base: &Url) -> Url {
    let lines: Vec<&str> = text.lines().collect();
    let mut best: Option<(u64, Url)> = None;
    for (idx, line) in lines.iter().enumerate() {
        if !line.starts_with("#EXT-X-STREAM-INF") {
            continue;
        }
        let bandwidth = parse_bandwidth(line);
        let uri_line = lines[idx + 1..]
            .iter()
            .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
        let Some(uri_line) = uri_line else { continue };
        let Some(url) = resolve_uri(uri_line, base) else {
            continue;
        };
        let replace = match &best {
            None => true,
            Some((best_bw, _)) => bandwidth > *best_bw,
        };
        if replace {
            best = Some((bandwidth, url));
        }
    }
    best.map(|(_, url)| url)
        .unwrap_or_else(|| base.clone())
}

fn parse_bandwidth(line: &str) -> u64 {
    line.split(',')
        .find_map(|attr| attr.trim().strip_prefix("BANDWIDTH="))
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

fn media_segments(text: &str, base: &Url) -> Vec<Url> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| resolve_uri(l, base))
        .collect()
}

/// Resolve a master/media manifest, handling the single-level master->media redirect
/// described in spec §4.4 step 2. Bounded to `max_redirects` hops.
pub async fn resolve_to_segments(
    client: &reqwest::Client,
    manifest_url: &Url,
    token: &CancellationToken,
    max_redirects: u32,
) -> Result<(Url, Vec<Url>), ResolverError> {
    let mut current = manifest_url.clone();
    for _ in 0..=max_redirects {
        match resolve(client, &current, token).await? {
            ResolvedManifest::Redirect(next) => {
                current = next;
            }
            ResolvedManifest::Segments(segments) => {
                if segments.is_empty() {
                    return Err(ResolverError::EmptyManifest);
                }
                return Ok((current, segments));
            }
        }
    }
    Err(ResolverError::TooManyRedirects)
}
