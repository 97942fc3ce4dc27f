//! Segment Fetcher (component C). A single HTTP GET with optional byte-range resumption,
//! streamed to disk, cancellation-aware, progress-reporting. Contains no retry loop —
//! retry policy lives in the runner (§4.3).

use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Sentinel for "total size unknown" in `on_progress(received, total)` callbacks.
pub const TOTAL_UNKNOWN: u64 = u64::MAX;

pub struct FetchOptions<'a> {
    pub token: &'a CancellationToken,
    pub range_from: u64,
    pub on_progress: &'a mut dyn FnMut(u64, u64),
}

/// Outcome of a single fetch attempt, distinguishing whether the server honored the
/// requested byte range (status 206) or returned a fresh full body (status 200) despite
/// a nonzero `range_from` — the defensive case from spec §9.
pub struct FetchOutcome {
    pub range_honored: bool,
}

/// Fetch `url` into `dest_path`, streaming bytes directly to disk. On cancellation the
/// partial file is preserved (not deleted) so a later call can resume.
pub async fn fetch(
    client: &reqwest::Client,
    url: &url::Url,
    dest_path: &Path,
    opts: FetchOptions<'_>,
) -> Result<FetchOutcome, FetchError> {
    let FetchOptions {
        token,
        range_from,
        on_progress,
    } = opts;

    let mut request = client.get(url.clone());
    if range_from > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={range_from}-"));
    }

    let response = tokio::select! {
        _ = token.cancelled() => return Err(FetchError::Cancelled),
        result = request.send() => result,
    }?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    let range_honored = range_from > 0 && response.status().as_u16() == 206;
    let truncate = range_from > 0 && !range_honored;

    let total = response
        .content_length()
        .map(|len| if range_honored { len + range_from } else { len })
        .unwrap_or(TOTAL_UNKNOWN);

    let mut file = if truncate {
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest_path)
            .await?
    } else if range_from > 0 {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dest_path)
            .await?
    } else {
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest_path)
            .await?
    };

    let base = if truncate { 0 } else { range_from };
    let mut received: u64 = 0;
    let mut stream = response.bytes_stream();

    loop {
        let chunk: Option<Result<Bytes, reqwest::Error>> = tokio::select! {
            _ = token.cancelled() => {
                let _ = file.flush().await;
                return Err(FetchError::Cancelled);
            }
            next = stream.next() => next,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        on_progress(received + base, if total == TOTAL_UNKNOWN { TOTAL_UNKNOWN } else { total });
    }

    file.flush().await?;
    Ok(FetchOutcome { range_honored })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes as AxumBytes,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    struct Body(Arc<Vec<u8>>);

    async fn serve_full(State(body): State<Body>) -> impl IntoResponse {
        AxumBytes::from(body.0.as_slice().to_vec())
    }

    async fn serve_range(State(body): State<Body>, headers: HeaderMap) -> axum::response::Response {
        let full = &body.0;
        if let Some(range) = headers.get(reqwest::header::RANGE) {
            let range = range.to_str().unwrap();
            let start: usize = range
                .trim_start_matches("bytes=")
                .trim_end_matches('-')
                .parse()
                .unwrap();
            let slice = full[start..].to_vec();
            return (
                StatusCode::PARTIAL_CONTENT,
                [(reqwest::header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, full.len() - 1, full.len()))],
                AxumBytes::from(slice),
            )
                .into_response();
        }
        AxumBytes::from(full.clone()).into_response()
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetches_full_body_to_disk() {
        let body = Body(Arc::new(vec![1u8; 4096]));
        let router = Router::new().route("/f", get(serve_full)).with_state(body.clone());
        let base = spawn_server(router).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let token = CancellationToken::new();
        let mut events = Vec::new();
        let mut on_progress = |r, t| events.push((r, t));
        let client = reqwest::Client::new();
        let url = url::Url::parse(&format!("{base}/f")).unwrap();
        fetch(
            &client,
            &url,
            &dest,
            FetchOptions {
                token: &token,
                range_from: 0,
                on_progress: &mut on_progress,
            },
        )
        .await
        .unwrap();
        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written.len(), 4096);
        assert!(!events.is_empty());
    }

    #[tokio::test]
    async fn range_request_resumes_from_offset() {
        let body = Body(Arc::new((0u8..=255).cycle().take(1000).collect()));
        let router = Router::new().route("/r", get(serve_range)).with_state(body.clone());
        let base = spawn_server(router).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        tokio::fs::write(&dest, &body.0[..400]).await.unwrap();
        let token = CancellationToken::new();
        let mut on_progress = |_, _| {};
        let client = reqwest::Client::new();
        let url = url::Url::parse(&format!("{base}/r")).unwrap();
        let outcome = fetch(
            &client,
            &url,
            &dest,
            FetchOptions {
                token: &token,
                range_from: 400,
                on_progress: &mut on_progress,
            },
        )
        .await
        .unwrap();
        assert!(outcome.range_honored);
        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written, body.0.as_slice());
    }

    #[tokio::test]
    async fn non_honored_range_truncates_and_restarts() {
        let body = Body(Arc::new(vec![9u8; 500]));
        let router = Router::new().route("/f", get(serve_full)).with_state(body.clone());
        let base = spawn_server(router).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        tokio::fs::write(&dest, vec![1u8; 200]).await.unwrap();
        let token = CancellationToken::new();
        let mut on_progress = |_, _| {};
        let client = reqwest::Client::new();
        let url = url::Url::parse(&format!("{base}/f")).unwrap();
        let outcome = fetch(
            &client,
            &url,
            &dest,
            FetchOptions {
                token: &token,
                range_from: 200,
                on_progress: &mut on_progress,
            },
        )
        .await
        .unwrap();
        assert!(!outcome.range_honored);
        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written, body.0.as_slice());
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_file() {
        let body = Body(Arc::new(vec![1u8; 8192]));
        let router = Router::new().route("/f", get(serve_full)).with_state(body.clone());
        let base = spawn_server(router).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let token = CancellationToken::new();
        token.cancel();
        let mut on_progress = |_, _| {};
        let client = reqwest::Client::new();
        let url = url::Url::parse(&format!("{base}/f")).unwrap();
        let result = fetch(
            &client,
            &url,
            &dest,
            FetchOptions {
                token: &token,
                range_from: 0,
                on_progress: &mut on_progress,
            },
        )
        .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
