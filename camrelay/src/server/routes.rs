use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};

use super::range::ByteRange;
use super::request_log::RequestLog;

pub struct ServerState {
    pub root: PathBuf,
    pub manifest_name: String,
    pub log: RequestLog,
}

/// Catch-all handler: every request is a file lookup in the document root.
pub async fn serve(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let raw_path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    state.log.append(method.as_str(), raw_path, range.as_ref()).await;
    respond(&state, &method, raw_path, range).await
}

pub async fn respond(
    state: &ServerState,
    method: &Method,
    raw_path: &str,
    range: Option<ByteRange>,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        let mut response = reply(StatusCode::METHOD_NOT_ALLOWED, "text/plain", Body::from("Method not allowed"));
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let Some(path) = resolve_path(&state.root, raw_path, &state.manifest_name).await else {
        return not_found();
    };

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "failed to read file");
            }
            return not_found();
        }
    };

    let content_type = mime_type(&path);
    let head_only = method == Method::HEAD;
    let total = data.len() as u64;

    let Some(range) = range else {
        let length = data.len();
        let body = if head_only { Body::empty() } else { Body::from(data) };
        let mut response = reply(StatusCode::OK, content_type, body);
        set_content_length(&mut response, length as u64);
        return response;
    };

    let Some((start, end)) = range.resolve(total) else {
        let mut response = reply(StatusCode::RANGE_NOT_SATISFIABLE, "text/plain", Body::empty());
        set_header(&mut response, header::CONTENT_RANGE, format!("bytes */{total}"));
        return response;
    };

    let slice = data[start as usize..=end as usize].to_vec();
    let length = slice.len() as u64;
    let body = if head_only { Body::empty() } else { Body::from(slice) };
    let mut response = reply(StatusCode::PARTIAL_CONTENT, content_type, body);
    set_content_length(&mut response, length);
    set_header(
        &mut response,
        header::CONTENT_RANGE,
        format!("bytes {start}-{end}/{total}"),
    );
    response
}

/**
    Map a request path onto a file under `root`.

    Strips the leading slash and any query or fragment, defaults an empty
    path to the manifest, and refuses anything that is not a plain relative
    path or that resolves (through symlinks) outside the root.
*/
pub async fn resolve_path(root: &Path, raw: &str, default_name: &str) -> Option<PathBuf> {
    let relative = sanitize(raw, default_name)?;
    let candidate = root.join(relative);

    // Symlinks may still point elsewhere; compare canonical forms when the
    // file exists. A missing file is a plain 404 either way.
    match (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(&candidate).await,
    ) {
        (Ok(root), Ok(resolved)) if resolved.starts_with(&root) => Some(resolved),
        (Ok(_), Ok(_)) => None,
        _ => Some(candidate),
    }
}

pub fn sanitize(raw: &str, default_name: &str) -> Option<PathBuf> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let trimmed = trimmed.split(['?', '#']).next().unwrap_or_default();
    let name = if trimmed.is_empty() { default_name } else { trimmed };

    let path = Path::new(name);
    let plain = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    plain.then(|| path.to_path_buf())
}

pub fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/MP2T",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response {
    reply(StatusCode::NOT_FOUND, "text/plain", Body::from("Not found"))
}

/// Response with the headers every reply carries: ranges, no caching, no keep-alive.
fn reply(status: StatusCode, content_type: &'static str, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn set_content_length(response: &mut Response, length: u64) {
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
}

fn set_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::try_from(value) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(root: &Path) -> ServerState {
        ServerState {
            root: root.to_path_buf(),
            manifest_name: "master.m3u8".to_string(),
            log: RequestLog::new(root.join("requests.log")),
        }
    }

    fn fixture() -> (tempfile::TempDir, ServerState) {
        let tmp = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(tmp.path().join("segment-000.ts"), &data).unwrap();
        std::fs::write(tmp.path().join("master.m3u8"), "#EXTM3U\n").unwrap();
        let state = state(tmp.path());
        (tmp, state)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn test_full_get() {
        let (_tmp, state) = fixture();
        let response = respond(&state, &Method::GET, "/segment-000.ts", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/MP2T");
        assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
        assert_eq!(header_str(&response, header::CONNECTION), "close");
        assert_eq!(header_str(&response, header::PRAGMA), "no-cache");
        assert_eq!(body_bytes(response).await.len(), 1000);
    }

    #[tokio::test]
    async fn test_empty_path_serves_manifest() {
        let (_tmp, state) = fixture();
        let response = respond(&state, &Method::GET, "/?t=1#frag", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, header::CONTENT_TYPE),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(body_bytes(response).await, b"#EXTM3U\n");
    }

    #[tokio::test]
    async fn test_head_has_headers_but_no_body() {
        let (_tmp, state) = fixture();
        let response = respond(&state, &Method::HEAD, "/segment-000.ts", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "1000");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_range_prefix() {
        let (_tmp, state) = fixture();
        let range = ByteRange::parse("bytes=0-99");
        let response = respond(&state, &Method::GET, "/segment-000.ts", range).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-99/1000");
        let body = body_bytes(response).await;
        assert_eq!(body.len(), 100);
        assert_eq!(body[99], 99);
    }

    #[tokio::test]
    async fn test_range_end_is_clamped() {
        let (_tmp, state) = fixture();
        let range = ByteRange::parse("bytes=900-2000");
        let response = respond(&state, &Method::GET, "/segment-000.ts", range).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 900-999/1000");
        assert_eq!(body_bytes(response).await.len(), 100);
    }

    #[tokio::test]
    async fn test_range_past_end_is_unsatisfiable() {
        let (_tmp, state) = fixture();
        let range = ByteRange::parse("bytes=2000-");
        let response = respond(&state, &Method::GET, "/segment-000.ts", range).await;

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes */1000");
    }

    #[tokio::test]
    async fn test_traversal_is_not_found() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("hls");
        std::fs::create_dir(&root).unwrap();
        let state = state(&root);

        for path in ["../../etc/passwd", "/../secret.txt", "//etc/passwd", "/a/../../secret.txt"] {
            let response = respond(&state, &Method::GET, path, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            assert_eq!(body_bytes(response).await, b"Not found");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_not_found() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("hls");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.ts")).unwrap();

        let response = respond(&state(&root), &Method::GET, "/link.ts", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_file_and_bad_method() {
        let (_tmp, state) = fixture();
        let response = respond(&state, &Method::GET, "/segment-999.ts", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = respond(&state, &Method::POST, "/master.m3u8", None).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(header_str(&response, header::ALLOW), "GET, HEAD");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("/", "master.m3u8"), Some(PathBuf::from("master.m3u8")));
        assert_eq!(sanitize("/seg.ts?x=1", "m"), Some(PathBuf::from("seg.ts")));
        assert_eq!(sanitize("/seg.ts#a?b", "m"), Some(PathBuf::from("seg.ts")));
        assert_eq!(sanitize("/../x", "m"), None);
        assert_eq!(sanitize("//etc/passwd", "m"), None);
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type(Path::new("a.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(mime_type(Path::new("a.ts")), "video/MP2T");
        assert_eq!(mime_type(Path::new("requests.log")), "application/octet-stream");
    }
}
