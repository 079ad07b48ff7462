//! REST side of the controller protocol.
//!
//! Every request carries the agent token in the `AGENT-TOKEN` header and is
//! resolved against the controller base URL. Path parameters are appended as
//! encoded segments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flowci_engine::ControllerError;
use flowci_engine::controller::DownloadProgress;
use flowci_types::{AgentInit, JobCache, Resource, Settings};
use flowci_util::{cache_destination, encode_cache_name, redact_sensitive, to_slash};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Header carrying the agent token (`AGENT-TOKEN`; header names are matched case-insensitively).
pub const TOKEN_HEADER: &str = "agent-token";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the controller's agent API.
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    base_url: Url,
    http: Client,
    user_agent: String,
}

impl HttpControllerClient {
    pub fn new(server_url: &str, token: &str) -> Result<Self, ControllerError> {
        let base_url = Url::parse(server_url).map_err(|error| ControllerError::protocol(format!("invalid server url '{server_url}': {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ControllerError::protocol(format!("server url '{server_url}' cannot be a base")));
        }
        if base_url.scheme() != "http" {
            return Err(ControllerError::protocol(format!(
                "unsupported server url scheme '{}', only plain http is supported",
                base_url.scheme()
            )));
        }

        let mut default_headers = header::HeaderMap::new();
        let token = header::HeaderValue::from_str(token).map_err(|error| ControllerError::protocol(format!("invalid agent token: {error}")))?;
        default_headers.insert(TOKEN_HEADER, token);

        let http = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| ControllerError::http(error.to_string()))?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("flowci-agent/{}; {}", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of `/agent/api/<segments..>` under the base URL.
    pub fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["agent", "api"]).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.api_url(segments);
        debug!(%method, %url, "building request");
        self.http.request(method, url).header(header::USER_AGENT, &self.user_agent)
    }

    pub async fn connect(&self, init: &AgentInit) -> Result<Settings, ControllerError> {
        let response = send(self.request(Method::POST, &["connect"]).json(init)).await?;
        response.json().await.map_err(decode_error)
    }

    pub async fn report_profile(&self, resource: &Resource) -> Result<(), ControllerError> {
        send(self.request(Method::POST, &["profile"]).json(resource)).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(step_id = %step_id))]
    pub async fn upload_log(&self, step_id: &str, path: &Path) -> Result<(), ControllerError> {
        let content = tokio::fs::read(path).await?;
        let size = content.len();
        let part = Part::bytes(content)
            .file_name(format!("{step_id}.log"))
            .mime_str("application/octet-stream")
            .map_err(|error| ControllerError::http(error.to_string()))?;
        let form = Form::new().part("file", part);
        send(self.request(Method::POST, &["logs", "upload"]).multipart(form)).await?;
        debug!(size, "step log uploaded");
        Ok(())
    }

    /// `None` when the controller has no cache for `key`.
    pub async fn cache_get(&self, job_id: &str, key: &str) -> Result<Option<JobCache>, ControllerError> {
        let response = self
            .request(Method::GET, &["cache", job_id, key])
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND || response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = ensure_success(response).await?.bytes().await.map_err(transport_error)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let cache: JobCache = serde_json::from_slice(&body).map_err(|error| ControllerError::protocol(error.to_string()))?;
        Ok(Some(cache))
    }

    /// Uploads `files` as cache `key`; each part is named after its path relative to `workspace`.
    #[instrument(skip_all, fields(job_id = %job_id, key = %key))]
    pub async fn cache_put(&self, job_id: &str, key: &str, workspace: &Path, files: &[PathBuf]) -> Result<(), ControllerError> {
        let workspace = to_slash(workspace);
        let mut form = Form::new().text("workspace", workspace.clone());
        for file in files {
            let name = encode_cache_name(&workspace, &to_slash(file));
            let part = Part::bytes(tokio::fs::read(file).await?).file_name(name);
            form = form.part("files", part);
        }
        send(self.request(Method::POST, &["cache", job_id, key]).multipart(form)).await?;
        debug!(files = files.len(), "cache uploaded");
        Ok(())
    }

    /// Streams one cached file to its decoded location under `dest_dir`.
    pub async fn cache_download(
        &self,
        cache_id: &str,
        dest_dir: &Path,
        encoded_name: &str,
        progress: DownloadProgress<'_>,
    ) -> Result<PathBuf, ControllerError> {
        let dest = cache_destination(dest_dir, encoded_name).map_err(|error| ControllerError::protocol(error.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut response = send(self.request(Method::GET, &["cache", cache_id, "download", encoded_name])).await?;
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written);
        }
        file.flush().await?;
        debug!(dest = %dest.display(), written, "cache file downloaded");
        Ok(dest)
    }
}

async fn send(builder: RequestBuilder) -> Result<Response, ControllerError> {
    let response = builder.send().await.map_err(transport_error)?;
    ensure_success(response).await
}

async fn ensure_success(response: Response) -> Result<Response, ControllerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ControllerError::status(status.as_u16(), redact_sensitive(message.trim())))
}

fn transport_error(error: reqwest::Error) -> ControllerError {
    ControllerError::http(error.to_string())
}

fn decode_error(error: reqwest::Error) -> ControllerError {
    ControllerError::protocol(format!("invalid response body: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one canned response and returns the raw request head it received.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let head_end = request.windows(4).position(|window| window == b"\r\n\r\n").map_or(request.len(), |at| at + 4);
            let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < head_end + content_length {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{address}"), task)
    }

    #[test]
    fn api_urls_encode_segments() {
        let client = HttpControllerClient::new("http://ci.example.com:8080/", "t").unwrap();
        assert_eq!(client.api_url(&["connect"]).as_str(), "http://ci.example.com:8080/agent/api/connect");
        assert_eq!(
            client.api_url(&["cache", "job 1", "a/b"]).as_str(),
            "http://ci.example.com:8080/agent/api/cache/job%201/a%2Fb"
        );

        let nested = HttpControllerClient::new("http://ci.example.com/flow", "t").unwrap();
        assert_eq!(nested.api_url(&["profile"]).as_str(), "http://ci.example.com/flow/agent/api/profile");
    }

    #[test]
    fn rejects_unusable_server_urls() {
        assert!(HttpControllerClient::new("not a url", "t").is_err());
        assert!(HttpControllerClient::new("mailto:ci@example.com", "t").is_err());
        assert!(HttpControllerClient::new("http://ci.example.com", "bad\ntoken").is_err());
        let tls = HttpControllerClient::new("https://ci.example.com", "t").unwrap_err();
        assert!(tls.to_string().contains("only plain http"), "{tls}");
    }

    #[tokio::test]
    async fn missing_cache_is_none() {
        let (server, request) = serve_once("404 Not Found", "").await;
        let client = HttpControllerClient::new(&server, "secret").unwrap();
        assert_eq!(client.cache_get("job", "deps").await.unwrap(), None);

        let head = request.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /agent/api/cache/job/deps "), "{head}");
        assert!(head.contains("agent-token: secret"), "{head}");
    }

    #[tokio::test]
    async fn connect_parses_settings() {
        let (server, _request) = serve_once("200 OK", r#"{"agent":{"id":"a1","name":"local","token":"secret"}}"#).await;
        let client = HttpControllerClient::new(&server, "secret").unwrap();
        let settings = client.connect(&AgentInit::default()).await.unwrap();
        assert_eq!(settings.agent.id, "a1");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (server, _request) = serve_once("500 Internal Server Error", "boom").await;
        let client = HttpControllerClient::new(&server, "secret").unwrap();
        let error = client.report_profile(&Resource::default()).await.unwrap_err();
        assert!(matches!(error, ControllerError::Status { status: 500, ref message } if message == "boom"), "{error}");
    }

    #[tokio::test]
    async fn download_rejects_escaping_names() {
        let client = HttpControllerClient::new("http://127.0.0.1:9", "secret").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let name = flowci_util::encode_cache_name("", "../outside");
        let error = client.cache_download("c1", dir.path(), &name, &|_| {}).await.unwrap_err();
        assert!(matches!(error, ControllerError::Protocol { .. }), "{error}");
    }
}
