//! Minimal Docker Engine API client over the unix socket or TCP.

use std::collections::VecDeque;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Upgraded, header};
use serde_json::json;
use tracing::{debug, instrument};

use crate::docker::image::split_reference;
use crate::docker::models::{
    ContainerConfig, ContainerInspect, ErrorResponse, ExecConfig, ExecInspect, IdResponse, PullProgress, WaitResponse,
};
use crate::error::DockerError;
use crate::logging::LineSplitter;

/// Engine API version prefix.
pub const API_VERSION: &str = "v1.41";

const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'/').add(b'?').add(b'#').add(b'%');

fn segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// Thin wrapper around a `reqwest::Client` bound to one Docker engine.
#[derive(Debug, Clone)]
pub struct DockerClient {
    http: Client,
    base_url: String,
}

impl DockerClient {
    /// Connects to `docker_host` (`unix://`, `tcp://`, `http://` or `https://`).
    pub fn connect(docker_host: &str) -> Result<Self, DockerError> {
        let builder = Client::builder();
        let (builder, base_url) = if let Some(path) = docker_host.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                (builder.unix_socket(path), "http://docker".to_string())
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(DockerError::transport("unix sockets are not available on this platform"));
            }
        } else if let Some(address) = docker_host.strip_prefix("tcp://") {
            (builder, format!("http://{address}"))
        } else if docker_host.starts_with("http://") || docker_host.starts_with("https://") {
            (builder, docker_host.trim_end_matches('/').to_string())
        } else {
            return Err(DockerError::transport(format!("unsupported docker host '{docker_host}'")));
        };
        let http = builder.build()?;
        debug!(docker_host, "docker client configured");
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{API_VERSION}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder, resource: &str) -> Result<Response, DockerError> {
        let response = request.send().await?;
        ensure_success(response, resource).await
    }

    pub async fn ping(&self) -> Result<(), DockerError> {
        self.send(self.http.get(self.url("/_ping")), "engine").await?;
        Ok(())
    }

    /// Starts pulling `image`; progress is read from the returned stream.
    #[instrument(skip(self))]
    pub async fn pull_image(&self, image: &str) -> Result<PullStream, DockerError> {
        let (from_image, tag) = split_reference(image);
        let mut query = vec![("fromImage", from_image)];
        if let Some(tag) = tag {
            query.push(("tag", tag));
        }
        let request = self.http.post(self.url("/images/create")).query(&query);
        let response = self.send(request, image).await?;
        Ok(PullStream::new(response))
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool, DockerError> {
        let request = self.http.get(self.url(&format!("/volumes/{}", segment(name))));
        match self.send(request, name).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn create_volume(&self, name: &str) -> Result<(), DockerError> {
        let request = self.http.post(self.url("/volumes/create")).json(&json!({ "Name": name }));
        self.send(request, name).await?;
        Ok(())
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool, DockerError> {
        let request = self.http.get(self.url(&format!("/networks/{}", segment(name))));
        match self.send(request, name).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn create_network(&self, name: &str) -> Result<(), DockerError> {
        let body = json!({ "Name": name, "Driver": "bridge", "CheckDuplicate": true });
        let request = self.http.post(self.url("/networks/create")).json(&body);
        self.send(request, name).await?;
        Ok(())
    }

    /// Creates a container and returns its id.
    pub async fn create_container(&self, name: Option<&str>, config: &ContainerConfig) -> Result<String, DockerError> {
        let mut request = self.http.post(self.url("/containers/create")).json(config);
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }
        let response = self.send(request, &config.image).await?;
        Ok(response.json::<IdResponse>().await?.id)
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, DockerError> {
        let request = self.http.get(self.url(&format!("/containers/{}/json", segment(id))));
        let response = self.send(request, id).await?;
        Ok(response.json().await?)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let request = self.http.post(self.url(&format!("/containers/{}/start", segment(id))));
        self.send(request, id).await?;
        Ok(())
    }

    pub async fn restart_container(&self, id: &str) -> Result<(), DockerError> {
        let request = self.http.post(self.url(&format!("/containers/{}/restart", segment(id))));
        self.send(request, id).await?;
        Ok(())
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let request = self.http.post(self.url(&format!("/containers/{}/stop", segment(id))));
        self.send(request, id).await?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let request = self
            .http
            .delete(self.url(&format!("/containers/{}", segment(id))))
            .query(&[("force", force)]);
        self.send(request, id).await?;
        Ok(())
    }

    /// Blocks until the container stops and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let request = self.http.post(self.url(&format!("/containers/{}/wait", segment(id))));
        let response = self.send(request, id).await?;
        Ok(response.json::<WaitResponse>().await?.status_code)
    }

    pub async fn create_exec(&self, container: &str, config: &ExecConfig) -> Result<String, DockerError> {
        let request = self
            .http
            .post(self.url(&format!("/containers/{}/exec", segment(container))))
            .json(config);
        let response = self.send(request, container).await?;
        Ok(response.json::<IdResponse>().await?.id)
    }

    /// Starts an exec and hijacks the connection for its stdio.
    pub async fn start_exec_attached(&self, exec_id: &str, tty: bool) -> Result<Upgraded, DockerError> {
        let request = self
            .http
            .post(self.url(&format!("/exec/{}/start", segment(exec_id))))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .json(&json!({ "Detach": false, "Tty": tty }));
        let response = self.send(request, exec_id).await?;
        Ok(response.upgrade().await?)
    }

    pub async fn start_exec_detached(&self, exec_id: &str) -> Result<(), DockerError> {
        let request = self
            .http
            .post(self.url(&format!("/exec/{}/start", segment(exec_id))))
            .json(&json!({ "Detach": true, "Tty": false }));
        self.send(request, exec_id).await?;
        Ok(())
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, DockerError> {
        let request = self.http.get(self.url(&format!("/exec/{}/json", segment(exec_id))));
        let response = self.send(request, exec_id).await?;
        Ok(response.json().await?)
    }
}

async fn ensure_success(response: Response, resource: &str) -> Result<Response, DockerError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::SWITCHING_PROTOCOLS || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .map(|error| error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or(body);
    Err(match status {
        StatusCode::NOT_FOUND => DockerError::not_found(format!("{resource}: {message}")),
        StatusCode::CONFLICT => DockerError::Conflict { message },
        _ => DockerError::api(status.as_u16(), message),
    })
}

/// Progress lines of an image pull.
pub struct PullStream {
    response: Response,
    splitter: LineSplitter,
    pending: VecDeque<Vec<u8>>,
    done: bool,
}

impl PullStream {
    fn new(response: Response) -> Self {
        Self {
            response,
            splitter: LineSplitter::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Next progress record; an `error` record ends the pull with [`DockerError::Api`].
    pub async fn next(&mut self) -> Result<Option<PullProgress>, DockerError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let progress: PullProgress = serde_json::from_slice(&line)?;
                if let Some(error) = progress.error {
                    return Err(DockerError::api(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), error));
                }
                return Ok(Some(progress));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(bytes) => self.pending.extend(self.splitter.push(&bytes)),
                None => {
                    self.done = true;
                    self.pending.extend(self.splitter.finish());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_accepts_supported_hosts() {
        let client = DockerClient::connect("tcp://127.0.0.1:2375").unwrap();
        assert_eq!(client.url("/_ping"), "http://127.0.0.1:2375/v1.41/_ping");
        assert!(DockerClient::connect("npipe:////./pipe/docker_engine").is_err());
    }

    #[test]
    fn path_segments_are_encoded() {
        assert_eq!(segment("agent-a1"), "agent-a1");
        assert_eq!(segment("a b/c"), "a%20b%2Fc");
    }
}
