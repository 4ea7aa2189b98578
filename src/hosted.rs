//! The hosted data-browsing application.
//!
//! As far as the rest of the crate is concerned this is an opaque HTTP
//! handler. In production it's a `datasette serve` child process listening
//! on loopback, and we proxy each invocation's request to it. The process
//! gets started once, during `Services::init`, after the database files are
//! in place.

use anyhow::{bail, Context};
use async_trait::async_trait;
use lambda_http::{
    http::{
        header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
        HeaderMap,
    },
    Body, Error, Request, Response,
};
use lambda_runtime::tracing;
use serde_json::{Map, Value};
use std::{
    ffi::OsString,
    net::TcpListener,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::{Child, Command};

use crate::{
    routing::PathPrefix,
    settings::{SettingValue, Settings},
};

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const READY_PATH: &str = "/-/versions.json";
const METADATA_FILE: &str = "datasette-metadata.json";

#[async_trait]
pub trait HostedApp: Send + Sync {
    async fn handle(&self, req: Request) -> Result<Response<Body>, Error>;
}

/// Everything that the hosted app gets told at construction time. We don't
/// interpret any of it.
#[derive(Clone, Debug, Default)]
pub struct HostedAppConfig {
    pub files: Vec<PathBuf>,
    pub metadata: Map<String, Value>,
    pub settings: Settings,
    pub cors: bool,
    pub prefix: PathPrefix,
}

impl HostedAppConfig {
    /// The `datasette` command-line arguments for this configuration.
    pub fn datasette_args(&self, port: u16, metadata_path: Option<&Path>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["serve".into()];
        args.extend(self.files.iter().map(|f| f.as_os_str().to_owned()));
        args.push("--host".into());
        args.push("127.0.0.1".into());
        args.push("--port".into());
        args.push(port.to_string().into());

        if let Some(p) = metadata_path {
            args.push("--metadata".into());
            args.push(p.as_os_str().to_owned());
        }

        if self.cors {
            args.push("--cors".into());
        }

        let mut settings = self.settings.clone();

        if !self.prefix.is_empty() {
            settings
                .entry("base_url".to_owned())
                .or_insert_with(|| SettingValue::Str(self.prefix.base_url()));
        }

        for (name, value) in &settings {
            args.push("--setting".into());
            args.push(name.into());
            args.push(value.to_string().into());
        }

        args
    }
}

/// Forwards requests to an HTTP server on the loopback interface.
#[derive(Clone, Debug)]
pub struct LoopbackProxy {
    client: reqwest::Client,
    base: String,
}

impl LoopbackProxy {
    pub fn new(port: u16) -> Result<Self, Error> {
        // Redirects are the hosted app's business and go back to the caller
        // untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(LoopbackProxy {
            client,
            base: format!("http://127.0.0.1:{port}"),
        })
    }

    /// A server that accepts the connection but never answers counts as not
    /// ready, so the start-up deadline still applies.
    async fn is_ready(&self) -> bool {
        match self
            .client
            .get(format!("{}{READY_PATH}", self.base))
            .timeout(READY_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl HostedApp for LoopbackProxy {
    async fn handle(&self, req: Request) -> Result<Response<Body>, Error> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base, path_and_query);

        let mut headers = parts.headers;
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONNECTION);

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONTENT_LENGTH);
        let bytes = upstream.bytes().await?;

        let body = if bytes.is_empty() {
            Body::Empty
        } else if is_textual(&headers) {
            match String::from_utf8(bytes.to_vec()) {
                Ok(s) => Body::Text(s),
                Err(e) => Body::Binary(e.into_bytes()),
            }
        } else {
            Body::Binary(bytes.to_vec())
        };

        let mut resp = Response::new(body);
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

/// Can this response body go back through API Gateway as plain text, or
/// does it need Base64?
fn is_textual(headers: &HeaderMap) -> bool {
    if headers.contains_key(CONTENT_ENCODING) {
        return false;
    }

    let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let mime = ct
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime.starts_with("text/")
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || matches!(
            mime.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

/// A `datasette serve` child process and the proxy that talks to it.
pub struct DatasetteProcess {
    proxy: LoopbackProxy,
    // Held so that the child is killed when we go away.
    _child: Child,
}

impl DatasetteProcess {
    /// Start Datasette and wait until it's answering requests.
    pub async fn launch(
        bin: &Path,
        config: &HostedAppConfig,
        scratch_root: &Path,
    ) -> anyhow::Result<Self> {
        let metadata_path = if config.metadata.is_empty() {
            None
        } else {
            let path = scratch_root.join(METADATA_FILE);
            let text = serde_json::to_vec_pretty(&config.metadata)?;
            tokio::fs::write(&path, text)
                .await
                .with_context(|| format!("failed to write `{}`", path.display()))?;
            Some(path)
        };

        let port = free_loopback_port()?;
        let args = config.datasette_args(port, metadata_path.as_deref());
        tracing::info!("launching {} {:?}", bin.display(), args);

        let mut child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch `{}`", bin.display()))?;

        let proxy = LoopbackProxy::new(port).map_err(|e| anyhow::anyhow!(e))?;
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

        loop {
            if let Some(status) = child.try_wait()? {
                bail!("datasette exited during start-up: {status}");
            }

            if proxy.is_ready().await {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "datasette did not become ready within {} seconds",
                    READY_TIMEOUT.as_secs()
                );
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        tracing::info!("datasette ready on port {port}");

        Ok(DatasetteProcess {
            proxy,
            _child: child,
        })
    }
}

#[async_trait]
impl HostedApp for DatasetteProcess {
    async fn handle(&self, req: Request) -> Result<Response<Body>, Error> {
        self.proxy.handle(req).await
    }
}

/// Ask the OS for an unused port. Someone else could grab it before the
/// child binds it, but nothing else on a Lambda instance is listening.
fn free_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
