//! Hosting Datasette on AWS Lambda
//!
//! This library crate is the glue between three things: the S3 bucket holding
//! our SQLite databases, a Datasette process that serves them, and the API
//! Gateway "proxy event" protocol that `lambda_http` speaks. It's compiled into
//! two executables: `datasette-lambda-proxyevent`, which is the deployed
//! `bootstrap`, and `datasette-lambda-oneshot`, which runs a single request
//! locally.
//!
//! All of the expensive work happens once, in [`Services::init`]: get the
//! database files onto local disk, then start Datasette pointing at them. After
//! that each invocation is just a prefix check and a proxied request.

use lambda_http::{
    http::{uri::PathAndQuery, Uri},
    Body, Error, Request, Response,
};
use lambda_runtime::tracing;
use std::future::Future;

pub mod config;
pub mod error;
pub mod hosted;
pub mod objstore;
pub mod provision;
pub mod routing;
pub mod settings;

use config::DeploymentConfig;
use hosted::{DatasetteProcess, HostedApp, HostedAppConfig};
use objstore::{ObjectStore, S3Store};
use provision::{LocalAsset, Provisioner};
use routing::PathPrefix;

pub struct Services {
    app: Box<dyn HostedApp>,
    prefix: PathPrefix,
    prepend_stage: bool,
}

impl Services {
    /// Create the state object for the Lambda, starting the hosted app.
    ///
    /// Any error here means we can't serve: the function fails to initialize
    /// and Lambda reports it on every invocation.
    pub async fn init() -> Result<Self, Error> {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false) // don't print the module name
            .without_time() // don't print time (CloudWatch has it)
            .init();

        let cfg = DeploymentConfig::from_env()?;
        let aws = aws_config::load_from_env().await;
        let store = S3Store::new(&aws);

        let bin = cfg.datasette_bin.clone();
        let scratch = cfg.scratch_root.clone();

        Self::assemble(cfg, &store, |app_cfg| async move {
            let app = DatasetteProcess::launch(&bin, &app_cfg, &scratch).await?;
            Ok::<_, Error>(Box::new(app) as Box<dyn HostedApp>)
        })
        .await
    }

    /// Do the start-up sequence with the given collaborators.
    ///
    /// The settings and metadata files are checked before anything is
    /// fetched, and the hosted app is only constructed once every database
    /// file is in place.
    pub async fn assemble<S, L, F>(
        cfg: DeploymentConfig,
        store: &S,
        launch: L,
    ) -> Result<Self, Error>
    where
        S: ObjectStore + ?Sized,
        L: FnOnce(HostedAppConfig) -> F,
        F: Future<Output = Result<Box<dyn HostedApp>, Error>>,
    {
        tracing::info!(
            "databases: {:?}; bucket: {:?}; prefix: {:?}",
            cfg.db_files,
            cfg.bucket,
            cfg.prefix.as_str()
        );

        let settings = settings::load_settings(&cfg.settings_path())?;
        let metadata = config::load_metadata(&cfg.metadata_path())?;

        let files = Provisioner::new(
            store,
            cfg.bucket.as_deref(),
            &cfg.task_root,
            &cfg.scratch_root,
        )
        .resolve(&cfg.db_files)
        .await?;

        let app = launch(HostedAppConfig {
            files: files.into_iter().map(LocalAsset::into_path).collect(),
            metadata,
            settings,
            cors: cfg.cors,
            prefix: cfg.prefix.clone(),
        })
        .await?;

        Ok(Services::new(app, cfg.prefix, cfg.prepend_stage))
    }

    pub fn new(app: Box<dyn HostedApp>, prefix: PathPrefix, prepend_stage: bool) -> Self {
        Services {
            app,
            prefix,
            prepend_stage,
        }
    }

    /// Handle one inbound request.
    pub async fn dispatch(&self, req: Request) -> Result<Response<Body>, Error> {
        let path = routing::inbound_path(&req);

        if !routing::admit(path, &self.prefix) {
            tracing::debug!("rejecting {path:?}: not under prefix");
            return Ok(routing::not_found());
        }

        let path = routing::forward_path(&req, self.prepend_stage);
        let req = with_path(req, &path)?;
        self.app.handle(req).await
    }
}

/// Replace the path part of the request URI, keeping the query string.
fn with_path(mut req: Request, path: &str) -> Result<Request, Error> {
    if req.uri().path() == path {
        return Ok(req);
    }

    let pq = match req.uri().query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_owned(),
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(pq.parse::<PathAndQuery>()?);
    *req.uri_mut() = Uri::from_parts(parts)?;
    Ok(req)
}
