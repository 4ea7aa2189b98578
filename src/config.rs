//! Deployment configuration.
//!
//! Everything comes from the Lambda environment, which is set by the
//! CloudFormation template that deploys us, plus two optional files shipped
//! in the deployment package next to the bootstrap executable.

use serde_json::{Map, Value};
use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{error::ConfigError, routing::PathPrefix, settings::parse_bool};

const DEFAULT_TASK_ROOT: &str = "/var/task";
const DEFAULT_SCRATCH_ROOT: &str = "/tmp";
const DEFAULT_DATASETTE_BIN: &str = "datasette";
const METADATA_FILE: &str = "metadata.json";
const SETTINGS_FILE: &str = "config.txt";

/// The ordered list of database files that this deployment hosts.
///
/// Each identifier is both the file name inside the deployment package and
/// the object key in the bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbFileSpec(Vec<String>);

impl DbFileSpec {
    /// Parse the `@`-delimited list from the `DbFiles` variable.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDbFiles {
            value: value.to_owned(),
            reason,
        };

        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        for id in value.split('@') {
            if id.is_empty() {
                return Err(invalid("empty identifier".to_owned()));
            }

            // The identifier is joined onto local directories, so it has to
            // be a plain file name.
            if id.contains('/') || id == "." || id == ".." {
                return Err(invalid(format!("`{id}` is not a plain file name")));
            }

            if !seen.insert(id) {
                return Err(invalid(format!("`{id}` is listed more than once")));
            }

            ids.push(id.to_owned());
        }

        Ok(DbFileSpec(ids))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

#[derive(Clone, Debug)]
pub struct DeploymentConfig {
    /// Where the database objects live, if they aren't bundled.
    pub bucket: Option<String>,
    pub db_files: DbFileSpec,
    /// Passed straight through to the hosted app.
    pub cors: bool,
    pub prefix: PathPrefix,
    /// Put the API Gateway stage name back on the front of forwarded paths.
    pub prepend_stage: bool,
    pub datasette_bin: PathBuf,
    /// The deployment package install location.
    pub task_root: PathBuf,
    /// Writable, instance-local storage.
    pub scratch_root: PathBuf,
}

impl DeploymentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let nonempty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let flag = |name: &'static str| -> Result<bool, ConfigError> {
            match nonempty(name) {
                None => Ok(false),
                Some(v) => parse_bool(&v).ok_or(ConfigError::InvalidEnvBool { name, value: v }),
            }
        };

        let db_files = nonempty("DbFiles").ok_or(ConfigError::MissingEnv("DbFiles"))?;

        Ok(DeploymentConfig {
            bucket: nonempty("Bucket"),
            db_files: DbFileSpec::parse(&db_files)?,
            cors: flag("CORS")?,
            prefix: PathPrefix::new(nonempty("Prefix").unwrap_or_default()),
            prepend_stage: flag("PrependStage")?,
            datasette_bin: nonempty("DatasetteBin")
                .unwrap_or_else(|| DEFAULT_DATASETTE_BIN.to_owned())
                .into(),
            task_root: nonempty("LAMBDA_TASK_ROOT")
                .unwrap_or_else(|| DEFAULT_TASK_ROOT.to_owned())
                .into(),
            scratch_root: DEFAULT_SCRATCH_ROOT.into(),
        })
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.task_root.join(METADATA_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.task_root.join(SETTINGS_FILE)
    }
}

/// Load the `metadata.json` file, if present.
///
/// We don't interpret the contents beyond requiring a JSON object; the hosted
/// app owns the schema.
pub fn load_metadata(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_owned(),
                source: e,
            })
        }
    };

    let invalid = |reason: String| ConfigError::InvalidMetadata {
        path: path.to_owned(),
        reason,
    };

    let value: Value = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid("top level is not a JSON object".to_owned())),
    }
}
