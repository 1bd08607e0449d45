// src/config.rs
// Builder configuration: decoding, defaults and validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

use crate::communicator::{Communicator, CommunicatorConfig};
use crate::de::{weak, weak_bool};
use crate::env::{self, EnvSource, ProcessEnv};
use crate::errors::{ConfigErrors, ValidationError};
use crate::interpolate::{self, RenderFilter};
use crate::secrets::SecretFilter;
use crate::template::{merge_raws, RawSection};

pub const BUILDER_TYPE: &str = "ionoscloud";
pub const DEFAULT_API_URL: &str = "https://api.ionos.com";
pub const DEFAULT_LOCATION: &str = "us/las";
pub const DEFAULT_CORES: u32 = 4;
pub const DEFAULT_RAM_MB: u32 = 2048;
pub const DEFAULT_DISK_SIZE_GB: f32 = 50.0;
pub const DEFAULT_DISK_TYPE: &str = "HDD";
pub const DEFAULT_SNAPSHOT_NAME: &str = "packer-{{timestamp}}";
pub const CUBE_SERVER_TYPE: &str = "CUBE";
pub const CUBE_DISK_TYPE: &str = "DAS";

/// Keys left unrendered during interpolation.
pub const RENDER_EXCLUDE: &[&str] = &["run_command", "packer_*"];

/// Settings shared by every builder, normally supplied by the build driver.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct BuildCommon {
    #[serde(default)]
    pub packer_build_name: String,
    #[serde(default)]
    pub packer_builder_type: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub packer_debug: bool,
    #[serde(default, deserialize_with = "weak_bool")]
    pub packer_force: bool,
    #[serde(default)]
    pub packer_on_error: String,
    #[serde(default)]
    pub packer_user_variables: HashMap<String, String>,
    /// Names of user variables whose values are secret.
    #[serde(default)]
    pub packer_sensitive_variables: Vec<String>,
}

impl BuildCommon {
    fn interpolation_context(&self, now: DateTime<Utc>) -> interpolate::Context {
        let mut ctx = interpolate::Context::new(now);
        ctx.user_variables = self.packer_user_variables.clone();
        ctx.build_name = Some(self.packer_build_name.clone()).filter(|s| !s.is_empty());
        ctx.build_type = Some(self.packer_builder_type.clone()).filter(|s| !s.is_empty());
        ctx
    }

    fn sensitive_values(&self) -> impl Iterator<Item = &str> {
        self.packer_sensitive_variables
            .iter()
            .filter_map(|name| self.packer_user_variables.get(name))
            .map(String::as_str)
    }
}

/// The builder configuration as written, after interpolation. Empty strings and
/// zero numbers mean "not set".
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(flatten)]
    pub common: BuildCommon,
    #[serde(flatten)]
    pub comm: CommunicatorConfig,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default, deserialize_with = "weak")]
    pub disk_size: f32, // GB
    #[serde(default)]
    pub disk_type: String,
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub cube_template: String,
    #[serde(default, deserialize_with = "weak")]
    pub cores: u32,
    #[serde(default, deserialize_with = "weak")]
    pub ram: u32, // MB
    #[serde(default, deserialize_with = "weak")]
    pub retries: u32,

    // Whatever the fields above did not claim.
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Clone, PartialEq, Serialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Basic,
}

impl Credentials {
    /// A token wins over username/password when both are present.
    pub fn auth_method(&self) -> AuthMethod {
        if self.token.is_some() {
            AuthMethod::Token
        } else {
            AuthMethod::Basic
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hide = |v: &Option<String>| v.as_ref().map(|_| crate::secrets::REDACTED);
        f.debug_struct("Credentials")
            .field("username", &hide(&self.username))
            .field("password", &hide(&self.password))
            .field("token", &hide(&self.token))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSpec {
    pub size_gb: f32,
    pub disk_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerSpec {
    /// Cores and RAM chosen freely. `server_type` is passed through as written.
    Custom {
        server_type: Option<String>,
        cores: u32,
        ram_mb: u32,
    },
    /// Fixed-size CUBE server; sizing comes from the template.
    Cube { template: String },
}

/// Everything the provisioning steps need, fully resolved and validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedConfig {
    pub build: BuildCommon,
    pub credentials: Credentials,
    pub api_url: String,
    pub location: String,
    pub image: String,
    pub snapshot_name: String,
    pub disk: DiskSpec,
    pub server: ServerSpec,
    pub retries: u32,
    pub communicator: Communicator,
}

/// Collaborators for a prepare pass.
pub struct PrepareOptions<'a> {
    pub env: &'a dyn EnvSource,
    pub now: DateTime<Utc>,
    pub secrets: &'a SecretFilter,
}

impl PrepareOptions<'static> {
    /// Process environment, current time and the global secret filter.
    pub fn system() -> Self {
        PrepareOptions {
            env: &ProcessEnv,
            now: Utc::now(),
            secrets: SecretFilter::global().as_ref(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Config {
    /// Merges the raw sections, renders templates and decodes the result.
    pub fn decode(raws: &[RawSection], now: DateTime<Utc>) -> Result<(Config, interpolate::Context), ConfigErrors> {
        let mut merged = merge_raws(raws);

        let common = BuildCommon::deserialize(&Value::Object(merged.clone()))
            .map_err(|e| ValidationError::Decode(e.to_string()))?;
        let ctx = common.interpolation_context(now);

        let filter = RenderFilter {
            exclude: RENDER_EXCLUDE.iter().map(|s| s.to_string()).collect(),
        };
        ConfigErrors::check(interpolate::render_raw(&mut merged, &ctx, &filter))?;

        let config: Config = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ValidationError::Decode(e.to_string()))?;
        ConfigErrors::check(
            config
                .unknown
                .keys()
                .map(|key| ValidationError::UnknownKey(key.clone()))
                .collect(),
        )?;

        debug!(sections = raws.len(), "Decoded builder configuration");
        Ok((config, ctx))
    }

    /// Decodes, defaults and validates using the process environment.
    pub fn prepare(raws: &[RawSection]) -> Result<PreparedConfig, ConfigErrors> {
        Config::prepare_with(raws, &PrepareOptions::system())
    }

    pub fn prepare_with(raws: &[RawSection], opts: &PrepareOptions<'_>) -> Result<PreparedConfig, ConfigErrors> {
        let (config, ctx) = Config::decode(raws, opts.now)?;
        config.finalize(&ctx, opts)
    }

    /// Applies defaults and runs every check, returning all problems at once.
    pub fn finalize(mut self, ctx: &interpolate::Context, opts: &PrepareOptions<'_>) -> Result<PreparedConfig, ConfigErrors> {
        let (communicator, mut errors) = self.comm.resolve();

        // Checked for every communicator type, not only ssh.
        if self.comm.ssh_password.is_empty() && self.comm.ssh_private_key_file.is_empty() {
            errors.push(ValidationError::MissingSshCredentials);
        }

        self.apply_defaults(ctx, opts.env, &mut errors);

        if self.image.is_empty() {
            errors.push(ValidationError::MissingImage);
        }

        let server = self.resolve_server(&mut errors);
        self.check_auth(&mut errors);

        ConfigErrors::check(errors)?;

        opts.secrets.set([
            self.username.as_str(),
            self.password.as_str(),
            self.token.as_str(),
        ]);
        opts.secrets.set(self.comm.secrets());
        opts.secrets.set(self.common.sensitive_values());

        info!(
            image = %self.image,
            location = %self.location,
            snapshot = %self.snapshot_name,
            "Configuration prepared"
        );

        Ok(PreparedConfig {
            credentials: Credentials {
                username: non_empty(&self.username),
                password: non_empty(&self.password),
                token: non_empty(&self.token),
            },
            api_url: self.url,
            location: self.location,
            image: self.image,
            snapshot_name: self.snapshot_name,
            disk: DiskSpec {
                size_gb: self.disk_size,
                disk_type: self.disk_type,
            },
            server,
            retries: self.retries,
            communicator,
            build: self.common,
        })
    }

    fn apply_defaults(&mut self, ctx: &interpolate::Context, vars: &dyn EnvSource, errors: &mut Vec<ValidationError>) {
        if self.snapshot_name.is_empty() {
            match interpolate::render(DEFAULT_SNAPSHOT_NAME, ctx) {
                Ok(name) => {
                    debug!("snapshot_name not set, defaulting to {}", name);
                    self.snapshot_name = name;
                }
                Err(e) => errors.push(ValidationError::Interpolation {
                    key: "snapshot_name".to_string(),
                    message: e.to_string(),
                }),
            }
        }

        for (field, key) in [
            (&mut self.username, env::ENV_USERNAME),
            (&mut self.password, env::ENV_PASSWORD),
            (&mut self.token, env::ENV_TOKEN),
        ] {
            if env::fallback(field, vars, key) {
                debug!("Using {} from the environment", key);
            }
        }

        if self.url.is_empty() {
            self.url = DEFAULT_API_URL.to_string();
        }
        if self.cores == 0 {
            self.cores = DEFAULT_CORES;
        }
        if self.ram == 0 {
            self.ram = DEFAULT_RAM_MB;
        }
        if self.disk_size == 0.0 {
            self.disk_size = DEFAULT_DISK_SIZE_GB;
        }
        if self.location.is_empty() {
            self.location = DEFAULT_LOCATION.to_string();
        }
        if self.disk_type.is_empty() {
            self.disk_type = DEFAULT_DISK_TYPE.to_string();
        }
    }

    fn resolve_server(&mut self, errors: &mut Vec<ValidationError>) -> ServerSpec {
        if self.server_type != CUBE_SERVER_TYPE {
            if !self.cube_template.is_empty() {
                warn!("cube_template is ignored unless server_type is {}", CUBE_SERVER_TYPE);
            }
            return ServerSpec::Custom {
                server_type: non_empty(&self.server_type),
                cores: self.cores,
                ram_mb: self.ram,
            };
        }

        if self.cube_template.is_empty() {
            errors.push(ValidationError::MissingCubeTemplate);
        }
        // CUBE sizing and storage are fixed by the template.
        debug!("server_type CUBE: using {} storage, template sizing", CUBE_DISK_TYPE);
        self.disk_type = CUBE_DISK_TYPE.to_string();
        self.cores = 0;
        self.ram = 0;
        ServerSpec::Cube {
            template: self.cube_template.clone(),
        }
    }

    fn check_auth(&self, errors: &mut Vec<ValidationError>) {
        let token = !self.token.is_empty();
        let username = !self.username.is_empty();
        let password = !self.password.is_empty();

        if !token && !username && !password {
            errors.push(ValidationError::MissingAuthentication);
        } else if !token && !(username && password) {
            errors.push(ValidationError::IncompleteBasicAuth);
        }
    }
}
