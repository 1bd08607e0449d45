// src/errors.rs
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single problem found while preparing the builder configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown configuration key: '{0}'")]
    UnknownKey(String),
    #[error("failed to decode configuration: {0}")]
    Decode(String),
    #[error("error interpolating '{key}': {message}")]
    Interpolation { key: String, message: String },

    // Communicator
    #[error("Communicator type {0} is invalid")]
    InvalidCommunicatorType(String),
    #[error("{field}: invalid duration '{value}': {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("An ssh_username must be specified\n  Note: some builders used to default ssh_username to \"root\".")]
    MissingSshUsername,
    #[error("{field} is invalid: {reason}")]
    InvalidPrivateKeyFile { field: &'static str, reason: String },
    #[error("ssh_bastion_password or ssh_bastion_private_key_file must be specified")]
    MissingBastionCredentials,
    #[error("ssh_file_transfer_method ('{0}') is invalid, valid methods: sftp, scp")]
    InvalidFileTransferMethod(String),
    #[error("winrm_username must be specified.")]
    MissingWinrmUsername,
    #[error("either ssh private key path or ssh password must be set")]
    MissingSshCredentials,

    // IONOS
    #[error("IONOS 'image' is required")]
    MissingImage,
    #[error("IONOS 'cube_template' is required for server_type CUBE")]
    MissingCubeTemplate,
    #[error("IONOS authentication is required, either via token or username/password")]
    MissingAuthentication,
    #[error("IONOS username and password is required when token is not provided")]
    IncompleteBasicAuth,
}

/// Every problem found in one prepare pass. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigErrors {
    errors: Vec<ValidationError>,
}

impl std::error::Error for ConfigErrors {}

impl ConfigErrors {
    /// Returns `Ok(())` when nothing was collected.
    pub fn check(errors: Vec<ValidationError>) -> Result<(), ConfigErrors> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors { errors })
        }
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn contains(&self, error: &ValidationError) -> bool {
        self.errors.contains(error)
    }
}

impl From<ValidationError> for ConfigErrors {
    fn from(error: ValidationError) -> Self {
        ConfigErrors {
            errors: vec![error],
        }
    }
}

impl IntoIterator for ConfigErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} error(s) occurred:", self.errors.len())?;
        for error in &self.errors {
            // Continuation lines stay aligned under the bullet.
            let message = error.to_string().replace('\n', "\n  ");
            write!(f, "\n* {}", message)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML deserialization error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("JSON deserialization error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("YAML deserialization error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Unsupported template format for {0}: expected .toml, .json, .yaml or .yml")]
    UnsupportedFormat(PathBuf),
    #[error("Template {0} must contain a table of configuration keys at its top level")]
    NotAnObject(PathBuf),
    #[error("No template given and no {0} found in the XDG config directory")]
    NoTemplate(&'static str),
    #[error("Invalid user variable '{0}': expected KEY=VALUE")]
    InvalidVariable(String),
    #[error("Variable '{key}' in {path} must be a string, number or boolean")]
    NonScalarVariable { path: PathBuf, key: String },
    #[error("XDG directory error: {0}")]
    Xdg(#[from] xdg::BaseDirectoriesError),

    #[error(transparent)]
    Invalid(#[from] ConfigErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_when_nothing_collected() {
        assert!(ConfigErrors::check(Vec::new()).is_ok());
    }

    #[test]
    fn display_lists_every_error() {
        let errs = ConfigErrors::check(vec![
            ValidationError::MissingImage,
            ValidationError::MissingAuthentication,
        ])
        .unwrap_err();

        assert_eq!(
            errs.to_string(),
            "2 error(s) occurred:\n\n* IONOS 'image' is required\n\
             * IONOS authentication is required, either via token or username/password"
        );
    }

    #[test]
    fn display_indents_multiline_messages() {
        let errs = ConfigErrors::from(ValidationError::MissingSshUsername);
        assert!(errs
            .to_string()
            .contains("* An ssh_username must be specified\n    Note:"));
    }
}
