// src/communicator.rs
// Settings for the SSH / WinRM connection used to provision the build server.

use serde::{Deserialize, Serialize, Serializer};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::de::{weak, weak_bool};
use crate::errors::ValidationError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SSH_HANDSHAKE_ATTEMPTS: u32 = 10;
pub const DEFAULT_SSH_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WINRM_PORT: u16 = 5985;
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;
pub const DEFAULT_WINRM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Communicator keys as written in the template. Flattened into the builder config,
/// so unset strings are empty and unset numbers are zero.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct CommunicatorConfig {
    #[serde(rename = "communicator", default)]
    pub kind: String,
    #[serde(default)]
    pub pause_before_connecting: String,

    #[serde(default)]
    pub ssh_host: String,
    #[serde(default, deserialize_with = "weak")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_username: String,
    #[serde(default)]
    pub ssh_password: String,
    #[serde(default)]
    pub ssh_private_key_file: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub ssh_agent_auth: bool,
    #[serde(default)]
    pub ssh_timeout: String,
    #[serde(default, deserialize_with = "weak")]
    pub ssh_handshake_attempts: u32,
    #[serde(default)]
    pub ssh_keep_alive_interval: String,
    #[serde(default)]
    pub ssh_read_write_timeout: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub ssh_pty: bool,
    #[serde(default, deserialize_with = "weak_bool")]
    pub ssh_disable_agent_forwarding: bool,
    #[serde(default)]
    pub ssh_file_transfer_method: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub ssh_clear_authorized_keys: bool,

    #[serde(default)]
    pub ssh_bastion_host: String,
    #[serde(default, deserialize_with = "weak")]
    pub ssh_bastion_port: u16,
    #[serde(default)]
    pub ssh_bastion_username: String,
    #[serde(default)]
    pub ssh_bastion_password: String,
    #[serde(default)]
    pub ssh_bastion_private_key_file: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub ssh_bastion_agent_auth: bool,

    #[serde(default)]
    pub winrm_host: String,
    #[serde(default, deserialize_with = "weak")]
    pub winrm_port: u16,
    #[serde(default)]
    pub winrm_username: String,
    #[serde(default)]
    pub winrm_password: String,
    #[serde(default)]
    pub winrm_timeout: String,
    #[serde(default, deserialize_with = "weak_bool")]
    pub winrm_use_ssl: bool,
    #[serde(default, deserialize_with = "weak_bool")]
    pub winrm_insecure: bool,
    #[serde(default, deserialize_with = "weak_bool")]
    pub winrm_use_ntlm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorType {
    Ssh,
    WinRm,
    None,
}

impl FromStr for CommunicatorType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "ssh" => Ok(CommunicatorType::Ssh),
            "winrm" => Ok(CommunicatorType::WinRm),
            "none" => Ok(CommunicatorType::None),
            other => Err(ValidationError::InvalidCommunicatorType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferMethod {
    Scp,
    Sftp,
}

/// Fully resolved communicator handed to the provisioning steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Communicator {
    #[serde(serialize_with = "human_duration")]
    pub pause_before_connecting: Duration,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ssh(SshSettings),
    WinRm(WinRmSettings),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SshSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub agent_auth: bool,
    #[serde(serialize_with = "human_duration")]
    pub timeout: Duration,
    pub handshake_attempts: u32,
    #[serde(serialize_with = "human_duration")]
    pub keep_alive_interval: Duration,
    #[serde(serialize_with = "human_duration")]
    pub read_write_timeout: Duration,
    pub pty: bool,
    pub disable_agent_forwarding: bool,
    pub file_transfer_method: FileTransferMethod,
    pub clear_authorized_keys: bool,
    pub bastion: Option<BastionSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BastionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub agent_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WinRmSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    #[serde(serialize_with = "human_duration")]
    pub timeout: Duration,
    pub use_ssl: bool,
    pub insecure: bool,
    pub use_ntlm: bool,
}

fn human_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_duration(
    field: &'static str,
    value: &str,
    default: Duration,
    errors: &mut Vec<ValidationError>,
) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return default;
    }
    if value == "0" {
        return Duration::ZERO;
    }
    match humantime::parse_duration(value) {
        Ok(duration) => duration,
        Err(e) => match parse_fractional(value) {
            Some(duration) => duration,
            None => {
                errors.push(ValidationError::InvalidDuration {
                    field,
                    value: value.to_string(),
                    reason: e.to_string(),
                });
                default
            }
        },
    }
}

/// Durations with fractional components such as `1.5h` or `1h30.5m`, which
/// humantime rejects. Units: ns, us, µs, ms, s, m, h.
fn parse_fractional(value: &str) -> Option<Duration> {
    let mut rest = value;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut nanos = whole.checked_mul(scale)?;
        let mut divisor: u128 = 1;
        for digit in fraction.chars() {
            divisor = divisor.checked_mul(10)?;
            nanos += u128::from(digit.to_digit(10)?) * scale / divisor;
        }
        total = total.checked_add(nanos)?;
        rest = tail;
    }
    u64::try_from(total).ok().map(Duration::from_nanos)
}

/// Expands `~` and checks the file holds a PEM encoded private key.
fn check_private_key(
    field: &'static str,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
    match fs::read_to_string(&expanded) {
        Ok(contents) => {
            let pem = contents.contains("-----BEGIN ") && contents.contains("PRIVATE KEY-----");
            if !pem {
                errors.push(ValidationError::InvalidPrivateKeyFile {
                    field,
                    reason: format!("no PEM private key block found in {}", expanded.display()),
                });
            }
        }
        Err(e) => errors.push(ValidationError::InvalidPrivateKeyFile {
            field,
            reason: format!("{}: {}", expanded.display(), e),
        }),
    }
    Some(expanded)
}

impl CommunicatorConfig {
    pub fn communicator_type(&self) -> Result<CommunicatorType, ValidationError> {
        self.kind.parse()
    }

    /// Applies defaults and validates. Every problem is reported, not just the first.
    pub fn prepare(&self) -> Result<Communicator, Vec<ValidationError>> {
        let (communicator, errors) = self.resolve();
        if errors.is_empty() {
            Ok(communicator)
        } else {
            Err(errors)
        }
    }

    /// Best-effort resolution: the communicator is only usable when no errors came back.
    pub(crate) fn resolve(&self) -> (Communicator, Vec<ValidationError>) {
        let mut errors = Vec::new();
        let pause_before_connecting = parse_duration(
            "pause_before_connecting",
            &self.pause_before_connecting,
            Duration::ZERO,
            &mut errors,
        );

        let transport = match self.communicator_type() {
            Ok(CommunicatorType::Ssh) => Transport::Ssh(self.prepare_ssh(&mut errors)),
            Ok(CommunicatorType::WinRm) => Transport::WinRm(self.prepare_winrm(&mut errors)),
            Ok(CommunicatorType::None) => Transport::None,
            Err(e) => {
                errors.push(e);
                Transport::None
            }
        };

        let communicator = Communicator {
            pause_before_connecting,
            transport,
        };
        (communicator, errors)
    }

    fn prepare_ssh(&self, errors: &mut Vec<ValidationError>) -> SshSettings {
        if self.ssh_username.is_empty() {
            errors.push(ValidationError::MissingSshUsername);
        }
        let private_key_file =
            check_private_key("ssh_private_key_file", &self.ssh_private_key_file, errors);

        let file_transfer_method = match self.ssh_file_transfer_method.as_str() {
            "" | "scp" => FileTransferMethod::Scp,
            "sftp" => FileTransferMethod::Sftp,
            other => {
                errors.push(ValidationError::InvalidFileTransferMethod(other.to_string()));
                FileTransferMethod::Scp
            }
        };

        let bastion = (!self.ssh_bastion_host.is_empty()).then(|| self.prepare_bastion(errors));

        let port = match self.ssh_port {
            0 => DEFAULT_SSH_PORT,
            port => port,
        };
        let handshake_attempts = match self.ssh_handshake_attempts {
            0 => DEFAULT_SSH_HANDSHAKE_ATTEMPTS,
            attempts => attempts,
        };
        debug!(port, handshake_attempts, "Resolved SSH communicator");

        SshSettings {
            host: non_empty(&self.ssh_host),
            port,
            username: self.ssh_username.clone(),
            password: non_empty(&self.ssh_password),
            private_key_file,
            agent_auth: self.ssh_agent_auth,
            timeout: parse_duration("ssh_timeout", &self.ssh_timeout, DEFAULT_SSH_TIMEOUT, errors),
            handshake_attempts,
            keep_alive_interval: parse_duration(
                "ssh_keep_alive_interval",
                &self.ssh_keep_alive_interval,
                DEFAULT_SSH_KEEP_ALIVE_INTERVAL,
                errors,
            ),
            read_write_timeout: parse_duration(
                "ssh_read_write_timeout",
                &self.ssh_read_write_timeout,
                Duration::ZERO,
                errors,
            ),
            pty: self.ssh_pty,
            disable_agent_forwarding: self.ssh_disable_agent_forwarding,
            file_transfer_method,
            clear_authorized_keys: self.ssh_clear_authorized_keys,
            bastion,
        }
    }

    fn prepare_bastion(&self, errors: &mut Vec<ValidationError>) -> BastionSettings {
        if !self.ssh_bastion_agent_auth
            && self.ssh_bastion_password.is_empty()
            && self.ssh_bastion_private_key_file.is_empty()
        {
            errors.push(ValidationError::MissingBastionCredentials);
        }
        BastionSettings {
            host: self.ssh_bastion_host.clone(),
            port: match self.ssh_bastion_port {
                0 => DEFAULT_SSH_PORT,
                port => port,
            },
            username: self.ssh_bastion_username.clone(),
            password: non_empty(&self.ssh_bastion_password),
            private_key_file: check_private_key(
                "ssh_bastion_private_key_file",
                &self.ssh_bastion_private_key_file,
                errors,
            ),
            agent_auth: self.ssh_bastion_agent_auth,
        }
    }

    fn prepare_winrm(&self, errors: &mut Vec<ValidationError>) -> WinRmSettings {
        if self.winrm_username.is_empty() {
            errors.push(ValidationError::MissingWinrmUsername);
        }
        let port = match (self.winrm_port, self.winrm_use_ssl) {
            (0, true) => DEFAULT_WINRM_SSL_PORT,
            (0, false) => DEFAULT_WINRM_PORT,
            (port, _) => port,
        };
        WinRmSettings {
            host: non_empty(&self.winrm_host),
            port,
            username: self.winrm_username.clone(),
            password: non_empty(&self.winrm_password),
            timeout: parse_duration("winrm_timeout", &self.winrm_timeout, DEFAULT_WINRM_TIMEOUT, errors),
            use_ssl: self.winrm_use_ssl,
            insecure: self.winrm_insecure,
            use_ntlm: self.winrm_use_ntlm,
        }
    }

    /// Values that must never show up in logs.
    pub fn secrets(&self) -> impl Iterator<Item = &str> {
        [
            self.ssh_password.as_str(),
            self.ssh_bastion_password.as_str(),
            self.winrm_password.as_str(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
    }
}
