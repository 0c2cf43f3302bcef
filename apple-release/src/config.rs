// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Release pipeline configuration.

Settings come from, in increasing order of precedence: built-in defaults, an
optional YAML file, environment variables and command line arguments. They are
collected by a [PipelineConfigBuilder] and frozen into a [PipelineConfig]
before any work starts.
*/

use {
    crate::{
        error::{AppleReleaseError, ConfigurationError},
        notarization::{KeyMaterial, NotarizationCredentials, DEFAULT_POLL_INTERVAL},
    },
    serde::Deserialize,
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
        str::FromStr,
        time::Duration,
    },
};

pub const ENV_IDENTITY: &str = "APPLE_RELEASE_IDENTITY";
pub const ENV_TEAM_ID: &str = "APPLE_RELEASE_TEAM_ID";
pub const ENV_NOTARIZATION_KEY: &str = "APPLE_NOTARIZATION_KEY";
pub const ENV_NOTARIZATION_KEY_PATH: &str = "APPLE_NOTARIZATION_KEY_PATH";
pub const ENV_NOTARIZATION_KEY_ID: &str = "APPLE_NOTARIZATION_KEY_ID";
pub const ENV_NOTARIZATION_ISSUER_ID: &str = "APPLE_NOTARIZATION_ISSUER_ID";

/// A CPU architecture a bundle is built for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "String")]
pub enum Architecture {
    Aarch64,
    X86_64,
}

impl Architecture {
    pub fn all() -> [Self; 2] {
        [Self::Aarch64, Self::X86_64]
    }

    /// The architecture of the running machine.
    pub fn host() -> Result<Self, ConfigurationError> {
        Self::from_str(std::env::consts::ARCH)
    }

    /// Rust target triple for macOS on this architecture.
    pub fn triple(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64-apple-darwin",
            Self::X86_64 => "x86_64-apple-darwin",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::X86_64 => "x86_64",
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" | "arm64" | "aarch64-apple-darwin" => Ok(Self::Aarch64),
            "x86_64" | "x86-64" | "x64" | "x86_64-apple-darwin" => Ok(Self::X86_64),
            _ => Err(ConfigurationError::UnknownArchitecture(s.to_string())),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Which build profile's output to release.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    /// Name of the profile's directory under the target directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

impl Default for BuildProfile {
    fn default() -> Self {
        Self::Release
    }
}

/// Content of a YAML configuration file.
///
/// Every field is optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub identity: Option<String>,
    pub team_id: Option<String>,
    pub keychain: Option<PathBuf>,
    #[serde(default)]
    pub notarization: NotarizationCredentials,
    pub architectures: Option<Vec<Architecture>>,
    pub profile: Option<BuildProfile>,
    pub app_name: Option<String>,
    pub bundle_name: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub entitlements: Option<PathBuf>,
    pub poll_interval_seconds: Option<u64>,
}

impl ConfigFile {
    pub fn from_yaml(data: &str) -> Result<Self, AppleReleaseError> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, AppleReleaseError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}

/// Immutable settings for one release run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Label selecting the signing identity.
    pub identity: Option<String>,
    /// Team the signing identity is expected to belong to.
    pub team_id: Option<String>,
    /// Keychain to search instead of the default search list.
    pub keychain: Option<PathBuf>,
    pub credentials: NotarizationCredentials,
    pub architectures: Vec<Architecture>,
    pub profile: BuildProfile,
    pub app_name: Option<String>,
    /// Rename the bundle to `<bundle_name>.app` before signing.
    pub bundle_name: Option<String>,
    pub target_dir: PathBuf,
    /// Explicit input bundle, bypassing target directory conventions.
    pub bundle_path: Option<PathBuf>,
    pub entitlements: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Only the host architecture is processed.
    pub local: bool,
    pub open: bool,
    pub install: bool,
}

impl PipelineConfig {
    /// Whether signatures from this run are meant for distribution.
    pub fn is_release(&self) -> bool {
        self.profile == BuildProfile::Release
    }

    /// Directory build output for an architecture lives in.
    pub fn profile_dir(&self, arch: Architecture) -> PathBuf {
        self.target_dir
            .join(arch.triple())
            .join(self.profile.dir_name())
    }

    /// Location of the unsigned input bundle for an architecture.
    pub fn input_bundle_path(&self, arch: Architecture) -> Result<PathBuf, AppleReleaseError> {
        if let Some(path) = &self.bundle_path {
            return Ok(path.clone());
        }

        let app_name = self.app_name.as_deref().ok_or_else(|| {
            AppleReleaseError::CliBadArgument(
                "an app name or explicit bundle path is required".into(),
            )
        })?;

        Ok(self
            .profile_dir(arch)
            .join("bundle")
            .join("osx")
            .join(format!("{}.app", app_name)))
    }

    /// Location of the disk image produced for a bundle.
    pub fn disk_image_path(&self, arch: Architecture, bundle_stem: &str) -> PathBuf {
        let dir = match &self.bundle_path {
            Some(path) => path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
            None => self.profile_dir(arch),
        };

        dir.join(format!("{}.dmg", bundle_stem))
    }
}

/// Accumulates settings from each configuration source.
#[derive(Clone, Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    architectures: Option<Vec<Architecture>>,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            config: PipelineConfig {
                identity: None,
                team_id: None,
                keychain: None,
                credentials: NotarizationCredentials::default(),
                architectures: vec![],
                profile: BuildProfile::default(),
                app_name: None,
                bundle_name: None,
                target_dir: PathBuf::from("target"),
                bundle_path: None,
                entitlements: None,
                poll_interval: DEFAULT_POLL_INTERVAL,
                local: false,
                open: false,
                install: false,
            },
            architectures: None,
        }
    }
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply settings from a parsed configuration file.
    pub fn apply_file(&mut self, file: ConfigFile) -> &mut Self {
        let c = &mut self.config;

        if file.identity.is_some() {
            c.identity = file.identity;
        }
        if file.team_id.is_some() {
            c.team_id = file.team_id;
        }
        if file.keychain.is_some() {
            c.keychain = file.keychain;
        }
        c.credentials.merge(file.notarization);
        if file.architectures.is_some() {
            self.architectures = file.architectures;
        }
        if let Some(profile) = file.profile {
            c.profile = profile;
        }
        if file.app_name.is_some() {
            c.app_name = file.app_name;
        }
        if file.bundle_name.is_some() {
            c.bundle_name = file.bundle_name;
        }
        if let Some(dir) = file.target_dir {
            c.target_dir = dir;
        }
        if file.entitlements.is_some() {
            c.entitlements = file.entitlements;
        }
        if let Some(seconds) = file.poll_interval_seconds {
            c.poll_interval = Duration::from_secs(seconds);
        }

        self
    }

    /// Apply settings from environment variables.
    ///
    /// `lookup` resolves a variable name to its value. Empty values are
    /// treated as unset.
    pub fn apply_environment(&mut self, lookup: impl Fn(&str) -> Option<String>) -> &mut Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let c = &mut self.config;

        if let Some(v) = get(ENV_IDENTITY) {
            c.identity = Some(v);
        }
        if let Some(v) = get(ENV_TEAM_ID) {
            c.team_id = Some(v);
        }

        let key = get(ENV_NOTARIZATION_KEY)
            .map(KeyMaterial::Inline)
            .or_else(|| get(ENV_NOTARIZATION_KEY_PATH).map(|p| KeyMaterial::Path(p.into())));

        c.credentials.merge(NotarizationCredentials {
            key,
            key_id: get(ENV_NOTARIZATION_KEY_ID),
            issuer_id: get(ENV_NOTARIZATION_ISSUER_ID),
        });

        self
    }

    /// Apply settings from the process environment.
    pub fn apply_process_environment(&mut self) -> &mut Self {
        self.apply_environment(|name| std::env::var(name).ok())
    }

    pub fn identity(&mut self, value: impl ToString) -> &mut Self {
        self.config.identity = Some(value.to_string());
        self
    }

    pub fn team_id(&mut self, value: impl ToString) -> &mut Self {
        self.config.team_id = Some(value.to_string());
        self
    }

    pub fn keychain(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config.keychain = Some(path.into());
        self
    }

    pub fn credentials(&mut self, credentials: NotarizationCredentials) -> &mut Self {
        self.config.credentials.merge(credentials);
        self
    }

    pub fn architectures(&mut self, architectures: Vec<Architecture>) -> &mut Self {
        self.architectures = Some(architectures);
        self
    }

    pub fn profile(&mut self, profile: BuildProfile) -> &mut Self {
        self.config.profile = profile;
        self
    }

    pub fn app_name(&mut self, value: impl ToString) -> &mut Self {
        self.config.app_name = Some(value.to_string());
        self
    }

    pub fn bundle_name(&mut self, value: impl ToString) -> &mut Self {
        self.config.bundle_name = Some(value.to_string());
        self
    }

    pub fn target_dir(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config.target_dir = path.into();
        self
    }

    pub fn bundle_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config.bundle_path = Some(path.into());
        self
    }

    pub fn entitlements(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config.entitlements = Some(path.into());
        self
    }

    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn local(&mut self, value: bool) -> &mut Self {
        self.config.local = value;
        self
    }

    pub fn open(&mut self, value: bool) -> &mut Self {
        self.config.open = value;
        self
    }

    pub fn install(&mut self, value: bool) -> &mut Self {
        self.config.install = value;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(&self) -> Result<PipelineConfig, AppleReleaseError> {
        let mut config = self.config.clone();

        config.architectures = if config.local {
            vec![Architecture::host()?]
        } else if let Some(architectures) = &self.architectures {
            let mut architectures = architectures.clone();
            architectures.sort();
            architectures.dedup();
            architectures
        } else {
            Architecture::all().to_vec()
        };

        if config.architectures.is_empty() {
            return Err(AppleReleaseError::CliBadArgument(
                "at least one architecture is required".into(),
            ));
        }

        if config.bundle_path.is_some() && config.architectures.len() > 1 {
            return Err(ConfigurationError::BundlePathWithMultipleArchitectures.into());
        }

        if config.bundle_path.is_none() && config.app_name.is_none() {
            return Err(AppleReleaseError::CliBadArgument(
                "an app name or explicit bundle path is required".into(),
            ));
        }

        if config.install && !config.local {
            return Err(AppleReleaseError::CliBadArgument(
                "installing is only supported for local builds".into(),
            ));
        }

        if let Some(name) = &config.bundle_name {
            if name.is_empty() || name.contains('/') {
                return Err(AppleReleaseError::CliBadArgument(format!(
                    "invalid bundle name: {:?}",
                    name
                )));
            }
        }

        Ok(config)
    }
}
