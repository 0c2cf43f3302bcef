// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::verify::VerificationCheck,
    std::path::PathBuf,
    thiserror::Error,
};

/// Problems with the inputs or settings of a release run.
///
/// Some of these degrade the run to ad-hoc signing (see
/// [crate::identity::IdentityResolver]). The rest are fatal.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no signing identity matching {0:?} in the keychain")]
    IdentityNotFound(String),

    #[error("signing identity label {label:?} is ambiguous; matches: {}", candidates.join(", "))]
    AmbiguousIdentity {
        label: String,
        candidates: Vec<String>,
    },

    #[error("entitlements file does not exist: {0}")]
    MissingEntitlements(PathBuf),

    #[error("entitlements file {path} is malformed: {reason}")]
    MalformedEntitlements { path: PathBuf, reason: String },

    #[error("bundle Info.plist does not define CFBundleIdentifier: {0}")]
    BundleNoIdentifier(PathBuf),

    #[error("bundle Info.plist does not define CFBundleExecutable: {0}")]
    BundleNoMainExecutable(PathBuf),

    #[error("main executable {0} does not exist")]
    MainExecutableMissing(PathBuf),

    #[error("unsigned bundle not found: {0}")]
    BundleNotFound(PathBuf),

    #[error("notarization credentials are incomplete; need key material, key ID and issuer ID")]
    IncompleteNotarizationCredentials,

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("an explicit bundle path can only be used with a single architecture")]
    BundlePathWithMultipleArchitectures,

    #[error("unable to locate tool {0}")]
    ToolNotFound(&'static str),
}

/// Unified error type for release pipeline operations.
#[derive(Debug, Error)]
pub enum AppleReleaseError {
    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing plist: {0}")]
    PlistParse(#[from] plist::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("error walking directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("error interfacing with directory-based bundle: {0}")]
    BundleLayout(anyhow::Error),

    #[error("error running {program}: {diagnostic}")]
    ToolInvocation {
        program: String,
        diagnostic: String,
    },

    #[error("failed to sign {path}: {diagnostic}")]
    SignFailure { path: PathBuf, diagnostic: String },

    #[error("signing plan is invalid: {0}")]
    InvalidSigningPlan(String),

    #[error("verification check {check} failed for {path}: {reason}")]
    VerificationFailure {
        check: VerificationCheck,
        path: PathBuf,
        reason: String,
    },

    #[error("failed to create disk image {path}: {diagnostic}")]
    PackagingFailure { path: PathBuf, diagnostic: String },

    #[error("notarization submission {submission_id} rejected: {reason}")]
    NotarizationRejected {
        submission_id: String,
        reason: String,
    },

    #[error("notarization of {path} was accepted but stapling failed (this should not happen): {diagnostic}")]
    StaplingInconsistency { path: PathBuf, diagnostic: String },

    #[error("unexpected response from notary service: {0}")]
    NotaryResponse(String),

    #[error("operation aborted by operator")]
    Aborted,
}

impl AppleReleaseError {
    /// Whether this error came from an operator-initiated abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
