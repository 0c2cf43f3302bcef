// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing individual artifacts.
//!
//! A [SignRequest] describes exactly one signature: what to sign, with which
//! identity, and which options to embed. A [CodeSigner] turns requests into
//! signatures. Signing always overwrites any existing signature and never
//! descends into nested code: callers are responsible for ordering (see
//! [crate::plan::SigningPlan]).

use {
    crate::{
        artifact::Artifact,
        entitlements::Entitlements,
        error::AppleReleaseError,
        identity::SigningIdentity,
        requirement::DesignatedRequirement,
        tool::{args, run_logged, AppleTool},
    },
    log::warn,
    std::{
        fmt::Formatter,
        path::{Path, PathBuf},
    },
};

/// A request to sign a single artifact.
#[derive(Clone, Debug)]
pub struct SignRequest {
    path: PathBuf,
    identity: Option<SigningIdentity>,
    entitlements: Option<Entitlements>,
    hardened_runtime: bool,
    timestamp: bool,
    identifier: Option<String>,
    designated_requirement: Option<DesignatedRequirement>,
}

impl SignRequest {
    /// Construct a request signing with an identity.
    ///
    /// Identity signatures carry a secure timestamp by default.
    pub fn with_identity(path: impl AsRef<Path>, identity: SigningIdentity) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            identity: Some(identity),
            entitlements: None,
            hardened_runtime: false,
            timestamp: true,
            identifier: None,
            designated_requirement: None,
        }
    }

    /// Construct an ad-hoc request.
    ///
    /// Ad-hoc signatures have no identity and never carry a timestamp.
    pub fn ad_hoc(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            identity: None,
            entitlements: None,
            hardened_runtime: false,
            timestamp: false,
            identifier: None,
            designated_requirement: None,
        }
    }

    /// Construct a request for an artifact using the artifact kind's defaults.
    ///
    /// Entitlements are only attached when the artifact kind requires them.
    /// Hardened runtime is only enabled for identity signatures.
    pub fn for_artifact(
        artifact: &Artifact,
        identity: Option<&SigningIdentity>,
        entitlements: Option<&Entitlements>,
    ) -> Self {
        match identity {
            Some(identity) => {
                let mut request = Self::with_identity(artifact.path(), identity.clone());
                request.set_hardened_runtime(artifact.requires_hardened_runtime());
                if artifact.requires_entitlements() {
                    request.set_entitlements(entitlements.cloned());
                }
                request
            }
            None => Self::ad_hoc(artifact.path()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> Option<&SigningIdentity> {
        self.identity.as_ref()
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.identity.is_none()
    }

    pub fn entitlements(&self) -> Option<&Entitlements> {
        self.entitlements.as_ref()
    }

    pub fn set_entitlements(&mut self, entitlements: Option<Entitlements>) {
        self.entitlements = entitlements;
    }

    pub fn hardened_runtime(&self) -> bool {
        self.hardened_runtime
    }

    pub fn set_hardened_runtime(&mut self, value: bool) {
        self.hardened_runtime = value;
    }

    /// Whether a secure timestamp will be requested.
    pub fn timestamp(&self) -> bool {
        self.timestamp && self.identity.is_some()
    }

    /// Suppress the secure timestamp.
    ///
    /// Useful for local iteration where the timestamp server round trip is
    /// unwanted. Signatures without a timestamp cannot be notarized.
    pub fn disable_timestamp(&mut self) {
        self.timestamp = false;
    }

    /// Explicit code identifier, overriding the one `codesign` derives.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn set_identifier(&mut self, identifier: impl ToString) {
        self.identifier = Some(identifier.to_string());
    }

    pub fn designated_requirement(&self) -> Option<&DesignatedRequirement> {
        self.designated_requirement.as_ref()
    }

    pub fn set_designated_requirement(&mut self, requirement: Option<DesignatedRequirement>) {
        self.designated_requirement = requirement;
    }

    /// Verify the preconditions for signing hold.
    pub fn check_preconditions(&self) -> Result<(), AppleReleaseError> {
        if !self.path.exists() {
            return Err(AppleReleaseError::SignFailure {
                path: self.path.clone(),
                diagnostic: "artifact does not exist".into(),
            });
        }

        Ok(())
    }

    /// The signature this request is expected to produce.
    pub fn expected_signature(&self) -> SignatureSummary {
        SignatureSummary {
            identity: self.identity.as_ref().map(|i| i.name.clone()),
            timestamped: self.timestamp(),
            hardened_runtime: self.hardened_runtime,
            entitlements: self.entitlements.as_ref().map(|e| e.path().to_path_buf()),
            designated_requirement: self
                .designated_requirement
                .as_ref()
                .map(|r| r.expression()),
        }
    }

    /// Arguments to pass to `codesign` to fulfill this request.
    pub fn codesign_args(&self) -> Vec<std::ffi::OsString> {
        let mut res = args(["--sign"]);
        res.push(
            self.identity
                .as_ref()
                .map(|i| i.fingerprint.as_str())
                .unwrap_or("-")
                .into(),
        );
        res.push("--force".into());

        if self.timestamp() {
            res.push("--timestamp".into());
        } else {
            res.push("--timestamp=none".into());
        }

        if self.hardened_runtime {
            res.push("--options".into());
            res.push("runtime".into());
        }

        if let Some(identifier) = &self.identifier {
            res.push("--identifier".into());
            res.push(identifier.into());
        }

        if let Some(entitlements) = &self.entitlements {
            res.push("--entitlements".into());
            res.push(entitlements.path().into());
        }

        if let Some(requirement) = &self.designated_requirement {
            res.push(format!("-r={}", requirement.statement()).into());
        }

        res.push(self.path.clone().into());

        res
    }
}

/// Describes an embedded code signature.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignatureSummary {
    /// Name of the identity that signed, or `None` for ad-hoc signatures.
    pub identity: Option<String>,

    /// Whether a secure timestamp token is present.
    pub timestamped: bool,

    /// Whether the hardened runtime flag is set.
    pub hardened_runtime: bool,

    /// Entitlements file embedded into the signature.
    pub entitlements: Option<PathBuf>,

    /// Designated requirement expression.
    pub designated_requirement: Option<String>,
}

impl SignatureSummary {
    pub fn is_ad_hoc(&self) -> bool {
        self.identity.is_none()
    }
}

impl std::fmt::Display for SignatureSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (timestamp: {}, hardened runtime: {})",
            self.identity.as_deref().unwrap_or("ad-hoc"),
            self.timestamped,
            self.hardened_runtime
        )
    }
}

/// Something that can produce code signatures.
pub trait CodeSigner: Send + Sync {
    /// Sign a single artifact, replacing any existing signature.
    fn sign(&self, request: &SignRequest) -> Result<SignatureSummary, AppleReleaseError>;
}

/// A [CodeSigner] invoking Apple's `codesign`.
pub struct CodesignTool {
    exe: PathBuf,
}

impl CodesignTool {
    /// Construct an instance using a discovered `codesign` executable.
    pub fn new() -> Result<Self, AppleReleaseError> {
        Ok(Self::with_exe(AppleTool::Codesign.find_exe()?))
    }

    pub fn with_exe(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl CodeSigner for CodesignTool {
    fn sign(&self, request: &SignRequest) -> Result<SignatureSummary, AppleReleaseError> {
        request.check_preconditions()?;

        warn!(
            "signing {} ({})",
            request.path().display(),
            request
                .identity()
                .map(|i| i.name.as_str())
                .unwrap_or("ad-hoc")
        );

        let output = run_logged(&self.exe, request.codesign_args(), "codesign")?;

        if output.success {
            Ok(request.expected_signature())
        } else {
            Err(AppleReleaseError::SignFailure {
                path: request.path().to_path_buf(),
                diagnostic: output.output,
            })
        }
    }
}
