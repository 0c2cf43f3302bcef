// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verification of produced signatures.

Every signed artifact passes through [SignatureVerifier] before the pipeline
moves on. The verifier runs four independent checks and a
[VerificationPolicy] decides which failures are fatal for the current run.

Tool specific output parsing is confined to [CodesignInspector]. Everything
else consumes [CheckOutcome] and [SignatureSummary] values.
*/

use {
    crate::{
        artifact::Artifact,
        error::AppleReleaseError,
        requirement::DesignatedRequirement,
        signing::SignatureSummary,
        tool::{args, run_logged, AppleTool},
    },
    log::{info, warn},
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
    },
};

/// A category of signature verification.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum VerificationCheck {
    /// The signature matches the current content of the artifact.
    Structural,
    /// Every nested artifact is itself validly signed and sealed.
    Deep,
    /// The signature satisfies the expected designated requirement.
    DesignatedRequirement,
    /// Hardened runtime and secure timestamp are present.
    RuntimeAndTimestamp,
}

impl VerificationCheck {
    pub fn all() -> [Self; 4] {
        [
            Self::Structural,
            Self::Deep,
            Self::DesignatedRequirement,
            Self::RuntimeAndTimestamp,
        ]
    }
}

impl Display for VerificationCheck {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Structural => "structural",
            Self::Deep => "deep",
            Self::DesignatedRequirement => "designated-requirement",
            Self::RuntimeAndTimestamp => "runtime-and-timestamp",
        })
    }
}

/// How thoroughly to validate a signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strictness {
    /// Only the artifact's own signature.
    Shallow,
    /// The artifact and everything nested in it.
    Deep,
}

/// Result of a single check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckOutcome {
    pub check: VerificationCheck,
    pub passed: bool,
    pub reason: Option<String>,
}

impl CheckOutcome {
    pub fn pass(check: VerificationCheck) -> Self {
        Self {
            check,
            passed: true,
            reason: None,
        }
    }

    pub fn fail(check: VerificationCheck, reason: impl ToString) -> Self {
        Self {
            check,
            passed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Whether a failed check stops the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckSeverity {
    Fatal,
    Warning,
}

/// Which checks must pass for a kind of run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerificationPolicy {
    /// Identity signed release builds. Every check is fatal.
    Distribution,
    /// Identity signed builds not intended for distribution.
    ///
    /// Runtime and timestamp problems only warn.
    Development,
    /// Ad-hoc signatures.
    ///
    /// An ad-hoc signature can never satisfy an anchored requirement, so only
    /// structural checks are fatal.
    AdHoc,
}

impl VerificationPolicy {
    pub fn new(ad_hoc: bool, distribution: bool) -> Self {
        if ad_hoc {
            Self::AdHoc
        } else if distribution {
            Self::Distribution
        } else {
            Self::Development
        }
    }

    pub fn severity(&self, check: VerificationCheck) -> CheckSeverity {
        match (self, check) {
            (Self::Distribution, _) => CheckSeverity::Fatal,
            (_, VerificationCheck::Structural | VerificationCheck::Deep) => CheckSeverity::Fatal,
            (Self::Development, VerificationCheck::DesignatedRequirement) => CheckSeverity::Fatal,
            _ => CheckSeverity::Warning,
        }
    }
}

/// Outcomes of all checks against one artifact.
#[derive(Clone, Debug)]
pub struct VerificationReport {
    path: PathBuf,
    outcomes: Vec<CheckOutcome>,
}

impl VerificationReport {
    pub fn new(path: impl AsRef<Path>, outcomes: Vec<CheckOutcome>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            outcomes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, check: VerificationCheck) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.check == check)
    }

    /// Whether a check ran and passed.
    pub fn passed(&self, check: VerificationCheck) -> bool {
        self.outcome(check).map(|o| o.passed).unwrap_or(false)
    }

    pub fn all_passed(&self) -> bool {
        VerificationCheck::all().iter().all(|c| self.passed(*c))
    }

    /// Apply a policy, failing on the first fatal check failure.
    ///
    /// Non-fatal failures are logged as warnings.
    pub fn enforce(&self, policy: VerificationPolicy) -> Result<(), AppleReleaseError> {
        for outcome in self.outcomes.iter().filter(|o| !o.passed) {
            let reason = outcome.reason.clone().unwrap_or_default();

            match policy.severity(outcome.check) {
                CheckSeverity::Fatal => {
                    return Err(AppleReleaseError::VerificationFailure {
                        check: outcome.check,
                        path: self.path.clone(),
                        reason,
                    });
                }
                CheckSeverity::Warning => {
                    warn!(
                        "{} check failed for {} (tolerated): {}",
                        outcome.check,
                        self.path.display(),
                        reason
                    );
                }
            }
        }

        Ok(())
    }
}

/// Interrogates signatures on the filesystem.
pub trait SignatureInspector: Send + Sync {
    /// Validate the signature of an artifact.
    ///
    /// The outcome check is [VerificationCheck::Structural] or
    /// [VerificationCheck::Deep] depending on `strictness`.
    fn check_signature(
        &self,
        path: &Path,
        strictness: Strictness,
    ) -> Result<CheckOutcome, AppleReleaseError>;

    /// Test whether the signature satisfies a requirement.
    fn test_requirement(
        &self,
        path: &Path,
        requirement: &DesignatedRequirement,
    ) -> Result<CheckOutcome, AppleReleaseError>;

    /// Describe the signature on an artifact, or `None` if it is unsigned.
    fn describe(&self, path: &Path) -> Result<Option<SignatureSummary>, AppleReleaseError>;
}

/// What a verified artifact is expected to look like.
#[derive(Clone, Debug, Default)]
pub struct VerificationExpectations {
    /// Requirement the signature must satisfy.
    pub requirement: Option<DesignatedRequirement>,

    /// Whether the hardened runtime flag must be set.
    pub hardened_runtime: bool,

    /// Whether a secure timestamp must be present.
    pub timestamp: bool,

    /// Nested code whose signatures must also carry runtime and timestamp.
    pub nested_code: Vec<PathBuf>,
}

/// Runs the verification checks through a [SignatureInspector].
pub struct SignatureVerifier<'a> {
    inspector: &'a dyn SignatureInspector,
}

impl<'a> SignatureVerifier<'a> {
    pub fn new(inspector: &'a dyn SignatureInspector) -> Self {
        Self { inspector }
    }

    /// Run all checks against an artifact.
    ///
    /// Check failures are recorded in the report, not returned as errors.
    /// Errors indicate the inspection itself could not be performed.
    pub fn verify(
        &self,
        artifact: &Artifact,
        expectations: &VerificationExpectations,
    ) -> Result<VerificationReport, AppleReleaseError> {
        let path = artifact.path();
        info!("verifying signature of {}", artifact);

        let mut outcomes = vec![
            self.inspector.check_signature(path, Strictness::Shallow)?,
            self.inspector.check_signature(path, Strictness::Deep)?,
        ];

        outcomes.push(match &expectations.requirement {
            Some(requirement) => self.inspector.test_requirement(path, requirement)?,
            None => CheckOutcome::pass(VerificationCheck::DesignatedRequirement),
        });

        outcomes.push(self.check_runtime_and_timestamp(path, expectations)?);

        for outcome in &outcomes {
            if outcome.passed {
                info!("{} check passed for {}", outcome.check, path.display());
            }
        }

        Ok(VerificationReport::new(path, outcomes))
    }

    fn check_runtime_and_timestamp(
        &self,
        path: &Path,
        expectations: &VerificationExpectations,
    ) -> Result<CheckOutcome, AppleReleaseError> {
        let check = VerificationCheck::RuntimeAndTimestamp;
        let mut problems = vec![];

        let nested = expectations.nested_code.iter().map(|p| p.as_path());
        for candidate in std::iter::once(path).chain(nested) {
            match self.inspector.describe(candidate)? {
                None => problems.push(format!("{} is not signed", candidate.display())),
                Some(summary) => {
                    if expectations.hardened_runtime && !summary.hardened_runtime {
                        problems.push(format!(
                            "{} lacks the hardened runtime flag",
                            candidate.display()
                        ));
                    }
                    if expectations.timestamp && !summary.timestamped {
                        problems.push(format!(
                            "{} lacks a secure timestamp",
                            candidate.display()
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(CheckOutcome::pass(check))
        } else {
            Ok(CheckOutcome::fail(check, problems.join("; ")))
        }
    }
}

/// Parse the output of `codesign --display --verbose=4 -r-`.
pub fn parse_codesign_display(output: &str) -> SignatureSummary {
    let mut summary = SignatureSummary::default();
    let mut ad_hoc = false;

    for line in output.lines().map(|l| l.trim()) {
        if let Some(authority) = line.strip_prefix("Authority=") {
            if summary.identity.is_none() {
                summary.identity = Some(authority.to_string());
            }
        } else if line == "Signature=adhoc" {
            ad_hoc = true;
        } else if line.starts_with("Timestamp=") {
            summary.timestamped = true;
        } else if line.starts_with("CodeDirectory ") {
            if let Some(flags) = line.split_whitespace().find(|t| t.starts_with("flags=")) {
                summary.hardened_runtime = flags.contains("runtime");
            }
        } else if let Some(requirement) = line.strip_prefix("designated => ") {
            summary.designated_requirement = Some(requirement.to_string());
        }
    }

    if ad_hoc {
        summary.identity = None;
        summary.timestamped = false;
    }

    summary
}

/// A [SignatureInspector] invoking `codesign` in its verification modes.
pub struct CodesignInspector {
    exe: PathBuf,
}

impl CodesignInspector {
    pub fn new() -> Result<Self, AppleReleaseError> {
        Ok(Self::with_exe(AppleTool::Codesign.find_exe()?))
    }

    pub fn with_exe(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl SignatureInspector for CodesignInspector {
    fn check_signature(
        &self,
        path: &Path,
        strictness: Strictness,
    ) -> Result<CheckOutcome, AppleReleaseError> {
        let mut arguments = args(["--verify", "--strict", "--verbose=2"]);
        let check = match strictness {
            Strictness::Shallow => VerificationCheck::Structural,
            Strictness::Deep => {
                arguments.push("--deep".into());
                VerificationCheck::Deep
            }
        };
        arguments.push(path.into());

        let output = run_logged(&self.exe, arguments, "codesign")?;

        Ok(if output.success {
            CheckOutcome::pass(check)
        } else {
            CheckOutcome::fail(check, output.output.trim())
        })
    }

    fn test_requirement(
        &self,
        path: &Path,
        requirement: &DesignatedRequirement,
    ) -> Result<CheckOutcome, AppleReleaseError> {
        let mut arguments = args(["--verify", "--verbose=2"]);
        arguments.push(format!("-R={}", requirement.expression()).into());
        arguments.push(path.into());

        let output = run_logged(&self.exe, arguments, "codesign")?;
        let check = VerificationCheck::DesignatedRequirement;

        Ok(if output.success {
            CheckOutcome::pass(check)
        } else {
            CheckOutcome::fail(check, output.output.trim())
        })
    }

    fn describe(&self, path: &Path) -> Result<Option<SignatureSummary>, AppleReleaseError> {
        let mut arguments = args(["--display", "--verbose=4", "-r-"]);
        arguments.push(path.into());

        let output = run_logged(&self.exe, arguments, "codesign")?;

        if !output.success {
            if output.output.contains("not signed at all") {
                return Ok(None);
            }

            return Err(AppleReleaseError::ToolInvocation {
                program: "codesign --display".into(),
                diagnostic: output.output,
            });
        }

        Ok(Some(parse_codesign_display(&output.output)))
    }
}
