// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered signing plans.
//!
//! A container's signature seals the signatures of everything inside it, so
//! nested code must be signed before the code containing it. Rather than
//! relying on call order, the order is materialized as a [SigningPlan] which
//! is validated before anything is signed.

use {
    crate::{
        artifact::{Artifact, ArtifactKind},
        bundle::AppBundle,
        entitlements::Entitlements,
        error::AppleReleaseError,
        identity::SigningIdentity,
        requirement::DesignatedRequirement,
        signing::SignRequest,
    },
    std::cmp::Reverse,
};

/// Phases of bundle signing, in the order they must execute.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SigningStage {
    Helpers,
    Libraries,
    MainExecutable,
    BundleContainer,
}

impl SigningStage {
    /// The stage an artifact kind is signed in.
    ///
    /// Disk images are signed by the packager, outside of any bundle plan.
    pub fn for_kind(kind: ArtifactKind) -> Option<Self> {
        match kind {
            ArtifactKind::HelperBinary => Some(Self::Helpers),
            ArtifactKind::Library => Some(Self::Libraries),
            ArtifactKind::MainExecutable => Some(Self::MainExecutable),
            ArtifactKind::BundleContainer => Some(Self::BundleContainer),
            ArtifactKind::DistributionContainer => None,
        }
    }
}

/// A single signing operation within a plan.
#[derive(Clone, Debug)]
pub struct PlanStep {
    pub stage: SigningStage,
    pub artifact: Artifact,
    pub request: SignRequest,
}

impl PlanStep {
    pub fn new(artifact: Artifact, request: SignRequest) -> Result<Self, AppleReleaseError> {
        let stage = SigningStage::for_kind(artifact.kind()).ok_or_else(|| {
            AppleReleaseError::InvalidSigningPlan(format!(
                "{} cannot be part of a bundle signing plan",
                artifact
            ))
        })?;

        Ok(Self {
            stage,
            artifact,
            request,
        })
    }
}

/// An ordered list of signing operations.
#[derive(Clone, Debug, Default)]
pub struct SigningPlan {
    steps: Vec<PlanStep>,
}

impl SigningPlan {
    /// Construct a plan from steps in the order given.
    ///
    /// No ordering is applied. Call [Self::validate] before executing.
    pub fn from_steps(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Derive the plan for signing a bundle.
    ///
    /// With an identity, helpers and libraries get hardened runtime and a
    /// timestamp, the main executable and the bundle additionally get
    /// entitlements, and the bundle gets an explicit designated requirement.
    /// Without one, every step is an ad-hoc signature.
    ///
    /// Steps are sorted by stage, then deepest path first, so frameworks
    /// nested inside frameworks precede their parents.
    pub fn for_bundle(
        bundle: &AppBundle,
        identity: Option<&SigningIdentity>,
        entitlements: Option<&Entitlements>,
    ) -> Result<Self, AppleReleaseError> {
        let mut artifacts = vec![];

        for path in bundle.helper_executables()? {
            artifacts.push(Artifact::new(path, ArtifactKind::HelperBinary));
        }
        for path in bundle.libraries()? {
            artifacts.push(Artifact::new(path, ArtifactKind::Library));
        }
        artifacts.push(Artifact::new(
            bundle.main_executable()?,
            ArtifactKind::MainExecutable,
        ));
        artifacts.push(Artifact::new(
            bundle.root_dir(),
            ArtifactKind::BundleContainer,
        ));

        let mut steps = artifacts
            .into_iter()
            .map(|artifact| {
                let mut request = SignRequest::for_artifact(&artifact, identity, entitlements);

                if let (ArtifactKind::BundleContainer, Some(identity)) = (artifact.kind(), identity)
                {
                    request.set_designated_requirement(Some(
                        DesignatedRequirement::new(bundle.identifier()?)
                            .with_team_id(identity.team_id.as_deref()),
                    ));
                }

                PlanStep::new(artifact, request)
            })
            .collect::<Result<Vec<_>, AppleReleaseError>>()?;

        steps.sort_by_key(|step| {
            (
                step.stage,
                Reverse(step.artifact.path().components().count()),
                step.artifact.path().to_path_buf(),
            )
        });

        let plan = Self { steps };
        plan.validate()?;

        Ok(plan)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step signing the outermost container, if any.
    pub fn container_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| s.stage == SigningStage::BundleContainer)
    }

    /// Ensure the plan signs inside-out.
    ///
    /// Stages must not regress, and no step may sign an artifact nested
    /// inside one signed by an earlier step.
    pub fn validate(&self) -> Result<(), AppleReleaseError> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.request.path() != step.artifact.path() {
                return Err(AppleReleaseError::InvalidSigningPlan(format!(
                    "request for {} targets {}",
                    step.artifact,
                    step.request.path().display()
                )));
            }

            for earlier in &self.steps[..i] {
                if earlier.stage > step.stage {
                    return Err(AppleReleaseError::InvalidSigningPlan(format!(
                        "{} ({:?}) is ordered after {} ({:?})",
                        step.artifact, step.stage, earlier.artifact, earlier.stage
                    )));
                }

                if earlier.artifact.contains(&step.artifact) {
                    return Err(AppleReleaseError::InvalidSigningPlan(format!(
                        "{} is signed before nested {}",
                        earlier.artifact, step.artifact
                    )));
                }
            }
        }

        Ok(())
    }
}
