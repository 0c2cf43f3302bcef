// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing of application bundles.

use {
    crate::{
        artifact::{Artifact, ArtifactKind},
        bundle::AppBundle,
        entitlements::Entitlements,
        error::AppleReleaseError,
        identity::SigningCapability,
        plan::{SigningPlan, SigningStage},
        requirement::DesignatedRequirement,
        signing::{CodeSigner, SignatureSummary},
        verify::VerificationExpectations,
    },
    log::{info, warn},
    std::path::PathBuf,
};

/// A bundle whose nested code and container have been signed.
#[derive(Clone, Debug)]
pub struct AssembledBundle {
    bundle: AppBundle,
    signatures: Vec<(Artifact, SignatureSummary)>,
    requirement: DesignatedRequirement,
    distributable: bool,
}

impl AssembledBundle {
    pub fn bundle(&self) -> &AppBundle {
        &self.bundle
    }

    /// Signatures produced, in signing order.
    pub fn signatures(&self) -> &[(Artifact, SignatureSummary)] {
        &self.signatures
    }

    /// Whether the bundle was signed with an identity.
    ///
    /// Ad-hoc signed bundles only run on the machine that produced them.
    pub fn is_distributable(&self) -> bool {
        self.distributable
    }

    /// The requirement a properly signed bundle satisfies.
    ///
    /// Ad-hoc bundles are still checked against the anchored requirement;
    /// they are expected to fail it.
    pub fn designated_requirement(&self) -> &DesignatedRequirement {
        &self.requirement
    }

    pub fn artifact(&self) -> Artifact {
        Artifact::new(self.bundle.root_dir(), ArtifactKind::BundleContainer)
    }

    /// What verification of the assembled bundle should find.
    pub fn verification_expectations(&self) -> Result<VerificationExpectations, AppleReleaseError> {
        Ok(VerificationExpectations {
            requirement: Some(self.requirement.clone()),
            hardened_runtime: true,
            timestamp: true,
            nested_code: vec![self.bundle.main_executable()?],
        })
    }
}

/// Signs a bundle inside-out according to a [SigningPlan].
pub struct BundleAssembler<'a> {
    signer: &'a dyn CodeSigner,
    entitlements_path: Option<PathBuf>,
}

impl<'a> BundleAssembler<'a> {
    pub fn new(signer: &'a dyn CodeSigner) -> Self {
        Self {
            signer,
            entitlements_path: None,
        }
    }

    /// Use an entitlements file other than the bundle's default.
    pub fn set_entitlements_path(&mut self, path: Option<PathBuf>) {
        self.entitlements_path = path;
    }

    /// Resolve the entitlements for a bundle.
    ///
    /// Entitlements are mandatory when signing with an identity.
    fn entitlements(&self, bundle: &AppBundle) -> Result<Entitlements, AppleReleaseError> {
        let path = match &self.entitlements_path {
            Some(path) => path.clone(),
            None => bundle.default_entitlements_path()?,
        };

        info!("using entitlements from {}", path.display());
        Entitlements::from_path(path)
    }

    /// Sign every artifact in the bundle.
    ///
    /// With an identity, signing follows the validated inside-out plan with
    /// entitlements on the main executable and the bundle. Without one, the
    /// same plan is executed with ad-hoc signatures and the result is marked
    /// non-distributable.
    pub fn assemble(
        &self,
        bundle: &AppBundle,
        capability: &SigningCapability,
    ) -> Result<AssembledBundle, AppleReleaseError> {
        let identifier = bundle.identifier()?;

        let entitlements = match &capability.identity {
            Some(_) => Some(self.entitlements(bundle)?),
            None => {
                warn!(
                    "ad-hoc signing {}; the result will only run on this machine",
                    bundle.name()
                );
                None
            }
        };

        let plan = SigningPlan::for_bundle(
            bundle,
            capability.identity.as_ref(),
            entitlements.as_ref(),
        )?;
        plan.validate()?;

        let mut signatures = vec![];
        let mut stage = None;

        for step in plan.steps() {
            if stage != Some(step.stage) {
                info!("signing stage: {:?}", step.stage);
                stage = Some(step.stage);
            }

            let signature = self.signer.sign(&step.request)?;

            if step.stage == SigningStage::BundleContainer {
                warn!("signed bundle {}: {}", bundle.root_dir().display(), signature);
            }

            signatures.push((step.artifact.clone(), signature));
        }

        Ok(AssembledBundle {
            bundle: bundle.clone(),
            signatures,
            requirement: DesignatedRequirement::new(identifier)
                .with_team_id(capability.team_id()),
            distributable: capability.can_sign(),
        })
    }
}
