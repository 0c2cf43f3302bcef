// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Release pipeline orchestration.

A run resolves the signing capability once, then processes every requested
architecture independently and in parallel:

1. Locate (and optionally rename) the unsigned bundle.
2. Sign it inside-out and verify the result.
3. Wrap it in a signed disk image and verify that.
4. Notarize and staple the disk image when credentials allow.

A failure stops the affected architecture only.
*/

use {
    crate::{
        assembler::BundleAssembler,
        bundle::{copy_tree, AppBundle},
        config::{Architecture, PipelineConfig},
        error::{AppleReleaseError, ConfigurationError},
        identity::{IdentityResolver, KeychainTrustStore, SigningCapability, TrustStore},
        notarization::{AbortSignal, NotarizationSubmitter, NotaryService, NotarytoolClient},
        packaging::{ArchivePackager, DiskImageBuilder, HdiutilImageBuilder},
        signing::{CodeSigner, CodesignTool},
        stapling::{TicketStapler, XcrunStapler},
        tool::{args, run_logged, AppleTool},
        verify::{
            CodesignInspector, SignatureInspector, SignatureVerifier, VerificationExpectations,
            VerificationPolicy,
        },
    },
    log::{error, info, warn},
    rayon::prelude::*,
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
    },
};

/// Where `--install` copies bundles to.
pub const DEFAULT_INSTALL_DIR: &str = "/Applications";

/// The external services a pipeline delegates to.
pub struct Toolchain {
    pub trust_store: Box<dyn TrustStore>,
    pub signer: Box<dyn CodeSigner>,
    pub inspector: Box<dyn SignatureInspector>,
    pub image_builder: Box<dyn DiskImageBuilder>,
    /// Only available when notarization credentials are complete.
    pub notary: Option<Box<dyn NotaryService>>,
    pub stapler: Box<dyn TicketStapler>,
}

impl Toolchain {
    /// A toolchain backed by the Apple developer tools on this machine.
    pub fn system(config: &PipelineConfig) -> Result<Self, AppleReleaseError> {
        let notary: Option<Box<dyn NotaryService>> = if config.credentials.is_complete() {
            Some(Box::new(NotarytoolClient::new(&config.credentials)?))
        } else {
            None
        };

        let mut trust_store = KeychainTrustStore::new()?;
        if let Some(keychain) = &config.keychain {
            trust_store.set_keychain(keychain);
        }

        Ok(Self {
            trust_store: Box::new(trust_store),
            signer: Box::new(CodesignTool::new()?),
            inspector: Box::new(CodesignInspector::new()?),
            image_builder: Box::new(HdiutilImageBuilder::new()?),
            notary,
            stapler: Box::new(XcrunStapler::new()?),
        })
    }
}

/// Notarization result of a produced disk image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotarizationStatus {
    /// Not submitted. The image will trigger Gatekeeper warnings.
    Unnotarized,
    /// Accepted by the notary service and ticket attached.
    Stapled { submission_id: String },
}

impl Display for NotarizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unnotarized => f.write_str("not notarized"),
            Self::Stapled { submission_id } => write!(f, "notarized ({})", submission_id),
        }
    }
}

/// What a successful architecture pipeline produced.
#[derive(Clone, Debug)]
pub struct ArchitectureOutput {
    pub bundle: PathBuf,
    pub disk_image: PathBuf,
    /// Hex SHA-256 of the disk image as submitted for notarization.
    pub disk_image_sha256: Option<String>,
    /// Whether the output may be given to other machines.
    pub distributable: bool,
    pub notarization: NotarizationStatus,
}

/// Result of one architecture's pipeline.
#[derive(Debug)]
pub struct ArchitectureOutcome {
    pub architecture: Architecture,
    pub result: Result<ArchitectureOutput, AppleReleaseError>,
}

/// Results of every architecture in a run.
#[derive(Debug)]
pub struct RunSummary {
    outcomes: Vec<ArchitectureOutcome>,
}

impl RunSummary {
    pub fn outcomes(&self) -> &[ArchitectureOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, arch: Architecture) -> Option<&ArchitectureOutcome> {
        self.outcomes.iter().find(|o| o.architecture == arch)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Log a line per architecture.
    pub fn log(&self) {
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(output) => {
                    warn!(
                        "{}: {} ({}, {})",
                        outcome.architecture,
                        output.disk_image.display(),
                        if output.distributable {
                            "distributable"
                        } else {
                            "NOT distributable"
                        },
                        output.notarization
                    );
                }
                Err(e) => {
                    error!("{}: failed: {}", outcome.architecture, e);
                }
            }
        }
    }
}

/// Runs the release pipeline for every configured architecture.
pub struct Pipeline {
    config: PipelineConfig,
    toolchain: Toolchain,
    abort: AbortSignal,
    install_dir: PathBuf,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, toolchain: Toolchain) -> Self {
        Self {
            config,
            toolchain,
            abort: AbortSignal::new(),
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Signal that stops the run.
    ///
    /// Architectures not yet started fail immediately, pending submissions
    /// are not made and in-progress notarization waits return.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn set_install_dir(&mut self, path: impl Into<PathBuf>) {
        self.install_dir = path.into();
    }

    /// Determine what this run is able to do.
    pub fn resolve_capability(&self) -> Result<SigningCapability, AppleReleaseError> {
        IdentityResolver::new(self.toolchain.trust_store.as_ref()).resolve(
            self.config.identity.as_deref(),
            self.config.team_id.as_deref(),
            Some(&self.config.credentials),
        )
    }

    /// Run the pipeline.
    ///
    /// Only failures affecting every architecture (e.g. an ambiguous signing
    /// identity) are returned as errors. Per-architecture failures are
    /// recorded in the summary.
    pub fn run(&self) -> Result<RunSummary, AppleReleaseError> {
        let capability = self.resolve_capability()?;

        if capability.can_sign() && !self.config.is_release() {
            warn!("signing a debug build; output is not meant for distribution");
        }

        let outcomes = self
            .config
            .architectures
            .par_iter()
            .map(|arch| {
                let result = self.run_architecture(*arch, &capability);

                if let Err(e) = &result {
                    error!("{} pipeline failed: {}", arch, e);
                }

                ArchitectureOutcome {
                    architecture: *arch,
                    result,
                }
            })
            .collect::<Vec<_>>();

        Ok(RunSummary { outcomes })
    }

    /// Run the pipeline for a single architecture.
    pub fn run_architecture(
        &self,
        arch: Architecture,
        capability: &SigningCapability,
    ) -> Result<ArchitectureOutput, AppleReleaseError> {
        self.check_abort()?;
        warn!("processing {} ({})", arch, arch.triple());

        let input = self.config.input_bundle_path(arch)?;
        if !input.is_dir() {
            return Err(ConfigurationError::BundleNotFound(input).into());
        }

        let mut bundle = AppBundle::new_from_path(&input).map_err(AppleReleaseError::BundleLayout)?;

        if let Some(name) = &self.config.bundle_name {
            let dest = input
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("{}.app", name));

            if dest != input {
                warn!("renaming {} to {}", bundle.name(), dest.display());
                bundle = bundle.copy_to(&dest)?;
            }
        }

        let distributable = capability.can_sign();
        let policy = VerificationPolicy::new(
            !capability.can_sign(),
            capability.can_sign() && self.config.is_release(),
        );
        let verifier = SignatureVerifier::new(self.toolchain.inspector.as_ref());

        let mut assembler = BundleAssembler::new(self.toolchain.signer.as_ref());
        assembler.set_entitlements_path(self.config.entitlements.clone());
        let assembled = assembler.assemble(&bundle, capability)?;

        verifier
            .verify(&assembled.artifact(), &assembled.verification_expectations()?)?
            .enforce(policy)?;

        let disk_image = self.config.disk_image_path(arch, bundle.stem());
        let packager = ArchivePackager::new(
            self.toolchain.image_builder.as_ref(),
            self.toolchain.signer.as_ref(),
        );
        let container =
            packager.package(assembled.bundle(), &disk_image, capability.identity.as_ref())?;

        let container_expectations = VerificationExpectations {
            requirement: Some(container.designated_requirement(capability.team_id())),
            hardened_runtime: false,
            timestamp: true,
            nested_code: vec![],
        };
        verifier
            .verify(&container.artifact(), &container_expectations)?
            .enforce(policy)?;

        self.check_abort()?;
        let (notarization, disk_image_sha256) = self.notarize(container.path(), capability)?;

        let output = ArchitectureOutput {
            bundle: assembled.bundle().root_dir().to_path_buf(),
            disk_image: container.path().to_path_buf(),
            disk_image_sha256,
            distributable,
            notarization,
        };

        if self.config.install {
            self.install(assembled.bundle())?;
        }

        if self.config.open {
            let target = if self.config.local {
                output.bundle.as_path()
            } else {
                output.disk_image.as_path()
            };
            open_path(target)?;
        }

        Ok(output)
    }

    fn notarize(
        &self,
        container: &Path,
        capability: &SigningCapability,
    ) -> Result<(NotarizationStatus, Option<String>), AppleReleaseError> {
        let notary = match (&self.toolchain.notary, capability.can_notarize()) {
            (Some(notary), true) => notary.as_ref(),
            (None, true) => {
                warn!("no notary service available; skipping notarization");
                return Ok((NotarizationStatus::Unnotarized, None));
            }
            (_, false) => {
                warn!(
                    "skipping notarization of {}; it will not pass Gatekeeper on other machines",
                    container.display()
                );
                return Ok((NotarizationStatus::Unnotarized, None));
            }
        };

        let mut submitter = NotarizationSubmitter::new(notary, self.toolchain.stapler.as_ref());
        submitter.set_poll_interval(self.config.poll_interval);
        submitter.set_abort_signal(self.abort.clone());

        let submission = submitter.notarize(container)?;

        Ok((
            NotarizationStatus::Stapled {
                submission_id: submission.submission_id().unwrap_or_default().to_string(),
            },
            Some(submission.sha256().to_string()),
        ))
    }

    fn check_abort(&self) -> Result<(), AppleReleaseError> {
        if self.abort.is_aborted() {
            Err(AppleReleaseError::Aborted)
        } else {
            Ok(())
        }
    }

    fn install(&self, bundle: &AppBundle) -> Result<(), AppleReleaseError> {
        let dest = self.install_dir.join(bundle.name());
        warn!("installing {} to {}", bundle.name(), dest.display());

        if dest.is_dir() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_tree(bundle.root_dir(), &dest)
    }
}

/// Open a path with the default handler, as if double-clicked in Finder.
fn open_path(path: &Path) -> Result<(), AppleReleaseError> {
    info!("opening {}", path.display());
    let exe = AppleTool::Open.find_exe()?;

    let output = run_logged(&exe, args([path]), "open")?;
    if output.success {
        Ok(())
    } else {
        Err(AppleReleaseError::ToolInvocation {
            program: "open".into(),
            diagnostic: output.output,
        })
    }
}
