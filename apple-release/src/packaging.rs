// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk image packaging.

use {
    crate::{
        artifact::{Artifact, ArtifactKind},
        bundle::{create_symlink, AppBundle},
        error::AppleReleaseError,
        identity::SigningIdentity,
        requirement::DesignatedRequirement,
        signing::{CodeSigner, SignRequest, SignatureSummary},
        tool::{args, run_logged, AppleTool},
    },
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Creates disk images from a directory.
pub trait DiskImageBuilder: Send + Sync {
    /// Create a compressed disk image at `output` with the content of `source_dir`.
    ///
    /// `output` does not exist when this is called. On failure the
    /// implementation may leave a partial file behind.
    fn create_image(
        &self,
        volume_name: &str,
        source_dir: &Path,
        output: &Path,
    ) -> Result<(), AppleReleaseError>;
}

/// A [DiskImageBuilder] invoking `hdiutil`.
pub struct HdiutilImageBuilder {
    exe: PathBuf,
}

impl HdiutilImageBuilder {
    pub fn new() -> Result<Self, AppleReleaseError> {
        Ok(Self::with_exe(AppleTool::Hdiutil.find_exe()?))
    }

    pub fn with_exe(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl DiskImageBuilder for HdiutilImageBuilder {
    fn create_image(
        &self,
        volume_name: &str,
        source_dir: &Path,
        output: &Path,
    ) -> Result<(), AppleReleaseError> {
        let mut arguments = args(["create", "-volname", volume_name, "-srcfolder"]);
        arguments.push(source_dir.into());
        arguments.extend(args(["-ov", "-format", "UDZO"]));
        arguments.push(output.into());

        let output_res = run_logged(&self.exe, arguments, "hdiutil")?;

        if output_res.success {
            Ok(())
        } else {
            Err(AppleReleaseError::PackagingFailure {
                path: output.to_path_buf(),
                diagnostic: output_res.output,
            })
        }
    }
}

/// A signed disk image ready for notarization.
#[derive(Clone, Debug)]
pub struct DistributionContainer {
    path: PathBuf,
    identifier: String,
    signature: SignatureSummary,
}

impl DistributionContainer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Code identifier the container was signed with.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn signature(&self) -> &SignatureSummary {
        &self.signature
    }

    pub fn artifact(&self) -> Artifact {
        Artifact::new(&self.path, ArtifactKind::DistributionContainer)
    }

    /// The requirement the container signature was pinned to.
    pub fn designated_requirement(&self, team_id: Option<&str>) -> DesignatedRequirement {
        DesignatedRequirement::new(&self.identifier).with_team_id(team_id)
    }
}

/// Wraps a signed bundle into a signed disk image.
pub struct ArchivePackager<'a> {
    builder: &'a dyn DiskImageBuilder,
    signer: &'a dyn CodeSigner,
}

impl<'a> ArchivePackager<'a> {
    pub fn new(builder: &'a dyn DiskImageBuilder, signer: &'a dyn CodeSigner) -> Self {
        Self { builder, signer }
    }

    /// Produce a signed disk image at `output` containing `bundle`.
    ///
    /// Any existing file at `output` is replaced. The image contains the
    /// bundle next to an `Applications` symlink for drag-and-drop installs.
    /// If image creation or signing fails no file is left at `output`.
    pub fn package(
        &self,
        bundle: &AppBundle,
        output: &Path,
        identity: Option<&SigningIdentity>,
    ) -> Result<DistributionContainer, AppleReleaseError> {
        let staging = tempfile::Builder::new()
            .prefix("apple-release-dmg-")
            .tempdir()?;
        let staging_dir = staging.path().join(bundle.stem());
        std::fs::create_dir_all(&staging_dir)?;

        bundle.copy_to(&staging_dir.join(bundle.name()))?;
        create_symlink(Path::new("/Applications"), &staging_dir.join("Applications"))?;

        if output.exists() {
            info!("removing existing {}", output.display());
            std::fs::remove_file(output)?;
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        warn!("creating disk image {}", output.display());
        if let Err(e) = self
            .builder
            .create_image(bundle.stem(), &staging_dir, output)
        {
            if output.exists() {
                warn!("removing partial disk image {}", output.display());
                std::fs::remove_file(output)?;
            }

            return Err(match e {
                AppleReleaseError::PackagingFailure { .. } => e,
                e => AppleReleaseError::PackagingFailure {
                    path: output.to_path_buf(),
                    diagnostic: e.to_string(),
                },
            });
        }

        match self.sign_image(bundle, output, identity) {
            Ok(container) => Ok(container),
            Err(e) => {
                if output.exists() {
                    warn!("removing unsigned disk image {}", output.display());
                    std::fs::remove_file(output)?;
                }

                Err(e)
            }
        }
    }

    fn sign_image(
        &self,
        bundle: &AppBundle,
        output: &Path,
        identity: Option<&SigningIdentity>,
    ) -> Result<DistributionContainer, AppleReleaseError> {
        let identifier = bundle.identifier()?;
        let artifact = Artifact::new(output, ArtifactKind::DistributionContainer);
        let mut request = SignRequest::for_artifact(&artifact, identity, None);

        if let Some(identity) = identity {
            request.set_identifier(&identifier);
            request.set_designated_requirement(Some(
                DesignatedRequirement::new(&identifier).with_team_id(identity.team_id.as_deref()),
            ));
        }

        let signature = self.signer.sign(&request)?;

        Ok(DistributionContainer {
            path: output.to_path_buf(),
            identifier,
            signature,
        })
    }
}
