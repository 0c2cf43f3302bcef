// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signable artifacts.

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
};

/// The kind of entity receiving a signature.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ArtifactKind {
    /// A standalone executable shipped next to the main executable.
    HelperBinary,
    /// A framework bundle or dynamic library.
    Library,
    /// The executable named by `CFBundleExecutable`.
    MainExecutable,
    /// The `.app` directory itself.
    BundleContainer,
    /// The disk image wrapping the bundle.
    DistributionContainer,
}

impl ArtifactKind {
    /// Whether signatures for this kind carry the bundle's entitlements.
    pub fn requires_entitlements(&self) -> bool {
        matches!(self, Self::MainExecutable | Self::BundleContainer)
    }

    /// Whether signatures for this kind must enable the hardened runtime.
    ///
    /// Disk images are not code and have no runtime.
    pub fn requires_hardened_runtime(&self) -> bool {
        !matches!(self, Self::DistributionContainer)
    }

    /// Whether this kind is a container whose seal covers other artifacts.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::BundleContainer | Self::DistributionContainer)
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::HelperBinary => "helper binary",
            Self::Library => "library",
            Self::MainExecutable => "main executable",
            Self::BundleContainer => "bundle",
            Self::DistributionContainer => "disk image",
        })
    }
}

/// Anything that receives a signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    path: PathBuf,
    kind: ArtifactKind,
}

impl Artifact {
    pub fn new(path: impl AsRef<Path>, kind: ArtifactKind) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn requires_entitlements(&self) -> bool {
        self.kind.requires_entitlements()
    }

    pub fn requires_hardened_runtime(&self) -> bool {
        self.kind.requires_hardened_runtime()
    }

    /// Whether `other` lives inside this artifact on the filesystem.
    pub fn contains(&self, other: &Artifact) -> bool {
        other.path != self.path && other.path.starts_with(&self.path)
    }
}

impl Display for Artifact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}
