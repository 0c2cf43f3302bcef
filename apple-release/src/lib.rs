// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Release engineering for macOS application bundles.
//!
//! This crate turns the unsigned `.app` bundle produced by a build into a
//! signed, notarized and stapled disk image suitable for distribution outside
//! the Mac App Store. The heavy lifting is delegated to Apple's developer
//! tools (`codesign`, `security`, `hdiutil` and `xcrun notarytool/stapler`).
//! This crate decides what to invoke, in which order, and whether the result
//! is acceptable.
//!
//! # Pipeline
//!
//! A run performs the following for each requested architecture:
//!
//! 1. Resolve the signing identity from the keychain ([IdentityResolver]).
//!    When none is usable the run degrades to ad-hoc signing.
//! 2. Sign nested code, then the main executable, then the bundle itself
//!    ([SigningPlan], [BundleAssembler]).
//! 3. Verify the signatures ([SignatureVerifier]).
//! 4. Wrap the bundle into a signed disk image ([ArchivePackager]).
//! 5. Submit the disk image for notarization, wait for the verdict and staple
//!    the ticket ([NotarizationSubmitter]).
//!
//! [Pipeline] ties these together. Every external tool sits behind a trait
//! ([TrustStore], [CodeSigner], [SignatureInspector], [DiskImageBuilder],
//! [NotaryService] and [TicketStapler]) so the pipeline can be exercised
//! without Apple's tools.
//!
//! # Signing order
//!
//! Signing a container seals digests of everything inside it. Re-signing
//! anything nested afterwards invalidates the container's signature. Bundles
//! are therefore always signed inside-out according to an explicit, validated
//! plan. `codesign --deep` is never used.
//!
//! [IdentityResolver]: identity::IdentityResolver
//! [SigningPlan]: plan::SigningPlan
//! [BundleAssembler]: assembler::BundleAssembler
//! [SignatureVerifier]: verify::SignatureVerifier
//! [ArchivePackager]: packaging::ArchivePackager
//! [NotarizationSubmitter]: notarization::NotarizationSubmitter
//! [Pipeline]: pipeline::Pipeline
//! [TrustStore]: identity::TrustStore
//! [CodeSigner]: signing::CodeSigner
//! [SignatureInspector]: verify::SignatureInspector
//! [DiskImageBuilder]: packaging::DiskImageBuilder
//! [NotaryService]: notarization::NotaryService
//! [TicketStapler]: stapling::TicketStapler

pub mod artifact;
pub mod assembler;
pub mod bundle;
pub mod config;
pub mod entitlements;
pub mod error;
pub use error::*;
pub mod identity;
pub mod notarization;
pub mod packaging;
pub mod pipeline;
pub mod plan;
pub mod requirement;
pub mod signing;
pub mod stapling;
pub mod tool;
pub mod verify;

#[cfg(test)]
mod testutil;
