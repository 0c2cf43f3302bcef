// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Attach Apple notarization tickets to signed entities.

Stapling refers to the act of taking an Apple issued notarization
ticket (generated after uploading content to Apple for inspection)
and attaching that ticket to the entity that was uploaded, so
Gatekeeper can verify it without a network lookup.
*/

use {
    crate::{
        error::AppleReleaseError,
        tool::{args, run_logged, AppleTool},
    },
    log::warn,
    std::path::{Path, PathBuf},
};

/// Result of a stapling attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StapleOutcome {
    /// A ticket was attached.
    Stapled,
    /// A valid ticket was already attached. Nothing was modified.
    AlreadyStapled,
}

/// Attaches notarization tickets to containers.
pub trait TicketStapler: Send + Sync {
    /// Whether a valid ticket is already attached.
    fn is_stapled(&self, path: &Path) -> Result<bool, AppleReleaseError>;

    /// Fetch and attach the ticket unconditionally.
    fn attach(&self, path: &Path) -> Result<(), AppleReleaseError>;

    /// Staple a ticket unless one is already present.
    fn staple(&self, path: &Path) -> Result<StapleOutcome, AppleReleaseError> {
        if self.is_stapled(path)? {
            warn!("{} already has a notarization ticket", path.display());
            return Ok(StapleOutcome::AlreadyStapled);
        }

        warn!("stapling notarization ticket to {}", path.display());
        self.attach(path)?;

        Ok(StapleOutcome::Stapled)
    }
}

/// A [TicketStapler] using `xcrun stapler`.
pub struct XcrunStapler {
    xcrun_exe: PathBuf,
}

impl XcrunStapler {
    pub fn new() -> Result<Self, AppleReleaseError> {
        Ok(Self::with_exe(AppleTool::Xcrun.find_exe()?))
    }

    pub fn with_exe(exe: impl Into<PathBuf>) -> Self {
        Self {
            xcrun_exe: exe.into(),
        }
    }
}

impl TicketStapler for XcrunStapler {
    fn is_stapled(&self, path: &Path) -> Result<bool, AppleReleaseError> {
        let mut arguments = args(["stapler", "validate", "-q"]);
        arguments.push(path.into());

        Ok(run_logged(&self.xcrun_exe, arguments, "stapler")?.success)
    }

    fn attach(&self, path: &Path) -> Result<(), AppleReleaseError> {
        let mut arguments = args(["stapler", "staple"]);
        arguments.push(path.into());

        let output = run_logged(&self.xcrun_exe, arguments, "stapler")?;

        if output.success {
            Ok(())
        } else {
            Err(AppleReleaseError::ToolInvocation {
                program: "xcrun stapler staple".into(),
                diagnostic: output.output,
            })
        }
    }
}
