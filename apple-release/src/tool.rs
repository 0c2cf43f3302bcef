// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Invocation of external Apple command line tools.

use {
    crate::error::{AppleReleaseError, ConfigurationError},
    log::{error, info},
    std::{
        ffi::OsString,
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
    },
};

/// An external program the pipeline delegates to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppleTool {
    Codesign,
    Security,
    Hdiutil,
    Xcrun,
    Open,
}

impl AppleTool {
    /// Name of the executable as found on `PATH`.
    pub fn program_name(&self) -> &'static str {
        match self {
            Self::Codesign => "codesign",
            Self::Security => "security",
            Self::Hdiutil => "hdiutil",
            Self::Xcrun => "xcrun",
            Self::Open => "open",
        }
    }

    /// Environment variable that can override the executable location.
    pub fn env_variable(&self) -> &'static str {
        match self {
            Self::Codesign => "APPLE_RELEASE_CODESIGN_EXE",
            Self::Security => "APPLE_RELEASE_SECURITY_EXE",
            Self::Hdiutil => "APPLE_RELEASE_HDIUTIL_EXE",
            Self::Xcrun => "APPLE_RELEASE_XCRUN_EXE",
            Self::Open => "APPLE_RELEASE_OPEN_EXE",
        }
    }

    /// Find the executable to run.
    ///
    /// The environment variable override wins, then a `PATH` search, then
    /// `/usr/bin`, where Apple installs all of these.
    pub fn find_exe(&self) -> Result<PathBuf, AppleReleaseError> {
        self.find_exe_with(|name| std::env::var_os(name))
    }

    /// Find the executable, resolving environment variables through `get_env`.
    pub fn find_exe_with(
        &self,
        get_env: impl Fn(&str) -> Option<OsString>,
    ) -> Result<PathBuf, AppleReleaseError> {
        if let Some(path) = get_env(self.env_variable()) {
            Ok(PathBuf::from(path))
        } else if let Ok(path) = which::which(self.program_name()) {
            Ok(path)
        } else {
            let candidate = Path::new("/usr/bin").join(self.program_name());

            if candidate.exists() {
                Ok(candidate)
            } else {
                Err(ConfigurationError::ToolNotFound(self.program_name()).into())
            }
        }
    }
}

/// Captured result of running a tool to completion.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    /// Whether the process exited with status 0.
    pub success: bool,

    /// Combined stdout and stderr.
    pub output: String,
}

impl ToolOutput {
    /// Iterate over non-empty trimmed output lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().map(|l| l.trim()).filter(|l| !l.is_empty())
    }
}

/// Run a program with stdout and stderr merged, streaming output into the log.
///
/// A non-zero exit status is not an error here: callers decide what failure
/// means for their operation and surface the captured output verbatim.
pub fn run_logged(
    exe: &Path,
    args: Vec<OsString>,
    label: &str,
) -> Result<ToolOutput, AppleReleaseError> {
    info!("invoking {} with args: {:?}", exe.display(), args);

    let command = duct::cmd(exe, args)
        .stderr_to_stdout()
        .unchecked()
        .reader()
        .map_err(|e| AppleReleaseError::ToolInvocation {
            program: exe.display().to_string(),
            diagnostic: e.to_string(),
        })?;

    let mut output = String::new();
    {
        let mut reader = BufReader::new(&command);
        let mut buffer = Vec::new();
        while reader.read_until(b'\n', &mut buffer)? > 0 {
            let line = String::from_utf8_lossy(&buffer);
            let line = line.trim_end_matches(&['\r', '\n'][..]);
            info!("{}> {}", label, line);
            output.push_str(line);
            output.push('\n');
            buffer.clear();
        }
    }

    let status = command
        .try_wait()?
        .ok_or_else(|| AppleReleaseError::ToolInvocation {
            program: exe.display().to_string(),
            diagnostic: "unable to wait on command".into(),
        })?
        .status;

    if !status.success() {
        for line in output.lines() {
            error!("{} error> {}", label, line);
        }
    }

    Ok(ToolOutput {
        success: status.success(),
        output,
    })
}

/// Run a program and capture stdout only, without logging each line.
///
/// Used for tools emitting machine readable output (JSON) on stdout.
pub fn run_captured(exe: &Path, args: Vec<OsString>) -> Result<ToolOutput, AppleReleaseError> {
    info!("invoking {} with args: {:?}", exe.display(), args);

    let output = duct::cmd(exe, args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| AppleReleaseError::ToolInvocation {
            program: exe.display().to_string(),
            diagnostic: e.to_string(),
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }

    Ok(ToolOutput {
        success: output.status.success(),
        output: text,
    })
}

/// Convenience for building argument vectors mixing strings and paths.
pub fn args<I, S>(values: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    values.into_iter().map(Into::into).collect()
}
