// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Apple notarization functionality.

Notarization works by uploading a payload to Apple servers and waiting for
Apple to scan the submitted content. If Apple is appeased by your submission,
they issue a notarization ticket, which can be downloaded and *stapled* (just
a fancy word for *attached*) to the content you upload.

This module implements uploading a disk image through a [NotaryService],
waiting on the verdict and stapling the ticket through a
[crate::stapling::TicketStapler].
*/

use {
    crate::{
        error::{AppleReleaseError, ConfigurationError},
        stapling::{StapleOutcome, TicketStapler},
        tool::{args, run_captured, AppleTool},
    },
    log::{error, info, warn},
    serde::Deserialize,
    sha2::Digest,
    std::{
        ffi::OsString,
        fmt::{Debug, Display, Formatter},
        fs::File,
        io::Read,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
};

/// Default time between notarization status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Longest sleep between abort signal checks while waiting.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// App Store Connect API key material.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum KeyMaterial {
    /// Path to a `.p8` private key file.
    Path(PathBuf),
    /// PEM content of a `.p8` private key.
    Inline(String),
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

/// Credentials for talking to the notary service.
///
/// Every field must be present to notarize. Presence is all that is checked
/// locally.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct NotarizationCredentials {
    /// Written as `key: {path: ...}` or `key: {inline: ...}` in YAML.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub key: Option<KeyMaterial>,
    pub key_id: Option<String>,
    pub issuer_id: Option<String>,
}

impl NotarizationCredentials {
    pub fn is_complete(&self) -> bool {
        self.key.is_some() && self.key_id.is_some() && self.issuer_id.is_some()
    }

    /// Overlay fields present in `other` onto this instance.
    pub fn merge(&mut self, other: NotarizationCredentials) {
        if other.key.is_some() {
            self.key = other.key;
        }
        if other.key_id.is_some() {
            self.key_id = other.key_id;
        }
        if other.issuer_id.is_some() {
            self.issuer_id = other.issuer_id;
        }
    }
}

/// A flag an operator can raise to stop waiting on the notary service.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status of a submission as reported by the notary service.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum SubmissionStatus {
    Accepted,
    #[serde(rename = "In Progress")]
    InProgress,
    Invalid,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl SubmissionStatus {
    /// Whether the service has reached a verdict.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl Display for SubmissionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accepted => "Accepted",
            Self::InProgress => "In Progress",
            Self::Invalid => "Invalid",
            Self::Rejected => "Rejected",
            Self::Unknown => "Unknown",
        })
    }
}

/// Output of `notarytool submit --output-format json`.
#[derive(Clone, Debug, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub message: Option<String>,
}

/// Output of `notarytool info --output-format json`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionInfo {
    pub id: String,
    pub status: SubmissionStatus,
    pub message: Option<String>,
    pub created_date: Option<String>,
    pub name: Option<String>,
}

/// A single problem found by the notary service.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotaryLogIssue {
    pub severity: Option<String>,
    pub path: Option<String>,
    pub message: String,
    pub architecture: Option<String>,
}

/// The developer log of a completed submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotaryLog {
    pub status_summary: Option<String>,
    #[serde(default)]
    pub issues: Vec<NotaryLogIssue>,
}

/// The remote notary service.
pub trait NotaryService: Send + Sync {
    /// Upload a file. Returns the submission ID.
    fn submit(&self, path: &Path) -> Result<String, AppleReleaseError>;

    /// Query the status of a submission.
    fn status(&self, submission_id: &str) -> Result<SubmissionInfo, AppleReleaseError>;

    /// Obtain the raw developer log of a submission.
    fn log(&self, submission_id: &str) -> Result<String, AppleReleaseError>;
}

/// A [NotaryService] using `xcrun notarytool` with an App Store Connect API key.
pub struct NotarytoolClient {
    xcrun_exe: PathBuf,
    key: KeyMaterial,
    key_id: String,
    issuer_id: String,
}

impl NotarytoolClient {
    pub fn new(credentials: &NotarizationCredentials) -> Result<Self, AppleReleaseError> {
        Self::with_exe(AppleTool::Xcrun.find_exe()?, credentials)
    }

    pub fn with_exe(
        exe: impl Into<PathBuf>,
        credentials: &NotarizationCredentials,
    ) -> Result<Self, AppleReleaseError> {
        match (
            &credentials.key,
            &credentials.key_id,
            &credentials.issuer_id,
        ) {
            (Some(key), Some(key_id), Some(issuer_id)) => Ok(Self {
                xcrun_exe: exe.into(),
                key: key.clone(),
                key_id: key_id.clone(),
                issuer_id: issuer_id.clone(),
            }),
            _ => Err(ConfigurationError::IncompleteNotarizationCredentials.into()),
        }
    }

    /// Run a `notarytool` subcommand with authentication arguments.
    ///
    /// Inline key material is written to a private temporary file which lives
    /// for the duration of the call.
    fn run(&self, subcommand_args: Vec<OsString>) -> Result<String, AppleReleaseError> {
        let mut key_file = None;

        let key_path = match &self.key {
            KeyMaterial::Path(path) => path.clone(),
            KeyMaterial::Inline(pem) => {
                let mut temp = tempfile::Builder::new()
                    .prefix("AuthKey_")
                    .suffix(".p8")
                    .tempfile()?;
                std::io::Write::write_all(&mut temp, pem.as_bytes())?;
                let path = temp.path().to_path_buf();
                key_file = Some(temp);
                path
            }
        };

        let mut arguments = args(["notarytool"]);
        arguments.extend(subcommand_args);
        arguments.extend(args(["--key".into(), key_path.into_os_string()]));
        arguments.extend(args([
            "--key-id",
            self.key_id.as_str(),
            "--issuer",
            self.issuer_id.as_str(),
        ]));

        let output = run_captured(&self.xcrun_exe, arguments)?;
        drop(key_file);

        if output.success {
            Ok(output.output)
        } else {
            for line in output.lines() {
                error!("notarytool error> {}", line);
            }

            Err(AppleReleaseError::ToolInvocation {
                program: "xcrun notarytool".into(),
                diagnostic: output.output,
            })
        }
    }
}

impl NotaryService for NotarytoolClient {
    fn submit(&self, path: &Path) -> Result<String, AppleReleaseError> {
        let mut arguments = args(["submit"]);
        arguments.push(path.into());
        arguments.extend(args(["--output-format", "json"]));

        let response: SubmitResponse = serde_json::from_str(&self.run(arguments)?)?;

        if let Some(message) = &response.message {
            info!("notary service: {}", message);
        }

        Ok(response.id)
    }

    fn status(&self, submission_id: &str) -> Result<SubmissionInfo, AppleReleaseError> {
        let output = self.run(args(["info", submission_id, "--output-format", "json"]))?;

        Ok(serde_json::from_str(&output)?)
    }

    fn log(&self, submission_id: &str) -> Result<String, AppleReleaseError> {
        self.run(args(["log", submission_id]))
    }
}

/// Where a container is in the notarization process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotarizationState {
    NotStarted,
    Submitted,
    Accepted,
    Rejected,
    Stapled,
}

impl NotarizationState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: NotarizationState) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Submitted)
                | (Self::Submitted, Self::Accepted)
                | (Self::Submitted, Self::Rejected)
                | (Self::Accepted, Self::Stapled)
        )
    }
}

/// Proof of notarization for a specific container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotarizationTicket {
    pub submission_id: String,
    pub container_sha256: String,
}

/// Tracks a container through notarization.
#[derive(Clone, Debug)]
pub struct NotarizationSubmission {
    container: PathBuf,
    sha256: String,
    submission_id: Option<String>,
    state: NotarizationState,
    ticket: Option<NotarizationTicket>,
}

impl NotarizationSubmission {
    /// Start tracking a container, computing its content digest.
    pub fn new(container: impl AsRef<Path>) -> Result<Self, AppleReleaseError> {
        let container = container.as_ref().to_path_buf();
        let sha256 = sha256_path(&container)?;

        Ok(Self {
            container,
            sha256,
            submission_id: None,
            state: NotarizationState::NotStarted,
            ticket: None,
        })
    }

    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Hex SHA-256 of the container at submission time.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn submission_id(&self) -> Option<&str> {
        self.submission_id.as_deref()
    }

    pub fn state(&self) -> NotarizationState {
        self.state
    }

    pub fn ticket(&self) -> Option<&NotarizationTicket> {
        self.ticket.as_ref()
    }

    fn transition(&mut self, next: NotarizationState) -> Result<(), AppleReleaseError> {
        if !self.state.can_transition_to(next) {
            return Err(AppleReleaseError::NotaryResponse(format!(
                "illegal notarization transition {:?} -> {:?}",
                self.state, next
            )));
        }

        info!(
            "notarization of {}: {:?} -> {:?}",
            self.container.display(),
            self.state,
            next
        );
        self.state = next;

        Ok(())
    }
}

/// Compute the hex SHA-256 of a file's content.
pub fn sha256_path(path: &Path) -> Result<String, AppleReleaseError> {
    let mut fh = File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = [0u8; 16384];

    loop {
        let count = fh.read(&mut buffer)?;
        if count == 0 {
            break;
        }

        hasher.update(&buffer[0..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Drives a container through submission, verdict and stapling.
pub struct NotarizationSubmitter<'a> {
    service: &'a dyn NotaryService,
    stapler: &'a dyn TicketStapler,

    /// How long to wait between polling the service for status.
    poll_interval: Duration,

    abort: AbortSignal,
}

impl<'a> NotarizationSubmitter<'a> {
    pub fn new(service: &'a dyn NotaryService, stapler: &'a dyn TicketStapler) -> Self {
        Self {
            service,
            stapler,
            poll_interval: DEFAULT_POLL_INTERVAL,
            abort: AbortSignal::new(),
        }
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn set_abort_signal(&mut self, abort: AbortSignal) {
        self.abort = abort;
    }

    /// Notarize and staple a container.
    ///
    /// There is no client side timeout: this waits until the service reaches
    /// a verdict or the abort signal is raised.
    pub fn notarize(&self, container: &Path) -> Result<NotarizationSubmission, AppleReleaseError> {
        let mut submission = NotarizationSubmission::new(container)?;

        warn!(
            "submitting {} (sha256 {}) for notarization",
            container.display(),
            submission.sha256()
        );
        let submission_id = self.service.submit(container)?;
        warn!("notarization submission ID: {}", submission_id);
        submission.submission_id = Some(submission_id.clone());
        submission.transition(NotarizationState::Submitted)?;

        let info = self.wait_for_verdict(&submission_id)?;

        if info.status != SubmissionStatus::Accepted {
            submission.transition(NotarizationState::Rejected)?;

            return Err(AppleReleaseError::NotarizationRejected {
                reason: self.rejection_reason(&info),
                submission_id,
            });
        }

        submission.transition(NotarizationState::Accepted)?;
        submission.ticket = Some(NotarizationTicket {
            submission_id,
            container_sha256: submission.sha256.clone(),
        });

        match self.stapler.staple(container) {
            Ok(StapleOutcome::Stapled) => {
                warn!("notarization ticket stapled to {}", container.display());
            }
            Ok(StapleOutcome::AlreadyStapled) => {}
            Err(e) => {
                error!(
                    "stapling {} failed after the notary service accepted it",
                    container.display()
                );

                return Err(AppleReleaseError::StaplingInconsistency {
                    path: container.to_path_buf(),
                    diagnostic: e.to_string(),
                });
            }
        }

        submission.transition(NotarizationState::Stapled)?;

        Ok(submission)
    }

    /// Poll the service until the submission reaches a terminal status.
    pub fn wait_for_verdict(
        &self,
        submission_id: &str,
    ) -> Result<SubmissionInfo, AppleReleaseError> {
        warn!(
            "waiting for notary service to process submission {}",
            submission_id
        );

        let start_time = Instant::now();

        loop {
            if self.abort.is_aborted() {
                warn!("abandoning wait on submission {}", submission_id);
                return Err(AppleReleaseError::Aborted);
            }

            let info = self.service.status(submission_id)?;

            info!(
                "poll state after {}s: {}",
                start_time.elapsed().as_secs(),
                info.status
            );

            if info.status.is_terminal() {
                warn!("notary service verdict: {}", info.status);
                return Ok(info);
            }

            self.sleep_interruptibly();
        }
    }

    fn sleep_interruptibly(&self) {
        let deadline = Instant::now() + self.poll_interval;

        loop {
            let now = Instant::now();
            if now >= deadline || self.abort.is_aborted() {
                return;
            }

            std::thread::sleep(std::cmp::min(deadline - now, ABORT_CHECK_INTERVAL));
        }
    }

    /// The service's message plus its developer log, verbatim.
    fn rejection_reason(&self, info: &SubmissionInfo) -> String {
        let mut reason = format!(
            "{}: {}",
            info.status,
            info.message.as_deref().unwrap_or("no message")
        );

        match self.service.log(&info.id) {
            Ok(log) => {
                for line in log.lines() {
                    warn!("notary log> {}", line);
                }

                if let Ok(parsed) = serde_json::from_str::<NotaryLog>(&log) {
                    for issue in &parsed.issues {
                        error!(
                            "{}: {}",
                            issue.path.as_deref().unwrap_or("<container>"),
                            issue.message
                        );
                    }
                }

                reason.push('\n');
                reason.push_str(&log);
            }
            Err(e) => {
                warn!("unable to fetch notary log: {}", e);
            }
        }

        reason
    }
}
