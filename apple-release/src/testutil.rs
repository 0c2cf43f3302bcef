// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures and in-process stand-ins for the Apple developer tools.
//!
//! The fakes persist their state in the files they operate on so that
//! tampering after signing is detectable the same way it is with real
//! signatures. Signed files get a trailer describing the signature. Signed
//! directories get a seal recording a digest of every file they contain.

use {
    crate::{
        bundle::AppBundle,
        entitlements::Entitlements,
        error::AppleReleaseError,
        identity::{SigningIdentity, TrustStore},
        notarization::{NotaryService, SubmissionInfo, SubmissionStatus},
        packaging::DiskImageBuilder,
        pipeline::Toolchain,
        plan::SigningPlan,
        requirement::DesignatedRequirement,
        signing::{CodeSigner, SignRequest, SignatureSummary},
        stapling::TicketStapler,
        verify::{CheckOutcome, SignatureInspector, Strictness, VerificationCheck},
    },
    anyhow::{anyhow, Result},
    serde::{Deserialize, Serialize},
    sha2::Digest,
    std::{
        collections::{BTreeMap, HashSet},
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
};

pub const NETWORK_ENTITLEMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>com.apple.security.network.client</key>
    <true/>
    <key>com.apple.security.network.server</key>
    <true/>
</dict>
</plist>
"#;

const SIGNATURE_MARKER: &[u8] = b"\n#fake-codesign#";
const TICKET_MARKER: &[u8] = b"\n#fake-ticket#";

pub fn temp_dir() -> Result<(tempfile::TempDir, PathBuf)> {
    let td = tempfile::Builder::new()
        .prefix("apple-release-test-")
        .tempdir()?;
    let path = td.path().to_path_buf();

    Ok((td, path))
}

pub fn test_identity() -> SigningIdentity {
    SigningIdentity::new(
        "Test Signer (ABCDE12345)",
        "0123456789abcdef0123456789abcdef01234567",
    )
}

/// Write an executable shell script standing in for a tool.
#[cfg(unix)]
pub fn fake_tool_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;

    Ok(path)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Split `data` at the last occurrence of `marker`.
fn split_trailer<'a>(data: &'a [u8], marker: &[u8]) -> (&'a [u8], Option<&'a [u8]>) {
    match rfind(data, marker) {
        Some(pos) => (&data[..pos], Some(&data[pos + marker.len()..])),
        None => (data, None),
    }
}

/// The pieces of a file touched by the fakes.
struct FileParts {
    content: Vec<u8>,
    signature: Option<SignatureRecord>,
    ticket: Option<Ticket>,
}

impl FileParts {
    fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let (rest, ticket) = split_trailer(&data, TICKET_MARKER);
        let (content, signature) = split_trailer(rest, SIGNATURE_MARKER);

        Ok(Self {
            content: content.to_vec(),
            signature: signature.map(serde_json::from_slice).transpose()?,
            ticket: ticket.map(serde_json::from_slice).transpose()?,
        })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut data = self.content.clone();
        if let Some(signature) = &self.signature {
            data.extend_from_slice(SIGNATURE_MARKER);
            data.extend(serde_json::to_vec(signature)?);
        }
        if let Some(ticket) = &self.ticket {
            data.extend_from_slice(TICKET_MARKER);
            data.extend(serde_json::to_vec(ticket)?);
        }

        std::fs::write(path, data)?;
        Ok(())
    }

    /// Digest of the signed file as the notary service sees it.
    fn notarized_digest(&self) -> Result<String> {
        let mut data = self.content.clone();
        if let Some(signature) = &self.signature {
            data.extend_from_slice(SIGNATURE_MARKER);
            data.extend(serde_json::to_vec(signature)?);
        }

        Ok(sha256_hex(&data))
    }
}

/// What the fake signer recorded about a signature.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignatureRecord {
    /// Digest of the signed content.
    pub digest: String,
    pub identity: Option<String>,
    pub team_id: Option<String>,
    pub timestamped: bool,
    pub hardened_runtime: bool,
    /// Granted entitlement keys.
    pub entitlements: Vec<String>,
    pub entitlements_path: Option<PathBuf>,
    pub requirement: Option<String>,
    pub identifier: String,
    /// Distinguishes otherwise identical signatures.
    pub serial: usize,
}

impl SignatureRecord {
    fn summary(&self) -> SignatureSummary {
        SignatureSummary {
            identity: self.identity.clone(),
            timestamped: self.timestamped,
            hardened_runtime: self.hardened_runtime,
            entitlements: self.entitlements_path.clone(),
            designated_requirement: self.requirement.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct DirectorySeal {
    record: SignatureRecord,
    files: BTreeMap<String, String>,
}

fn seal_path(dir: &Path) -> PathBuf {
    let base = if dir.join("Contents").is_dir() {
        dir.join("Contents")
    } else {
        dir.to_path_buf()
    };

    base.join("_CodeSignature").join("CodeResources")
}

/// Digest every file under a directory except its own seal.
fn directory_files(dir: &Path) -> Result<BTreeMap<String, String>> {
    let seal = seal_path(dir);
    let mut files = BTreeMap::new();

    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type().is_dir() || path == seal {
            continue;
        }

        let rel = path.strip_prefix(dir)?.to_string_lossy().to_string();
        let digest = if entry.path_is_symlink() {
            format!("symlink:{}", std::fs::read_link(path)?.display())
        } else {
            sha256_hex(&std::fs::read(path)?)
        };

        files.insert(rel, digest);
    }

    Ok(files)
}

fn read_seal(dir: &Path) -> Result<DirectorySeal> {
    let path = seal_path(dir);
    let data = std::fs::read(&path).map_err(|_| anyhow!("{} is not signed", dir.display()))?;

    Ok(serde_json::from_slice(&data)?)
}

/// Read the signature record of a signed file or directory.
fn read_record(path: &Path) -> Result<SignatureRecord> {
    if path.is_dir() {
        Ok(read_seal(path)?.record)
    } else {
        FileParts::read(path)?
            .signature
            .ok_or_else(|| anyhow!("{} is not signed", path.display()))
    }
}

/// Whether a signature still matches the content it covers.
fn structural_problem(path: &Path) -> Result<Option<String>> {
    if path.is_dir() {
        let seal = match read_seal(path) {
            Ok(seal) => seal,
            Err(e) => return Ok(Some(e.to_string())),
        };
        let current = directory_files(path)?;

        for (name, digest) in &current {
            match seal.files.get(name) {
                None => return Ok(Some(format!("file added: {}", name))),
                Some(sealed) if sealed != digest => {
                    return Ok(Some(format!("file modified: {}", name)))
                }
                _ => {}
            }
        }
        for name in seal.files.keys() {
            if !current.contains_key(name) {
                return Ok(Some(format!("file missing: {}", name)));
            }
        }

        Ok(None)
    } else {
        let parts = FileParts::read(path)?;

        Ok(match parts.signature {
            None => Some(format!("{}: code object is not signed at all", path.display())),
            Some(record) if record.digest != sha256_hex(&parts.content) => {
                Some(format!("{}: invalid signature", path.display()))
            }
            Some(_) => None,
        })
    }
}

/// Like [structural_problem] but also requires nested code to be valid.
fn deep_problem(path: &Path) -> Result<Option<String>> {
    if let Some(problem) = structural_problem(path)? {
        return Ok(Some(problem));
    }
    if !path.is_dir() {
        return Ok(None);
    }

    let executables_dir = path.join("Contents").join("MacOS");

    for entry in walkdir::WalkDir::new(path).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let nested = entry.path();
        if entry.path_is_symlink() {
            continue;
        }

        let is_code = if entry.file_type().is_dir() {
            nested.extension().map(|e| e == "framework").unwrap_or(false)
        } else {
            nested.extension().map(|e| e == "dylib").unwrap_or(false)
                || nested.parent() == Some(executables_dir.as_path())
        };

        if is_code {
            if let Some(problem) = structural_problem(nested)? {
                return Ok(Some(format!("nested code invalid: {}", problem)));
            }
        }
    }

    Ok(None)
}

/// A [TrustStore] with a fixed set of identities.
#[derive(Clone)]
pub struct StaticTrustStore {
    identities: Option<Vec<SigningIdentity>>,
}

impl StaticTrustStore {
    pub fn new(identities: Vec<SigningIdentity>) -> Self {
        Self {
            identities: Some(identities),
        }
    }

    /// A trust store that can't be queried.
    pub fn failing() -> Self {
        Self { identities: None }
    }
}

impl TrustStore for StaticTrustStore {
    fn identities(&self) -> Result<Vec<SigningIdentity>, AppleReleaseError> {
        self.identities
            .clone()
            .ok_or_else(|| AppleReleaseError::ToolInvocation {
                program: "security".into(),
                diagnostic: "security: SecKeychainSearchCopyNext: The specified keychain could not be found.".into(),
            })
    }
}

/// Builds unsigned bundles resembling build system output.
pub struct UnsignedBundle {
    dir: PathBuf,
    name: String,
    identifier: String,
    executable: String,
    helpers: Vec<String>,
    frameworks: Vec<PathBuf>,
    dylibs: Vec<String>,
}

impl UnsignedBundle {
    pub fn new(dir: &Path, name: &str, identifier: &str, executable: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            identifier: identifier.to_string(),
            executable: executable.to_string(),
            helpers: vec![],
            frameworks: vec![],
            dylibs: vec![],
        }
    }

    pub fn helper(mut self, name: &str) -> Self {
        self.helpers.push(name.to_string());
        self
    }

    /// Add a framework to `Contents/Frameworks`.
    pub fn framework(mut self, name: &str) -> Self {
        self.frameworks.push(PathBuf::from(name));
        self
    }

    /// Add a framework inside another framework's `Frameworks` directory.
    pub fn nested_framework(mut self, outer: &str, inner: &str) -> Self {
        self.frameworks.push(
            PathBuf::from(outer)
                .join("Versions")
                .join("A")
                .join("Frameworks")
                .join(inner),
        );
        self
    }

    pub fn dylib(mut self, name: &str) -> Self {
        self.dylibs.push(name.to_string());
        self
    }

    pub fn create(self) -> Result<PathBuf> {
        let root = self.dir.join(&self.name);
        let contents = root.join("Contents");
        let macos = contents.join("MacOS");
        let resources = contents.join("Resources");
        let frameworks = contents.join("Frameworks");

        std::fs::create_dir_all(&macos)?;
        std::fs::create_dir_all(&resources)?;

        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleIdentifier".into(),
            plist::Value::String(self.identifier.clone()),
        );
        info.insert(
            "CFBundleExecutable".into(),
            plist::Value::String(self.executable.clone()),
        );
        info.insert("CFBundlePackageType".into(), plist::Value::String("APPL".into()));
        plist::Value::from(info).to_file_xml(contents.join("Info.plist"))?;

        write_binary(&macos.join(&self.executable))?;
        for helper in &self.helpers {
            write_binary(&macos.join(helper))?;
        }

        std::fs::write(
            resources.join(format!("{}.entitlements", self.executable)),
            NETWORK_ENTITLEMENTS,
        )?;

        for framework in &self.frameworks {
            let framework_dir = frameworks.join(framework);
            let stem = framework_dir
                .file_stem()
                .ok_or_else(|| anyhow!("invalid framework name"))?
                .to_string_lossy()
                .to_string();
            let version_dir = framework_dir.join("Versions").join("A");
            std::fs::create_dir_all(version_dir.join("Resources"))?;
            write_binary(&version_dir.join(stem))?;
        }

        if !self.dylibs.is_empty() {
            std::fs::create_dir_all(&frameworks)?;
        }
        for dylib in &self.dylibs {
            write_binary(&frameworks.join(dylib))?;
        }

        Ok(root)
    }
}

fn write_binary(path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    std::fs::write(path, format!("\u{cf}\u{fa}\u{ed}\u{fe} mach-o {}", name))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

#[derive(Default)]
struct SignerState {
    failures: HashSet<PathBuf>,
}

/// A [CodeSigner] writing fake signatures.
#[derive(Clone, Default)]
pub struct FakeSigner {
    state: Arc<Mutex<SignerState>>,
    count: Arc<AtomicUsize>,
}

impl FakeSigner {
    /// The signature currently on a path.
    pub fn record(&self, path: &Path) -> Result<SignatureRecord> {
        read_record(path)
    }

    /// Make signing a path fail.
    pub fn fail_on(&self, path: PathBuf) {
        self.lock().failures.insert(path);
    }

    /// Number of signatures produced.
    pub fn sign_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sign_path(&self, request: &SignRequest) -> Result<()> {
        let path = request.path();
        let serial = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        let identifier = match request.identifier() {
            Some(identifier) => identifier.to_string(),
            None if path.is_dir() => AppBundle::new_from_path(path)
                .ok()
                .and_then(|b| b.identifier().ok())
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
                .unwrap_or_default(),
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        let mut record = SignatureRecord {
            digest: String::new(),
            identity: request.identity().map(|i| i.name.clone()),
            team_id: request.identity().and_then(|i| i.team_id.clone()),
            timestamped: request.timestamp(),
            hardened_runtime: request.hardened_runtime(),
            entitlements: request
                .entitlements()
                .map(|e| e.keys().map(|k| k.to_string()).collect())
                .unwrap_or_default(),
            entitlements_path: request.entitlements().map(|e| e.path().to_path_buf()),
            requirement: request.designated_requirement().map(|r| r.expression()),
            identifier,
            serial,
        };

        if path.is_dir() {
            let files = directory_files(path)?;
            record.digest = sha256_hex(&serde_json::to_vec(&files)?);

            let seal = seal_path(path);
            if let Some(parent) = seal.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&seal, serde_json::to_vec(&DirectorySeal { record, files })?)?;
        } else {
            let mut parts = FileParts::read(path)?;
            record.digest = sha256_hex(&parts.content);
            parts.signature = Some(record);
            parts.ticket = None;
            parts.write(path)?;
        }

        Ok(())
    }
}

impl CodeSigner for FakeSigner {
    fn sign(&self, request: &SignRequest) -> Result<SignatureSummary, AppleReleaseError> {
        request.check_preconditions()?;

        if self.lock().failures.contains(request.path()) {
            return Err(AppleReleaseError::SignFailure {
                path: request.path().to_path_buf(),
                diagnostic: format!(
                    "{}: errSecInternalComponent",
                    request.path().display()
                ),
            });
        }

        self.sign_path(request)
            .map_err(|e| AppleReleaseError::SignFailure {
                path: request.path().to_path_buf(),
                diagnostic: e.to_string(),
            })?;

        Ok(request.expected_signature())
    }
}

fn inspection_error(e: anyhow::Error) -> AppleReleaseError {
    AppleReleaseError::ToolInvocation {
        program: "codesign".into(),
        diagnostic: e.to_string(),
    }
}

/// A [SignatureInspector] validating [FakeSigner] signatures.
#[derive(Clone, Default)]
pub struct FakeInspector;

impl SignatureInspector for FakeInspector {
    fn check_signature(
        &self,
        path: &Path,
        strictness: Strictness,
    ) -> Result<CheckOutcome, AppleReleaseError> {
        let (check, problem) = match strictness {
            Strictness::Shallow => (VerificationCheck::Structural, structural_problem(path)),
            Strictness::Deep => (VerificationCheck::Deep, deep_problem(path)),
        };

        Ok(match problem.map_err(inspection_error)? {
            None => CheckOutcome::pass(check),
            Some(reason) => CheckOutcome::fail(check, reason),
        })
    }

    fn test_requirement(
        &self,
        path: &Path,
        requirement: &DesignatedRequirement,
    ) -> Result<CheckOutcome, AppleReleaseError> {
        let check = VerificationCheck::DesignatedRequirement;

        let record = match read_record(path) {
            Ok(record) => record,
            Err(e) => return Ok(CheckOutcome::fail(check, e)),
        };

        Ok(if record.identity.is_none() {
            CheckOutcome::fail(
                check,
                "test-requirement: code failed to satisfy specified code requirement(s)",
            )
        } else if record.identifier != requirement.identifier() {
            CheckOutcome::fail(
                check,
                format!("identifier {} does not match", record.identifier),
            )
        } else if requirement.team_id().is_some()
            && record.team_id.as_deref() != requirement.team_id()
        {
            CheckOutcome::fail(check, "certificate leaf[subject.OU] does not match")
        } else {
            CheckOutcome::pass(check)
        })
    }

    fn describe(&self, path: &Path) -> Result<Option<SignatureSummary>, AppleReleaseError> {
        Ok(read_record(path).ok().map(|r| r.summary()))
    }
}

#[derive(Default)]
struct ImageState {
    fail: bool,
}

/// A [DiskImageBuilder] writing a manifest of the image content.
#[derive(Clone, Default)]
pub struct FakeImageBuilder {
    state: Arc<Mutex<ImageState>>,
}

impl FakeImageBuilder {
    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fail = fail;
    }

    /// Relative paths of everything in an image.
    pub fn manifest(&self, image: &Path) -> Result<Vec<String>> {
        let parts = FileParts::read(image)?;
        let content = String::from_utf8(parts.content)?;

        Ok(content.lines().skip(1).map(|l| l.to_string()).collect())
    }
}

impl DiskImageBuilder for FakeImageBuilder {
    fn create_image(
        &self,
        volume_name: &str,
        source_dir: &Path,
        output: &Path,
    ) -> Result<(), AppleReleaseError> {
        if self.state.lock().unwrap_or_else(|e| e.into_inner()).fail {
            std::fs::write(output, b"partial")?;

            return Err(AppleReleaseError::PackagingFailure {
                path: output.to_path_buf(),
                diagnostic: "hdiutil: create failed - resource busy".into(),
            });
        }

        let mut lines = vec![format!("volume: {}", volume_name)];
        for entry in walkdir::WalkDir::new(source_dir)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| AppleReleaseError::BundleLayout(e.into()))?;
            lines.push(rel.to_string_lossy().to_string());
        }

        std::fs::write(output, lines.join("\n"))?;
        Ok(())
    }
}

/// Proof of notarization attached by [FakeStapler].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ticket {
    pub digest: String,
}

type StatusHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct NotaryState {
    script: Vec<SubmissionStatus>,
    log: String,
    submissions: Vec<String>,
    accepted: HashSet<String>,
    status_count: usize,
    attach_count: usize,
    fail_staple: bool,
    on_status: Option<StatusHook>,
}

fn lock_notary(state: &Mutex<NotaryState>) -> std::sync::MutexGuard<'_, NotaryState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// A [NotaryService] returning scripted statuses.
///
/// Without a script every submission is accepted on the first poll.
#[derive(Clone)]
pub struct FakeNotary {
    state: Arc<Mutex<NotaryState>>,
}

impl FakeNotary {
    /// Statuses returned by successive polls. The last one repeats.
    pub fn set_script(&self, script: Vec<SubmissionStatus>) {
        lock_notary(&self.state).script = script;
    }

    pub fn set_log(&self, log: &str) {
        lock_notary(&self.state).log = log.to_string();
    }

    /// Run a callback on every status poll.
    pub fn on_status(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock_notary(&self.state).on_status = Some(Arc::new(hook));
    }

    pub fn status_count(&self) -> usize {
        lock_notary(&self.state).status_count
    }

    pub fn submit_count(&self) -> usize {
        lock_notary(&self.state).submissions.len()
    }

    /// Accept a file without a submission.
    pub fn accept_digest(&self, path: &Path) -> Result<()> {
        let digest = FileParts::read(path)?.notarized_digest()?;
        lock_notary(&self.state).accepted.insert(digest);
        Ok(())
    }

    fn submission_digest(&self, submission_id: &str) -> Result<String, AppleReleaseError> {
        let state = lock_notary(&self.state);

        submission_id
            .strip_prefix("fake-submission-")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| state.submissions.get(n.wrapping_sub(1)).cloned())
            .ok_or_else(|| AppleReleaseError::NotaryResponse(format!(
                "unknown submission {}",
                submission_id
            )))
    }
}

impl NotaryService for FakeNotary {
    fn submit(&self, path: &Path) -> Result<String, AppleReleaseError> {
        let digest = FileParts::read(path)
            .and_then(|p| p.notarized_digest())
            .map_err(|e| AppleReleaseError::NotaryResponse(e.to_string()))?;

        let mut state = lock_notary(&self.state);
        state.submissions.push(digest);

        Ok(format!("fake-submission-{}", state.submissions.len()))
    }

    fn status(&self, submission_id: &str) -> Result<SubmissionInfo, AppleReleaseError> {
        let digest = self.submission_digest(submission_id)?;

        let hook = {
            let mut state = lock_notary(&self.state);
            state.status_count += 1;
            state.on_status.clone()
        };
        if let Some(hook) = hook {
            hook();
        }

        let mut state = lock_notary(&self.state);
        let status = if state.script.len() > 1 {
            state.script.remove(0)
        } else {
            state
                .script
                .first()
                .copied()
                .unwrap_or(SubmissionStatus::Accepted)
        };

        if status == SubmissionStatus::Accepted {
            state.accepted.insert(digest);
        }

        Ok(SubmissionInfo {
            id: submission_id.to_string(),
            status,
            message: Some(match status {
                SubmissionStatus::Accepted => "Successfully received submission info".into(),
                _ => "Processing complete".into(),
            }),
            created_date: None,
            name: None,
        })
    }

    fn log(&self, _submission_id: &str) -> Result<String, AppleReleaseError> {
        Ok(lock_notary(&self.state).log.clone())
    }
}

/// A [TicketStapler] attaching tickets for files the [FakeNotary] accepted.
#[derive(Clone)]
pub struct FakeStapler {
    state: Arc<Mutex<NotaryState>>,
}

impl FakeStapler {
    /// The ticket attached to a file.
    pub fn ticket(&self, path: &Path) -> Result<Option<Ticket>> {
        Ok(FileParts::read(path)?.ticket)
    }

    pub fn attach_count(&self) -> usize {
        lock_notary(&self.state).attach_count
    }

    pub fn set_fail(&self, fail: bool) {
        lock_notary(&self.state).fail_staple = fail;
    }
}

fn stapler_error(diagnostic: impl ToString) -> AppleReleaseError {
    AppleReleaseError::ToolInvocation {
        program: "stapler".into(),
        diagnostic: diagnostic.to_string(),
    }
}

impl TicketStapler for FakeStapler {
    fn is_stapled(&self, path: &Path) -> Result<bool, AppleReleaseError> {
        Ok(FileParts::read(path)
            .map_err(stapler_error)?
            .ticket
            .is_some())
    }

    fn attach(&self, path: &Path) -> Result<(), AppleReleaseError> {
        let mut parts = FileParts::read(path).map_err(stapler_error)?;
        let digest = parts.notarized_digest().map_err(stapler_error)?;

        {
            let mut state = lock_notary(&self.state);
            state.attach_count += 1;

            if state.fail_staple {
                return Err(stapler_error("The staple and validate action failed! Error 65."));
            }
            if !state.accepted.contains(&digest) {
                return Err(stapler_error(format!(
                    "Could not find base64 encoded ticket for {}",
                    path.display()
                )));
            }
        }

        parts.ticket = Some(Ticket { digest });
        parts.write(path).map_err(stapler_error)
    }
}

/// One of each fake, with the notary and stapler sharing state.
#[derive(Clone)]
pub struct FakeToolchain {
    pub trust_store: StaticTrustStore,
    pub signer: FakeSigner,
    pub inspector: FakeInspector,
    pub image_builder: FakeImageBuilder,
    pub notary: FakeNotary,
    pub stapler: FakeStapler,
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self::with_identities(vec![test_identity()])
    }
}

impl FakeToolchain {
    pub fn with_identities(identities: Vec<SigningIdentity>) -> Self {
        let notary_state = Arc::new(Mutex::new(NotaryState::default()));

        Self {
            trust_store: StaticTrustStore::new(identities),
            signer: FakeSigner::default(),
            inspector: FakeInspector,
            image_builder: FakeImageBuilder::default(),
            notary: FakeNotary {
                state: notary_state.clone(),
            },
            stapler: FakeStapler {
                state: notary_state,
            },
        }
    }

    /// A pipeline [Toolchain] sharing state with these fakes.
    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            trust_store: Box::new(self.trust_store.clone()),
            signer: Box::new(self.signer.clone()),
            inspector: Box::new(self.inspector.clone()),
            image_builder: Box::new(self.image_builder.clone()),
            notary: Some(Box::new(self.notary.clone())),
            stapler: Box::new(self.stapler.clone()),
        }
    }

    /// Sign a bundle inside-out without going through the assembler.
    pub fn sign_tree(&self, root: &Path, identity: Option<&SigningIdentity>) -> Result<()> {
        let bundle = AppBundle::new_from_path(root)?;
        let entitlements = match identity {
            Some(_) => Some(Entitlements::from_path(bundle.default_entitlements_path()?)?),
            None => None,
        };

        let plan = SigningPlan::for_bundle(&bundle, identity, entitlements.as_ref())?;
        for step in plan.steps() {
            self.signer.sign(&step.request)?;
        }

        Ok(())
    }
}
