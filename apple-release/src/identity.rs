// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing identity resolution.
//!
//! A signing identity is a certificate and private key pair living in a
//! trust store (the macOS keychain). The pipeline never manages identities;
//! it only asks whether a usable one exists. Absence is not an error: the
//! pipeline degrades to ad-hoc signing instead.

use {
    crate::{
        error::{AppleReleaseError, ConfigurationError},
        notarization::NotarizationCredentials,
        tool::{args, run_logged, AppleTool},
    },
    log::{info, warn},
    std::path::PathBuf,
};

/// A code signing identity available in a trust store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningIdentity {
    /// Certificate subject common name.
    ///
    /// e.g. `Developer ID Application: Example Inc (ABCDE12345)`.
    pub name: String,

    /// SHA-1 fingerprint of the certificate, as uppercase hex.
    pub fingerprint: String,

    /// Team identifier, derived from the trailing parenthesized token of the name.
    pub team_id: Option<String>,

    /// Reason the identity can't be used, if the trust store flagged one.
    ///
    /// e.g. `CSSMERR_TP_CERT_EXPIRED` for certificates outside their validity window.
    pub invalid_reason: Option<String>,
}

impl SigningIdentity {
    /// Construct an identity from its name and fingerprint.
    pub fn new(name: impl ToString, fingerprint: impl ToString) -> Self {
        let name = name.to_string();
        let team_id = team_id_from_name(&name);

        Self {
            name,
            fingerprint: fingerprint.to_string().to_ascii_uppercase(),
            team_id,
            invalid_reason: None,
        }
    }

    /// Whether the trust store considers this identity usable.
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }

    /// Whether this identity is selected by a label.
    ///
    /// Labels match a fingerprint exactly (case insensitive) or any part of
    /// the name.
    pub fn matches_label(&self, label: &str) -> bool {
        self.fingerprint.eq_ignore_ascii_case(label) || self.name.contains(label)
    }
}

/// Extract a team identifier from an identity name.
///
/// Apple certificate names end in `(TEAMID)`, where the team identifier is
/// 10 alphanumeric characters.
pub fn team_id_from_name(name: &str) -> Option<String> {
    let name = name.trim_end();
    let inner = name.strip_suffix(')')?;
    let start = inner.rfind('(')?;
    let candidate = &inner[start + 1..];

    if candidate.len() == 10 && candidate.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// A source of signing identities.
pub trait TrustStore: Send + Sync {
    /// All code signing identities in the store, usable or not.
    fn identities(&self) -> Result<Vec<SigningIdentity>, AppleReleaseError>;

    /// Identities matching a label.
    ///
    /// An exact name or fingerprint match wins over partial name matches.
    /// Duplicate entries for the same certificate are collapsed.
    fn find_identities(&self, label: &str) -> Result<Vec<SigningIdentity>, AppleReleaseError> {
        let mut matches: Vec<SigningIdentity> = vec![];

        for identity in self.identities()? {
            if identity.matches_label(label)
                && !matches.iter().any(|m| m.fingerprint == identity.fingerprint)
            {
                matches.push(identity);
            }
        }

        if let Some(exact) = matches
            .iter()
            .find(|i| i.name == label || i.fingerprint.eq_ignore_ascii_case(label))
        {
            return Ok(vec![exact.clone()]);
        }

        Ok(matches)
    }
}

/// Parse the output of `security find-identity -p codesigning`.
///
/// Identity lines look like:
///
/// ```text
///   1) 0123456789ABCDEF0123456789ABCDEF01234567 "Developer ID Application: Example (ABCDE12345)"
///   2) 89ABCDEF0123456789ABCDEF0123456789ABCDEF "Apple Development: Example (FGHIJ67890)" (CSSMERR_TP_CERT_EXPIRED)
/// ```
///
/// Other lines (section headers, counts) are ignored.
pub fn parse_find_identity_output(output: &str) -> Vec<SigningIdentity> {
    let mut identities = vec![];

    for line in output.lines() {
        let line = line.trim();

        let rest = match line.split_once(") ") {
            Some((index, rest)) if index.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => continue,
        };

        let (fingerprint, rest) = match rest.split_once(' ') {
            Some(x) => x,
            None => continue,
        };

        if fingerprint.len() != 40 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }

        let rest = rest.trim();
        let rest = match rest.strip_prefix('"') {
            Some(rest) => rest,
            None => continue,
        };
        let (name, trailer) = match rest.split_once('"') {
            Some(x) => x,
            None => continue,
        };

        let mut identity = SigningIdentity::new(name, fingerprint);

        let trailer = trailer.trim();
        if let Some(reason) = trailer
            .strip_prefix('(')
            .and_then(|x| x.strip_suffix(')'))
        {
            identity.invalid_reason = Some(reason.to_string());
        }

        identities.push(identity);
    }

    identities
}

/// A [TrustStore] backed by the macOS keychain, queried with `security`.
pub struct KeychainTrustStore {
    security_exe: PathBuf,
    keychain: Option<PathBuf>,
}

impl KeychainTrustStore {
    /// Construct an instance searching the default keychain search list.
    pub fn new() -> Result<Self, AppleReleaseError> {
        Ok(Self {
            security_exe: AppleTool::Security.find_exe()?,
            keychain: None,
        })
    }

    /// Restrict searches to a specific keychain file.
    pub fn set_keychain(&mut self, path: impl Into<PathBuf>) {
        self.keychain = Some(path.into());
    }
}

impl TrustStore for KeychainTrustStore {
    fn identities(&self) -> Result<Vec<SigningIdentity>, AppleReleaseError> {
        let mut arguments = args(["find-identity", "-p", "codesigning"]);
        if let Some(keychain) = &self.keychain {
            arguments.push(keychain.into());
        }

        let output = run_logged(&self.security_exe, arguments, "security")?;

        if !output.success {
            return Err(AppleReleaseError::ToolInvocation {
                program: "security find-identity".into(),
                diagnostic: output.output,
            });
        }

        Ok(parse_find_identity_output(&output.output))
    }
}

/// What the current environment allows the pipeline to do.
#[derive(Clone, Debug, Default)]
pub struct SigningCapability {
    /// The resolved identity, if any.
    pub identity: Option<SigningIdentity>,

    /// Whether notarization credentials are complete and an identity exists.
    pub can_notarize: bool,
}

impl SigningCapability {
    /// A capability with no identity: ad-hoc signing only.
    pub fn ad_hoc() -> Self {
        Self::default()
    }

    pub fn can_sign(&self) -> bool {
        self.identity.is_some()
    }

    pub fn can_notarize(&self) -> bool {
        self.can_notarize
    }

    pub fn team_id(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|i| i.team_id.as_deref())
    }
}

/// Determines signing and notarization capability.
pub struct IdentityResolver<'a> {
    store: &'a dyn TrustStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn TrustStore) -> Self {
        Self { store }
    }

    /// Resolve an identity label and credentials into a [SigningCapability].
    ///
    /// Only an ambiguous label is an error. A missing label, no match, a
    /// match flagged invalid, or a failed trust store query all degrade to
    /// ad-hoc mode with a warning.
    ///
    /// Notarization credentials are only checked for presence; no network call
    /// is made.
    pub fn resolve(
        &self,
        label: Option<&str>,
        expected_team_id: Option<&str>,
        credentials: Option<&NotarizationCredentials>,
    ) -> Result<SigningCapability, AppleReleaseError> {
        let identity = match label {
            Some(label) => self.resolve_label(label)?,
            None => {
                warn!("no signing identity configured; falling back to ad-hoc signing");
                None
            }
        };

        if let (Some(identity), Some(expected)) = (&identity, expected_team_id) {
            match &identity.team_id {
                Some(team) if team == expected => {}
                Some(team) => {
                    warn!(
                        "team ID of signing identity ({}) does not match expected team ID {}",
                        team, expected
                    );
                }
                None => {
                    warn!(
                        "unable to determine team ID of signing identity; expected {}",
                        expected
                    );
                }
            }
        }

        let credentials_present = credentials.map(|c| c.is_complete()).unwrap_or(false);

        if credentials_present && identity.is_none() {
            warn!("notarization credentials present but unusable without a signing identity");
        } else if !credentials_present && identity.is_some() {
            warn!("notarization credentials incomplete; disk image will not be notarized");
        }

        Ok(SigningCapability {
            can_notarize: credentials_present && identity.is_some(),
            identity,
        })
    }

    fn resolve_label(&self, label: &str) -> Result<Option<SigningIdentity>, AppleReleaseError> {
        let candidates = match self.store.find_identities(label) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("unable to query trust store: {}", e);
                warn!("falling back to ad-hoc signing");
                return Ok(None);
            }
        };

        let (valid, invalid): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|i| i.is_valid());

        for identity in &invalid {
            warn!(
                "ignoring unusable signing identity {} ({})",
                identity.name,
                identity.invalid_reason.as_deref().unwrap_or("invalid")
            );
        }

        match valid.len() {
            0 => {
                warn!("{}", ConfigurationError::IdentityNotFound(label.to_string()));
                warn!("falling back to ad-hoc signing");
                Ok(None)
            }
            1 => {
                let identity = valid.into_iter().next();
                if let Some(identity) = &identity {
                    info!(
                        "resolved signing identity {} ({})",
                        identity.name, identity.fingerprint
                    );
                }
                Ok(identity)
            }
            _ => Err(ConfigurationError::AmbiguousIdentity {
                label: label.to_string(),
                candidates: valid.into_iter().map(|i| i.name).collect(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{notarization::KeyMaterial, testutil::StaticTrustStore},
        anyhow::Result,
        indoc::indoc,
    };

    const FIND_IDENTITY_OUTPUT: &str = indoc! {r#"

        Policy: Code Signing
          Matching identities
          1) 0123456789ABCDEF0123456789ABCDEF01234567 "Developer ID Application: Example Inc (ABCDE12345)"
          2) 89abcdef0123456789abcdef0123456789abcdef "Apple Development: Example Inc (FGHIJ67890)" (CSSMERR_TP_CERT_EXPIRED)
             2 identities found

          Valid identities only
          1) 0123456789ABCDEF0123456789ABCDEF01234567 "Developer ID Application: Example Inc (ABCDE12345)"
             1 valid identities found
    "#};

    fn credentials() -> NotarizationCredentials {
        NotarizationCredentials {
            key: Some(KeyMaterial::Path("/keys/AuthKey.p8".into())),
            key_id: Some("KEYID12345".into()),
            issuer_id: Some("69a6de7e-0000-0000-0000-000000000000".into()),
        }
    }

    #[test]
    fn parse_security_output() {
        let identities = parse_find_identity_output(FIND_IDENTITY_OUTPUT);
        assert_eq!(identities.len(), 3);

        assert_eq!(
            identities[0].name,
            "Developer ID Application: Example Inc (ABCDE12345)"
        );
        assert_eq!(identities[0].team_id.as_deref(), Some("ABCDE12345"));
        assert!(identities[0].is_valid());

        assert_eq!(
            identities[1].fingerprint,
            "89ABCDEF0123456789ABCDEF0123456789ABCDEF"
        );
        assert_eq!(
            identities[1].invalid_reason.as_deref(),
            Some("CSSMERR_TP_CERT_EXPIRED")
        );
    }

    #[test]
    fn team_id_parsing() {
        assert_eq!(
            team_id_from_name("Test Signer (ABCDE12345)").as_deref(),
            Some("ABCDE12345")
        );
        assert_eq!(team_id_from_name("Test Signer"), None);
        assert_eq!(team_id_from_name("Test Signer (short)"), None);
    }

    #[test]
    fn resolve_single_identity() -> Result<()> {
        let store = StaticTrustStore::new(parse_find_identity_output(FIND_IDENTITY_OUTPUT));
        let resolver = IdentityResolver::new(&store);

        let capability =
            resolver.resolve(Some("Developer ID"), Some("ABCDE12345"), Some(&credentials()))?;
        assert!(capability.can_sign());
        assert!(capability.can_notarize());
        assert_eq!(capability.team_id(), Some("ABCDE12345"));

        // Team mismatch only warns.
        let capability = resolver.resolve(Some("Developer ID"), Some("ZZZZZ99999"), None)?;
        assert!(capability.can_sign());
        assert!(!capability.can_notarize());

        Ok(())
    }

    #[test]
    fn absence_degrades() -> Result<()> {
        let store = StaticTrustStore::new(parse_find_identity_output(FIND_IDENTITY_OUTPUT));
        let resolver = IdentityResolver::new(&store);

        let capability = resolver.resolve(Some("Nobody"), None, Some(&credentials()))?;
        assert!(!capability.can_sign());
        assert!(!capability.can_notarize());

        // The only match is expired.
        let capability = resolver.resolve(Some("Apple Development"), None, None)?;
        assert!(!capability.can_sign());

        let capability = resolver.resolve(None, None, Some(&credentials()))?;
        assert!(!capability.can_sign());
        assert!(!capability.can_notarize());

        let capability = IdentityResolver::new(&StaticTrustStore::failing())
            .resolve(Some("Developer ID"), None, None)?;
        assert!(!capability.can_sign());

        Ok(())
    }

    #[test]
    fn incomplete_credentials() -> Result<()> {
        let store = StaticTrustStore::new(vec![SigningIdentity::new(
            "Test Signer (ABCDE12345)",
            "0123456789ABCDEF0123456789ABCDEF01234567",
        )]);
        let resolver = IdentityResolver::new(&store);

        let mut creds = credentials();
        creds.issuer_id = None;

        let capability = resolver.resolve(Some("Test Signer"), None, Some(&creds))?;
        assert!(capability.can_sign());
        assert!(!capability.can_notarize());

        Ok(())
    }

    #[test]
    fn ambiguity_is_error() {
        let store = StaticTrustStore::new(vec![
            SigningIdentity::new(
                "Developer ID Application: One (ABCDE12345)",
                "0123456789ABCDEF0123456789ABCDEF01234567",
            ),
            SigningIdentity::new(
                "Developer ID Application: Two (FGHIJ67890)",
                "89ABCDEF0123456789ABCDEF0123456789ABCDEF",
            ),
        ]);

        let res = IdentityResolver::new(&store).resolve(Some("Developer ID"), None, None);
        assert!(matches!(
            res,
            Err(AppleReleaseError::Configuration(
                ConfigurationError::AmbiguousIdentity { .. }
            ))
        ));

        // An exact name resolves the ambiguity.
        let capability = IdentityResolver::new(&store)
            .resolve(Some("Developer ID Application: Two (FGHIJ67890)"), None, None)
            .unwrap();
        assert_eq!(capability.team_id(), Some("FGHIJ67890"));
    }
}
