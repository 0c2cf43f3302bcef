// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling.

Entitlements are a plist dictionary of capability grants (e.g.
`com.apple.security.network.client`) embedded in a code signature. They are
only attached to a bundle's main executable and to the bundle itself.
*/

use {
    crate::error::{AppleReleaseError, ConfigurationError},
    plist::Value,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Entitlement allowing outgoing network connections.
pub const ENTITLEMENT_NETWORK_CLIENT: &str = "com.apple.security.network.client";

/// Entitlement allowing loading of libraries not signed by the same team.
pub const ENTITLEMENT_DISABLE_LIBRARY_VALIDATION: &str =
    "com.apple.security.cs.disable-library-validation";

/// Entitlement allowing camera access.
pub const ENTITLEMENT_CAMERA: &str = "com.apple.security.device.camera";

/// Whether a plist value can be encoded into a signature's entitlements blob.
fn value_is_encodable(value: &Value) -> bool {
    match value {
        Value::Boolean(_) | Value::Integer(_) | Value::String(_) => true,
        Value::Array(array) => array.iter().all(value_is_encodable),
        Value::Dictionary(dict) => dict.values().all(value_is_encodable),
        _ => false,
    }
}

/// An immutable set of entitlements loaded from a plist file.
#[derive(Clone, Debug, PartialEq)]
pub struct Entitlements {
    /// Where the entitlements were read from.
    ///
    /// Signing tools consume the file, so the path travels with the grants.
    path: PathBuf,

    grants: BTreeMap<String, Value>,
}

impl Entitlements {
    /// Load and validate an entitlements plist file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppleReleaseError> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(ConfigurationError::MissingEntitlements(path.to_path_buf()).into());
        }

        let data = std::fs::read(path)?;

        Self::from_plist_data(path, &data)
    }

    /// Parse entitlements from raw plist data associated with `path`.
    pub fn from_plist_data(path: &Path, data: &[u8]) -> Result<Self, AppleReleaseError> {
        let malformed = |reason: String| ConfigurationError::MalformedEntitlements {
            path: path.to_path_buf(),
            reason,
        };

        let value = Value::from_reader(std::io::Cursor::new(data))
            .map_err(|e| malformed(e.to_string()))?;

        let dict = value
            .into_dictionary()
            .ok_or_else(|| malformed("root element is not a dictionary".into()))?;

        let mut grants = BTreeMap::new();

        for (key, value) in dict {
            if !value_is_encodable(&value) {
                return Err(malformed(format!("value of {} has an unsupported type", key)).into());
            }

            grants.insert(key, value);
        }

        Ok(Self {
            path: path.to_path_buf(),
            grants,
        })
    }

    /// Path to the plist file backing these entitlements.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an entitlement is granted (present with a `true` boolean value).
    pub fn is_granted(&self, key: &str) -> bool {
        matches!(self.grants.get(key), Some(Value::Boolean(true)))
    }

    /// Iterate over entitlement keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.grants.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
