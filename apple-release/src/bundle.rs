// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! macOS application bundles backed by a directory.

use {
    crate::error::{AppleReleaseError, ConfigurationError},
    anyhow::{anyhow, Context, Result},
    log::info,
    std::path::{Path, PathBuf},
};

/// Create a symbolic link at `link` pointing to `target`.
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
pub fn create_symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

/// Recursively copy a directory tree.
///
/// Symlinks are recreated rather than followed and file permissions are
/// preserved. `dest` must not exist.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<(), AppleReleaseError> {
    info!("copying {} to {}", source.display(), dest.display());

    for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let rel_path = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppleReleaseError::BundleLayout(e.into()))?;
        let dest_path = dest.join(rel_path);

        if entry.path_is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            create_symlink(&target, &dest_path)?;
        } else if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else {
            // Read permissions first in case the copy alters them.
            let permissions = entry.metadata()?.permissions();
            std::fs::copy(entry.path(), &dest_path)?;
            std::fs::set_permissions(&dest_path, permissions)?;
        }
    }

    Ok(())
}

/// A macOS `.app` bundle on the filesystem.
///
/// The expected layout is:
///
/// ```text
/// MyApp.app/
///   Contents/
///     Info.plist
///     MacOS/        main executable and helper executables
///     Resources/    resources, including the entitlements file by default
///     Frameworks/   optional nested frameworks and dylibs
/// ```
#[derive(Clone, Debug)]
pub struct AppBundle {
    /// Root directory of this bundle.
    root: PathBuf,

    /// Name of the root directory.
    root_name: String,

    /// Parsed `Info.plist` file.
    info_plist: plist::Dictionary,
}

impl AppBundle {
    /// Open an existing bundle from a filesystem path.
    ///
    /// Validation is limited to locating and parsing `Contents/Info.plist`.
    pub fn new_from_path(directory: &Path) -> Result<Self> {
        if !directory.is_dir() {
            return Err(anyhow!("{} is not a directory", directory.display()));
        }

        let root_name = directory
            .file_name()
            .ok_or_else(|| anyhow!("unable to resolve root directory name"))?
            .to_string_lossy()
            .to_string();

        let info_plist_path = directory.join("Contents").join("Info.plist");
        if !info_plist_path.is_file() {
            return Err(anyhow!("Info.plist not found; not a valid application bundle"));
        }

        let info_plist_data = std::fs::read(&info_plist_path)?;
        let cursor = std::io::Cursor::new(info_plist_data);
        let value = plist::Value::from_reader(cursor).context("parsing Info.plist")?;
        let info_plist = value
            .into_dictionary()
            .ok_or_else(|| anyhow!("{} is not a dictionary", info_plist_path.display()))?;

        Ok(Self {
            root: directory.to_path_buf(),
            root_name,
            info_plist,
        })
    }

    /// Copy this bundle to a new path, replacing anything already there.
    pub fn copy_to(&self, dest: &Path) -> Result<Self, AppleReleaseError> {
        if dest.is_dir() {
            std::fs::remove_dir_all(dest)?;
        } else if dest.exists() {
            std::fs::remove_file(dest)?;
        }

        copy_tree(&self.root, dest)?;

        Self::new_from_path(dest).map_err(AppleReleaseError::BundleLayout)
    }

    /// The root directory of this bundle.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// The on-disk name of this bundle, including the `.app` suffix.
    pub fn name(&self) -> &str {
        &self.root_name
    }

    /// The bundle name without its `.app` suffix.
    pub fn stem(&self) -> &str {
        self.root_name
            .strip_suffix(".app")
            .unwrap_or(&self.root_name)
    }

    /// Resolve the absolute path to a file in the `Contents` directory.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join("Contents").join(path.as_ref())
    }

    pub fn info_plist_path(&self) -> PathBuf {
        self.resolve_path("Info.plist")
    }

    /// Directory holding executables.
    pub fn executables_dir(&self) -> PathBuf {
        self.resolve_path("MacOS")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.resolve_path("Resources")
    }

    pub fn frameworks_dir(&self) -> PathBuf {
        self.resolve_path("Frameworks")
    }

    /// Obtain an `Info.plist` key as a `String`.
    ///
    /// Will return `None` if the specified key doesn't exist. Errors if the key value
    /// is not a string.
    pub fn info_plist_key_string(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.info_plist.get(key) {
            Ok(Some(
                value
                    .as_string()
                    .ok_or_else(|| anyhow!("key {} is not a string", key))?
                    .to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Obtain the bundle identifier (`CFBundleIdentifier`).
    pub fn identifier(&self) -> Result<String, AppleReleaseError> {
        self.info_plist_key_string("CFBundleIdentifier")
            .map_err(AppleReleaseError::BundleLayout)?
            .ok_or_else(|| ConfigurationError::BundleNoIdentifier(self.info_plist_path()).into())
    }

    /// Obtain the name of the main executable (`CFBundleExecutable`).
    pub fn main_executable_name(&self) -> Result<String, AppleReleaseError> {
        self.info_plist_key_string("CFBundleExecutable")
            .map_err(AppleReleaseError::BundleLayout)?
            .ok_or_else(|| {
                ConfigurationError::BundleNoMainExecutable(self.info_plist_path()).into()
            })
    }

    /// Absolute path of the main executable, which must exist.
    pub fn main_executable(&self) -> Result<PathBuf, AppleReleaseError> {
        let path = self.executables_dir().join(self.main_executable_name()?);

        if path.is_file() {
            Ok(path)
        } else {
            Err(ConfigurationError::MainExecutableMissing(path).into())
        }
    }

    /// Default location of the entitlements file for this bundle.
    pub fn default_entitlements_path(&self) -> Result<PathBuf, AppleReleaseError> {
        Ok(self
            .resources_dir()
            .join(format!("{}.entitlements", self.main_executable_name()?)))
    }

    /// Executables in `Contents/MacOS` other than the main executable.
    ///
    /// The iteration order is deterministic.
    pub fn helper_executables(&self) -> Result<Vec<PathBuf>, AppleReleaseError> {
        let main = self.main_executable_name()?;
        let dir = self.executables_dir();

        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut helpers = vec![];

        for entry in walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;

            if entry.file_type().is_file() && entry.file_name().to_string_lossy() != main {
                helpers.push(entry.path().to_path_buf());
            }
        }

        Ok(helpers)
    }

    /// Frameworks and dynamic libraries under `Contents/Frameworks`.
    ///
    /// Nested frameworks and libraries inside frameworks are included.
    /// Symlinks (e.g. `Versions/Current`) are skipped so every library is
    /// emitted once.
    pub fn libraries(&self) -> Result<Vec<PathBuf>, AppleReleaseError> {
        let dir = self.frameworks_dir();

        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut libraries = vec![];

        for entry in walkdir::WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let entry = entry?;

            if entry.path_is_symlink() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();

            if (entry.file_type().is_dir() && name.ends_with(".framework"))
                || (entry.file_type().is_file() && name.ends_with(".dylib"))
            {
                libraries.push(entry.path().to_path_buf());
            }
        }

        Ok(libraries)
    }
}
