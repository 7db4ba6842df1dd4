//! Named resources bundled with the application.
//!
//! A [`ResourceTable`] resolves the name in a `resource:` source to bytes. [`ResourceBundle`] is
//! the stock implementation: a directory with a `bundle.json` manifest mapping names to
//! relative file paths, plus an optional set of in-memory entries. Without a manifest, a name is
//! looked up as `<dir>/<name>.<ext>` for the common image extensions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// File name of the bundle manifest inside resource directories.
pub const BUNDLE_MANIFEST: &str = "bundle.json";

/// Schema version for bundle manifests.
pub const BUNDLE_VERSION: u32 = 1;

const PROBE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Lookup of named resources.
///
/// `Ok(None)` means the name is unknown; `Err` means it is known but could not be read.
pub trait ResourceTable: Send + Sync {
  fn open(&self, name: &str) -> Result<Option<Arc<Vec<u8>>>>;
}

impl<T: ResourceTable + ?Sized> ResourceTable for Arc<T> {
  fn open(&self, name: &str) -> Result<Option<Arc<Vec<u8>>>> {
    (**self).open(name)
  }
}

/// Metadata describing a bundled resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledResourceInfo {
  pub path: String,
  #[serde(default)]
  pub content_type: Option<String>,
}

/// Manifest describing the resources of a bundle directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
  pub version: u32,
  pub resources: BTreeMap<String, BundledResourceInfo>,
}

/// Directory- and memory-backed [`ResourceTable`].
#[derive(Debug, Default, Clone)]
pub struct ResourceBundle {
  root: Option<PathBuf>,
  manifest: Option<BundleManifest>,
  inline: HashMap<String, Arc<Vec<u8>>>,
}

impl ResourceBundle {
  /// A bundle with no resources.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Load a bundle rooted at `dir`. Reads `bundle.json` when present.
  pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
      return Err(Error::NotFound(format!(
        "resource directory {}",
        dir.display()
      )));
    }
    let manifest_path = dir.join(BUNDLE_MANIFEST);
    let manifest = match fs::read(&manifest_path) {
      Ok(bytes) => {
        let manifest: BundleManifest = serde_json::from_slice(&bytes)
          .map_err(|e| Error::Other(format!("Invalid bundle manifest: {e}")))?;
        if manifest.version != BUNDLE_VERSION {
          return Err(Error::Other(format!(
            "Unsupported bundle manifest version {} (expected {BUNDLE_VERSION})",
            manifest.version
          )));
        }
        for info in manifest.resources.values() {
          validate_relative_path(&info.path)?;
        }
        Some(manifest)
      }
      Err(err) if err.kind() == io::ErrorKind::NotFound => None,
      Err(err) => {
        return Err(Error::Io(Arc::new(io::Error::new(
          err.kind(),
          format!("Failed to read manifest {}: {err}", manifest_path.display()),
        ))))
      }
    };
    Ok(Self {
      root: Some(dir.to_path_buf()),
      manifest,
      inline: HashMap::new(),
    })
  }

  /// Registers an in-memory resource, shadowing any file of the same name.
  pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
    self.inline.insert(name.into(), Arc::new(bytes));
  }

  pub fn with_resource(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
    self.insert(name, bytes);
    self
  }

  pub fn manifest(&self) -> Option<&BundleManifest> {
    self.manifest.as_ref()
  }

  fn locate(&self, root: &Path, name: &str) -> Result<Option<PathBuf>> {
    if let Some(manifest) = &self.manifest {
      return match manifest.resources.get(name) {
        Some(info) => Ok(Some(root.join(validate_relative_path(&info.path)?))),
        None => Ok(None),
      };
    }
    // Names never address outside the bundle.
    if validate_relative_path(name).is_err() {
      return Ok(None);
    }
    let direct = root.join(name);
    if direct.is_file() {
      return Ok(Some(direct));
    }
    Ok(
      PROBE_EXTENSIONS
        .iter()
        .map(|ext| root.join(format!("{name}.{ext}")))
        .find(|candidate| candidate.is_file()),
    )
  }
}

impl ResourceTable for ResourceBundle {
  fn open(&self, name: &str) -> Result<Option<Arc<Vec<u8>>>> {
    if let Some(bytes) = self.inline.get(name) {
      return Ok(Some(Arc::clone(bytes)));
    }
    let Some(root) = &self.root else {
      return Ok(None);
    };
    let Some(path) = self.locate(root, name)? else {
      return Ok(None);
    };
    match fs::read(&path) {
      Ok(bytes) => Ok(Some(Arc::new(bytes))),
      // A manifest entry whose file is gone is a broken bundle, not an unknown name.
      Err(err) => Err(err.into()),
    }
  }
}

fn validate_relative_path(path: &str) -> Result<PathBuf> {
  let candidate = Path::new(path);
  if path.is_empty()
    || candidate.is_absolute()
    || candidate
      .components()
      .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
  {
    return Err(Error::Other(format!(
      "Bundle entry path must be relative: {}",
      path
    )));
  }
  Ok(candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn inline_resources_resolve() {
    let bundle = ResourceBundle::empty().with_resource("logo", vec![1, 2, 3]);
    assert_eq!(*bundle.open("logo").unwrap().unwrap(), vec![1, 2, 3]);
    assert!(bundle.open("missing").unwrap().is_none());
  }

  #[test]
  fn directory_probe_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("icon.png"), b"png bytes").unwrap();
    let bundle = ResourceBundle::load(dir.path()).unwrap();
    assert_eq!(*bundle.open("icon").unwrap().unwrap(), b"png bytes".to_vec());
    assert_eq!(
      *bundle.open("icon.png").unwrap().unwrap(),
      b"png bytes".to_vec()
    );
    assert!(bundle.open("other").unwrap().is_none());
    assert!(bundle.open("../icon").unwrap().is_none());
  }

  #[test]
  fn manifest_maps_names() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("img")).unwrap();
    fs::write(dir.path().join("img/a.gif"), b"gif").unwrap();
    let manifest = serde_json::json!({
      "version": BUNDLE_VERSION,
      "resources": {
        "avatar": { "path": "img/a.gif", "content_type": "image/gif" },
        "gone": { "path": "img/missing.png" }
      }
    });
    fs::write(
      dir.path().join(BUNDLE_MANIFEST),
      serde_json::to_vec(&manifest).unwrap(),
    )
    .unwrap();

    let bundle = ResourceBundle::load(dir.path()).unwrap();
    assert_eq!(*bundle.open("avatar").unwrap().unwrap(), b"gif".to_vec());
    assert!(bundle.open("img/a.gif").unwrap().is_none());
    let err = bundle.open("gone").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
  }

  #[test]
  fn manifest_rejects_escaping_paths() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = serde_json::json!({
      "version": BUNDLE_VERSION,
      "resources": { "evil": { "path": "../etc/passwd" } }
    });
    fs::write(
      dir.path().join(BUNDLE_MANIFEST),
      serde_json::to_vec(&manifest).unwrap(),
    )
    .unwrap();
    assert!(ResourceBundle::load(dir.path()).is_err());
  }
}
