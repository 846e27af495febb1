//! Module bundles: `<profile>/modules/*.zip` archives holding a
//! `module.json` manifest next to the module's files.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use botkernel_protocols::{KernelError, ModuleManifest};

/// Name of the manifest entry inside a bundle.
pub const MANIFEST_ENTRY: &str = "module.json";

/// List `*.zip` files in `dir`, sorted by file name.
///
/// A missing directory yields an empty list.
pub async fn discover(dir: &Path) -> Result<Vec<PathBuf>, KernelError> {
    let mut bundles = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(bundles),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip && entry.file_type().await?.is_file() {
            bundles.push(path);
        }
    }
    bundles.sort();
    Ok(bundles)
}

/// Read and validate the manifest of the bundle at `path`.
pub async fn read_manifest(module_id: &str, path: &Path) -> Result<ModuleManifest, KernelError> {
    let path = path.to_path_buf();
    let raw = tokio::task::spawn_blocking(move || read_entry(&path, MANIFEST_ENTRY))
        .await
        .map_err(|e| KernelError::Bundle(e.to_string()))??;

    ModuleManifest::from_json(&raw).map_err(|source| KernelError::Manifest {
        module: module_id.to_string(),
        source,
    })
}

/// Extract the whole bundle into `dest`, overwriting existing files.
pub async fn extract(path: &Path, dest: &Path) -> Result<(), KernelError> {
    let path = path.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_all(&path, &dest))
        .await
        .map_err(|e| KernelError::Bundle(e.to_string()))?
}

fn open(path: &Path) -> Result<ZipArchive<fs::File>, KernelError> {
    let file = fs::File::open(path)?;
    ZipArchive::new(file).map_err(|e| KernelError::Bundle(format!("{}: {}", path.display(), e)))
}

fn read_entry(path: &Path, name: &str) -> Result<String, KernelError> {
    let mut archive = open(path)?;
    let mut entry = archive
        .by_name(name)
        .map_err(|e| KernelError::Bundle(format!("{}: {}: {}", path.display(), name, e)))?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}

fn extract_all(path: &Path, dest: &Path) -> Result<(), KernelError> {
    let mut archive = open(path)?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| KernelError::Bundle(e.to_string()))?;
        // Entries escaping the destination are skipped.
        let Some(relative) = file.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let target = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_bundle;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "namespace": "echo",
        "autoRestart": true,
        "type": "script",
        "communicationProtocol": "node_worker",
        "scriptSrc": "echo"
    }"#;

    #[tokio::test]
    async fn test_discover_sorted_zip_only() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "b.zip", MANIFEST, &[]);
        write_bundle(dir.path(), "a.zip", MANIFEST, &[]);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover(dir.path()).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.zip", "b.zip"]);
    }

    #[tokio::test]
    async fn test_discover_missing_dir() {
        let dir = TempDir::new().unwrap();
        let found = discover(&dir.path().join("modules")).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_read_manifest() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path(), "echo.zip", MANIFEST, &[]);
        let manifest = read_manifest("1", &path).await.unwrap();
        assert_eq!(manifest.namespace, "echo");
        assert!(manifest.auto_restart);
    }

    #[tokio::test]
    async fn test_read_manifest_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path(), "bad.zip", r#"{"namespace": "x"}"#, &[]);
        let err = read_manifest("4", &path).await.unwrap_err();
        assert!(matches!(err, KernelError::Manifest { ref module, .. } if module == "4"));
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        fs::write(&path, "definitely not a zip").unwrap();
        assert!(matches!(
            read_manifest("1", &path).await,
            Err(KernelError::Bundle(_))
        ));
    }

    #[tokio::test]
    async fn test_extract() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(
            dir.path(),
            "echo.zip",
            MANIFEST,
            &[("lib/main.js", "console.log(1)")],
        );
        let dest = dir.path().join("out");
        extract(&path, &dest).await.unwrap();
        assert!(dest.join(MANIFEST_ENTRY).exists());
        assert_eq!(
            fs::read_to_string(dest.join("lib/main.js")).unwrap(),
            "console.log(1)"
        );

        // Extracting again overwrites in place.
        extract(&path, &dest).await.unwrap();
    }
}
