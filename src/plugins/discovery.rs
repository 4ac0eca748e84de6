//! Plugin discovery - scan directories for loadable plugin artifacts

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Default artifact suffix for the current platform (".so", ".dylib", ".dll")
pub const PLUGIN_SUFFIX: &str = std::env::consts::DLL_SUFFIX;

/// Options controlling how plugin directories are scanned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// How many directory levels to visit below each root (1 = direct children)
    pub max_depth: usize,

    /// File name suffix identifying a plugin artifact
    pub suffix: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            max_depth: 1,
            suffix: PLUGIN_SUFFIX.to_string(),
        }
    }
}

/// Scan plugin directories for artifacts
///
/// Roots are visited in the order given. Within a root, artifacts are returned
/// sorted by full path; the same file reachable from two roots appears twice.
/// Files without the configured suffix are skipped.
///
/// # Errors
///
/// Returns error if a root is empty, missing, not a directory, or any visited
/// directory cannot be read
pub fn discover_plugins(dirs: &[PathBuf], options: &DiscoveryOptions) -> Result<Vec<PathBuf>> {
    if options.max_depth == 0 {
        return Err(Error::Config(
            "plugin discovery depth must be at least 1".to_string(),
        ));
    }

    let mut results = Vec::new();

    for dir in dirs {
        if dir.as_os_str().is_empty() {
            return Err(Error::Config("plugin directory path is empty".to_string()));
        }

        let metadata = fs::metadata(dir).map_err(|source| Error::Discovery {
            path: dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(Error::Discovery {
                path: dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    "not a directory",
                ),
            });
        }

        let mut found = Vec::new();
        scan_dir(dir, options, 1, &mut found)?;
        sort_by_full_path(&mut found);

        tracing::debug!(
            path = %dir.display(),
            count = found.len(),
            "scanned plugin directory"
        );
        results.extend(found);
    }

    Ok(results)
}

/// Collect matching files below `dir`, descending while `depth < max_depth`
fn scan_dir(
    dir: &Path,
    options: &DiscoveryOptions,
    depth: usize,
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|source| Error::Discovery {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|source| Error::Discovery {
            path: dir.to_path_buf(),
            source,
        })?;
    sort_by_full_path(&mut paths);

    for path in paths {
        // Follow symlinks; dangling links are skipped like any other non-file
        let Ok(metadata) = fs::metadata(&path) else {
            tracing::debug!(path = %path.display(), "skipping unreadable entry");
            continue;
        };

        if metadata.is_dir() {
            if depth < options.max_depth {
                scan_dir(&path, options, depth + 1, found)?;
            }
        } else if metadata.is_file() && has_suffix(&path, &options.suffix) {
            found.push(path);
        }
    }

    Ok(())
}

/// Order paths by their raw string form, not component-wise
fn sort_by_full_path(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.len() > suffix.len() && name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn so_options() -> DiscoveryOptions {
        DiscoveryOptions {
            suffix: ".so".to_string(),
            ..DiscoveryOptions::default()
        }
    }

    fn touch(path: &Path) {
        std::fs::write(path, b"foo").unwrap();
    }

    #[test]
    fn finds_only_plugin_files() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir(&plugins).unwrap();
        touch(&plugins.join("foo.so"));
        touch(&plugins.join("bar.so"));
        touch(&plugins.join("not-an-so.txt"));

        let found = discover_plugins(&[plugins.clone()], &so_options()).unwrap();

        assert_eq!(found, vec![plugins.join("bar.so"), plugins.join("foo.so")]);
    }

    #[test]
    fn finds_plugins_in_multiple_directories() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        let other = dir.path().join("other");
        std::fs::create_dir(&plugins).unwrap();
        std::fs::create_dir(&other).unwrap();
        touch(&plugins.join("foo.so"));
        touch(&plugins.join("bar.so"));
        touch(&plugins.join("not-an-so.txt"));
        touch(&other.join("zap.so"));
        touch(&other.join("not-an-so.woo"));

        let found = discover_plugins(&[plugins.clone(), other.clone()], &so_options()).unwrap();

        assert_eq!(
            found,
            vec![
                plugins.join("bar.so"),
                plugins.join("foo.so"),
                other.join("zap.so"),
            ]
        );
    }

    #[test]
    fn same_directory_twice_yields_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.so"));
        let root = dir.path().to_path_buf();

        let found = discover_plugins(&[root.clone(), root.clone()], &so_options()).unwrap();

        assert_eq!(found, vec![root.join("a.so"), root.join("a.so")]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = discover_plugins(&[PathBuf::from("/nonexistent/plugins")], &so_options())
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
        assert!(err.to_string().contains("/nonexistent/plugins"));
    }

    #[test]
    fn file_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.so");
        touch(&file);

        let err = discover_plugins(&[file], &so_options()).unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[test]
    fn empty_path_is_a_config_error() {
        let err = discover_plugins(&[PathBuf::new()], &so_options()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn nested_directories_respect_depth() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let deeper = nested.join("deeper");
        std::fs::create_dir_all(&deeper).unwrap();
        touch(&dir.path().join("top.so"));
        touch(&nested.join("mid.so"));
        touch(&deeper.join("low.so"));
        let root = dir.path().to_path_buf();

        let shallow = discover_plugins(&[root.clone()], &so_options()).unwrap();
        assert_eq!(shallow, vec![root.join("top.so")]);

        let options = DiscoveryOptions {
            max_depth: 2,
            ..so_options()
        };
        let two_levels = discover_plugins(&[root.clone()], &options).unwrap();
        assert_eq!(two_levels, vec![nested.join("mid.so"), root.join("top.so")]);

        let options = DiscoveryOptions {
            max_depth: 3,
            ..so_options()
        };
        let all = discover_plugins(&[root.clone()], &options).unwrap();
        assert_eq!(
            all,
            vec![deeper.join("low.so"), nested.join("mid.so"), root.join("top.so")]
        );
    }

    #[test]
    fn zero_depth_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let options = DiscoveryOptions {
            max_depth: 0,
            ..so_options()
        };
        assert!(discover_plugins(&[dir.path().to_path_buf()], &options).is_err());
    }

    #[test]
    fn bare_suffix_is_not_a_plugin() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(".so"));
        touch(&dir.path().join("real.so"));

        let found = discover_plugins(&[dir.path().to_path_buf()], &so_options()).unwrap();
        assert_eq!(found, vec![dir.path().join("real.so")]);
    }

    #[test]
    fn default_suffix_matches_platform() {
        assert_eq!(DiscoveryOptions::default().suffix, PLUGIN_SUFFIX);
        assert_eq!(DiscoveryOptions::default().max_depth, 1);
    }
}
