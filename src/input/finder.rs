// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::input::error::{Error, Result};

/// Resolves the configured watch targets into concrete file paths.
#[derive(Debug, Clone)]
pub struct FileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FileFinder {
    /// Validates every pattern up front so a typo fails at startup rather than
    /// silently matching nothing.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        for pattern in &include {
            Pattern::new(pattern).map_err(|e| Error::InvalidGlob(format!("{pattern}: {e}")))?;
        }
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{p}: {e}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    /// Find regular files matching any include pattern and no exclude pattern.
    ///
    /// Entries that cannot be read are logged and skipped; they are picked up
    /// again on the next scan once accessible.
    pub fn find_files(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = match glob(pattern) {
                Ok(m) => m,
                Err(e) => {
                    // validated in new(), unreachable in practice
                    warn!(pattern = %pattern, error = %e, "Skipping invalid glob pattern");
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(path = ?e.path(), error = %e.error(), "Unable to access path, will retry on next scan");
                        continue;
                    }
                };

                if path.is_dir() {
                    continue;
                }

                if self.exclude.iter().any(|p| p.matches_path(&path)) {
                    debug!(path = ?path, "Path excluded");
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths
    }

    /// Directories that contain the files a pattern can match: the longest
    /// wildcard-free prefix of each include pattern.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for pattern in &self.include {
            let root = literal_prefix(Path::new(pattern));
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }
}

fn literal_prefix(pattern: &Path) -> PathBuf {
    let mut prefix = PathBuf::new();
    let mut components = pattern.components().peekable();
    while let Some(component) = components.next() {
        let is_last = components.peek().is_none();
        let wild = match component {
            Component::Normal(s) => s
                .to_str()
                .is_none_or(|s| s.contains(['*', '?', '[', ']'])),
            _ => false,
        };
        if wild || is_last {
            break;
        }
        prefix.push(component);
    }
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_files(dir: &TempDir) {
        for name in ["AdminServer.log", "ms1.log", "access.txt", "ms1_debug.log"] {
            fs::write(dir.path().join(name), format!("content of {}", name)).unwrap();
        }
        fs::create_dir(dir.path().join("archive.log")).unwrap();
    }

    #[test]
    fn test_finder_basic_skips_dirs() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let pattern = format!("{}/*.log", dir.path().display());
        let finder = FileFinder::new(vec![pattern], vec![]).unwrap();

        // archive.log is a directory
        assert_eq!(finder.find_files().len(), 3);
    }

    #[test]
    fn test_finder_with_exclude() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let include = format!("{}/*.log", dir.path().display());
        let exclude = format!("{}/*_debug.log", dir.path().display());
        let finder = FileFinder::new(vec![include], vec![exclude]).unwrap();

        let files = finder.find_files();
        assert_eq!(files.len(), 2);
        assert!(!files.iter().any(|p| p.ends_with("ms1_debug.log")));
    }

    #[test]
    fn test_finder_no_duplicates() {
        let dir = TempDir::new().unwrap();
        setup_test_files(&dir);

        let pattern = format!("{}/*.log", dir.path().display());
        let finder = FileFinder::new(vec![pattern.clone(), pattern], vec![]).unwrap();

        assert_eq!(finder.find_files().len(), 3);
    }

    #[test]
    fn test_finder_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/log/*", dir.path().display());
        let finder = FileFinder::new(vec![pattern], vec![]).unwrap();

        assert!(finder.find_files().is_empty());

        fs::create_dir(dir.path().join("log")).unwrap();
        fs::write(dir.path().join("log").join("server.log"), "x\n").unwrap();
        assert_eq!(finder.find_files().len(), 1);
    }

    #[test]
    fn test_finder_rejects_bad_pattern() {
        let err = FileFinder::new(vec!["/var/log/[".to_string()], vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidGlob(_)));

        let err = FileFinder::new(vec![], vec!["***/[".to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidGlob(_)));
    }

    #[test]
    fn test_watch_roots() {
        let finder = FileFinder::new(
            vec![
                "/u01/domains/base/servers/*/logs/*.log".to_string(),
                "/var/log/weblogic/server.log".to_string(),
                "logs/*".to_string(),
                "*.log".to_string(),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(
            finder.watch_roots(),
            vec![
                PathBuf::from("/u01/domains/base/servers"),
                PathBuf::from("/var/log/weblogic"),
                PathBuf::from("logs"),
                PathBuf::from("."),
            ]
        );
    }
}
