//! Store configuration.
//!
//! Decides which directories make up the implementation cache. Sources, in
//! order of precedence:
//!
//! - `ZSTORE_IMPLEMENTATION_DIRS`: an OS path list (`:` on Unix, `;` on
//!   Windows). When set it replaces everything else.
//! - The `implementation-dirs` file in the config directory
//!   (`ZSTORE_CONFIG_DIR`, else `$XDG_CONFIG_HOME/zstore`, else
//!   `$HOME/.config/zstore`). One absolute path per line; `#` starts a
//!   comment. Listed directories are added after the default.
//! - The default user cache, `$XDG_CACHE_HOME/zstore/implementations` or
//!   `$HOME/.cache/zstore/implementations`.
//!
//! `ZSTORE_WRITE_PROTECTION=0` (or `false`) disables write protection.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zstore_core::fsutil::write_atomic;
use zstore_core::StoreError;

use crate::composite::CompositeStore;
use crate::directory::{DirectoryStore, StoreOptions};
use crate::store::ImplementationStore;

/// Name of the file listing additional store roots.
pub const IMPLEMENTATION_DIRS_FILE: &str = "implementation-dirs";

/// Which directories form the cache, and how stores are opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store roots in priority order.
    pub implementation_dirs: Vec<PathBuf>,
    /// Options applied to every store.
    pub options: StoreOptions,
}

impl StoreConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, ConfigError> {
        let options = StoreOptions {
            write_protection: lookup("ZSTORE_WRITE_PROTECTION")
                .map(|v| !matches!(v.to_string_lossy().trim(), "0" | "false" | "no"))
                .unwrap_or(true),
        };

        if let Some(list) = lookup("ZSTORE_IMPLEMENTATION_DIRS").filter(|v| !v.is_empty()) {
            let implementation_dirs = env::split_paths(&list).filter(|p| !p.as_os_str().is_empty()).collect();
            return Ok(Self {
                implementation_dirs,
                options,
            });
        }

        let mut implementation_dirs = vec![default_store_dir(&lookup)?];
        if let Some(config_dir) = config_dir(&lookup) {
            for dir in read_dirs_file(&config_dir.join(IMPLEMENTATION_DIRS_FILE))? {
                if !implementation_dirs.contains(&dir) {
                    implementation_dirs.push(dir);
                }
            }
        }
        Ok(Self {
            implementation_dirs,
            options,
        })
    }

    /// Open every configured root and combine them.
    ///
    /// Roots that fail to open are logged and skipped, so one broken shared
    /// cache does not make the rest unusable.
    pub fn open_stores(&self) -> Result<CompositeStore, StoreError> {
        let mut stores: Vec<Box<dyn ImplementationStore>> = Vec::new();
        let mut first_error = None;
        for dir in &self.implementation_dirs {
            match DirectoryStore::open_with(dir, self.options) {
                Ok(store) => stores.push(Box::new(store)),
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "skipping implementation store");
                    first_error.get_or_insert(e);
                }
            }
        }
        match (stores.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(CompositeStore::new(stores)),
        }
    }
}

/// Parse an `implementation-dirs` file. A missing file yields no entries.
pub fn read_dirs_file(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut dirs = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let dir = PathBuf::from(line);
        if !dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                file: path.to_path_buf(),
                line: i + 1,
                value: line.to_string(),
            });
        }
        dirs.push(dir);
    }
    Ok(dirs)
}

/// Write an `implementation-dirs` file atomically.
pub fn write_dirs_file(path: &Path, dirs: &[PathBuf]) -> Result<(), ConfigError> {
    let mut text = String::new();
    for dir in dirs {
        if !dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                file: path.to_path_buf(),
                line: 0,
                value: dir.display().to_string(),
            });
        }
        text.push_str(&dir.to_string_lossy());
        text.push('\n');
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write_atomic(path, text.as_bytes()).map_err(ConfigError::Store)
}

fn default_store_dir(lookup: &impl Fn(&str) -> Option<OsString>) -> Result<PathBuf, ConfigError> {
    if let Some(cache) = lookup("XDG_CACHE_HOME").map(PathBuf::from).filter(|p| p.is_absolute()) {
        return Ok(cache.join("zstore").join("implementations"));
    }
    lookup("HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .map(|home| home.join(".cache").join("zstore").join("implementations"))
        .ok_or(ConfigError::NoHome)
}

fn config_dir(lookup: &impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    if let Some(dir) = lookup("ZSTORE_CONFIG_DIR").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    if let Some(config) = lookup("XDG_CONFIG_HOME").map(PathBuf::from).filter(|p| p.is_absolute()) {
        return Some(config.join("zstore"));
    }
    lookup("HOME").map(|home| PathBuf::from(home).join(".config").join("zstore"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No default cache directory can be derived from the environment.
    #[error("neither XDG_CACHE_HOME nor HOME is set to an absolute path")]
    NoHome,

    /// An implementation directory read or written is not an absolute path.
    #[error("{file}:{line}: implementation directory must be absolute, got {value:?}")]
    RelativePath { file: PathBuf, line: usize, value: String },

    /// An `implementation-dirs` file or its directory could not be read or created.
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// Writing the `implementation-dirs` file failed.
    #[error(transparent)]
    Store(StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars.iter().map(|(k, v)| (k.to_string(), OsString::from(v))).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[cfg(unix)]
    #[test]
    fn env_list_replaces_defaults() {
        let list = env::join_paths(["/srv/a", "/srv/b"]).unwrap();
        let list = list.to_string_lossy().into_owned();
        let cfg = StoreConfig::from_lookup(lookup(&[("ZSTORE_IMPLEMENTATION_DIRS", list.as_str()), ("HOME", "/home/u")])).unwrap();
        assert_eq!(cfg.implementation_dirs, vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]);
        assert!(cfg.options.write_protection);
    }

    #[cfg(unix)]
    #[test]
    fn default_dir_prefers_xdg_cache() {
        let cfg = StoreConfig::from_lookup(lookup(&[
            ("XDG_CACHE_HOME", "/xdg/cache"),
            ("HOME", "/home/u"),
            ("ZSTORE_CONFIG_DIR", "/nonexistent/zstore-config"),
        ]))
        .unwrap();
        assert_eq!(cfg.implementation_dirs, vec![PathBuf::from("/xdg/cache/zstore/implementations")]);

        let cfg = StoreConfig::from_lookup(lookup(&[
            ("HOME", "/home/u"),
            ("ZSTORE_CONFIG_DIR", "/nonexistent/zstore-config"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.implementation_dirs,
            vec![PathBuf::from("/home/u/.cache/zstore/implementations")]
        );
    }

    #[test]
    fn missing_home_is_an_error() {
        assert!(matches!(StoreConfig::from_lookup(lookup(&[])), Err(ConfigError::NoHome)));
    }

    #[cfg(unix)]
    #[test]
    fn write_protection_can_be_disabled() {
        let cfg = StoreConfig::from_lookup(lookup(&[
            ("HOME", "/home/u"),
            ("ZSTORE_CONFIG_DIR", "/nonexistent/zstore-config"),
            ("ZSTORE_WRITE_PROTECTION", "0"),
        ]))
        .unwrap();
        assert!(!cfg.options.write_protection);
    }

    #[cfg(unix)]
    #[test]
    fn dirs_file_adds_roots_after_default() {
        let config = tempfile::tempdir().unwrap();
        fs::write(
            config.path().join(IMPLEMENTATION_DIRS_FILE),
            "# shared caches\n/var/cache/zstore\n\n/opt/zstore # site\n",
        )
        .unwrap();
        let cfg = StoreConfig::from_lookup(lookup(&[
            ("HOME", "/home/u"),
            ("ZSTORE_CONFIG_DIR", config.path().to_str().unwrap()),
        ]))
        .unwrap();
        assert_eq!(
            cfg.implementation_dirs,
            vec![
                PathBuf::from("/home/u/.cache/zstore/implementations"),
                PathBuf::from("/var/cache/zstore"),
                PathBuf::from("/opt/zstore"),
            ]
        );
    }

    #[test]
    fn relative_entries_are_rejected() {
        let config = tempfile::tempdir().unwrap();
        let file = config.path().join(IMPLEMENTATION_DIRS_FILE);
        fs::write(&file, "relative/dir\n").unwrap();
        assert!(matches!(read_dirs_file(&file), Err(ConfigError::RelativePath { line: 1, .. })));
    }

    #[test]
    fn write_then_read_dirs_file() {
        let config = tempfile::tempdir().unwrap();
        let file = config.path().join("nested").join(IMPLEMENTATION_DIRS_FILE);
        let dirs = vec![config.path().join("a"), config.path().join("b")];
        write_dirs_file(&file, &dirs).unwrap();
        assert_eq!(read_dirs_file(&file).unwrap(), dirs);
    }

    #[test]
    fn open_stores_builds_composite() {
        let base = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            implementation_dirs: vec![base.path().join("one"), base.path().join("two")],
            options: StoreOptions::default(),
        };
        let composite = cfg.open_stores().unwrap();
        assert_eq!(composite.stores().len(), 2);
        assert!(base.path().join("one").is_dir());
    }
}
