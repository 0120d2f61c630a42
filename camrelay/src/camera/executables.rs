use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Directories searched after the bundled directory and before `PATH`.
const FIXED_SEARCH_DIRS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/run/current-system/sw/bin",
    "/nix/var/nix/profiles/default/bin",
    "~/.nix-profile/bin",
    "~/.local/bin",
    "/usr/bin",
    "/bin",
];

/**
    Resolved absolute paths to the external tools the relay drives.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutablePaths {
    pub ffmpeg: Option<PathBuf>,
    pub camsnap: Option<PathBuf>,
}

/**
    Snapshot of the process environment used for executable lookup.

    Captured once so resolution is deterministic and testable without
    mutating the real environment.
*/
#[derive(Debug, Clone, Default)]
pub struct SearchEnvironment {
    pub home: Option<PathBuf>,
    pub bundled_dir: Option<PathBuf>,
    pub vars: HashMap<String, String>,
}

impl SearchEnvironment {
    pub fn from_process() -> Self {
        let bundled_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            home: dirs::home_dir(),
            bundled_dir,
            vars: std::env::vars().collect(),
        }
    }

    /// Expand a leading `~` against the home directory.
    pub fn expand_tilde(&self, raw: &str) -> PathBuf {
        match (raw.strip_prefix('~'), &self.home) {
            (Some(rest), Some(home)) if rest.is_empty() => home.clone(),
            (Some(rest), Some(home)) if rest.starts_with('/') => {
                home.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(raw),
        }
    }

    /// Bundled dir, fixed list, then inherited `PATH`, deduplicated in order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let inherited = self
            .vars
            .get("PATH")
            .map(|p| {
                p.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let candidates = self
            .bundled_dir
            .iter()
            .cloned()
            .chain(FIXED_SEARCH_DIRS.iter().map(|d| self.expand_tilde(d)))
            .chain(inherited);

        let mut seen = HashSet::new();
        candidates
            .filter(|dir| seen.insert(dir.clone()))
            .collect()
    }

    /// `PATH` value handed to the transcoder.
    pub fn path_var(&self) -> OsString {
        std::env::join_paths(self.search_paths()).unwrap_or_default()
    }

    /**
        Resolve `name`: explicit override, then `<NAME>_PATH`, then the
        search directories. The first executable match wins.
    */
    pub fn resolve(&self, name: &str, override_path: Option<&str>) -> Option<PathBuf> {
        if let Some(raw) = override_path.filter(|p| !p.trim().is_empty()) {
            let expanded = self.expand_tilde(raw.trim());
            if is_executable(&expanded) {
                return Some(expanded);
            }
            tracing::warn!(name, path = %expanded.display(), "override is not executable");
        }

        let env_var = format!("{}_PATH", name.to_uppercase());
        if let Some(path) = self.vars.get(&env_var).map(PathBuf::from)
            && is_executable(&path)
        {
            return Some(path);
        }

        self.search_paths()
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    pub fn resolve_all(
        &self,
        ffmpeg_override: Option<&str>,
        camsnap_override: Option<&str>,
    ) -> ExecutablePaths {
        ExecutablePaths {
            ffmpeg: self.resolve("ffmpeg", ffmpeg_override),
            camsnap: self.resolve("camsnap", camsnap_override),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn env_with(vars: &[(&str, &str)]) -> SearchEnvironment {
        SearchEnvironment {
            home: Some(PathBuf::from("/home/tester")),
            bundled_dir: None,
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_override_wins_over_env_and_path() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let over = make_tool(a.path(), "ffmpeg");
        let from_env = make_tool(b.path(), "ffmpeg-env");

        let env = env_with(&[
            ("FFMPEG_PATH", from_env.to_str().unwrap()),
            ("PATH", b.path().to_str().unwrap()),
        ]);
        assert_eq!(env.resolve("ffmpeg", over.to_str()), Some(over));
    }

    #[test]
    fn test_env_var_before_search_paths() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        make_tool(a.path(), "ffmpeg");
        let from_env = make_tool(b.path(), "custom-ffmpeg");

        let env = env_with(&[
            ("FFMPEG_PATH", from_env.to_str().unwrap()),
            ("PATH", a.path().to_str().unwrap()),
        ]);
        assert_eq!(env.resolve("ffmpeg", None), Some(from_env));
    }

    #[test]
    fn test_non_executable_override_falls_through() {
        let a = tempfile::tempdir().unwrap();
        let plain = a.path().join("ffmpeg");
        std::fs::write(&plain, "").unwrap();
        let bundled = tempfile::tempdir().unwrap();
        let tool = make_tool(bundled.path(), "ffmpeg");

        let mut env = env_with(&[]);
        env.bundled_dir = Some(bundled.path().to_path_buf());
        assert_eq!(env.resolve("ffmpeg", plain.to_str()), Some(tool));
    }

    #[test]
    fn test_search_paths_dedup_preserves_order() {
        let env = env_with(&[("PATH", "/usr/bin:/custom/bin::/usr/local/bin:/custom/bin")]);
        let paths = env.search_paths();

        assert_eq!(paths[0], PathBuf::from("/opt/homebrew/bin"));
        assert_eq!(paths[4], PathBuf::from("/home/tester/.nix-profile/bin"));
        assert_eq!(paths.last(), Some(&PathBuf::from("/custom/bin")));
        let usr_bin = paths.iter().filter(|p| **p == Path::new("/usr/bin")).count();
        assert_eq!(usr_bin, 1);
    }

    #[test]
    fn test_missing_tool_is_none() {
        let empty = tempfile::tempdir().unwrap();
        let env = SearchEnvironment {
            home: None,
            bundled_dir: Some(empty.path().to_path_buf()),
            vars: HashMap::new(),
        };
        assert_eq!(env.resolve("definitely-not-a-real-tool-name", None), None);
    }

    #[test]
    fn test_expand_tilde() {
        let env = env_with(&[]);
        assert_eq!(env.expand_tilde("~/bin/ffmpeg"), PathBuf::from("/home/tester/bin/ffmpeg"));
        assert_eq!(env.expand_tilde("/abs/ffmpeg"), PathBuf::from("/abs/ffmpeg"));
    }
}
