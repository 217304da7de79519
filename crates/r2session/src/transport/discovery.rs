//! radare2 discovery and version checks
//!
//! # Search Strategy
//!
//! [`R2Discovery::find`] looks for the executable in this order:
//!
//! 1. **Explicit path** - If provided as an argument
//! 2. **R2_PATH** - Environment variable
//! 3. **PATH** - `radare2`, then the `r2` alias
//! 4. **Common locations** - Platform-specific install directories
//!
//! # Example
//!
//! ```rust,no_run
//! use r2session::transport::R2Discovery;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let r2 = R2Discovery::find(None).await?;
//! let version = R2Discovery::version(&r2).await?;
//! println!("radare2 {} at {}", version, r2.display());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use semver::Version;
use tracing::debug;

use crate::error::R2Error;

/// Environment variable naming an explicit radare2 executable
pub const R2_PATH_ENV: &str = "R2_PATH";

/// radare2 discovery utility
pub struct R2Discovery;

impl R2Discovery {
    /// Find the radare2 executable
    ///
    /// # Returns
    ///
    /// - `Ok(PathBuf)` - Path to the executable
    /// - `Err(R2Error::NotFound)` - Not found in any location
    pub async fn find(r2_path: Option<&Path>) -> Result<PathBuf, R2Error> {
        if let Some(path) = r2_path {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            debug!("Explicit radare2 path {} does not exist", path.display());
        }

        if let Ok(env_path) = std::env::var(R2_PATH_ENV) {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Some(path) = Self::search_path() {
            return Ok(path);
        }

        Self::common_locations()
            .into_iter()
            .find(|location| location.exists())
            .ok_or(R2Error::NotFound)
    }

    /// Read the version reported by `<r2> -v`
    ///
    /// radare2 prints `radare2 5.9.4 32373 @ linux-x86-64` on the first line;
    /// the second token is parsed as a semantic version.
    pub async fn version(r2: &Path) -> Result<Version, R2Error> {
        let output = tokio::process::Command::new(r2)
            .arg("-v")
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    R2Error::NotFound
                } else {
                    R2Error::Spawn(e.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(R2Error::InvalidVersion {
                version: format!("Failed to run -v: {}", stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version_line(stdout.lines().next().unwrap_or_default())
    }

    /// Ensure radare2 at `r2` is at least `min`
    pub async fn validate_version(r2: &Path, min: &Version) -> Result<Version, R2Error> {
        let version = Self::version(r2).await?;
        if version < *min {
            return Err(R2Error::InvalidVersion {
                version: version.to_string(),
            });
        }
        Ok(version)
    }

    fn search_path() -> Option<PathBuf> {
        let path_env = std::env::var_os("PATH")?;

        let names: &[&str] = if cfg!(windows) {
            &["radare2.exe", "r2.exe"]
        } else {
            &["radare2", "r2"]
        };

        for name in names {
            for dir in std::env::split_paths(&path_env) {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }

        None
    }

    fn common_locations() -> Vec<PathBuf> {
        let mut locations = vec![
            PathBuf::from("/opt/homebrew/bin/radare2"),
            PathBuf::from("/usr/local/bin/radare2"),
            PathBuf::from("/usr/bin/radare2"),
        ];

        if let Ok(home) = std::env::var("HOME") {
            let home = PathBuf::from(home);
            locations.push(home.join(".local/bin/radare2"));
            locations.push(home.join("bin/prefix/radare2/bin/radare2"));
        }

        locations
    }
}

fn parse_version_line(line: &str) -> Result<Version, R2Error> {
    let token = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| R2Error::InvalidVersion {
            version: if line.is_empty() {
                "empty output".to_string()
            } else {
                line.to_string()
            },
        })?;

    Version::parse(token).map_err(|_| R2Error::InvalidVersion {
        version: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_line() {
        let v = parse_version_line("radare2 5.9.4 32373 @ linux-x86-64").unwrap();
        assert_eq!(v, Version::new(5, 9, 4));
    }

    #[test]
    fn test_parse_git_build() {
        let v = parse_version_line("radare2 5.9.5-git 1 @ darwin-arm-64").unwrap();
        assert_eq!(v.major, 5);
        assert!(!v.pre.is_empty());
    }

    #[test]
    fn test_parse_empty_line() {
        let err = parse_version_line("").unwrap_err();
        assert!(matches!(err, R2Error::InvalidVersion { version } if version == "empty output"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_version_line("radare2 five"),
            Err(R2Error::InvalidVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_with_explicit_path() {
        let exe = std::env::current_exe().unwrap();
        let found = R2Discovery::find(Some(&exe)).await.unwrap();
        assert_eq!(found, exe);
    }

    #[tokio::test]
    async fn test_find_with_nonexistent_explicit_path() {
        let fake = PathBuf::from("/nonexistent/fake/radare2");
        match R2Discovery::find(Some(&fake)).await {
            Ok(path) => assert_ne!(path, fake),
            Err(R2Error::NotFound) => {}
            Err(e) => panic!("Unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_version_invalid_path() {
        let result = R2Discovery::version(Path::new("/nonexistent/fake/radare2")).await;
        assert!(matches!(result, Err(R2Error::NotFound)));
    }

    #[test]
    fn test_common_locations_are_absolute() {
        for location in R2Discovery::common_locations() {
            assert!(location.is_absolute());
        }
    }
}
