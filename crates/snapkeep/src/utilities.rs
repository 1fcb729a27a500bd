use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Locates the external programs pipelines are built from.
///
/// `[utilities]` entries in the job config pin a program to an absolute path; anything else is
/// searched for on `PATH` at the time a pipeline is built.
#[derive(Debug, Clone, Default)]
pub struct Utilities {
    overrides: BTreeMap<String, PathBuf>,
}

impl Utilities {
    pub fn new(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (name, raw) in overrides {
            let p = PathBuf::from(raw.trim());
            if !p.is_absolute() {
                return Err(Error::config(format!(
                    "utilities.{name} must be an absolute path (got '{raw}')"
                )));
            }
            out.insert(name.trim().to_string(), p);
        }
        Ok(Self { overrides: out })
    }

    pub fn resolve(&self, name: &str) -> Result<String> {
        if let Some(p) = self.overrides.get(name) {
            if !is_executable(p) {
                return Err(Error::config(format!(
                    "utilities.{name} = '{}' is not an executable file",
                    p.display()
                )));
            }
            return Ok(p.display().to_string());
        }
        find_in_path(name)
            .map(|p| p.display().to_string())
            .ok_or_else(|| {
                Error::config(format!(
                    "could not locate '{name}' on PATH; set utilities.{name} in the job config"
                ))
            })
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|cand| is_executable(cand))
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = p.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh_on_path() {
        let u = Utilities::default();
        let sh = u.resolve("sh").expect("sh on PATH");
        assert!(sh.ends_with("/sh"), "{sh}");
    }

    #[test]
    fn missing_utility_is_a_configuration_error() {
        let err = Utilities::default()
            .resolve("snapkeep-no-such-tool")
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("utilities.snapkeep-no-such-tool"));
    }

    #[test]
    fn relative_override_is_rejected() {
        let mut o = BTreeMap::new();
        o.insert("tar".to_string(), "bin/tar".to_string());
        assert!(Utilities::new(&o).is_err());
    }

    #[test]
    fn override_must_exist() {
        let mut o = BTreeMap::new();
        o.insert("tar".to_string(), "/nonexistent/snapkeep/tar".to_string());
        let u = Utilities::new(&o).unwrap();
        assert!(u.resolve("tar").is_err());
    }
}
