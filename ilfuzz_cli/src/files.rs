use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ilfuzz::constants::CORE_LIBRARY_NAME;

/// Resolves the module argument. `*` and `?` in the file name select every
/// matching file of the directory, in name order.
pub fn expand(path: &Path) -> Result<Vec<PathBuf>> {
    let pattern = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !pattern.contains(['*', '?']) {
        if !path.is_file() {
            bail!("Specified file does not exist: {}", path.display());
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let pattern: Vec<char> = pattern.chars().collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)
        .with_context(|| format!("Failed to list {}", directory.display()))?
    {
        let entry = entry?;
        let name: Vec<char> = entry.file_name().to_string_lossy().chars().collect();
        if entry.file_type()?.is_file() && wildcard_match(&pattern, &name) {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        bail!("Files were not found: {}", path.display());
    }
    files.sort();
    Ok(files)
}

pub fn is_core_library(path: &Path) -> bool {
    path.file_stem()
        .is_some_and(|stem| stem == CORE_LIBRARY_NAME)
}

fn wildcard_match(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    // Position of the last `*` and the name index it is currently covering.
    let mut star = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match star {
                Some((star_p, star_n)) => {
                    p = star_p + 1;
                    n = star_n + 1;
                    star = Some((star_p, star_n + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, name: &str) -> bool {
        let pattern: Vec<char> = pattern.chars().collect();
        let name: Vec<char> = name.chars().collect();
        wildcard_match(&pattern, &name)
    }

    #[test]
    fn wildcards() {
        assert!(matches("*.dll", "Acme.dll"));
        assert!(matches("Acme.*.dll", "Acme.Parser.dll"));
        assert!(matches("Ac?e.dll", "Acme.dll"));
        assert!(matches("*", ""));
        assert!(!matches("*.dll", "Acme.pdb"));
        assert!(!matches("Ac?e.dll", "Ace.dll"));
    }

    #[test]
    fn expands_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.dll", "a.dll", "c.pdb"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = expand(&dir.path().join("*.dll")).unwrap();
        assert_eq!(files, vec![dir.path().join("a.dll"), dir.path().join("b.dll")]);
        assert!(expand(&dir.path().join("*.exe")).is_err());
        assert!(expand(&dir.path().join("missing.dll")).is_err());
    }

    #[test]
    fn core_library_is_recognized_by_stem() {
        assert!(is_core_library(Path::new("/rt/System.Private.CoreLib.dll")));
        assert!(!is_core_library(Path::new("/rt/System.Runtime.dll")));
    }
}
