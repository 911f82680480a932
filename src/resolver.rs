//! Path/recipe resolution.
//!
//! Given a target path, enumerate candidate recipe files in a
//! deterministic order and return the first one that exists. Every path
//! probed along the way — including the winner — is reported so the
//! caller can record `m`/`c` dependency edges.

use std::path::{Path, PathBuf};

/// One probed candidate recipe path and whether it was the winner.
#[derive(Debug, Clone)]
pub struct Probe {
    pub path: PathBuf,
    pub found: bool,
}

/// A selected recipe, with the pieces `$1`/`$2`/`$3` argv construction
/// needs.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Directory the recipe lives in (and the directory the recipe runs
    /// in once forked).
    pub recipe_dir: PathBuf,
    /// The `.do` file itself, relative to `recipe_dir`.
    pub recipe_file: PathBuf,
    /// Directory containing the target.
    pub base_dir: PathBuf,
    /// Target's filename stem relative to the matched generic rule (`$1`
    /// without the extension, or the whole filename for an exact rule).
    pub base_name: String,
    /// Extension matched by a generic rule (may be empty for `default.do`
    /// or an exact `<filename>.do` rule).
    pub ext: String,
}

/// Resolver outcome: either a selected recipe, or "no rule", paired in
/// both cases with every candidate path probed along the way in probe
/// order.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub recipe: Option<Recipe>,
    pub probes: Vec<Probe>,
}

impl Resolution {
    /// Iterate dependency edges to record: `(kind_is_match, path)` pairs
    /// in probe order, every miss before the winner.
    pub fn dep_edges(&self) -> impl Iterator<Item = (bool, &Path)> {
        self.probes.iter().map(|p| (p.found, p.path.as_path()))
    }
}

/// Resolve `target` (a path relative to `base`) against the filesystem
/// rooted at `base`.
pub fn resolve(base: &Path, target: &Path) -> Resolution {
    let mut probes = Vec::new();

    let target_dir = target.parent().unwrap_or_else(|| Path::new(""));
    let filename = target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    // 1. Exact rule in the target's own directory.
    let exact = join_rel(base, target_dir, &format!("{}.do", filename));
    let exact_found = exact.exists();
    probes.push(Probe {
        path: exact.clone(),
        found: exact_found,
    });
    if exact_found {
        return Resolution {
            recipe: Some(Recipe {
                recipe_dir: join_rel(base, target_dir, ""),
                recipe_file: PathBuf::from(format!("{}.do", filename)),
                base_dir: join_rel(base, target_dir, ""),
                base_name: filename.clone(),
                ext: String::new(),
            }),
            probes,
        };
    }

    // 2/3. Generic rules, walking from target_dir up to BASE, exhausting
    // every split of `filename` at each level before moving to the
    // parent.
    let parts: Vec<&str> = filename.split('.').collect();

    for dir in ancestors_from(target_dir) {
        for i in 1..=parts.len() {
            let remainder = &parts[i..];
            let (candidate_name, ext) = if remainder.is_empty() {
                ("default.do".to_string(), String::new())
            } else {
                (
                    format!("default.{}.do", remainder.join(".")),
                    format!(".{}", remainder.join(".")),
                )
            };
            let base_name = parts[..i].join(".");

            let candidate = join_rel(base, &dir, &candidate_name);
            let found = candidate.exists();
            probes.push(Probe {
                path: candidate.clone(),
                found,
            });
            if found {
                return Resolution {
                    recipe: Some(Recipe {
                        recipe_dir: join_rel(base, &dir, ""),
                        recipe_file: PathBuf::from(candidate_name),
                        base_dir: join_rel(base, target_dir, ""),
                        base_name,
                        ext,
                    }),
                    probes,
                };
            }
        }
    }

    Resolution {
        recipe: None,
        probes,
    }
}

/// `target_dir` itself, then each ancestor directory up to (and
/// including) the filesystem root.
fn ancestors_from(target_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut cur = if target_dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        target_dir.to_path_buf()
    };
    loop {
        dirs.push(cur.clone());
        match cur.parent() {
            Some(p) if p != cur => cur = p.to_path_buf(),
            _ => break,
        }
    }
    dirs
}

fn join_rel(base: &Path, dir: &Path, name: &str) -> PathBuf {
    let mut p = base.join(dir);
    if !name.is_empty() {
        p.push(name);
    }
    p
}
