//! Recipe invocation details: argv construction, shebang rewriting, and
//! temp-file naming.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

/// The fully constructed argv for invoking a recipe via `sh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeInvocation {
    pub argv: Vec<String>,
}

/// Build the argv for running `recipe` with the given `sh` flags and the
/// three positional arguments redo recipes receive: `$1` (base+ext),
/// `$2` (base), `$3` (relative tmp2 path).
///
/// If the recipe's first line is a shebang (`#!/...`), the leading `sh`
/// interpreter is replaced by splitting the shebang line on spaces, so
/// e.g. a `#!/usr/bin/env python3 -u` recipe runs as
/// `python3 -u <recipe> <arg1> <arg2> <tmp3>` instead of under `sh`.
pub fn build_argv(
    recipe_path: &Path,
    sh_flags: &str,
    arg1: &str,
    arg2: &str,
    tmp3_rel: &str,
) -> io::Result<RecipeInvocation> {
    let recipe = recipe_path.to_string_lossy().into_owned();

    let interpreter = read_shebang_interpreter(recipe_path)?;

    let mut argv = match interpreter {
        Some(parts) => parts,
        None => vec!["sh".to_string(), sh_flags.to_string()],
    };
    argv.push(recipe);
    argv.push(arg1.to_string());
    argv.push(arg2.to_string());
    argv.push(tmp3_rel.to_string());

    Ok(RecipeInvocation { argv })
}

/// Read just the first line of `recipe_path` and, if it starts with
/// `#!/`, return the interpreter and its arguments split on spaces.
/// Returns `Ok(None)` for a recipe with no shebang (or an empty file),
/// in which case the caller should fall back to `sh`.
fn read_shebang_interpreter(recipe_path: &Path) -> io::Result<Option<Vec<String>>> {
    let file = match std::fs::File::open(recipe_path) {
        Ok(f) => f,
        // A recipe that does not exist yet (e.g. in unit tests that only
        // exercise argv construction) falls back to plain `sh`.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut first_line = String::new();
    io::BufReader::new(file).read_line(&mut first_line)?;
    let first_line = first_line.trim_end_matches(['\n', '\r']);

    if let Some(rest) = first_line.strip_prefix("#!/") {
        let full = format!("/{}", rest);
        let parts: Vec<String> = full.split(' ').filter(|s| !s.is_empty()).map(String::from).collect();
        if !parts.is_empty() {
            return Ok(Some(parts));
        }
    }
    Ok(None)
}

/// Two sibling temp file paths for a target: `tmp1` captures stdout,
/// `tmp2` is the `$3` file the recipe may write explicitly.
#[derive(Debug, Clone)]
pub struct TempPaths {
    pub tmp1: PathBuf,
    pub tmp2: PathBuf,
    /// `tmp2`'s path relative to the recipe's working directory, which is
    /// what gets passed as `$3`.
    pub tmp2_rel: String,
}

/// Derive `tmpbase` by walking `target`'s path components from right to
/// left, replacing path separators with `__`, until the parent directory
/// of the resulting name exists. This keeps the temp files colocated with
/// the eventual output even for targets several directories deep inside a
/// not-yet-existing tree.
pub fn temp_paths(base: &Path, target: &Path) -> TempPaths {
    let components: Vec<String> = target
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    // Find the longest trailing run of components whose parent directory
    // (the directory containing the first of that run) exists.
    let mut split_at = components.len();
    for i in (0..components.len()).rev() {
        let parent_components = &components[..i];
        let parent_path: PathBuf = parent_components.iter().collect();
        let candidate_parent = base.join(&parent_path);
        if candidate_parent.is_dir() || parent_components.is_empty() {
            split_at = i;
            break;
        }
    }

    let parent_components = &components[..split_at];
    let name_components = &components[split_at..];
    let flat_name = name_components.join("__");

    let parent_path: PathBuf = parent_components.iter().collect();
    let dir = base.join(parent_path);

    TempPaths {
        tmp1: dir.join(format!("{}.redo1.tmp", flat_name)),
        tmp2: dir.join(format!("{}.redo2.tmp", flat_name)),
        tmp2_rel: format!("{}.redo2.tmp", flat_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn no_shebang_falls_back_to_sh() {
        let dir = tempdir().unwrap();
        let recipe = dir.path().join("x.do");
        fs::write(&recipe, "echo hi\n").unwrap();

        let inv = build_argv(&recipe, "-ev", "x", "x", "x.redo2.tmp").unwrap();
        assert_eq!(inv.argv[0], "sh");
        assert_eq!(inv.argv[1], "-ev");
    }

    #[test]
    fn shebang_with_args_replaces_interpreter() {
        let dir = tempdir().unwrap();
        let recipe = dir.path().join("x.do");
        fs::write(&recipe, "#!/usr/bin/env python3 -u\nprint(1)\n").unwrap();

        let inv = build_argv(&recipe, "-e", "x", "x", "x.redo2.tmp").unwrap();
        assert_eq!(inv.argv[0], "/usr/bin/env");
        assert_eq!(inv.argv[1], "python3");
        assert_eq!(inv.argv[2], "-u");
    }

    #[test]
    fn empty_recipe_falls_back_to_sh() {
        let dir = tempdir().unwrap();
        let recipe = dir.path().join("x.do");
        fs::write(&recipe, "").unwrap();

        let inv = build_argv(&recipe, "-e", "x", "x", "x.redo2.tmp").unwrap();
        assert_eq!(inv.argv[0], "sh");
    }

    #[test]
    fn temp_paths_flatten_missing_parents() {
        let dir = tempdir().unwrap();
        let base = dir.path();

        let paths = temp_paths(base, Path::new("deeply/nested/out.txt"));
        assert_eq!(paths.tmp1.parent().unwrap(), base);
        assert!(paths
            .tmp1
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("deeply__nested__out.txt"));
    }

    #[test]
    fn temp_paths_use_existing_parent_directly() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        fs::create_dir(base.join("sub")).unwrap();

        let paths = temp_paths(base, Path::new("sub/out.txt"));
        assert_eq!(paths.tmp1.parent().unwrap(), base.join("sub"));
        assert_eq!(
            paths.tmp1.file_name().unwrap().to_string_lossy(),
            "out.txt.redo1.tmp"
        );
    }
}
