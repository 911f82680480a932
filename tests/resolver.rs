//! Integration-level coverage of path/recipe resolution as the
//! orchestrator actually consumes it: through `dep_edges()`, across
//! directory trees deeper than the unit tests in `src/resolver.rs` probe.

use std::fs;
use std::path::Path;

use redo_core::DepKind;

#[test]
fn dep_edges_report_every_miss_before_the_match_in_probe_order() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    fs::write(base.join("default.do"), "echo root\n").unwrap();

    let res = redo_core::resolver::resolve(base, Path::new("a.b.c"));
    let edges: Vec<(DepKind, String)> = res
        .dep_edges()
        .map(|(found, path)| {
            let kind = if found { DepKind::Match } else { DepKind::CandidateMiss };
            (kind, path.file_name().unwrap().to_string_lossy().into_owned())
        })
        .collect();

    // Exact rule first, then every generic split from most to least
    // specific, all misses except the final winner.
    assert_eq!(edges.last().unwrap().0, DepKind::Match);
    assert!(edges[..edges.len() - 1].iter().all(|(kind, _)| *kind == DepKind::CandidateMiss));
    assert_eq!(edges.last().unwrap().1, "default.do");
}

#[test]
fn deeper_directory_walks_up_through_every_ancestor() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    fs::create_dir_all(base.join("a/b/c")).unwrap();
    fs::write(base.join("default.do"), "echo top\n").unwrap();

    let res = redo_core::resolver::resolve(base, Path::new("a/b/c/out.txt"));
    let recipe = res.recipe.expect("should fall back to the top-level generic rule");
    assert_eq!(recipe.recipe_dir, base.to_path_buf());
    assert_eq!(recipe.base_dir, base.join("a/b/c"));
    assert_eq!(recipe.base_name, "out.txt");
    assert_eq!(recipe.ext, "");
}

#[test]
fn a_closer_generic_rule_shadows_a_farther_more_specific_one() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    fs::create_dir(base.join("sub")).unwrap();
    fs::write(base.join("default.txt.do"), "echo far\n").unwrap();
    fs::write(base.join("sub/default.do"), "echo near\n").unwrap();

    let res = redo_core::resolver::resolve(base, Path::new("sub/report.txt"));
    let recipe = res.recipe.unwrap();
    assert_eq!(recipe.recipe_dir, base.join("sub"));
    assert_eq!(recipe.base_name, "report.txt");
}

#[test]
fn missing_rule_still_probes_every_directory_up_to_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    fs::create_dir_all(base.join("x/y")).unwrap();

    let res = redo_core::resolver::resolve(base, Path::new("x/y/out"));
    assert!(res.recipe.is_none());
    // One exact-rule probe plus one `default.do` probe per directory level
    // (x/y, x, .), none with an extension split since `out` has none.
    assert_eq!(res.probes.len(), 4);
    assert!(res.probes.iter().all(|p| !p.found));
}
