// Rejects lint-suppression attributes ("#[" + "allow" + ...) in dispatchcore sources.
// Runs on every build so a suppression cannot slip in through a downstream build either.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED: [&str; 2] = ["src", "tests"];
const SKIPPED_DIRS: [&str; 2] = ["target", ".git"];

fn main() {
    // DISPATCHCORE_ALLOW_LINTS=1 turns the guard off for local experiments.
    if env::var("DISPATCHCORE_ALLOW_LINTS").is_ok_and(|v| v == "1") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));
    for relative in SCANNED {
        println!("cargo:rerun-if-changed={relative}");
    }

    let mut violations = Vec::new();
    for relative in SCANNED {
        let path = manifest_dir.join(relative);
        if path.exists() {
            collect_violations(&path, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in dispatchcore:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("lint suppression attributes are forbidden");
}

fn collect_violations(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        if SKIPPED_DIRS.iter().any(|dir| path.ends_with(dir)) {
            return;
        }
        for entry in fs::read_dir(path).expect("read dir") {
            collect_violations(&entry.expect("dir entry").path(), violations);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let needle = concat!("#", "[allow");
    let inner_needle = concat!("#!", "[allow");
    for (idx, line) in content.lines().enumerate() {
        if line.contains(needle) || line.contains(inner_needle) {
            violations.push((path.to_path_buf(), idx + 1, line.to_string()));
        }
    }
}
