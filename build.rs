//! Generates the `ErrorKind` enum consumed by `bft::error`, from the
//! flat list of kinds in `build_support/error_kinds.txt` -- one kind
//! per crate module, so a new module just appends a line here instead
//! of hand-editing a giant enum.

use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

fn main() {
    println!("cargo:rerun-if-changed=build_support/error_kinds.txt");

    let kinds_src = fs::read_to_string("build_support/error_kinds.txt")
        .expect("failed to read build_support/error_kinds.txt");

    let variants = kinds_src
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect_vec();

    let mut out = String::new();
    out.push_str("/// The kind of error that occurred somewhere in the ordering engine.\n");
    out.push_str("#[derive(Debug, Copy, Clone, Eq, PartialEq)]\n");
    out.push_str("pub enum ErrorKind {\n");
    for variant in &variants {
        out.push_str("    ");
        out.push_str(variant);
        out.push_str(",\n");
    }
    out.push_str("}\n");

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("error_kind.rs");
    fs::write(dest, out).expect("failed to write error_kind.rs");
}
