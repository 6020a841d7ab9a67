//! Progress-prefix lookup table (spec.md §4.2).

/// Well-known informational line prefixes, in the order the scan lifecycle
/// actually emits them, each mapped to its fixed completion percentage.
const PROGRESS_STAGES: &[(&str, u8)] = &[
    ("[INF] Current", 5),       // "[INF] Current ... version"
    ("[INF] Creating runners", 30),
    ("[INF] New Scan Started", 70),
    ("[INF] Found", 90),
    ("scan completed", 95),
    ("No results found", 100),
];

/// Look up the fixed completion percentage for a known informational line,
/// or `None` if `line` doesn't match any recognized prefix.
#[must_use]
pub fn lookup_progress(line: &str) -> Option<u8> {
    PROGRESS_STAGES
        .iter()
        .find(|(prefix, _)| line.contains(prefix))
        .map(|(_, percent)| *percent)
}
