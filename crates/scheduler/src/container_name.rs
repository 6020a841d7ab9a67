//! Container name allocation (spec.md §5 "Shared resources": names must be
//! unique per live container and are allocated synchronously by the
//! scheduler before a scan job starts, per the §9 "push model" resolution).

use rand::Rng;

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 10;

#[must_use]
pub fn allocate() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN).map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char).collect();
    format!("nuclei_scan_{suffix}")
}
