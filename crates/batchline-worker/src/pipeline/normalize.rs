//! Header normalization
//!
//! The same rules run in the pipeline and in `preview`, so both must see
//! identical keys for identical input:
//!
//! 1. strip a leading byte-order mark (U+FEFF)
//! 2. collapse every line break run, with the whitespace around it, to one space
//! 3. trim
//! 4. a blank header becomes `column_<position>` (1-based)
//! 5. repeated names (case-insensitive) become `<name>_2`, `<name>_3`, ...,
//!    never reusing a name that appears anywhere in the header row

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::unwrap_used)]
static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*[\r\n]+\s*").unwrap());

/// Name used for a header cell that is blank after cleanup, and for cells
/// beyond the end of the header row.
pub fn synthesized_name(position: usize) -> String {
    format!("column_{position}")
}

/// Steps 1 to 4 for a single header at 1-based `position`.
pub fn clean_header(raw: &str, position: usize) -> String {
    let without_bom = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let collapsed = LINE_BREAKS.replace_all(without_bom, " ");
    let trimmed = collapsed.trim();

    if trimmed.is_empty() {
        synthesized_name(position)
    } else {
        trimmed.to_string()
    }
}

/// Normalize a full header row.
pub fn normalize_headers<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let cleaned: Vec<String> = raw
        .iter()
        .enumerate()
        .map(|(i, h)| clean_header(h.as_ref(), i + 1))
        .collect();

    let mut reserved: HashSet<String> = cleaned.iter().map(|h| h.to_lowercase()).collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(cleaned.len());
    let mut normalized = Vec::with_capacity(cleaned.len());

    for name in cleaned {
        let key = name.to_lowercase();
        if seen.insert(key) {
            normalized.push(name);
            continue;
        }

        let mut suffix = 2;
        let unique = loop {
            let candidate = format!("{name}_{suffix}");
            let candidate_key = candidate.to_lowercase();
            if !reserved.contains(&candidate_key) && !seen.contains(&candidate_key) {
                break candidate;
            }
            suffix += 1;
        };

        let unique_key = unique.to_lowercase();
        reserved.insert(unique_key.clone());
        seen.insert(unique_key);
        normalized.push(unique);
    }

    normalized
}
