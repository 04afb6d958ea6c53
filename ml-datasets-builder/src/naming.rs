//! Naming conventions for datasets, splits and their files

/// Convert a type name like `DummyBeamDataset` to `dummy_beam_dataset`.
///
/// An underscore goes before an uppercase letter that follows a lowercase
/// letter or digit, and before the last capital of an acronym that starts a
/// new word (`HTTPServer` becomes `http_server`).
pub fn camelcase_to_snakecase(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && prev != '_' {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Convert `dummy_beam_dataset` to `DummyBeamDataset`
pub fn snakecase_to_camelcase(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                .unwrap_or_default()
        })
        .collect()
}

/// Final path segment of a type name, without generic arguments
pub fn type_basename(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Prefix of the shard files of one split: `<dataset>-<split>`
pub fn filename_prefix_for_split(dataset: &str, split: &str) -> String {
    format!("{dataset}-{split}")
}

/// Whether `name` can be used as a split name: non-empty word characters
pub fn is_valid_split_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}
