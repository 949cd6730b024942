
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Longest collection or flag name any engine accepts.
pub const MAX_INDEX_NAME_LEN: usize = 63;
/// Pinecone index names are shorter and use `-`.
pub const PINECONE_INDEX_NAME_LEN: usize = 45;

const HASH_LEN: usize = 8;

/// Build a deterministic, length-bounded name from `parts`.
///
/// Each part is lowercased with runs of other characters collapsed to
/// `separator`. An 8 hex digit hash of the raw parts is appended, so inputs that
/// normalize or truncate to the same text still get distinct names.
pub fn derive_name(parts: &[&str], max_len: usize, separator: char) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let suffix = digest.iter().take(HASH_LEN / 2).fold(String::new(), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    });

    let mut base = parts
        .iter()
        .map(|part| normalize_part(part, separator))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(&separator.to_string());
    if !base.starts_with(|c: char| c.is_ascii_lowercase()) {
        base.insert(0, 'v');
    }

    base.truncate(max_len.saturating_sub(HASH_LEN + 1));
    format!("{}{}{}", base.trim_end_matches(separator), separator, suffix)
}

fn normalize_part(part: &str, separator: char) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with(separator) {
            out.push(separator);
        }
    }
    out.trim_matches(separator).to_string()
}

/// Vector collection name for one library and model.
#[inline]
pub fn generate_index_name(account: &str, library: &str, model: &str) -> String {
    derive_name(&[account, library, model], MAX_INDEX_NAME_LEN, '_')
}

/// Collection name adjusted to what `engine` accepts.
pub fn engine_index_name(engine: &str, account: &str, library: &str, model: &str) -> String {
    match engine {
        "pinecone" => derive_name(&[account, library, model], PINECONE_INDEX_NAME_LEN, '-'),
        "weaviate" => {
            let name = generate_index_name(account, library, model);
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => name,
            }
        }
        _ => generate_index_name(account, library, model),
    }
}

/// Key under which blocks embedded by (`engine`, `model`) are flagged.
#[inline]
pub fn flag_key(engine: &str, model: &str) -> String {
    derive_name(&[engine, model], MAX_INDEX_NAME_LEN, '_')
}
