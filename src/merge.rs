use std::collections::HashMap;

use crate::entity::Canonical;

/// Concatenates source batches in order and collapses duplicates.
///
/// The first record seen for an identity keeps its id, source and non-empty
/// fields; later duplicates only fill fields that are still empty and add
/// their provider ids. The result is sorted with `Canonical::order`, so the
/// output does not depend on which source answered first.
pub fn merge_records<T: Canonical>(batches: Vec<Vec<T>>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for batch in batches {
        for record in batch {
            let identity = record.identity();
            if identity.is_empty() {
                out.push(record);
                continue;
            }
            match index.get(&identity) {
                Some(&pos) => {
                    let existing = &mut out[pos];
                    existing.fill_from(&record);
                    for (source, id) in record.external_ids() {
                        existing
                            .external_ids_mut()
                            .entry(source.clone())
                            .or_insert_with(|| id.clone());
                    }
                }
                None => {
                    index.insert(identity, out.len());
                    out.push(record);
                }
            }
        }
    }

    out.sort_by(|a, b| a.order(b));
    out
}

pub fn fill(slot: &mut Option<String>, other: &Option<String>) {
    let empty = slot.as_deref().is_none_or(|s| s.trim().is_empty());
    if !empty {
        return;
    }
    if let Some(value) = other.as_deref().filter(|s| !s.trim().is_empty()) {
        *slot = Some(value.to_string());
    }
}

pub fn fill_copy<T: Copy>(slot: &mut Option<T>, other: Option<T>) {
    if slot.is_none() {
        *slot = other;
    }
}

/// Case, accent and punctuation insensitive form of a person's name.
pub fn normalize_person_name(raw: &str) -> String {
    canonical_words(raw).join(" ")
}

/// Like `normalize_person_name`, minus club affixes (`FC`, `CF`, `Club`, ...).
pub fn normalize_team_name(raw: &str) -> String {
    let words = canonical_words(raw);
    let kept: Vec<&str> = words
        .iter()
        .map(String::as_str)
        .filter(|w| {
            !matches!(
                *w,
                "fc" | "cf" | "afc" | "sc" | "ac" | "club" | "cd" | "ud" | "sad" | "de" | "del"
            )
        })
        .collect();
    if kept.is_empty() {
        words.join(" ")
    } else {
        kept.join(" ")
    }
}

fn canonical_words(raw: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let folded = fold_accent(ch);
        if folded.is_alphanumeric() {
            cleaned.extend(folded.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().map(str::to_string).collect()
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' | 'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' | 'Ø' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        'ß' => 's',
        other => other,
    }
}
