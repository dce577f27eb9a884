// SPDX-License-Identifier: GPL-3.0-only

//! Language code matching used to keep `Lang` and `PlatformLang` in step.
//!
//! ISO 639-2 code lists are packed three letter codes (`"engfra"`), RFC 4646
//! lists are separated by semicolons (`"en-US;fr"`). Inputs may carry a
//! trailing NUL as stored in variables.

pub const ISO_639_2_ENTRY_SIZE: usize = 3;

fn trim_nul(s: &[u8]) -> &[u8] {
    match s.iter().position(|&c| c == 0) {
        Some(end) => &s[..end],
        None => s,
    }
}

fn rfc4646_codes(supported: &[u8]) -> impl Iterator<Item = &[u8]> {
    trim_nul(supported).split(|&c| c == b';').filter(|code| !code.is_empty())
}

fn iso639_codes(supported: &[u8]) -> impl Iterator<Item = &[u8]> {
    trim_nul(supported).chunks(ISO_639_2_ENTRY_SIZE)
}

/// Position of `lang` inside `supported`.
pub fn index_of_lang(supported: &[u8], lang: &[u8], iso639: bool) -> Option<usize> {
    let lang = trim_nul(lang);
    if iso639 {
        let lang = lang.get(..ISO_639_2_ENTRY_SIZE)?;
        iso639_codes(supported).position(|code| code == lang)
    } else {
        rfc4646_codes(supported).position(|code| code == lang)
    }
}

/// Code at position `index` of `supported`.
pub fn lang_at_index(supported: &[u8], index: usize, iso639: bool) -> Option<&[u8]> {
    if iso639 {
        iso639_codes(supported)
            .nth(index)
            .filter(|code| code.len() == ISO_639_2_ENTRY_SIZE)
    } else {
        rfc4646_codes(supported).nth(index)
    }
}

/// Best entry of `supported` for the first candidate that has one.
///
/// Only the first code of each candidate is considered. ISO 639-2 codes must
/// match exactly; RFC 4646 codes are trimmed back one `-` subtag at a time
/// until a supported code starts with what is left (RFC 4647 lookup).
pub fn best_language<'a>(
    supported: &'a [u8],
    iso639: bool,
    candidates: &[&[u8]],
) -> Option<&'a [u8]> {
    for candidate in candidates {
        let candidate = trim_nul(candidate);
        let mut len = if iso639 {
            candidate.len().min(ISO_639_2_ENTRY_SIZE)
        } else {
            candidate.iter().position(|&c| c == b';').unwrap_or(candidate.len())
        };

        while len > 0 {
            let prefix = &candidate[..len];
            if iso639 {
                if let Some(code) = iso639_codes(supported).find(|code| code.starts_with(prefix)) {
                    return Some(code);
                }
                break;
            }

            if let Some(code) = rfc4646_codes(supported).find(|code| code.starts_with(prefix)) {
                return Some(code);
            }
            len = candidate[..len].iter().rposition(|&c| c == b'-').unwrap_or(0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index() {
        assert_eq!(index_of_lang(b"engfraspa", b"fra", true), Some(1));
        assert_eq!(index_of_lang(b"engfra\0", b"deu\0", true), None);
        assert_eq!(index_of_lang(b"en;fr;en-US;fr-FR", b"en-US", false), Some(2));
        assert_eq!(index_of_lang(b";en;;fr", b"fr", false), Some(1));
    }

    #[test]
    fn test_lang_at_index() {
        assert_eq!(lang_at_index(b"engfraengfra", 1, true), Some(&b"fra"[..]));
        assert_eq!(lang_at_index(b"en;fr;en-US;fr-FR", 1, false), Some(&b"fr"[..]));
        assert_eq!(lang_at_index(b"en;fr", 2, false), None);
        assert_eq!(lang_at_index(b"engfr", 1, true), None);
    }

    #[test]
    fn test_best_language() {
        assert_eq!(best_language(b"engfra", true, &[&b"fra\0"[..]]), Some(&b"fra"[..]));
        assert_eq!(best_language(b"engfra", true, &[&b"deu"[..], &b"eng"[..]]), Some(&b"eng"[..]));
        assert_eq!(best_language(b"en-US;fr-FR", false, &[&b"fr-CA"[..]]), Some(&b"fr-FR"[..]));
        assert_eq!(best_language(b"en-US;fr-FR", false, &[&b"de-DE"[..]]), None);
        assert_eq!(best_language(b"en;fr", false, &[&b"fr-CA\0"[..]]), Some(&b"fr"[..]));
        assert_eq!(best_language(b"en-US;fr-FR", false, &[&b"fr"[..]]), Some(&b"fr-FR"[..]));
        assert_eq!(best_language(b"en-US;fr-FR", false, &[&b"de;fr"[..]]), None);
    }
}
