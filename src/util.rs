//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = tpl.to_string();
    for (k, v) in pairs {
        let needle = format!("{{{}}}", k);
        out = out.replace(&needle, v);
    }
    out
}

/// Normalize text for phrase matching: lowercase and collapse runs of
/// whitespace to single spaces, so markers match across line breaks and
/// double spaces.
pub fn normalize_for_match(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Crude language sniff for the two detection locales the tutor supports.
/// Spanish orthography markers win over the English default.
pub fn detect_language(s: &str) -> &'static str {
    const ES_CHARS: [char; 10] = ['á', 'é', 'í', 'ó', 'ú', 'ñ', '¿', '¡', 'Ñ', 'É'];
    if s.chars().any(|c| ES_CHARS.contains(&c)) {
        return "es";
    }
    let lower = format!(" {} ", s.to_lowercase());
    const ES_WORDS: [&str; 6] = [" el ", " la ", " que ", " porque ", " gracias", " hola"];
    if ES_WORDS.iter().any(|w| lower.contains(w)) {
        "es"
    } else {
        "en"
    }
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max)
        .last()
        .unwrap_or(0);
    format!("{}… ({} bytes total)", &s[..cut], s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_template_replaces_all_pairs() {
        let out = fill_template("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
        assert_eq!(out, "x and y and x");
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_for_match("We  ARE\n done."), "we are done.");
    }

    #[test]
    fn detects_spanish_from_diacritics_and_common_words() {
        assert_eq!(detect_language("¿Qué piensas tú?"), "es");
        assert_eq!(detect_language("hola, como estas"), "es");
        assert_eq!(detect_language("I think the answer is five"), "en");
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let s = "héllo world, this is a much longer line than the cap";
        let t = trunc_for_log(s, 4);
        assert!(t.contains("bytes total"));
    }
}
