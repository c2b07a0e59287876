//! Text cleaners applied before symbol lookup

/// Lower-case and collapse whitespace runs to single spaces
pub fn basic_cleaners(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
}

/// Collapse whitespace without changing case, for pre-phonemized input
pub fn phoneme_cleaners(text: &str) -> String {
    collapse_whitespace(text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Run the named cleaners in order
///
/// Unknown names are skipped with a warning; an empty list applies
/// [`basic_cleaners`].
pub fn clean_text(text: &str, cleaners: &[String]) -> String {
    if cleaners.is_empty() {
        return basic_cleaners(text);
    }
    cleaners.iter().fold(text.to_string(), |acc, name| match name.as_str() {
        "basic_cleaners" => basic_cleaners(&acc),
        "phoneme_cleaners" => phoneme_cleaners(&acc),
        other => {
            tracing::warn!("Unknown text cleaner {:?}, skipping", other);
            acc
        }
    })
}
