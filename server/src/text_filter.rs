//! Banned-content filter for usernames and chat.

use log::{info, warn};
use std::io;
use std::path::Path;

/// Phrases shorter than this are ignored.
pub const MIN_PHRASE_LEN: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct TextFilter {
    /// Lowercased phrases
    phrases: Vec<String>,
}

impl TextFilter {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for phrase in phrases {
            filter.add(phrase.as_ref());
        }
        filter
    }

    /// Reads one phrase per line. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let filter = Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        );
        info!("Loaded {} filter phrase(s) from {}", filter.len(), path.display());
        Ok(filter)
    }

    pub fn add(&mut self, phrase: &str) {
        let phrase = phrase.trim();
        if phrase.chars().count() < MIN_PHRASE_LEN {
            warn!(
                "Filter phrase '{}' ignored: shorter than {} characters",
                phrase, MIN_PHRASE_LEN
            );
            return;
        }
        let lowered = phrase.to_ascii_lowercase();
        if !self.phrases.contains(&lowered) {
            self.phrases.push(lowered);
        }
    }

    /// Case-insensitive containment of any phrase.
    pub fn test(&self, text: &str) -> bool {
        if text.is_empty() || self.phrases.is_empty() {
            return false;
        }
        let lowered = text.to_ascii_lowercase();
        self.phrases.iter().any(|phrase| lowered.contains(phrase))
    }

    /// Masks every match as first character, asterisks, last character.
    pub fn censor(&self, text: &str) -> String {
        if text.is_empty() || self.phrases.is_empty() {
            return text.to_string();
        }
        let mut out = text.to_string();
        for phrase in &self.phrases {
            // ASCII lowercasing keeps byte offsets aligned with `out`
            let mut from = 0;
            while let Some(found) = out[from..].to_ascii_lowercase().find(phrase.as_str()) {
                let start = from + found;
                let end = start + phrase.len();
                let masked = mask(&out[start..end]);
                out.replace_range(start..end, &masked);
                from = start + masked.len();
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

fn mask(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    match chars.as_slice() {
        [] => String::new(),
        [only] => only.to_string(),
        [first, middle @ .., last] => {
            let mut masked = String::with_capacity(word.len());
            masked.push(*first);
            masked.extend(std::iter::repeat('*').take(middle.len()));
            masked.push(*last);
            masked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_short_phrases_ignored() {
        let filter = TextFilter::new(["ab", "  ", "abc"]);
        assert_eq!(filter.len(), 1);
        assert!(filter.test("xxABCxx"));
        assert!(!filter.test("ab"));
    }

    #[test]
    fn test_is_case_insensitive() {
        let filter = TextFilter::new(["Griefer"]);
        assert!(filter.test("the_GRIEFER_01"));
        assert!(filter.test("griefer"));
        assert!(!filter.test("grief"));
        assert!(!filter.test(""));
    }

    #[test]
    fn test_censor_keeps_first_and_last() {
        let filter = TextFilter::new(["darn"]);
        assert_eq!(filter.censor("well DARN it, darn"), "well D**N it, d**n");
        assert_eq!(filter.censor("clean"), "clean");
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = TextFilter::default();
        assert!(!filter.test("anything"));
        assert_eq!(filter.censor("anything"), "anything");
    }

    #[test]
    fn test_from_file_skips_comments() {
        let path = std::env::temp_dir().join(format!("filters-{}.txt", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# phrases blocked from chat and usernames").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "spoiler").unwrap();
        writeln!(file, "no").unwrap();
        drop(file);

        let filter = TextFilter::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(filter.len(), 1);
        assert!(filter.test("big SPOILER ahead"));
    }
}
