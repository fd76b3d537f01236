//! Token Estimation
//!
//! A tokenizer-free estimate tuned for mixed Chinese/English chat: every CJK
//! character counts as one token, everything else as one token per four
//! characters (rounded up).

/// Whether a character belongs to a CJK script or CJK punctuation block
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F   // CJK symbols and punctuation
        | 0x3040..=0x30FF // Hiragana, Katakana
        | 0x3400..=0x4DBF // Extension A
        | 0x4E00..=0x9FFF // Unified ideographs
        | 0xAC00..=0xD7AF // Hangul syllables
        | 0xF900..=0xFAFF // Compatibility ideographs
        | 0xFF00..=0xFFEF // Fullwidth forms
        | 0x20000..=0x2A6DF)
}

#[derive(Default, Clone, Copy)]
struct Tally {
    cjk: usize,
    other: usize,
}

impl Tally {
    fn push(&mut self, c: char) {
        if is_cjk(c) {
            self.cjk += 1;
        } else {
            self.other += 1;
        }
    }

    fn tokens(&self) -> usize {
        self.cjk + self.other.div_ceil(4)
    }
}

/// Estimate the token count of a text
pub fn estimate_tokens(text: &str) -> usize {
    let mut tally = Tally::default();
    text.chars().for_each(|c| tally.push(c));
    tally.tokens()
}

/// Longest prefix of `text` whose estimate fits in `max_tokens`
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let mut tally = Tally::default();
    let mut end = 0;
    for (i, c) in text.char_indices() {
        tally.push(c);
        if tally.tokens() > max_tokens {
            break;
        }
        end = i + c.len_utf8();
    }
    text[..end].to_string()
}

/// Longest suffix of `text` whose estimate fits in `max_tokens`
pub fn truncate_tail_to_tokens(text: &str, max_tokens: usize) -> String {
    let mut tally = Tally::default();
    let mut start = text.len();
    for (i, c) in text.char_indices().rev() {
        tally.push(c);
        if tally.tokens() > max_tokens {
            break;
        }
        start = i;
    }
    text[start..].to_string()
}
