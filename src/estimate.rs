use std::fmt;

/// Word and character counts for a text, with the cost of converting it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStats {
    pub words: usize,
    pub characters: usize,
    /// Estimated API cost in USD
    pub price: f64,
}

impl TextStats {
    pub fn from_text(text: &str, price_per_thousand_chars: f64) -> Self {
        let characters = text.chars().count();
        TextStats {
            words: text.split_whitespace().count(),
            characters,
            price: characters as f64 / 1000.0 * price_per_thousand_chars,
        }
    }
}

impl fmt::Display for TextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "words: {}, characters: {}, price: ${:.2}",
            self.words, self.characters, self.price
        )
    }
}
