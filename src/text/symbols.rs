//! Symbol inventory and text-to-id conversion
//!
//! The default table matches the 178-symbol set the public VITS checkpoints
//! were trained with: pad, punctuation, ASCII letters, IPA letters.

use super::cleaners::clean_text;
use std::collections::HashMap;

const PAD: &str = "_";
const PUNCTUATION: &str = ";:,.!?¡¿—…\"«»“” ";
const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LETTERS_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'̩'ᵻ";

/// Ordered symbol inventory; a symbol's id is its position
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<char>,
    ids: HashMap<char, u32>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        let symbols = PAD
            .chars()
            .chain(PUNCTUATION.chars())
            .chain(LETTERS.chars())
            .chain(LETTERS_IPA.chars());
        Self::from_symbols(symbols)
    }
}

impl SymbolTable {
    /// Build a table from an ordered symbol list
    ///
    /// A symbol listed twice keeps the id of its last occurrence.
    pub fn from_symbols<I: IntoIterator<Item = char>>(symbols: I) -> Self {
        let symbols: Vec<char> = symbols.into_iter().collect();
        let ids = symbols
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, i as u32))
            .collect();
        Self { symbols, ids }
    }

    /// Vocabulary size (`n_vocab` of the text encoder)
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn id(&self, symbol: char) -> Option<u32> {
        self.ids.get(&symbol).copied()
    }

    pub fn symbol(&self, id: u32) -> Option<char> {
        self.symbols.get(id as usize).copied()
    }

    /// Clean `text` with the named cleaners and map it to symbol ids;
    /// characters outside the table are dropped
    pub fn text_to_sequence(&self, text: &str, cleaners: &[String]) -> Vec<u32> {
        let cleaned = clean_text(text, cleaners);
        self.cleaned_text_to_sequence(&cleaned)
    }

    /// Map already-cleaned text to ids
    pub fn cleaned_text_to_sequence(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter_map(|c| {
                let id = self.id(c);
                if id.is_none() {
                    tracing::debug!("Skipping unknown symbol {:?}", c);
                }
                id
            })
            .collect()
    }

    /// Inverse of [`Self::cleaned_text_to_sequence`]
    pub fn sequence_to_text(&self, ids: &[u32]) -> String {
        ids.iter().filter_map(|&id| self.symbol(id)).collect()
    }
}

/// Insert `item` before, between and after every element:
/// `[a, b] -> [item, a, item, b, item]`
pub fn intersperse(sequence: &[u32], item: u32) -> Vec<u32> {
    let mut result = vec![item; sequence.len() * 2 + 1];
    for (i, &id) in sequence.iter().enumerate() {
        result[2 * i + 1] = id;
    }
    result
}
