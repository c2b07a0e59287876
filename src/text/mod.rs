//! Text processing modules
//!
//! - Cleaners (case folding, whitespace normalization)
//! - Symbol table lookup
//! - Blank interspersing

mod cleaners;
mod symbols;

pub use cleaners::{basic_cleaners, clean_text, phoneme_cleaners};
pub use symbols::{intersperse, SymbolTable};
