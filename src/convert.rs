//! Traditional/simplified Chinese script conversion.
//!
//! Passed explicitly to the tree parser and the content normalizer so that every
//! worker thread converts with the same, immutable settings.

use zhconv::{zhconv, Variant};

/// Converts text between written variants of the same language.
pub trait ScriptConvert: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

/// Conversion direction selected by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptConversion {
    /// Traditional to simplified (default).
    #[default]
    ToSimplified,
    /// Simplified to traditional.
    ToTraditional,
    /// Leave text as is.
    Off,
}

impl ScriptConvert for ScriptConversion {
    fn convert(&self, text: &str) -> String {
        match self {
            ScriptConversion::ToSimplified => zhconv(text, Variant::ZhHans),
            ScriptConversion::ToTraditional => zhconv(text, Variant::ZhHant),
            ScriptConversion::Off => text.to_string(),
        }
    }
}
