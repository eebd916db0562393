use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const PAD_ID: usize = 0;
pub const GO_ID: usize = 1;
pub const EOS_ID: usize = 2;
pub const UNK_ID: usize = 3;

pub const PAD_TOKEN: &str = "_PAD";
pub const GO_TOKEN: &str = "_GO";
pub const EOS_TOKEN: &str = "_EOS";
pub const UNK_TOKEN: &str = "_UNK";
/// Word boundary in the character stream.
pub const SPACE_TOKEN: &str = "<space>";

const SPECIALS: [(usize, &str); 4] = [
    (PAD_ID, PAD_TOKEN),
    (GO_ID, GO_TOKEN),
    (EOS_ID, EOS_TOKEN),
    (UNK_ID, UNK_TOKEN),
];

/// Character vocabulary with id↔token mapping and word segmentation.
///
/// The file format is one token per line with the four specials first.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, usize>,
    markers: Regex,
}

impl Vocabulary {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab file: {:?}", path))?;
        let tokens: Vec<String> = raw
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        Self::from_tokens(tokens)
            .with_context(|| format!("Invalid vocabulary in {:?}", path))
    }

    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        if tokens.len() <= UNK_ID {
            bail!(
                "vocabulary needs the {} special tokens, got {} entries",
                SPECIALS.len(),
                tokens.len()
            );
        }
        for (id, expected) in SPECIALS {
            if tokens[id] != expected {
                bail!("expected {} at vocabulary index {}, found {}", expected, id, tokens[id]);
            }
        }
        let ids = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id))
            .collect();
        // Non-lexical markers dropped from segmented output: <...> tags (other
        // than the space token, which never survives segmentation) and the
        // underscore specials.
        let markers = Regex::new(r"^(?:<[^>]+>|_[A-Z]+)$").unwrap();
        Ok(Self {
            tokens,
            ids,
            markers,
        })
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn id(&self, token: &str) -> usize {
        self.ids.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: usize) -> &str {
        self.tokens.get(id).map(String::as_str).unwrap_or(UNK_TOKEN)
    }

    /// Encode a transcription into character ids; spaces map to the space
    /// token. No GO/EOS framing — batching adds that.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.chars()
            .map(|ch| {
                if ch == ' ' {
                    self.id(SPACE_TOKEN)
                } else {
                    self.id(&ch.to_string())
                }
            })
            .collect()
    }

    /// Render ids back into a raw character stream.
    pub fn detokenize(&self, ids: &[usize]) -> String {
        let mut out = String::new();
        for &id in ids {
            match self.token(id) {
                SPACE_TOKEN => out.push(' '),
                token => out.push_str(token),
            }
        }
        out
    }

    /// Split a raw character stream into words. Returns the raw word sequence
    /// and the segmented one with non-lexical markers removed; scoring uses
    /// the latter.
    pub fn segment_words(&self, text: &str) -> (Vec<String>, Vec<String>) {
        let raw: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let clean = raw
            .iter()
            .filter(|word| !self.markers.is_match(word))
            .cloned()
            .collect();
        (raw, clean)
    }
}
