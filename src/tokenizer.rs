use anyhow::{anyhow, bail, Error, Result};
use regex::Regex;
use serde::Serialize;
use std::hash::{DefaultHasher, Hash, Hasher};
use tiktoken_rs::{cl100k_base, p50k_base, CoreBPE};
use unicode_segmentation::UnicodeSegmentation;

// First ids past the end of each BPE vocabulary, used for added special tokens
const P50K_VOCAB_END: usize = 50281;
const CL100K_VOCAB_END: usize = 100277;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenizedText {
    pub original_text: String,
    pub tokenized_text: Vec<String>,
    pub token_ids: Vec<usize>,
}

/// Tokenizer collaborator used by record emission. Shared across emission threads.
pub trait TextTokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> TokenizedText;
}

/// Wraps `text` in `template` (at its `{text}` placeholder) and tokenizes the result.
/// `original_text` stays the unwrapped text.
pub fn tokenize_wrapped(tokenizer: &dyn TextTokenizer, template: &str, text: &str) -> TokenizedText {
    let wrapped = template.replace("{text}", text);
    let mut tokenized = tokenizer.tokenize(&wrapped);
    tokenized.original_text = text.to_string();
    tokenized
}

pub struct OmniTokenizer {
    pub tokenizer_name: String,
    pub inner: Option<CoreBPE>,
    special_tokens: Vec<String>,
    special_re: Option<Regex>,
    special_id_base: usize,
}

impl OmniTokenizer {
    /// Builds the tokenizer and registers `special_tokens`; they are never split and get ids
    /// after the base vocabulary, in the order given.
    pub fn new(tokenizer_name: &str, special_tokens: &[String]) -> Result<Self, Error> {
        let (inner, special_id_base) = match tokenizer_name {
            "p50k" => (Some(p50k_base().map_err(|e| anyhow!("Failed to load p50k: {}", e))?), P50K_VOCAB_END),
            "cl100k" => (
                Some(cl100k_base().map_err(|e| anyhow!("Failed to load cl100k: {}", e))?),
                CL100K_VOCAB_END,
            ),
            "uniseg" => (None, 0),
            _ => bail!("Unknown tokenizer {:?} (expected uniseg, p50k or cl100k)", tokenizer_name),
        };

        let special_re = if special_tokens.is_empty() {
            None
        } else {
            // Longest first so a token that prefixes another never wins
            let mut escaped: Vec<String> = special_tokens.iter().map(|t| regex::escape(t)).collect();
            escaped.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            Some(Regex::new(&escaped.join("|"))?)
        };

        Ok(OmniTokenizer {
            tokenizer_name: tokenizer_name.to_string(),
            inner,
            special_tokens: special_tokens.to_vec(),
            special_re,
            special_id_base,
        })
    }

    fn special_id(&self, token: &str) -> Option<usize> {
        self.special_tokens
            .iter()
            .position(|t| t == token)
            .map(|idx| self.special_id_base + idx)
    }

    fn encode_plain(&self, text: &str, tokens: &mut Vec<String>, ids: &mut Vec<usize>) {
        match &self.inner {
            Some(bpe) => {
                for id in bpe.encode_with_special_tokens(text) {
                    // Single ids can end inside a multi-byte character
                    let piece = bpe.decode(vec![id]).unwrap_or_else(|_| format!("<{}>", id));
                    tokens.push(piece);
                    ids.push(id);
                }
            }
            None => {
                let lowered = text.to_lowercase();
                for word in lowered.split_word_bounds() {
                    if word.trim().is_empty() {
                        continue;
                    }
                    let mut hasher = DefaultHasher::new();
                    word.hash(&mut hasher);
                    tokens.push(word.to_string());
                    // Keep clear of the reserved special-token ids
                    let reserved = self.special_tokens.len();
                    ids.push(reserved + (hasher.finish() as usize) % (usize::MAX - reserved));
                }
            }
        }
    }
}

impl TextTokenizer for OmniTokenizer {
    fn tokenize(&self, text: &str) -> TokenizedText {
        let mut tokens = Vec::new();
        let mut ids = Vec::new();

        let mut last = 0;
        if let Some(re) = &self.special_re {
            for m in re.find_iter(text) {
                self.encode_plain(&text[last..m.start()], &mut tokens, &mut ids);
                if let Some(id) = self.special_id(m.as_str()) {
                    tokens.push(m.as_str().to_string());
                    ids.push(id);
                }
                last = m.end();
            }
        }
        self.encode_plain(&text[last..], &mut tokens, &mut ids);

        TokenizedText {
            original_text: text.to_string(),
            tokenized_text: tokens,
            token_ids: ids,
        }
    }
}
