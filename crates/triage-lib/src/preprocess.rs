//! Ticket text normalization ahead of classification

use regex::Regex;
use std::collections::HashSet;

/// Turns a ticket's subject and description into model input text
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, subject: &str, description: &str) -> String;
}

/// English stop words, minus the negations that carry meaning for triage
const STOP_WORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "you're", "you've",
    "you'll", "you'd", "your", "yours", "yourself", "yourselves", "he", "him", "his", "himself",
    "she", "she's", "her", "hers", "herself", "it", "it's", "its", "itself", "they", "them",
    "their", "theirs", "themselves", "what", "which", "who", "whom", "this", "that", "that'll",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
    "most", "other", "some", "such", "only", "own", "same", "so", "than", "too", "very", "s",
    "t", "can", "will", "just", "don", "should", "should've", "now", "d", "ll", "m", "o", "re",
    "ve", "y", "ain", "aren", "aren't", "couldn", "didn", "didn't", "doesn", "doesn't", "hadn",
    "hadn't", "hasn", "hasn't", "haven", "haven't", "isn", "ma", "mightn", "mightn't", "mustn",
    "mustn't", "needn", "needn't", "shan", "shan't", "shouldn", "wasn", "weren", "weren't",
    "won", "won't", "wouldn",
];

/// Salutations that appear in most tickets and say nothing about them
const FILLER_WORDS: &[&str] = &["dear", "customer", "support", "team", "hello", "hi", "regards"];

/// Tokens of this length or shorter are dropped
const MIN_TOKEN_LEN: usize = 2;

/// Regex-driven normalizer: lowercases, strips identifiers and markup,
/// keeps letters only and removes stop words.
pub struct RegexNormalizer {
    links: Regex,
    html: Regex,
    long_numbers: Regex,
    long_tokens: Regex,
    non_letters: Regex,
    stop_words: HashSet<&'static str>,
}

impl RegexNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            links: Regex::new(
                r"(https?|ftp)://[^\s/$.?#].[^\s]*|www\.\S+|\S+@\S+|[a-z]:\\[^\s:]+",
            )?,
            html: Regex::new(r"<.*?>")?,
            long_numbers: Regex::new(r"\b(?:\d[ -]?){6,12}\d\b")?,
            long_tokens: Regex::new(r"\b[a-z0-9]{20,}\b")?,
            non_letters: Regex::new(r"[^a-z\s]")?,
            stop_words: STOP_WORDS.iter().chain(FILLER_WORDS).copied().collect(),
        })
    }
}

impl TextNormalizer for RegexNormalizer {
    fn normalize(&self, subject: &str, description: &str) -> String {
        let text = format!("{subject} {description}").to_lowercase();

        let text = self.links.replace_all(&text, " ");
        let text = self.html.replace_all(&text, " ");
        let text = self.long_numbers.replace_all(&text, " ");
        let text = self.long_tokens.replace_all(&text, " ");
        let text = self.non_letters.replace_all(&text, " ");

        text.split_whitespace()
            .filter(|token| token.len() > MIN_TOKEN_LEN && !self.stop_words.contains(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
