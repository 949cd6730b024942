// Keyword analysis shared by every text-index backend.
// Stored search text and queries both go through the same tantivy pipeline, so the
// relational backends match exactly the terms the document store indexes.


use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer, TokenStream,
};

/// Name the analyzer is registered under in tantivy indexes.
pub const ANALYZER_NAME: &str = "en_stem";

/// Tokens longer than this are dropped.
const MAX_TOKEN_LEN: usize = 40;

/// Alphanumeric tokens, lowercased and stemmed with the Snowball English stemmer.
/// No stopwords are removed.
pub fn search_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .filter(Stemmer::new(Language::English))
        .build()
}

fn for_each_token(text: &str, mut f: impl FnMut(&str)) {
    let mut analyzer = search_analyzer();
    let mut tokens = analyzer.token_stream(text);
    while tokens.advance() {
        f(&tokens.token().text);
    }
}

/// Distinct stemmed terms of a query, in first-seen order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for_each_token(text, |token| {
        if !terms.iter().any(|t| t == token) {
            terms.push(token.to_string());
        }
    });
    terms
}

/// Every stemmed token of `text`, space separated, for the relational search columns.
pub fn indexed_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for_each_token(text, |token| {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    });
    out
}
