//! Rewrite assistant output into WhatsApp's markup dialect.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Retrieval citation markers such as `【4:0†source】`.
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【.*?】").expect("citation regex compilation failed"));

/// Markdown bold; WhatsApp uses single asterisks.
static DOUBLE_EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("emphasis regex compilation failed"));

/// Apply `re -> rep` until the text stops changing.
fn replace_to_fixpoint(re: &Regex, rep: &str, text: String) -> String {
    let mut text = text;
    while let Cow::Owned(next) = re.replace_all(&text, rep) {
        text = next;
    }
    text
}

/// Strip citation markers, trim, and turn `**bold**` into `*bold*`.
///
/// Idempotent: formatting already-formatted text returns it unchanged.
pub fn format_for_whatsapp(text: &str) -> String {
    let stripped = replace_to_fixpoint(&CITATION, "", text.to_string());
    let trimmed = stripped.trim().to_string();
    replace_to_fixpoint(&DOUBLE_EMPHASIS, "*$1*", trimmed)
}
