//! RFC 2047 encoded-word decoding for header values.
//!
//! Every `=?charset?encoding?text?=` token is decoded independently. A token
//! that cannot be decoded is kept verbatim and a warning is logged, so callers
//! always get a usable string back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use charset::Charset;
use log::warn;
use quoted_printable::ParseMode;
use regex::Regex;
use std::sync::LazyLock;

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?\s]*)\?([^?\s]*)\?([^?\s]*)\?=").expect("encoded-word pattern is valid")
});

static FOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n([ \t])").expect("fold pattern is valid"));

/// Decode all encoded-words in a header value, leaving surrounding text alone.
pub fn decode_header(value: &str) -> String {
    let unfolded = FOLD.replace_all(value, "$1");
    let mut decoded = String::with_capacity(unfolded.len());
    let mut last_end = 0;
    let mut previous_decoded = false;

    for caps in ENCODED_WORD.captures_iter(&unfolded) {
        let (Some(token), Some(charset), Some(encoding), Some(text)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let gap = &unfolded[last_end..token.start()];
        let word = decode_word(token.as_str(), charset.as_str(), encoding.as_str(), text.as_str());

        // Whitespace between two decoded words is not part of the text (RFC 2047 6.2)
        let adjacent = previous_decoded && word.is_some() && gap.chars().all(char::is_whitespace);
        if !adjacent {
            decoded.push_str(gap);
        }

        previous_decoded = word.is_some();
        match word {
            Some(word) => decoded.push_str(&word),
            None => decoded.push_str(token.as_str()),
        }
        last_end = token.end();
    }

    decoded.push_str(&unfolded[last_end..]);
    decoded
}

fn decode_word(token: &str, charset: &str, encoding: &str, text: &str) -> Option<String> {
    let bytes = match encoding.to_ascii_lowercase().as_str() {
        "b" => match BASE64.decode(text) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error decode Base64 in {}: {}", token, e);
                return None;
            }
        },
        "q" => match quoted_printable::decode(text.replace('_', " "), ParseMode::Robust) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error decode Quoted-Printable in {}: {}", token, e);
                return None;
            }
        },
        other => {
            warn!("Unknown encoding {} in {}", other, token);
            return None;
        }
    };

    // RFC 2231 allows a language suffix: utf-8*en
    let label = charset.split('*').next().unwrap_or(charset);
    let Some(charset) = Charset::for_label(label.as_bytes()) else {
        warn!("Unknown charset {} in {}", label, token);
        return None;
    };

    let (text, had_errors) = charset.decode_without_bom_handling(&bytes);
    if had_errors {
        warn!("Error decode charset {} in {}", label, token);
        return None;
    }
    Some(text.into_owned())
}
