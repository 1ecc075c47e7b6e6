//! Incremental extraction of fragments from a token stream.
//!
//! Tokens arrive in arbitrary slices; a unit may be split across any number
//! of tokens, and one token may close several units. Scanners keep only the
//! unfinished tail of the stream between calls.

use crate::defaults::DEFAULT_TAG;
use crate::pipeline::types::FragmentMode;
use serde::{Deserialize, Serialize};

/// Text, tag and mode of one fragment before it is numbered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentUnit {
    pub text: String,
    pub tag: String,
    pub mode: FragmentMode,
}

impl FragmentUnit {
    fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            tag: DEFAULT_TAG.to_string(),
            mode: FragmentMode::Once,
        }
    }
}

/// How generated text is cut into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FragmentFormat {
    /// A sequence of `{"text": ..., "tag": ..., "mode": ...}` objects.
    #[default]
    Json,
    /// Plain prose, cut after sentence punctuation.
    Sentences,
}

/// Scanner for either [`FragmentFormat`].
#[derive(Debug, Clone)]
pub enum FragmentScanner {
    Json(JsonUnitScanner),
    Sentences(SentenceScanner),
}

impl FragmentScanner {
    pub fn new(format: FragmentFormat) -> Self {
        match format {
            FragmentFormat::Json => FragmentScanner::Json(JsonUnitScanner::default()),
            FragmentFormat::Sentences => FragmentScanner::Sentences(SentenceScanner::default()),
        }
    }

    /// Feed one token, returning every fragment it completed.
    pub fn push(&mut self, token: &str) -> Vec<FragmentUnit> {
        match self {
            FragmentScanner::Json(scanner) => scanner.push(token),
            FragmentScanner::Sentences(scanner) => scanner.push(token),
        }
    }

    /// The stream ended; return whatever can still be salvaged.
    pub fn finish(&mut self) -> Vec<FragmentUnit> {
        match self {
            FragmentScanner::Json(scanner) => scanner.finish(),
            FragmentScanner::Sentences(scanner) => scanner.finish(),
        }
    }
}

/// Field names accepted in a unit. Spanish keys are what the bundled
/// prompts ask for, so both spellings are understood.
#[derive(Debug, Deserialize)]
struct RawUnit {
    #[serde(default, alias = "texto")]
    text: Option<String>,
    #[serde(default, alias = "expresion", alias = "expression")]
    tag: Option<serde_json::Value>,
    #[serde(default, alias = "modo")]
    mode: Option<serde_json::Value>,
}

/// Finds balanced top-level `{...}` units, ignoring braces inside strings.
#[derive(Debug, Clone, Default)]
pub struct JsonUnitScanner {
    buffer: String,
    /// Byte offset of the first character not yet scanned.
    cursor: usize,
    /// Byte offset of the opening brace of the unit being read.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonUnitScanner {
    pub fn push(&mut self, token: &str) -> Vec<FragmentUnit> {
        self.buffer.push_str(token);
        let mut units = Vec::new();

        let mut position = self.cursor;
        while let Some(ch) = self.buffer[position..].chars().next() {
            let offset = position;
            position += ch.len_utf8();

            if self.depth > 0 && self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '{' => {
                    if self.depth == 0 {
                        self.start = Some(offset);
                    }
                    self.depth += 1;
                }
                '}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0
                        && let Some(start) = self.start.take()
                        && let Some(unit) = parse_unit(&self.buffer[start..position])
                    {
                        units.push(unit);
                    }
                }
                '"' if self.depth > 0 => self.in_string = true,
                _ => {}
            }
        }

        self.compact(position);
        units
    }

    /// Incomplete units are discarded.
    pub fn finish(&mut self) -> Vec<FragmentUnit> {
        if self.start.is_some() {
            tracing::debug!(
                pending = self.buffer.len(),
                "stream ended inside an unfinished unit"
            );
        }
        *self = Self::default();
        Vec::new()
    }

    /// Drop everything before the unit being read.
    fn compact(&mut self, scanned: usize) {
        match self.start {
            Some(start) => {
                self.buffer.drain(..start);
                self.start = Some(0);
                self.cursor = scanned - start;
            }
            None => {
                self.buffer.clear();
                self.cursor = 0;
            }
        }
    }
}

fn parse_unit(raw: &str) -> Option<FragmentUnit> {
    let unit: RawUnit = match serde_json::from_str(raw) {
        Ok(unit) => unit,
        Err(e) => {
            tracing::warn!(unit = raw, "dropping malformed fragment: {}", e);
            return None;
        }
    };

    let text = unit.text.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        tracing::debug!(unit = raw, "skipping fragment without text");
        return None;
    }

    let tag = unit
        .tag
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .unwrap_or(DEFAULT_TAG);
    let mode = unit
        .mode
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .map(FragmentMode::parse_lenient)
        .unwrap_or_default();

    Some(FragmentUnit {
        text: text.to_string(),
        tag: tag.to_string(),
        mode,
    })
}

/// Cuts prose after `.`, `!`, `?`, `,`, `;` or `:` followed by whitespace.
#[derive(Debug, Clone, Default)]
pub struct SentenceScanner {
    buffer: String,
}

const SENTENCE_BREAKS: [char; 6] = ['.', '!', '?', ',', ';', ':'];

impl SentenceScanner {
    pub fn push(&mut self, token: &str) -> Vec<FragmentUnit> {
        self.buffer.push_str(token);
        let mut units = Vec::new();

        loop {
            let mut cut = None;
            let mut chars = self.buffer.char_indices().peekable();
            while let Some((offset, ch)) = chars.next() {
                if SENTENCE_BREAKS.contains(&ch)
                    && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
                {
                    cut = Some(offset + ch.len_utf8());
                    break;
                }
            }
            let Some(cut) = cut else {
                break;
            };

            let sentence: String = self.buffer.drain(..cut).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                units.push(FragmentUnit::plain(sentence));
            }
        }

        units
    }

    pub fn finish(&mut self) -> Vec<FragmentUnit> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![FragmentUnit::plain(rest)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut FragmentScanner, tokens: &[&str]) -> Vec<FragmentUnit> {
        let mut units: Vec<FragmentUnit> = tokens.iter().flat_map(|t| scanner.push(t)).collect();
        units.extend(scanner.finish());
        units
    }

    fn texts(units: &[FragmentUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn test_json_units_split_across_tokens() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = feed(
            &mut scanner,
            &["{\"te", "xt\": \"Hola.\", \"tag\": \"hap", "py\"}", " {\"text\":", "\"Adiós\"}"],
        );

        assert_eq!(texts(&units), vec!["Hola.", "Adiós"]);
        assert_eq!(units[0].tag, "happy");
        assert_eq!(units[1].tag, DEFAULT_TAG);
    }

    #[test]
    fn test_json_several_units_in_one_token() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = scanner.push("[{\"text\":\"a\"},{\"text\":\"b\"}]");
        assert_eq!(texts(&units), vec!["a", "b"]);
    }

    #[test]
    fn test_json_braces_inside_strings_do_not_count() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = feed(
            &mut scanner,
            &["{\"text\": \"use { and } freely\", ", "\"tag\": \"x\"}"],
        );
        assert_eq!(texts(&units), vec!["use { and } freely"]);
    }

    #[test]
    fn test_json_escaped_quote_inside_string() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = scanner.push(r#"{"text": "she said \"}\" twice"}"#);
        assert_eq!(texts(&units), vec!["she said \"}\" twice"]);
    }

    #[test]
    fn test_json_spanish_keys() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = scanner.push(r#"{"texto": " Buenas ", "expresion": "feliz", "modo": "loop"}"#);

        assert_eq!(
            units,
            vec![FragmentUnit {
                text: "Buenas".to_string(),
                tag: "feliz".to_string(),
                mode: FragmentMode::Loop,
            }]
        );
    }

    #[test]
    fn test_json_unknown_mode_defaults_to_once() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = scanner.push(r#"{"text": "x", "mode": "sometimes"} {"text": "y", "mode": 3}"#);
        assert!(units.iter().all(|u| u.mode == FragmentMode::Once));
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_json_malformed_and_empty_units_dropped() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = feed(
            &mut scanner,
            &[
                "{\"text\": \"one\"}",
                "{not json at all}",
                "{\"text\": \"   \"}",
                "{\"tag\": \"sad\"}",
                "{\"text\": \"two\"}",
            ],
        );
        assert_eq!(texts(&units), vec!["one", "two"]);
    }

    #[test]
    fn test_json_nested_object_is_one_unit() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = scanner.push(r#"{"text": "outer", "meta": {"k": 1}}"#);
        assert_eq!(texts(&units), vec!["outer"]);
    }

    #[test]
    fn test_json_unfinished_unit_dropped_at_finish() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = feed(&mut scanner, &["{\"text\": \"ok\"}", "{\"text\": \"cut"]);
        assert_eq!(texts(&units), vec!["ok"]);
    }

    #[test]
    fn test_json_buffer_is_compacted() {
        let mut scanner = JsonUnitScanner::default();
        scanner.push("noise before {\"text\": \"a\"} trailing");
        assert!(scanner.buffer.is_empty());

        scanner.push("xx {\"text\":");
        assert_eq!(scanner.buffer, "{\"text\":");
    }

    #[test]
    fn test_json_multibyte_text_split_mid_unit() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Json);
        let units = feed(&mut scanner, &["{\"text\": \"ñan", "dú ¿qué?\"}"]);
        assert_eq!(texts(&units), vec!["ñandú ¿qué?"]);
    }

    #[test]
    fn test_sentences_cut_at_punctuation() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Sentences);
        let units = feed(&mut scanner, &["Hola, ", "¿qué tal? Bien", " gracias. Fin"]);
        assert_eq!(texts(&units), vec!["Hola,", "¿qué tal?", "Bien gracias.", "Fin"]);
        assert!(units.iter().all(|u| u.tag == DEFAULT_TAG));
    }

    #[test]
    fn test_sentences_need_following_whitespace() {
        let mut scanner = FragmentScanner::new(FragmentFormat::Sentences);
        assert!(scanner.push("Pi is 3.14").is_empty());
        assert_eq!(texts(&scanner.push("15. ")), vec!["Pi is 3.1415."]);
        assert!(scanner.finish().is_empty());
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let format: FragmentFormat = serde_json::from_str("\"sentences\"").unwrap();
        assert_eq!(format, FragmentFormat::Sentences);
        assert_eq!(FragmentFormat::default(), FragmentFormat::Json);
    }
}
