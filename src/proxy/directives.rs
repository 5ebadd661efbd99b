use std::collections::HashMap;

use http::HeaderMap;
use http::header::AsHeaderName;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("unexpected control character in header value")]
    ControlCharacter,
    #[error("unterminated quoted string in header value")]
    UnterminatedString,
    #[error("unterminated escape sequence in header value")]
    UnterminatedEscape,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveError {
    #[error(transparent)]
    Tokenize(#[from] TokenizeError),
    #[error("missing comma between directives")]
    MissingComma,
    #[error("directive must not start with a quoted string")]
    UnexpectedQuotedString,
}

/// One element of a tokenized header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A run of non-special, non-control characters.
    Word(String),
    /// A quoted string, surrounding quotes and `\`-escapes preserved.
    Quoted(String),
    /// A single character from the tspecial set.
    Punct(char),
}

impl Token {
    fn as_str(&self) -> &str {
        match self {
            Token::Word(word) => word,
            Token::Quoted(quoted) => quoted,
            Token::Punct(_) => "",
        }
    }
}

fn is_tspecial(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

fn is_control(byte: u8) -> bool {
    (byte < 0x20 && byte != b'\t') || byte == 0x7f
}

/// Splits a structured header value into tokens. Whitespace outside quoted
/// strings separates tokens and is discarded.
pub fn tokenize(input: &str) -> Result<Vec<Token>, TokenizeError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let byte = bytes[pos];
        match byte {
            b' ' | b'\t' => {
                pos += 1;
            }
            b'"' => {
                let start = pos;
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        None => return Err(TokenizeError::UnterminatedString),
                        Some(b'\\') => {
                            if pos + 1 >= bytes.len() {
                                return Err(TokenizeError::UnterminatedEscape);
                            }
                            pos += 2;
                        }
                        Some(b'"') => {
                            pos += 1;
                            break;
                        }
                        Some(_) => {
                            pos += 1;
                        }
                    }
                }
                tokens.push(Token::Quoted(input[start..pos].to_string()));
            }
            _ if is_control(byte) => return Err(TokenizeError::ControlCharacter),
            _ if is_tspecial(byte) => {
                tokens.push(Token::Punct(byte as char));
                pos += 1;
            }
            _ => {
                let start = pos;
                while pos < bytes.len()
                    && !is_tspecial(bytes[pos])
                    && !is_control(bytes[pos])
                {
                    pos += 1;
                }
                tokens.push(Token::Word(input[start..pos].to_string()));
            }
        }
    }

    Ok(tokens)
}

/// A `name` or `name=value` element of a comma-separated directive list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub value: String,
}

/// Parses a header value as a comma-separated directive list. Quoted values
/// keep their quotes; empty list elements are permitted and skipped.
pub fn parse_directives(input: &str) -> Result<Vec<Directive>, DirectiveError> {
    let tokens = tokenize(input)?;
    let mut directives = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    loop {
        // Skip empty list elements.
        while matches!(iter.peek(), Some(Token::Punct(','))) {
            iter.next();
        }
        let name = match iter.next() {
            None => break,
            Some(Token::Word(word)) => word,
            Some(Token::Quoted(_)) => return Err(DirectiveError::UnexpectedQuotedString),
            Some(Token::Punct(_)) => return Err(DirectiveError::MissingComma),
        };

        let mut value = String::new();
        if matches!(iter.peek(), Some(Token::Punct('='))) {
            iter.next();
            value = match iter.next() {
                Some(Token::Word(word)) => word,
                Some(Token::Quoted(quoted)) => quoted,
                Some(Token::Punct(_)) | None => return Err(DirectiveError::MissingComma),
            };
        }
        directives.push(Directive { name, value });

        match iter.next() {
            None => break,
            Some(Token::Punct(',')) => {}
            Some(_) => return Err(DirectiveError::MissingComma),
        }
    }

    Ok(directives)
}

/// Folds all values of `name` into one directive map. Directive names are
/// lowercased; duplicates keep the first value. Malformed headers yield an
/// empty map so cache decisions default conservatively.
pub fn directive_map<K>(headers: &HeaderMap, name: K) -> HashMap<String, String>
where
    K: AsHeaderName,
{
    let mut combined = String::new();
    for value in headers.get_all(name) {
        if let Ok(text) = value.to_str() {
            if !combined.is_empty() {
                combined.push(',');
            }
            combined.push_str(text);
        }
    }

    let mut map = HashMap::new();
    if let Ok(directives) = parse_directives(&combined) {
        for directive in directives {
            map.entry(directive.name.to_ascii_lowercase())
                .or_insert(directive.value);
        }
    }
    map
}

/// Reserializes a header value with canonical token spacing: one space
/// between adjacent word tokens, none around punctuation. Values that fail
/// to tokenize are returned unchanged; the result is only used for
/// equivalence comparison.
pub fn normalize(input: &str) -> String {
    let tokens = match tokenize(input) {
        Ok(tokens) => tokens,
        Err(_) => return input.to_string(),
    };

    let mut out = String::with_capacity(input.len());
    let mut prev_word = false;
    for token in &tokens {
        match token {
            Token::Punct(ch) => {
                out.push(*ch);
                prev_word = false;
            }
            _ => {
                if prev_word {
                    out.push(' ');
                }
                out.push_str(token.as_str());
                prev_word = true;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(tokens: &[Token]) -> Vec<String> {
        tokens
            .iter()
            .map(|token| match token {
                Token::Word(word) => word.clone(),
                Token::Quoted(quoted) => quoted.clone(),
                Token::Punct(ch) => ch.to_string(),
            })
            .collect()
    }

    #[test]
    fn tokenizes_reference_vectors() {
        let table: &[(&str, &[&str])] = &[
            ("", &[]),
            (" ", &[]),
            ("a", &["a"]),
            ("aaaa", &["aaaa"]),
            ("a bb ccc", &["a", "bb", "ccc"]),
            ("\t", &[]),
            (" \t a  \t\t  ", &["a"]),
            ("\"a  \\\" b\" c", &["\"a  \\\" b\"", "c"]),
            ("<>", &["<", ">"]),
        ];
        for (input, expected) in table {
            let tokens = tokenize(input).unwrap_or_else(|err| {
                panic!("tokenizing {input:?} failed with {err}");
            });
            assert_eq!(words(&tokens), *expected, "input {input:?}");
        }
    }

    #[test]
    fn tokenizer_error_cases() {
        assert_eq!(tokenize("\"\\"), Err(TokenizeError::UnterminatedEscape));
        assert_eq!(tokenize("\""), Err(TokenizeError::UnterminatedString));
        assert_eq!(tokenize("\r"), Err(TokenizeError::ControlCharacter));
    }

    #[test]
    fn parses_directive_vectors() {
        let parsed = parse_directives("a=1,b,c=2").expect("parses");
        assert_eq!(
            parsed,
            vec![
                Directive {
                    name: "a".into(),
                    value: "1".into()
                },
                Directive {
                    name: "b".into(),
                    value: String::new()
                },
                Directive {
                    name: "c".into(),
                    value: "2".into()
                },
            ]
        );

        assert_eq!(parse_directives("").expect("empty ok"), Vec::new());
        assert_eq!(
            parse_directives(" ,,,, , ,, , , ").expect("commas ok"),
            Vec::new()
        );

        let quoted = parse_directives("a=\"1\"").expect("quoted value ok");
        assert_eq!(quoted[0].value, "\"1\"");
    }

    #[test]
    fn directive_error_cases() {
        assert_eq!(
            parse_directives("\"hello\""),
            Err(DirectiveError::UnexpectedQuotedString)
        );
        assert_eq!(parse_directives("a,b c,d"), Err(DirectiveError::MissingComma));
        assert_eq!(parse_directives("a,b=,d"), Err(DirectiveError::MissingComma));
        assert_eq!(
            parse_directives("a,b=c d,e"),
            Err(DirectiveError::MissingComma)
        );
        assert_eq!(
            parse_directives("\""),
            Err(DirectiveError::Tokenize(TokenizeError::UnterminatedString))
        );
    }

    #[test]
    fn normalize_is_idempotent_and_no_longer() {
        let table = &["", " ", "a", "a bb ccc", " \t a  \t\t  ", "<>", "a , b=1"];
        for input in table {
            let once = normalize(input);
            assert!(once.len() <= input.len(), "{input:?} grew to {once:?}");
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
        assert_eq!(normalize("a , b=1"), "a,b=1");
    }

    #[test]
    fn normalize_returns_input_on_error() {
        assert_eq!(normalize("\"unterminated"), "\"unterminated");
    }

    #[test]
    fn directive_map_is_conservative_on_errors() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", "no-store, max-age=60".parse().unwrap());
        let map = directive_map(&headers, "cache-control");
        assert!(map.contains_key("no-store"));
        assert_eq!(map.get("max-age").map(String::as_str), Some("60"));

        let mut broken = HeaderMap::new();
        broken.insert("cache-control", "no-store \"oops".parse().unwrap());
        assert!(directive_map(&broken, "cache-control").is_empty());
    }

    #[test]
    fn directive_map_folds_repeated_headers_and_keeps_first_duplicate() {
        let mut headers = HeaderMap::new();
        headers.append("cache-control", "max-age=1".parse().unwrap());
        headers.append("cache-control", "max-age=2, public".parse().unwrap());
        let map = directive_map(&headers, "cache-control");
        assert_eq!(map.get("max-age").map(String::as_str), Some("1"));
        assert!(map.contains_key("public"));
    }
}
