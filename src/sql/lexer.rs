//! Just enough lexing to split a simple-query string into statements and to
//! classify control statements without a full parse.

/// Splits a query string at top-level semicolons.
///
/// Quoted strings (`'...'`, `E'...'`), quoted identifiers, dollar-quoted
/// bodies and comments are skipped over. Statements that are empty or only
/// contain comments are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let escaped = i > 0 && matches!(bytes[i - 1], b'e' | b'E') && !is_word_byte(bytes, i.wrapping_sub(2));
                i = skip_quoted(bytes, i, b'\'', escaped);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => i = skip_dollar_quoted(sql, i),
            b';' => {
                push_statement(&mut statements, &sql[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    push_statement(&mut statements, &sql[start..]);
    statements
}

fn push_statement(out: &mut Vec<String>, text: &str) {
    if !strip_comments(text).trim().is_empty() {
        out.push(text.trim().to_string());
    }
}

fn is_word_byte(bytes: &[u8], idx: usize) -> bool {
    bytes
        .get(idx)
        .map(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .unwrap_or(false)
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if backslash_escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|pos| start + pos + 1)
        .unwrap_or(bytes.len())
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i + 1 < bytes.len() {
        if bytes[i] == b'/' && bytes[i + 1] == b'*' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Skips `$tag$ ... $tag$`. A `$` that does not open a dollar quote (such as
/// a `$1` placeholder) is skipped on its own.
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let rest = &sql[start + 1..];
    let tag_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let tag = &rest[..tag_len];
    if !rest[tag_len..].starts_with('$') || tag.starts_with(|c: char| c.is_ascii_digit()) {
        return start + 1;
    }
    let delimiter = format!("${tag}$");
    let body_start = start + delimiter.len();
    match sql[body_start..].find(&delimiter) {
        Some(pos) => body_start + pos + delimiter.len(),
        None => sql.len(),
    }
}

/// Removes `--` and `/* */` comments outside of quoted text.
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut copied = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\'', false),
            b'"' => i = skip_quoted(bytes, i, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                out.push_str(&sql[copied..i]);
                i = skip_line_comment(bytes, i);
                out.push(' ');
                copied = i;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                out.push_str(&sql[copied..i]);
                i = skip_block_comment(bytes, i);
                out.push(' ');
                copied = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied.min(sql.len())..]);
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// Bare word, lowercased.
    Word(String),
    /// Double-quoted identifier, case preserved.
    Quoted(String),
    /// Single-quoted string literal, unescaped.
    Str(String),
    Punct(char),
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w == word)
    }

    /// Text of a word, identifier or literal.
    pub fn text(&self) -> String {
        match self {
            Token::Word(w) | Token::Quoted(w) | Token::Str(w) => w.clone(),
            Token::Punct(c) => c.to_string(),
        }
    }
}

/// Tokenizes a single statement for command classification.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let text = strip_comments(sql);
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let mut value = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == c {
                    if chars.get(i + 1) == Some(&c) {
                        value.push(c);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                value.push(chars[i]);
                i += 1;
            }
            tokens.push(if c == '\'' {
                Token::Str(value)
            } else {
                Token::Quoted(value)
            });
        } else if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '+' {
            let begin = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-' | '+' | '/' | ':'))
            {
                i += 1;
            }
            let word: String = chars[begin..i].iter().collect();
            tokens.push(Token::Word(word.to_ascii_lowercase()));
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons_only() {
        let parts = split_statements(
            "SELECT 'a;b'; SELECT \"x;y\" FROM t; -- trailing; comment\n\
             SELECT $body$ ; $body$; /* ; */ SELECT E'it\\'s;'",
        );
        assert_eq!(
            parts,
            vec![
                "SELECT 'a;b'",
                "SELECT \"x;y\" FROM t",
                "-- trailing; comment\nSELECT $body$ ; $body$",
                "/* ; */ SELECT E'it\\'s;'",
            ]
        );
    }

    #[test]
    fn placeholders_are_not_dollar_quotes() {
        assert_eq!(
            split_statements("SELECT $1; SELECT $2"),
            vec!["SELECT $1", "SELECT $2"]
        );
    }

    #[test]
    fn empty_statements_are_dropped() {
        assert!(split_statements(" ; -- nothing\n ;").is_empty());
    }

    #[test]
    fn tokenizes_set_statements() {
        let tokens = tokenize("SET application_name = 'my app' -- note");
        assert_eq!(
            tokens,
            vec![
                Token::Word("set".into()),
                Token::Word("application_name".into()),
                Token::Punct('='),
                Token::Str("my app".into()),
            ]
        );
    }
}
