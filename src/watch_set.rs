//! Static analysis of a compiled statement's referenced tables.
//!
//! A subscription's watch set comes from scanning the SQL text, not from
//! executing it. The scan is conservative in the safe direction: a name it
//! cannot prove is not a table (a CTE, for instance) is included, which at
//! worst causes a spurious re-run; it never misses a real table.

use std::collections::BTreeSet;

/// Collect the table names a statement reads or writes, lowercased.
///
/// Handles comments, string literals, quoted identifiers (`"t"`, `` `t` ``,
/// `[t]`), schema qualifiers (`main.users` yields `users`), `FROM a, b`
/// lists, every `JOIN` form, `INSERT INTO` / `UPDATE` / `DELETE FROM`
/// targets, subqueries at any depth, and `ON CONFLICT DO UPDATE SET`.
/// Table-valued functions (`json_each(...)`) are not tables and are skipped.
pub fn referenced_tables(sql: &str) -> BTreeSet<String> {
    let tokens = tokenize(sql);
    let mut tables = BTreeSet::new();
    // One mode per parenthesis scope, so a subquery cannot clobber the state
    // of the FROM list that contains it.
    let mut stack: Vec<Mode> = vec![Mode::Idle];
    let mut i = 0;

    while i < tokens.len() {
        let mode = stack.last().copied().unwrap_or(Mode::Idle);
        match &tokens[i] {
            Token::Punct('(') => {
                if mode == Mode::FromExpect {
                    // A parenthesized source (subquery) is the FROM item.
                    set_mode(&mut stack, Mode::FromSeen);
                }
                stack.push(Mode::Idle);
                i += 1;
            }
            Token::Punct(')') => {
                if stack.len() > 1 {
                    stack.pop();
                }
                i += 1;
            }
            Token::Punct(',') => {
                if mode == Mode::FromSeen {
                    set_mode(&mut stack, Mode::FromExpect);
                }
                i += 1;
            }
            Token::Punct(';') => {
                stack.clear();
                stack.push(Mode::Idle);
                i += 1;
            }
            Token::Punct(_) => {
                i += 1;
            }
            Token::Word { text, quoted } => {
                if !quoted && is_keyword(text) {
                    let followed_by_set = matches!(
                        tokens.get(i + 1),
                        Some(Token::Word { text, quoted: false }) if text.eq_ignore_ascii_case("set")
                    );
                    let next = keyword_transition(mode, &text.to_ascii_lowercase(), followed_by_set);
                    set_mode(&mut stack, next);
                    i += 1;
                } else {
                    match mode {
                        Mode::FromExpect | Mode::ExpectName => {
                            let (name, after) = qualified_name(&tokens, i);
                            let call = matches!(tokens.get(after), Some(Token::Punct('(')));
                            // After INTO/UPDATE a following `(` is a column
                            // list, so the name is still the table.
                            if mode == Mode::ExpectName || !call {
                                tables.insert(name.to_ascii_lowercase());
                            }
                            let next = if mode == Mode::ExpectName {
                                Mode::Idle
                            } else {
                                Mode::FromSeen
                            };
                            set_mode(&mut stack, next);
                            i = after;
                        }
                        _ => i += 1,
                    }
                }
            }
        }
    }
    tables
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Not inside a table-name position.
    Idle,
    /// The next identifier names a table (after INTO or UPDATE).
    ExpectName,
    /// Inside a FROM/JOIN list, expecting the next source.
    FromExpect,
    /// Inside a FROM/JOIN list, current source consumed (aliases follow).
    FromSeen,
}

fn set_mode(stack: &mut Vec<Mode>, mode: Mode) {
    if let Some(top) = stack.last_mut() {
        *top = mode;
    }
}

fn keyword_transition(mode: Mode, keyword: &str, followed_by_set: bool) -> Mode {
    match keyword {
        "from" | "join" => Mode::FromExpect,
        "into" => Mode::ExpectName,
        // `ON CONFLICT DO UPDATE SET` names no table; a real UPDATE does.
        "update" if !followed_by_set => Mode::ExpectName,
        "update" => mode,
        _ => match mode {
            Mode::FromSeen => match keyword {
                // Words that may sit between one FROM source and the next.
                "as" | "indexed" | "by" | "not" | "left" | "right" | "full" | "inner"
                | "outer" | "cross" | "natural" => Mode::FromSeen,
                _ => Mode::Idle,
            },
            _ => Mode::Idle,
        },
    }
}

/// Read `schema.table`-style chains starting at a Word token; the table is the
/// last segment. Returns the name and the index after the chain.
fn qualified_name(tokens: &[Token], start: usize) -> (String, usize) {
    let mut name = match &tokens[start] {
        Token::Word { text, .. } => text.clone(),
        _ => String::new(),
    };
    let mut i = start + 1;
    while matches!(tokens.get(i), Some(Token::Punct('.'))) {
        match tokens.get(i + 1) {
            Some(Token::Word { text, .. }) => {
                name = text.clone();
                i += 2;
            }
            _ => break,
        }
    }
    (name, i)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word { text: String, quoted: bool },
    Punct(char),
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            // String literals cannot name tables; drop them entirely.
            '\'' => i = skip_quoted(&chars, i, '\''),
            '"' => {
                let (text, next) = read_quoted(&chars, i, '"');
                tokens.push(Token::Word { text, quoted: true });
                i = next;
            }
            '`' => {
                let (text, next) = read_quoted(&chars, i, '`');
                tokens.push(Token::Word { text, quoted: true });
                i = next;
            }
            '[' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                tokens.push(Token::Word {
                    text: chars[start..j].iter().collect(),
                    quoted: true,
                });
                i = (j + 1).min(chars.len());
            }
            // Positional and named parameters.
            '?' => {
                i += 1;
                while matches!(chars.get(i), Some(d) if d.is_ascii_digit()) {
                    i += 1;
                }
            }
            ':' | '@' | '$' => {
                i += 1;
                while matches!(chars.get(i), Some(d) if is_ident_char(*d)) {
                    i += 1;
                }
            }
            _ if c.is_ascii_digit() => {
                i += 1;
                while matches!(chars.get(i), Some(d) if d.is_ascii_alphanumeric() || *d == '.' || *d == '_')
                {
                    i += 1;
                }
            }
            _ if is_ident_start(c) => {
                let start = i;
                while matches!(chars.get(i), Some(d) if is_ident_char(*d)) {
                    i += 1;
                }
                tokens.push(Token::Word {
                    text: chars[start..i].iter().collect(),
                    quoted: false,
                });
            }
            _ => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }
    tokens
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            // Doubled quote is an escape.
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

fn read_quoted(chars: &[char], start: usize, quote: char) -> (String, usize) {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return (text, i + 1);
        }
        text.push(chars[i]);
        i += 1;
    }
    (text, i)
}

fn is_keyword(word: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "abort", "add", "all", "alter", "analyze", "and", "as", "asc", "attach", "begin",
        "between", "by", "case", "cast", "check", "collate", "column", "commit", "conflict",
        "constraint", "create", "cross", "current", "default", "deferred", "delete", "desc",
        "detach", "distinct", "do", "drop", "else", "end", "escape", "except", "exclusive",
        "exists", "explain", "fail", "filter", "following", "foreign", "from", "full", "glob",
        "group", "having", "if", "ignore", "immediate", "in", "index", "indexed", "inner",
        "insert", "intersect", "into", "is", "isnull", "join", "key", "left", "like", "limit",
        "match", "natural", "not", "nothing", "notnull", "null", "offset", "on", "or", "order",
        "outer", "over", "partition", "pragma", "preceding", "primary", "range", "recursive",
        "references", "regexp", "release", "rename", "replace", "returning", "right", "rollback",
        "rows", "savepoint", "select", "set", "table", "temp", "temporary", "then", "to",
        "transaction", "trigger", "unbounded", "union", "unique", "update", "using", "vacuum",
        "values", "view", "when", "where", "window", "with",
    ];
    let lower = word.to_ascii_lowercase();
    KEYWORDS.binary_search(&lower.as_str()).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
