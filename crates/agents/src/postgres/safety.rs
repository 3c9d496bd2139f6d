//! # SQL Safety Gate
//!
//! Nothing the model emits is trusted. Before any generated SQL touches a
//! tenant connection it is tokenized with full literal awareness (single
//! quotes with doubled-quote escapes, `E''` escape strings, dollar
//! quoting, quoted identifiers, line and nested block comments) and then
//! gated:
//!
//! 1. exactly one statement
//! 2. no write/DDL keyword outside a string literal
//! 3. no identifier qualified by a schema outside the tenant allow-list
//! 4. a `SELECT` must be present
//! 5. values travel as `$n` parameters, not inline literals
//!
//! The gate works on tokens, never on substring matches: `'DROP TABLE'`
//! inside a string literal is data, `DROP` as a word is an attack.

use std::collections::HashSet;
use std::fmt;

/// Keywords that end the conversation. Matched case-insensitively against
/// word tokens only.
const FORBIDDEN: &[&str] = &[
    "insert", "update", "delete", "drop", "truncate", "alter", "create", "grant", "revoke",
    "copy", "call", "do", "vacuum", "analyze", "lock",
];

/// Schemas no tenant may touch regardless of allow-list.
const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// Inline string literals longer than this must be parameters instead.
const MAX_INLINE_LITERAL: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlToken {
    /// Bare word: keyword or unquoted identifier, original casing kept
    Word(String),
    /// `"quoted"` identifier
    QuotedIdent(String),
    /// `'...'`, `E'...'`, or `$tag$...$tag$` literal contents
    StringLit(String),
    Number(String),
    /// `$3` placeholder
    Param(u32),
    Symbol(char),
}

impl SqlToken {
    fn word_eq(&self, s: &str) -> bool {
        matches!(self, SqlToken::Word(w) if w.eq_ignore_ascii_case(s))
    }

    fn ident_text(&self) -> Option<&str> {
        match self {
            SqlToken::Word(w) => Some(w),
            SqlToken::QuotedIdent(w) => Some(w),
            _ => None,
        }
    }
}

/// Which gate rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRule {
    Unparsable,
    MultipleStatements,
    DisallowedStatement,
    ForbiddenSchema,
    MissingSelect,
    UnparameterizedLiteral,
}

impl GateRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateRule::Unparsable => "unparsable",
            GateRule::MultipleStatements => "multiple_statements",
            GateRule::DisallowedStatement => "disallowed_statement",
            GateRule::ForbiddenSchema => "forbidden_schema",
            GateRule::MissingSelect => "missing_select",
            GateRule::UnparameterizedLiteral => "unparameterized_literal",
        }
    }

    /// Malicious-classed rules fail hard after one re-prompt; the rest
    /// earn the user a clarifying question instead.
    pub fn is_malicious(&self) -> bool {
        matches!(self, GateRule::MultipleStatements | GateRule::DisallowedStatement)
    }
}

impl fmt::Display for GateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gate rejection: the rule plus a short operator-readable detail.
#[derive(Debug, Clone)]
pub struct GateRejection {
    pub rule: GateRule,
    pub detail: String,
}

impl GateRejection {
    fn new(rule: GateRule, detail: impl Into<String>) -> Self {
        Self { rule, detail: detail.into() }
    }
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.detail)
    }
}

/// What the gate learned about an accepted query.
#[derive(Debug, Clone)]
pub struct CheckedQuery {
    /// Tables named in FROM/JOIN position, without schema qualifier
    pub tables: Vec<String>,
    /// Value of a trailing `LIMIT n`, when present
    pub limit: Option<u64>,
}

/// Tokenizes `sql` with literal awareness. Fails on unterminated quotes
/// or comments.
pub fn tokenize(sql: &str) -> Result<Vec<SqlToken>, GateRejection> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // line comment
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        // block comment, nested per PostgreSQL
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let mut depth = 1;
            i += 2;
            while i < chars.len() && depth > 0 {
                if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                    depth += 1;
                    i += 2;
                } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            if depth > 0 {
                return Err(GateRejection::new(GateRule::Unparsable, "unterminated block comment"));
            }
            continue;
        }

        // escape string literal E'...'
        if (c == 'e' || c == 'E') && chars.get(i + 1) == Some(&'\'') {
            let (lit, next) = scan_escape_string(&chars, i + 2)?;
            tokens.push(SqlToken::StringLit(lit));
            i = next;
            continue;
        }

        // plain string literal with '' escapes
        if c == '\'' {
            let (lit, next) = scan_plain_string(&chars, i + 1)?;
            tokens.push(SqlToken::StringLit(lit));
            i = next;
            continue;
        }

        // quoted identifier with "" escapes
        if c == '"' {
            let (ident, next) = scan_quoted_ident(&chars, i + 1)?;
            tokens.push(SqlToken::QuotedIdent(ident));
            i = next;
            continue;
        }

        // dollar quote or parameter
        if c == '$' {
            if let Some((param, next)) = scan_param(&chars, i) {
                tokens.push(SqlToken::Param(param));
                i = next;
                continue;
            }
            if let Some((lit, next)) = scan_dollar_quote(&chars, i)? {
                tokens.push(SqlToken::StringLit(lit));
                i = next;
                continue;
            }
            tokens.push(SqlToken::Symbol('$'));
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(SqlToken::Number(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(SqlToken::Word(chars[start..i].iter().collect()));
            continue;
        }

        tokens.push(SqlToken::Symbol(c));
        i += 1;
    }

    Ok(tokens)
}

fn scan_plain_string(
    chars: &[char],
    mut i: usize,
) -> Result<(String, usize), GateRejection> {
    let mut out = String::new();
    while i < chars.len() {
        if chars[i] == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Err(GateRejection::new(GateRule::Unparsable, "unterminated string literal"))
}

fn scan_escape_string(
    chars: &[char],
    mut i: usize,
) -> Result<(String, usize), GateRejection> {
    let mut out = String::new();
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(chars[i + 1]);
                i += 2;
            }
            '\'' => {
                if chars.get(i + 1) == Some(&'\'') {
                    out.push('\'');
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(GateRejection::new(GateRule::Unparsable, "unterminated escape string"))
}

fn scan_quoted_ident(
    chars: &[char],
    mut i: usize,
) -> Result<(String, usize), GateRejection> {
    let mut out = String::new();
    while i < chars.len() {
        if chars[i] == '"' {
            if chars.get(i + 1) == Some(&'"') {
                out.push('"');
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Err(GateRejection::new(GateRule::Unparsable, "unterminated quoted identifier"))
}

fn scan_param(chars: &[char], i: usize) -> Option<(u32, usize)> {
    let mut j = i + 1;
    let mut digits = String::new();
    while j < chars.len() && chars[j].is_ascii_digit() {
        digits.push(chars[j]);
        j += 1;
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok().map(|n| (n, j))
    }
}

fn scan_dollar_quote(
    chars: &[char],
    i: usize,
) -> Result<Option<(String, usize)>, GateRejection> {
    // $tag$ where tag is empty or an identifier
    let mut j = i + 1;
    let mut tag = String::new();
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        tag.push(chars[j]);
        j += 1;
    }
    if chars.get(j) != Some(&'$') {
        return Ok(None);
    }
    let open: String = format!("${tag}$");
    let rest: String = chars[j + 1..].iter().collect();
    match rest.find(&open) {
        Some(pos) => {
            let lit = rest[..pos].to_string();
            Ok(Some((lit, j + 1 + rest[..pos].chars().count() + open.chars().count())))
        }
        None => Err(GateRejection::new(GateRule::Unparsable, "unterminated dollar quote")),
    }
}

/// Runs all gate rules over `sql`. `allowed_schemas` is the tenant's
/// allow-list; `param_count` is how many bound values accompany the query.
pub fn check(
    sql: &str,
    allowed_schemas: &[String],
    param_count: usize,
) -> Result<CheckedQuery, GateRejection> {
    let tokens = tokenize(sql)?;

    if tokens.is_empty() {
        return Err(GateRejection::new(GateRule::Unparsable, "empty statement"));
    }

    // Rule 1: single statement. A semicolon may only trail the statement.
    if let Some(pos) = tokens.iter().position(|t| matches!(t, SqlToken::Symbol(';'))) {
        if pos != tokens.len() - 1 {
            return Err(GateRejection::new(
                GateRule::MultipleStatements,
                "statement separator found mid-query",
            ));
        }
    }

    // Rule 2: write/DDL words are never data-access
    for token in &tokens {
        if let SqlToken::Word(word) = token {
            let lower = word.to_ascii_lowercase();
            if FORBIDDEN.contains(&lower.as_str()) {
                return Err(GateRejection::new(
                    GateRule::DisallowedStatement,
                    format!("'{}' is not allowed", lower.to_uppercase()),
                ));
            }
        }
    }

    // Rule 4 (checked before schema analysis: cheap and decisive)
    if !tokens.iter().any(|t| t.word_eq("select")) {
        return Err(GateRejection::new(GateRule::MissingSelect, "query is not a SELECT"));
    }

    // Collect table references and aliases so dotted qualifiers can be
    // told apart from schema references.
    let (tables, aliases, schema_refs) = collect_references(&tokens);

    let allowed: HashSet<String> = allowed_schemas
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();
    for schema in &schema_refs {
        if SYSTEM_SCHEMAS.contains(&schema.as_str()) || !allowed.contains(schema) {
            return Err(GateRejection::new(
                GateRule::ForbiddenSchema,
                format!("schema '{schema}' is outside the tenant allow-list"),
            ));
        }
    }

    // Rule 3b: dotted qualifiers that are neither known aliases, known
    // tables, nor allowed schemas are treated as schema escapes.
    for (qualifier, _) in dotted_pairs(&tokens) {
        let q = qualifier.to_ascii_lowercase();
        if aliases.contains(&q) || tables.contains(&q) || allowed.contains(&q) {
            continue;
        }
        return Err(GateRejection::new(
            GateRule::ForbiddenSchema,
            format!("unresolved qualifier '{qualifier}'"),
        ));
    }

    // Rule 5: placeholders must be contiguous and match the bound values
    let max_param = tokens
        .iter()
        .filter_map(|t| match t {
            SqlToken::Param(n) => Some(*n),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    if max_param as usize != param_count {
        return Err(GateRejection::new(
            GateRule::UnparameterizedLiteral,
            format!("query uses {max_param} placeholders but {param_count} values were supplied"),
        ));
    }
    for lit in tokens.iter().filter_map(|t| match t {
        SqlToken::StringLit(s) => Some(s),
        _ => None,
    }) {
        if lit.chars().count() > MAX_INLINE_LITERAL {
            return Err(GateRejection::new(
                GateRule::UnparameterizedLiteral,
                "long inline literal must be passed as a parameter",
            ));
        }
    }

    let limit = find_trailing_limit(&tokens);
    let mut table_list: Vec<String> = tables.into_iter().collect();
    table_list.sort();

    Ok(CheckedQuery { tables: table_list, limit })
}

/// Extracts (tables, aliases, schema qualifiers in FROM/JOIN position).
fn collect_references(
    tokens: &[SqlToken],
) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
    let mut tables = HashSet::new();
    let mut aliases = HashSet::new();
    let mut schemas = HashSet::new();

    let mut i = 0;
    while i < tokens.len() {
        let at_table_pos = tokens[i].word_eq("from") || tokens[i].word_eq("join");
        if at_table_pos {
            if let Some(next) = tokens.get(i + 1) {
                // subquery: `FROM ( ... ) alias` handled by the AS scan below
                if let Some(first) = next.ident_text() {
                    let mut name = first.to_ascii_lowercase();
                    let mut consumed = i + 2;
                    if matches!(tokens.get(consumed), Some(SqlToken::Symbol('.'))) {
                        if let Some(table) = tokens.get(consumed + 1).and_then(|t| t.ident_text()) {
                            schemas.insert(name.clone());
                            name = table.to_ascii_lowercase();
                            consumed += 2;
                        }
                    }
                    tables.insert(name);
                    // optional [AS] alias
                    let mut k = consumed;
                    if tokens.get(k).map(|t| t.word_eq("as")).unwrap_or(false) {
                        k += 1;
                    }
                    if let Some(alias) = tokens.get(k).and_then(|t| t.ident_text()) {
                        if !is_clause_word(alias) {
                            aliases.insert(alias.to_ascii_lowercase());
                        }
                    }
                }
            }
        }
        // any `AS name` marks an alias (subqueries, CTE names come via WITH)
        if tokens[i].word_eq("as") {
            if let Some(alias) = tokens.get(i + 1).and_then(|t| t.ident_text()) {
                aliases.insert(alias.to_ascii_lowercase());
            }
        }
        // CTE: `WITH name AS (` and `, name AS (`
        if tokens[i].word_eq("with") {
            if let Some(name) = tokens.get(i + 1).and_then(|t| t.ident_text()) {
                aliases.insert(name.to_ascii_lowercase());
            }
        }
        i += 1;
    }

    (tables, aliases, schemas)
}

fn is_clause_word(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "where" | "group" | "order" | "limit" | "offset" | "having" | "join" | "left" | "right"
            | "inner" | "outer" | "full" | "cross" | "on" | "union" | "intersect" | "except"
            | "using"
    )
}

/// All `qualifier.member` pairs in the token stream.
fn dotted_pairs(tokens: &[SqlToken]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for window in tokens.windows(3) {
        if let (Some(q), SqlToken::Symbol('.'), Some(m)) =
            (window[0].ident_text(), &window[1], window[2].ident_text())
        {
            pairs.push((q.to_string(), m.to_string()));
        }
    }
    pairs
}

fn find_trailing_limit(tokens: &[SqlToken]) -> Option<u64> {
    let significant: Vec<&SqlToken> = tokens
        .iter()
        .filter(|t| !matches!(t, SqlToken::Symbol(';')))
        .collect();
    let n = significant.len();
    if n >= 2 && significant[n - 2].word_eq("limit") {
        if let SqlToken::Number(num) = significant[n - 1] {
            return num.parse().ok();
        }
    }
    None
}
