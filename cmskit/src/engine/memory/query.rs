// Filter dialect of the memory engine:
//
//   cond (AND cond)* [ORDER BY name [ASC|DESC] (, name [ASC|DESC])*] [LIMIT n]
//
// where cond is `name op literal`, `name [NOT] LIKE 'pattern'` or
// `name IS [NOT] NULL`. Names may be bare or backtick-quoted.

use crate::error::{CmsError, Result};
use crate::value::{Row, Value};
use regex::Regex;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Word(String),
    Text(String),
    Number(Value),
    Op(String),
    Comma,
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '`' || c == '\'' {
            let (text, next) = read_quoted(&chars, i, c)?;
            tokens.push(if c == '`' {
                Token::Name(text)
            } else {
                Token::Text(text)
            });
            i = next;
        } else if c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()))
        {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = match literal.parse::<i64>() {
                Ok(n) => Value::Int(n),
                Err(_) => literal
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| bad_filter(input, &format!("bad number '{literal}'")))?,
            };
            tokens.push(Token::Number(number));
        } else if matches!(c, '=' | '!' | '<' | '>') {
            let start = i;
            i += 1;
            if i < chars.len() && matches!(chars[i], '=' | '>') {
                i += 1;
            }
            let op: String = chars[start..i].iter().collect();
            if op == "!" {
                return Err(bad_filter(input, "dangling '!'"));
            }
            tokens.push(Token::Op(op));
        } else if c == ',' {
            tokens.push(Token::Comma);
            i += 1;
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            return Err(bad_filter(input, &format!("unexpected character '{c}'")));
        }
    }

    Ok(tokens)
}

/// Read a quoted run starting at `start`; a doubled quote is a literal quote.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    Err(CmsError::Engine(format!("unterminated {quote} quote in filter")))
}

fn bad_filter(filter: &str, reason: &str) -> CmsError {
    CmsError::Engine(format!("invalid filter '{filter}': {reason}"))
}

#[derive(Debug)]
enum Predicate {
    Compare(String, Value),
    Like(Regex),
    NotLike(Regex),
    IsNull,
    IsNotNull,
}

#[derive(Debug)]
struct Condition {
    field: String,
    predicate: Predicate,
}

impl Condition {
    fn matches(&self, row: &Row) -> bool {
        let value = row.get(&self.field).unwrap_or(&Value::Null);
        match &self.predicate {
            Predicate::IsNull => value.is_null(),
            Predicate::IsNotNull => !value.is_null(),
            Predicate::Like(re) => !value.is_null() && re.is_match(&value.to_text()),
            Predicate::NotLike(re) => !value.is_null() && !re.is_match(&value.to_text()),
            Predicate::Compare(op, literal) => {
                // SQL semantics: comparing with NULL is never true.
                if value.is_null() || literal.is_null() {
                    return false;
                }
                let ord = value.compare(literal);
                match op.as_str() {
                    "=" => ord == Ordering::Equal,
                    "!=" | "<>" => ord != Ordering::Equal,
                    "<" => ord == Ordering::Less,
                    "<=" => ord != Ordering::Greater,
                    ">" => ord == Ordering::Greater,
                    ">=" => ord != Ordering::Less,
                    _ => false,
                }
            }
        }
    }
}

/// A parsed memory-engine filter
#[derive(Debug, Default)]
pub(super) struct Query {
    conditions: Vec<Condition>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
}

struct Parser<'a> {
    filter: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_word(&self, keyword: &str) -> bool {
        self.peek().map_or(false, |t| t.is_word(keyword))
    }

    fn expect_word(&mut self, keyword: &str) -> Result<()> {
        match self.next() {
            Some(t) if t.is_word(keyword) => Ok(()),
            other => Err(self.error(&format!("expected {keyword}, found {other:?}"))),
        }
    }

    fn error(&self, reason: &str) -> CmsError {
        bad_filter(self.filter, reason)
    }

    fn name(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Name(n)) | Some(Token::Word(n)) => Ok(n),
            other => Err(self.error(&format!("expected field name, found {other:?}"))),
        }
    }

    fn literal(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Text(s)) => Ok(Value::Text(s)),
            Some(Token::Number(n)) => Ok(n),
            Some(t) if t.is_word("NULL") => Ok(Value::Null),
            Some(t) if t.is_word("TRUE") => Ok(Value::Bool(true)),
            Some(t) if t.is_word("FALSE") => Ok(Value::Bool(false)),
            other => Err(self.error(&format!("expected literal, found {other:?}"))),
        }
    }

    fn pattern(&mut self) -> Result<Regex> {
        match self.next() {
            Some(Token::Text(s)) => like_regex(&s),
            other => Err(self.error(&format!("expected LIKE pattern, found {other:?}"))),
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        let field = self.name()?;
        let predicate = match self.next() {
            Some(Token::Op(op)) => Predicate::Compare(op, self.literal()?),
            Some(t) if t.is_word("LIKE") => Predicate::Like(self.pattern()?),
            Some(t) if t.is_word("NOT") => {
                self.expect_word("LIKE")?;
                Predicate::NotLike(self.pattern()?)
            }
            Some(t) if t.is_word("IS") => {
                let negated = self.at_word("NOT");
                if negated {
                    self.pos += 1;
                }
                self.expect_word("NULL")?;
                if negated {
                    Predicate::IsNotNull
                } else {
                    Predicate::IsNull
                }
            }
            other => return Err(self.error(&format!("expected operator, found {other:?}"))),
        };
        Ok(Condition { field, predicate })
    }

    fn parse(mut self) -> Result<Query> {
        let mut query = Query::default();

        if self.peek().is_some() && !self.at_word("ORDER") && !self.at_word("LIMIT") {
            query.conditions.push(self.condition()?);
            while self.at_word("AND") {
                self.pos += 1;
                query.conditions.push(self.condition()?);
            }
        }

        if self.at_word("ORDER") {
            self.pos += 1;
            self.expect_word("BY")?;
            loop {
                let field = self.name()?;
                let descending = if self.at_word("DESC") {
                    self.pos += 1;
                    true
                } else {
                    if self.at_word("ASC") {
                        self.pos += 1;
                    }
                    false
                };
                query.order.push((field, descending));
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        if self.at_word("LIMIT") {
            self.pos += 1;
            match self.next() {
                Some(Token::Number(Value::Int(n))) if n >= 0 => query.limit = Some(n as usize),
                other => return Err(self.error(&format!("expected row count, found {other:?}"))),
            }
        }

        if let Some(token) = self.peek() {
            return Err(self.error(&format!("unexpected {token:?}")));
        }
        Ok(query)
    }
}

fn like_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| CmsError::Engine(format!("bad LIKE pattern '{pattern}': {e}")))
}

impl Query {
    pub(super) fn parse(filter: &str) -> Result<Query> {
        Parser {
            filter,
            tokens: tokenize(filter)?,
            pos: 0,
        }
        .parse()
    }

    pub(super) fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Positions of matching rows after ordering and limiting.
    pub(super) fn select_indices(&self, rows: &[Row]) -> Vec<usize> {
        let mut indices: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| self.matches(row))
            .map(|(i, _)| i)
            .collect();

        if !self.order.is_empty() {
            indices.sort_by(|&a, &b| {
                for (field, descending) in &self.order {
                    let left = rows[a].get(field).unwrap_or(&Value::Null);
                    let right = rows[b].get(field).unwrap_or(&Value::Null);
                    let ord = left.compare(right);
                    let ord = if *descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            indices.truncate(limit);
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        vec![
            [("id", Value::Int(1)), ("title", Value::from("Home")), ("rank", Value::Int(3))]
                .into_iter()
                .collect(),
            [("id", Value::Int(2)), ("title", Value::from("About us")), ("rank", Value::Null)]
                .into_iter()
                .collect(),
            [("id", Value::Int(3)), ("title", Value::from("O'Hare")), ("rank", Value::Int(1))]
                .into_iter()
                .collect(),
        ]
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let query = Query::parse("").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![0, 1, 2]);
    }

    #[test]
    fn test_comparisons_and_conjunction() {
        let query = Query::parse("`id` >= 2 AND `title` != 'About us'").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![2]);
    }

    #[test]
    fn test_quoted_text_with_escape() {
        let query = Query::parse("`title` = 'O''Hare'").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![2]);
    }

    #[test]
    fn test_null_predicates() {
        assert_eq!(
            Query::parse("`rank` IS NULL").unwrap().select_indices(&rows()),
            vec![1]
        );
        assert_eq!(
            Query::parse("rank is not null").unwrap().select_indices(&rows()),
            vec![0, 2]
        );
        assert!(Query::parse("`rank` = NULL").unwrap().select_indices(&rows()).is_empty());
    }

    #[test]
    fn test_like_is_case_insensitive() {
        let query = Query::parse("`title` LIKE '%US'").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![1]);
        let query = Query::parse("`title` NOT LIKE 'h_me'").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![1, 2]);
    }

    #[test]
    fn test_order_and_limit() {
        let query = Query::parse(" ORDER BY `rank` DESC, `id` LIMIT 2").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![0, 2]);
        let query = Query::parse("`id` > 0 ORDER BY `title`").unwrap();
        assert_eq!(query.select_indices(&rows()), vec![1, 0, 2]);
    }

    #[test]
    fn test_malformed_filters() {
        assert!(Query::parse("`id` =").is_err());
        assert!(Query::parse("`id` = 'open").is_err());
        assert!(Query::parse("`id` = 1 OR `id` = 2").is_err());
        assert!(Query::parse("LIMIT x").is_err());
    }
}
