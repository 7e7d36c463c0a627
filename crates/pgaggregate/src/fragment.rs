//! Parses user-supplied SQL fragments containing `:name` placeholders into an
//! [`ast::Node`], sharing one parameter namespace so repeated placeholder
//! names collapse onto a single [`ast::ParamId`].
//!
//! Tokenization recognizes single- and double-quoted strings (copied through
//! verbatim), whitespace, the `::` cast operator, `:name` placeholders,
//! bare words, and single punctuation characters — the same token classes a
//! small hand-rolled SQL tokenizer needs to avoid misreading a placeholder
//! inside a string literal or a cast.

use std::collections::HashMap;

use crate::ast::{Node, Param, ParamId, ParamIdGen, ParamMap};
use crate::error::{OrmError, OrmResult};

enum Token {
    Text(String),
    Placeholder(String),
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                text.push(chars.next().unwrap());
                for ch in chars.by_ref() {
                    text.push(ch);
                    if ch == quote {
                        break;
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_whitespace() => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_whitespace() {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push(Token::Text(text));
            }
            ':' => {
                chars.next();
                if chars.peek() == Some(&':') {
                    chars.next();
                    tokens.push(Token::Text("::".to_string()));
                } else {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Placeholder(name));
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Text(word));
            }
            _ => {
                chars.next();
                tokens.push(Token::Text(c.to_string()));
            }
        }
    }
    tokens
}

/// Parses `sql` against a table of placeholder values into a splice-able
/// [`Node::Fragment`], allocating parameter ids from a caller-owned
/// generator and recording name-to-id assignments in a caller-owned table.
///
/// Threading `param_gen` and `assigned` in from the caller is what lets
/// [`crate::builder::QueryBuilder`] parse several fragments (a `.where_`, a
/// `.having`, an `.order_by`) into one statement and have the same
/// placeholder name collapse onto the same parameter across all of them, not
/// just within a single fragment.
pub fn parse_into(
    sql: &str,
    values: &HashMap<String, Param>,
    param_gen: &mut ParamIdGen,
    assigned: &mut HashMap<String, ParamId>,
    param_map: &mut ParamMap,
) -> OrmResult<Node> {
    let mut nodes = Vec::new();
    let mut pending_text = String::new();

    for tok in tokenize(sql) {
        match tok {
            Token::Text(t) => pending_text.push_str(&t),
            Token::Placeholder(name) => {
                if !pending_text.is_empty() {
                    nodes.push(Node::Text(std::mem::take(&mut pending_text)));
                }
                let value = values
                    .get(&name)
                    .ok_or_else(|| OrmError::ParameterMissing(name.clone()))?;
                let id = *assigned.entry(name).or_insert_with(|| param_gen.next());
                param_map.entry(id).or_insert_with(|| value.clone());
                nodes.push(Node::Param(id));
            }
        }
    }
    if !pending_text.is_empty() {
        nodes.push(Node::Text(pending_text));
    }

    Ok(Node::Fragment(nodes))
}

/// Parses `sql` as a single, self-contained fragment with its own fresh
/// parameter namespace — the common case for one ad hoc statement.
pub fn parse(sql: &str, values: &HashMap<String, Param>) -> OrmResult<(Node, ParamMap)> {
    let mut param_gen = ParamIdGen::new();
    let mut assigned: HashMap<String, ParamId> = HashMap::new();
    let mut param_map = ParamMap::new();
    let node = parse_into(sql, values, &mut param_gen, &mut assigned, &mut param_map)?;
    Ok((node, param_map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Renderer;

    #[test]
    fn parses_single_placeholder() {
        let mut values = HashMap::new();
        values.insert("id".to_string(), Param::new(1i64));
        let (node, params) = parse("id = :id", &values).unwrap();
        let mut r = Renderer::new();
        let sql = r.render(&node).unwrap();
        assert_eq!(sql, "id = $1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn repeated_placeholder_shares_one_slot() {
        let mut values = HashMap::new();
        values.insert("status".to_string(), Param::new("active".to_string()));
        let (node, params) = parse(":status = a.status OR :status = b.status", &values).unwrap();
        let mut r = Renderer::new();
        let sql = r.render(&node).unwrap();
        assert_eq!(sql, "$1 = a.status OR $1 = b.status");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn missing_placeholder_is_error() {
        let values = HashMap::new();
        assert!(matches!(
            parse("x = :missing", &values),
            Err(OrmError::ParameterMissing(name)) if name == "missing"
        ));
    }

    #[test]
    fn quoted_strings_are_not_tokenized_as_placeholders() {
        let values = HashMap::new();
        let (node, params) = parse("title = 'not:a:placeholder'", &values).unwrap();
        let mut r = Renderer::new();
        let sql = r.render(&node).unwrap();
        assert_eq!(sql, "title = 'not:a:placeholder'");
        assert!(params.is_empty());
    }

    #[test]
    fn cast_operator_is_preserved() {
        let mut values = HashMap::new();
        values.insert("v".to_string(), Param::new(1i32));
        let (node, _) = parse(":v::text", &values).unwrap();
        let mut r = Renderer::new();
        assert_eq!(r.render(&node).unwrap(), "$1::text");
    }
}
