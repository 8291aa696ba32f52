//! `${...}` template evaluation for brokerpak defaults and computed inputs.
//!
//! A template is literal text with embedded expressions. `$${` escapes a
//! literal `${`. When the whole template is one expression the result keeps
//! its JSON type; otherwise the pieces are concatenated into a string.
//!
//! Expressions support string/number/bool literals, variables (names may
//! contain dots, e.g. `request.instance_id`), indexing with `[..]`, `+`/`-`,
//! `==`/`!=`, `cond ? a : b`, and a fixed set of functions.

use std::cell::Cell;
use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde_json::{Map, Value};

/// Variables and lookups visible to an evaluation.
pub struct EvalContext<'a> {
    pub vars: &'a Map<String, Value>,
    pub env: &'a BTreeMap<String, String>,
    pub config: &'a Map<String, Value>,
    counter: Cell<i64>,
}

impl<'a> EvalContext<'a> {
    pub fn new(vars: &'a Map<String, Value>, env: &'a BTreeMap<String, String>, config: &'a Map<String, Value>) -> Self {
        Self {
            vars,
            env,
            config,
            counter: Cell::new(0),
        }
    }
}

/// Evaluate `template` against `ctx`.
pub fn eval(template: &str, ctx: &EvalContext<'_>) -> Result<Value> {
    let parts = split_template(template)?;
    if let [Part::Expr(src)] = parts.as_slice() {
        return eval_expr(src, ctx);
    }
    let mut out = String::new();
    for part in parts {
        match part {
            Part::Text(t) => out.push_str(&t),
            Part::Expr(src) => out.push_str(&to_display(&eval_expr(&src, ctx)?)),
        }
    }
    Ok(Value::String(out))
}

/// Whether `s` contains an interpolation.
pub fn is_template(s: &str) -> bool {
    matches!(split_template(s), Ok(parts) if parts.iter().any(|p| matches!(p, Part::Expr(_))))
}

#[derive(Debug)]
enum Part {
    Text(String),
    Expr(String),
}

fn split_template(template: &str) -> Result<Vec<Part>> {
    let chars: Vec<char> = template.chars().collect();
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'$') && chars.get(i + 2) == Some(&'{') {
            text.push_str("${");
            i += 3;
            continue;
        }
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let end = find_closing_brace(&chars, start).ok_or_else(|| anyhow!("expected expression, unterminated ${{"))?;
            if !text.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut text)));
            }
            parts.push(Part::Expr(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }
        text.push(chars[i]);
        i += 1;
    }
    if !text.is_empty() || parts.is_empty() {
        parts.push(Part::Text(text));
    }
    Ok(parts)
}

/// Index of the `}` closing an expression opened just before `start`.
fn find_closing_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => i += 1,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' if depth == 0 => return Some(i),
                '}' => depth -= 1,
                _ => {}
            }
        }
        i += 1;
    }
    None
}

// ─── Lexer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    Plus,
    Minus,
    EqEq,
    NotEq,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => push(&mut tokens, Token::LParen, &mut i),
            ')' => push(&mut tokens, Token::RParen, &mut i),
            '[' => push(&mut tokens, Token::LBracket, &mut i),
            ']' => push(&mut tokens, Token::RBracket, &mut i),
            ',' => push(&mut tokens, Token::Comma, &mut i),
            '?' => push(&mut tokens, Token::Question, &mut i),
            ':' => push(&mut tokens, Token::Colon, &mut i),
            '+' => push(&mut tokens, Token::Plus, &mut i),
            '-' => push(&mut tokens, Token::Minus, &mut i),
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => bail!("unterminated string literal"),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(other) => s.push(*other),
                                None => bail!("unterminated string literal"),
                            }
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(raw.parse().map_err(|_| anyhow!("invalid number {raw:?}"))?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character {other:?} in expression"),
        }
    }
    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, t: Token, i: &mut usize) {
    tokens.push(t);
    *i += 1;
}

// ─── Parser / evaluator ─────────────────────────────────────────────────────

fn eval_expr(src: &str, ctx: &EvalContext<'_>) -> Result<Value> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        bail!("expected expression");
    }
    let mut p = Parser { tokens, pos: 0, ctx };
    let v = p.conditional()?;
    if p.pos != p.tokens.len() {
        bail!("unexpected token {:?}", p.tokens[p.pos]);
    }
    Ok(v)
}

struct Parser<'c, 'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'c EvalContext<'a>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => bail!("expected {want:?}, found {other:?}"),
        }
    }

    // Both branches are evaluated, matching the original template engine.
    fn conditional(&mut self) -> Result<Value> {
        let cond = self.equality()?;
        if self.peek() != Some(&Token::Question) {
            return Ok(cond);
        }
        self.next();
        let a = self.conditional()?;
        self.expect(Token::Colon)?;
        let b = self.conditional()?;
        Ok(if truthy(&cond)? { a } else { b })
    }

    fn equality(&mut self) -> Result<Value> {
        let mut left = self.additive()?;
        loop {
            match self.peek() {
                Some(Token::EqEq) => {
                    self.next();
                    let right = self.additive()?;
                    left = Value::Bool(to_display(&left) == to_display(&right));
                }
                Some(Token::NotEq) => {
                    self.next();
                    let right = self.additive()?;
                    left = Value::Bool(to_display(&left) != to_display(&right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn additive(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => 1.0,
                Some(Token::Minus) => -1.0,
                _ => return Ok(left),
            };
            self.next();
            let right = self.unary()?;
            left = number_value(as_number(&left)? + op * as_number(&right)?);
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Minus) {
            self.next();
            let v = self.postfix()?;
            return Ok(number_value(-as_number(&v)?));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Value> {
        let mut v = self.primary()?;
        while self.peek() == Some(&Token::LBracket) {
            self.next();
            let key = self.conditional()?;
            self.expect(Token::RBracket)?;
            v = index(&v, &key)?;
        }
        Ok(v)
    }

    fn primary(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(s)) => eval(&s, self.ctx),
            Some(Token::Num(n)) => Ok(number_value(n)),
            Some(Token::LParen) => {
                let v = self.conditional()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.conditional()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.next();
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    return call(&name, args, self.ctx);
                }
                match name.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => self
                        .ctx
                        .vars
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| anyhow!("unknown variable accessed: {name}")),
                }
            }
            other => bail!("expected expression, found {other:?}"),
        }
    }
}

fn index(v: &Value, key: &Value) -> Result<Value> {
    match v {
        Value::Object(m) => {
            let k = to_display(key);
            m.get(&k).cloned().ok_or_else(|| anyhow!("unknown key {k:?}"))
        }
        Value::Array(a) => {
            let i = as_number(key)? as usize;
            a.get(i).cloned().ok_or_else(|| anyhow!("index {i} out of range"))
        }
        other => bail!("cannot index into {other}"),
    }
}

fn call(name: &str, args: Vec<Value>, ctx: &EvalContext<'_>) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() != n {
            bail!("{name}: expected {n} arguments, got {}", args.len());
        }
        Ok(())
    };
    match name {
        "str.truncate" => {
            arity(2)?;
            let n = as_number(&args[0])? as usize;
            Ok(Value::String(to_display(&args[1]).chars().take(n).collect()))
        }
        "str.queryEscape" => {
            arity(1)?;
            Ok(Value::String(query_escape(&to_display(&args[0]))))
        }
        "regexp.matches" => {
            arity(2)?;
            let re = Regex::new(&to_display(&args[0])).map_err(|e| anyhow!("error parsing regexp: {e}"))?;
            Ok(Value::Bool(re.is_match(&to_display(&args[1]))))
        }
        "counter.next" => {
            arity(0)?;
            let n = ctx.counter.get() + 1;
            ctx.counter.set(n);
            Ok(Value::from(n))
        }
        "json.marshal" => {
            arity(1)?;
            Ok(Value::String(serde_json::to_string(&args[0])?))
        }
        "map.flatten" => {
            arity(3)?;
            let kv_sep = to_display(&args[0]);
            let tuple_sep = to_display(&args[1]);
            let Value::Object(m) = &args[2] else {
                bail!("map.flatten: third argument must be a map");
            };
            let mut pairs: Vec<String> = m.iter().map(|(k, v)| format!("{k}{kv_sep}{}", to_display(v))).collect();
            pairs.sort();
            Ok(Value::String(pairs.join(&tuple_sep)))
        }
        "env" => {
            arity(1)?;
            let key = to_display(&args[0]);
            ctx.env
                .get(&key)
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| anyhow!("missing environment variable {key}"))
        }
        "config" => {
            arity(1)?;
            let key = to_display(&args[0]);
            lookup_config(ctx.config, &key).ok_or_else(|| anyhow!("missing config value {key}"))
        }
        "assert" => {
            arity(2)?;
            if truthy(&args[0])? {
                Ok(Value::Bool(true))
            } else {
                bail!("assertion failed: {}", to_display(&args[1]))
            }
        }
        other => bail!("unknown function {other}"),
    }
}

fn lookup_config(config: &Map<String, Value>, key: &str) -> Option<Value> {
    if let Some(v) = config.get(key) {
        return Some(render_config(v));
    }
    let mut current = Value::Object(config.clone());
    for segment in key.split('.') {
        if let Value::String(s) = &current {
            current = serde_json::from_str(s).ok()?;
        }
        current = current.get(segment)?.clone();
    }
    Some(render_config(&current))
}

fn render_config(v: &Value) -> Value {
    match v {
        Value::Object(_) | Value::Array(_) => Value::String(v.to_string()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => Value::String(parsed.to_string()),
            _ => v.clone(),
        },
        other => other.clone(),
    }
}

/// `application/x-www-form-urlencoded` escaping.
fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("invalid number")),
        Value::String(s) => s.trim().parse().map_err(|_| anyhow!("{s:?} is not a number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => bail!("{other} is not a number"),
    }
}

fn truthy(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            other => bail!("{other:?} is not a boolean"),
        },
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        other => bail!("{other} is not a boolean"),
    }
}

/// Render a value the way it appears inside a concatenated string.
pub fn to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(template: &str, vars: Value) -> Result<Value> {
        let vars = vars.as_object().cloned().unwrap_or_default();
        let env = BTreeMap::from([("FOO".to_string(), "Bar".to_string())]);
        let config = json!({"config": {"val": "foo"}, "test": {"map": {"value": "one"}, "string_object": "{\"value\":\"one\"}"}})
            .as_object()
            .cloned()
            .unwrap();
        let ctx = EvalContext::new(&vars, &env, &config);
        eval(template, &ctx)
    }

    fn ok(template: &str) -> String {
        to_display(&run(template, json!({})).unwrap())
    }

    #[test]
    fn literals_and_escapes() {
        assert_eq!(ok("foo"), "foo");
        assert_eq!(ok("${33}"), "33");
        assert_eq!(ok("$${33}"), "${33}");
        assert_eq!(ok("a-${1+1}-b"), "a-2-b");
    }

    #[test]
    fn variables_and_indexing() {
        let vars = json!({"foo": 33, "request.plan_properties": {"domain": "example.com"}});
        assert_eq!(run("${foo}", vars.clone()).unwrap(), json!(33));
        assert_eq!(
            run(r#"${request.plan_properties["domain"]}"#, vars).unwrap(),
            json!("example.com")
        );
        let err = run("${a}", json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown variable accessed: a"));
        assert!(run("${", json!({})).unwrap_err().to_string().contains("expected expression"));
    }

    #[test]
    fn functions() {
        assert_eq!(ok(r#"${str.truncate(2, "expression")}"#), "ex");
        assert_eq!(ok(r#"${str.truncate(200, "expression")}"#), "expression");
        assert_eq!(ok("${counter.next()},${counter.next()},${counter.next()}"), "1,2,3");
        assert_eq!(ok(r#"${str.queryEscape("hello world")}"#), "hello+world");
        assert_eq!(ok(r#"${str.queryEscape("hello&world")}"#), "hello%26world");
        assert_eq!(ok(r#"${regexp.matches("^(D|d)[0-9]+$", "d12345")}"#), "true");
        assert_eq!(ok(r#"${json.marshal("str")}"#), r#""str""#);
        assert_eq!(ok(r#"${env("FOO")}"#), "Bar");
        assert_eq!(ok(r#"${config("config.val")}"#), "foo");
        assert_eq!(ok(r#"${config("test.map")}"#), r#"{"value":"one"}"#);
        assert_eq!(ok(r#"${config("test.string_object.value")}"#), "one");
        assert!(run(r#"${env("_MISSING")}"#, json!({}))
            .unwrap_err()
            .to_string()
            .contains("missing environment variable _MISSING"));
    }

    #[test]
    fn map_flatten_sorted() {
        let vars = json!({"mapval": {"key2": "val2", "key1": "val1"}});
        assert_eq!(
            to_display(&run(r#"${map.flatten(":", ";", mapval)}"#, vars).unwrap()),
            "key1:val1;key2:val2"
        );
    }

    #[test]
    fn conditionals_evaluate_both_branches() {
        assert_eq!(ok(r#"${true ? "foo" : "bar"}"#), "foo");
        assert_eq!(ok(r#"${false ? "foo" : "bar"}"#), "bar");
        assert_eq!(ok("${false ? counter.next() : counter.next()}"), "2");
    }

    #[test]
    fn assert_messages_are_interpolated() {
        assert_eq!(ok(r#"${assert(true, "nothing should happen")}"#), "true");
        let err = run(r#"${assert(false, "failure message ${1+1}")}"#, json!({})).unwrap_err();
        assert!(err.to_string().contains("failure message 2"));
    }
}
