//! Condition compiler.
//!
//! Turns a condition string into a [`CompiledCondition`]:
//!
//! ```text
//! parameters.amount > 1000 and not agent.trust_level >= 0.8
//! parameters.path.startswith("/etc") or is_sensitive_path(parameters.path)
//! contains_pii(parameters) and task.id != null
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr       = and_expr ("or" and_expr)*
//! and_expr   = not_expr ("and" not_expr)*
//! not_expr   = "not" not_expr | "(" expr ")" | comparison
//! comparison = operand [CMP operand]
//! operand    = literal | reference
//! reference  = IDENT ("." IDENT)* [call ("." IDENT call)*]
//! call       = "(" [operand ("," operand)*] ")"
//! CMP        = "==" | "!=" | ">" | "<" | ">=" | "<="
//! literal    = STRING | NUMBER | true | false | null
//! ```
//!
//! `a.b.startswith("x")` is sugar for `startswith(a.b, "x")`. Every
//! function name is resolved against the builtin table here, so an
//! unknown name never survives compilation.

use crate::condition::{CmpOp, CompiledCondition, Expr, Literal, Operand};
use crate::functions::Builtin;
use actionguard_core::SyntaxError;

/// Longest accepted condition source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Deepest accepted nesting of groups, negations and calls.
pub const MAX_NESTING: usize = 32;

/// Compile a condition. Empty (or all-whitespace) input always holds.
pub fn compile(source: &str) -> Result<CompiledCondition, SyntaxError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(SyntaxError::new(
            format!("condition is longer than {MAX_SOURCE_LEN} bytes"),
            MAX_SOURCE_LEN,
        ));
    }
    if source.trim().is_empty() {
        return Ok(CompiledCondition::always());
    }

    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        end: source.len(),
    };
    let expr = parser.parse_or()?;
    if let Some((token, at)) = parser.tokens.get(parser.pos) {
        return Err(SyntaxError::new(
            format!("unexpected {} after expression", token.describe()),
            *at,
        ));
    }
    Ok(CompiledCondition::new(source, expr))
}

// ─── Tokenizer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    LParen,
    RParen,
    Comma,
    Dot,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Str(_) => "string literal".into(),
            Token::Num(n) => format!("number {n}"),
            Token::True | Token::False => "boolean literal".into(),
            Token::Null => "null".into(),
            Token::And => "'and'".into(),
            Token::Or => "'or'".into(),
            Token::Not => "'not'".into(),
            Token::Cmp(op) => format!("'{}'", op.symbol()),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
            Token::Dot => "'.'".into(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, SyntaxError> {
    let mut tokens: Vec<(Token, usize)> = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(at, c)) = chars.peek() {
        let after_dot = matches!(tokens.last(), Some((Token::Dot, _)));
        match c {
            _ if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '.' => {
                chars.next();
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Dot,
                };
                tokens.push((token, at));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, 'r')) => s.push('\r'),
                            Some((_, escaped)) => s.push(escaped),
                            None => return Err(SyntaxError::new("unterminated string literal", at)),
                        },
                        Some((_, ch)) if ch == quote => break,
                        Some((_, ch)) => s.push(ch),
                        None => return Err(SyntaxError::new("unterminated string literal", at)),
                    }
                }
                tokens.push((Token::Str(s), at));
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let eq = chars.next_if(|&(_, n)| n == '=').is_some();
                let op = match (c, eq) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::NotEq,
                    ('<', true) => CmpOp::Lte,
                    ('>', true) => CmpOp::Gte,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    ('=', false) => {
                        return Err(SyntaxError::new("assignment is not allowed; use '=='", at));
                    }
                    _ => return Err(SyntaxError::new("unexpected '!'; use 'not'", at)),
                };
                tokens.push((Token::Cmp(op), at));
            }
            _ if !after_dot
                && (c.is_ascii_digit()
                    || (c == '-' && input[at + 1..].starts_with(|n: char| n.is_ascii_digit()))) =>
            {
                let mut end = at + c.len_utf8();
                chars.next();
                let mut seen_dot = false;
                while let Some(&(i, nc)) = chars.peek() {
                    let fraction = nc == '.'
                        && !seen_dot
                        && input[i + 1..].starts_with(|d: char| d.is_ascii_digit());
                    if nc.is_ascii_digit() || fraction {
                        seen_dot |= fraction;
                        end = i + nc.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &input[at..end];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| SyntaxError::new(format!("invalid number '{text}'"), at))?;
                tokens.push((Token::Num(n), at));
            }
            _ if is_ident_char(c) => {
                let mut end = at;
                while let Some(&(i, wc)) = chars.peek() {
                    if is_ident_char(wc) {
                        end = i + wc.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &input[at..end];
                // A segment after '.' is always a key, even if it spells a keyword.
                let token = if after_dot {
                    Token::Ident(word.to_string())
                } else {
                    match word {
                        "true" | "True" => Token::True,
                        "false" | "False" => Token::False,
                        "null" | "None" => Token::Null,
                        _ if word.eq_ignore_ascii_case("and") => Token::And,
                        _ if word.eq_ignore_ascii_case("or") => Token::Or,
                        _ if word.eq_ignore_ascii_case("not") => Token::Not,
                        _ => Token::Ident(word.to_string()),
                    }
                };
                tokens.push((token, at));
            }
            _ => {
                return Err(SyntaxError::new(format!("unexpected character '{c}'"), at));
            }
        }
    }

    Ok(tokens)
}

// ─── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, at)| *at)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SyntaxError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {}", expected.describe())))
        }
    }

    fn unexpected(&self, what: &str) -> SyntaxError {
        let found = self
            .peek()
            .map_or_else(|| "end of input".to_string(), Token::describe);
        SyntaxError::new(format!("{what}, found {found}"), self.position())
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new(
                format!("expression nests deeper than {MAX_NESTING} levels"),
                self.position(),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut terms = vec![self.parse_not()?];
        while self.eat(&Token::And) {
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_not()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Token::LParen) {
            self.enter()?;
            let inner = self.parse_or()?;
            self.expect(&Token::RParen)?;
            self.leave();
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare { op, left, right });
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, SyntaxError> {
        let literal = match self.peek() {
            Some(Token::Str(s)) => Some(Literal::Str(s.clone())),
            Some(Token::Num(n)) => Some(Literal::Num(*n)),
            Some(Token::True) => Some(Literal::Bool(true)),
            Some(Token::False) => Some(Literal::Bool(false)),
            Some(Token::Null) => Some(Literal::Null),
            Some(Token::Ident(_)) => None,
            _ => return Err(self.unexpected("expected a value, path or function call")),
        };
        if let Some(literal) = literal {
            self.pos += 1;
            return Ok(Operand::Literal(literal));
        }
        self.parse_reference()
    }

    /// A dotted path, a call, or a chain of method calls on either.
    fn parse_reference(&mut self) -> Result<Operand, SyntaxError> {
        let mut segments = Vec::new();
        let mut name_at = self.position();
        segments.push(self.expect_ident()?);
        let mut receiver: Option<Operand> = None;

        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    let name = segments.pop().unwrap_or_default();
                    let mut args = self.parse_args()?;
                    let head = receiver
                        .take()
                        .or_else(|| (!segments.is_empty()).then(|| Operand::Path(std::mem::take(&mut segments))));
                    if let Some(head) = head {
                        args.insert(0, head);
                    }
                    receiver = Some(resolve_call(&name, name_at, args)?);
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    name_at = self.position();
                    segments.push(self.expect_ident()?);
                    if receiver.is_some() && self.peek() != Some(&Token::LParen) {
                        return Err(self.unexpected("expected '(' for a method call"));
                    }
                }
                _ => break,
            }
        }

        Ok(receiver.unwrap_or(Operand::Path(segments)))
    }

    fn parse_args(&mut self) -> Result<Vec<Operand>, SyntaxError> {
        self.expect(&Token::LParen)?;
        self.enter()?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_operand()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::RParen)?;
                break;
            }
        }
        self.leave();
        Ok(args)
    }

    fn expect_ident(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("expected an identifier")),
        }
    }
}

fn resolve_call(name: &str, at: usize, args: Vec<Operand>) -> Result<Operand, SyntaxError> {
    let func = Builtin::lookup(name)
        .ok_or_else(|| SyntaxError::new(format!("function '{name}' is not registered"), at))?;
    if args.len() != func.arity() {
        return Err(SyntaxError::new(
            format!(
                "function '{name}' expects {} argument(s), got {}",
                func.arity(),
                args.len()
            ),
            at,
        ));
    }
    Ok(Operand::Call { func, args })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> serde_json::Value {
        json!({
            "action_type": "file.delete",
            "parameters": {
                "path": "/etc/passwd",
                "amount": 1500,
                "recipients": ["a@x.io", "b@x.io"],
                "note": "contact 555-867-5309",
                "nothing": null
            },
            "agent": {"id": "bot", "trust_level": 0.5, "action_count": 3},
            "task": {"id": "t-1", "spent": 0.4}
        })
    }

    fn eval(source: &str) -> bool {
        compile(source).unwrap().evaluate(&ctx()).unwrap()
    }

    #[test]
    fn empty_source_always_holds() {
        assert!(compile("").unwrap().is_always());
        assert!(compile("   \n").unwrap().is_always());
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval("parameters.amount > 1000"));
        assert!(eval("parameters.amount >= 1500"));
        assert!(!eval("parameters.amount < 1000"));
        assert!(eval("agent.trust_level <= 0.5"));
        assert!(eval("task.spent == 0.4"));
        assert!(eval("parameters.amount > -1"));
    }

    #[test]
    fn boolean_connectives_and_groups() {
        assert!(eval("parameters.amount > 1000 and agent.trust_level < 0.8"));
        assert!(eval("parameters.amount < 10 or agent.id == 'bot'"));
        assert!(eval("not (parameters.amount < 10)"));
        assert!(eval("NOT parameters.amount < 10 AND action_type == \"file.delete\""));
        assert!(!eval("(parameters.amount > 1000 or false) and agent.id != 'bot'"));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // true or (false and false)
        assert!(eval("true or false and false"));
        // (true or false) and false would be false
        assert!(!eval("(true or false) and false"));
    }

    #[test]
    fn method_sugar_equals_function_call() {
        assert!(eval("parameters.path.startswith('/etc')"));
        assert!(eval("startswith(parameters.path, '/etc')"));
        assert!(eval("parameters.path.endswith('passwd')"));
        assert!(eval("parameters.recipients.contains('b@x.io')"));
        assert!(eval("parameters.path.lower().startswith('/etc')"));
    }

    #[test]
    fn builtins_are_callable() {
        assert!(eval("contains_pii(parameters)"));
        assert!(eval("is_sensitive_path(parameters.path)"));
        assert!(eval("len(parameters.recipients) == 2"));
        assert!(eval("upper(agent.id) == 'BOT'"));
        assert!(eval("exists(parameters.path) and not exists(parameters.missing)"));
    }

    #[test]
    fn presence_checks() {
        assert!(eval("parameters.missing == null"));
        assert!(eval("parameters.nothing == None"));
        assert!(eval("parameters.path != null"));
        assert!(!eval("parameters.missing > 5"));
        assert!(!eval("parameters.missing.deeper == 'x'"));
    }

    #[test]
    fn keyword_segments_after_dot_are_keys() {
        let ctx = json!({"parameters": {"not": 1, "or": 2}});
        let c = compile("parameters.not == 1 and parameters.or == 2").unwrap();
        assert!(c.evaluate(&ctx).unwrap());
    }

    #[test]
    fn string_escapes() {
        let ctx = json!({"parameters": {"q": "it's \"quoted\""}});
        let c = compile(r#"parameters.q == 'it\'s "quoted"'"#).unwrap();
        assert!(c.evaluate(&ctx).unwrap());
    }

    #[test]
    fn unregistered_functions_fail_to_compile() {
        for source in [
            "__import__('os')",
            "eval('1+1')",
            "parameters.path.system('rm')",
            "open(parameters.path)",
        ] {
            let err = compile(source).unwrap_err();
            assert!(err.message.contains("not registered"), "{source}: {err}");
        }
    }

    #[test]
    fn host_language_syntax_is_rejected() {
        assert!(compile("parameters.__class__.__bases__[0]").is_err());
        assert!(compile("lambda: 1").is_err());
        assert!(compile("x = 1").is_err());
        assert!(compile("a && b").is_err());
        assert!(compile("!exists(parameters.x)").is_err());
    }

    #[test]
    fn wrong_arity_fails_to_compile() {
        let err = compile("startswith(parameters.path)").unwrap_err();
        assert!(err.message.contains("expects 2"));
        assert!(compile("parameters.path.len('x')").is_err());
    }

    #[test]
    fn syntax_errors_carry_positions() {
        let err = compile("parameters.amount > ").unwrap_err();
        assert_eq!(err.position, 20);

        let err = compile("agent.id == 'bot' garbage").unwrap_err();
        assert_eq!(err.position, 18);

        let err = compile("agent.id == 'unterminated").unwrap_err();
        assert_eq!(err.position, 12);
        assert!(err.message.contains("unterminated"));

        let err = compile("(agent.id == 'bot'").unwrap_err();
        assert!(err.message.contains("')'"));
    }

    #[test]
    fn nesting_is_bounded() {
        let ok = format!("{}true{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(compile(&ok).is_ok());

        let deep = format!("{}true{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let err = compile(&deep).unwrap_err();
        assert!(err.message.contains("nests deeper"));

        let nots = format!("{}true", "not ".repeat(MAX_NESTING + 1));
        assert!(compile(&nots).is_err());
    }

    #[test]
    fn source_length_is_bounded() {
        let long = format!("agent.id == '{}'", "x".repeat(MAX_SOURCE_LEN));
        let err = compile(&long).unwrap_err();
        assert!(err.message.contains("longer than"));
    }

    #[test]
    fn unknown_root_surfaces_at_evaluation() {
        let c = compile("secrets.key == 1").unwrap();
        assert!(c.evaluate(&ctx()).is_err());
    }

    #[test]
    fn compiled_condition_keeps_source() {
        let c = compile("agent.id == 'bot'").unwrap();
        assert_eq!(c.source(), "agent.id == 'bot'");
    }
}
