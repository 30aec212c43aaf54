//! Statement recognition for the in-memory backend.
//!
//! Only a fixed set of statement shapes is understood:
//! - `RETURN <expr> [AS alias], ...`
//! - `CREATE (v:Label {k: <expr>, ...}) [RETURN v]`
//! - `MATCH (v[:Label] [{k: <expr>, ...}]) RETURN v [AS alias]`
//! - `MATCH (v[:Label] [{...}]) RETURN count(v) [AS alias]`
//! - `MATCH (v[:Label] [{...}]) DETACH DELETE v`
//!
//! where `<expr>` is a `$parameter` or a literal. Keywords are case-insensitive.

use crate::models::{Params, QueryType, Value};
use std::collections::BTreeMap;

pub(crate) const SYNTAX_ERROR: &str = "Neo.ClientError.Statement.SyntaxError";
pub(crate) const PARAMETER_MISSING: &str = "Neo.ClientError.Statement.ParameterMissing";

/// A statement the backend rejected, with its server status code.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatementError {
    pub code: &'static str,
    pub message: String,
}

impl StatementError {
    fn syntax(message: impl Into<String>) -> Self {
        Self {
            code: SYNTAX_ERROR,
            message: message.into(),
        }
    }
}

type ParseResult<T> = Result<T, StatementError>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Param(String),
    Literal(Value),
}

impl Expr {
    pub fn eval(&self, params: &Params) -> ParseResult<Value> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Param(name) => params.get(name).cloned().ok_or_else(|| StatementError {
                code: PARAMETER_MISSING,
                message: format!("Expected parameter(s): {name}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Projection {
    pub expr: Expr,
    pub alias: String,
}

/// Node pattern `(var:Label {k: expr})`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pattern {
    pub var: String,
    pub label: Option<String>,
    pub props: Vec<(String, Expr)>,
}

impl Pattern {
    /// Resolve property expressions against the parameters.
    pub fn eval_props(&self, params: &Params) -> ParseResult<BTreeMap<String, Value>> {
        self.props
            .iter()
            .map(|(key, expr)| Ok((key.clone(), expr.eval(params)?)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MatchAction {
    ReturnNode { alias: String },
    Count { alias: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Return(Vec<Projection>),
    Create {
        pattern: Pattern,
        returns: Option<String>,
    },
    Match {
        pattern: Pattern,
        action: MatchAction,
    },
}

impl Statement {
    pub fn parse(text: &str) -> ParseResult<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let statement = parser.statement()?;
        parser.finish()?;
        Ok(statement)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create { .. }
                | Self::Match {
                    action: MatchAction::Delete,
                    ..
                }
        )
    }

    pub fn query_type(&self) -> QueryType {
        match self {
            Self::Return(_) => QueryType::ReadOnly,
            Self::Create { returns: None, .. } => QueryType::WriteOnly,
            Self::Create { .. } => QueryType::ReadWrite,
            Self::Match {
                action: MatchAction::Delete,
                ..
            } => QueryType::ReadWrite,
            Self::Match { .. } => QueryType::ReadOnly,
        }
    }

    /// Aliases of the returned columns.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Return(projections) => projections.iter().map(|p| p.alias.clone()).collect(),
            Self::Create {
                returns: Some(alias),
                ..
            } => vec![alias.clone()],
            Self::Create { returns: None, .. } => Vec::new(),
            Self::Match { action, .. } => match action {
                MatchAction::ReturnNode { alias } | MatchAction::Count { alias } => {
                    vec![alias.clone()]
                }
                MatchAction::Delete => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Param(String),
    Str(String),
    Int(i64),
    Float(f64),
    Punct(char),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => s.clone(),
            Self::Param(s) => format!("${s}"),
            Self::Str(s) => format!("'{s}'"),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Punct(c) => c.to_string(),
        }
    }
}

fn tokenize(text: &str) -> ParseResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    ident.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else if c == '$' {
            chars.next();
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                return Err(StatementError::syntax("Expected a parameter name after '$'"));
            }
            tokens.push(Token::Param(name));
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut literal = String::new();
            let mut terminated = false;
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            literal.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                    }
                    ch if ch == c => {
                        terminated = true;
                        break;
                    }
                    ch => literal.push(ch),
                }
            }
            if !terminated {
                return Err(StatementError::syntax("Unterminated string literal"));
            }
            tokens.push(Token::Str(literal));
        } else if c.is_ascii_digit() || c == '-' {
            let mut number = String::new();
            number.push(c);
            chars.next();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() || c == '.' {
                    number.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(parse_number(&number)?);
        } else if "(){}:,;*".contains(c) {
            tokens.push(Token::Punct(c));
            chars.next();
        } else {
            return Err(StatementError::syntax(format!("Invalid input '{c}'")));
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> ParseResult<Token> {
    if text.contains('.') {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| StatementError::syntax(format!("Invalid number '{text}'")))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| StatementError::syntax(format!("Invalid number '{text}'")))
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> StatementError {
        match self.peek() {
            Some(token) => StatementError::syntax(format!(
                "Invalid input '{}': expected {expected}",
                token.describe()
            )),
            None => StatementError::syntax(format!("Unexpected end of input: expected {expected}")),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn punct(&mut self, c: char) -> ParseResult<()> {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{c}'")))
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn finish(&mut self) -> ParseResult<()> {
        self.eat_punct(';');
        if self.peek().is_some() {
            return Err(self.unexpected("end of input"));
        }
        Ok(())
    }

    fn statement(&mut self) -> ParseResult<Statement> {
        if self.peek_keyword("RETURN") {
            self.pos += 1;
            self.projections().map(Statement::Return)
        } else if self.peek_keyword("CREATE") {
            self.pos += 1;
            let pattern = self.pattern(true)?;
            let returns = if self.peek_keyword("RETURN") {
                self.pos += 1;
                let var = self.ident()?;
                if var != pattern.var {
                    return Err(StatementError::syntax(format!("Variable `{var}` not defined")));
                }
                Some(self.alias_or(var)?)
            } else {
                None
            };
            Ok(Statement::Create { pattern, returns })
        } else if self.peek_keyword("MATCH") {
            self.pos += 1;
            let pattern = self.pattern(false)?;
            let action = self.match_action(&pattern.var)?;
            Ok(Statement::Match { pattern, action })
        } else {
            Err(self.unexpected("RETURN, CREATE or MATCH"))
        }
    }

    fn match_action(&mut self, var: &str) -> ParseResult<MatchAction> {
        if self.peek_keyword("DETACH") {
            self.pos += 1;
            self.keyword("DELETE")?;
            self.expect_var(var)?;
            return Ok(MatchAction::Delete);
        }

        self.keyword("RETURN")?;
        if self.peek_keyword("count") {
            self.pos += 1;
            self.punct('(')?;
            if !self.eat_punct('*') {
                self.expect_var(var)?;
            }
            self.punct(')')?;
            let alias = self.alias_or(format!("count({var})"))?;
            return Ok(MatchAction::Count { alias });
        }

        self.expect_var(var)?;
        let alias = self.alias_or(var.to_string())?;
        Ok(MatchAction::ReturnNode { alias })
    }

    fn expect_var(&mut self, var: &str) -> ParseResult<()> {
        let found = self.ident()?;
        if found != var {
            return Err(StatementError::syntax(format!("Variable `{found}` not defined")));
        }
        Ok(())
    }

    fn alias_or(&mut self, default: String) -> ParseResult<String> {
        if self.peek_keyword("AS") {
            self.pos += 1;
            self.ident()
        } else {
            Ok(default)
        }
    }

    fn projections(&mut self) -> ParseResult<Vec<Projection>> {
        let mut projections = Vec::new();
        loop {
            let (expr, text) = self.expr()?;
            let alias = self.alias_or(text)?;
            if projections.iter().any(|p: &Projection| p.alias == alias) {
                return Err(StatementError::syntax(format!(
                    "Multiple result columns with the same name '{alias}'"
                )));
            }
            projections.push(Projection { expr, alias });
            if !self.eat_punct(',') {
                return Ok(projections);
            }
        }
    }

    /// An expression and its source text, used as the default column name.
    fn expr(&mut self) -> ParseResult<(Expr, String)> {
        let token = self
            .next()
            .ok_or_else(|| StatementError::syntax("Unexpected end of input: expected an expression"))?;
        let text = token.describe();
        let expr = match token {
            Token::Param(name) => Expr::Param(name),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Int(i) => Expr::Literal(Value::Int(i)),
            Token::Float(f) => Expr::Literal(Value::Float(f)),
            Token::Ident(s) if s.eq_ignore_ascii_case("true") => Expr::Literal(Value::Bool(true)),
            Token::Ident(s) if s.eq_ignore_ascii_case("false") => Expr::Literal(Value::Bool(false)),
            Token::Ident(s) if s.eq_ignore_ascii_case("null") => Expr::Literal(Value::Null),
            Token::Ident(s) => {
                return Err(StatementError::syntax(format!("Variable `{s}` not defined")));
            }
            Token::Punct(c) => {
                return Err(StatementError::syntax(format!(
                    "Invalid input '{c}': expected an expression"
                )));
            }
        };
        Ok((expr, text))
    }

    fn pattern(&mut self, require_label: bool) -> ParseResult<Pattern> {
        self.punct('(')?;
        let var = self.ident()?;
        let label = if self.eat_punct(':') {
            Some(self.ident()?)
        } else if require_label {
            return Err(self.unexpected("a label"));
        } else {
            None
        };

        let mut props = Vec::new();
        if self.eat_punct('{') && !self.eat_punct('}') {
            loop {
                let key = self.ident()?;
                self.punct(':')?;
                let (expr, _) = self.expr()?;
                props.push((key, expr));
                if self.eat_punct('}') {
                    break;
                }
                self.punct(',')?;
            }
        }
        self.punct(')')?;

        Ok(Pattern { var, label, props })
    }
}
