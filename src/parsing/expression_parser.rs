use crate::core::Scalar;
use crate::expression::{BinaryOp, Expr};
use crate::parsing::ParseError;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(String),
}

/// Recursive-descent parser for join expressions.
///
/// Precedence from loosest to tightest: comparisons (`= == != <> < <= > >=`),
/// additive (`+ - ||`), multiplicative (`* / %`), unary minus, then literals,
/// field references and parentheses. `=` is accepted as equality.
pub struct ExpressionParser {
    token_regex: Regex,
}

impl ExpressionParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(ExpressionParser {
            token_regex: Regex::new(
                r"^\s*(?:(?P<float>\d+\.\d*(?:[eE][+-]?\d+)?|\d+[eE][+-]?\d+)|(?P<int>\d+)|(?P<str>'(?:[^']|'')*')|(?P<ident>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)|(?P<op>\|\||==|!=|<>|<=|>=|[=<>+\-*/%()]))",
            )?,
        })
    }

    pub fn parse(&self, input: &str) -> Result<Expr, String> {
        let tokens = self.tokenize(input)?;
        let mut cursor = Cursor { tokens: &tokens, pos: 0 };
        let expr = cursor.comparison()?;
        match cursor.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {:?} after expression", token)),
        }
    }

    fn tokenize(&self, input: &str) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        let mut pos = 0;

        while !input[pos..].trim().is_empty() {
            let captures = self
                .token_regex
                .captures(&input[pos..])
                .ok_or_else(|| format!("unexpected character at offset {}", pos))?;

            let token = if let Some(m) = captures.name("float") {
                Token::Float(m.as_str().parse().map_err(|_| format!("bad number {}", m.as_str()))?)
            } else if let Some(m) = captures.name("int") {
                Token::Int(
                    m.as_str().parse().map_err(|_| format!("integer {} out of range", m.as_str()))?,
                )
            } else if let Some(m) = captures.name("str") {
                let raw = m.as_str();
                Token::Str(raw[1..raw.len() - 1].replace("''", "'"))
            } else if let Some(m) = captures.name("ident") {
                Token::Ident(m.as_str().to_string())
            } else if let Some(m) = captures.name("op") {
                Token::Op(m.as_str().to_string())
            } else {
                return Err(format!("unexpected character at offset {}", pos));
            };

            tokens.push(token);
            pos += captures.get(0).map_or(0, |m| m.end());
        }

        Ok(tokens)
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    /// Consume the next token if it is one of `ops`.
    fn take_op(&mut self, ops: &[&str]) -> Option<String> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(&op.as_str()) => {
                self.pos += 1;
                Some(op.clone())
            }
            _ => None,
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;
        let Some(op) = self.take_op(&["=", "==", "!=", "<>", "<", "<=", ">", ">="]) else {
            return Ok(left);
        };
        let op = match op.as_str() {
            "=" | "==" => BinaryOp::Eq,
            "!=" | "<>" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            _ => BinaryOp::Ge,
        };
        let right = self.additive()?;
        Ok(Expr::binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut expr = self.multiplicative()?;
        while let Some(op) = self.take_op(&["+", "-", "||"]) {
            let op = match op.as_str() {
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                _ => BinaryOp::Concat,
            };
            let rhs = self.multiplicative()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut expr = self.unary()?;
        while let Some(op) = self.take_op(&["*", "/", "%"]) {
            let op = match op.as_str() {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            let rhs = self.unary()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.take_op(&["-"]).is_some() {
            // Fold negative numeric literals so `-3` stays a literal.
            return Ok(match self.unary()? {
                Expr::Literal(Scalar::Int(v)) => Expr::Literal(Scalar::Int(-v)),
                Expr::Literal(Scalar::Float(v)) => Expr::Literal(Scalar::Float(-v)),
                inner => Expr::Negate(Box::new(inner)),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::literal(*v)),
            Some(Token::Float(v)) => Ok(Expr::literal(*v)),
            Some(Token::Str(v)) => Ok(Expr::literal(v.as_str())),
            Some(Token::Ident(name)) if name.eq_ignore_ascii_case("true") => Ok(Expr::literal(true)),
            Some(Token::Ident(name)) if name.eq_ignore_ascii_case("false") => {
                Ok(Expr::literal(false))
            }
            Some(Token::Ident(name)) => Ok(match name.split_once('.') {
                Some((stream, field)) => Expr::qualified(stream, field),
                None => Expr::field(name),
            }),
            Some(Token::Op(op)) if op == "(" => {
                let inner = self.comparison()?;
                match self.next() {
                    Some(Token::Op(close)) if close == ")" => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected {:?}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Parse a standalone expression, e.g. `Speed.time_to - 10`.
pub fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    ExpressionParser::new()?
        .parse(input)
        .map_err(|message| ParseError::Expression { input: input.to_string(), message })
}
