//! Pratt parser producing the expression tree.

use serde_json::Value;

use super::lexer::{tokenize, Token};
use super::{number, ExprError};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Undefined,
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Nullish,
}

const TERNARY_BP: u8 = 1;
const UNARY_BP: u8 = 15;

fn infix_binding(token: &Token) -> Option<(BinaryOp, u8)> {
    let entry = match token {
        Token::Nullish => (BinaryOp::Nullish, 2),
        Token::Or => (BinaryOp::Or, 3),
        Token::And => (BinaryOp::And, 4),
        Token::Eq => (BinaryOp::Eq, 5),
        Token::Ne => (BinaryOp::Ne, 5),
        Token::StrictEq => (BinaryOp::StrictEq, 5),
        Token::StrictNe => (BinaryOp::StrictNe, 5),
        Token::Lt => (BinaryOp::Lt, 7),
        Token::Le => (BinaryOp::Le, 7),
        Token::Gt => (BinaryOp::Gt, 7),
        Token::Ge => (BinaryOp::Ge, 7),
        Token::Plus => (BinaryOp::Add, 9),
        Token::Minus => (BinaryOp::Sub, 9),
        Token::Star => (BinaryOp::Mul, 11),
        Token::Slash => (BinaryOp::Div, 11),
        Token::Percent => (BinaryOp::Rem, 11),
        _ => return None,
    };
    Some(entry)
}

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(syntax(token.describe(), "end of expression")),
    }
}

fn syntax(found: impl Into<String>, expected: &str) -> ExprError {
    ExprError::Syntax {
        found: found.into(),
        expected: expected.to_string(),
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax(token.describe(), what)),
            None => Err(syntax("end of expression", what)),
        }
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.prefix()?;

        loop {
            let Some(token) = self.peek() else { break };

            if *token == Token::Question {
                if min_bp > TERNARY_BP {
                    break;
                }
                self.pos += 1;
                let then = self.expression(0)?;
                self.expect(Token::Colon, "`:` in conditional")?;
                let otherwise = self.expression(TERNARY_BP)?;
                lhs = Expr::Ternary(Box::new(lhs), Box::new(then), Box::new(otherwise));
                continue;
            }

            let Some((op, bp)) = infix_binding(token) else { break };
            if bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let operand = self.expression(UNARY_BP)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat(&Token::Minus) {
            let operand = self.expression(UNARY_BP)?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        let primary = self.primary()?;
        self.postfix(primary)
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr, ExprError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    expr = match self.advance() {
                        Some(Token::Ident(name)) => Expr::Member(Box::new(expr), name),
                        Some(Token::Number(n)) => {
                            Expr::Index(Box::new(expr), Box::new(Expr::Literal(number(n))))
                        }
                        Some(token) => return Err(syntax(token.describe(), "property name")),
                        None => return Err(syntax("end of expression", "property name")),
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression(0)?;
                    self.expect(Token::RBracket, "`]`")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    let Expr::Ident(name) = expr else {
                        return Err(syntax("call on a computed value", "a function name"));
                    };
                    self.pos += 1;
                    let args = self.list(Token::RParen)?;
                    expr = Expr::Call(name, args);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn list(&mut self, close: Token) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression(0)?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(close, "`,` or closing bracket")?;
            return Ok(items);
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.advance() else {
            return Err(syntax("end of expression", "a value"));
        };
        Ok(match token {
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Undefined => Expr::Undefined,
            Token::Number(n) => Expr::Literal(number(n)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Ident(name) => Expr::Ident(name),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen, "`)`")?;
                inner
            }
            Token::LBracket => Expr::Array(self.list(Token::RBracket)?),
            Token::LBrace => self.object()?,
            other => return Err(syntax(other.describe(), "a value")),
        })
    }

    fn object(&mut self) -> Result<Expr, ExprError> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Object(entries));
        }
        loop {
            let key = match self.advance() {
                Some(Token::Ident(name)) | Some(Token::Str(name)) => name,
                Some(token) => return Err(syntax(token.describe(), "object key")),
                None => return Err(syntax("end of expression", "object key")),
            };
            self.expect(Token::Colon, "`:` after object key")?;
            entries.push((key, self.expression(0)?));
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RBrace, "`,` or `}`")?;
            return Ok(Expr::Object(entries));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.into()))
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a + b * 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                ident("a"),
                Box::new(Expr::Binary(BinaryOp::Mul, ident("b"), Box::new(Expr::Literal(json!(2))))),
            )
        );
    }

    #[test]
    fn test_ternary_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").unwrap();
        let Expr::Ternary(_, _, otherwise) = expr else { panic!("expected ternary") };
        assert!(matches!(*otherwise, Expr::Ternary(..)));
    }

    #[test]
    fn test_paths_and_calls() {
        assert_eq!(
            parse("user.tags[0]").unwrap(),
            Expr::Index(
                Box::new(Expr::Member(ident("user"), "tags".into())),
                Box::new(Expr::Literal(json!(0))),
            )
        );
        assert_eq!(
            parse("len(items)").unwrap(),
            Expr::Call("len".into(), vec![Expr::Ident("items".into())])
        );
    }

    #[test]
    fn test_method_calls_are_rejected() {
        assert!(parse("user.name()").is_err());
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        assert!(matches!(parse("a b"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn test_object_literal() {
        let expr = parse("{ method: 'GET', 'x-y': 1 }").unwrap();
        let Expr::Object(entries) = expr else { panic!("expected object") };
        assert_eq!(entries[0].0, "method");
        assert_eq!(entries[1].0, "x-y");
    }
}
