//! Recursive-descent parser for the guest cell language.

use super::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `import name` - consumed by dependency inference, a no-op at eval
    Import(String),
    /// `name = expr`
    Assign(String, Expr),
    /// Bare expression; its value becomes the statement's value
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Var(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

pub fn parse(source: &str) -> Result<Vec<Stmt>, String> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn program(&mut self) -> Result<Vec<Stmt>, String> {
        let mut stmts = Vec::new();
        while self.pos < self.tokens.len() {
            if self.eat(&Token::Newline) {
                continue;
            }
            stmts.push(self.statement()?);
            if self.pos < self.tokens.len() && !self.eat(&Token::Newline) {
                return Err(format!("expected end of statement, found '{}'", self.current()));
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        if self.eat(&Token::Import) {
            match self.advance() {
                Some(Token::Ident(name)) => return Ok(Stmt::Import(name)),
                other => {
                    return Err(format!(
                        "expected package name after 'import', found '{}'",
                        display_opt(other)
                    ))
                }
            }
        }

        // Assignment needs two tokens of lookahead: ident '='
        if let (Some(Token::Ident(_)), Some(Token::Assign)) =
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => unreachable!(),
            };
            self.advance(); // '='
            let expr = self.expression()?;
            return Ok(Stmt::Assign(name, expr));
        }

        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, String> {
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        loop {
            let op = match self.tokens.get(self.pos) {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::LtEq) => BinOp::Le,
                Some(Token::GtEq) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.tokens.get(self.pos) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.tokens.get(self.pos) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::LParen) => {
                let expr = self.expression()?;
                if !self.eat(&Token::RParen) {
                    return Err(format!("expected ')', found '{}'", self.current()));
                }
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            return Err(format!(
                                "expected ',' or ')' in call to '{}', found '{}'",
                                name,
                                self.current()
                            ));
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(format!("unexpected token '{}'", display_opt(other))),
        }
    }

    fn current(&self) -> String {
        self.tokens
            .get(self.pos)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

fn display_opt(token: Option<Token>) -> String {
    token
        .map(|t| t.to_string())
        .unwrap_or_else(|| "end of input".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_and_trailing_expr() {
        let stmts = parse("x = 1 + 1\nx").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], Stmt::Assign(ref name, _) if name == "x"));
        assert_eq!(stmts[1], Stmt::Expr(Expr::Var("x".to_string())));
    }

    #[test]
    fn test_parse_precedence() {
        let stmts = parse("1 + 2 * 3").unwrap();
        match &stmts[0] {
            Stmt::Expr(Expr::Binary(left, BinOp::Add, right)) => {
                assert_eq!(**left, Expr::Num(1.0));
                assert!(matches!(**right, Expr::Binary(_, BinOp::Mul, _)));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_parenthesized() {
        let stmts = parse("(1 + 2) * 3").unwrap();
        match &stmts[0] {
            Stmt::Expr(Expr::Binary(left, BinOp::Mul, _)) => {
                assert!(matches!(**left, Expr::Binary(_, BinOp::Add, _)));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call_with_args() {
        let stmts = parse(r#"fetch("https://example.com", "POST", body)"#).unwrap();
        match &stmts[0] {
            Stmt::Expr(Expr::Call(name, args)) => {
                assert_eq!(name, "fetch");
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call_no_args() {
        let stmts = parse("raise_error()").unwrap();
        assert_eq!(
            stmts[0],
            Stmt::Expr(Expr::Call("raise_error".to_string(), vec![]))
        );
    }

    #[test]
    fn test_parse_import() {
        let stmts = parse("import plotting\nimport tables").unwrap();
        assert_eq!(stmts[0], Stmt::Import("plotting".to_string()));
        assert_eq!(stmts[1], Stmt::Import("tables".to_string()));
    }

    #[test]
    fn test_parse_unary_negation() {
        let stmts = parse("x = -3 + 1").unwrap();
        assert!(matches!(
            stmts[0],
            Stmt::Assign(_, Expr::Binary(_, BinOp::Add, _))
        ));
    }

    #[test]
    fn test_parse_error_reports_token() {
        let err = parse("x = ) + 1").unwrap_err();
        assert!(err.contains(")"), "error should name the token: {}", err);
    }

    #[test]
    fn test_comparison_is_non_associative_chain() {
        let stmts = parse("1 < 2 == true").unwrap();
        assert!(matches!(
            stmts[0],
            Stmt::Expr(Expr::Binary(_, BinOp::Eq, _))
        ));
    }
}
