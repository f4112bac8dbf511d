use super::lexer::{Spanned, Token};
use super::{ErrorKind, ExecError, MAX_NESTING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    None,
    Var(String),
    List(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign(String, Expr),
    AssignIndex(String, Expr, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    For(String, Expr, Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

/// Recursive-descent parser over the token stream.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0, depth: 0 }
    }

    pub fn parse_program(mut self) -> Result<Vec<Stmt>, ExecError> {
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.check(&Token::Eof) {
            stmts.push(self.statement()?);
            self.end_of_statement()?;
        }
        Ok(stmts)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: String) -> ExecError {
        ExecError::at(ErrorKind::Syntax, self.line(), message)
    }

    fn deepen(&mut self) -> Result<(), ExecError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting too deep (more than {} levels)", MAX_NESTING)));
        }
        self.depth += 1;
        Ok(())
    }

    /// Runs `rule` one nesting level deeper, refusing past [`MAX_NESTING`].
    fn nested<T>(&mut self, rule: impl FnOnce(&mut Self) -> Result<T, ExecError>) -> Result<T, ExecError> {
        self.deepen()?;
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn expect(&mut self, token: &Token, context: &str) -> Result<(), ExecError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {} {}, found {}",
                token.describe(),
                context,
                self.peek().describe()
            )))
        }
    }

    fn skip_separators(&mut self) {
        while self.eat(&Token::Separator) {}
    }

    fn end_of_statement(&mut self) -> Result<(), ExecError> {
        match self.peek() {
            Token::Separator => {
                self.skip_separators();
                Ok(())
            }
            Token::Eof | Token::RBrace => Ok(()),
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ExecError> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::If => self.if_statement()?,
            Token::For => {
                self.advance();
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    other => {
                        return Err(self.error(format!(
                            "expected a loop variable after 'for', found {}",
                            other.describe()
                        )))
                    }
                };
                self.expect(&Token::In, "after the loop variable")?;
                let iterable = self.expression()?;
                let body = self.block()?;
                StmtKind::For(name, iterable, body)
            }
            Token::Ident(name) if self.peek_at(1) == &Token::Assign => {
                self.advance();
                self.advance();
                StmtKind::Assign(name, self.expression()?)
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Token::Assign) {
                    match expr {
                        Expr::Index(target, index) => match *target {
                            Expr::Var(name) => StmtKind::AssignIndex(name, *index, self.expression()?),
                            _ => return Err(self.error("can only assign to an element of a named list".to_string())),
                        },
                        _ => return Err(self.error("cannot assign to this expression".to_string())),
                    }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { line, kind })
    }

    fn if_statement(&mut self) -> Result<StmtKind, ExecError> {
        self.expect(&Token::If, "")?;
        let condition = self.expression()?;
        let then_branch = self.block()?;

        // `else` may sit on the line after the closing brace.
        let save = self.pos;
        self.skip_separators();
        let else_branch = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                let line = self.line();
                vec![Stmt { line, kind: self.nested(Self::if_statement)? }]
            } else {
                self.block()?
            }
        } else {
            self.pos = save;
            Vec::new()
        };
        Ok(StmtKind::If(condition, then_branch, else_branch))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExecError> {
        self.nested(Self::block_body)
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>, ExecError> {
        self.expect(&Token::LBrace, "to open a block")?;
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.check(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.error("unclosed block, expected '}'".to_string()));
            }
            stmts.push(self.statement()?);
            self.end_of_statement()?;
        }
        self.advance();
        Ok(stmts)
    }

    pub fn expression(&mut self) -> Result<Expr, ExecError> {
        self.nested(Self::or_expr)
    }

    // Each operator in a left-associative chain adds a level to the tree, so
    // chains count against the nesting cap too.
    fn or_expr(&mut self) -> Result<Expr, ExecError> {
        let outer = self.depth;
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            self.deepen()?;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExecError> {
        let outer = self.depth;
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            self.deepen()?;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExecError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.nested(Self::not_expr)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExecError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Token::EqEq => BinOp::Eq,
            Token::NotEq => BinOp::NotEq,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, ExecError> {
        let outer = self.depth;
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExecError> {
        let outer = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExecError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(&Token::Plus) {
            return self.nested(Self::unary);
        }
        self.power()
    }

    // `**` binds tighter than unary minus on its left and is right-associative.
    fn power(&mut self) -> Result<Expr, ExecError> {
        let base = self.postfix()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.nested(Self::unary)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ExecError> {
        let outer = self.depth;
        let mut expr = self.primary()?;
        while self.eat(&Token::LBracket) {
            self.deepen()?;
            let index = self.expression()?;
            self.expect(&Token::RBracket, "to close the index")?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        self.depth = outer;
        if self.check(&Token::LParen) {
            return Err(self.error("only builtin functions can be called".to_string()));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExecError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::None => Ok(Expr::None),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.sequence(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(&Token::RParen, "to close the parenthesis")?;
                Ok(expr)
            }
            Token::LBracket => Ok(Expr::List(self.sequence(&Token::RBracket)?)),
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }

    /// Comma-separated expressions up to `close`, allowing a trailing comma.
    fn sequence(&mut self, close: &Token) -> Result<Vec<Expr>, ExecError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(close, "after the last item")?;
                break;
            }
        }
        Ok(items)
    }
}

/// Tokenizes and parses a whole program.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ExecError> {
    let tokens = super::lexer::tokenize(source)?;
    Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expr {
        match parse(source).unwrap().remove(0).kind {
            StmtKind::Expr(e) => e,
            other => panic!("expected an expression, got {:?}", other),
        }
    }

    #[test]
    fn precedence_matches_arithmetic() {
        assert_eq!(
            expr("1 + 2 * 3"),
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(BinOp::Mul, Box::new(Expr::Number(2.0)), Box::new(Expr::Number(3.0))))
            )
        );
        // -2 ** 2 is -(2 ** 2)
        assert!(matches!(expr("-2 ** 2"), Expr::Neg(_)));
    }

    #[test]
    fn blocks_and_else_on_next_line() {
        let program = parse("if x > 1 {\n  y = 1\n}\nelse {\n  y = 2\n}\nprint(y)").unwrap();
        assert_eq!(program.len(), 2);
        match &program[0].kind {
            StmtKind::If(_, then_branch, else_branch) => {
                assert_eq!(then_branch.len(), 1);
                assert_eq!(else_branch[0].line, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn for_loops_and_index_assignment() {
        let program = parse("for i in range(3) { xs[i] = i; total = total + i }").unwrap();
        match &program[0].kind {
            StmtKind::For(name, _, body) => {
                assert_eq!(name, "i");
                assert!(matches!(body[0].kind, StmtKind::AssignIndex(..)));
                assert!(matches!(body[1].kind, StmtKind::Assign(..)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let err = parse("x = 1\ny = (2 + \n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert_eq!(err.trace, vec![2]);

        let err = parse("print('hello'").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(parse("1 +").is_err());
        assert!(parse("x = = 2").is_err());
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let shallow = format!("x = {}1{}", "(".repeat(MAX_NESTING - 2), ")".repeat(MAX_NESTING - 2));
        assert!(parse(&shallow).is_ok());
        let sum = format!("x = 1{}", " + 1".repeat(40));
        assert!(parse(&sum).is_ok());

        for source in [
            format!("x = {}1{}", "(".repeat(10_000), ")".repeat(10_000)),
            format!("x = {}1{}", "[".repeat(10_000), "]".repeat(10_000)),
            format!("x = {}1", "-".repeat(10_000)),
            format!("x = {}true", "not ".repeat(10_000)),
            format!("{}{}", "if true { ".repeat(10_000), "}".repeat(10_000)),
            format!("if false {{ x = 0 }}{} else {{ x = 1 }}", " else if false { x = 0 }".repeat(10_000)),
            format!("x = 1{}", " + 1".repeat(10_000)),
            format!("x = 2{}", " * 2".repeat(10_000)),
            format!("x = true{}", " or false".repeat(10_000)),
            format!("x = xs{}", "[0]".repeat(10_000)),
        ] {
            let err = parse(&source).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Syntax);
            assert!(err.message.starts_with("nesting too deep"), "{}", err.message);
        }
    }
}
