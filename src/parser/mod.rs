//! Recursive-descent parser producing the Flap AST

mod ast;

pub use ast::{
    BinaryOp, ChannelOpKind, Expr, Import, LambdaBody, MatchArm, Program, Stmt, UnaryOp,
    WorkerCount,
};

use crate::error::{Error, Result};
use crate::lexer::{SrcPos, Token, TokenKind};
use std::collections::HashSet;

/// Parser over a scanned token stream
pub struct Parser {
    /// Source file name for diagnostics
    file: String,
    /// Token stream, ending in `Eof`
    tokens: Vec<Token>,
    /// Index of the next unconsumed token
    current: usize,
    /// Aliases declared by `import`, for member-reference resolution
    import_aliases: HashSet<String>,
}

impl Parser {
    /// Create a parser over scanned tokens
    pub fn new(file: &str, tokens: Vec<Token>) -> Self {
        Parser {
            file: file.to_string(),
            tokens,
            current: 0,
            import_aliases: HashSet::new(),
        }
    }

    /// Parse a complete program
    pub fn parse(&mut self) -> Result<Program> {
        let mut imports = Vec::new();
        let mut statements = Vec::new();

        self.skip_newlines();
        while !self.check(&TokenKind::Eof) {
            if self.check(&TokenKind::Import) {
                let imp = self.import_decl()?;
                self.import_aliases.insert(imp.alias.clone());
                imports.push(imp);
            } else {
                statements.push(self.statement()?);
            }
            self.expect_terminator()?;
            self.skip_newlines();
        }

        Ok(Program {
            file: self.file.clone(),
            imports,
            statements,
        })
    }

    fn import_decl(&mut self) -> Result<Import> {
        let pos = self.peek_pos();
        self.advance(); // `import`
        let alias = self.expect_ident("import alias")?;
        let lib_kind = self.advance().kind.clone();
        let library = match lib_kind {
            TokenKind::Str(s) => s,
            _ => return Err(self.err_here("expected library name string after import alias")),
        };
        Ok(Import {
            alias,
            library,
            pos,
        })
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn statement(&mut self) -> Result<Stmt> {
        let pos = self.peek_pos();
        match self.peek_kind().clone() {
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break { pos })
            }
            TokenKind::Continue => {
                self.advance();
                Ok(Stmt::Continue { pos })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check_terminator() {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return { value, pos })
            }
            TokenKind::Defer => {
                self.advance();
                let body = self.block()?;
                Ok(Stmt::Defer { body, pos })
            }
            TokenKind::Arena => {
                self.advance();
                let body = self.block()?;
                Ok(Stmt::Arena { body, pos })
            }
            TokenKind::Unsafe => {
                self.advance();
                let body = self.block()?;
                Ok(Stmt::Unsafe { body, pos })
            }
            TokenKind::At => {
                self.advance();
                self.range_loop(pos)
            }
            TokenKind::AtAt => {
                self.advance();
                self.parallel_loop(WorkerCount::Auto, pos)
            }
            TokenKind::Ident(_) if self.peek_next_is(&TokenKind::Assign) => {
                let name = self.expect_ident("binding name")?;
                self.advance(); // `=`
                let value = self.expression()?;
                Ok(Stmt::Assign { name, value, pos })
            }
            _ => {
                let expr = self.expression()?;
                match self.peek_kind().clone() {
                    // `n @ i in lo..<hi { … }`
                    TokenKind::At => {
                        self.advance();
                        self.parallel_loop(WorkerCount::Count(expr), pos)
                    }
                    // `cond -> stmt`
                    TokenKind::Arrow => {
                        let arrow_pos = self.peek_pos();
                        self.advance();
                        let body = Box::new(self.statement()?);
                        Ok(Stmt::Guarded {
                            cond: expr,
                            body,
                            pos: arrow_pos,
                        })
                    }
                    // `l[i] <- x`
                    TokenKind::StoreArrow => {
                        let store_pos = self.peek_pos();
                        self.advance();
                        let value = self.expression()?;
                        match expr {
                            Expr::Index { target, index, .. } => Ok(Stmt::IndexAssign {
                                target: *target,
                                index: *index,
                                value,
                                pos: store_pos,
                            }),
                            _ => Err(self.err_at(store_pos, "`<-` requires an indexed target")),
                        }
                    }
                    _ => Ok(Stmt::Expr(expr)),
                }
            }
        }
    }

    fn range_loop(&mut self, pos: SrcPos) -> Result<Stmt> {
        let (var, start, end, inclusive) = self.loop_header()?;
        let body = self.block()?;
        Ok(Stmt::RangeLoop {
            var,
            start,
            end,
            inclusive,
            body,
            pos,
        })
    }

    fn parallel_loop(&mut self, workers: WorkerCount, pos: SrcPos) -> Result<Stmt> {
        let (var, start, end, inclusive) = self.loop_header()?;
        let body = self.block()?;
        Ok(Stmt::ParallelLoop {
            var,
            start,
            end,
            inclusive,
            workers,
            body,
            pos,
        })
    }

    fn loop_header(&mut self) -> Result<(String, Expr, Expr, bool)> {
        let var = self.expect_ident("loop variable")?;
        self.expect(&TokenKind::In, "`in`")?;
        let start = self.expression()?;
        let range_kind = self.advance().kind.clone();
        let inclusive = match range_kind {
            TokenKind::RangeExclusive => false,
            TokenKind::RangeInclusive => true,
            _ => return Err(self.err_here("expected `..<` or `..` in loop range")),
        };
        let end = self.expression()?;
        Ok((var, start, end, inclusive))
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&TokenKind::LeftBrace, "`{`")?;
        let mut body = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(Error::UnexpectedEof);
            }
            body.push(self.statement()?);
            if !self.check(&TokenKind::RightBrace) {
                self.expect_terminator()?;
            }
            self.skip_newlines();
        }
        self.advance(); // `}`
        Ok(body)
    }

    // ---------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ---------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr> {
        self.or_else()
    }

    fn or_else(&mut self) -> Result<Expr> {
        let mut expr = self.logic_or()?;
        while self.check(&TokenKind::OrBang) {
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.logic_or()?;
            expr = Expr::Binary {
                op: BinaryOp::OrElse,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn logic_or(&mut self) -> Result<Expr> {
        let mut expr = self.logic_and()?;
        while self.check(&TokenKind::Or) {
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.logic_and()?;
            expr = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> Result<Expr> {
        let mut expr = self.equality()?;
        while self.check(&TokenKind::And) {
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.equality()?;
            expr = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqualEqual => BinaryOp::Eq,
                TokenKind::BangEqual => BinaryOp::Ne,
                _ => break,
            };
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.comparison()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                _ => break,
            };
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.term()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.factor()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let pos = self.peek_pos();
            self.advance();
            let rhs = self.unary()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr> {
        let pos = self.peek_pos();
        match self.peek_kind().clone() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                    pos,
                })
            }
            TokenKind::Not => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                    pos,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind().clone() {
                TokenKind::LeftParen => {
                    let pos = self.peek_pos();
                    self.advance();
                    let args = self.call_args()?;
                    expr = self.make_call(expr, args, pos)?;
                }
                TokenKind::LeftBracket => {
                    let pos = self.peek_pos();
                    self.advance();
                    self.skip_newlines();
                    let index = self.expression()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::RightBracket, "`]`")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        pos,
                    };
                }
                TokenKind::Dot => {
                    let pos = self.peek_pos();
                    self.advance();
                    let name = self.expect_ident("member name")?;
                    if name == "error" {
                        expr = Expr::ErrorCode {
                            value: Box::new(expr),
                            pos,
                        };
                    } else if let Expr::Ident { name: obj, .. } = &expr {
                        if self.import_aliases.contains(obj) {
                            expr = Expr::Member {
                                object: obj.clone(),
                                name,
                                pos,
                            };
                        } else {
                            return Err(self.err_at(
                                pos,
                                format!("`{obj}` is not an import alias; only `.error` and imported members are supported"),
                            ));
                        }
                    } else {
                        return Err(self.err_at(pos, "only `.error` is supported here"));
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn make_call(&mut self, callee: Expr, args: Vec<Expr>, pos: SrcPos) -> Result<Expr> {
        if let Expr::Ident { name, .. } = &callee {
            let chan_op = match name.as_str() {
                "channel" => Some(ChannelOpKind::Create),
                "send" => Some(ChannelOpKind::Send),
                "recv" => Some(ChannelOpKind::Recv),
                "close" => Some(ChannelOpKind::Close),
                _ => None,
            };
            if let Some(op) = chan_op {
                return Ok(Expr::ChannelOp { op, args, pos });
            }
        }
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            pos,
        })
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                self.skip_newlines();
                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
                self.skip_newlines();
            }
        }
        self.expect(&TokenKind::RightParen, "`)`")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.peek_pos();
        match self.peek_kind().clone() {
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expr::Number { value, pos })
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str { value, pos })
            }
            TokenKind::Ident(name) => {
                self.advance();
                // `x => body` is a single-parameter lambda
                if self.check(&TokenKind::FatArrow) {
                    let arrow_pos = self.peek_pos();
                    self.advance();
                    let body = self.lambda_body()?;
                    return Ok(Expr::Lambda {
                        params: vec![name],
                        body,
                        pos: arrow_pos,
                    });
                }
                Ok(Expr::Ident { name, pos })
            }
            TokenKind::LeftParen => {
                if let Some(params) = self.try_lambda_params() {
                    let arrow_pos = self.peek_pos();
                    self.advance(); // `=>`
                    let body = self.lambda_body()?;
                    return Ok(Expr::Lambda {
                        params,
                        body,
                        pos: arrow_pos,
                    });
                }
                self.advance(); // `(`
                self.skip_newlines();
                let expr = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => self.collection_literal(pos),
            TokenKind::LeftBrace => self.match_block(pos),
            _ => Err(self.err_here(format!(
                "expected an expression, got `{}`",
                self.peek().lexeme
            ))),
        }
    }

    /// Look ahead for `( ident, … ) =>`; consumes through `)` on success,
    /// leaves the stream untouched otherwise.
    fn try_lambda_params(&mut self) -> Option<Vec<String>> {
        let save = self.current;
        self.advance(); // `(`
        let mut params = Vec::new();
        loop {
            match self.peek_kind().clone() {
                TokenKind::RightParen => {
                    self.advance();
                    break;
                }
                TokenKind::Ident(name) => {
                    self.advance();
                    params.push(name);
                    match self.peek_kind().clone() {
                        TokenKind::Comma => {
                            self.advance();
                        }
                        TokenKind::RightParen => {
                            self.advance();
                            break;
                        }
                        _ => {
                            self.current = save;
                            return None;
                        }
                    }
                }
                _ => {
                    self.current = save;
                    return None;
                }
            }
        }
        if self.check(&TokenKind::FatArrow) {
            Some(params)
        } else {
            self.current = save;
            None
        }
    }

    fn lambda_body(&mut self) -> Result<LambdaBody> {
        if self.check(&TokenKind::LeftBrace) {
            // `{ | …` opens a match block, not a statement block
            if self.brace_opens_match() {
                let pos = self.peek_pos();
                let m = self.match_block(pos)?;
                return Ok(LambdaBody::Expr(Box::new(m)));
            }
            let body = self.block()?;
            return Ok(LambdaBody::Block(body));
        }
        let expr = self.expression()?;
        Ok(LambdaBody::Expr(Box::new(expr)))
    }

    fn brace_opens_match(&self) -> bool {
        let mut i = self.current + 1;
        while let Some(tok) = self.tokens.get(i) {
            match tok.kind {
                TokenKind::Newline => i += 1,
                TokenKind::Pipe | TokenKind::DefaultArrow => return true,
                _ => return false,
            }
        }
        false
    }

    fn match_block(&mut self, pos: SrcPos) -> Result<Expr> {
        if !self.brace_opens_match() {
            return Err(self.err_here("expected `|` or `~>` inside match block"));
        }
        self.advance(); // `{`
        let mut arms = Vec::new();
        let mut default = None;
        self.skip_newlines();
        loop {
            match self.peek_kind().clone() {
                TokenKind::Pipe => {
                    let arm_pos = self.peek_pos();
                    self.advance();
                    let guard = self.expression()?;
                    self.expect(&TokenKind::Arrow, "`->`")?;
                    let value = self.expression()?;
                    arms.push(MatchArm {
                        guard,
                        value,
                        pos: arm_pos,
                    });
                }
                TokenKind::DefaultArrow => {
                    self.advance();
                    default = Some(Box::new(self.expression()?));
                }
                TokenKind::RightBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => return Err(Error::UnexpectedEof),
                _ => return Err(self.err_here("expected `|`, `~>`, or `}` in match block")),
            }
            self.skip_newlines();
        }
        Ok(Expr::Match { arms, default, pos })
    }

    fn collection_literal(&mut self, pos: SrcPos) -> Result<Expr> {
        self.advance(); // `[`
        self.skip_newlines();

        // `[:]` is the empty map
        if self.check(&TokenKind::Colon) {
            self.advance();
            self.skip_newlines();
            self.expect(&TokenKind::RightBracket, "`]`")?;
            return Ok(Expr::Map {
                entries: Vec::new(),
                pos,
            });
        }
        // `[]` is the empty list
        if self.check(&TokenKind::RightBracket) {
            self.advance();
            return Ok(Expr::List {
                items: Vec::new(),
                pos,
            });
        }

        let first = self.expression()?;
        self.skip_newlines();

        if self.check(&TokenKind::Colon) {
            // Map literal
            self.advance();
            self.skip_newlines();
            let first_val = self.expression()?;
            let mut entries = vec![(first, first_val)];
            self.skip_newlines();
            while self.check(&TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
                let k = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::Colon, "`:`")?;
                self.skip_newlines();
                let v = self.expression()?;
                entries.push((k, v));
                self.skip_newlines();
            }
            self.expect(&TokenKind::RightBracket, "`]`")?;
            return Ok(Expr::Map { entries, pos });
        }

        // List literal
        let mut items = vec![first];
        while self.check(&TokenKind::Comma) {
            self.advance();
            self.skip_newlines();
            items.push(self.expression()?);
            self.skip_newlines();
        }
        self.expect(&TokenKind::RightBracket, "`]`")?;
        Ok(Expr::List { items, pos })
    }

    // ---------------------------------------------------------------------
    // Token helpers
    // ---------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_pos(&self) -> SrcPos {
        self.peek().pos
    }

    fn peek_next_is(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.current + 1)
            .map(|t| &t.kind == kind)
            .unwrap_or(false)
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.current.min(self.tokens.len() - 1)];
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::RightBrace | TokenKind::Eof
        )
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.err_here(format!("expected {what}, got `{}`", self.peek().lexeme)))
        }
    }

    fn expect_terminator(&mut self) -> Result<()> {
        if self.check_terminator() {
            if self.check(&TokenKind::Newline) {
                self.advance();
            }
            Ok(())
        } else {
            Err(self.err_here(format!(
                "expected end of statement, got `{}`",
                self.peek().lexeme
            )))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.err_here(format!("expected {what}"))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn err_here(&self, message: impl Into<String>) -> Error {
        self.err_at(self.peek_pos(), message)
    }

    fn err_at(&self, pos: SrcPos, message: impl Into<String>) -> Error {
        Error::Parse {
            file: self.file.clone(),
            line: pos.line,
            col: pos.col,
            message: message.into(),
        }
    }
}

/// Scan and parse source text in one step
pub fn parse_source(file: &str, source: &str) -> Result<Program> {
    let tokens = crate::lexer::Scanner::new(file, source).scan_tokens()?;
    Parser::new(file, tokens).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_source("test.flap", src).unwrap()
    }

    #[test]
    fn parses_hello() {
        let p = parse(r#"main = () => println("hi")"#);
        assert_eq!(p.statements.len(), 1);
        match &p.statements[0] {
            Stmt::Assign { name, value, .. } => {
                assert_eq!(name, "main");
                assert!(matches!(value, Expr::Lambda { params, .. } if params.is_empty()));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn parses_or_bang() {
        let p = parse("x = 1/0 or! 42\nprintln(x)");
        match &p.statements[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Binary { op, .. } => assert_eq!(*op, BinaryOp::OrElse),
                other => panic!("expected or! binary, got {other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_range_loop_with_guarded_break() {
        let p = parse("total = 0\n@ i in 0..<100 { i >= 10 -> break; total = total + i }");
        match &p.statements[1] {
            Stmt::RangeLoop {
                var,
                inclusive,
                body,
                ..
            } => {
                assert_eq!(var, "i");
                assert!(!inclusive);
                assert!(matches!(body[0], Stmt::Guarded { .. }));
                assert!(matches!(body[1], Stmt::Assign { .. }));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_parallel_loop_variants() {
        let p = parse("@@ i in 0..<1000 { atomic_add(counter, i) }");
        assert!(matches!(
            &p.statements[0],
            Stmt::ParallelLoop {
                workers: WorkerCount::Auto,
                ..
            }
        ));

        let p = parse("4 @ i in 0..<1000 { atomic_add(counter, i) }");
        match &p.statements[0] {
            Stmt::ParallelLoop {
                workers: WorkerCount::Count(e),
                ..
            } => assert!(matches!(e, Expr::Number { value, .. } if *value == 4.0)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_guard_match_lambda() {
        let p = parse(r#"classify = n => { | n < 0 -> "neg" | n == 0 -> "zero" ~> "pos" }"#);
        match &p.statements[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Lambda { body, .. } => match body {
                    LambdaBody::Expr(e) => match e.as_ref() {
                        Expr::Match { arms, default, .. } => {
                            assert_eq!(arms.len(), 2);
                            assert!(default.is_some());
                        }
                        other => panic!("{other:?}"),
                    },
                    other => panic!("{other:?}"),
                },
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_import_and_member_call() {
        let p = parse("import c \"libc.so.6\"\nmain = () => c.puts(\"world\")");
        assert_eq!(p.imports.len(), 1);
        assert_eq!(p.imports[0].library, "libc.so.6");
        match &p.statements[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Lambda { body, .. } => match body {
                    LambdaBody::Expr(e) => match e.as_ref() {
                        Expr::Call { callee, .. } => {
                            assert!(matches!(callee.as_ref(), Expr::Member { object, name, .. }
                                if object == "c" && name == "puts"));
                        }
                        other => panic!("{other:?}"),
                    },
                    other => panic!("{other:?}"),
                },
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_index_assign_and_collections() {
        let p = parse("l = [1, 2, 3]\nl[0] <- 9\nm = [\"a\": 1]\ne = [:]");
        assert!(matches!(p.statements[1], Stmt::IndexAssign { .. }));
        assert!(matches!(&p.statements[2], Stmt::Assign { value: Expr::Map { entries, .. }, .. }
            if entries.len() == 1));
        assert!(matches!(&p.statements[3], Stmt::Assign { value: Expr::Map { entries, .. }, .. }
            if entries.is_empty()));
    }

    #[test]
    fn parses_channel_ops_and_error_accessor() {
        let p = parse("ch = channel(4)\nsend(ch, 1)\nx = recv(ch)\nclose(ch)\ncode = x.error");
        assert!(matches!(
            &p.statements[0],
            Stmt::Assign {
                value: Expr::ChannelOp {
                    op: ChannelOpKind::Create,
                    ..
                },
                ..
            }
        ));
        assert!(matches!(
            &p.statements[4],
            Stmt::Assign {
                value: Expr::ErrorCode { .. },
                ..
            }
        ));
    }

    #[test]
    fn parses_defer_arena_unsafe() {
        let p = parse("arena {\n  x = 1\n  defer { println(x) }\n  unsafe { x = 2 }\n}");
        match &p.statements[0] {
            Stmt::Arena { body, .. } => {
                assert!(matches!(body[1], Stmt::Defer { .. }));
                assert!(matches!(body[2], Stmt::Unsafe { .. }));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_member() {
        let err = parse_source("t.flap", "x = 1\ny = x.length").unwrap_err();
        assert!(err.to_string().contains("not an import alias"));
    }
}
