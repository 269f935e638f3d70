//! Recursive-descent parser.
//!
//! The grammar is small enough that every production is a method. Parse
//! errors carry a position and a message; no recovery is attempted. The
//! identifier case rule (uppercase for shared variables and programs,
//! lowercase for locals, ports and functions) is enforced here, surfacing
//! `Name` diagnostics, so later stages never re-scan identifiers.

use crate::error::{AlthreadError, AlthreadResult, ErrorKind, Pos};
use crate::frontend::ast::{
    AssertionBlock, AssertionKind, AssignOp, Ast, BinaryOp, Block, Endpoint, Expr, FunctionDecl,
    Import, Node, Param, ProgramDecl, SharedDecl, Statement, TypeExpr, UnaryOp,
};
use crate::frontend::token::{Token, TokenKind};
use crate::types::Literal;

/// Parser over the token stream of one file.
pub struct Parser {
    tokens: Vec<Token>,
    index: usize,
    prev_pos: Pos,
}

impl Parser {
    /// Create a parser from a token stream ending in `Eof`.
    pub fn new(tokens: Vec<Token>) -> Self {
        let prev_pos = tokens
            .first()
            .map(|t| t.pos.clone())
            .unwrap_or_default();
        Parser {
            tokens,
            index: 0,
            prev_pos,
        }
    }

    /// Parse a whole file.
    pub fn parse_file(mut self) -> AlthreadResult<Ast> {
        let mut ast = Ast::default();
        while !self.check(&TokenKind::Eof) {
            match self.peek_kind() {
                TokenKind::Import => {
                    let import = self.import_decl()?;
                    ast.imports.push(import);
                }
                TokenKind::Shared => {
                    let mut decls = self.shared_block()?;
                    ast.shared.append(&mut decls);
                }
                TokenKind::Program => {
                    let program = self.program_decl()?;
                    ast.programs.push(program);
                }
                TokenKind::Fn | TokenKind::At => {
                    let function = self.function_decl()?;
                    ast.functions.push(function);
                }
                TokenKind::Main => {
                    let start = self.advance().pos;
                    let block = self.block()?;
                    if ast.main.is_some() {
                        return Err(AlthreadError::new(
                            ErrorKind::Parse,
                            start,
                            "duplicate 'main' block",
                        ));
                    }
                    let pos = start.merge(&block.pos);
                    ast.main = Some(Node::new(block.value, pos));
                }
                TokenKind::Always | TokenKind::Eventually => {
                    let assertion = self.assertion_block()?;
                    ast.assertions.push(assertion);
                }
                _ => {
                    let token = self.peek().clone();
                    return Err(AlthreadError::new(
                        ErrorKind::Parse,
                        token.pos,
                        format!(
                            "expected a top-level declaration, found '{}'",
                            token.kind
                        ),
                    ));
                }
            }
        }
        Ok(ast)
    }

    // ------------------------------------------------------------------
    // Top-level declarations

    fn import_decl(&mut self) -> AlthreadResult<Node<Import>> {
        let start = self.expect(TokenKind::Import, "'import'")?.pos;
        let path = match self.advance() {
            Token {
                kind: TokenKind::Str(path),
                ..
            } => path,
            token => {
                return Err(AlthreadError::new(
                    ErrorKind::Parse,
                    token.pos,
                    "expected a string path after 'import'",
                ));
            }
        };
        let alias = if self.eat(&TokenKind::As) {
            Some(self.expect_upper("an import alias")?.value)
        } else {
            None
        };
        self.expect(TokenKind::Semi, "';'")?;
        let pos = start.merge(&self.prev_pos);
        Ok(Node::new(Import { path, alias }, pos))
    }

    fn shared_block(&mut self) -> AlthreadResult<Vec<Node<SharedDecl>>> {
        self.expect(TokenKind::Shared, "'shared'")?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut decls = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let start = self.expect(TokenKind::Let, "'let'")?.pos;
            let name = self.shared_name()?;
            let ty = if self.eat(&TokenKind::Colon) {
                Some(self.type_expr()?)
            } else {
                None
            };
            let init = if self.eat(&TokenKind::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            if ty.is_none() && init.is_none() {
                return Err(AlthreadError::new(
                    ErrorKind::Parse,
                    name.pos.clone(),
                    "a shared declaration needs a type or an initializer",
                ));
            }
            self.expect(TokenKind::Semi, "';'")?;
            let pos = start.merge(&self.prev_pos);
            decls.push(Node::new(SharedDecl { name, ty, init }, pos));
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(decls)
    }

    fn program_decl(&mut self) -> AlthreadResult<Node<ProgramDecl>> {
        let start = self.expect(TokenKind::Program, "'program'")?.pos;
        let name = match self.advance() {
            Token {
                kind: TokenKind::UpperIdent(name),
                pos,
            } => Node::new(name, pos),
            Token {
                kind: TokenKind::Ident(name),
                pos,
            } => {
                return Err(AlthreadError::new(
                    ErrorKind::Name,
                    pos,
                    format!("program name '{}' must start with an uppercase letter", name),
                ));
            }
            token => {
                return Err(AlthreadError::new(
                    ErrorKind::Parse,
                    token.pos,
                    "expected a program name",
                ));
            }
        };
        let params = self.param_list()?;
        let body = self.block()?;
        let pos = start.merge(&body.pos);
        Ok(Node::new(ProgramDecl { name, params, body }, pos))
    }

    fn function_decl(&mut self) -> AlthreadResult<Node<FunctionDecl>> {
        let start = self.peek().pos.clone();
        let private = if self.eat(&TokenKind::At) {
            match self.advance() {
                Token {
                    kind: TokenKind::Ident(marker),
                    ..
                } if marker == "private" => true,
                token => {
                    return Err(AlthreadError::new(
                        ErrorKind::Parse,
                        token.pos,
                        "the only attribute is '@private'",
                    ));
                }
            }
        } else {
            false
        };
        self.expect(TokenKind::Fn, "'fn'")?;
        let name = self.lower_name("function")?;
        let params = self.param_list()?;
        let ret = if self.eat(&TokenKind::Arrow) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let body = self.block()?;
        let pos = start.merge(&body.pos);
        Ok(Node::new(
            FunctionDecl {
                name,
                params,
                ret,
                body,
                private,
            },
            pos,
        ))
    }

    fn assertion_block(&mut self) -> AlthreadResult<Node<AssertionBlock>> {
        let token = self.advance();
        let kind = match token.kind {
            TokenKind::Always => AssertionKind::Always,
            TokenKind::Eventually => AssertionKind::Eventually,
            _ => unreachable!("assertion_block called on a non-assertion token"),
        };
        let start = token.pos;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut conditions = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let condition = self.expression()?;
            self.expect(TokenKind::Semi, "';'")?;
            conditions.push(condition);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        let pos = start.merge(&self.prev_pos);
        Ok(Node::new(AssertionBlock { kind, conditions }, pos))
    }

    fn param_list(&mut self) -> AlthreadResult<Vec<Param>> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if !params.is_empty() {
                self.expect(TokenKind::Comma, "','")?;
            }
            let name = self.lower_name("parameter")?;
            self.expect(TokenKind::Colon, "':'")?;
            let ty = self.type_expr()?;
            params.push(Param { name, ty });
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(params)
    }

    // ------------------------------------------------------------------
    // Statements

    fn block(&mut self) -> AlthreadResult<Node<Block>> {
        let start = self.expect(TokenKind::LBrace, "'{'")?.pos;
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            statements.push(self.statement()?);
        }
        let end = self.expect(TokenKind::RBrace, "'}'")?.pos;
        let pos = start.merge(&end);
        Ok(Node::new(Block { statements }, pos))
    }

    fn statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.peek().pos.clone();
        match self.peek_kind() {
            TokenKind::Let => self.let_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::Loop => {
                self.advance();
                let body = self.block()?;
                let pos = start.merge(&body.pos);
                Ok(Node::new(Statement::Loop { body }, pos))
            }
            TokenKind::While => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                let pos = start.merge(&body.pos);
                Ok(Node::new(Statement::While { cond, body }, pos))
            }
            TokenKind::For => self.for_statement(),
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(Statement::Break, start.merge(&self.prev_pos)))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(Statement::Continue, start.merge(&self.prev_pos)))
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(
                    Statement::Return(value),
                    start.merge(&self.prev_pos),
                ))
            }
            TokenKind::Print => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let args = self.expr_list(&TokenKind::RParen)?;
                self.expect(TokenKind::RParen, "')'")?;
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(
                    Statement::Print(args),
                    start.merge(&self.prev_pos),
                ))
            }
            TokenKind::Send => self.send_statement(),
            TokenKind::Await => self.receive_statement(),
            TokenKind::Wait => {
                self.advance();
                self.expect(TokenKind::Until, "'until'")?;
                let cond = self.expression()?;
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(
                    Statement::Wait(cond),
                    start.merge(&self.prev_pos),
                ))
            }
            TokenKind::Atomic => {
                self.advance();
                let body = self.block()?;
                let pos = start.merge(&body.pos);
                Ok(Node::new(Statement::Atomic(body), pos))
            }
            TokenKind::Channel => self.channel_statement(),
            TokenKind::Ident(_) | TokenKind::UpperIdent(_) => self.assign_or_expr_statement(),
            _ => {
                let expr = self.expression()?;
                self.expect(TokenKind::Semi, "';'")?;
                Ok(Node::new(
                    Statement::Expr(expr),
                    start.merge(&self.prev_pos),
                ))
            }
        }
    }

    fn let_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::Let, "'let'")?.pos;
        let name = match self.advance() {
            Token {
                kind: TokenKind::Ident(name),
                pos,
            } => Node::new(name, pos),
            Token {
                kind: TokenKind::UpperIdent(name),
                pos,
            } => {
                return Err(AlthreadError::new(
                    ErrorKind::Name,
                    pos,
                    format!(
                        "local '{}' must start with a lowercase letter; uppercase names are shared",
                        name
                    ),
                ));
            }
            token => {
                return Err(AlthreadError::new(
                    ErrorKind::Parse,
                    token.pos,
                    "expected a variable name after 'let'",
                ));
            }
        };
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        if ty.is_none() && init.is_none() {
            return Err(AlthreadError::new(
                ErrorKind::Parse,
                name.pos.clone(),
                "a declaration needs a type or an initializer",
            ));
        }
        self.expect(TokenKind::Semi, "';'")?;
        Ok(Node::new(
            Statement::Let { name, ty, init },
            start.merge(&self.prev_pos),
        ))
    }

    fn if_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::If, "'if'")?.pos;
        let cond = self.expression()?;
        let then_block = self.block()?;
        let else_block = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                // else-if chains nest as a single-statement else block
                let nested = self.if_statement()?;
                let pos = nested.pos.clone();
                Some(Node::new(
                    Block {
                        statements: vec![nested],
                    },
                    pos,
                ))
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        let pos = start.merge(&self.prev_pos);
        Ok(Node::new(
            Statement::If {
                cond,
                then_block,
                else_block,
            },
            pos,
        ))
    }

    fn for_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::For, "'for'")?.pos;
        let var = self.lower_name("loop variable")?;
        self.expect(TokenKind::In, "'in'")?;
        let from = self.expression()?;
        self.expect(TokenKind::DotDot, "'..'")?;
        let to = self.expression()?;
        let body = self.block()?;
        let pos = start.merge(&body.pos);
        Ok(Node::new(
            Statement::For {
                var,
                from,
                to,
                body,
            },
            pos,
        ))
    }

    fn send_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::Send, "'send'")?.pos;
        let port = self.lower_name("port")?;
        self.expect(TokenKind::LParen, "'('")?;
        let args = self.expr_list(&TokenKind::RParen)?;
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Semi, "';'")?;
        Ok(Node::new(
            Statement::Send { port, args },
            start.merge(&self.prev_pos),
        ))
    }

    fn receive_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::Await, "'await'")?.pos;
        self.expect(TokenKind::Receive, "'receive'")?;
        let port = self.lower_name("port")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut binds = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if !binds.is_empty() {
                self.expect(TokenKind::Comma, "','")?;
            }
            binds.push(self.lower_name("binding")?);
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::FatArrow, "'=>'")?;
        let body = self.block()?;
        self.eat(&TokenKind::Semi);
        let pos = start.merge(&self.prev_pos);
        Ok(Node::new(Statement::Receive { port, binds, body }, pos))
    }

    fn channel_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.expect(TokenKind::Channel, "'channel'")?.pos;
        let (sender, sender_port) = self.endpoint()?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut types = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if !types.is_empty() {
                self.expect(TokenKind::Comma, "','")?;
            }
            types.push(self.type_expr()?);
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Gt, "'>'")?;
        let (receiver, receiver_port) = self.endpoint()?;
        self.expect(TokenKind::Semi, "';'")?;
        let pos = start.merge(&self.prev_pos);
        Ok(Node::new(
            Statement::ChannelDecl {
                sender,
                sender_port,
                types,
                receiver,
                receiver_port,
            },
            pos,
        ))
    }

    fn endpoint(&mut self) -> AlthreadResult<(Node<Endpoint>, Node<String>)> {
        let token = self.advance();
        let endpoint = match token.kind {
            TokenKind::SelfKw => Node::new(Endpoint::Current, token.pos),
            TokenKind::Ident(name) => Node::new(Endpoint::Var(name), token.pos),
            _ => {
                return Err(AlthreadError::new(
                    ErrorKind::Parse,
                    token.pos,
                    "expected 'self' or a process variable as channel endpoint",
                ));
            }
        };
        self.expect(TokenKind::Dot, "'.'")?;
        let port = self.lower_name("port")?;
        Ok((endpoint, port))
    }

    fn assign_or_expr_statement(&mut self) -> AlthreadResult<Node<Statement>> {
        let start = self.peek().pos.clone();
        // An identifier directly followed by an assignment operator is an
        // assignment; everything else falls through to an expression.
        let is_assign = matches!(
            self.peek_kind(),
            TokenKind::Ident(_) | TokenKind::UpperIdent(_)
        ) && matches!(
            self.peek_at(1).map(|t| &t.kind),
            Some(TokenKind::Assign)
                | Some(TokenKind::PlusAssign)
                | Some(TokenKind::MinusAssign)
                | Some(TokenKind::StarAssign)
                | Some(TokenKind::SlashAssign)
                | Some(TokenKind::PercentAssign)
        );
        if is_assign {
            let target = match self.advance() {
                Token {
                    kind: TokenKind::Ident(name),
                    pos,
                }
                | Token {
                    kind: TokenKind::UpperIdent(name),
                    pos,
                } => Node::new(name, pos),
                _ => unreachable!("checked above"),
            };
            let op = match self.advance().kind {
                TokenKind::Assign => AssignOp::Set,
                TokenKind::PlusAssign => AssignOp::Add,
                TokenKind::MinusAssign => AssignOp::Sub,
                TokenKind::StarAssign => AssignOp::Mul,
                TokenKind::SlashAssign => AssignOp::Div,
                TokenKind::PercentAssign => AssignOp::Mod,
                _ => unreachable!("checked above"),
            };
            let value = self.expression()?;
            self.expect(TokenKind::Semi, "';'")?;
            Ok(Node::new(
                Statement::Assign { target, op, value },
                start.merge(&self.prev_pos),
            ))
        } else {
            let expr = self.expression()?;
            self.expect(TokenKind::Semi, "';'")?;
            Ok(Node::new(
                Statement::Expr(expr),
                start.merge(&self.prev_pos),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expression(&mut self) -> AlthreadResult<Node<Expr>> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.and_expr()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and_expr()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.equality_expr()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.equality_expr()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.comparison_expr()?;
        loop {
            let op = if self.eat(&TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.eat(&TokenKind::NotEq) {
                BinaryOp::Ne
            } else {
                break;
            };
            let right = self.comparison_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn comparison_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.additive_expr()?;
        loop {
            let op = if self.eat(&TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.eat(&TokenKind::Le) {
                BinaryOp::Le
            } else if self.eat(&TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.eat(&TokenKind::Ge) {
                BinaryOp::Ge
            } else {
                break;
            };
            let right = self.additive_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn additive_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.multiplicative_expr()?;
        loop {
            let op = if self.eat(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.eat(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.multiplicative_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut left = self.unary_expr()?;
        loop {
            let op = if self.eat(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.eat(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.eat(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.unary_expr()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let start = self.peek().pos.clone();
        if self.eat(&TokenKind::Minus) {
            let operand = self.unary_expr()?;
            let pos = start.merge(&operand.pos);
            return Ok(Node::new(
                Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        if self.eat(&TokenKind::Bang) {
            let operand = self.unary_expr()?;
            let pos = start.merge(&operand.pos);
            return Ok(Node::new(
                Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let mut expr = self.primary_expr()?;
        while self.eat(&TokenKind::LBracket) {
            let index = self.expression()?;
            self.expect(TokenKind::RBracket, "']'")?;
            let pos = expr.pos.merge(&self.prev_pos);
            expr = Node::new(
                Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                },
                pos,
            );
        }
        Ok(expr)
    }

    fn primary_expr(&mut self) -> AlthreadResult<Node<Expr>> {
        let token = self.advance();
        let start = token.pos.clone();
        match token.kind {
            TokenKind::Int(n) => Ok(Node::new(Expr::Literal(Literal::Int(n)), start)),
            TokenKind::True => Ok(Node::new(Expr::Literal(Literal::Bool(true)), start)),
            TokenKind::False => Ok(Node::new(Expr::Literal(Literal::Bool(false)), start)),
            TokenKind::Str(s) => Ok(Node::new(Expr::Literal(Literal::String(s)), start)),
            TokenKind::Run => {
                let (alias, program) = self.program_ref()?;
                self.expect(TokenKind::LParen, "'('")?;
                let args = self.expr_list(&TokenKind::RParen)?;
                self.expect(TokenKind::RParen, "')'")?;
                let pos = start.merge(&self.prev_pos);
                Ok(Node::new(
                    Expr::Run {
                        alias,
                        program,
                        args,
                    },
                    pos,
                ))
            }
            TokenKind::Ident(name) => {
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let args = self.expr_list(&TokenKind::RParen)?;
                    self.expect(TokenKind::RParen, "')'")?;
                    let pos = start.merge(&self.prev_pos);
                    Ok(Node::new(
                        Expr::Call {
                            alias: None,
                            name,
                            args,
                        },
                        pos,
                    ))
                } else {
                    Ok(Node::new(Expr::Local(name), start))
                }
            }
            TokenKind::UpperIdent(name) => {
                // `Alias.f(args)` qualifies a function through an import
                // alias; a bare uppercase identifier is a shared variable.
                if self.check(&TokenKind::Dot) {
                    self.advance();
                    let func = self.lower_name("function")?;
                    self.expect(TokenKind::LParen, "'('")?;
                    let args = self.expr_list(&TokenKind::RParen)?;
                    self.expect(TokenKind::RParen, "')'")?;
                    let pos = start.merge(&self.prev_pos);
                    Ok(Node::new(
                        Expr::Call {
                            alias: Some(name),
                            name: func.value,
                            args,
                        },
                        pos,
                    ))
                } else {
                    Ok(Node::new(Expr::Shared(name), start))
                }
            }
            TokenKind::LParen => {
                let first = self.expression()?;
                if self.eat(&TokenKind::Comma) {
                    let mut items = vec![first];
                    while !self.check(&TokenKind::RParen) {
                        items.push(self.expression()?);
                        if !self.check(&TokenKind::RParen) {
                            self.expect(TokenKind::Comma, "','")?;
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    let pos = start.merge(&self.prev_pos);
                    Ok(Node::new(Expr::Tuple(items), pos))
                } else {
                    self.expect(TokenKind::RParen, "')'")?;
                    Ok(first)
                }
            }
            TokenKind::LBracket => {
                let items = self.expr_list(&TokenKind::RBracket)?;
                self.expect(TokenKind::RBracket, "']'")?;
                let pos = start.merge(&self.prev_pos);
                Ok(Node::new(Expr::ListLit(items), pos))
            }
            kind => Err(AlthreadError::new(
                ErrorKind::Parse,
                start,
                format!("expected an expression, found '{}'", kind),
            )),
        }
    }

    fn program_ref(&mut self) -> AlthreadResult<(Option<String>, String)> {
        let first = self.expect_upper("a program name")?;
        if self.check(&TokenKind::Dot) {
            self.advance();
            let program = self.expect_upper("a program name")?;
            Ok((Some(first.value), program.value))
        } else {
            Ok((None, first.value))
        }
    }

    fn expr_list(&mut self, terminator: &TokenKind) -> AlthreadResult<Vec<Node<Expr>>> {
        let mut items = Vec::new();
        while !self.check(terminator) {
            if !items.is_empty() {
                self.expect(TokenKind::Comma, "','")?;
            }
            items.push(self.expression()?);
        }
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Types

    fn type_expr(&mut self) -> AlthreadResult<Node<TypeExpr>> {
        let token = self.advance();
        let start = token.pos.clone();
        match token.kind {
            TokenKind::Ident(name) => match name.as_str() {
                "void" => Ok(Node::new(TypeExpr::Void, start)),
                "int" => Ok(Node::new(TypeExpr::Int, start)),
                "bool" => Ok(Node::new(TypeExpr::Bool, start)),
                "string" => Ok(Node::new(TypeExpr::String, start)),
                "list" => {
                    self.expect(TokenKind::LParen, "'('")?;
                    let elem = self.type_expr()?;
                    self.expect(TokenKind::RParen, "')'")?;
                    let pos = start.merge(&self.prev_pos);
                    Ok(Node::new(TypeExpr::List(Box::new(elem)), pos))
                }
                "proc" => {
                    self.expect(TokenKind::LParen, "'('")?;
                    let program = self.expect_upper("a program name")?;
                    self.expect(TokenKind::RParen, "')'")?;
                    let pos = start.merge(&self.prev_pos);
                    Ok(Node::new(TypeExpr::Proc(program.value), pos))
                }
                other => Err(AlthreadError::new(
                    ErrorKind::Parse,
                    start,
                    format!("unknown type '{}'", other),
                )),
            },
            TokenKind::LParen => {
                let mut items = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    if !items.is_empty() {
                        self.expect(TokenKind::Comma, "','")?;
                    }
                    items.push(self.type_expr()?);
                }
                self.expect(TokenKind::RParen, "')'")?;
                let pos = start.merge(&self.prev_pos);
                Ok(Node::new(TypeExpr::Tuple(items), pos))
            }
            kind => Err(AlthreadError::new(
                ErrorKind::Parse,
                start,
                format!("expected a type, found '{}'", kind),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Token helpers

    fn binary(op: BinaryOp, left: Node<Expr>, right: Node<Expr>) -> Node<Expr> {
        let pos = left.pos.merge(&right.pos);
        Node::new(
            Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            pos,
        )
    }

    fn shared_name(&mut self) -> AlthreadResult<Node<String>> {
        match self.advance() {
            Token {
                kind: TokenKind::UpperIdent(name),
                pos,
            } => Ok(Node::new(name, pos)),
            Token {
                kind: TokenKind::Ident(name),
                pos,
            } => Err(AlthreadError::new(
                ErrorKind::Name,
                pos,
                format!(
                    "shared variable '{}' must start with an uppercase letter",
                    name
                ),
            )),
            token => Err(AlthreadError::new(
                ErrorKind::Parse,
                token.pos,
                "expected a shared variable name",
            )),
        }
    }

    fn lower_name(&mut self, what: &str) -> AlthreadResult<Node<String>> {
        match self.advance() {
            Token {
                kind: TokenKind::Ident(name),
                pos,
            } => Ok(Node::new(name, pos)),
            Token {
                kind: TokenKind::UpperIdent(name),
                pos,
            } => Err(AlthreadError::new(
                ErrorKind::Name,
                pos,
                format!("{} '{}' must start with a lowercase letter", what, name),
            )),
            token => Err(AlthreadError::new(
                ErrorKind::Parse,
                token.pos,
                format!("expected a {} name", what),
            )),
        }
    }

    fn expect_upper(&mut self, what: &str) -> AlthreadResult<Node<String>> {
        match self.advance() {
            Token {
                kind: TokenKind::UpperIdent(name),
                pos,
            } => Ok(Node::new(name, pos)),
            token => Err(AlthreadError::new(
                ErrorKind::Parse,
                token.pos,
                format!("expected {} (uppercase identifier)", what),
            )),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> AlthreadResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(AlthreadError::new(
                ErrorKind::Parse,
                token.pos.clone(),
                format!("expected {}, found '{}'", what, token.kind),
            ))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.index + ahead)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        self.prev_pos = token.pos.clone();
        token
    }
}

/// Convenience: lex and parse one file.
pub fn parse(file: &str, source: &str) -> AlthreadResult<Ast> {
    let tokens = crate::frontend::lexer::Lexer::new(file, source).tokenize()?;
    Parser::new(tokens).parse_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Ast {
        parse("test.alt", src).expect("parse failed")
    }

    #[test]
    fn test_hello_world() {
        let ast = parse_ok(r#"main { print("hi"); }"#);
        let main = ast.main.expect("no main");
        assert_eq!(main.value.statements.len(), 1);
    }

    #[test]
    fn test_shared_counter() {
        let ast = parse_ok(
            "shared { let C: int = 0; }\n\
             program Inc() { C = C + 1; }\n\
             main { run Inc(); run Inc(); wait until C == 2; }\n\
             always { C <= 2; }",
        );
        assert_eq!(ast.shared.len(), 1);
        assert_eq!(ast.programs.len(), 1);
        assert_eq!(ast.assertions.len(), 1);
        assert!(ast.main.is_some());
    }

    #[test]
    fn test_channel_and_receive() {
        let ast = parse_ok(
            "program Producer() { send out(1); }\n\
             program Consumer() { await receive inp(x) => { print(x); } }\n\
             main {\n\
                 let p = run Producer();\n\
                 let c = run Consumer();\n\
                 channel p.out (int) > c.inp;\n\
             }",
        );
        assert_eq!(ast.programs.len(), 2);
        let main = ast.main.unwrap();
        assert!(matches!(
            main.value.statements[2].value,
            Statement::ChannelDecl { .. }
        ));
    }

    #[test]
    fn test_lowercase_program_name_rejected() {
        let err = parse("t.alt", "program inc() { }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn test_uppercase_local_rejected() {
        let err = parse("t.alt", "main { let Counter = 0; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn test_lowercase_shared_rejected() {
        let err = parse("t.alt", "shared { let c: int = 0; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn test_precedence() {
        let ast = parse_ok("main { let x = 1 + 2 * 3 == 7 && true; }");
        let main = ast.main.unwrap();
        match &main.value.statements[0].value {
            Statement::Let {
                init: Some(init), ..
            } => match &init.value {
                Expr::Binary { op, .. } => assert_eq!(*op, BinaryOp::And),
                other => panic!("expected &&, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_spans_nest() {
        let ast = parse_ok("main { let x = 1 + 2; }");
        let main = ast.main.unwrap();
        let stmt = &main.value.statements[0];
        assert!(stmt.pos.within(&main.pos));
        if let Statement::Let {
            init: Some(init), ..
        } = &stmt.value
        {
            assert!(init.pos.within(&stmt.pos));
            if let Expr::Binary { left, right, .. } = &init.value {
                assert!(left.pos.within(&init.pos));
                assert!(right.pos.within(&init.pos));
            }
        }
    }

    #[test]
    fn test_import_forms() {
        let ast = parse_ok("import \"lib.alt\";\nimport \"util.alt\" as Util;\nmain { }");
        assert_eq!(ast.imports.len(), 2);
        assert_eq!(ast.imports[1].value.alias.as_deref(), Some("Util"));
    }

    #[test]
    fn test_private_function() {
        let ast = parse_ok("@private fn helper(x: int) -> int { return x; }");
        assert!(ast.functions[0].value.private);
    }

    #[test]
    fn test_for_and_atomic() {
        let ast = parse_ok(
            "main { for i in 0..3 { atomic { print(i); } } }",
        );
        assert!(ast.main.is_some());
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse("t.alt", "main { let = 1; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.pos.is_some());
    }
}
