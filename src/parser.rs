use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::ast::{BinaryOp, ExceptClause, Expr, FuncDecl, NativeDecl, Stmt, UnaryOp};
use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenType};

static SIMPLE_ESCAPES: Lazy<HashMap<char, char>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert('n', '\n');
    map.insert('r', '\r');
    map.insert('t', '\t');
    map.insert('\\', '\\');
    map.insert('"', '"');
    map.insert('\'', '\'');
    map.insert('0', '\0');
    map
});

/// Recursive-descent parser producing the AST. Statement boundaries drive
/// panic-mode recovery so several errors can be reported in one pass.
pub struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    panic_mode: bool,
    errors: Vec<CompileError>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Parser<'a> {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(TokenType::Eof),
            previous: Token::synthetic(TokenType::Eof),
            panic_mode: false,
            errors: vec![],
        }
    }

    pub fn parse(mut self) -> Result<Vec<Stmt>, Vec<CompileError>> {
        self.advance();

        let mut stmts = vec![];
        self.skip_separators();
        while !self.check(TokenType::Eof) {
            if let Some(stmt) = self.declaration() {
                stmts.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_separators();
        }

        if self.errors.is_empty() {
            Ok(stmts)
        } else {
            Err(self.errors)
        }
    }

    fn skip_separators(&mut self) {
        while self.match_token(TokenType::Semicolon) {}
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.value);
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) -> bool {
        if self.current.token_type == token_type {
            self.advance();
            return true;
        }
        self.error_at_current(message);
        false
    }

    fn line(&self) -> usize {
        self.previous.line
    }

    /// Type of the token after `current`, without consuming anything.
    fn peek_second(&self) -> TokenType {
        let mut lookahead = self.scanner.clone();
        loop {
            let token = lookahead.scan_token();
            if token.token_type != TokenType::Error {
                return token.token_type;
            }
        }
    }

    // ---- statements ----

    fn declaration(&mut self) -> Option<Stmt> {
        if self.match_token(TokenType::Var) {
            self.var_declaration()
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration()
        } else if self.match_token(TokenType::Native) {
            self.native_declaration().map(Stmt::NativeDecl)
        } else if self.match_token(TokenType::Class) {
            self.class_declaration()
        } else if self.match_token(TokenType::Import) {
            self.import_statement()
        } else {
            self.statement()
        }
    }

    fn statement(&mut self) -> Option<Stmt> {
        if self.match_token(TokenType::If) {
            self.if_statement()
        } else if self.match_token(TokenType::While) {
            self.while_statement()
        } else if self.match_token(TokenType::For) {
            self.for_statement()
        } else if self.match_token(TokenType::Do) {
            let line = self.line();
            let stmts = self.block(&[TokenType::End]);
            self.consume(TokenType::End, "Expect 'end' after block.");
            Some(Stmt::Block { line, stmts })
        } else if self.match_token(TokenType::Try) {
            self.try_statement()
        } else if self.match_token(TokenType::Raise) {
            let line = self.line();
            let exc = self.expression()?;
            Some(Stmt::Raise { line, exc })
        } else if self.match_token(TokenType::Return) {
            self.return_statement()
        } else if self.match_token(TokenType::Break) {
            Some(Stmt::Break { line: self.line() })
        } else if self.match_token(TokenType::Continue) {
            Some(Stmt::Continue { line: self.line() })
        } else {
            let expr = self.expression()?;
            Some(Stmt::Expr(expr))
        }
    }

    /// Parses statements until one of `terminators` (or EOF) is the current
    /// token. The terminator itself is left for the caller to consume.
    fn block(&mut self, terminators: &[TokenType]) -> Vec<Stmt> {
        let mut stmts = vec![];
        self.skip_separators();
        while !self.check(TokenType::Eof)
            && !terminators.iter().any(|t| self.check(*t))
        {
            if let Some(stmt) = self.declaration() {
                stmts.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_separators();
        }
        stmts
    }

    fn var_declaration(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.consume(TokenType::Identifier, "Expect variable name.");
        let name = self.previous.value.to_string();
        let init = if self.match_token(TokenType::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        Some(Stmt::VarDecl { line, name, init })
    }

    fn fun_declaration(&mut self) -> Option<Stmt> {
        self.consume(TokenType::Identifier, "Expect function name.");
        let name = self.previous.value.to_string();
        let func = self.function_body(name)?;
        Some(Stmt::FuncDecl(func))
    }

    /// Parameters and body of a `fun`, starting at the '('.
    fn function_body(&mut self, name: String) -> Option<FuncDecl> {
        let line = self.line();
        let (params, defaults, vararg) = self.parameter_list()?;
        let body = self.block(&[TokenType::End]);
        self.consume(TokenType::End, "Expect 'end' after function body.");
        Some(FuncDecl {
            line,
            name,
            params,
            defaults,
            vararg,
            body,
        })
    }

    fn parameter_list(&mut self) -> Option<(Vec<String>, Vec<Expr>, Option<String>)> {
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        let mut params = vec![];
        let mut defaults = vec![];
        let mut vararg = None;

        if !self.check(TokenType::RightParen) {
            loop {
                if self.match_token(TokenType::Ellipsis) {
                    self.consume(TokenType::Identifier, "Expect vararg parameter name.");
                    vararg = Some(self.previous.value.to_string());
                    break;
                }

                if params.len() >= 255 {
                    self.error("Can't have more than 255 parameters.");
                }
                self.consume(TokenType::Identifier, "Expect parameter name.");
                params.push(self.previous.value.to_string());

                if self.match_token(TokenType::Equal) {
                    defaults.push(self.expression()?);
                } else if !defaults.is_empty() {
                    self.error("Non-default parameter follows default parameter.");
                }

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        Some((params, defaults, vararg))
    }

    fn native_declaration(&mut self) -> Option<NativeDecl> {
        self.consume(TokenType::Identifier, "Expect native name.");
        let line = self.line();
        let name = self.previous.value.to_string();
        self.consume(TokenType::LeftParen, "Expect '(' after native name.");
        let mut params = vec![];
        if !self.check(TokenType::RightParen) {
            loop {
                self.consume(TokenType::Identifier, "Expect parameter name.");
                params.push(self.previous.value.to_string());
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        Some(NativeDecl { line, name, params })
    }

    fn class_declaration(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.consume(TokenType::Identifier, "Expect class name.");
        let name = self.previous.value.to_string();

        let superclass = if self.match_token(TokenType::Is) {
            Some(self.call_postfix()?)
        } else {
            None
        };

        let mut methods = vec![];
        let mut native_methods = vec![];
        self.skip_separators();
        while !self.check(TokenType::End) && !self.check(TokenType::Eof) {
            if self.match_token(TokenType::Fun) {
                self.consume(TokenType::Identifier, "Expect method name.");
                let method_name = self.previous.value.to_string();
                methods.push(self.function_body(method_name)?);
            } else if self.match_token(TokenType::Native) {
                native_methods.push(self.native_declaration()?);
            } else {
                self.error_at_current("Expect method declaration inside class body.");
                return None;
            }
            self.skip_separators();
        }
        self.consume(TokenType::End, "Expect 'end' after class body.");

        Some(Stmt::ClassDecl {
            line,
            name,
            superclass,
            methods,
            native_methods,
        })
    }

    fn import_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.consume(TokenType::Identifier, "Expect module name.");
        let mut module = self.previous.value.to_string();
        while self.match_token(TokenType::Dot) {
            self.consume(TokenType::Identifier, "Expect submodule name after '.'.");
            module.push('.');
            module.push_str(self.previous.value);
        }

        let as_name = if self.match_token(TokenType::As) {
            self.consume(TokenType::Identifier, "Expect name after 'as'.");
            Some(self.previous.value.to_string())
        } else {
            None
        };

        // `import m for a, b` shares its keyword with the for statement;
        // only a following identifier makes it part of the import.
        let mut names = vec![];
        if self.check(TokenType::For) && self.peek_second() == TokenType::Identifier {
            self.advance();
            if as_name.is_some() {
                self.error("Cannot combine 'as' and 'for' in an import.");
            }
            loop {
                self.consume(TokenType::Identifier, "Expect imported name.");
                names.push(self.previous.value.to_string());
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }

        Some(Stmt::Import {
            line,
            module,
            as_name,
            names,
        })
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        let cond = self.expression()?;
        self.consume(TokenType::Then, "Expect 'then' after condition.");
        let then_branch = self.block(&[TokenType::Elif, TokenType::Else, TokenType::End]);

        let else_branch = if self.match_token(TokenType::Elif) {
            // An elif chain nests as the single statement of the else arm;
            // the innermost branch consumes the final 'end'.
            Some(vec![self.if_statement()?])
        } else if self.match_token(TokenType::Else) {
            let stmts = self.block(&[TokenType::End]);
            self.consume(TokenType::End, "Expect 'end' after else branch.");
            Some(stmts)
        } else {
            self.consume(TokenType::End, "Expect 'end' after if body.");
            None
        };

        Some(Stmt::If {
            line,
            cond,
            then_branch,
            else_branch,
        })
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        let cond = self.expression()?;
        self.consume(TokenType::Do, "Expect 'do' after condition.");
        let body = self.block(&[TokenType::End]);
        self.consume(TokenType::End, "Expect 'end' after while body.");
        Some(Stmt::While { line, cond, body })
    }

    fn for_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        if self.match_token(TokenType::LeftParen) {
            // Classic for(init; cond; act).
            let init = if self.match_token(TokenType::Semicolon) {
                None
            } else if self.match_token(TokenType::Var) {
                let decl = self.var_declaration()?;
                self.consume(TokenType::Semicolon, "Expect ';' after loop initializer.");
                Some(Box::new(decl))
            } else {
                let expr = self.expression()?;
                self.consume(TokenType::Semicolon, "Expect ';' after loop initializer.");
                Some(Box::new(Stmt::Expr(expr)))
            };

            let cond = if self.check(TokenType::Semicolon) {
                None
            } else {
                Some(self.expression()?)
            };
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            let act = if self.check(TokenType::RightParen) {
                None
            } else {
                Some(self.expression()?)
            };
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.consume(TokenType::Do, "Expect 'do' after for clauses.");
            let body = self.block(&[TokenType::End]);
            self.consume(TokenType::End, "Expect 'end' after for body.");
            Some(Stmt::For {
                line,
                init,
                cond,
                act,
                body,
            })
        } else {
            // foreach form: for var x in iterable do ... end
            self.consume(TokenType::Var, "Expect 'var' or '(' after 'for'.");
            self.consume(TokenType::Identifier, "Expect loop variable name.");
            let var_name = self.previous.value.to_string();
            self.consume(TokenType::In, "Expect 'in' after loop variable.");
            let iterable = self.expression()?;
            self.consume(TokenType::Do, "Expect 'do' after iterable.");
            let body = self.block(&[TokenType::End]);
            self.consume(TokenType::End, "Expect 'end' after for body.");
            Some(Stmt::ForEach {
                line,
                var_name,
                iterable,
                body,
            })
        }
    }

    fn try_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        let block = self.block(&[TokenType::Except, TokenType::Ensure, TokenType::End]);

        let mut handlers = vec![];
        while self.match_token(TokenType::Except) {
            let clause_line = self.line();
            let class_expr = self.call_postfix()?;
            let var_name = if self.match_token(TokenType::As) {
                self.consume(TokenType::Identifier, "Expect exception variable name.");
                Some(self.previous.value.to_string())
            } else {
                None
            };
            let body = self.block(&[TokenType::Except, TokenType::Ensure, TokenType::End]);
            handlers.push(ExceptClause {
                line: clause_line,
                class_expr,
                var_name,
                body,
            });
        }

        let ensure = if self.match_token(TokenType::Ensure) {
            Some(self.block(&[TokenType::End]))
        } else {
            None
        };

        if handlers.is_empty() && ensure.is_none() {
            self.error("Expect 'except' or 'ensure' after try block.");
        }
        self.consume(TokenType::End, "Expect 'end' after try statement.");

        Some(Stmt::Try {
            line,
            block,
            handlers,
            ensure,
        })
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        let value = if matches!(
            self.current.token_type,
            TokenType::Semicolon
                | TokenType::End
                | TokenType::Eof
                | TokenType::Else
                | TokenType::Elif
                | TokenType::Except
                | TokenType::Ensure
        ) {
            None
        } else {
            Some(self.expression()?)
        };
        Some(Stmt::Return { line, value })
    }

    // ---- expressions ----

    fn expression(&mut self) -> Option<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> Option<Expr> {
        let expr = self.ternary()?;

        let compound = match self.current.token_type {
            TokenType::PlusEqual => Some(BinaryOp::Add),
            TokenType::MinusEqual => Some(BinaryOp::Sub),
            TokenType::StarEqual => Some(BinaryOp::Mul),
            TokenType::SlashEqual => Some(BinaryOp::Div),
            TokenType::PercentEqual => Some(BinaryOp::Mod),
            TokenType::CaretEqual => Some(BinaryOp::Pow),
            _ => None,
        };

        if self.match_token(TokenType::Equal) {
            let line = self.line();
            let value = self.assignment()?;
            if !Self::is_assign_target(&expr) {
                self.error("Invalid assignment target.");
            }
            return Some(Expr::Assign {
                line,
                target: Box::new(expr),
                value: Box::new(value),
            });
        }

        if let Some(op) = compound {
            self.advance();
            let line = self.line();
            let value = self.assignment()?;
            if !Self::is_assign_target(&expr) {
                self.error("Invalid assignment target.");
            }
            return Some(Expr::CompoundAssign {
                line,
                op,
                target: Box::new(expr),
                value: Box::new(value),
            });
        }

        Some(expr)
    }

    fn is_assign_target(expr: &Expr) -> bool {
        matches!(
            expr,
            Expr::VarLit { .. } | Expr::Access { .. } | Expr::Index { .. }
        )
    }

    fn ternary(&mut self) -> Option<Expr> {
        let cond = self.or_expr()?;
        if self.match_token(TokenType::Question) {
            let line = self.line();
            let then_expr = self.ternary()?;
            self.consume(TokenType::Colon, "Expect ':' in ternary expression.");
            let else_expr = self.ternary()?;
            return Some(Expr::Ternary {
                line,
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }
        Some(cond)
    }

    fn or_expr(&mut self) -> Option<Expr> {
        let mut expr = self.and_expr()?;
        while self.match_token(TokenType::Or) {
            let line = self.line();
            let right = self.and_expr()?;
            expr = Expr::Binary {
                line,
                op: BinaryOp::Or,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn and_expr(&mut self) -> Option<Expr> {
        let mut expr = self.equality()?;
        while self.match_token(TokenType::And) {
            let line = self.line();
            let right = self.equality()?;
            expr = Expr::Binary {
                line,
                op: BinaryOp::And,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn equality(&mut self) -> Option<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.match_token(TokenType::EqualEqual) {
                BinaryOp::Eq
            } else if self.match_token(TokenType::BangEqual) {
                BinaryOp::Neq
            } else {
                break;
            };
            let line = self.line();
            let right = self.comparison()?;
            expr = Expr::Binary {
                line,
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn comparison(&mut self) -> Option<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.match_token(TokenType::Greater) {
                BinaryOp::Gt
            } else if self.match_token(TokenType::GreaterEqual) {
                BinaryOp::Ge
            } else if self.match_token(TokenType::Less) {
                BinaryOp::Lt
            } else if self.match_token(TokenType::LessEqual) {
                BinaryOp::Le
            } else if self.match_token(TokenType::Is) {
                BinaryOp::Is
            } else {
                break;
            };
            let line = self.line();
            let right = self.term()?;
            expr = Expr::Binary {
                line,
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn term(&mut self) -> Option<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.match_token(TokenType::Plus) {
                BinaryOp::Add
            } else if self.match_token(TokenType::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let line = self.line();
            let right = self.factor()?;
            expr = Expr::Binary {
                line,
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn factor(&mut self) -> Option<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.match_token(TokenType::Star) {
                BinaryOp::Mul
            } else if self.match_token(TokenType::Slash) {
                BinaryOp::Div
            } else if self.match_token(TokenType::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let line = self.line();
            let right = self.unary()?;
            expr = Expr::Binary {
                line,
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Some(expr)
    }

    fn unary(&mut self) -> Option<Expr> {
        let op = if self.match_token(TokenType::Minus) {
            Some(UnaryOp::Neg)
        } else if self.match_token(TokenType::Bang) {
            Some(UnaryOp::Not)
        } else if self.match_token(TokenType::Hash) {
            Some(UnaryOp::Length)
        } else {
            None
        };

        if let Some(op) = op {
            let line = self.line();
            let operand = self.unary()?;
            return Some(Expr::Unary {
                line,
                op,
                operand: Box::new(operand),
            });
        }

        self.power()
    }

    fn power(&mut self) -> Option<Expr> {
        let base = self.call_postfix()?;
        if self.match_token(TokenType::Caret) {
            let line = self.line();
            // Right-associative; the exponent may itself carry a unary sign.
            let exp = self.unary()?;
            return Some(Expr::Binary {
                line,
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            });
        }
        Some(base)
    }

    fn call_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.match_token(TokenType::LeftParen) {
                let line = self.line();
                let args = self.argument_list()?;
                expr = Expr::Call {
                    line,
                    callee: Box::new(expr),
                    args,
                };
            } else if self.match_token(TokenType::Dot) {
                let line = self.line();
                self.consume(TokenType::Identifier, "Expect field name after '.'.");
                expr = Expr::Access {
                    line,
                    object: Box::new(expr),
                    name: self.previous.value.to_string(),
                };
            } else if self.match_token(TokenType::LeftBracket) {
                let line = self.line();
                let index = self.expression()?;
                self.consume(TokenType::RightBracket, "Expect ']' after index.");
                expr = Expr::Index {
                    line,
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Some(expr)
    }

    fn argument_list(&mut self) -> Option<Vec<Expr>> {
        let mut args = vec![];
        if !self.check(TokenType::RightParen) {
            loop {
                if args.len() >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                args.push(self.expression()?);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        Some(args)
    }

    fn primary(&mut self) -> Option<Expr> {
        if self.match_token(TokenType::Number) {
            let line = self.line();
            let value = self.parse_number(self.previous.value);
            return Some(Expr::NumLit { line, value });
        }
        if self.match_token(TokenType::String) {
            let line = self.line();
            let value = self.unescape_string(self.previous.value);
            return Some(Expr::StrLit { line, value });
        }
        if self.match_token(TokenType::True) {
            return Some(Expr::BoolLit {
                line: self.line(),
                value: true,
            });
        }
        if self.match_token(TokenType::False) {
            return Some(Expr::BoolLit {
                line: self.line(),
                value: false,
            });
        }
        if self.match_token(TokenType::Null) {
            return Some(Expr::NullLit { line: self.line() });
        }
        if self.match_token(TokenType::This) {
            return Some(Expr::ThisLit { line: self.line() });
        }
        if self.match_token(TokenType::Super) {
            let line = self.line();
            self.consume(TokenType::Dot, "Expect '.' after 'super'.");
            self.consume(TokenType::Identifier, "Expect superclass method name.");
            return Some(Expr::SuperLit {
                line,
                name: self.previous.value.to_string(),
            });
        }
        if self.match_token(TokenType::Identifier) {
            return Some(Expr::VarLit {
                line: self.line(),
                name: self.previous.value.to_string(),
            });
        }
        if self.match_token(TokenType::Fun) {
            let line = self.line();
            let func = self.function_body(String::new())?;
            return Some(Expr::AnonFunc {
                line,
                func: Box::new(func),
            });
        }
        if self.match_token(TokenType::LeftBracket) {
            let line = self.line();
            let mut elements = vec![];
            if !self.check(TokenType::RightBracket) {
                loop {
                    elements.push(self.expression()?);
                    if !self.match_token(TokenType::Comma) {
                        break;
                    }
                    if self.check(TokenType::RightBracket) {
                        break;
                    }
                }
            }
            self.consume(TokenType::RightBracket, "Expect ']' after list elements.");
            return Some(Expr::ArrLit { line, elements });
        }
        if self.match_token(TokenType::LeftParen) {
            let line = self.line();
            if self.match_token(TokenType::RightParen) {
                return Some(Expr::TupleLit {
                    line,
                    elements: vec![],
                });
            }
            let first = self.expression()?;
            if self.match_token(TokenType::Comma) {
                let mut elements = vec![first];
                if !self.check(TokenType::RightParen) {
                    loop {
                        elements.push(self.expression()?);
                        if !self.match_token(TokenType::Comma) {
                            break;
                        }
                        if self.check(TokenType::RightParen) {
                            break;
                        }
                    }
                }
                self.consume(TokenType::RightParen, "Expect ')' after tuple elements.");
                return Some(Expr::TupleLit { line, elements });
            }
            self.consume(TokenType::RightParen, "Expect ')' after expression.");
            return Some(first);
        }

        self.error_at_current("Expect expression.");
        None
    }

    fn parse_number(&mut self, lexeme: &str) -> f64 {
        if let Some(hex) = lexeme
            .strip_prefix("0x")
            .or_else(|| lexeme.strip_prefix("0X"))
        {
            match u64::from_str_radix(hex, 16) {
                Ok(value) => value as f64,
                Err(_) => {
                    self.error("Hex literal out of range.");
                    0.0
                }
            }
        } else {
            lexeme.parse::<f64>().unwrap_or_else(|_| {
                self.error("Malformed number literal.");
                0.0
            })
        }
    }

    fn unescape_string(&mut self, raw: &str) -> String {
        // Strip the delimiting quotes.
        let inner = &raw[1..raw.len() - 1];
        let mut result = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                result.push(c);
                continue;
            }
            match chars.next() {
                Some('x') => {
                    let hi = chars.next();
                    let lo = chars.next();
                    match (hi, lo) {
                        (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                            let byte = (hi.to_digit(16).unwrap() * 16 + lo.to_digit(16).unwrap()) as u8;
                            result.push(byte as char);
                        }
                        _ => self.error("Malformed '\\x' escape sequence."),
                    }
                }
                Some(c) => match SIMPLE_ESCAPES.get(&c) {
                    Some(&escaped) => result.push(escaped),
                    None => self.error("Unknown escape sequence."),
                },
                None => self.error("Trailing backslash in string."),
            }
        }
        result
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Native
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return
                | TokenType::Try
                | TokenType::Raise
                | TokenType::Import
                | TokenType::Break
                | TokenType::Continue => return,
                _ => (),
            }

            self.advance()
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let at = match token.token_type {
            TokenType::Eof => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.value),
        };
        self.errors.push(CompileError::new(token.line, at, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        Parser::new(source).parse().expect("expected clean parse")
    }

    fn parse_errors(source: &str) -> Vec<CompileError> {
        Parser::new(source).parse().expect_err("expected errors")
    }

    #[test]
    fn test_precedence_shapes_tree() {
        let stmts = parse("1 + 2 * 3");
        let Stmt::Expr(Expr::Binary { op, right, .. }) = &stmts[0] else {
            panic!("expected binary expression statement");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            **right,
            Expr::Binary { op: BinaryOp::Mul, .. }
        ));
    }

    #[test]
    fn test_function_with_defaults_and_vararg() {
        let stmts = parse("fun f(a, b = 10, ...rest) return a end");
        let Stmt::FuncDecl(func) = &stmts[0] else {
            panic!("expected function declaration");
        };
        assert_eq!(func.params, vec!["a", "b"]);
        assert_eq!(func.defaults.len(), 1);
        assert_eq!(func.vararg.as_deref(), Some("rest"));
    }

    #[test]
    fn test_class_with_superclass() {
        let stmts = parse("class B is A fun m() return 1 end end");
        let Stmt::ClassDecl {
            name,
            superclass,
            methods,
            ..
        } = &stmts[0]
        else {
            panic!("expected class declaration");
        };
        assert_eq!(name, "B");
        assert!(superclass.is_some());
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name, "m");
    }

    #[test]
    fn test_try_except_ensure() {
        let stmts = parse(
            "try raise Exception(\"x\") except Exception as e print(e) ensure print(1) end",
        );
        let Stmt::Try {
            handlers, ensure, ..
        } = &stmts[0]
        else {
            panic!("expected try statement");
        };
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].var_name.as_deref(), Some("e"));
        assert!(ensure.is_some());
    }

    #[test]
    fn test_foreach_and_classic_for() {
        let stmts = parse("for var i in l do print(i) end for(var j = 0; j < 3; j += 1) do end");
        assert!(matches!(stmts[0], Stmt::ForEach { .. }));
        assert!(matches!(stmts[1], Stmt::For { .. }));
    }

    #[test]
    fn test_tuple_vs_grouping() {
        let stmts = parse("(1 + 2); (1, 2); (1,)");
        assert!(matches!(stmts[0], Stmt::Expr(Expr::Binary { .. })));
        let Stmt::Expr(Expr::TupleLit { elements, .. }) = &stmts[1] else {
            panic!("expected tuple literal");
        };
        assert_eq!(elements.len(), 2);
        let Stmt::Expr(Expr::TupleLit { elements, .. }) = &stmts[2] else {
            panic!("expected one-element tuple");
        };
        assert_eq!(elements.len(), 1);
    }

    #[test]
    fn test_string_escapes() {
        let stmts = parse(r#"var s = "a\n\t\x41\"""#);
        let Stmt::VarDecl {
            init: Some(Expr::StrLit { value, .. }),
            ..
        } = &stmts[0]
        else {
            panic!("expected string initializer");
        };
        assert_eq!(value, "a\n\tA\"");
    }

    #[test]
    fn test_error_recovery_reports_multiple() {
        let errors = parse_errors("var = 1; fun (a) end; var ok = 2");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = parse_errors("1 + 2 = 3");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Invalid assignment target")));
    }

    #[test]
    fn test_super_requires_method_name() {
        let stmts = parse("class B is A fun m() return super.m() end end");
        assert!(matches!(stmts[0], Stmt::ClassDecl { .. }));
    }
}
