//! BASIC parser - token stream to numbered line table

use crate::ast::*;
use crate::error::BasicError;
use crate::lexer::{Keyword, Token, TokenKind};

/// Function names callable without parentheses.
fn is_parameterless(name: &str) -> bool {
    matches!(
        name,
        "ERR" | "ERL" | "TIMER" | "INKEY$" | "RND" | "CSRLIN" | "FRE" | "DATE$" | "TIME$"
    )
}

/// Parser for BASIC: recursive descent over tokens, producing one
/// statement per numbered line.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source_lines: Vec<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, source: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            source_lines: source.lines().map(|l| l.to_string()).collect(),
        }
    }

    fn current(&self) -> &Token {
        static EOF: std::sync::OnceLock<Token> = std::sync::OnceLock::new();
        self.tokens.get(self.pos).unwrap_or_else(|| {
            EOF.get_or_init(|| Token::new(TokenKind::Eof, String::new(), None, 0))
        })
    }

    fn peek(&self) -> &TokenKind {
        &self.current().kind
    }

    fn peek_kind(&self) -> TokenKind {
        self.current().kind.clone()
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if *k == kw)
    }

    fn match_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Format a parse error with the line number and the offending source
    /// text.
    fn error(&self, msg: impl Into<String>) -> BasicError {
        let line = self.current().line;
        let mut message = msg.into();
        if let Some(text) = self.source_lines.get(line.saturating_sub(1) as usize) {
            message.push_str(&format!(": {}", text.trim()));
        }
        BasicError::Parse { message, line }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, BasicError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("Expected {}", what)))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword, what: &str) -> Result<(), BasicError> {
        if self.match_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("Expected {}", what)))
        }
    }

    /// Uppercased identifier, consumed.
    fn ident(&mut self, what: &str) -> Result<String, BasicError> {
        if self.check(&TokenKind::Identifier) {
            Ok(self.advance().lexeme.to_uppercase())
        } else {
            Err(self.error(format!("Expected {}", what)))
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Newline | TokenKind::Eof | TokenKind::Colon)
            || self.check_keyword(Keyword::Else)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// Parse the whole token stream into a line table.
    pub fn parse(&mut self) -> Result<Program, BasicError> {
        let mut pairs = Vec::new();

        loop {
            self.skip_newlines();
            if matches!(self.peek(), TokenKind::Eof) {
                break;
            }

            if !self.check(&TokenKind::Number) {
                return Err(self.error("Expected line number"));
            }
            let number = self.advance().number();
            if number < 1.0 || number.fract() != 0.0 {
                return Err(self.error("Bad line number"));
            }

            let stmt = self.parse_line_body()?;
            pairs.push((number as u32, stmt));
        }

        Ok(Program::from_lines(pairs))
    }

    /// Everything after the line number: colon-joined statements.
    fn parse_line_body(&mut self) -> Result<Statement, BasicError> {
        let mut stmts = Vec::new();
        let mut first = true;

        loop {
            while self.matches(&TokenKind::Colon) {}
            if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_statement(first)?);
            first = false;
            if !self.matches(&TokenKind::Colon) {
                break;
            }
        }

        if matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }

        Ok(match stmts.len() {
            0 => Statement::Rem,
            1 => stmts.pop().unwrap(),
            _ => Statement::Compound(stmts),
        })
    }

    fn parse_statement(&mut self, at_line_start: bool) -> Result<Statement, BasicError> {
        match self.peek_kind() {
            TokenKind::Keyword(kw) => self.parse_keyword_statement(kw),
            TokenKind::Identifier => self.parse_identifier_statement(at_line_start),
            _ => Err(self.error("Expected statement")),
        }
    }

    fn parse_keyword_statement(&mut self, kw: Keyword) -> Result<Statement, BasicError> {
        match kw {
            Keyword::Let => {
                self.advance();
                self.parse_assignment()
            }
            Keyword::Print => {
                self.advance();
                self.parse_print()
            }
            Keyword::Input => {
                self.advance();
                self.parse_input()
            }
            Keyword::If => {
                self.advance();
                self.parse_if()
            }
            Keyword::ElseIf => {
                self.advance();
                let cond = self.parse_expression()?;
                self.expect_keyword(Keyword::Then, "THEN")?;
                Ok(Statement::ElseIf(cond))
            }
            Keyword::Else => {
                self.advance();
                Ok(Statement::Else)
            }
            Keyword::EndIf => {
                self.advance();
                Ok(Statement::EndIf)
            }
            Keyword::For => {
                self.advance();
                self.parse_for()
            }
            Keyword::Next => {
                self.advance();
                // NEXT I, J closes two loops
                let mut vars = Vec::new();
                if self.check(&TokenKind::Identifier) {
                    vars.push(self.advance().lexeme.to_uppercase());
                    while self.matches(&TokenKind::Comma) {
                        vars.push(self.ident("variable after NEXT")?);
                    }
                }
                Ok(match vars.len() {
                    0 => Statement::Next(None),
                    1 => Statement::Next(vars.pop()),
                    _ => Statement::Compound(
                        vars.into_iter().map(|v| Statement::Next(Some(v))).collect(),
                    ),
                })
            }
            Keyword::While => {
                self.advance();
                Ok(Statement::While(self.parse_expression()?))
            }
            Keyword::Wend => {
                self.advance();
                Ok(Statement::Wend)
            }
            Keyword::Do => {
                self.advance();
                let (cond, until) = self.parse_loop_condition()?;
                Ok(Statement::Do { cond, until })
            }
            Keyword::Loop => {
                self.advance();
                let (cond, until) = self.parse_loop_condition()?;
                Ok(Statement::Loop { cond, until })
            }
            Keyword::Exit => {
                self.advance();
                self.parse_exit()
            }
            Keyword::Goto => {
                self.advance();
                self.parse_jump(false)
            }
            Keyword::Gosub => {
                self.advance();
                self.parse_jump(true)
            }
            Keyword::Return => {
                self.advance();
                Ok(Statement::Return)
            }
            Keyword::On => {
                self.advance();
                self.parse_on()
            }
            Keyword::Resume => {
                self.advance();
                self.parse_resume()
            }
            Keyword::Select => {
                self.advance();
                self.expect_keyword(Keyword::Case, "CASE after SELECT")?;
                Ok(Statement::SelectCase(self.parse_expression()?))
            }
            Keyword::Case => {
                self.advance();
                self.parse_case()
            }
            Keyword::End => {
                self.advance();
                self.parse_end()
            }
            Keyword::Stop => {
                self.advance();
                Ok(Statement::Stop)
            }
            Keyword::Sleep => {
                self.advance();
                let secs = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Statement::Sleep(secs))
            }
            Keyword::Dim => {
                self.advance();
                // DIM SHARED declares globals; scoping is flat here anyway
                self.match_keyword(Keyword::Shared);
                Ok(Statement::Dim(self.parse_dim_list()?))
            }
            Keyword::Redim => {
                self.advance();
                let preserve = self.match_keyword(Keyword::Preserve);
                Ok(Statement::Redim { preserve, arrays: self.parse_dim_list()? })
            }
            Keyword::Data => {
                let token = self.advance();
                Ok(Statement::Data(token.text()))
            }
            Keyword::Read => {
                self.advance();
                let mut targets = vec![self.parse_read_target()?];
                while self.matches(&TokenKind::Comma) {
                    targets.push(self.parse_read_target()?);
                }
                Ok(Statement::Read(targets))
            }
            Keyword::Restore => {
                self.advance();
                let line = if self.check(&TokenKind::Number) {
                    Some(self.advance().number() as u32)
                } else {
                    None
                };
                Ok(Statement::Restore(line))
            }
            Keyword::Swap => {
                self.advance();
                let a = self.ident("variable after SWAP")?;
                self.expect(TokenKind::Comma, "comma in SWAP")?;
                let b = self.ident("second variable in SWAP")?;
                Ok(Statement::Swap(a, b))
            }
            Keyword::Const => {
                self.advance();
                let mut entries = Vec::new();
                loop {
                    let name = self.ident("constant name")?;
                    self.expect(TokenKind::Equal, "= in CONST")?;
                    entries.push((name, self.parse_expression()?));
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
                Ok(Statement::Const(entries))
            }
            Keyword::Type => {
                self.advance();
                Ok(Statement::TypeBegin(self.ident("TYPE name")?))
            }
            Keyword::DefInt => {
                self.advance();
                self.parse_deftype(DefKind::Int)
            }
            Keyword::DefLng => {
                self.advance();
                self.parse_deftype(DefKind::Lng)
            }
            Keyword::DefSng => {
                self.advance();
                self.parse_deftype(DefKind::Sng)
            }
            Keyword::DefDbl => {
                self.advance();
                self.parse_deftype(DefKind::Dbl)
            }
            Keyword::DefStr => {
                self.advance();
                self.parse_deftype(DefKind::Str)
            }
            Keyword::Def => {
                self.advance();
                self.parse_def()
            }
            Keyword::Declare => {
                self.advance();
                while !self.at_statement_end() {
                    self.advance();
                }
                Ok(Statement::Declare)
            }
            Keyword::Shared | Keyword::Static => {
                // Scope declarations are inert in the flat namespace
                self.advance();
                while !self.at_statement_end() {
                    self.advance();
                }
                Ok(Statement::Declare)
            }
            Keyword::Sub => {
                self.advance();
                let name = self.ident("SUB name")?;
                let params = self.parse_param_list()?;
                self.match_keyword(Keyword::Static);
                Ok(Statement::Sub { name, params })
            }
            Keyword::Function => {
                self.advance();
                let name = self.ident("FUNCTION name")?;
                let params = self.parse_param_list()?;
                self.match_keyword(Keyword::Static);
                Ok(Statement::Function { name, params })
            }
            Keyword::Call => {
                self.advance();
                let name = self.ident("SUB name after CALL")?;
                let args = if self.matches(&TokenKind::LeftParen) {
                    let args = self.parse_argument_list()?;
                    self.expect(TokenKind::RightParen, ")")?;
                    args
                } else {
                    Vec::new()
                };
                Ok(Statement::CallSub { name, args })
            }

            // File I/O
            Keyword::Open => {
                self.advance();
                self.parse_open()
            }
            Keyword::Close => {
                self.advance();
                let mut channels = Vec::new();
                while !self.at_statement_end() {
                    self.matches(&TokenKind::Hash);
                    channels.push(self.parse_expression()?);
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
                Ok(Statement::Close(channels))
            }
            Keyword::Write => {
                self.advance();
                let channel = if self.matches(&TokenKind::Hash) {
                    let c = self.parse_expression()?;
                    self.matches(&TokenKind::Comma);
                    Some(c)
                } else {
                    None
                };
                let mut exprs = Vec::new();
                while !self.at_statement_end() {
                    exprs.push(self.parse_expression()?);
                    if !self.matches(&TokenKind::Comma) && !self.matches(&TokenKind::Semicolon) {
                        break;
                    }
                }
                Ok(Statement::Write { channel, exprs })
            }
            Keyword::Field => {
                self.advance();
                self.matches(&TokenKind::Hash);
                let channel = self.parse_expression()?;
                let mut fields = Vec::new();
                while self.matches(&TokenKind::Comma) {
                    let width = self.parse_expression()?;
                    self.expect_keyword(Keyword::As, "AS in FIELD")?;
                    fields.push((width, self.ident("field variable")?));
                }
                Ok(Statement::Field { channel, fields })
            }
            Keyword::Get => {
                self.advance();
                self.parse_get_put(true)
            }
            Keyword::Put => {
                self.advance();
                self.parse_get_put(false)
            }
            Keyword::Lset => {
                self.advance();
                let var = self.ident("variable after LSET")?;
                self.expect(TokenKind::Equal, "= in LSET")?;
                Ok(Statement::Lset { var, value: self.parse_expression()? })
            }
            Keyword::Rset => {
                self.advance();
                let var = self.ident("variable after RSET")?;
                self.expect(TokenKind::Equal, "= in RSET")?;
                Ok(Statement::Rset { var, value: self.parse_expression()? })
            }
            Keyword::Kill => {
                self.advance();
                Ok(Statement::Kill(self.parse_expression()?))
            }
            Keyword::Name => {
                self.advance();
                let from = self.parse_expression()?;
                self.expect_keyword(Keyword::As, "AS in NAME")?;
                Ok(Statement::NameFile { from, to: self.parse_expression()? })
            }
            Keyword::Files => {
                self.advance();
                let pattern = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Statement::Files(pattern))
            }

            // Graphics
            Keyword::Cls => {
                self.advance();
                Ok(Statement::Cls)
            }
            Keyword::Screen => {
                self.advance();
                let mode = self.parse_expression()?;
                let active = self.parse_optional_slot()?;
                let visual = self.parse_optional_slot()?;
                Ok(Statement::Screen { mode, active, visual })
            }
            Keyword::Color => {
                self.advance();
                let fg = if self.at_statement_end() || self.check(&TokenKind::Comma) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                let bg = self.parse_optional_slot()?;
                Ok(Statement::Color { fg, bg })
            }
            Keyword::Locate => {
                self.advance();
                let row = if self.at_statement_end() || self.check(&TokenKind::Comma) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                let col = self.parse_optional_slot()?;
                Ok(Statement::Locate { row, col })
            }
            Keyword::Pset => {
                self.advance();
                let (x, y) = self.parse_point()?;
                let color = self.parse_optional_slot()?;
                Ok(Statement::Pset { x, y, color })
            }
            Keyword::Preset => {
                self.advance();
                let (x, y) = self.parse_point()?;
                let color = self.parse_optional_slot()?;
                Ok(Statement::Preset { x, y, color })
            }
            Keyword::Line => {
                self.advance();
                if self.match_keyword(Keyword::Input) {
                    self.parse_line_input()
                } else {
                    self.parse_graphics_line()
                }
            }
            Keyword::Circle => {
                self.advance();
                let (x, y) = self.parse_point()?;
                self.expect(TokenKind::Comma, "comma after CIRCLE point")?;
                let radius = self.parse_expression()?;
                let color = self.parse_optional_slot()?;
                let start = self.parse_optional_slot()?;
                let end = self.parse_optional_slot()?;
                let aspect = self.parse_optional_slot()?;
                Ok(Statement::Circle { x, y, radius, color, start, end, aspect })
            }
            Keyword::Paint => {
                self.advance();
                let (x, y) = self.parse_point()?;
                let fill = self.parse_optional_slot()?;
                let border = self.parse_optional_slot()?;
                Ok(Statement::Paint { x, y, fill, border })
            }
            Keyword::Draw => {
                self.advance();
                Ok(Statement::Draw(self.parse_expression()?))
            }
            Keyword::Palette => {
                self.advance();
                if self.at_statement_end() {
                    Ok(Statement::Palette { index: None, color: None })
                } else {
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::Comma, "comma in PALETTE")?;
                    let color = self.parse_expression()?;
                    Ok(Statement::Palette { index: Some(index), color: Some(color) })
                }
            }

            // Sound
            Keyword::Beep => {
                self.advance();
                Ok(Statement::Beep)
            }
            Keyword::Sound => {
                self.advance();
                let freq = self.parse_expression()?;
                self.expect(TokenKind::Comma, "comma in SOUND")?;
                Ok(Statement::Sound { freq, duration: self.parse_expression()? })
            }
            Keyword::Play => {
                self.advance();
                Ok(Statement::Play(self.parse_expression()?))
            }
            Keyword::Randomize => {
                self.advance();
                let seed = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Statement::Randomize(seed))
            }

            _ => Err(self.error(format!("Unexpected keyword {:?}", kw))),
        }
    }

    /// `[, expr]` where the slot may be left empty before another comma.
    fn parse_optional_slot(&mut self) -> Result<Option<Expr>, BasicError> {
        if !self.matches(&TokenKind::Comma) {
            return Ok(None);
        }
        if self.check(&TokenKind::Comma) || self.at_statement_end() {
            return Ok(None);
        }
        Ok(Some(self.parse_expression()?))
    }

    /// `(x, y)`
    fn parse_point(&mut self) -> Result<(Expr, Expr), BasicError> {
        self.expect(TokenKind::LeftParen, "(")?;
        let x = self.parse_expression()?;
        self.expect(TokenKind::Comma, "comma in coordinate")?;
        let y = self.parse_expression()?;
        self.expect(TokenKind::RightParen, ")")?;
        Ok((x, y))
    }

    fn parse_loop_condition(&mut self) -> Result<(Option<Expr>, bool), BasicError> {
        if self.match_keyword(Keyword::While) {
            Ok((Some(self.parse_expression()?), false))
        } else if self.match_keyword(Keyword::Until) {
            Ok((Some(self.parse_expression()?), true))
        } else {
            Ok((None, false))
        }
    }

    fn parse_exit(&mut self) -> Result<Statement, BasicError> {
        let scope = if self.match_keyword(Keyword::For) {
            ExitScope::For
        } else if self.match_keyword(Keyword::Do) {
            ExitScope::Do
        } else if self.match_keyword(Keyword::Sub) {
            ExitScope::Sub
        } else if self.match_keyword(Keyword::Function) {
            ExitScope::Function
        } else {
            return Err(self.error("Expected FOR, DO, SUB, or FUNCTION after EXIT"));
        };
        Ok(Statement::Exit(scope))
    }

    fn parse_jump(&mut self, gosub: bool) -> Result<Statement, BasicError> {
        if self.check(&TokenKind::Number) {
            let n = self.advance().number() as u32;
            Ok(if gosub { Statement::Gosub(n) } else { Statement::Goto(n) })
        } else if self.check(&TokenKind::Identifier) {
            let name = self.advance().lexeme.to_uppercase();
            Ok(if gosub {
                Statement::GosubLabel(name)
            } else {
                Statement::GotoLabel(name)
            })
        } else {
            Err(self.error("Expected line number or label"))
        }
    }

    fn parse_on(&mut self) -> Result<Statement, BasicError> {
        if self.match_keyword(Keyword::Error) {
            self.expect_keyword(Keyword::Goto, "GOTO after ON ERROR")?;
            let line = self.expect(TokenKind::Number, "line number")?.number() as u32;
            return Ok(Statement::OnErrorGoto(if line == 0 { None } else { Some(line) }));
        }

        let selector = self.parse_expression()?;
        let gosub = if self.match_keyword(Keyword::Goto) {
            false
        } else if self.match_keyword(Keyword::Gosub) {
            true
        } else {
            return Err(self.error("Expected GOTO or GOSUB after ON"));
        };
        let mut targets = Vec::new();
        loop {
            targets.push(self.expect(TokenKind::Number, "line number")?.number() as u32);
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::OnGoto { selector, targets, gosub })
    }

    fn parse_resume(&mut self) -> Result<Statement, BasicError> {
        if self.match_keyword(Keyword::Next) {
            Ok(Statement::Resume(ResumeKind::Next))
        } else if self.check(&TokenKind::Number) {
            let n = self.advance().number() as u32;
            Ok(Statement::Resume(if n == 0 {
                ResumeKind::Same
            } else {
                ResumeKind::Line(n)
            }))
        } else {
            Ok(Statement::Resume(ResumeKind::Same))
        }
    }

    fn parse_case(&mut self) -> Result<Statement, BasicError> {
        if self.match_keyword(Keyword::Else) {
            return Ok(Statement::CaseElse);
        }
        let mut clauses = Vec::new();
        loop {
            if self.match_keyword(Keyword::Is) {
                let op = match self.peek() {
                    TokenKind::Equal => BinOp::Eq,
                    TokenKind::NotEqual => BinOp::Ne,
                    TokenKind::Less => BinOp::Lt,
                    TokenKind::LessEqual => BinOp::Le,
                    TokenKind::Greater => BinOp::Gt,
                    TokenKind::GreaterEqual => BinOp::Ge,
                    _ => return Err(self.error("Expected relational operator after IS")),
                };
                self.advance();
                clauses.push(CaseClause::Is(op, self.parse_expression()?));
            } else {
                let from = self.parse_expression()?;
                if self.match_keyword(Keyword::To) {
                    clauses.push(CaseClause::Range(from, self.parse_expression()?));
                } else {
                    clauses.push(CaseClause::Value(from));
                }
            }
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Case(clauses))
    }

    /// `END` alone stops the program; followed by a block keyword it is
    /// that block's terminator.
    fn parse_end(&mut self) -> Result<Statement, BasicError> {
        if self.match_keyword(Keyword::If) {
            Ok(Statement::EndIf)
        } else if self.match_keyword(Keyword::Sub) {
            Ok(Statement::EndSub)
        } else if self.match_keyword(Keyword::Function) {
            Ok(Statement::EndFunction)
        } else if self.match_keyword(Keyword::Type) {
            Ok(Statement::EndType)
        } else if self.match_keyword(Keyword::Select) {
            Ok(Statement::EndSelect)
        } else {
            Ok(Statement::End)
        }
    }

    fn parse_if(&mut self) -> Result<Statement, BasicError> {
        let condition = self.parse_expression()?;

        // IF cond GOTO n shorthand
        if self.match_keyword(Keyword::Goto) {
            let then = Box::new(self.parse_jump(false)?);
            let else_ = self.parse_inline_else()?;
            return Ok(Statement::If { condition, then, else_ });
        }

        self.expect_keyword(Keyword::Then, "THEN")?;

        // THEN at end of line opens the multi-line form
        if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            return Ok(Statement::If {
                condition,
                then: Box::new(Statement::BlockIfMarker),
                else_: None,
            });
        }

        // THEN <number> is a GOTO shorthand
        let then = if self.check(&TokenKind::Number) {
            Box::new(Statement::Goto(self.advance().number() as u32))
        } else {
            Box::new(self.parse_inline_branch()?)
        };
        let else_ = self.parse_inline_else()?;
        Ok(Statement::If { condition, then, else_ })
    }

    fn parse_inline_else(&mut self) -> Result<Option<Box<Statement>>, BasicError> {
        if !self.match_keyword(Keyword::Else) {
            return Ok(None);
        }
        if self.check(&TokenKind::Number) {
            return Ok(Some(Box::new(Statement::Goto(self.advance().number() as u32))));
        }
        Ok(Some(Box::new(self.parse_inline_branch()?)))
    }

    /// Colon-joined statements up to ELSE or end of line, for single-line
    /// IF branches.
    fn parse_inline_branch(&mut self) -> Result<Statement, BasicError> {
        let mut stmts = vec![self.parse_statement(false)?];
        while self.matches(&TokenKind::Colon) {
            if self.at_statement_end() {
                break;
            }
            stmts.push(self.parse_statement(false)?);
        }
        Ok(if stmts.len() == 1 {
            stmts.pop().unwrap()
        } else {
            Statement::Compound(stmts)
        })
    }

    fn parse_for(&mut self) -> Result<Statement, BasicError> {
        let var = self.ident("variable after FOR")?;
        self.expect(TokenKind::Equal, "= in FOR")?;
        let start = self.parse_expression()?;
        self.expect_keyword(Keyword::To, "TO")?;
        let end = self.parse_expression()?;
        let step = if self.match_keyword(Keyword::Step) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::For { var, start, end, step })
    }

    fn parse_print(&mut self) -> Result<Statement, BasicError> {
        let channel = if self.matches(&TokenKind::Hash) {
            let c = self.parse_expression()?;
            self.matches(&TokenKind::Comma);
            Some(c)
        } else {
            None
        };

        if self.match_keyword(Keyword::Using) {
            let format = self.parse_expression()?;
            self.expect(TokenKind::Semicolon, "semicolon after USING format")?;
            let mut args = Vec::new();
            let mut trailing = false;
            while !self.at_statement_end() {
                args.push(self.parse_expression()?);
                if self.matches(&TokenKind::Semicolon) || self.matches(&TokenKind::Comma) {
                    if self.at_statement_end() {
                        trailing = true;
                        break;
                    }
                } else {
                    break;
                }
            }
            return Ok(Statement::PrintUsing { channel, format, args, trailing });
        }

        let mut items = Vec::new();
        while !self.at_statement_end() {
            match self.peek() {
                TokenKind::Comma => {
                    self.advance();
                    items.push(PrintItem::Comma);
                }
                TokenKind::Semicolon => {
                    self.advance();
                    items.push(PrintItem::Semicolon);
                }
                TokenKind::Identifier
                    if self.current().lexeme.eq_ignore_ascii_case("TAB")
                        && matches!(self.peek_at(1), TokenKind::LeftParen) =>
                {
                    self.advance();
                    self.advance();
                    let col = self.parse_expression()?;
                    self.expect(TokenKind::RightParen, ")")?;
                    items.push(PrintItem::Tab(col));
                }
                TokenKind::Identifier
                    if self.current().lexeme.eq_ignore_ascii_case("SPC")
                        && matches!(self.peek_at(1), TokenKind::LeftParen) =>
                {
                    self.advance();
                    self.advance();
                    let n = self.parse_expression()?;
                    self.expect(TokenKind::RightParen, ")")?;
                    items.push(PrintItem::Spc(n));
                }
                _ => items.push(PrintItem::Expr(self.parse_expression()?)),
            }
        }

        Ok(match channel {
            Some(channel) => Statement::PrintFile { channel, items },
            None => Statement::Print { items },
        })
    }

    fn parse_input(&mut self) -> Result<Statement, BasicError> {
        if self.matches(&TokenKind::Hash) {
            let channel = self.parse_expression()?;
            self.expect(TokenKind::Comma, "comma after file number")?;
            let mut vars = vec![self.parse_read_target()?];
            while self.matches(&TokenKind::Comma) {
                vars.push(self.parse_read_target()?);
            }
            return Ok(Statement::InputFile { channel, vars });
        }

        // A leading semicolon suppresses the echo newline; inert here
        self.matches(&TokenKind::Semicolon);

        let prompt = if self.check(&TokenKind::Text) {
            let p = self.advance().text();
            if self.matches(&TokenKind::Semicolon) {
                Some(format!("{}? ", p))
            } else {
                self.matches(&TokenKind::Comma);
                Some(p)
            }
        } else {
            None
        };

        let mut vars = vec![self.parse_read_target()?];
        while self.matches(&TokenKind::Comma) {
            vars.push(self.parse_read_target()?);
        }
        Ok(Statement::Input { prompt, vars })
    }

    fn parse_line_input(&mut self) -> Result<Statement, BasicError> {
        if self.matches(&TokenKind::Hash) {
            let channel = self.parse_expression()?;
            self.expect(TokenKind::Comma, "comma after file number")?;
            let var = self.ident("variable in LINE INPUT")?;
            return Ok(Statement::LineInputFile { channel, var });
        }

        self.matches(&TokenKind::Semicolon);
        let prompt = if self.check(&TokenKind::Text) {
            let p = self.advance().text();
            if !self.matches(&TokenKind::Semicolon) {
                self.matches(&TokenKind::Comma);
            }
            Some(p)
        } else {
            None
        };
        let var = self.ident("variable in LINE INPUT")?;
        Ok(Statement::LineInput { prompt, var })
    }

    /// Graphics LINE: `[(x1,y1)]-(x2,y2) [,color] [,B|BF]`
    fn parse_graphics_line(&mut self) -> Result<Statement, BasicError> {
        let from = if self.check(&TokenKind::Minus) {
            None
        } else {
            Some(self.parse_point()?)
        };
        self.expect(TokenKind::Minus, "- in LINE")?;
        let to = self.parse_point()?;

        let mut color = None;
        let mut box_ = false;
        let mut filled = false;

        if self.matches(&TokenKind::Comma) {
            if !self.check(&TokenKind::Comma) && !self.at_statement_end() {
                color = Some(self.parse_expression()?);
            }
            if self.matches(&TokenKind::Comma) {
                let flag = self.ident("B or BF")?;
                match flag.as_str() {
                    "B" => box_ = true,
                    "BF" => {
                        box_ = true;
                        filled = true;
                    }
                    _ => return Err(self.error("Expected B or BF")),
                }
            }
        }

        Ok(Statement::Line { from, to, color, box_, filled })
    }

    /// GET/PUT: a `(` means the graphics form, otherwise the record form.
    fn parse_get_put(&mut self, is_get: bool) -> Result<Statement, BasicError> {
        if self.check(&TokenKind::LeftParen) {
            if is_get {
                let (x1, y1) = self.parse_point()?;
                self.expect(TokenKind::Minus, "- in GET")?;
                let (x2, y2) = self.parse_point()?;
                self.expect(TokenKind::Comma, "comma before array")?;
                let array = self.parse_sprite_array()?;
                Ok(Statement::GetGraphics { x1, y1, x2, y2, array })
            } else {
                let (x, y) = self.parse_point()?;
                self.expect(TokenKind::Comma, "comma before array")?;
                let array = self.parse_sprite_array()?;
                let action = if self.matches(&TokenKind::Comma) {
                    match self.peek_kind() {
                        TokenKind::Keyword(Keyword::Xor) => { self.advance(); PutAction::Xor }
                        TokenKind::Keyword(Keyword::Or) => { self.advance(); PutAction::Or }
                        TokenKind::Keyword(Keyword::And) => { self.advance(); PutAction::And }
                        TokenKind::Keyword(Keyword::Pset) => { self.advance(); PutAction::Pset }
                        TokenKind::Keyword(Keyword::Preset) => { self.advance(); PutAction::Pset }
                        _ => return Err(self.error("Expected PSET, XOR, OR, or AND")),
                    }
                } else {
                    PutAction::Xor
                };
                Ok(Statement::PutGraphics { x, y, array, action })
            }
        } else {
            self.matches(&TokenKind::Hash);
            let channel = self.parse_expression()?;
            let record = if self.matches(&TokenKind::Comma) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            Ok(if is_get {
                Statement::GetRecord { channel, record }
            } else {
                Statement::PutRecord { channel, record }
            })
        }
    }

    fn parse_sprite_array(&mut self) -> Result<String, BasicError> {
        let name = self.ident("array name")?;
        if self.matches(&TokenKind::LeftParen) {
            // Ignore a start-index subscript; the whole array is the sprite
            while !self.check(&TokenKind::RightParen) && !self.at_statement_end() {
                self.advance();
            }
            self.expect(TokenKind::RightParen, ")")?;
        }
        Ok(name)
    }

    fn parse_open(&mut self) -> Result<Statement, BasicError> {
        let path = self.parse_expression()?;
        self.expect_keyword(Keyword::For, "FOR in OPEN")?;
        let mode = if self.match_keyword(Keyword::Input) {
            OpenMode::Input
        } else if self.match_keyword(Keyword::Output) {
            OpenMode::Output
        } else if self.match_keyword(Keyword::Append) {
            OpenMode::Append
        } else if self.match_keyword(Keyword::Random) {
            OpenMode::Random
        } else {
            return Err(self.error("Expected INPUT, OUTPUT, APPEND, or RANDOM"));
        };
        self.expect_keyword(Keyword::As, "AS in OPEN")?;
        self.matches(&TokenKind::Hash);
        let number = self.parse_expression()?;
        let record_len = if self.check(&TokenKind::Identifier)
            && self.current().lexeme.eq_ignore_ascii_case("LEN")
        {
            self.advance();
            self.expect(TokenKind::Equal, "= after LEN")?;
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::Open { path, mode, number, record_len })
    }

    fn parse_dim_list(&mut self) -> Result<Vec<DimVar>, BasicError> {
        let mut vars = Vec::new();
        loop {
            let name = self.ident("variable name in DIM")?;
            let dims = if self.matches(&TokenKind::LeftParen) {
                let mut dims = vec![self.parse_expression()?];
                while self.matches(&TokenKind::Comma) {
                    dims.push(self.parse_expression()?);
                }
                self.expect(TokenKind::RightParen, ")")?;
                dims
            } else {
                Vec::new()
            };
            let as_type = if self.match_keyword(Keyword::As) {
                Some(self.parse_type_name()?)
            } else {
                None
            };
            vars.push(DimVar { name, dims, as_type });
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        Ok(vars)
    }

    fn parse_type_name(&mut self) -> Result<BasicType, BasicError> {
        if self.match_keyword(Keyword::Integer) {
            Ok(BasicType::Integer)
        } else if self.match_keyword(Keyword::Long) {
            Ok(BasicType::Long)
        } else if self.match_keyword(Keyword::Single) {
            Ok(BasicType::Single)
        } else if self.match_keyword(Keyword::Double) {
            Ok(BasicType::Double)
        } else if self.match_keyword(Keyword::StringType) {
            if self.matches(&TokenKind::Star) {
                let width = self.expect(TokenKind::Number, "string width")?.number();
                Ok(BasicType::FixedStr(width as usize))
            } else {
                Ok(BasicType::Str)
            }
        } else if self.check(&TokenKind::Identifier) {
            Ok(BasicType::User(self.advance().lexeme.to_uppercase()))
        } else {
            Err(self.error("Expected type name"))
        }
    }

    fn parse_deftype(&mut self, kind: DefKind) -> Result<Statement, BasicError> {
        let mut ranges = Vec::new();
        loop {
            let from = self.ident("letter range")?;
            let from_c = from.chars().next().unwrap_or('A');
            let to_c = if self.matches(&TokenKind::Minus) {
                self.ident("letter range")?.chars().next().unwrap_or(from_c)
            } else {
                from_c
            };
            ranges.push((from_c, to_c));
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::DefType { ranges, kind })
    }

    /// `DEF SEG [= expr]`, `DEF FN name(params) = expr`, and the
    /// contracted `DEF FNname(params) = expr`.
    fn parse_def(&mut self) -> Result<Statement, BasicError> {
        if self.check(&TokenKind::Identifier) && self.current().lexeme.eq_ignore_ascii_case("SEG") {
            self.advance();
            let addr = if self.matches(&TokenKind::Equal) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            return Ok(Statement::DefSeg(addr));
        }

        let name = if self.match_keyword(Keyword::Fn) {
            format!("FN{}", self.ident("function name after FN")?)
        } else if self.check(&TokenKind::Identifier) {
            let raw = self.advance().lexeme.to_uppercase();
            if !raw.starts_with("FN") {
                return Err(self.error("DEF FN name must start with FN"));
            }
            raw
        } else {
            return Err(self.error("Expected FN after DEF"));
        };

        let params = self.parse_param_list()?;
        self.expect(TokenKind::Equal, "= in DEF FN")?;
        let body = self.parse_expression()?;
        Ok(Statement::DefFn { name, params, body })
    }

    fn parse_param_list(&mut self) -> Result<Vec<String>, BasicError> {
        let mut params = Vec::new();
        if self.matches(&TokenKind::LeftParen) {
            if !self.check(&TokenKind::RightParen) {
                loop {
                    let name = self.ident("parameter name")?;
                    // `a()` marks an array parameter; the shape of the
                    // argument decides the binding either way
                    if self.matches(&TokenKind::LeftParen) {
                        self.expect(TokenKind::RightParen, ")")?;
                    }
                    if self.match_keyword(Keyword::As) {
                        self.parse_type_name()?;
                    }
                    params.push(name);
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RightParen, ")")?;
        }
        Ok(params)
    }

    fn parse_read_target(&mut self) -> Result<ReadTarget, BasicError> {
        let name = self.ident("variable name")?;
        let indices = if self.matches(&TokenKind::LeftParen) {
            let mut indices = vec![self.parse_expression()?];
            while self.matches(&TokenKind::Comma) {
                indices.push(self.parse_expression()?);
            }
            self.expect(TokenKind::RightParen, ")")?;
            Some(indices)
        } else {
            None
        };
        Ok(ReadTarget { name, indices })
    }

    /// A line starting with a bare identifier: label definition, TYPE
    /// field, assignment, or argument-style SUB call.
    fn parse_identifier_statement(&mut self, at_line_start: bool) -> Result<Statement, BasicError> {
        // Label definition: identifier directly followed by a colon, at
        // line start only. The colon stays put; the line loop treats it
        // as a statement separator.
        if at_line_start && matches!(self.peek_at(1), TokenKind::Colon) {
            let name = self.ident("label")?;
            return Ok(Statement::Label(name));
        }

        // TYPE field line: `name AS type`
        if matches!(self.peek_at(1), TokenKind::Keyword(Keyword::As)) {
            let name = self.ident("field name")?;
            self.advance(); // AS
            let ty = self.parse_type_name()?;
            return Ok(Statement::TypeField { name, ty });
        }

        // Try an assignment; fall back to a parenless CALL
        let save = self.pos;
        if let Some(stmt) = self.try_parse_assignment()? {
            return Ok(stmt);
        }
        self.pos = save;

        let name = self.ident("statement")?;
        let mut args = Vec::new();
        if !self.at_statement_end() {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(Statement::CallSub { name, args })
    }

    /// Assignment lookahead: `name [(indices)] [.field]* = expr`. Returns
    /// None (without consuming the `=`-less forms) when this is not an
    /// assignment.
    fn try_parse_assignment(&mut self) -> Result<Option<Statement>, BasicError> {
        let name = self.ident("variable")?;

        let indices = if self.matches(&TokenKind::LeftParen) {
            let mut indices = Vec::new();
            if !self.check(&TokenKind::RightParen) {
                loop {
                    indices.push(self.parse_expression()?);
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            if !self.matches(&TokenKind::RightParen) {
                return Ok(None);
            }
            Some(indices)
        } else {
            None
        };

        if self.check(&TokenKind::Dot) {
            // Field-assignment chain on a scalar or element
            let mut target = match &indices {
                Some(idx) => Expr::ArrayOrCall(name, idx.clone()),
                None => Expr::Variable(name),
            };
            while self.matches(&TokenKind::Dot) {
                let field = self.ident("field name")?;
                target = Expr::FieldAccess(Box::new(target), field);
            }
            if !self.matches(&TokenKind::Equal) {
                return Ok(None);
            }
            let value = self.parse_expression()?;
            return Ok(Some(Statement::FieldAssign { target, value }));
        }

        if !self.matches(&TokenKind::Equal) {
            return Ok(None);
        }
        let value = self.parse_expression()?;
        Ok(Some(Statement::Let { target: name, indices, value }))
    }

    fn parse_assignment(&mut self) -> Result<Statement, BasicError> {
        let save = self.pos;
        match self.try_parse_assignment()? {
            Some(stmt) => Ok(stmt),
            None => {
                self.pos = save;
                Err(self.error("Expected assignment"))
            }
        }
    }

    // ----- expressions -----

    /// Classic precedence, lowest first: IMP EQV XOR OR AND NOT,
    /// relational, additive, MOD, \, multiplicative, ^, unary.
    pub fn parse_expression(&mut self) -> Result<Expr, BasicError> {
        self.parse_imp()
    }

    fn parse_imp(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_eqv()?;
        while self.match_keyword(Keyword::Imp) {
            let right = self.parse_eqv()?;
            left = Expr::Binary(Box::new(left), BinOp::Imp, Box::new(right));
        }
        Ok(left)
    }

    fn parse_eqv(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_xor()?;
        while self.match_keyword(Keyword::Eqv) {
            let right = self.parse_xor()?;
            left = Expr::Binary(Box::new(left), BinOp::Eqv, Box::new(right));
        }
        Ok(left)
    }

    fn parse_xor(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_or()?;
        while self.match_keyword(Keyword::Xor) {
            let right = self.parse_or()?;
            left = Expr::Binary(Box::new(left), BinOp::Xor, Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_and()?;
        while self.match_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_not()?;
        while self.match_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = Expr::Binary(Box::new(left), BinOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, BasicError> {
        if self.match_keyword(Keyword::Not) {
            let operand = self.parse_not()?;
            Ok(Expr::Unary(UnOp::Not, Box::new(operand)))
        } else {
            self.parse_relational()
        }
    }

    /// Relational operators are nonassociative: at most one per level.
    fn parse_relational(&mut self) -> Result<Expr, BasicError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            TokenKind::Equal => BinOp::Eq,
            TokenKind::NotEqual => BinOp::Ne,
            TokenKind::Less => BinOp::Lt,
            TokenKind::LessEqual => BinOp::Le,
            TokenKind::Greater => BinOp::Gt,
            TokenKind::GreaterEqual => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(Box::new(left), op, Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_mod()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mod()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_mod(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_int_div()?;
        while self.match_keyword(Keyword::Mod) {
            let right = self.parse_int_div()?;
            left = Expr::Binary(Box::new(left), BinOp::Mod, Box::new(right));
        }
        Ok(left)
    }

    fn parse_int_div(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_multiplicative()?;
        while self.matches(&TokenKind::Backslash) {
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(Box::new(left), BinOp::IntDiv, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, BasicError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, BasicError> {
        let base = self.parse_unary()?;
        if self.matches(&TokenKind::Caret) {
            let exponent = self.parse_power()?; // Right associative
            Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)))
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, BasicError> {
        match self.peek() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(UnOp::Neg, Box::new(operand)))
            }
            TokenKind::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_postfix(),
        }
    }

    /// Primary with a trailing `.field` chain.
    fn parse_postfix(&mut self) -> Result<Expr, BasicError> {
        let mut expr = self.parse_primary()?;
        while self.matches(&TokenKind::Dot) {
            let field = self.ident("field name")?;
            expr = Expr::FieldAccess(Box::new(expr), field);
        }
        Ok(expr)
    }

    fn parse_argument_list(&mut self) -> Result<Vec<Expr>, BasicError> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                // A file-number argument may carry its # prefix
                self.matches(&TokenKind::Hash);
                args.push(self.parse_expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, BasicError> {
        match self.peek_kind() {
            TokenKind::Number => {
                let n = self.advance().number();
                Ok(Expr::Number(n))
            }
            TokenKind::Text => {
                let s = self.advance().text();
                Ok(Expr::Text(s))
            }
            TokenKind::Keyword(Keyword::Fn) => {
                self.advance();
                let name = format!("FN{}", self.ident("function name after FN")?);
                let args = if self.matches(&TokenKind::LeftParen) {
                    let args = self.parse_argument_list()?;
                    self.expect(TokenKind::RightParen, ")")?;
                    args
                } else {
                    Vec::new()
                };
                Ok(Expr::FnCall(name, args))
            }
            TokenKind::Identifier => {
                let name = self.advance().lexeme.to_uppercase();
                if self.matches(&TokenKind::LeftParen) {
                    let args = self.parse_argument_list()?;
                    self.expect(TokenKind::RightParen, ")")?;
                    // Built-in, user function, or array: the evaluator
                    // resolves it
                    Ok(Expr::ArrayOrCall(name, args))
                } else if is_parameterless(&name) {
                    Ok(Expr::ArrayOrCall(name, Vec::new()))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RightParen, ")")?;
                Ok(Expr::Grouping(Box::new(expr)))
            }
            _ => Err(self.error("Unexpected token in expression")),
        }
    }
}

/// Convenience: lex and parse one source text, auto-numbering at 10-line
/// intervals when no line carries a number.
pub fn parse_source(source: &str) -> Result<Program, BasicError> {
    parse_source_with_step(source, 10)
}

/// Like [`parse_source`] with a configurable auto-number step.
pub fn parse_source_with_step(source: &str, step: u32) -> Result<Program, BasicError> {
    let numbered = source.lines().any(|l| {
        l.trim_start().chars().next().is_some_and(|c| c.is_ascii_digit())
    });
    let owned;
    let text: &str = if numbered {
        source
    } else {
        owned = source
            .lines()
            .enumerate()
            .map(|(i, l)| format!("{} {}", (i as u32 + 1) * step.max(1), l))
            .collect::<Vec<_>>()
            .join("\n");
        &owned
    };

    let tokens = crate::lexer::Lexer::new(text).tokenize()?;
    Parser::new(tokens, text).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_source(src).expect("parse")
    }

    fn first(src: &str) -> Statement {
        let prog = parse(src);
        prog.get(0).unwrap().1.clone()
    }

    #[test]
    fn line_numbers_order_the_table() {
        let prog = parse("30 END\n10 PRINT \"A\"\n20 GOTO 30");
        assert_eq!(prog.line_number(0), 10);
        assert_eq!(prog.line_number(1), 20);
        assert_eq!(prog.line_number(2), 30);
    }

    #[test]
    fn unnumbered_source_is_auto_numbered() {
        let prog = parse("PRINT \"A\"\nPRINT \"B\"");
        assert_eq!(prog.line_number(0), 10);
        assert_eq!(prog.line_number(1), 20);
    }

    #[test]
    fn colon_joins_into_compound() {
        let stmt = first("10 A = 1 : B = 2 : PRINT A");
        match stmt {
            Statement::Compound(list) => assert_eq!(list.len(), 3),
            other => panic!("expected compound, got {:?}", other),
        }
    }

    #[test]
    fn block_if_gets_marker() {
        let stmt = first("10 IF X > 0 THEN\n20 PRINT 1\n30 END IF");
        assert!(stmt.is_block_if());
    }

    #[test]
    fn single_line_if_keeps_branches() {
        let stmt = first("10 IF X THEN PRINT 1 ELSE PRINT 2");
        match stmt {
            Statement::If { then, else_, .. } => {
                assert!(matches!(*then, Statement::Print { .. }));
                assert!(matches!(else_.as_deref(), Some(Statement::Print { .. })));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn if_then_line_number_is_goto() {
        let stmt = first("10 IF X THEN 100");
        match stmt {
            Statement::If { then, .. } => assert!(matches!(*then, Statement::Goto(100))),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn line_keyword_disambiguates() {
        assert!(matches!(
            first("10 LINE INPUT A$"),
            Statement::LineInput { .. }
        ));
        assert!(matches!(
            first("10 LINE (0,0)-(10,10),14,BF"),
            Statement::Line { filled: true, box_: true, .. }
        ));
        assert!(matches!(
            first("10 LINE -(10,10)"),
            Statement::Line { from: None, .. }
        ));
    }

    #[test]
    fn line_with_empty_color_slot() {
        match first("10 LINE (0,0)-(5,5),,B") {
            Statement::Line { color, box_, filled, .. } => {
                assert!(color.is_none());
                assert!(box_);
                assert!(!filled);
            }
            other => panic!("expected line, got {:?}", other),
        }
    }

    #[test]
    fn get_put_disambiguate() {
        assert!(matches!(
            first("10 GET (0,0)-(7,7), SPRITE"),
            Statement::GetGraphics { .. }
        ));
        assert!(matches!(
            first("10 GET #1, 5"),
            Statement::GetRecord { .. }
        ));
        assert!(matches!(
            first("10 PUT (3,4), SPRITE, XOR"),
            Statement::PutGraphics { action: PutAction::Xor, .. }
        ));
        assert!(matches!(
            first("10 PUT #2"),
            Statement::PutRecord { record: None, .. }
        ));
    }

    #[test]
    fn bare_identifier_forms() {
        assert!(matches!(first("10 MYLABEL:"), Statement::Label(_)));
        assert!(matches!(
            first("10 A = 5"),
            Statement::Let { indices: None, .. }
        ));
        assert!(matches!(
            first("10 A(3) = 5"),
            Statement::Let { indices: Some(_), .. }
        ));
        assert!(matches!(
            first("10 P.X = 5"),
            Statement::FieldAssign { .. }
        ));
        assert!(matches!(
            first("10 DOTHING 1, 2"),
            Statement::CallSub { .. }
        ));
    }

    #[test]
    fn end_variants() {
        assert!(matches!(first("10 END"), Statement::End));
        assert!(matches!(first("10 END IF"), Statement::EndIf));
        assert!(matches!(first("10 END SELECT"), Statement::EndSelect));
        assert!(matches!(first("10 END SUB"), Statement::EndSub));
    }

    #[test]
    fn def_fn_forms() {
        match first("10 DEF FN DOUBLE(X) = X * 2") {
            Statement::DefFn { name, params, .. } => {
                assert_eq!(name, "FNDOUBLE");
                assert_eq!(params, vec!["X"]);
            }
            other => panic!("expected def fn, got {:?}", other),
        }
        assert!(matches!(
            first("10 DEF FNHALF(X) = X / 2"),
            Statement::DefFn { .. }
        ));
        assert!(matches!(first("10 DEF SEG = 100"), Statement::DefSeg(Some(_))));
    }

    #[test]
    fn precedence_power_binds_tighter_than_mul() {
        // 2 * 3 ^ 2 parses as 2 * (3 ^ 2)
        match first("10 A = 2 * 3 ^ 2") {
            Statement::Let { value, .. } => match value {
                Expr::Binary(_, BinOp::Mul, right) => {
                    assert!(matches!(*right, Expr::Binary(_, BinOp::Pow, _)));
                }
                other => panic!("expected mul at top, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn precedence_mod_binds_tighter_than_add() {
        match first("10 A = 1 + 7 MOD 3") {
            Statement::Let { value, .. } => match value {
                Expr::Binary(_, BinOp::Add, right) => {
                    assert!(matches!(*right, Expr::Binary(_, BinOp::Mod, _)));
                }
                other => panic!("expected add at top, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn array_or_call_is_deferred() {
        match first("10 A = FOO(3)") {
            Statement::Let { value, .. } => {
                assert!(matches!(value, Expr::ArrayOrCall(name, _) if name == "FOO"));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn parenless_zero_arg_functions() {
        match first("10 A = RND") {
            Statement::Let { value, .. } => {
                assert!(matches!(value, Expr::ArrayOrCall(name, args) if name == "RND" && args.is_empty()));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn select_case_clauses() {
        let prog = parse("10 SELECT CASE X\n20 CASE 1, 3 TO 5, IS > 9\n30 CASE ELSE\n40 END SELECT");
        match &prog.get(1).unwrap().1 {
            Statement::Case(clauses) => {
                assert_eq!(clauses.len(), 3);
                assert!(matches!(clauses[0], CaseClause::Value(_)));
                assert!(matches!(clauses[1], CaseClause::Range(_, _)));
                assert!(matches!(clauses[2], CaseClause::Is(BinOp::Gt, _)));
            }
            other => panic!("expected case, got {:?}", other),
        }
        assert!(matches!(prog.get(2).unwrap().1, Statement::CaseElse));
    }

    #[test]
    fn open_statement() {
        match first("10 OPEN \"DATA.TXT\" FOR RANDOM AS #1 LEN = 32") {
            Statement::Open { mode, record_len, .. } => {
                assert_eq!(mode, OpenMode::Random);
                assert!(record_len.is_some());
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn print_using_parses() {
        match first("10 PRINT USING \"##.#\"; X; Y") {
            Statement::PrintUsing { args, trailing, .. } => {
                assert_eq!(args.len(), 2);
                assert!(!trailing);
            }
            other => panic!("expected print using, got {:?}", other),
        }
    }

    #[test]
    fn type_block_lines() {
        let prog = parse("10 TYPE POINT\n20 X AS SINGLE\n30 Y AS SINGLE\n40 END TYPE");
        assert!(matches!(prog.get(0).unwrap().1, Statement::TypeBegin(_)));
        assert!(matches!(prog.get(1).unwrap().1, Statement::TypeField { .. }));
        assert!(matches!(prog.get(3).unwrap().1, Statement::EndType));
    }

    #[test]
    fn parse_error_carries_line_and_text() {
        let err = parse_source("10 FOR = 5").unwrap_err();
        match err {
            BasicError::Parse { line, message } => {
                assert_eq!(line, 1);
                assert!(message.contains("FOR"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn on_error_and_on_goto() {
        assert!(matches!(
            first("10 ON ERROR GOTO 100"),
            Statement::OnErrorGoto(Some(100))
        ));
        assert!(matches!(
            first("10 ON ERROR GOTO 0"),
            Statement::OnErrorGoto(None)
        ));
        match first("10 ON X GOSUB 100, 200") {
            Statement::OnGoto { targets, gosub, .. } => {
                assert_eq!(targets, vec![100, 200]);
                assert!(gosub);
            }
            other => panic!("expected on goto, got {:?}", other),
        }
    }
}
