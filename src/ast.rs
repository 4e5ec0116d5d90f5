//! Statement and expression definitions plus the numbered line table

use std::collections::HashMap;

/// Expression types
#[derive(Clone, Debug)]
pub enum Expr {
    /// Numeric literal (all numbers are doubles)
    Number(f64),
    /// String literal
    Text(String),
    /// Variable reference; the sigil is part of the name
    Variable(String),
    /// `name(args)` - built-in call, user function call, or array read.
    /// Which one is decided at evaluation time, never at parse time.
    ArrayOrCall(String, Vec<Expr>),
    /// Explicit `FN name(args)` user-function call
    FnCall(String, Vec<Expr>),
    /// `base.field` on a user-type instance
    FieldAccess(Box<Expr>, String),
    /// Binary operation
    Binary(Box<Expr>, BinOp, Box<Expr>),
    /// Unary operation
    Unary(UnOp, Box<Expr>),
    /// Parenthesized expression
    Grouping(Box<Expr>),
}

/// Binary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add, Sub, Mul, Div, IntDiv, Mod, Pow,
    Eq, Ne, Lt, Le, Gt, Ge,
    And, Or, Xor, Eqv, Imp,
}

/// Unary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg, Not,
}

/// Declared element types for DIM ... AS and TYPE fields
#[derive(Clone, Debug, PartialEq)]
pub enum BasicType {
    Integer,
    Long,
    Single,
    Double,
    Str,
    /// `STRING * n` fixed-width string
    FixedStr(usize),
    /// A user-defined TYPE by name
    User(String),
}

/// Default-type classes installed by DEFINT/DEFLNG/DEFSNG/DEFDBL/DEFSTR
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefKind {
    Int, Lng, Sng, Dbl, Str,
}

/// One item of a PRINT list
#[derive(Clone, Debug)]
pub enum PrintItem {
    Expr(Expr),
    Tab(Expr),
    Spc(Expr),
    Comma,
    Semicolon,
}

/// One DIM / REDIM entry
#[derive(Clone, Debug)]
pub struct DimVar {
    pub name: String,
    pub dims: Vec<Expr>,
    pub as_type: Option<BasicType>,
}

/// One READ target, scalar or array element
#[derive(Clone, Debug)]
pub struct ReadTarget {
    pub name: String,
    pub indices: Option<Vec<Expr>>,
}

/// File open modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Input, Output, Append, Random,
}

/// EXIT scopes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitScope {
    For, Do, Sub, Function,
}

/// RESUME forms
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeKind {
    /// Re-run the faulting line
    Same,
    /// Continue with the line after the fault
    Next,
    /// Jump to a specific line
    Line(u32),
}

/// One SELECT CASE clause
#[derive(Clone, Debug)]
pub enum CaseClause {
    Value(Expr),
    Range(Expr, Expr),
    Is(BinOp, Expr),
}

/// PUT (graphics) raster operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutAction {
    Pset, Xor, Or, And,
}

/// Statement types. One per program line, or joined by colons into
/// [`Statement::Compound`].
#[derive(Clone, Debug)]
pub enum Statement {
    /// Comment-only or empty line
    Rem,
    /// Text label definition (`name:` at line start)
    Label(String),

    // ----- assignment -----
    Let { target: String, indices: Option<Vec<Expr>>, value: Expr },
    /// `a.b.c = expr` on a user-type instance
    FieldAssign { target: Expr, value: Expr },

    // ----- control flow -----
    Goto(u32),
    GotoLabel(String),
    Gosub(u32),
    GosubLabel(String),
    Return,
    /// Single-line IF carries real branches; the multi-line form carries
    /// [`Statement::BlockIfMarker`] as its then-branch.
    If { condition: Expr, then: Box<Statement>, else_: Option<Box<Statement>> },
    BlockIfMarker,
    ElseIf(Expr),
    Else,
    EndIf,
    For { var: String, start: Expr, end: Expr, step: Option<Expr> },
    Next(Option<String>),
    While(Expr),
    Wend,
    /// `until` distinguishes DO UNTIL from DO WHILE; `cond` is None for a
    /// bare DO
    Do { cond: Option<Expr>, until: bool },
    Loop { cond: Option<Expr>, until: bool },
    Exit(ExitScope),
    End,
    Stop,
    OnGoto { selector: Expr, targets: Vec<u32>, gosub: bool },
    /// `None` disables the handler (ON ERROR GOTO 0)
    OnErrorGoto(Option<u32>),
    Resume(ResumeKind),
    SelectCase(Expr),
    Case(Vec<CaseClause>),
    CaseElse,
    EndSelect,
    Sleep(Option<Expr>),

    // ----- console and file I/O -----
    Print { items: Vec<PrintItem> },
    PrintFile { channel: Expr, items: Vec<PrintItem> },
    PrintUsing { channel: Option<Expr>, format: Expr, args: Vec<Expr>, trailing: bool },
    Input { prompt: Option<String>, vars: Vec<ReadTarget> },
    InputFile { channel: Expr, vars: Vec<ReadTarget> },
    LineInput { prompt: Option<String>, var: String },
    LineInputFile { channel: Expr, var: String },
    Open { path: Expr, mode: OpenMode, number: Expr, record_len: Option<Expr> },
    /// Empty list closes every open file
    Close(Vec<Expr>),
    Write { channel: Option<Expr>, exprs: Vec<Expr> },
    Field { channel: Expr, fields: Vec<(Expr, String)> },
    GetRecord { channel: Expr, record: Option<Expr> },
    PutRecord { channel: Expr, record: Option<Expr> },
    Lset { var: String, value: Expr },
    Rset { var: String, value: Expr },
    Kill(Expr),
    NameFile { from: Expr, to: Expr },
    Files(Option<Expr>),

    // ----- data and declarations -----
    Dim(Vec<DimVar>),
    Redim { preserve: bool, arrays: Vec<DimVar> },
    /// Raw text after the DATA keyword, split at run start
    Data(String),
    Read(Vec<ReadTarget>),
    Restore(Option<u32>),
    Swap(String, String),
    Const(Vec<(String, Expr)>),
    TypeBegin(String),
    TypeField { name: String, ty: BasicType },
    EndType,
    DefType { ranges: Vec<(char, char)>, kind: DefKind },
    DefFn { name: String, params: Vec<String>, body: Expr },
    DefSeg(Option<Expr>),
    Declare,
    Sub { name: String, params: Vec<String> },
    EndSub,
    Function { name: String, params: Vec<String> },
    EndFunction,
    CallSub { name: String, args: Vec<Expr> },

    // ----- graphics -----
    Cls,
    Screen { mode: Expr, active: Option<Expr>, visual: Option<Expr> },
    Color { fg: Option<Expr>, bg: Option<Expr> },
    Locate { row: Option<Expr>, col: Option<Expr> },
    Pset { x: Expr, y: Expr, color: Option<Expr> },
    Preset { x: Expr, y: Expr, color: Option<Expr> },
    Line { from: Option<(Expr, Expr)>, to: (Expr, Expr), color: Option<Expr>, box_: bool, filled: bool },
    Circle { x: Expr, y: Expr, radius: Expr, color: Option<Expr>, start: Option<Expr>, end: Option<Expr>, aspect: Option<Expr> },
    Paint { x: Expr, y: Expr, fill: Option<Expr>, border: Option<Expr> },
    Draw(Expr),
    Palette { index: Option<Expr>, color: Option<Expr> },
    GetGraphics { x1: Expr, y1: Expr, x2: Expr, y2: Expr, array: String },
    PutGraphics { x: Expr, y: Expr, array: String, action: PutAction },

    // ----- sound -----
    Beep,
    Sound { freq: Expr, duration: Expr },
    Play(Expr),
    Randomize(Option<Expr>),

    /// Colon-joined statements on one line
    Compound(Vec<Statement>),
}

/// A program: `(line_number, statement)` pairs sorted ascending and unique
/// by line number, with an index map for O(1) jumps.
#[derive(Clone, Debug, Default)]
pub struct Program {
    lines: Vec<(u32, Statement)>,
    index: HashMap<u32, usize>,
}

impl Program {
    /// Build from unsorted `(line, statement)` pairs. A repeated line
    /// number replaces the earlier statement.
    pub fn from_lines(pairs: Vec<(u32, Statement)>) -> Self {
        let mut by_number: HashMap<u32, Statement> = HashMap::new();
        for (n, stmt) in pairs {
            by_number.insert(n, stmt);
        }
        let mut lines: Vec<(u32, Statement)> = by_number.into_iter().collect();
        lines.sort_by_key(|(n, _)| *n);
        let index = lines.iter().enumerate().map(|(i, (n, _))| (*n, i)).collect();
        Self { lines, index }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line number and statement at a table index.
    pub fn get(&self, pc: usize) -> Option<&(u32, Statement)> {
        self.lines.get(pc)
    }

    /// Line number at a table index.
    pub fn line_number(&self, pc: usize) -> u32 {
        self.lines.get(pc).map(|(n, _)| *n).unwrap_or(0)
    }

    /// Table index of a line number.
    pub fn index_of(&self, line: u32) -> Option<usize> {
        self.index.get(&line).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, Statement)> {
        self.lines.iter()
    }
}

impl Statement {
    /// The statements a scan sees on one line: a compound's members in
    /// order, or the statement itself.
    pub fn flatten(&self) -> &[Statement] {
        match self {
            Statement::Compound(list) => list,
            other => std::slice::from_ref(other),
        }
    }

    /// True for the multi-line IF opener.
    pub fn is_block_if(&self) -> bool {
        matches!(self, Statement::If { then, .. } if matches!(**then, Statement::BlockIfMarker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_sorts_and_indexes() {
        let prog = Program::from_lines(vec![
            (30, Statement::End),
            (10, Statement::Rem),
            (20, Statement::Rem),
        ]);
        assert_eq!(prog.len(), 3);
        assert_eq!(prog.line_number(0), 10);
        assert_eq!(prog.line_number(2), 30);
        assert_eq!(prog.index_of(20), Some(1));
        assert_eq!(prog.index_of(99), None);
    }

    #[test]
    fn duplicate_line_replaces() {
        let prog = Program::from_lines(vec![
            (10, Statement::Rem),
            (10, Statement::End),
        ]);
        assert_eq!(prog.len(), 1);
        assert!(matches!(prog.get(0), Some((10, Statement::End))));
    }
}
