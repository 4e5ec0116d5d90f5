//! BASIC evaluator: tree-walks the numbered line table and owns all
//! runtime state, with generator-based execution for clean yield/resume
//! semantics

use crate::ast::*;
use crate::builtins;
use crate::console::{BufferConsole, Console, Display};
use crate::error::{BasicError, ErrorCode};
use crate::files::FileTable;
use crate::format;
use crate::graphics::Graphics;
use genawaiter::rc::{Co, Gen};
use genawaiter::GeneratorState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Driver tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Statements executed between cooperative yields in `run_async`
    pub yield_every: usize,
    /// Line-number step for auto-numbering unnumbered sources
    pub auto_number_step: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { yield_every: 2000, auto_number_step: 10 }
    }
}

/// A BASIC value. Numbers are doubles throughout; integer-typed variables
/// round on store. Arrays and user-type instances are handles into the
/// evaluator's heaps.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Array(usize),
    Instance(usize),
}

impl Value {
    /// Numeric coercion; text must parse or the operation is fatal.
    pub fn as_number(&self) -> Result<f64, ErrorCode> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Text(s) => s.trim().parse().map_err(|_| ErrorCode::TypeMismatch),
            _ => Err(ErrorCode::TypeMismatch),
        }
    }

    pub fn as_text(&self) -> Result<&str, ErrorCode> {
        match self {
            Value::Text(s) => Ok(s),
            _ => Err(ErrorCode::TypeMismatch),
        }
    }

    /// Zero is false, any nonzero number is true.
    pub fn is_true(&self) -> Result<bool, ErrorCode> {
        Ok(self.as_number()? != 0.0)
    }

    /// PRINT form: classic spacing around numbers, text verbatim.
    pub fn print_form(&self) -> String {
        match self {
            Value::Number(n) => format::print_number(*n),
            Value::Text(s) => s.clone(),
            _ => String::new(),
        }
    }

    /// Bare text form, used for concatenation and WRITE.
    pub fn text_form(&self) -> String {
        match self {
            Value::Number(n) => format::number_digits(*n),
            Value::Text(s) => s.clone(),
            _ => String::new(),
        }
    }
}

/// Storage class of a variable or array element, derived from the sigil,
/// a DIM ... AS clause, or a DEFtype range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElemKind {
    Number,
    Integer,
    Long,
    Text,
    Instance,
}

/// An array: upper bounds per axis, flat row-major elements.
#[derive(Clone, Debug)]
pub struct ArrayObj {
    pub dims: Vec<usize>,
    pub elements: Vec<Value>,
    pub kind: ElemKind,
}

impl ArrayObj {
    fn cell_count(dims: &[usize]) -> usize {
        dims.iter().map(|d| d + 1).product()
    }

    /// Row-major flat index; any axis outside `[0, upper]` is fatal.
    fn flat_index(&self, indices: &[f64]) -> Result<usize, ErrorCode> {
        if indices.len() != self.dims.len() {
            return Err(ErrorCode::SubscriptOutOfRange);
        }
        let mut at = 0usize;
        for (axis, &raw) in indices.iter().enumerate() {
            let i = raw.round() as i64;
            if i < 0 || i as usize > self.dims[axis] {
                return Err(ErrorCode::SubscriptOutOfRange);
            }
            at = at * (self.dims[axis] + 1) + i as usize;
        }
        Ok(at)
    }
}

/// A SUB or FUNCTION registered by the run-start scan.
#[derive(Clone, Debug)]
struct RoutineDef {
    params: Vec<String>,
    start_pc: usize,
}

/// One active FOR loop.
#[derive(Clone, Debug)]
struct ForState {
    var: String,
    end: f64,
    step: f64,
    for_pc: usize,
}

/// Where execution goes after a statement.
enum Flow {
    Continue,
    Goto(u32),
    GotoIndex(usize),
    End,
}

/// Internal interpreter state, shared between the generator and the
/// driver.
pub struct InterpreterState {
    // Environment
    pub(crate) variables: HashMap<String, Value>,
    arrays: HashMap<String, usize>,
    array_heap: Vec<ArrayObj>,
    constants: HashMap<String, Value>,
    user_types: HashMap<String, Vec<(String, BasicType)>>,
    instances: Vec<(String, HashMap<String, Value>)>,
    def_types: HashMap<char, DefKind>,
    declared_kinds: HashMap<String, ElemKind>,
    user_functions: HashMap<String, (Vec<String>, Expr)>,
    subs: HashMap<String, RoutineDef>,
    functions: HashMap<String, RoutineDef>,
    labels: HashMap<String, usize>,

    // Program position
    pc: usize,
    end_program: bool,
    current_line: u32,

    // Stacks
    gosub_stack: Vec<u32>,
    for_stack: Vec<ForState>,
    while_stack: Vec<usize>,
    do_stack: Vec<usize>,
    select_stack: Vec<Value>,
    sub_stack: Vec<usize>,

    // DATA
    data_pool: Vec<(u32, Value)>,
    data_cursor: usize,

    // Random numbers
    rng: StdRng,
    last_rnd: f64,

    // Error state
    on_error_target: Option<u32>,
    in_handler: bool,
    resume_line: Option<u32>,
    pub(crate) last_error_code: u32,
    pub(crate) last_error_line: u32,

    // Collaborators and devices
    pub(crate) files: FileTable,
    pub(crate) graphics: Graphics,
    console: Box<dyn Console>,
    display: Option<Box<dyn Display>>,

    // Execution control
    stop_flag: Arc<AtomicBool>,
    running: bool,
    error: Option<BasicError>,
    console_col: usize,
}

impl InterpreterState {
    fn new(console: Box<dyn Console>) -> Self {
        Self {
            variables: HashMap::new(),
            arrays: HashMap::new(),
            array_heap: Vec::new(),
            constants: HashMap::new(),
            user_types: HashMap::new(),
            instances: Vec::new(),
            def_types: HashMap::new(),
            declared_kinds: HashMap::new(),
            user_functions: HashMap::new(),
            subs: HashMap::new(),
            functions: HashMap::new(),
            labels: HashMap::new(),
            pc: 0,
            end_program: false,
            current_line: 0,
            gosub_stack: Vec::new(),
            for_stack: Vec::new(),
            while_stack: Vec::new(),
            do_stack: Vec::new(),
            select_stack: Vec::new(),
            sub_stack: Vec::new(),
            data_pool: Vec::new(),
            data_cursor: 0,
            rng: StdRng::seed_from_u64(0x1989),
            last_rnd: 0.0,
            on_error_target: None,
            in_handler: false,
            resume_line: None,
            last_error_code: 0,
            last_error_line: 0,
            files: FileTable::new(),
            graphics: Graphics::new(),
            console,
            display: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: false,
            error: None,
            console_col: 0,
        }
    }

    /// Clear everything back to a fresh machine; open files are closed.
    fn reset(&mut self) {
        self.variables.clear();
        self.arrays.clear();
        self.array_heap.clear();
        self.constants.clear();
        self.user_types.clear();
        self.instances.clear();
        self.def_types.clear();
        self.declared_kinds.clear();
        self.user_functions.clear();
        self.subs.clear();
        self.functions.clear();
        self.labels.clear();
        self.pc = 0;
        self.end_program = false;
        self.current_line = 0;
        self.gosub_stack.clear();
        self.for_stack.clear();
        self.while_stack.clear();
        self.do_stack.clear();
        self.select_stack.clear();
        self.sub_stack.clear();
        self.data_pool.clear();
        self.data_cursor = 0;
        self.rng = StdRng::seed_from_u64(0x1989);
        self.last_rnd = 0.0;
        self.on_error_target = None;
        self.in_handler = false;
        self.resume_line = None;
        self.last_error_code = 0;
        self.last_error_line = 0;
        self.files.close_all();
        self.graphics = Graphics::new();
        self.stop_flag.store(false, Ordering::Relaxed);
        self.running = false;
        self.error = None;
        self.console_col = 0;
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    // ----- console / graphics text plumbing -----

    fn print_str(&mut self, text: &str) {
        if self.graphics.mode() > 0 {
            self.graphics.print_text(text, false);
        } else {
            self.console.write(text);
            self.console_col += text.chars().count();
        }
    }

    fn print_newline(&mut self) {
        if self.graphics.mode() > 0 {
            self.graphics.print_text("", true);
        } else {
            self.console.write_line("");
            self.console_col = 0;
        }
    }

    fn print_line(&mut self, text: &str) {
        self.print_str(text);
        self.print_newline();
    }

    /// Current 0-based print column.
    fn print_col(&self) -> usize {
        if self.graphics.mode() > 0 {
            self.graphics.cursor().1 as usize - 1
        } else {
            self.console_col
        }
    }

    /// Non-blocking key: display first, then terminal.
    pub(crate) fn read_key(&mut self) -> String {
        if let Some(display) = &mut self.display {
            if display.key_available() {
                return display.read_key();
            }
        }
        self.console.read_key()
    }

    // ----- random numbers -----

    pub(crate) fn rnd(&mut self, arg: Option<f64>) -> f64 {
        match arg {
            Some(x) if x < 0.0 => {
                self.rng = StdRng::seed_from_u64(x.to_bits());
                self.next_rnd()
            }
            Some(x) if x == 0.0 => self.last_rnd,
            _ => self.next_rnd(),
        }
    }

    fn next_rnd(&mut self) -> f64 {
        self.last_rnd = self.rng.gen::<f64>();
        self.last_rnd
    }

    // ----- variables -----

    /// Storage class of a name: sigil first, then DIM AS, then DEFtype.
    fn name_kind(&self, name: &str) -> ElemKind {
        match name.chars().last() {
            Some('$') => ElemKind::Text,
            Some('%') => ElemKind::Integer,
            Some('&') => ElemKind::Long,
            Some('!') | Some('#') => ElemKind::Number,
            _ => {
                if let Some(k) = self.declared_kinds.get(name) {
                    *k
                } else {
                    match name.chars().next().and_then(|c| self.def_types.get(&c)) {
                        Some(DefKind::Int) => ElemKind::Integer,
                        Some(DefKind::Lng) => ElemKind::Long,
                        Some(DefKind::Str) => ElemKind::Text,
                        Some(DefKind::Sng) | Some(DefKind::Dbl) => ElemKind::Number,
                        None => ElemKind::Number,
                    }
                }
            }
        }
    }

    fn default_value(&self, kind: ElemKind) -> Value {
        match kind {
            ElemKind::Text => Value::Text(String::new()),
            _ => Value::Number(0.0),
        }
    }

    /// Coerce a value into a storage class. Integer classes truncate
    /// toward zero; a 16-bit integer out of range overflows.
    fn coerce(&self, kind: ElemKind, value: Value) -> Result<Value, ErrorCode> {
        match (kind, value) {
            (ElemKind::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (ElemKind::Text, _) => Err(ErrorCode::TypeMismatch),
            (ElemKind::Instance, v @ Value::Instance(_)) => Ok(v),
            (_, Value::Instance(h)) => Ok(Value::Instance(h)),
            (ElemKind::Integer, Value::Number(n)) => {
                let t = n.trunc();
                if !(-32768.0..=32767.0).contains(&t) {
                    Err(ErrorCode::Overflow)
                } else {
                    Ok(Value::Number(t))
                }
            }
            (ElemKind::Long, Value::Number(n)) => Ok(Value::Number(n.trunc())),
            (ElemKind::Number, Value::Number(n)) => Ok(Value::Number(n)),
            _ => Err(ErrorCode::TypeMismatch),
        }
    }

    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), ErrorCode> {
        let kind = self.name_kind(name);
        let coerced = self.coerce(kind, value)?;
        self.variables.insert(name.to_string(), coerced);
        Ok(())
    }

    /// Constants shadow variables; unknown names read as their type's
    /// zero value.
    fn get_variable(&self, name: &str) -> Value {
        if let Some(v) = self.constants.get(name) {
            return v.clone();
        }
        if let Some(v) = self.variables.get(name) {
            return v.clone();
        }
        self.default_value(self.name_kind(name))
    }

    // ----- arrays -----

    fn new_array(&mut self, name: &str, dims: Vec<usize>, kind: ElemKind, type_name: Option<&str>) -> Result<usize, ErrorCode> {
        let count = ArrayObj::cell_count(&dims);
        let elements = match (kind, type_name) {
            (ElemKind::Instance, Some(t)) => {
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let h = self.create_instance(t)?;
                    cells.push(Value::Instance(h));
                }
                cells
            }
            _ => vec![self.default_value(kind); count],
        };
        let handle = self.array_heap.len();
        self.array_heap.push(ArrayObj { dims, elements, kind });
        self.arrays.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// First touch of an undimensioned array gives bounds 0..10 on each
    /// referenced axis. A compatibility contract, not an error.
    fn array_handle_or_create(&mut self, name: &str, axes: usize) -> Result<usize, ErrorCode> {
        if let Some(h) = self.arrays.get(name) {
            return Ok(*h);
        }
        let kind = self.name_kind(name);
        self.new_array(name, vec![10; axes.max(1)], kind, None)
    }

    fn get_array_element(&mut self, name: &str, indices: &[f64]) -> Result<Value, ErrorCode> {
        let h = self.array_handle_or_create(name, indices.len())?;
        let arr = &self.array_heap[h];
        let at = arr.flat_index(indices)?;
        Ok(arr.elements[at].clone())
    }

    fn set_array_element(&mut self, name: &str, indices: &[f64], value: Value) -> Result<(), ErrorCode> {
        let h = self.array_handle_or_create(name, indices.len())?;
        let kind = self.array_heap[h].kind;
        let coerced = self.coerce(kind, value)?;
        let arr = &mut self.array_heap[h];
        let at = arr.flat_index(indices)?;
        arr.elements[at] = coerced;
        Ok(())
    }

    // ----- user types -----

    fn create_instance(&mut self, type_name: &str) -> Result<usize, ErrorCode> {
        let fields = self
            .user_types
            .get(type_name)
            .cloned()
            .ok_or(ErrorCode::TypeMismatch)?;
        let mut map = HashMap::new();
        for (fname, ty) in &fields {
            let v = match ty {
                BasicType::Str => Value::Text(String::new()),
                BasicType::FixedStr(w) => Value::Text(" ".repeat(*w)),
                BasicType::User(t) => {
                    let h = self.create_instance(t)?;
                    Value::Instance(h)
                }
                _ => Value::Number(0.0),
            };
            map.insert(fname.clone(), v);
        }
        self.instances.push((type_name.to_string(), map));
        Ok(self.instances.len() - 1)
    }

    fn set_instance_field(&mut self, handle: usize, field: &str, value: Value) -> Result<(), ErrorCode> {
        let type_name = self.instances.get(handle).ok_or(ErrorCode::TypeMismatch)?.0.clone();
        let fields = self.user_types.get(&type_name).ok_or(ErrorCode::TypeMismatch)?;
        let ty = fields
            .iter()
            .find(|(n, _)| n == field)
            .map(|(_, t)| t.clone())
            .ok_or(ErrorCode::Syntax)?;
        let coerced = match ty {
            BasicType::Str => Value::Text(value.as_text()?.to_string()),
            BasicType::FixedStr(w) => {
                let mut s: String = value.as_text()?.chars().take(w).collect();
                while s.chars().count() < w {
                    s.push(' ');
                }
                Value::Text(s)
            }
            BasicType::Integer => {
                let t = value.as_number()?.trunc();
                if !(-32768.0..=32767.0).contains(&t) {
                    return Err(ErrorCode::Overflow);
                }
                Value::Number(t)
            }
            BasicType::Long => Value::Number(value.as_number()?.trunc()),
            BasicType::Single | BasicType::Double => Value::Number(value.as_number()?),
            BasicType::User(_) => value,
        };
        self.instances[handle].1.insert(field.to_string(), coerced);
        Ok(())
    }

    // ----- cancellation and errors -----

    /// Route a runtime fault through ON ERROR, or surface it. Returns
    /// true when execution continues in a handler.
    fn handle_fault(&mut self, program: &Program, code: ErrorCode) -> bool {
        if code == ErrorCode::Break {
            self.print_line("Break");
            self.end_program = true;
            return false;
        }

        self.last_error_code = code.code();
        self.last_error_line = self.current_line;

        if let Some(target) = self.on_error_target {
            if !self.in_handler {
                if let Some(idx) = program.index_of(target) {
                    log::debug!("error {} in line {}, entering handler {}", code.code(), self.current_line, target);
                    self.resume_line = Some(self.current_line);
                    self.in_handler = true;
                    self.pc = idx;
                    return true;
                }
            }
        }

        self.print_line(&format!("?{} at line {}", code.message(), self.current_line));
        self.error = Some(BasicError::Runtime { code, line: self.current_line });
        self.end_program = true;
        false
    }
}

// ----- scanning helpers over the line table -----

fn line_stmts(program: &Program, pc: usize) -> &[Statement] {
    program.get(pc).map(|(_, s)| s.flatten()).unwrap_or(&[])
}

/// Walk statements from just after `(pc, offset)`, feeding each to `f`
/// with its position. `f` returns Some(result) to stop.
fn scan_from<T>(
    program: &Program,
    pc: usize,
    offset: usize,
    mut f: impl FnMut(usize, usize, &Statement) -> Option<T>,
) -> Option<T> {
    let mut j = pc;
    let mut begin = offset + 1;
    while j < program.len() {
        let stmts = line_stmts(program, j);
        for (k, stmt) in stmts.iter().enumerate().skip(begin) {
            if let Some(r) = f(j, k, stmt) {
                return Some(r);
            }
        }
        j += 1;
        begin = 0;
    }
    None
}

/// Find the WEND matching a WHILE, honoring nesting.
fn find_wend(program: &Program, pc: usize, offset: usize) -> Option<usize> {
    let mut depth = 0i32;
    scan_from(program, pc, offset, |j, _, stmt| match stmt {
        Statement::While(_) => {
            depth += 1;
            None
        }
        Statement::Wend => {
            if depth == 0 {
                Some(j)
            } else {
                depth -= 1;
                None
            }
        }
        _ => None,
    })
}

/// Find the LOOP matching a DO.
fn find_loop(program: &Program, pc: usize, offset: usize) -> Option<usize> {
    let mut depth = 0i32;
    scan_from(program, pc, offset, |j, _, stmt| match stmt {
        Statement::Do { .. } => {
            depth += 1;
            None
        }
        Statement::Loop { .. } => {
            if depth == 0 {
                Some(j)
            } else {
                depth -= 1;
                None
            }
        }
        _ => None,
    })
}

/// Find the NEXT closing the innermost open FOR.
fn find_next(program: &Program, pc: usize, offset: usize) -> Option<usize> {
    let mut depth = 0i32;
    scan_from(program, pc, offset, |j, _, stmt| match stmt {
        Statement::For { .. } => {
            depth += 1;
            None
        }
        Statement::Next(_) => {
            if depth == 0 {
                Some(j)
            } else {
                depth -= 1;
                None
            }
        }
        _ => None,
    })
}

/// Find the END IF closing a block IF, honoring nested block IFs.
fn find_end_if(program: &Program, pc: usize, offset: usize) -> Option<usize> {
    let mut depth = 0i32;
    scan_from(program, pc, offset, |j, _, stmt| {
        if stmt.is_block_if() {
            depth += 1;
            None
        } else if matches!(stmt, Statement::EndIf) {
            if depth == 0 {
                Some(j)
            } else {
                depth -= 1;
                None
            }
        } else {
            None
        }
    })
}

/// Find the END SELECT closing a SELECT CASE.
fn find_end_select(program: &Program, pc: usize, offset: usize) -> Option<usize> {
    let mut depth = 0i32;
    scan_from(program, pc, offset, |j, _, stmt| match stmt {
        Statement::SelectCase(_) => {
            depth += 1;
            None
        }
        Statement::EndSelect => {
            if depth == 0 {
                Some(j)
            } else {
                depth -= 1;
                None
            }
        }
        _ => None,
    })
}

/// Find the terminator of a SUB or FUNCTION body.
fn find_routine_end(program: &Program, pc: usize) -> Option<usize> {
    scan_from(program, pc, 0, |j, _, stmt| {
        matches!(stmt, Statement::EndSub | Statement::EndFunction).then_some(j)
    })
}

// ----- expression evaluation -----

fn eval_list(
    state: &mut InterpreterState,
    program: &Program,
    exprs: &[Expr],
) -> Result<Vec<Value>, ErrorCode> {
    exprs.iter().map(|e| eval(state, program, e)).collect()
}

fn eval_numbers(
    state: &mut InterpreterState,
    program: &Program,
    exprs: &[Expr],
) -> Result<Vec<f64>, ErrorCode> {
    exprs
        .iter()
        .map(|e| eval(state, program, e)?.as_number())
        .collect()
}

fn compare(left: &Value, right: &Value, op: BinOp) -> Result<bool, ErrorCode> {
    let ord = match (left, right) {
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Text(_), _) | (_, Value::Text(_)) => return Err(ErrorCode::TypeMismatch),
        _ => left
            .as_number()?
            .partial_cmp(&right.as_number()?)
            .unwrap_or(std::cmp::Ordering::Equal),
    };
    Ok(match op {
        BinOp::Eq => ord.is_eq(),
        BinOp::Ne => ord.is_ne(),
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        BinOp::Ge => ord.is_ge(),
        _ => return Err(ErrorCode::TypeMismatch),
    })
}

fn bool_value(b: bool) -> Value {
    Value::Number(if b { -1.0 } else { 0.0 })
}

pub(crate) fn eval(
    state: &mut InterpreterState,
    program: &Program,
    expr: &Expr,
) -> Result<Value, ErrorCode> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Text(s) => Ok(Value::Text(s.clone())),
        Expr::Grouping(inner) => eval(state, program, inner),

        Expr::Variable(name) => Ok(state.get_variable(name)),

        Expr::FieldAccess(base, field) => {
            let v = eval(state, program, base)?;
            match v {
                Value::Instance(h) => state
                    .instances
                    .get(h)
                    .and_then(|(_, map)| map.get(field))
                    .cloned()
                    .ok_or(ErrorCode::Syntax),
                _ => Err(ErrorCode::TypeMismatch),
            }
        }

        Expr::Unary(op, operand) => {
            let v = eval(state, program, operand)?;
            match op {
                UnOp::Neg => Ok(Value::Number(-v.as_number()?)),
                UnOp::Not => {
                    let n = v.as_number()?.round() as i64;
                    Ok(Value::Number(!n as f64))
                }
            }
        }

        Expr::Binary(left, op, right) => {
            let l = eval(state, program, left)?;
            let r = eval(state, program, right)?;
            eval_binary(&l, *op, &r)
        }

        Expr::FnCall(name, args) => {
            if state.user_functions.contains_key(name) {
                call_def_fn(state, program, name, args)
            } else {
                Err(ErrorCode::IllegalFunctionCall)
            }
        }

        Expr::ArrayOrCall(name, args) => {
            // Resolution order: user routine, built-in, array read
            if state.functions.contains_key(name) {
                return run_function(state, program, name, args);
            }
            if state.user_functions.contains_key(name) {
                return call_def_fn(state, program, name, args);
            }
            match name.as_str() {
                "UBOUND" | "LBOUND" => return eval_bound(state, name, args),
                _ => {}
            }
            if builtins::is_builtin(name) {
                let values = eval_list(state, program, args)?;
                return builtins::call(state, name, &values);
            }
            let indices = eval_numbers(state, program, args)?;
            state.get_array_element(name, &indices)
        }
    }
}

fn eval_binary(l: &Value, op: BinOp, r: &Value) -> Result<Value, ErrorCode> {
    match op {
        BinOp::Add => match (l, r) {
            (Value::Text(_), _) | (_, Value::Text(_)) => {
                Ok(Value::Text(format!("{}{}", l.text_form(), r.text_form())))
            }
            _ => Ok(Value::Number(l.as_number()? + r.as_number()?)),
        },
        BinOp::Sub => Ok(Value::Number(l.as_number()? - r.as_number()?)),
        BinOp::Mul => Ok(Value::Number(l.as_number()? * r.as_number()?)),
        BinOp::Div => {
            let d = r.as_number()?;
            if d == 0.0 {
                return Err(ErrorCode::DivisionByZero);
            }
            Ok(Value::Number(l.as_number()? / d))
        }
        BinOp::IntDiv => {
            let a = l.as_number()?.round() as i64;
            let b = r.as_number()?.round() as i64;
            if b == 0 {
                return Err(ErrorCode::DivisionByZero);
            }
            Ok(Value::Number((a / b) as f64))
        }
        BinOp::Mod => {
            let a = l.as_number()?.round() as i64;
            let b = r.as_number()?.round() as i64;
            if b == 0 {
                return Err(ErrorCode::DivisionByZero);
            }
            Ok(Value::Number((a % b) as f64))
        }
        BinOp::Pow => Ok(Value::Number(l.as_number()?.powf(r.as_number()?))),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            Ok(bool_value(compare(l, r, op)?))
        }
        // Logical operators work on the bit patterns of the rounded
        // operands
        BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eqv | BinOp::Imp => {
            let a = l.as_number()?.round() as i64;
            let b = r.as_number()?.round() as i64;
            let n = match op {
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Eqv => !(a ^ b),
                BinOp::Imp => !a | b,
                _ => unreachable!(),
            };
            Ok(Value::Number(n as f64))
        }
    }
}

fn eval_bound(
    state: &mut InterpreterState,
    name: &str,
    args: &[Expr],
) -> Result<Value, ErrorCode> {
    let array_name = match args.first() {
        Some(Expr::Variable(n)) | Some(Expr::ArrayOrCall(n, _)) => n.clone(),
        _ => return Err(ErrorCode::IllegalFunctionCall),
    };
    if name == "LBOUND" {
        return Ok(Value::Number(0.0));
    }
    let h = state.array_handle_or_create(&array_name, 1)?;
    Ok(Value::Number(state.array_heap[h].dims[0] as f64))
}

/// DEF FN call: parameters shadow variables only for the body expression.
fn call_def_fn(
    state: &mut InterpreterState,
    program: &Program,
    name: &str,
    args: &[Expr],
) -> Result<Value, ErrorCode> {
    let (params, body) = state.user_functions.get(name).cloned().unwrap();
    let values = eval_list(state, program, args)?;

    let mut saved = Vec::new();
    for (param, value) in params.iter().zip(values) {
        saved.push((param.clone(), state.variables.get(param).cloned()));
        state.set_variable(param, value)?;
    }
    let result = eval(state, program, &body);
    for (param, old) in saved {
        match old {
            Some(v) => {
                state.variables.insert(param, v);
            }
            None => {
                state.variables.remove(&param);
            }
        }
    }
    result
}

/// Bind call arguments into the flat variable map; an argument that names
/// an array binds its handle so callee writes reach the caller.
fn bind_params(
    state: &mut InterpreterState,
    program: &Program,
    params: &[String],
    args: &[Expr],
) -> Result<(), ErrorCode> {
    for (param, arg) in params.iter().zip(args) {
        let array_name = match arg {
            Expr::Variable(n) if state.arrays.contains_key(n) && !state.variables.contains_key(n) => Some(n),
            Expr::ArrayOrCall(n, inner) if inner.is_empty() && state.arrays.contains_key(n) => Some(n),
            _ => None,
        };
        if let Some(n) = array_name {
            let h = state.arrays[n];
            state.arrays.insert(param.clone(), h);
            continue;
        }
        let v = eval(state, program, arg)?;
        state.set_variable(param, v)?;
    }
    Ok(())
}

/// Run a FUNCTION body to its END FUNCTION and return the value of the
/// variable sharing the function's name.
fn run_function(
    state: &mut InterpreterState,
    program: &Program,
    name: &str,
    args: &[Expr],
) -> Result<Value, ErrorCode> {
    let def = state.functions.get(name).cloned().unwrap();
    bind_params(state, program, &def.params, args)?;
    state.variables.remove(name);

    let entry_depth = state.sub_stack.len();
    let mut pc = def.start_pc + 1;

    while pc < program.len() {
        if state.stopped() {
            return Err(ErrorCode::Break);
        }
        let (line, stmt) = program.get(pc).unwrap();
        let done = state.sub_stack.len() == entry_depth
            && matches!(
                stmt,
                Statement::EndFunction
                    | Statement::EndSub
                    | Statement::Exit(ExitScope::Function)
                    | Statement::Exit(ExitScope::Sub)
            );
        if done {
            break;
        }
        state.current_line = *line;
        match exec_statement(state, program, pc, 0, stmt)? {
            Flow::Continue => pc += 1,
            Flow::GotoIndex(i) => pc = i,
            Flow::Goto(target) => {
                pc = program.index_of(target).ok_or(ErrorCode::UndefinedLine)?;
            }
            Flow::End => {
                state.end_program = true;
                break;
            }
        }
    }

    Ok(state.get_variable(name))
}

// ----- statement execution -----

/// Execute one statement. `offset` is its position within a colon-joined
/// line, so terminator scans can start just past it.
fn exec_statement(
    state: &mut InterpreterState,
    program: &Program,
    pc: usize,
    offset: usize,
    stmt: &Statement,
) -> Result<Flow, ErrorCode> {
    match stmt {
        Statement::Rem
        | Statement::Label(_)
        | Statement::Data(_)
        | Statement::Declare
        | Statement::DefSeg(_)
        | Statement::BlockIfMarker
        | Statement::TypeField { .. }
        | Statement::EndType
        | Statement::EndIf => Ok(Flow::Continue),

        Statement::Compound(list) => {
            for (k, sub) in list.iter().enumerate() {
                match exec_statement(state, program, pc, k, sub)? {
                    Flow::Continue => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Continue)
        }

        // ----- assignment -----
        Statement::Let { target, indices, value } => {
            let v = eval(state, program, value)?;
            match indices {
                None => state.set_variable(target, v)?,
                Some(idx) => {
                    let indices = eval_numbers(state, program, idx)?;
                    state.set_array_element(target, &indices, v)?;
                }
            }
            Ok(Flow::Continue)
        }

        Statement::FieldAssign { target, value } => {
            let v = eval(state, program, value)?;
            let (base, field) = match target {
                Expr::FieldAccess(base, field) => (base, field),
                _ => return Err(ErrorCode::Syntax),
            };
            match eval(state, program, base)? {
                Value::Instance(h) => state.set_instance_field(h, field, v)?,
                _ => return Err(ErrorCode::TypeMismatch),
            }
            Ok(Flow::Continue)
        }

        Statement::Const(entries) => {
            for (name, expr) in entries {
                let v = eval(state, program, expr)?;
                state.constants.insert(name.clone(), v);
            }
            Ok(Flow::Continue)
        }

        Statement::Swap(a, b) => {
            if state.name_kind(a) != state.name_kind(b) {
                return Err(ErrorCode::TypeMismatch);
            }
            let va = state.get_variable(a);
            let vb = state.get_variable(b);
            state.set_variable(a, vb)?;
            state.set_variable(b, va)?;
            Ok(Flow::Continue)
        }

        // ----- declarations -----
        Statement::Dim(vars) => {
            for dv in vars {
                exec_dim(state, program, dv)?;
            }
            Ok(Flow::Continue)
        }

        Statement::Redim { preserve, arrays } => {
            for dv in arrays {
                exec_redim(state, program, dv, *preserve)?;
            }
            Ok(Flow::Continue)
        }

        Statement::DefType { ranges, kind } => {
            for (from, to) in ranges {
                let (a, b) = (*from.min(to), *from.max(to));
                for c in a..=b {
                    state.def_types.insert(c, *kind);
                }
            }
            Ok(Flow::Continue)
        }

        Statement::DefFn { name, params, body } => {
            state
                .user_functions
                .insert(name.clone(), (params.clone(), body.clone()));
            Ok(Flow::Continue)
        }

        Statement::TypeBegin(name) => {
            // Collect the field lines and skip past END TYPE
            let mut fields = Vec::new();
            let end = scan_from(program, pc, offset, |j, _, s| match s {
                Statement::TypeField { name, ty } => {
                    fields.push((name.clone(), ty.clone()));
                    None
                }
                Statement::EndType => Some(j),
                Statement::Rem | Statement::Label(_) => None,
                _ => Some(usize::MAX),
            });
            match end {
                Some(j) if j != usize::MAX => {
                    state.user_types.insert(name.clone(), fields);
                    Ok(Flow::GotoIndex(j + 1))
                }
                _ => Err(ErrorCode::Syntax),
            }
        }

        // Definitions are skipped inline; calls jump into the body
        Statement::Sub { .. } | Statement::Function { .. } => {
            let end = find_routine_end(program, pc).ok_or(ErrorCode::Syntax)?;
            Ok(Flow::GotoIndex(end + 1))
        }

        Statement::EndSub | Statement::EndFunction => match state.sub_stack.pop() {
            Some(resume) => Ok(Flow::GotoIndex(resume)),
            None => Ok(Flow::Continue),
        },

        Statement::CallSub { name, args } => {
            let def = state
                .subs
                .get(name)
                .or_else(|| state.functions.get(name))
                .cloned()
                .ok_or(ErrorCode::Syntax)?;
            bind_params(state, program, &def.params, args)?;
            state.sub_stack.push(pc + 1);
            Ok(Flow::GotoIndex(def.start_pc + 1))
        }

        // ----- jumps -----
        Statement::Goto(line) => Ok(Flow::Goto(*line)),
        Statement::GotoLabel(name) => {
            let idx = resolve_label(state, program, name)?;
            Ok(Flow::GotoIndex(idx))
        }
        Statement::Gosub(line) => {
            state.gosub_stack.push(program.line_number(pc));
            Ok(Flow::Goto(*line))
        }
        Statement::GosubLabel(name) => {
            let idx = resolve_label(state, program, name)?;
            state.gosub_stack.push(program.line_number(pc));
            Ok(Flow::GotoIndex(idx))
        }
        Statement::Return => {
            let caller = state.gosub_stack.pop().ok_or(ErrorCode::ReturnWithoutGosub)?;
            let idx = program.index_of(caller).ok_or(ErrorCode::UndefinedLine)?;
            Ok(Flow::GotoIndex(idx + 1))
        }

        Statement::OnGoto { selector, targets, gosub } => {
            let sel = eval(state, program, selector)?.as_number()?.round() as i64;
            if !(0..=255).contains(&sel) {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            if sel == 0 || sel as usize > targets.len() {
                return Ok(Flow::Continue);
            }
            let target = targets[sel as usize - 1];
            if *gosub {
                state.gosub_stack.push(program.line_number(pc));
            }
            Ok(Flow::Goto(target))
        }

        // ----- conditionals -----
        Statement::If { condition, then, else_ } => {
            if stmt.is_block_if() {
                return exec_block_if(state, program, pc, offset, condition);
            }
            let cond = eval(state, program, condition)?.is_true()?;
            if cond {
                exec_statement(state, program, pc, offset, then)
            } else if let Some(else_branch) = else_ {
                exec_statement(state, program, pc, offset, else_branch)
            } else {
                Ok(Flow::Continue)
            }
        }

        // Reached linearly, these mean a taken branch just finished:
        // skip to END IF
        Statement::Else | Statement::ElseIf(_) => {
            let end = find_end_if(program, pc, offset).ok_or(ErrorCode::Syntax)?;
            Ok(Flow::GotoIndex(end + 1))
        }

        Statement::SelectCase(test) => {
            let value = eval(state, program, test)?;
            state.select_stack.push(value.clone());
            exec_select_dispatch(state, program, pc, offset, &value)
        }

        // A CASE reached linearly ends the previous clause's body
        Statement::Case(_) | Statement::CaseElse => {
            let end = find_end_select(program, pc, offset).ok_or(ErrorCode::Syntax)?;
            Ok(Flow::GotoIndex(end))
        }

        Statement::EndSelect => {
            state.select_stack.pop();
            Ok(Flow::Continue)
        }

        // ----- loops -----
        Statement::For { var, start, end, step } => {
            let s = eval(state, program, start)?.as_number()?;
            let e = eval(state, program, end)?.as_number()?;
            let k = match step {
                Some(expr) => eval(state, program, expr)?.as_number()?,
                None => 1.0,
            };
            state.set_variable(var, Value::Number(s))?;
            state.for_stack.push(ForState { var: var.clone(), end: e, step: k, for_pc: pc });
            Ok(Flow::Continue)
        }

        Statement::Next(var) => {
            let top = state.for_stack.last().cloned().ok_or(ErrorCode::NextWithoutFor)?;
            if let Some(v) = var {
                if *v != top.var {
                    return Err(ErrorCode::NextWithoutFor);
                }
            }
            let current = state.get_variable(&top.var).as_number()? + top.step;
            state.set_variable(&top.var, Value::Number(current))?;
            let done = if top.step > 0.0 {
                current > top.end
            } else if top.step < 0.0 {
                current < top.end
            } else {
                false
            };
            if done {
                state.for_stack.pop();
                Ok(Flow::Continue)
            } else {
                Ok(Flow::GotoIndex(top.for_pc + 1))
            }
        }

        Statement::While(cond) => {
            if eval(state, program, cond)?.is_true()? {
                state.while_stack.push(pc);
                Ok(Flow::Continue)
            } else {
                let wend = find_wend(program, pc, offset).ok_or(ErrorCode::Syntax)?;
                Ok(Flow::GotoIndex(wend + 1))
            }
        }

        Statement::Wend => {
            let back = state.while_stack.pop().ok_or(ErrorCode::Syntax)?;
            Ok(Flow::GotoIndex(back))
        }

        Statement::Do { cond, until } => {
            if let Some(c) = cond {
                let truth = eval(state, program, c)?.is_true()?;
                let enter = if *until { !truth } else { truth };
                if !enter {
                    let end = find_loop(program, pc, offset).ok_or(ErrorCode::Syntax)?;
                    return Ok(Flow::GotoIndex(end + 1));
                }
            }
            state.do_stack.push(pc);
            Ok(Flow::Continue)
        }

        Statement::Loop { cond, until } => {
            let back = state.do_stack.pop().ok_or(ErrorCode::Syntax)?;
            match cond {
                None => Ok(Flow::GotoIndex(back)),
                Some(c) => {
                    let truth = eval(state, program, c)?.is_true()?;
                    let repeat = if *until { !truth } else { truth };
                    if repeat {
                        Ok(Flow::GotoIndex(back))
                    } else {
                        Ok(Flow::Continue)
                    }
                }
            }
        }

        Statement::Exit(scope) => match scope {
            ExitScope::For => {
                state.for_stack.pop().ok_or(ErrorCode::NextWithoutFor)?;
                let next = find_next(program, pc, offset).ok_or(ErrorCode::Syntax)?;
                Ok(Flow::GotoIndex(next + 1))
            }
            ExitScope::Do => {
                state.do_stack.pop().ok_or(ErrorCode::Syntax)?;
                let end = find_loop(program, pc, offset).ok_or(ErrorCode::Syntax)?;
                Ok(Flow::GotoIndex(end + 1))
            }
            ExitScope::Sub | ExitScope::Function => match state.sub_stack.pop() {
                Some(resume) => Ok(Flow::GotoIndex(resume)),
                None => Ok(Flow::Continue),
            },
        },

        // ----- program control -----
        Statement::End => {
            if let Some(resume) = state.sub_stack.pop() {
                Ok(Flow::GotoIndex(resume))
            } else {
                Ok(Flow::End)
            }
        }

        Statement::Stop => {
            let line = program.line_number(pc);
            state.print_line(&format!("Break in {}", line));
            Ok(Flow::End)
        }

        Statement::OnErrorGoto(target) => {
            match target {
                Some(line) => {
                    program.index_of(*line).ok_or(ErrorCode::UndefinedLine)?;
                    state.on_error_target = Some(*line);
                }
                None => state.on_error_target = None,
            }
            Ok(Flow::Continue)
        }

        Statement::Resume(kind) => {
            if !state.in_handler {
                return Err(ErrorCode::ResumeWithoutError);
            }
            state.in_handler = false;
            let fault_line = state.resume_line.ok_or(ErrorCode::ResumeWithoutError)?;
            match kind {
                ResumeKind::Same => {
                    let idx = program.index_of(fault_line).ok_or(ErrorCode::UndefinedLine)?;
                    Ok(Flow::GotoIndex(idx))
                }
                ResumeKind::Next => {
                    let idx = program.index_of(fault_line).ok_or(ErrorCode::UndefinedLine)?;
                    Ok(Flow::GotoIndex(idx + 1))
                }
                ResumeKind::Line(line) => Ok(Flow::Goto(*line)),
            }
        }

        Statement::Sleep(secs) => {
            exec_sleep(state, program, secs.as_ref())?;
            Ok(Flow::Continue)
        }

        Statement::Randomize(seed) => {
            match seed {
                Some(expr) => {
                    let n = eval(state, program, expr)?.as_number()?;
                    state.rng = StdRng::seed_from_u64(n.to_bits());
                }
                None => state.rng = StdRng::from_entropy(),
            }
            Ok(Flow::Continue)
        }

        // ----- console I/O -----
        Statement::Print { items } => {
            exec_print(state, program, items, None)?;
            Ok(Flow::Continue)
        }

        Statement::PrintFile { channel, items } => {
            exec_print(state, program, items, Some(channel))?;
            Ok(Flow::Continue)
        }

        Statement::PrintUsing { channel, format: fmt, args, trailing } => {
            let format_text = eval(state, program, fmt)?.as_text()?.to_string();
            let values = eval_list(state, program, args)?;
            let rendered = format::format_using(&format_text, &values)?;
            match channel {
                Some(c) => {
                    let num = eval(state, program, c)?.as_number()?.round() as u32;
                    let handle = state.files.get(num)?;
                    handle.write_text(&rendered)?;
                    if !trailing {
                        handle.write_text("\r\n")?;
                    }
                }
                None => {
                    state.print_str(&rendered);
                    if !trailing {
                        state.print_newline();
                    }
                }
            }
            Ok(Flow::Continue)
        }

        Statement::Input { prompt, vars } => {
            exec_input(state, program, prompt.as_deref(), vars)?;
            Ok(Flow::Continue)
        }

        Statement::InputFile { channel, vars } => {
            let num = eval(state, program, channel)?.as_number()?.round() as u32;
            for target in vars {
                let item = state.files.get(num)?.input_item()?;
                store_read_value(state, program, target, Value::Text(item))?;
            }
            Ok(Flow::Continue)
        }

        Statement::LineInput { prompt, var } => {
            if let Some(p) = prompt {
                state.print_str(p);
            }
            let line = state.console.read_line().unwrap_or_default();
            state.console_col = 0;
            if state.graphics.mode() > 0 {
                state.graphics.print_text(&line, true);
            }
            state.set_variable(var, Value::Text(line))?;
            Ok(Flow::Continue)
        }

        Statement::LineInputFile { channel, var } => {
            let num = eval(state, program, channel)?.as_number()?.round() as u32;
            let line = state.files.get(num)?.line_input()?;
            state.set_variable(var, Value::Text(line))?;
            Ok(Flow::Continue)
        }

        // ----- files -----
        Statement::Open { path, mode, number, record_len } => {
            let path = eval(state, program, path)?.as_text()?.to_string();
            let num = eval(state, program, number)?.as_number()?.round() as i64;
            if !(1..=255).contains(&num) {
                return Err(ErrorCode::BadFileNumber);
            }
            let len = match record_len {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as usize),
                None => None,
            };
            state.files.open(num as u32, &path, *mode, len)?;
            Ok(Flow::Continue)
        }

        Statement::Close(channels) => {
            if channels.is_empty() {
                state.files.close_all();
            } else {
                for c in channels {
                    let num = eval(state, program, c)?.as_number()?.round() as u32;
                    state.files.close(num);
                }
            }
            Ok(Flow::Continue)
        }

        Statement::Write { channel, exprs } => {
            let values = eval_list(state, program, exprs)?;
            let mut line = String::new();
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                match v {
                    Value::Text(s) => line.push_str(&format!("\"{}\"", s)),
                    other => line.push_str(&other.text_form()),
                }
            }
            match channel {
                Some(c) => {
                    let num = eval(state, program, c)?.as_number()?.round() as u32;
                    line.push_str("\r\n");
                    state.files.get(num)?.write_text(&line)?;
                }
                None => state.print_line(&line),
            }
            Ok(Flow::Continue)
        }

        Statement::Field { channel, fields } => {
            let num = eval(state, program, channel)?.as_number()?.round() as u32;
            let mut widths = Vec::new();
            for (width, var) in fields {
                let w = eval(state, program, width)?.as_number()?.round() as usize;
                widths.push((w, var.clone()));
            }
            let handle = state.files.get(num)?;
            handle.set_fields(widths)?;
            let texts: Vec<(String, String)> = handle
                .fields
                .clone()
                .iter()
                .map(|spec| (spec.var.clone(), handle.field_text(spec)))
                .collect();
            for (var, text) in texts {
                state.set_variable(&var, Value::Text(text))?;
            }
            Ok(Flow::Continue)
        }

        Statement::GetRecord { channel, record } => {
            let num = eval(state, program, channel)?.as_number()?.round() as u32;
            let rec = match record {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as usize),
                None => None,
            };
            let handle = state.files.get(num)?;
            handle.get_record(rec)?;
            let texts: Vec<(String, String)> = handle
                .fields
                .clone()
                .iter()
                .map(|spec| (spec.var.clone(), handle.field_text(spec)))
                .collect();
            for (var, text) in texts {
                state.set_variable(&var, Value::Text(text))?;
            }
            Ok(Flow::Continue)
        }

        Statement::PutRecord { channel, record } => {
            let num = eval(state, program, channel)?.as_number()?.round() as u32;
            let rec = match record {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as usize),
                None => None,
            };
            state.files.get(num)?.put_record(rec)?;
            Ok(Flow::Continue)
        }

        Statement::Lset { var, value } => {
            exec_justify(state, program, var, value, false)?;
            Ok(Flow::Continue)
        }

        Statement::Rset { var, value } => {
            exec_justify(state, program, var, value, true)?;
            Ok(Flow::Continue)
        }

        Statement::Kill(path) => {
            let path = eval(state, program, path)?.as_text()?.to_string();
            std::fs::remove_file(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                _ => ErrorCode::PathNotFound,
            })?;
            Ok(Flow::Continue)
        }

        Statement::NameFile { from, to } => {
            let from = eval(state, program, from)?.as_text()?.to_string();
            let to = eval(state, program, to)?.as_text()?.to_string();
            std::fs::rename(&from, &to).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                _ => ErrorCode::PathNotFound,
            })?;
            Ok(Flow::Continue)
        }

        Statement::Files(pattern) => {
            let pattern = match pattern {
                Some(e) => eval(state, program, e)?.as_text()?.to_string(),
                None => String::from("*"),
            };
            let entries = std::fs::read_dir(".").map_err(|_| ErrorCode::PathNotFound)?;
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| wildcard_match(&pattern, n))
                .collect();
            names.sort();
            for name in names {
                state.print_line(&name);
            }
            Ok(Flow::Continue)
        }

        // ----- DATA -----
        Statement::Read(targets) => {
            for target in targets {
                if state.data_cursor >= state.data_pool.len() {
                    return Err(ErrorCode::OutOfData);
                }
                let value = state.data_pool[state.data_cursor].1.clone();
                state.data_cursor += 1;
                store_read_value(state, program, target, value)?;
            }
            Ok(Flow::Continue)
        }

        Statement::Restore(line) => {
            state.data_cursor = match line {
                None => 0,
                Some(l) => state
                    .data_pool
                    .iter()
                    .position(|(at, _)| *at >= *l)
                    .unwrap_or(state.data_pool.len()),
            };
            Ok(Flow::Continue)
        }

        // ----- graphics -----
        Statement::Cls => {
            state.graphics.cls();
            if state.graphics.mode() == 0 {
                state.console.clear();
                state.console_col = 0;
            }
            Ok(Flow::Continue)
        }

        Statement::Screen { mode, active, visual } => {
            let m = eval(state, program, mode)?.as_number()?.round() as i64;
            let a = match active {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as usize),
                None => None,
            };
            let v = match visual {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as usize),
                None => None,
            };
            if !(0..=255).contains(&m) || !state.graphics.set_screen(m as u8, a, v) {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let (w, h) = (state.graphics.width(), state.graphics.height());
            if let Some(display) = &mut state.display {
                display.initialize(w, h);
            }
            Ok(Flow::Continue)
        }

        Statement::Color { fg, bg } => {
            let f = match fg {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as i64),
                None => None,
            };
            let b = match bg {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as i64),
                None => None,
            };
            state.graphics.set_colors(f, b);
            Ok(Flow::Continue)
        }

        Statement::Locate { row, col } => {
            let r = match row {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as u32),
                None => None,
            };
            let c = match col {
                Some(e) => Some(eval(state, program, e)?.as_number()?.round() as u32),
                None => None,
            };
            state.graphics.locate(r, c);
            Ok(Flow::Continue)
        }

        Statement::Pset { x, y, color } | Statement::Preset { x, y, color } => {
            let px = eval(state, program, x)?.as_number()?.round() as i32;
            let py = eval(state, program, y)?.as_number()?.round() as i32;
            let default = if matches!(stmt, Statement::Pset { .. }) {
                state.graphics.foreground()
            } else {
                state.graphics.background()
            };
            let c = eval_color(state, program, color.as_ref(), default)?;
            state.graphics.active().set_pixel(px, py, c);
            state.graphics.set_last_point(px, py);
            Ok(Flow::Continue)
        }

        Statement::Line { from, to, color, box_, filled } => {
            let (x1, y1) = match from {
                Some((x, y)) => (
                    eval(state, program, x)?.as_number()?.round() as i32,
                    eval(state, program, y)?.as_number()?.round() as i32,
                ),
                None => state.graphics.last_point(),
            };
            let x2 = eval(state, program, &to.0)?.as_number()?.round() as i32;
            let y2 = eval(state, program, &to.1)?.as_number()?.round() as i32;
            let c = eval_color(state, program, color.as_ref(), state.graphics.foreground())?;
            if *box_ {
                state.graphics.active().draw_box(x1, y1, x2, y2, c, *filled);
            } else {
                state.graphics.active().draw_line(x1, y1, x2, y2, c);
            }
            state.graphics.set_last_point(x2, y2);
            Ok(Flow::Continue)
        }

        Statement::Circle { x, y, radius, color, start, end, aspect } => {
            let cx = eval(state, program, x)?.as_number()?.round() as i32;
            let cy = eval(state, program, y)?.as_number()?.round() as i32;
            let r = eval(state, program, radius)?.as_number()?.round() as i32;
            let c = eval_color(state, program, color.as_ref(), state.graphics.foreground())?;
            let sa = match start {
                Some(e) => eval(state, program, e)?.as_number()?,
                None => 0.0,
            };
            let ea = match end {
                Some(e) => eval(state, program, e)?.as_number()?,
                None => std::f64::consts::TAU,
            };
            let aspect = match aspect {
                Some(e) => eval(state, program, e)?.as_number()?,
                None => 1.0,
            };
            state.graphics.active().draw_circle(cx, cy, r, c, sa, ea, aspect);
            state.graphics.set_last_point(cx, cy);
            Ok(Flow::Continue)
        }

        Statement::Paint { x, y, fill, border } => {
            let px = eval(state, program, x)?.as_number()?.round() as i32;
            let py = eval(state, program, y)?.as_number()?.round() as i32;
            let fill = eval_color(state, program, fill.as_ref(), state.graphics.foreground())?;
            let border = eval_color(state, program, border.as_ref(), fill)?;
            state.graphics.active().flood_fill(px, py, fill, border);
            Ok(Flow::Continue)
        }

        Statement::Draw(commands) => {
            let text = eval(state, program, commands)?.as_text()?.to_string();
            state.graphics.draw_macro(&text);
            Ok(Flow::Continue)
        }

        Statement::Palette { index, color } => {
            match (index, color) {
                (Some(i), Some(c)) => {
                    let idx = eval(state, program, i)?.as_number()?.round() as i64;
                    let val = eval(state, program, c)?.as_number()?.round() as i64;
                    if !(0..=255).contains(&idx) {
                        return Err(ErrorCode::IllegalFunctionCall);
                    }
                    let packed = if val > 0xFF_FFFF {
                        (val & 0xFF_FFFF) as u32
                    } else if (0..=255).contains(&val) {
                        crate::framebuffer::default_entry(val as u8)
                    } else {
                        return Err(ErrorCode::IllegalFunctionCall);
                    };
                    state.graphics.set_palette_entry(idx as u8, packed);
                }
                _ => state.graphics.reset_palette(),
            }
            Ok(Flow::Continue)
        }

        Statement::GetGraphics { x1, y1, x2, y2, array } => {
            let ax1 = eval(state, program, x1)?.as_number()?.round() as i32;
            let ay1 = eval(state, program, y1)?.as_number()?.round() as i32;
            let ax2 = eval(state, program, x2)?.as_number()?.round() as i32;
            let ay2 = eval(state, program, y2)?.as_number()?.round() as i32;
            let bytes = state.graphics.active().copy_region(ax1, ay1, ax2, ay2);
            let h = state.array_handle_or_create(array, 1)?;
            let arr = &mut state.array_heap[h];
            arr.kind = ElemKind::Number;
            arr.dims = vec![bytes.len().saturating_sub(1)];
            arr.elements = bytes.iter().map(|&b| Value::Number(b as f64)).collect();
            Ok(Flow::Continue)
        }

        Statement::PutGraphics { x, y, array, action } => {
            let px = eval(state, program, x)?.as_number()?.round() as i32;
            let py = eval(state, program, y)?.as_number()?.round() as i32;
            let h = *state.arrays.get(array).ok_or(ErrorCode::IllegalFunctionCall)?;
            let bytes: Vec<u8> = state.array_heap[h]
                .elements
                .iter()
                .map(|v| v.as_number().unwrap_or(0.0) as u8)
                .collect();
            state.graphics.active().paste_region(px, py, &bytes, *action);
            Ok(Flow::Continue)
        }

        // ----- sound -----
        Statement::Beep => {
            log::debug!("BEEP");
            Ok(Flow::Continue)
        }

        Statement::Sound { freq, duration } => {
            let f = eval(state, program, freq)?.as_number()?;
            let d = eval(state, program, duration)?.as_number()?;
            log::debug!("SOUND {} {}", f, d);
            Ok(Flow::Continue)
        }

        Statement::Play(tune) => {
            // Minimally conformant: the tune string is evaluated, the
            // notes become a beep
            let _ = eval(state, program, tune)?;
            log::debug!("PLAY (beep stub)");
            Ok(Flow::Continue)
        }
    }
}

// ----- statement helpers -----

fn resolve_label(
    state: &mut InterpreterState,
    program: &Program,
    name: &str,
) -> Result<usize, ErrorCode> {
    if let Some(idx) = state.labels.get(name) {
        return Ok(*idx);
    }
    for (i, (_, stmt)) in program.iter().enumerate() {
        for s in stmt.flatten() {
            if matches!(s, Statement::Label(l) if l == name) {
                state.labels.insert(name.to_string(), i);
                return Ok(i);
            }
        }
    }
    Err(ErrorCode::UndefinedLine)
}

fn eval_color(
    state: &mut InterpreterState,
    program: &Program,
    expr: Option<&Expr>,
    default: i64,
) -> Result<i64, ErrorCode> {
    match expr {
        Some(e) => Ok(eval(state, program, e)?.as_number()?.round() as i64),
        None => Ok(default),
    }
}

fn exec_block_if(
    state: &mut InterpreterState,
    program: &Program,
    pc: usize,
    offset: usize,
    condition: &Expr,
) -> Result<Flow, ErrorCode> {
    if eval(state, program, condition)?.is_true()? {
        return Ok(Flow::Continue);
    }

    // Condition false: walk forward for ELSEIF / ELSE / END IF at this
    // nesting depth, testing ELSEIF conditions as they come
    let mut depth = 0i32;
    let mut j = pc;
    let mut begin = offset + 1;
    while j < program.len() {
        let stmts = line_stmts(program, j);
        for stmt in stmts.iter().skip(begin) {
            if stmt.is_block_if() {
                depth += 1;
                continue;
            }
            match stmt {
                Statement::EndIf => {
                    if depth == 0 {
                        return Ok(Flow::GotoIndex(j + 1));
                    }
                    depth -= 1;
                }
                Statement::Else if depth == 0 => {
                    return Ok(Flow::GotoIndex(j + 1));
                }
                Statement::ElseIf(cond) if depth == 0 => {
                    if eval(state, program, cond)?.is_true()? {
                        return Ok(Flow::GotoIndex(j + 1));
                    }
                }
                _ => {}
            }
        }
        j += 1;
        begin = 0;
    }
    Err(ErrorCode::Syntax)
}

fn case_matches(
    state: &mut InterpreterState,
    program: &Program,
    value: &Value,
    clauses: &[CaseClause],
) -> Result<bool, ErrorCode> {
    for clause in clauses {
        let hit = match clause {
            CaseClause::Value(e) => {
                let v = eval(state, program, e)?;
                compare(value, &v, BinOp::Eq)?
            }
            CaseClause::Range(a, b) => {
                let lo = eval(state, program, a)?;
                let hi = eval(state, program, b)?;
                compare(value, &lo, BinOp::Ge)? && compare(value, &hi, BinOp::Le)?
            }
            CaseClause::Is(op, e) => {
                let v = eval(state, program, e)?;
                compare(value, &v, *op)?
            }
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn exec_select_dispatch(
    state: &mut InterpreterState,
    program: &Program,
    pc: usize,
    offset: usize,
    value: &Value,
) -> Result<Flow, ErrorCode> {
    let mut depth = 0i32;
    let mut j = pc;
    let mut begin = offset + 1;
    while j < program.len() {
        let count = line_stmts(program, j).len();
        for k in begin..count {
            // Clauses need evaluation, so the statement is re-fetched per
            // step
            let stmt = &line_stmts(program, j)[k];
            match stmt {
                Statement::SelectCase(_) => depth += 1,
                Statement::EndSelect => {
                    if depth == 0 {
                        // Runs END SELECT so the test value pops
                        return Ok(Flow::GotoIndex(j));
                    }
                    depth -= 1;
                }
                Statement::CaseElse if depth == 0 => {
                    return Ok(Flow::GotoIndex(j + 1));
                }
                Statement::Case(clauses) if depth == 0 => {
                    let clauses = clauses.clone();
                    if case_matches(state, program, value, &clauses)? {
                        return Ok(Flow::GotoIndex(j + 1));
                    }
                }
                _ => {}
            }
        }
        j += 1;
        begin = 0;
    }
    Err(ErrorCode::Syntax)
}

fn exec_dim(
    state: &mut InterpreterState,
    program: &Program,
    dv: &DimVar,
) -> Result<(), ErrorCode> {
    let (kind, type_name) = dim_kind(state, dv)?;

    if dv.dims.is_empty() {
        match (kind, &type_name) {
            (ElemKind::Instance, Some(t)) => {
                let h = state.create_instance(t)?;
                state.declared_kinds.insert(dv.name.clone(), ElemKind::Instance);
                state.variables.insert(dv.name.clone(), Value::Instance(h));
            }
            _ => {
                state.declared_kinds.insert(dv.name.clone(), kind);
                let default = state.default_value(kind);
                state.variables.entry(dv.name.clone()).or_insert(default);
            }
        }
        return Ok(());
    }

    let bounds = eval_numbers(state, program, &dv.dims)?;
    let dims: Vec<usize> = bounds
        .iter()
        .map(|b| {
            let v = b.round() as i64;
            if v < 0 {
                Err(ErrorCode::SubscriptOutOfRange)
            } else {
                Ok(v as usize)
            }
        })
        .collect::<Result<_, _>>()?;
    state.new_array(&dv.name, dims, kind, type_name.as_deref())?;
    Ok(())
}

fn dim_kind(
    state: &InterpreterState,
    dv: &DimVar,
) -> Result<(ElemKind, Option<String>), ErrorCode> {
    match &dv.as_type {
        None => Ok((state.name_kind(&dv.name), None)),
        Some(BasicType::Integer) => Ok((ElemKind::Integer, None)),
        Some(BasicType::Long) => Ok((ElemKind::Long, None)),
        Some(BasicType::Single) | Some(BasicType::Double) => Ok((ElemKind::Number, None)),
        Some(BasicType::Str) | Some(BasicType::FixedStr(_)) => Ok((ElemKind::Text, None)),
        Some(BasicType::User(t)) => {
            if !state.user_types.contains_key(t) {
                return Err(ErrorCode::TypeMismatch);
            }
            Ok((ElemKind::Instance, Some(t.clone())))
        }
    }
}

fn exec_redim(
    state: &mut InterpreterState,
    program: &Program,
    dv: &DimVar,
    preserve: bool,
) -> Result<(), ErrorCode> {
    let (kind, type_name) = dim_kind(state, dv)?;
    let bounds = eval_numbers(state, program, &dv.dims)?;
    let dims: Vec<usize> = bounds.iter().map(|b| b.round().max(0.0) as usize).collect();

    let old = state.arrays.get(&dv.name).copied();
    match old {
        None => {
            state.new_array(&dv.name, dims, kind, type_name.as_deref())?;
        }
        Some(h) => {
            let old_arr = state.array_heap[h].clone();
            let count = ArrayObj::cell_count(&dims);
            let mut elements = vec![state.default_value(old_arr.kind); count];
            if preserve {
                // Copy the overlap cell by cell, walking new index tuples
                let mut idx = vec![0usize; dims.len()];
                for cell in elements.iter_mut() {
                    if idx.len() == old_arr.dims.len()
                        && idx.iter().zip(&old_arr.dims).all(|(i, d)| i <= d)
                    {
                        let floats: Vec<f64> = idx.iter().map(|&i| i as f64).collect();
                        if let Ok(at) = old_arr.flat_index(&floats) {
                            *cell = old_arr.elements[at].clone();
                        }
                    }
                    // Odometer increment, last axis fastest
                    for axis in (0..dims.len()).rev() {
                        idx[axis] += 1;
                        if idx[axis] <= dims[axis] {
                            break;
                        }
                        idx[axis] = 0;
                    }
                }
            }
            state.array_heap[h] = ArrayObj { dims, elements, kind: old_arr.kind };
        }
    }
    Ok(())
}

fn store_read_value(
    state: &mut InterpreterState,
    program: &Program,
    target: &ReadTarget,
    value: Value,
) -> Result<(), ErrorCode> {
    let numeric_target = state.name_kind(&target.name) != ElemKind::Text;
    let converted = if numeric_target {
        match &value {
            Value::Number(_) => value,
            Value::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    Value::Number(0.0)
                } else {
                    Value::Number(t.parse().map_err(|_| ErrorCode::TypeMismatch)?)
                }
            }
            _ => return Err(ErrorCode::TypeMismatch),
        }
    } else {
        Value::Text(value.text_form())
    };

    match &target.indices {
        None => state.set_variable(&target.name, converted),
        Some(idx) => {
            let indices = eval_numbers(state, program, idx)?;
            state.set_array_element(&target.name, &indices, converted)
        }
    }
}

fn exec_print(
    state: &mut InterpreterState,
    program: &Program,
    items: &[PrintItem],
    channel: Option<&Expr>,
) -> Result<(), ErrorCode> {
    let file_num = match channel {
        Some(c) => Some(eval(state, program, c)?.as_number()?.round() as u32),
        None => None,
    };

    let mut file_text = String::new();
    let mut trailing = false;

    for item in items {
        match item {
            PrintItem::Semicolon => trailing = true,
            PrintItem::Comma => {
                let col = match file_num {
                    Some(_) => file_text.chars().count(),
                    None => state.print_col(),
                };
                let pad = 14 - col % 14;
                match file_num {
                    Some(_) => file_text.push_str(&" ".repeat(pad)),
                    None => state.print_str(&" ".repeat(pad)),
                }
                trailing = true;
            }
            PrintItem::Tab(e) => {
                let target = eval(state, program, e)?.as_number()?.round().max(1.0) as usize - 1;
                let col = match file_num {
                    Some(_) => file_text.chars().count(),
                    None => state.print_col(),
                };
                if target > col {
                    let pad = " ".repeat(target - col);
                    match file_num {
                        Some(_) => file_text.push_str(&pad),
                        None => state.print_str(&pad),
                    }
                }
                trailing = true;
            }
            PrintItem::Spc(e) => {
                let n = eval(state, program, e)?.as_number()?.round().max(0.0) as usize;
                match file_num {
                    Some(_) => file_text.push_str(&" ".repeat(n)),
                    None => state.print_str(&" ".repeat(n)),
                }
                trailing = true;
            }
            PrintItem::Expr(e) => {
                let text = eval(state, program, e)?.print_form();
                match file_num {
                    Some(_) => file_text.push_str(&text),
                    None => state.print_str(&text),
                }
                trailing = false;
            }
        }
    }

    match file_num {
        Some(num) => {
            if !trailing {
                file_text.push_str("\r\n");
            }
            state.files.get(num)?.write_text(&file_text)?;
        }
        None => {
            if !trailing {
                state.print_newline();
            }
        }
    }
    Ok(())
}

fn exec_input(
    state: &mut InterpreterState,
    program: &Program,
    prompt: Option<&str>,
    vars: &[ReadTarget],
) -> Result<(), ErrorCode> {
    state.print_str(prompt.unwrap_or("? "));
    let line = state.console.read_line().unwrap_or_default();
    state.console_col = 0;
    if state.graphics.mode() > 0 {
        state.graphics.print_text(&line, true);
    }

    // Comma-split, with quoted items kept whole
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for (i, target) in vars.iter().enumerate() {
        let raw = parts.get(i).map(|s| s.trim()).unwrap_or("");
        let value = if state.name_kind(&target.name) == ElemKind::Text {
            Value::Text(raw.to_string())
        } else {
            Value::Number(raw.parse().unwrap_or(0.0))
        };
        match &target.indices {
            None => state.set_variable(&target.name, value)?,
            Some(idx) => {
                let indices = eval_numbers(state, program, idx)?;
                state.set_array_element(&target.name, &indices, value)?;
            }
        }
    }
    Ok(())
}

fn exec_justify(
    state: &mut InterpreterState,
    program: &Program,
    var: &str,
    value: &Expr,
    right: bool,
) -> Result<(), ErrorCode> {
    let text = eval(state, program, value)?.as_text()?.to_string();

    if let Some((num, spec)) = state.files.field_owner(var) {
        let handle = state.files.get(num)?;
        handle.store_field(&spec, &text, right);
        let stored = handle.field_text(&spec);
        state.set_variable(var, Value::Text(stored))?;
        return Ok(());
    }

    // On a plain string variable, justify within its current length
    let existing = state.get_variable(var);
    let width = existing.as_text().map(|s| s.chars().count()).unwrap_or(0);
    let stored = if width == 0 {
        text
    } else {
        let mut s: String = text.chars().take(width).collect();
        let pad = width - s.chars().count();
        if right {
            s = format!("{}{}", " ".repeat(pad), s);
        } else {
            s.push_str(&" ".repeat(pad));
        }
        s
    };
    state.set_variable(var, Value::Text(stored))?;
    Ok(())
}

fn exec_sleep(
    state: &mut InterpreterState,
    program: &Program,
    secs: Option<&Expr>,
) -> Result<(), ErrorCode> {
    match secs {
        Some(e) => {
            let n = eval(state, program, e)?.as_number()?.max(0.0);
            let deadline = Instant::now() + std::time::Duration::from_secs_f64(n);
            while Instant::now() < deadline {
                if state.stopped() {
                    return Err(ErrorCode::Break);
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        None => loop {
            if state.stopped() {
                return Err(ErrorCode::Break);
            }
            if !state.read_key().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        },
    }
    Ok(())
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p = pattern.to_uppercase();
    let n = name.to_uppercase();
    if p == "*" || p == "*.*" {
        return true;
    }
    let parts: Vec<&str> = p.split('*').collect();
    let mut at = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match n[at..].find(part) {
            Some(found) => {
                if i == 0 && found != 0 {
                    return false;
                }
                at += found + part.len();
            }
            None => return false,
        }
    }
    if !p.ends_with('*') && !parts.last().unwrap_or(&"").is_empty() {
        return n.ends_with(parts.last().unwrap());
    }
    true
}

/// Split a DATA line into typed values: quoted runs become text,
/// parseable tokens become numbers, anything else stays text.
fn parse_data_items(raw: &str) -> Vec<Value> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    let mut tokens: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;

    for c in raw.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            ',' if !quoted => {
                tokens.push((std::mem::take(&mut current), was_quoted));
                was_quoted = false;
            }
            _ => current.push(c),
        }
    }
    tokens.push((current, was_quoted));

    tokens
        .into_iter()
        .map(|(token, was_quoted)| {
            if was_quoted {
                Value::Text(token)
            } else {
                let trimmed = token.trim();
                match trimmed.parse::<f64>() {
                    Ok(n) => Value::Number(n),
                    Err(_) => Value::Text(trimmed.to_string()),
                }
            }
        })
        .collect()
}

// ----- the execution generator -----

/// Main execution loop; yields after every statement so the driver can
/// meter chunks.
async fn run_program(
    co: &Co<()>,
    state_cell: &Rc<RefCell<InterpreterState>>,
    program: &Program,
) {
    loop {
        {
            let mut state = state_cell.borrow_mut();

            if state.end_program {
                break;
            }
            if state.pc >= program.len() {
                // Running off the end while a handler is active has no
                // RESUME to return to
                if state.in_handler {
                    let code = ErrorCode::NoResume;
                    state.handle_fault(program, code);
                }
                break;
            }
            if state.stopped() {
                state.print_line("Break");
                break;
            }

            let pc = state.pc;
            let (line, stmt) = program.get(pc).unwrap();
            state.current_line = *line;

            let step = exec_statement(&mut state, program, pc, 0, stmt).and_then(|flow| {
                match flow {
                    Flow::Continue => {
                        state.pc = pc + 1;
                        Ok(())
                    }
                    Flow::GotoIndex(i) => {
                        state.pc = i;
                        Ok(())
                    }
                    Flow::Goto(target) => match program.index_of(target) {
                        Some(i) => {
                            state.pc = i;
                            Ok(())
                        }
                        None => Err(ErrorCode::UndefinedLine),
                    },
                    Flow::End => {
                        state.end_program = true;
                        Ok(())
                    }
                }
            });

            if let Err(code) = step {
                if !state.handle_fault(program, code) {
                    break;
                }
            }
        }
        co.yield_(()).await;
    }
    state_cell.borrow_mut().running = false;
}

trait Resumable {
    fn resume_gen(&mut self) -> Option<()>;
}

struct GenWrapper<F: std::future::Future<Output = ()>> {
    gen: Gen<(), (), F>,
}

impl<F: std::future::Future<Output = ()>> Resumable for GenWrapper<F> {
    fn resume_gen(&mut self) -> Option<()> {
        match self.gen.resume() {
            GeneratorState::Yielded(()) => Some(()),
            GeneratorState::Complete(()) => None,
        }
    }
}

type BoxedGenerator = Box<dyn Resumable>;

fn create_execution_generator(
    state: Rc<RefCell<InterpreterState>>,
    program: Rc<Program>,
) -> Gen<(), (), impl std::future::Future<Output = ()>> {
    Gen::new(|co: Co<()>| async move {
        run_program(&co, &state, &program).await;
    })
}

// ----- public driver -----

/// The public driver: load a program, then run it to completion, in
/// cooperative chunks, or with an async yield hook.
pub struct Interpreter {
    state: Rc<RefCell<InterpreterState>>,
    program: Rc<Program>,
    generator: Option<BoxedGenerator>,
    options: Options,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_console(Box::new(BufferConsole::new()))
    }

    pub fn with_console(console: Box<dyn Console>) -> Self {
        Self {
            state: Rc::new(RefCell::new(InterpreterState::new(console))),
            program: Rc::new(Program::default()),
            generator: None,
            options: Options::default(),
        }
    }

    pub fn set_display(&mut self, display: Box<dyn Display>) {
        self.state.borrow_mut().display = Some(display);
    }

    pub fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    /// Parse source into the line table. Unnumbered sources are
    /// auto-numbered.
    pub fn load(&mut self, source: &str) -> Result<(), BasicError> {
        self.program = Rc::new(crate::parser::parse_source_with_step(
            source,
            self.options.auto_number_step,
        )?);
        self.generator = None;
        Ok(())
    }

    /// Reset run state, pre-register routines and DATA, and stand up the
    /// execution generator.
    pub fn initialize_execution(&mut self) {
        {
            let mut state = self.state.borrow_mut();
            let console = std::mem::replace(&mut state.console, Box::new(BufferConsole::new()));
            let display = state.display.take();
            let graphics = std::mem::replace(&mut state.graphics, Graphics::new());
            let stop = state.stop_flag.clone();
            *state = InterpreterState::new(console);
            state.display = display;
            state.graphics = graphics;
            state.stop_flag = stop;
            state.stop_flag.store(false, Ordering::Relaxed);
            state.running = true;

            // Program-wide scan: DATA pool in line order, SUB/FUNCTION
            // registration so forward references resolve
            for (i, (line, stmt)) in self.program.iter().enumerate() {
                for s in stmt.flatten() {
                    match s {
                        Statement::Data(raw) => {
                            for v in parse_data_items(raw) {
                                state.data_pool.push((*line, v));
                            }
                        }
                        Statement::Sub { name, params } => {
                            state.subs.insert(
                                name.clone(),
                                RoutineDef { params: params.clone(), start_pc: i },
                            );
                        }
                        Statement::Function { name, params } => {
                            state.functions.insert(
                                name.clone(),
                                RoutineDef { params: params.clone(), start_pc: i },
                            );
                        }
                        _ => {}
                    }
                }
            }
        }

        let gen = create_execution_generator(self.state.clone(), self.program.clone());
        self.generator = Some(Box::new(GenWrapper { gen }));
    }

    /// Run the loaded program to completion (blocking).
    pub fn run(&mut self) -> Result<(), BasicError> {
        self.initialize_execution();
        while let Some(gen) = self.generator.as_mut() {
            if gen.resume_gen().is_none() {
                self.generator = None;
            }
        }
        self.finish()
    }

    /// Parse and run in one step.
    pub fn execute(&mut self, source: &str) -> Result<(), BasicError> {
        self.load(source)?;
        self.run()
    }

    /// Execute up to `max_statements`, returning whether more remain.
    /// Statements are atomic; control returns only between them.
    pub fn execute_chunk(&mut self, max_statements: usize) -> Result<bool, BasicError> {
        if self.generator.is_none() {
            self.initialize_execution();
        }
        for _ in 0..max_statements {
            let done = match self.generator.as_mut() {
                Some(gen) => gen.resume_gen().is_none(),
                None => true,
            };
            if done {
                self.generator = None;
                self.finish()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cooperative run for single-threaded hosts: the yield hook fires
    /// every ~2000 statements; returning false from it stops the run.
    pub fn run_async(&mut self, mut yield_hook: impl FnMut() -> bool) -> Result<(), BasicError> {
        self.initialize_execution();
        loop {
            let more = self.execute_chunk(self.options.yield_every)?;
            if !more {
                return Ok(());
            }
            if !yield_hook() {
                self.request_stop();
            }
        }
    }

    fn finish(&mut self) -> Result<(), BasicError> {
        match self.state.borrow_mut().error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop all run state and close any open files. The console and
    /// display stay attached.
    pub fn reset(&mut self) {
        self.generator = None;
        self.state.borrow_mut().reset();
    }

    /// Clonable cancellation flag, checked once per statement.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.state.borrow().stop_flag.clone()
    }

    pub fn request_stop(&mut self) {
        self.state.borrow().stop_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Present the visual page through the display collaborator.
    pub fn present(&mut self) {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        if let Some(display) = &mut state.display {
            state.graphics.present(display.as_mut());
        }
    }

    /// Read a variable, for hosts and tests.
    pub fn var(&self, name: &str) -> Option<Value> {
        self.state.borrow().variables.get(&name.to_uppercase()).cloned()
    }

    pub fn with_graphics<R>(&self, f: impl FnOnce(&Graphics) -> R) -> R {
        f(&self.state.borrow().graphics)
    }

    pub fn with_graphics_mut<R>(&mut self, f: impl FnOnce(&mut Graphics) -> R) -> R {
        f(&mut self.state.borrow_mut().graphics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_full(src: &str, input: &[&str]) -> (Result<(), BasicError>, String, Interpreter) {
        let console = Rc::new(RefCell::new(BufferConsole::new()));
        for line in input {
            console.borrow_mut().push_input(line);
        }
        let mut interp = Interpreter::with_console(Box::new(console.clone()));
        let result = interp.execute(src);
        let output = console.borrow().output();
        (result, output, interp)
    }

    fn run_basic(src: &str) -> String {
        let (result, output, _) = run_full(src, &[]);
        result.expect("should run");
        output
    }

    fn run_err(src: &str) -> BasicError {
        let (result, _, _) = run_full(src, &[]);
        result.expect_err("should fail")
    }

    #[test]
    fn hello() {
        assert_eq!(run_basic("10 PRINT \"HELLO\""), "HELLO");
    }

    #[test]
    fn loop_sum() {
        let src = "10 S=0\n20 FOR I=1 TO 10\n30 S=S+I\n40 NEXT I\n50 PRINT S";
        assert_eq!(run_basic(src), " 55 ");
    }

    #[test]
    fn gosub_return() {
        let src = "10 GOSUB 100\n20 PRINT \"B\"\n30 END\n100 PRINT \"A\"\n110 RETURN";
        assert_eq!(run_basic(src), "A\nB");
    }

    #[test]
    fn data_read() {
        let src = "10 DATA 1,2,3\n20 READ A,B,C\n30 PRINT A+B+C";
        assert_eq!(run_basic(src), " 6 ");
    }

    #[test]
    fn screen_and_pixel() {
        let src = "10 SCREEN 9\n20 PSET (10,10),14\n30 P = POINT(10,10)";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        assert_eq!(interp.var("P"), Some(Value::Number(14.0)));
        interp.with_graphics(|g| {
            assert_eq!((g.width(), g.height()), (640, 350));
            assert_eq!(g.active_ref().get_pixel(10, 10), 14);
            let at = (10 * 640 + 10) * 4;
            assert_eq!(&g.active_ref().bgra()[at..at + 3], &[0x55, 0xFF, 0xFF]);
        });
    }

    #[test]
    fn block_if_true_and_false() {
        let src = "10 X=5\n20 IF X>0 THEN\n30 PRINT \"P\"\n40 ELSE\n50 PRINT \"N\"\n60 END IF";
        assert_eq!(run_basic(src), "P");
        let src = "10 X=-1\n20 IF X>0 THEN\n30 PRINT \"P\"\n40 ELSE\n50 PRINT \"N\"\n60 END IF";
        assert_eq!(run_basic(src), "N");
    }

    #[test]
    fn block_elseif_chain() {
        let src = "\
10 X=2
20 IF X=1 THEN
30 PRINT \"ONE\"
40 ELSEIF X=2 THEN
50 PRINT \"TWO\"
60 ELSE
70 PRINT \"OTHER\"
80 END IF
90 PRINT \"DONE\"";
        assert_eq!(run_basic(src), "TWO\nDONE");
    }

    #[test]
    fn error_handler_resume_next() {
        let src = "\
10 ON ERROR GOTO 100
20 A=1/0
30 PRINT \"OK\"
40 END
100 PRINT \"E\";ERR
110 RESUME NEXT";
        assert_eq!(run_basic(src), "E 11 \nOK");
    }

    #[test]
    fn unhandled_error_names_code_and_line() {
        let (result, output, _) = run_full("10 A=1/0", &[]);
        let err = result.expect_err("should fail");
        assert_eq!(err.code(), 11);
        assert_eq!(err.line(), 10);
        assert!(output.contains("?Division by zero at line 10"));
    }

    #[test]
    fn resume_without_error_is_code_20() {
        assert_eq!(run_err("10 RESUME").code(), 20);
    }

    #[test]
    fn undefined_goto_target_is_code_8() {
        assert_eq!(run_err("10 GOTO 99").code(), 8);
    }

    #[test]
    fn next_without_for_is_code_1() {
        assert_eq!(run_err("10 NEXT I").code(), 1);
    }

    #[test]
    fn mismatched_next_variable_is_fatal() {
        assert_eq!(run_err("10 FOR I=1 TO 3\n20 NEXT J").code(), 1);
    }

    #[test]
    fn return_without_gosub_is_code_3() {
        assert_eq!(run_err("10 RETURN").code(), 3);
    }

    #[test]
    fn read_past_data_is_code_4() {
        assert_eq!(run_err("10 DATA 1\n20 READ A,B").code(), 4);
    }

    #[test]
    fn subscript_out_of_range_is_code_9() {
        assert_eq!(run_err("10 DIM A(5)\n20 A(6)=1").code(), 9);
    }

    #[test]
    fn type_mismatch_is_code_13() {
        assert_eq!(run_err("10 A = \"X\" * 2").code(), 13);
    }

    #[test]
    fn integer_overflow_is_code_6() {
        assert_eq!(run_err("10 A% = 40000").code(), 6);
    }

    #[test]
    fn while_wend() {
        let src = "10 I=0\n20 WHILE I<3\n30 I=I+1\n40 WEND\n50 PRINT I";
        assert_eq!(run_basic(src), " 3 ");
    }

    #[test]
    fn while_false_skips_body() {
        let src = "10 WHILE 0\n20 PRINT \"NO\"\n30 WEND\n40 PRINT \"YES\"";
        assert_eq!(run_basic(src), "YES");
    }

    #[test]
    fn inline_while_wend_is_a_noop_body() {
        let src = "10 I=9\n20 WHILE I<5 : WEND\n30 PRINT I";
        assert_eq!(run_basic(src), " 9 ");
    }

    #[test]
    fn do_loop_until() {
        let src = "10 I=0\n20 DO\n30 I=I+1\n40 LOOP UNTIL I>=3\n50 PRINT I";
        assert_eq!(run_basic(src), " 3 ");
    }

    #[test]
    fn do_while_false_never_enters() {
        let src = "10 DO WHILE 0\n20 PRINT \"NO\"\n30 LOOP\n40 PRINT \"OUT\"";
        assert_eq!(run_basic(src), "OUT");
    }

    #[test]
    fn exit_for_jumps_past_next() {
        let src = "10 FOR I=1 TO 10\n20 IF I=3 THEN EXIT FOR\n30 NEXT I\n40 PRINT I";
        assert_eq!(run_basic(src), " 3 ");
    }

    #[test]
    fn exit_do() {
        let src = "10 I=0\n20 DO\n30 I=I+1\n40 IF I=4 THEN EXIT DO\n50 LOOP\n60 PRINT I";
        assert_eq!(run_basic(src), " 4 ");
    }

    #[test]
    fn negative_step_counts_down() {
        let src = "10 FOR I=3 TO 1 STEP -1\n20 PRINT I;\n30 NEXT I";
        assert_eq!(run_basic(src), " 3  2  1 ");
    }

    #[test]
    fn select_case_forms() {
        let src = "\
10 X=3
20 SELECT CASE X
30 CASE 1
40 PRINT \"ONE\"
50 CASE 2 TO 4
60 PRINT \"FEW\"
70 CASE ELSE
80 PRINT \"MANY\"
90 END SELECT
100 PRINT \"DONE\"";
        assert_eq!(run_basic(src), "FEW\nDONE");

        let src = "\
10 X=9
20 SELECT CASE X
30 CASE IS > 5
40 PRINT \"BIG\"
50 END SELECT";
        assert_eq!(run_basic(src), "BIG");
    }

    #[test]
    fn select_case_else_taken() {
        let src = "\
10 X=7
20 SELECT CASE X
30 CASE 1, 2
40 PRINT \"LOW\"
50 CASE ELSE
60 PRINT \"ELSE\"
70 END SELECT";
        assert_eq!(run_basic(src), "ELSE");
    }

    #[test]
    fn sub_call_with_params() {
        let src = "\
10 SHOUT 3
20 END
30 SUB SHOUT (N)
40 PRINT N
50 END SUB";
        assert_eq!(run_basic(src), " 3 ");
    }

    #[test]
    fn call_keyword_form() {
        let src = "\
10 CALL SHOUT(7)
20 END
30 SUB SHOUT (N)
40 PRINT N
50 END SUB";
        assert_eq!(run_basic(src), " 7 ");
    }

    #[test]
    fn sub_binds_arrays_by_reference() {
        let src = "\
10 DIM A(5)
20 FILL A
30 PRINT A(2)
40 END
50 SUB FILL (B)
60 B(2) = 7
70 END SUB";
        assert_eq!(run_basic(src), " 7 ");
    }

    #[test]
    fn function_returns_its_name_variable() {
        let src = "\
10 X = TWICE(4)
20 PRINT X
30 END
40 FUNCTION TWICE (N)
50 TWICE = N * 2
60 END FUNCTION";
        assert_eq!(run_basic(src), " 8 ");
    }

    #[test]
    fn def_fn_and_contracted_call() {
        let src = "10 DEF FN DBL(X) = X * 2\n20 PRINT FN DBL(5)\n30 PRINT FNDBL(7)";
        assert_eq!(run_basic(src), " 10 \n 14 ");
    }

    #[test]
    fn def_fn_parameter_does_not_leak() {
        let src = "10 X = 5\n20 DEF FN SQ(X) = X * X\n30 Y = FN SQ(3)\n40 PRINT X; Y";
        assert_eq!(run_basic(src), " 5  9 ");
    }

    #[test]
    fn type_instances_and_field_access() {
        let src = "\
10 TYPE PT
20 X AS SINGLE
30 Y AS SINGLE
40 END TYPE
50 DIM P AS PT
60 P.X = 3
70 P.Y = 4
80 PRINT P.X + P.Y";
        assert_eq!(run_basic(src), " 7 ");
    }

    #[test]
    fn fixed_string_fields_keep_width() {
        let src = "\
10 TYPE REC
20 TAG AS STRING * 4
30 END TYPE
40 DIM R AS REC
50 R.TAG = \"ABCDEFG\"
60 PRINT R.TAG";
        assert_eq!(run_basic(src), "ABCD");
    }

    #[test]
    fn deftype_applies_to_first_letter() {
        let src = "10 DEFINT I-K\n20 J = 3.9\n30 PRINT J";
        assert_eq!(run_basic(src), " 3 ");
    }

    #[test]
    fn integer_sigil_truncates_toward_zero() {
        let src = "10 A% = -3.9\n20 PRINT A%";
        assert_eq!(run_basic(src), "-3 ");
    }

    #[test]
    fn dim_gives_upper_bound_plus_one_cells() {
        let src = "10 DIM A(10)\n20 A(10) = 5\n30 PRINT A(10)";
        assert_eq!(run_basic(src), " 5 ");
    }

    #[test]
    fn arrays_auto_dimension_to_ten() {
        let src = "10 A(4) = 2\n20 PRINT A(4); A(10)";
        assert_eq!(run_basic(src), " 2  0 ");
        assert_eq!(run_err("10 X = B(11)").code(), 9);
    }

    #[test]
    fn multi_dimensional_arrays() {
        let src = "10 DIM G(3, 3)\n20 G(1, 2) = 9\n30 PRINT G(1, 2); G(2, 1)";
        assert_eq!(run_basic(src), " 9  0 ");
    }

    #[test]
    fn redim_preserve_keeps_overlap() {
        let src = "10 DIM A(5)\n20 A(2) = 9\n30 REDIM PRESERVE A(10)\n40 PRINT A(2)";
        assert_eq!(run_basic(src), " 9 ");
        let src = "10 DIM A(5)\n20 A(2) = 9\n30 REDIM A(10)\n40 PRINT A(2)";
        assert_eq!(run_basic(src), " 0 ");
    }

    #[test]
    fn swap_exchanges_values() {
        let src = "10 A = 1\n20 B = 2\n30 SWAP A, B\n40 PRINT A; B";
        assert_eq!(run_basic(src), " 2  1 ");
    }

    #[test]
    fn const_shadows_variables() {
        let src = "10 CONST N = 41\n20 PRINT N + 1";
        assert_eq!(run_basic(src), " 42 ");
    }

    #[test]
    fn restore_to_line() {
        let src = "\
10 DATA 1,2
20 DATA 3
30 READ A, B
40 RESTORE 20
50 READ C
60 PRINT A+B+C";
        assert_eq!(run_basic(src), " 6 ");
    }

    #[test]
    fn read_strings_and_numbers() {
        let src = "10 DATA \"HI THERE\", 42, BARE\n20 READ A$, B, C$\n30 PRINT A$; B; C$";
        assert_eq!(run_basic(src), "HI THERE 42 BARE");
    }

    #[test]
    fn print_zones_and_separators() {
        assert_eq!(run_basic("10 PRINT \"A\",\"B\""), "A             B");
        assert_eq!(run_basic("10 PRINT 1;2"), " 1  2 ");
        assert_eq!(run_basic("10 PRINT \"A\";\n20 PRINT \"B\""), "AB");
    }

    #[test]
    fn print_tab_and_spc() {
        assert_eq!(run_basic("10 PRINT TAB(5); \"X\""), "    X");
        assert_eq!(run_basic("10 PRINT \"A\"; SPC(3); \"B\""), "A   B");
    }

    #[test]
    fn print_using_statement() {
        assert_eq!(run_basic("10 PRINT USING \"##.#\"; 3.26"), " 3.3");
    }

    #[test]
    fn string_builtins() {
        assert_eq!(run_basic("10 PRINT LEFT$(\"HELLO\", 2)"), "HE");
        assert_eq!(run_basic("10 PRINT UCASE$(\"hi\"); LCASE$(\"YO\")"), "HIyo");
        assert_eq!(run_basic("10 PRINT CHR$(65); ASC(\"A\")"), "A 65 ");
        assert_eq!(run_basic("10 PRINT MID$(\"ABCDEF\", 3, 2)"), "CD");
        assert_eq!(run_basic("10 PRINT INSTR(\"ABCDE\", \"CD\")"), " 3 ");
        assert_eq!(run_basic("10 PRINT HEX$(255); OCT$(8)"), "FF10");
    }

    #[test]
    fn val_str_round_trip() {
        let (result, _, interp) = run_full("10 X = VAL(STR$(3.25))", &[]);
        result.expect("should run");
        assert_eq!(interp.var("X"), Some(Value::Number(3.25)));
    }

    #[test]
    fn logical_operators_use_bit_patterns() {
        assert_eq!(run_basic("10 PRINT 6 AND 3"), " 2 ");
        assert_eq!(run_basic("10 PRINT 6 OR 3"), " 7 ");
        assert_eq!(run_basic("10 PRINT NOT 0"), "-1 ");
        assert_eq!(run_basic("10 PRINT 1 XOR 3"), " 2 ");
    }

    #[test]
    fn comparisons_return_minus_one_or_zero() {
        assert_eq!(run_basic("10 PRINT (2 > 1); (1 > 2)"), "-1  0 ");
        assert_eq!(run_basic("10 PRINT (\"A\" < \"B\")"), "-1 ");
    }

    #[test]
    fn plus_concatenates_text() {
        assert_eq!(run_basic("10 PRINT \"AB\" + \"CD\""), "ABCD");
        assert_eq!(run_basic("10 PRINT \"N=\" + 5"), "N=5");
    }

    #[test]
    fn integer_division_and_mod() {
        assert_eq!(run_basic("10 PRINT 7 \\ 2; 7 MOD 2"), " 3  1 ");
        assert_eq!(run_err("10 PRINT 1 \\ 0").code(), 11);
    }

    #[test]
    fn seeded_rnd_is_deterministic() {
        let src = "10 RANDOMIZE 42\n20 A = RND\n30 B = RND";
        let (r1, _, i1) = run_full(src, &[]);
        let (r2, _, i2) = run_full(src, &[]);
        r1.expect("run 1");
        r2.expect("run 2");
        assert_eq!(i1.var("A"), i2.var("A"));
        assert_eq!(i1.var("B"), i2.var("B"));
        let a = match i1.var("A") {
            Some(Value::Number(n)) => n,
            other => panic!("unexpected {:?}", other),
        };
        assert!((0.0..1.0).contains(&a));
    }

    #[test]
    fn rnd_zero_repeats_last() {
        let src = "10 RANDOMIZE 7\n20 A = RND\n30 B = RND(0)";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        assert_eq!(interp.var("A"), interp.var("B"));
    }

    #[test]
    fn input_assigns_by_sigil() {
        let (result, output, interp) = run_full("10 INPUT X, Y$\n20 PRINT Y$", &["5, HI"]);
        result.expect("should run");
        assert_eq!(interp.var("X"), Some(Value::Number(5.0)));
        assert!(output.contains("? "));
        assert!(output.ends_with("HI"));
    }

    #[test]
    fn input_prompt_with_semicolon_adds_question_mark() {
        let (_, output, _) = run_full("10 INPUT \"AGE\"; A", &["3"]);
        assert!(output.contains("AGE? "));
    }

    #[test]
    fn line_input_takes_whole_line() {
        let (result, _, interp) = run_full("10 LINE INPUT A$", &["1, 2, 3"]);
        result.expect("should run");
        assert_eq!(interp.var("A$"), Some(Value::Text("1, 2, 3".into())));
    }

    #[test]
    fn single_line_if_goto_shorthand() {
        let src = "10 IF 1 THEN 30\n20 PRINT \"NO\"\n30 PRINT \"YES\"";
        assert_eq!(run_basic(src), "YES");
    }

    #[test]
    fn on_goto_selects_by_index() {
        let src = "\
10 X = 2
20 ON X GOTO 100, 200
30 END
100 PRINT \"ONE\"
110 END
200 PRINT \"TWO\"";
        assert_eq!(run_basic(src), "TWO");
    }

    #[test]
    fn on_goto_zero_falls_through() {
        let src = "10 ON 0 GOTO 100\n20 PRINT \"THRU\"\n30 END\n100 PRINT \"NO\"";
        assert_eq!(run_basic(src), "THRU");
    }

    #[test]
    fn on_gosub_returns() {
        let src = "\
10 ON 1 GOSUB 100
20 PRINT \"BACK\"
30 END
100 PRINT \"IN\"
110 RETURN";
        assert_eq!(run_basic(src), "IN\nBACK");
    }

    #[test]
    fn labels_resolve_in_auto_numbered_programs() {
        let src = "\
PRINT \"X\"
GOTO done
PRINT \"SKIPPED\"
done:
PRINT \"END\"";
        assert_eq!(run_basic(src), "X\nEND");
    }

    #[test]
    fn compound_statements_run_in_order() {
        assert_eq!(run_basic("10 A=1 : A=A+1 : PRINT A"), " 2 ");
    }

    #[test]
    fn end_stops_before_subroutines() {
        let src = "10 PRINT \"MAIN\"\n20 END\n30 SUB NOPE\n40 PRINT \"NO\"\n50 END SUB";
        assert_eq!(run_basic(src), "MAIN");
    }

    #[test]
    fn stop_reports_break() {
        let (result, output, _) = run_full("10 PRINT \"A\"\n20 STOP\n30 PRINT \"B\"", &[]);
        result.expect("stop is a clean halt");
        assert_eq!(output, "A\nBreak in 20");
    }

    #[test]
    fn chunked_execution_resumes() {
        let mut interp = Interpreter::new();
        interp
            .load("10 X = 0\n20 FOR I = 1 TO 50\n30 X = X + 1\n40 NEXT I")
            .expect("load");
        interp.initialize_execution();
        let mut chunks = 0;
        loop {
            let more = interp.execute_chunk(10).expect("chunk");
            chunks += 1;
            if !more {
                break;
            }
            assert!(chunks < 1000, "runaway");
        }
        assert!(chunks > 1);
        assert_eq!(interp.var("X"), Some(Value::Number(50.0)));
    }

    #[test]
    fn run_async_invokes_yield_hook() {
        let mut interp = Interpreter::new();
        interp
            .load("10 FOR I = 1 TO 5000\n20 X = X + 1\n30 NEXT I")
            .expect("load");
        let mut yields = 0;
        interp
            .run_async(|| {
                yields += 1;
                true
            })
            .expect("run");
        assert!(yields >= 1);
        assert_eq!(interp.var("X"), Some(Value::Number(5000.0)));
    }

    #[test]
    fn cancellation_prints_break() {
        let console = Rc::new(RefCell::new(BufferConsole::new()));
        let mut interp = Interpreter::with_console(Box::new(console.clone()));
        interp.load("10 GOTO 10").expect("load");
        interp.initialize_execution();
        let handle = interp.cancel_handle();
        assert!(interp.execute_chunk(5).expect("chunk"));
        handle.store(true, Ordering::Relaxed);
        let more = interp.execute_chunk(100).expect("chunk");
        assert!(!more);
        assert_eq!(console.borrow().output(), "Break");
    }

    #[test]
    fn reset_clears_state_and_reruns() {
        let mut interp = Interpreter::new();
        interp.execute("10 X = 7").expect("first run");
        assert_eq!(interp.var("X"), Some(Value::Number(7.0)));
        interp.reset();
        assert_eq!(interp.var("X"), None);
        interp.execute("10 X = 9").expect("second run");
        assert_eq!(interp.var("X"), Some(Value::Number(9.0)));
    }

    #[test]
    fn stacks_unwound_on_clean_exit() {
        let src = "\
10 FOR I = 1 TO 2
20 GOSUB 100
30 NEXT I
40 END
100 RETURN";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        let state = interp.state.borrow();
        assert!(state.gosub_stack.is_empty());
        assert!(state.for_stack.is_empty());
        assert!(state.while_stack.is_empty());
        assert!(state.sub_stack.is_empty());
    }

    #[test]
    fn cls_twice_is_idempotent() {
        let src = "10 SCREEN 7\n20 PSET (5,5),3\n30 CLS\n40 CLS";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        interp.with_graphics(|g| {
            assert_eq!(g.active_ref().get_pixel(5, 5), 0);
            assert_eq!(g.cursor(), (1, 1));
        });
    }

    #[test]
    fn graphics_line_box_and_paint() {
        let src = "\
10 SCREEN 12
20 LINE (10,10)-(20,20),14,B
30 PAINT (15,15),2,14
40 LINE -(30,20),4";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        interp.with_graphics(|g| {
            let fb = g.active_ref();
            assert_eq!(fb.get_pixel(10, 10), 14);
            assert_eq!(fb.get_pixel(15, 15), 2);
            // LINE with no start runs from the last point (20,20)
            assert_eq!(fb.get_pixel(30, 20), 4);
        });
    }

    #[test]
    fn get_put_sprite_round_trip() {
        let src = "\
10 SCREEN 13
20 LINE (0,0)-(3,3),5,BF
30 GET (0,0)-(3,3), SPR
40 PUT (50,50), SPR, PSET";
        let (result, _, interp) = run_full(src, &[]);
        result.expect("should run");
        interp.with_graphics(|g| {
            assert_eq!(g.active_ref().get_pixel(50, 50), 5);
            assert_eq!(g.active_ref().get_pixel(53, 53), 5);
            assert_eq!(g.active_ref().get_pixel(54, 50), 0);
        });
    }

    #[test]
    fn text_prints_into_graphics_pages() {
        let src = "10 SCREEN 12\n20 PRINT \"HI\"";
        let (result, output, interp) = run_full(src, &[]);
        result.expect("should run");
        // Graphics-mode text goes to the framebuffer, not the console
        assert_eq!(output, "");
        interp.with_graphics(|g| {
            let mut ink = 0;
            for y in 0..16 {
                for x in 0..16 {
                    if g.active_ref().get_pixel(x, y) != 0 {
                        ink += 1;
                    }
                }
            }
            assert!(ink > 0);
        });
    }

    #[test]
    fn write_quotes_strings() {
        assert_eq!(run_basic("10 WRITE \"HI\", 2"), "\"HI\",2");
    }

    #[test]
    fn data_items_parse_types() {
        let items = parse_data_items("1, \"two, three\", 4x");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::Number(1.0));
        assert_eq!(items[1], Value::Text("two, three".into()));
        assert_eq!(items[2], Value::Text("4x".into()));
        assert!(parse_data_items("   ").is_empty());
    }
}
