use std::collections::HashMap;
use std::time::Instant;

use super::builtins;
use super::parser::{self, BinOp, Expr, Stmt, StmtKind};
use super::value::{too_deep, Value};
use super::{ErrorKind, ExecError, SandboxLimits, MAX_NESTING};

/// Captured `print` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub text: String,
    /// Set once output beyond the cap was dropped.
    pub truncated: bool,
}

/// Tree-walking evaluator. One instance runs one snippet.
pub struct Interpreter {
    vars: HashMap<String, Value>,
    output: Output,
    steps: u64,
    limits: SandboxLimits,
    deadline: Instant,
}

impl Interpreter {
    pub fn new(limits: SandboxLimits, deadline: Instant) -> Self {
        Self {
            vars: HashMap::new(),
            output: Output::default(),
            steps: 0,
            limits,
            deadline,
        }
    }

    pub fn run(mut self, source: &str) -> Result<Output, ExecError> {
        let program = parser::parse(source)?;
        self.exec_block(&program)?;
        Ok(self.output)
    }

    /// Charges `cost` evaluation steps and checks the wall clock.
    pub fn tick(&mut self, cost: u64) -> Result<(), ExecError> {
        self.steps = self.steps.saturating_add(cost);
        if self.steps > self.limits.max_steps {
            return Err(ExecError::new(
                ErrorKind::StepLimit,
                format!("step budget of {} exceeded", self.limits.max_steps),
            ));
        }
        if Instant::now() >= self.deadline {
            return Err(ExecError::new(
                ErrorKind::Timeout,
                format!("execution exceeded {} ms", self.limits.timeout.as_millis()),
            ));
        }
        Ok(())
    }

    pub fn write_output(&mut self, text: &str) {
        if self.output.truncated {
            return;
        }
        self.output.text.push_str(text);
        let max = self.limits.max_output;
        if self.output.text.len() > max {
            let mut cut = max;
            while !self.output.text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.text.truncate(cut);
            self.output.truncated = true;
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), ExecError> {
        for stmt in stmts {
            self.exec(stmt).map_err(|mut err| {
                if err.kind != ErrorKind::Syntax {
                    err.trace.insert(0, stmt.line);
                }
                err
            })?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ExecError> {
        self.tick(1)?;
        match &stmt.kind {
            StmtKind::Assign(name, expr) => {
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value);
            }
            StmtKind::AssignIndex(name, index, expr) => {
                let index = self.eval(index)?;
                let value = self.eval(expr)?;
                self.assign_index(name, index, value)?;
            }
            StmtKind::If(condition, then_branch, else_branch) => {
                if self.eval(condition)?.truthy() {
                    self.exec_block(then_branch)?;
                } else {
                    self.exec_block(else_branch)?;
                }
            }
            StmtKind::For(name, iterable, body) => {
                let items = match self.eval(iterable)? {
                    Value::List(items) => items,
                    Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                    Value::Table(t) => t.column_names().map(|n| Value::Str(n.to_string())).collect(),
                    other => {
                        return Err(ExecError::new(
                            ErrorKind::Type,
                            format!("{} is not iterable", other.type_name()),
                        ))
                    }
                };
                for item in items {
                    self.tick(1)?;
                    self.vars.insert(name.clone(), item);
                    self.exec_block(body)?;
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(())
    }

    fn assign_index(&mut self, name: &str, index: Value, value: Value) -> Result<(), ExecError> {
        // Storing into a container adds one level around the stored value.
        if value.depth() >= MAX_NESTING {
            return Err(too_deep());
        }
        let target = self.vars.get_mut(name).ok_or_else(|| undefined(name))?;
        match (target, index) {
            (Value::List(items), Value::Number(i)) => {
                let i = resolve_index(i, items.len())?;
                items[i] = value;
                Ok(())
            }
            (Value::Table(table), Value::Str(column)) => match value {
                Value::List(values) => table.set_column(&column, values),
                other => Err(ExecError::new(
                    ErrorKind::Type,
                    format!("a table column must be a list, not {}", other.type_name()),
                )),
            },
            (target, index) => Err(ExecError::new(
                ErrorKind::Type,
                format!(
                    "cannot assign to a {} element with a {} index",
                    target.type_name(),
                    index.type_name()
                ),
            )),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        self.tick(1)?;
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Var(name) => self.vars.get(name).cloned().ok_or_else(|| undefined(name)),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Value::List(values).within_nesting()
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, index)
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                builtins::call(self, name, values)?.within_nesting()
            }
            Expr::Neg(inner) => {
                let n = self.eval(inner)?.as_number("operand of unary -")?;
                Ok(Value::Number(-n))
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            Expr::And(left, right) => {
                if !self.eval(left)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.truthy()))
            }
            Expr::Or(left, right) => {
                if self.eval(left)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.truthy()))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)
            }
        }
    }

    fn binary(&mut self, op: BinOp, left: Value, right: Value) -> Result<Value, ExecError> {
        match op {
            BinOp::Eq => return Ok(Value::Bool(left == right)),
            BinOp::NotEq => return Ok(Value::Bool(left != right)),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => return compare(op, &left, &right),
            _ => {}
        }

        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.tick((a.len() + b.len()) as u64)?;
                Ok(Value::Str(a + &b))
            }
            (BinOp::Add, Value::List(mut a), Value::List(b)) => {
                self.tick((a.len() + b.len()) as u64)?;
                a.extend(b);
                Ok(Value::List(a))
            }
            (op, left, right) => {
                let (a, b) = match (&left, &right) {
                    (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => {
                        (left.as_number("left operand")?, right.as_number("right operand")?)
                    }
                    _ => {
                        return Err(ExecError::new(
                            ErrorKind::Type,
                            format!(
                                "unsupported operand types for {}: {} and {}",
                                symbol(op),
                                left.type_name(),
                                right.type_name()
                            ),
                        ))
                    }
                };
                arithmetic(op, a, b).map(Value::Number)
            }
        }
    }
}

fn undefined(name: &str) -> ExecError {
    if builtins::NAMES.contains(&name) {
        ExecError::new(ErrorKind::Name, format!("'{}' is a function; call it as {}(...)", name, name))
    } else {
        ExecError::new(ErrorKind::Name, format!("name '{}' is not defined", name))
    }
}

fn symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
        BinOp::Eq => "==",
        BinOp::NotEq => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    }
}

pub(crate) fn arithmetic(op: BinOp, a: f64, b: f64) -> Result<f64, ExecError> {
    let math = |message: &str| ExecError::new(ErrorKind::Math, message);
    match op {
        BinOp::Add => Ok(a + b),
        BinOp::Sub => Ok(a - b),
        BinOp::Mul => Ok(a * b),
        BinOp::Div if b == 0.0 => Err(math("division by zero")),
        BinOp::Div => Ok(a / b),
        BinOp::Mod if b == 0.0 => Err(math("modulo by zero")),
        // The result takes the sign of the divisor.
        BinOp::Mod => Ok(a - b * (a / b).floor()),
        BinOp::Pow => {
            let result = a.powf(b);
            if result.is_nan() && !a.is_nan() && !b.is_nan() {
                Err(math("math domain error"))
            } else if result.is_infinite() && a.is_finite() && b.is_finite() {
                if a == 0.0 {
                    Err(math("zero cannot be raised to a negative power"))
                } else {
                    Err(math("numeric overflow"))
                }
            } else {
                Ok(result)
            }
        }
        other => Err(ExecError::new(
            ErrorKind::Type,
            format!("'{}' is not an arithmetic operator", symbol(other)),
        )),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExecError> {
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => left
            .as_number("left operand")?
            .partial_cmp(&right.as_number("right operand")?),
        _ => {
            return Err(ExecError::new(
                ErrorKind::Type,
                format!(
                    "'{}' not supported between {} and {}",
                    symbol(op),
                    left.type_name(),
                    right.type_name()
                ),
            ))
        }
    };
    // Any comparison involving NaN is false.
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

/// Resolves a possibly negative index against a length.
pub(crate) fn resolve_index(index: f64, len: usize) -> Result<usize, ExecError> {
    if index.fract() != 0.0 || !index.is_finite() {
        return Err(ExecError::new(
            ErrorKind::Type,
            format!("indices must be whole numbers, not {}", index),
        ));
    }
    let i = index as i64;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ExecError::new(
            ErrorKind::Index,
            format!("index {} out of range for length {}", i, len),
        ));
    }
    Ok(resolved as usize)
}

fn index_value(target: Value, index: Value) -> Result<Value, ExecError> {
    match (target, index) {
        (Value::List(mut items), Value::Number(i)) => {
            let i = resolve_index(i, items.len())?;
            Ok(items.swap_remove(i))
        }
        (Value::Str(s), Value::Number(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = resolve_index(i, chars.len())?;
            Ok(Value::Str(chars[i].to_string()))
        }
        (Value::Table(table), Value::Str(name)) => Ok(Value::List(table.column(&name)?.clone())),
        (target, index) => Err(ExecError::new(
            ErrorKind::Type,
            format!("cannot index a {} with a {}", target.type_name(), index.type_name()),
        )),
    }
}
