use super::interp::{arithmetic, Interpreter};
use super::parser::BinOp;
use super::value::{Table, Value};
use super::{ErrorKind, ExecError};

/// Every function a snippet may call. Nothing else is reachable.
pub const NAMES: &[&str] = &[
    "print",
    // numeric
    "abs", "round", "sqrt", "exp", "ln", "log10", "pow", "min", "max", "floor", "ceil",
    // collections
    "len", "range", "sum", "sorted", "append", "cumsum", "pct_change",
    // statistics
    "mean", "median", "var", "std", "corr", "percentile",
    // finance
    "npv", "irr", "pmt", "fv", "pv", "cagr",
    // conversion
    "str", "num",
    // tables
    "table", "column", "head", "with_column", "describe", "nrows",
];

/// Longest list `range` will build.
const MAX_RANGE: usize = 1_000_000;

pub fn call(interp: &mut Interpreter, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let a = Args { name, values: args };
    match name {
        "print" => {
            let parts: Vec<String> = a.values.iter().map(|v| v.to_string()).collect();
            let mut line = parts.join(" ");
            line.push('\n');
            interp.write_output(&line);
            Ok(Value::None)
        }

        "abs" => unary(&a, f64::abs),
        "floor" => unary(&a, f64::floor),
        "ceil" => unary(&a, f64::ceil),
        "exp" => unary(&a, f64::exp),
        "sqrt" => {
            a.arity(1, 1)?;
            let x = a.num(0)?;
            domain(x >= 0.0)?;
            Ok(Value::Number(x.sqrt()))
        }
        "ln" | "log10" => {
            a.arity(1, 1)?;
            let x = a.num(0)?;
            domain(x > 0.0)?;
            Ok(Value::Number(if name == "ln" { x.ln() } else { x.log10() }))
        }
        "pow" => {
            a.arity(2, 2)?;
            arithmetic(BinOp::Pow, a.num(0)?, a.num(1)?).map(Value::Number)
        }
        "round" => {
            a.arity(1, 2)?;
            let x = a.num(0)?;
            let digits = if a.len() > 1 { a.num(1)? } else { 0.0 };
            let factor = 10f64.powi(digits as i32);
            Ok(Value::Number((x * factor).round() / factor))
        }
        "min" | "max" => {
            let values = match a.values.as_slice() {
                [Value::List(_)] => a.numbers(0)?,
                [] => return Err(a.error("expected at least one argument")),
                _ => (0..a.len()).map(|i| a.num(i)).collect::<Result<Vec<f64>, _>>()?,
            };
            let pick = if name == "min" { f64::min } else { f64::max };
            values
                .into_iter()
                .reduce(pick)
                .map(Value::Number)
                .ok_or_else(|| a.error("argument is an empty list"))
        }

        "len" => {
            a.arity(1, 1)?;
            let n = match &a.values[0] {
                Value::List(items) => items.len(),
                Value::Str(s) => s.chars().count(),
                Value::Table(t) => t.nrows(),
                other => return Err(a.type_error(&format!("{} has no length", other.type_name()))),
            };
            Ok(Value::Number(n as f64))
        }
        "range" => {
            a.arity(1, 3)?;
            let (start, stop, step) = match a.len() {
                1 => (0.0, a.num(0)?, 1.0),
                2 => (a.num(0)?, a.num(1)?, 1.0),
                _ => (a.num(0)?, a.num(1)?, a.num(2)?),
            };
            if step == 0.0 {
                return Err(a.error("step must not be zero"));
            }
            let count = ((stop - start) / step).ceil().max(0.0);
            if count > MAX_RANGE as f64 {
                return Err(a.error(&format!("{} elements exceed the limit of {}", count, MAX_RANGE)));
            }
            let count = count as usize;
            interp.tick(count as u64)?;
            Ok(Value::List((0..count).map(|i| Value::Number(start + step * i as f64)).collect()))
        }
        "sum" => {
            a.arity(1, 1)?;
            Ok(Value::Number(a.numbers(0)?.iter().sum()))
        }
        "sorted" => {
            a.arity(1, 1)?;
            let mut items = a.list(0)?.clone();
            if items.iter().all(|v| matches!(v, Value::Number(_))) {
                items.sort_by(|x, y| match (x, y) {
                    (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
                    _ => std::cmp::Ordering::Equal,
                });
            } else if items.iter().all(|v| matches!(v, Value::Str(_))) {
                items.sort_by(|x, y| x.to_string().cmp(&y.to_string()));
            } else {
                return Err(a.type_error("can only sort a list of numbers or a list of strings"));
            }
            Ok(Value::List(items))
        }
        "append" => {
            a.arity(2, 2)?;
            let mut items = a.list(0)?.clone();
            items.push(a.values[1].clone());
            Ok(Value::List(items))
        }
        "cumsum" => {
            a.arity(1, 1)?;
            let mut running = 0.0;
            Ok(numbers_to_list(a.numbers(0)?.into_iter().map(|x| {
                running += x;
                running
            })))
        }
        "pct_change" => {
            a.arity(1, 1)?;
            let xs = a.numbers(0)?;
            let mut changes = Vec::with_capacity(xs.len().saturating_sub(1));
            for pair in xs.windows(2) {
                changes.push(arithmetic(BinOp::Div, pair[1] - pair[0], pair[0])?);
            }
            Ok(numbers_to_list(changes))
        }

        "mean" => {
            a.arity(1, 1)?;
            Ok(Value::Number(mean(&a.non_empty(0)?)))
        }
        "median" => {
            a.arity(1, 1)?;
            Ok(Value::Number(percentile(a.non_empty(0)?, 50.0)))
        }
        "var" | "std" => {
            a.arity(1, 1)?;
            let xs = a.numbers(0)?;
            if xs.len() < 2 {
                return Err(a.error("needs at least two values"));
            }
            let v = variance(&xs);
            Ok(Value::Number(if name == "var" { v } else { v.sqrt() }))
        }
        "corr" => {
            a.arity(2, 2)?;
            let (xs, ys) = (a.numbers(0)?, a.numbers(1)?);
            if xs.len() != ys.len() || xs.len() < 2 {
                return Err(a.error("needs two lists of the same length, with at least two values"));
            }
            let (mx, my) = (mean(&xs), mean(&ys));
            let cov: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mx) * (y - my)).sum();
            let sx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum::<f64>().sqrt();
            let sy: f64 = ys.iter().map(|y| (y - my).powi(2)).sum::<f64>().sqrt();
            if sx == 0.0 || sy == 0.0 {
                return Err(ExecError::new(ErrorKind::Math, "corr() of a constant series"));
            }
            Ok(Value::Number(cov / (sx * sy)))
        }
        "percentile" => {
            a.arity(2, 2)?;
            let p = a.num(1)?;
            if !(0.0..=100.0).contains(&p) {
                return Err(a.error("percentile must be between 0 and 100"));
            }
            Ok(Value::Number(percentile(a.non_empty(0)?, p)))
        }

        "npv" => {
            a.arity(2, 2)?;
            let rate = a.num(0)?;
            domain(rate > -1.0)?;
            Ok(Value::Number(npv(rate, &a.numbers(1)?)))
        }
        "irr" => {
            a.arity(1, 1)?;
            irr(&a.numbers(0)?).map(Value::Number)
        }
        "pmt" => {
            a.arity(3, 4)?;
            let (rate, nper, pv) = (a.num(0)?, a.num(1)?, a.num(2)?);
            let fv = a.optional_num(3, 0.0)?;
            if nper == 0.0 {
                return Err(a.error("nper must not be zero"));
            }
            let payment = if rate == 0.0 {
                -(fv + pv) / nper
            } else {
                let growth = (1.0 + rate).powf(nper);
                -(fv + pv * growth) * rate / (growth - 1.0)
            };
            Ok(Value::Number(payment))
        }
        "fv" => {
            a.arity(3, 4)?;
            let (rate, nper, pmt) = (a.num(0)?, a.num(1)?, a.num(2)?);
            let pv = a.optional_num(3, 0.0)?;
            let value = if rate == 0.0 {
                -(pv + pmt * nper)
            } else {
                let growth = (1.0 + rate).powf(nper);
                -(pv * growth + pmt * (growth - 1.0) / rate)
            };
            Ok(Value::Number(value))
        }
        "pv" => {
            a.arity(3, 4)?;
            let (rate, nper, pmt) = (a.num(0)?, a.num(1)?, a.num(2)?);
            let fv = a.optional_num(3, 0.0)?;
            let value = if rate == 0.0 {
                -(fv + pmt * nper)
            } else {
                let growth = (1.0 + rate).powf(nper);
                -(fv + pmt * (growth - 1.0) / rate) / growth
            };
            Ok(Value::Number(value))
        }
        "cagr" => {
            a.arity(3, 3)?;
            let (begin, end, years) = (a.num(0)?, a.num(1)?, a.num(2)?);
            if begin <= 0.0 || years <= 0.0 {
                return Err(a.error("begin value and years must be positive"));
            }
            Ok(Value::Number((end / begin).powf(1.0 / years) - 1.0))
        }

        "str" => {
            a.arity(1, 1)?;
            Ok(Value::Str(a.values[0].to_string()))
        }
        "num" => {
            a.arity(1, 1)?;
            match &a.values[0] {
                Value::Str(s) => s.trim().replace(',', "").parse::<f64>().map(Value::Number).map_err(|_| {
                    ExecError::new(ErrorKind::Type, format!("could not convert '{}' to a number", s))
                }),
                other => other.as_number("argument of num()").map(Value::Number),
            }
        }

        "table" => {
            if a.len() == 0 || a.len() % 2 != 0 {
                return Err(a.error("expects name, values pairs"));
            }
            let mut table = Table::new();
            for i in (0..a.len()).step_by(2) {
                table.set_column(a.string(i)?, a.list(i + 1)?.clone())?;
            }
            Ok(Value::Table(table))
        }
        "column" => {
            a.arity(2, 2)?;
            Ok(Value::List(a.table(0)?.column(a.string(1)?)?.clone()))
        }
        "head" => {
            a.arity(1, 2)?;
            let n = a.optional_num(1, 5.0)?.max(0.0) as usize;
            Ok(Value::Table(a.table(0)?.head(n)))
        }
        "with_column" => {
            a.arity(3, 3)?;
            let mut table = a.table(0)?.clone();
            table.set_column(a.string(1)?, a.list(2)?.clone())?;
            Ok(Value::Table(table))
        }
        "nrows" => {
            a.arity(1, 1)?;
            Ok(Value::Number(a.table(0)?.nrows() as f64))
        }
        "describe" => {
            a.arity(1, 1)?;
            describe(a.table(0)?).ok_or_else(|| a.error("table has no numeric columns"))
        }

        _ => Err(ExecError::new(ErrorKind::Name, format!("name '{}' is not defined", name))),
    }
}

struct Args<'a> {
    name: &'a str,
    values: Vec<Value>,
}

impl Args<'_> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn error(&self, message: &str) -> ExecError {
        ExecError::new(ErrorKind::Argument, format!("{}(): {}", self.name, message))
    }

    fn type_error(&self, message: &str) -> ExecError {
        ExecError::new(ErrorKind::Type, format!("{}(): {}", self.name, message))
    }

    fn arity(&self, min: usize, max: usize) -> Result<(), ExecError> {
        let n = self.len();
        if n < min || n > max {
            let expected = if min == max { min.to_string() } else { format!("{} to {}", min, max) };
            return Err(self.error(&format!("takes {} arguments ({} given)", expected, n)));
        }
        Ok(())
    }

    fn num(&self, i: usize) -> Result<f64, ExecError> {
        self.values[i].as_number(&format!("argument {} of {}()", i + 1, self.name))
    }

    fn optional_num(&self, i: usize, default: f64) -> Result<f64, ExecError> {
        if i < self.len() { self.num(i) } else { Ok(default) }
    }

    fn numbers(&self, i: usize) -> Result<Vec<f64>, ExecError> {
        self.values[i].as_numbers(&format!("argument {} of {}()", i + 1, self.name))
    }

    fn non_empty(&self, i: usize) -> Result<Vec<f64>, ExecError> {
        let xs = self.numbers(i)?;
        if xs.is_empty() {
            return Err(self.error("argument is an empty list"));
        }
        Ok(xs)
    }

    fn list(&self, i: usize) -> Result<&Vec<Value>, ExecError> {
        match &self.values[i] {
            Value::List(items) => Ok(items),
            other => Err(self.type_error(&format!("argument {} must be a list, not {}", i + 1, other.type_name()))),
        }
    }

    fn string(&self, i: usize) -> Result<&str, ExecError> {
        match &self.values[i] {
            Value::Str(s) => Ok(s),
            other => Err(self.type_error(&format!("argument {} must be a string, not {}", i + 1, other.type_name()))),
        }
    }

    fn table(&self, i: usize) -> Result<&Table, ExecError> {
        match &self.values[i] {
            Value::Table(t) => Ok(t),
            other => Err(self.type_error(&format!("argument {} must be a table, not {}", i + 1, other.type_name()))),
        }
    }
}

fn unary(a: &Args<'_>, f: fn(f64) -> f64) -> Result<Value, ExecError> {
    a.arity(1, 1)?;
    Ok(Value::Number(f(a.num(0)?)))
}

fn domain(ok: bool) -> Result<(), ExecError> {
    if ok {
        Ok(())
    } else {
        Err(ExecError::new(ErrorKind::Math, "math domain error"))
    }
}

fn numbers_to_list(xs: impl IntoIterator<Item = f64>) -> Value {
    Value::List(xs.into_iter().map(Value::Number).collect())
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (n - 1 denominator).
fn variance(xs: &[f64]) -> f64 {
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Linear interpolation between closest ranks. `xs` must be non-empty.
fn percentile(mut xs: Vec<f64>, p: f64) -> f64 {
    xs.sort_by(f64::total_cmp);
    let rank = p / 100.0 * (xs.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    xs[lower] + (xs[upper] - xs[lower]) * (rank - lower as f64)
}

/// Net present value with the first flow at t = 0.
fn npv(rate: f64, flows: &[f64]) -> f64 {
    flows
        .iter()
        .enumerate()
        .map(|(t, cf)| cf / (1.0 + rate).powi(t as i32))
        .sum()
}

fn npv_derivative(rate: f64, flows: &[f64]) -> f64 {
    flows
        .iter()
        .enumerate()
        .map(|(t, cf)| -(t as f64) * cf / (1.0 + rate).powi(t as i32 + 1))
        .sum()
}

fn irr(flows: &[f64]) -> Result<f64, ExecError> {
    let has_inflow = flows.iter().any(|cf| *cf > 0.0);
    let has_outflow = flows.iter().any(|cf| *cf < 0.0);
    if !has_inflow || !has_outflow {
        return Err(ExecError::new(
            ErrorKind::Math,
            "irr() needs both positive and negative cash flows",
        ));
    }

    let mut rate = 0.1;
    for _ in 0..100 {
        let value = npv(rate, flows);
        let slope = npv_derivative(rate, flows);
        if slope == 0.0 || !slope.is_finite() {
            break;
        }
        let next = rate - value / slope;
        if !next.is_finite() || next <= -1.0 {
            break;
        }
        if (next - rate).abs() < 1e-12 {
            return Ok(next);
        }
        rate = next;
    }

    // Newton failed to settle; fall back to bisection over a bracketing interval.
    let (mut lo, mut hi) = (-0.9999, 1.0);
    while npv(lo, flows).signum() == npv(hi, flows).signum() {
        hi *= 2.0;
        if hi > 1e6 {
            return Err(ExecError::new(ErrorKind::Math, "irr() did not converge"));
        }
    }
    for _ in 0..200 {
        let mid = (lo + hi) / 2.0;
        if npv(mid, flows).signum() == npv(lo, flows).signum() {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok((lo + hi) / 2.0)
}

fn describe(table: &Table) -> Option<Value> {
    const STATS: [&str; 8] = ["count", "mean", "std", "min", "25%", "50%", "75%", "max"];
    let mut summary = Table::new();
    summary
        .set_column("stat", STATS.iter().map(|s| Value::Str(s.to_string())).collect())
        .ok()?;

    let mut numeric = 0;
    for name in table.column_names() {
        let Ok(values) = table.column(name) else { continue };
        let xs: Option<Vec<f64>> = values
            .iter()
            .map(|v| match v {
                Value::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        let Some(xs) = xs.filter(|xs| !xs.is_empty()) else { continue };
        let std = if xs.len() > 1 { variance(&xs).sqrt() } else { f64::NAN };
        let stats = [
            xs.len() as f64,
            mean(&xs),
            std,
            percentile(xs.clone(), 0.0),
            percentile(xs.clone(), 25.0),
            percentile(xs.clone(), 50.0),
            percentile(xs.clone(), 75.0),
            percentile(xs, 100.0),
        ];
        summary
            .set_column(name, stats.into_iter().map(Value::Number).collect())
            .ok()?;
        numeric += 1;
    }
    (numeric > 0).then_some(Value::Table(summary))
}
