use std::fmt;

use super::{ErrorKind, ExecError, MAX_NESTING};

/// A runtime value of the calculation language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Value>),
    Table(Table),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Table(_) => "table",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Table(t) => t.nrows() > 0,
        }
    }

    pub fn as_number(&self, what: &str) -> Result<f64, ExecError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => Err(ExecError::new(
                ErrorKind::Type,
                format!("{} must be a number, not {}", what, other.type_name()),
            )),
        }
    }

    /// Reads a list of numbers, as most statistics and finance builtins need.
    pub fn as_numbers(&self, what: &str) -> Result<Vec<f64>, ExecError> {
        match self {
            Value::List(items) => items
                .iter()
                .map(|v| v.as_number(&format!("every element of {}", what)))
                .collect(),
            other => Err(ExecError::new(
                ErrorKind::Type,
                format!("{} must be a list of numbers, not {}", what, other.type_name()),
            )),
        }
    }

    /// Container nesting depth; scalars are 0.
    pub fn depth(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            Value::Table(t) => 1 + t.cells().map(Value::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Passes the value through unless it nests deeper than [`MAX_NESTING`].
    pub fn within_nesting(self) -> Result<Value, ExecError> {
        if self.depth() > MAX_NESTING {
            return Err(too_deep());
        }
        Ok(self)
    }

    /// Text shown inside containers: strings are quoted.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("none"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Table(t) => write!(f, "{}", t),
        }
    }
}

pub(crate) fn too_deep() -> ExecError {
    ExecError::new(ErrorKind::Type, format!("values may nest at most {} levels deep", MAX_NESTING))
}

/// Integral values print without a fractional part; everything else uses the
/// shortest representation that round-trips.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A small column-oriented table. Every column has the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<(String, Vec<Value>)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nrows(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    fn cells(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().flat_map(|(_, values)| values.iter())
    }

    pub fn column(&self, name: &str) -> Result<&Vec<Value>, ExecError> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values)
            .ok_or_else(|| ExecError::new(ErrorKind::Index, format!("no column named '{}'", name)))
    }

    /// Adds a column, or replaces the column of the same name.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), ExecError> {
        let replacing = self.columns.iter().position(|(n, _)| n == name);
        let others = self.columns.len() - usize::from(replacing.is_some());
        if others > 0 && values.len() != self.nrows() {
            return Err(ExecError::new(
                ErrorKind::Argument,
                format!(
                    "column '{}' has {} values but the table has {} rows",
                    name,
                    values.len(),
                    self.nrows()
                ),
            ));
        }
        match replacing {
            Some(i) => self.columns[i].1 = values,
            None => self.columns.push((name.to_string(), values)),
        }
        Ok(())
    }

    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values.iter().take(n).cloned().collect()))
                .collect(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return f.write_str("(empty table)");
        }
        let index_width = self.nrows().saturating_sub(1).to_string().len();
        let cells: Vec<Vec<String>> = self
            .columns
            .iter()
            .map(|(_, values)| values.iter().map(|v| v.to_string()).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .zip(&cells)
            .map(|((name, _), col)| {
                col.iter().map(|c| c.chars().count()).chain([name.chars().count()]).max().unwrap_or(0)
            })
            .collect();

        write!(f, "{:width$}", "", width = index_width)?;
        for ((name, _), width) in self.columns.iter().zip(&widths) {
            write!(f, "  {:>width$}", name, width = width)?;
        }
        for row in 0..self.nrows() {
            write!(f, "\n{:<width$}", row, width = index_width)?;
            for (col, width) in cells.iter().zip(&widths) {
                write!(f, "  {:>width$}", col[row], width = width)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_print_like_a_calculator() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }

    #[test]
    fn lists_quote_their_strings() {
        let list = Value::List(vec![Value::Number(1.0), Value::Str("a".into()), Value::Bool(true)]);
        assert_eq!(list.to_string(), "[1, 'a', true]");
    }

    #[test]
    fn nesting_depth_is_capped() {
        let mut value = Value::Number(1.0);
        for _ in 0..MAX_NESTING {
            value = Value::List(vec![value]);
        }
        assert_eq!(value.depth(), MAX_NESTING);
        let value = value.within_nesting().unwrap();
        let err = Value::List(vec![value]).within_nesting().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn table_renders_right_aligned_columns() {
        let mut table = Table::new();
        table.set_column("year", vec![Value::Number(2023.0), Value::Number(2024.0)]).unwrap();
        table.set_column("rev", vec![Value::Number(1.5), Value::Number(12.25)]).unwrap();
        assert_eq!(table.to_string(), "   year    rev\n0  2023    1.5\n1  2024  12.25");
        assert!(table.set_column("bad", vec![Value::None]).is_err());
    }
}
