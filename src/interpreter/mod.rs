//! Embedded guest-language engine.
//!
//! The engine is deliberately opaque to the rest of the crate: code goes in,
//! stdout/stderr lines and a structured value come out. It owns no network
//! capability of its own - the `fetch` builtin routes through an injected
//! [`FetchPrimitive`], which is how the sandbox stays closed: the only way
//! guest code reaches the network is the bridge the host controls.
//!
//! There is no module-level state. Each run constructs a fresh interpreter,
//! so nothing leaks across runs.

mod lexer;
mod parser;
mod value;

pub use parser::{parse, BinOp, Expr, Stmt};
pub use value::{format_number, Value};

use std::fmt;

use base64::Engine as _;
use tracing::debug;

use crate::error::RunnerError;
use crate::protocol::{FetchRequest, HttpMethod};

/// Error raised out of guest code.
///
/// Fetch timeouts stay distinct from ordinary exceptions so the caller can
/// label them as a timeout kind rather than folding them into message text.
#[derive(Debug, Clone, PartialEq)]
pub enum GuestError {
    /// Exception raised inside guest code (including failed fetches)
    Exception(String),
    /// The fetch poll loop exceeded its bound
    FetchTimeout(String),
}

impl GuestError {
    pub fn message(&self) -> &str {
        match self {
            GuestError::Exception(msg) => msg,
            GuestError::FetchTimeout(msg) => msg,
        }
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// The worker-side network override. The guest's `fetch` builtin blocks on
/// this call until a response or error is available.
pub trait FetchPrimitive: Send {
    fn fetch(&mut self, request: FetchRequest) -> Result<Vec<u8>, RunnerError>;
}

/// A primitive that refuses every fetch. Used when a session runs without a
/// host (engine unit tests, offline evaluation).
pub struct NoFetch;

impl FetchPrimitive for NoFetch {
    fn fetch(&mut self, request: FetchRequest) -> Result<Vec<u8>, RunnerError> {
        Err(RunnerError::FetchTransport(format!(
            "no network capability available for {}",
            request.url
        )))
    }
}

/// Tree-walking interpreter for one run.
pub struct Interpreter {
    /// Bindings in first-assignment order; reassignment keeps the slot
    scope: Vec<(String, Value)>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    fetch: Box<dyn FetchPrimitive>,
}

impl Interpreter {
    pub fn new(fetch: Box<dyn FetchPrimitive>) -> Self {
        Interpreter {
            scope: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            fetch,
        }
    }

    /// Execute a program, returning the value of its last statement.
    ///
    /// Output captured before a failure stays in the stream buffers; the
    /// caller drains them with [`Interpreter::take_streams`] either way.
    pub fn execute(&mut self, source: &str) -> Result<Value, GuestError> {
        let stmts = parse(source).map_err(|e| GuestError::Exception(format!("syntax error: {}", e)))?;

        let mut last = Value::Unit;
        for stmt in stmts {
            last = self.eval_stmt(stmt)?;
        }
        Ok(last)
    }

    /// Drain captured stdout/stderr lines.
    pub fn take_streams(&mut self) -> (Vec<String>, Vec<String>) {
        (
            std::mem::take(&mut self.stdout),
            std::mem::take(&mut self.stderr),
        )
    }

    /// Figure-producing values in the final scope, in binding order.
    pub fn scope_figures(&self) -> Vec<&Value> {
        self.scope
            .iter()
            .map(|(_, value)| value)
            .filter(|value| matches!(value, Value::Plot(_) | Value::Markup(_)))
            .collect()
    }

    fn eval_stmt(&mut self, stmt: Stmt) -> Result<Value, GuestError> {
        match stmt {
            // Imports only feed dependency inference; at eval they are no-ops
            Stmt::Import(name) => {
                debug!(package = %name, "Guest import statement");
                Ok(Value::Unit)
            }
            Stmt::Assign(name, expr) => {
                let value = self.eval_expr(&expr)?;
                self.bind(name, value.clone());
                Ok(value)
            }
            Stmt::Expr(expr) => self.eval_expr(&expr),
        }
    }

    fn bind(&mut self, name: String, value: Value) {
        if let Some(slot) = self.scope.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.scope.push((name, value));
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, GuestError> {
        self.scope
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| GuestError::Exception(format!("undefined variable '{}'", name)))
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, GuestError> {
        match expr {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Var(name) => self.lookup(name),
            Expr::Neg(inner) => match self.eval_expr(inner)? {
                Value::Num(n) => Ok(Value::Num(-n)),
                other => Err(GuestError::Exception(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            },
            Expr::Binary(left, op, right) => {
                let left = self.eval_expr(left)?;
                let right = self.eval_expr(right)?;
                self.eval_binary(left, *op, right)
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                self.call_builtin(name, values)
            }
        }
    }

    fn eval_binary(&self, left: Value, op: BinOp, right: Value) -> Result<Value, GuestError> {
        use BinOp::*;
        match (left, right) {
            (Value::Num(a), Value::Num(b)) => match op {
                Add => Ok(Value::Num(a + b)),
                Sub => Ok(Value::Num(a - b)),
                Mul => Ok(Value::Num(a * b)),
                Div => {
                    if b == 0.0 {
                        Err(GuestError::Exception("division by zero".to_string()))
                    } else {
                        Ok(Value::Num(a / b))
                    }
                }
                Mod => {
                    if b == 0.0 {
                        Err(GuestError::Exception("division by zero".to_string()))
                    } else {
                        Ok(Value::Num(a % b))
                    }
                }
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                Lt => Ok(Value::Bool(a < b)),
                Gt => Ok(Value::Bool(a > b)),
                Le => Ok(Value::Bool(a <= b)),
                Ge => Ok(Value::Bool(a >= b)),
            },
            (Value::Str(a), Value::Str(b)) => match op {
                Add => Ok(Value::Str(format!("{}{}", a, b))),
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                _ => Err(GuestError::Exception(format!(
                    "unsupported operation on strings: {:?}",
                    op
                ))),
            },
            (Value::Bool(a), Value::Bool(b)) => match op {
                Eq => Ok(Value::Bool(a == b)),
                Ne => Ok(Value::Bool(a != b)),
                _ => Err(GuestError::Exception(format!(
                    "unsupported operation on bools: {:?}",
                    op
                ))),
            },
            (left, right) => Err(GuestError::Exception(format!(
                "type mismatch: {} {:?} {}",
                left.type_name(),
                op,
                right.type_name()
            ))),
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, GuestError> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.stdout.push(line);
                Ok(Value::Unit)
            }
            "warn" => {
                let line = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.stderr.push(line);
                Ok(Value::Unit)
            }
            "str" => {
                let arg = one_arg("str", args)?;
                Ok(Value::Str(arg.to_string()))
            }
            "len" => match one_arg("len", args)? {
                Value::Str(s) => Ok(Value::Num(s.chars().count() as f64)),
                Value::Table { rows, .. } => Ok(Value::Num(rows.len() as f64)),
                other => Err(GuestError::Exception(format!(
                    "len() not supported for {}",
                    other.type_name()
                ))),
            },
            "raise" => {
                let message = args
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "error".to_string());
                Err(GuestError::Exception(message))
            }
            "fetch" => self.builtin_fetch(args),
            "plot" => {
                let arg = one_arg("plot", args)?;
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(arg.to_string().as_bytes());
                Ok(Value::Plot(encoded))
            }
            "markup" => {
                let arg = one_arg("markup", args)?;
                Ok(Value::Markup(arg.render_markup()))
            }
            "table" => self.builtin_table(args),
            other => Err(GuestError::Exception(format!(
                "undefined function '{}'",
                other
            ))),
        }
    }

    /// `fetch(url [, method [, body]])` - blocks until the host delivers a
    /// response or an error through the bridge.
    fn builtin_fetch(&mut self, args: Vec<Value>) -> Result<Value, GuestError> {
        let mut iter = args.into_iter();
        let url = match iter.next() {
            Some(Value::Str(url)) => url,
            _ => {
                return Err(GuestError::Exception(
                    "fetch() requires a url string".to_string(),
                ))
            }
        };
        let method = match iter.next() {
            None => HttpMethod::Get,
            Some(Value::Str(m)) => HttpMethod::parse(&m).ok_or_else(|| {
                GuestError::Exception(format!("fetch() does not support method '{}'", m))
            })?,
            Some(other) => {
                return Err(GuestError::Exception(format!(
                    "fetch() method must be a string, got {}",
                    other.type_name()
                )))
            }
        };
        let body = match iter.next() {
            None => None,
            Some(value) => Some(value.to_string()),
        };

        let request = FetchRequest {
            method,
            url,
            headers: Default::default(),
            body,
        };

        match self.fetch.fetch(request) {
            Ok(bytes) => Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned())),
            Err(RunnerError::FetchTimeout { timeout_ms }) => Err(GuestError::FetchTimeout(
                format!("fetch timed out after {}ms", timeout_ms),
            )),
            Err(err) => Err(GuestError::Exception(format!("fetch failed: {}", err))),
        }
    }

    /// `table(headers_csv, row_csv, ...)` - builds a tabular value.
    fn builtin_table(&self, args: Vec<Value>) -> Result<Value, GuestError> {
        let mut iter = args.into_iter();
        let headers = match iter.next() {
            Some(Value::Str(h)) => split_csv(&h),
            _ => {
                return Err(GuestError::Exception(
                    "table() requires a header string".to_string(),
                ))
            }
        };
        let mut rows = Vec::new();
        for arg in iter {
            match arg {
                Value::Str(row) => rows.push(split_csv(&row)),
                other => {
                    return Err(GuestError::Exception(format!(
                        "table() rows must be strings, got {}",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(Value::Table { headers, rows })
    }
}

fn one_arg(name: &str, args: Vec<Value>) -> Result<Value, GuestError> {
    let mut iter = args.into_iter();
    match (iter.next(), iter.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(GuestError::Exception(format!(
            "{}() takes exactly one argument",
            name
        ))),
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',').map(|part| part.trim().to_string()).collect()
}
