//! Runtime values of the guest cell language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Num(f64),
    Bool(bool),
    Str(String),
    /// Tabular object; rendered to markup when it becomes raw output
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// Figure payload, base64-encoded
    Plot(String),
    /// Pre-rendered markup fragment
    Markup(String),
}

impl Value {
    /// Whether the value is usable as raw output (primitive, string, or
    /// tabular-rendered-to-markup). Plots are figures, not raw output.
    pub fn is_displayable(&self) -> bool {
        matches!(
            self,
            Value::Num(_) | Value::Bool(_) | Value::Str(_) | Value::Table { .. } | Value::Markup(_)
        )
    }

    /// Raw-output form: display for primitives/strings, rendered markup for
    /// tables, empty for everything else.
    pub fn raw_output(&self) -> String {
        match self {
            Value::Num(_) | Value::Bool(_) | Value::Str(_) => self.to_string(),
            Value::Table { .. } => self.render_markup(),
            Value::Markup(m) => m.clone(),
            _ => String::new(),
        }
    }

    /// Render a tabular value as a markup fragment.
    pub fn render_markup(&self) -> String {
        match self {
            Value::Table { headers, rows } => {
                let mut out = String::from("<table><tr>");
                for h in headers {
                    out.push_str("<th>");
                    out.push_str(h);
                    out.push_str("</th>");
                }
                out.push_str("</tr>");
                for row in rows {
                    out.push_str("<tr>");
                    for cell in row {
                        out.push_str("<td>");
                        out.push_str(cell);
                        out.push_str("</td>");
                    }
                    out.push_str("</tr>");
                }
                out.push_str("</table>");
                out
            }
            Value::Markup(m) => m.clone(),
            other => other.to_string(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Num(_) => "number",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Table { .. } => "table",
            Value::Plot(_) => "plot",
            Value::Markup(_) => "markup",
        }
    }
}

/// Format a number the way the guest surface shows it: integral values
/// without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => Ok(()),
            Value::Num(n) => write!(f, "{}", format_number(*n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Table { headers, rows } => {
                write!(f, "table({} cols, {} rows)", headers.len(), rows.len())
            }
            Value::Plot(_) => write!(f, "plot"),
            Value::Markup(m) => write!(f, "{}", m),
        }
    }
}
