//! Built-in local tools: `get_current_time`, `calculate`, `echo`.

use std::fmt::Write as _;

use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tower::BoxError;

use super::{tool_typed, ToolDef, ToolError, ToolRegistry};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TimeArgs {
    /// `UTC`, a fixed offset such as `+08:00`, or one of a few zone names without DST
    #[serde(default)]
    pub timezone: Option<String>,
    /// strftime-style format, default `%Y-%m-%d %H:%M:%S`
    #[serde(default)]
    pub format: Option<String>,
}

/// Longest expression `calculate` accepts.
pub const MAX_EXPRESSION_CHARS: usize = 512;
/// Deepest nesting of parentheses, signs and exponents the parser follows.
const MAX_NESTING: usize = 64;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CalculateArgs {
    /// Arithmetic expression, e.g. `(3+5)*2`
    #[schemars(length(max = 512))]
    pub expression: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// Text to return unchanged
    pub text: String,
}

pub fn current_time_tool() -> ToolDef {
    tool_typed(
        "get_current_time",
        "Get the current time in a timezone",
        |args: TimeArgs| async move { current_time(args) },
    )
}

pub fn calculate_tool() -> ToolDef {
    tool_typed(
        "calculate",
        "Evaluate an arithmetic expression; supports + - * / // % ** and parentheses",
        |args: CalculateArgs| async move {
            let expression = args.expression.trim().to_string();
            if expression.is_empty() {
                return Err::<Value, BoxError>("expression must not be empty".into());
            }
            let value = evaluate(&expression)?;
            Ok(json!({"expression": expression, "result": number_value(value)}))
        },
    )
}

pub fn echo_tool() -> ToolDef {
    tool_typed("echo", "Echo the input text", |args: EchoArgs| async move {
        Ok::<_, BoxError>(json!({"text": args.text}))
    })
}

/// Register the three built-in tools.
pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<(), ToolError> {
    registry.register(current_time_tool())?;
    registry.register(calculate_tool())?;
    registry.register(echo_tool())?;
    Ok(())
}

fn current_time(args: TimeArgs) -> Result<Value, BoxError> {
    let tz_name = args.timezone.unwrap_or_else(|| "UTC".to_string());
    let fmt = args
        .format
        .unwrap_or_else(|| "%Y-%m-%d %H:%M:%S".to_string());
    let offset = parse_offset(&tz_name).ok_or_else(|| format!("unsupported timezone: {tz_name}"))?;
    let now = Utc::now().with_timezone(&offset);
    let mut value = String::new();
    write!(value, "{}", now.format(&fmt)).map_err(|_| format!("invalid time format: {fmt}"))?;
    Ok(json!({"timezone": tz_name, "value": value}))
}

fn parse_offset(name: &str) -> Option<FixedOffset> {
    let trimmed = name.trim();
    let hours = |h: i32| FixedOffset::east_opt(h * 3600);
    match trimmed {
        "UTC" | "utc" | "Z" | "Etc/UTC" | "GMT" => return hours(0),
        "Asia/Shanghai" | "Asia/Hong_Kong" | "Asia/Singapore" | "Asia/Taipei" => return hours(8),
        "Asia/Tokyo" | "Asia/Seoul" => return hours(9),
        "Asia/Kolkata" => return FixedOffset::east_opt(5 * 3600 + 1800),
        _ => {}
    }
    let spec = trimmed
        .strip_prefix("UTC")
        .or_else(|| trimmed.strip_prefix("GMT"))
        .unwrap_or(trimmed);
    let (sign, rest) = match spec.chars().next()? {
        '+' => (1, &spec[1..]),
        '-' => (-1, &spec[1..]),
        _ => return None,
    };
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if h > 14 || !(0..60).contains(&m) {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

/// Integral results are reported as JSON integers.
fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    FloorDiv,
    Percent,
    Pow,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{text}`"))?;
                tokens.push(Token::Num(n));
                continue;
            }
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '*' => tokens.push(Token::Star),
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::FloorDiv);
                i += 1;
            }
            '/' => tokens.push(Token::Slash),
            '%' => tokens.push(Token::Percent),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            other => return Err(format!("unsupported character `{other}`")),
        }
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut acc = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == Token::Plus { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.unary()?;
        while let Some(op @ (Token::Star | Token::Slash | Token::FloorDiv | Token::Percent)) =
            self.peek()
        {
            self.pos += 1;
            let rhs = self.unary()?;
            acc = match op {
                Token::Star => acc * rhs,
                _ if rhs == 0.0 => return Err("division by zero".into()),
                Token::Slash => acc / rhs,
                Token::FloorDiv => (acc / rhs).floor(),
                _ => acc - rhs * (acc / rhs).floor(),
            };
        }
        Ok(acc)
    }

    /// Every nested construct passes through here, so this is where depth is bounded.
    fn unary(&mut self) -> Result<f64, String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err("expression too deeply nested".into());
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.atom()?;
        if self.peek() == Some(Token::Pow) {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

/// Evaluate an arithmetic expression without touching anything but numbers.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    if expression.chars().count() > MAX_EXPRESSION_CHARS {
        return Err(format!("expression longer than {MAX_EXPRESSION_CHARS} characters"));
    }
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("unexpected trailing input".into());
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}
