use once_cell::sync::Lazy;
use smallvec::SmallVec;
use std::collections::HashSet;
use tracing::debug;

/// Identifiers a predicate may read from the fused context. Anything else
/// parses as a bareword string literal (so `trend_1h == BULLISH` works).
static IDENTIFIERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "price",
        "poc",
        "vah",
        "val",
        "vwap",
        "atr",
        "atr_pct",
        "volume",
        "volume_ma20",
        "volume_ratio",
        "rsi",
        "adx",
        "plus_di",
        "minus_di",
        "ema20",
        "ema50",
        "macd_line",
        "macd_signal",
        "macd_hist",
        "bb_upper",
        "bb_middle",
        "bb_lower",
        "bb_width",
        "stoch_rsi_k",
        "stoch_rsi_d",
        "trend_1h",
        "trend_4h",
        "trend_1d",
        "adx_1h",
        "adx_4h",
        "adx_1d",
        "rsi_1h",
        "rsi_4h",
        "rsi_1d",
        "volume_delta_1h",
        "volume_delta_4h",
        "volume_delta_1d",
        "cvd_value",
        "cvd_percent",
        "cvd_slope",
        "cvd_confirms",
        "cluster.stacked_imbalance_up",
        "cluster.stacked_imbalance_down",
        "cluster.absorption_high",
        "cluster.absorption_low",
        "pullback_to_poc",
        "in_value_area",
        "news_score",
        "triggers.all",
        "imbalance",
        "ls_ratio",
        "whale_count",
        "whale_net_notional",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

/// Resolves whitelisted identifiers at evaluation time.
pub trait EvalContext {
    fn lookup(&self, ident: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Ident(String),
    Call {
        func: Builtin,
        args: SmallVec<[Box<Expr>; 2]>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed predicate. A bare expression is a truthiness test.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { lhs: Expr, op: RelOp, rhs: Expr },
    Truthy(Expr),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("empty predicate")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unexpected end of predicate")]
    UnexpectedEnd,
    #[error("unknown function '{0}', only abs/min/max are allowed")]
    UnknownFunction(String),
    #[error("{0}() takes {1}")]
    BadArity(&'static str, &'static str),
    #[error("trailing input after predicate: '{0}'")]
    Trailing(String),
    #[error("unterminated string literal")]
    UnterminatedString,
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Word(String),
    Op(RelOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => lit.push(ch),
                        None => return Err(ParseError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(lit));
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                let op = match (c, eq) {
                    ('=', true) => RelOp::Eq,
                    ('!', true) => RelOp::Ne,
                    ('<', true) => RelOp::Le,
                    ('>', true) => RelOp::Ge,
                    ('<', false) => RelOp::Lt,
                    ('>', false) => RelOp::Gt,
                    _ => return Err(ParseError::UnexpectedChar(c)),
                };
                tokens.push(Token::Op(op));
            }
            '-' | '0'..='9' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == '_' {
                        if d != '_' {
                            num.push(d);
                        }
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = num.parse().map_err(|_| ParseError::UnexpectedChar(c))?;
                tokens.push(Token::Num(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => return Err(ParseError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn operand(&mut self) -> Result<Expr, ParseError> {
        match self.next().ok_or(ParseError::UnexpectedEnd)? {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Word(word) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&word)
                } else if IDENTIFIERS.contains(word.as_str()) {
                    Ok(Expr::Ident(word))
                } else {
                    // Unquoted enum-style literal such as BULLISH or strong.
                    Ok(Expr::Str(word))
                }
            }
            Token::Op(_) | Token::LParen | Token::RParen | Token::Comma => {
                Err(ParseError::UnexpectedEnd)
            }
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, ParseError> {
        let func = match name {
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            other => return Err(ParseError::UnknownFunction(other.to_string())),
        };
        let mut args: SmallVec<[Box<Expr>; 2]> = SmallVec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                args.push(Box::new(self.operand()?));
                match self.next().ok_or(ParseError::UnexpectedEnd)? {
                    Token::Comma => continue,
                    Token::RParen => break,
                    _ => return Err(ParseError::UnexpectedEnd),
                }
            }
        }
        match func {
            Builtin::Abs if args.len() != 1 => {
                Err(ParseError::BadArity("abs", "exactly one argument"))
            }
            Builtin::Min | Builtin::Max if args.len() < 2 => Err(ParseError::BadArity(
                if func == Builtin::Min { "min" } else { "max" },
                "at least two arguments",
            )),
            _ => Ok(Expr::Call { func, args }),
        }
    }
}

/// Parses one predicate string. Grammar errors are load-time failures for
/// the scenario library.
pub fn parse_predicate(input: &str) -> Result<Predicate, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let lhs = parser.operand()?;
    let predicate = match parser.peek() {
        Some(&Token::Op(op)) => {
            parser.pos += 1;
            let rhs = parser.operand()?;
            Predicate::Compare { lhs, op, rhs }
        }
        _ => Predicate::Truthy(lhs),
    };
    if let Some(extra) = parser.next() {
        return Err(ParseError::Trailing(format!("{extra:?}")));
    }
    Ok(predicate)
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval_expr(expr: &Expr, ctx: &dyn EvalContext) -> Option<Value> {
    match expr {
        Expr::Num(n) => Some(Value::Num(*n)),
        Expr::Str(s) => Some(Value::Str(s.clone())),
        Expr::Ident(name) => ctx.lookup(name),
        Expr::Call { func, args } => {
            let mut nums = SmallVec::<[f64; 2]>::new();
            for arg in args {
                match eval_expr(arg, ctx)? {
                    Value::Num(n) => nums.push(n),
                    _ => return None,
                }
            }
            let result = match func {
                Builtin::Abs => nums[0].abs(),
                Builtin::Min => nums.iter().cloned().fold(f64::MAX, f64::min),
                Builtin::Max => nums.iter().cloned().fold(f64::MIN, f64::max),
            };
            Some(Value::Num(result))
        }
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Str(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::Str(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn compare(lhs: &Value, op: RelOp, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => Some(match op {
            RelOp::Eq => a == b,
            RelOp::Ne => a != b,
            RelOp::Gt => a > b,
            RelOp::Ge => a >= b,
            RelOp::Lt => a < b,
            RelOp::Le => a <= b,
        }),
        (Value::Str(a), Value::Str(b)) => match op {
            RelOp::Eq => Some(a.eq_ignore_ascii_case(b)),
            RelOp::Ne => Some(!a.eq_ignore_ascii_case(b)),
            _ => None,
        },
        _ => {
            // Bool against bool-like only, and only for equality.
            let a = as_bool(lhs)?;
            let b = as_bool(rhs)?;
            match op {
                RelOp::Eq => Some(a == b),
                RelOp::Ne => Some(a != b),
                _ => None,
            }
        }
    }
}

impl Predicate {
    /// Evaluates against the fused context. Unresolvable identifiers and
    /// type mismatches are false, never an error.
    pub fn eval(&self, ctx: &dyn EvalContext) -> bool {
        match self {
            Predicate::Compare { lhs, op, rhs } => {
                let (Some(left), Some(right)) = (eval_expr(lhs, ctx), eval_expr(rhs, ctx)) else {
                    debug!(predicate = ?self, "predicate operand did not resolve");
                    return false;
                };
                match compare(&left, *op, &right) {
                    Some(result) => result,
                    None => {
                        debug!(predicate = ?self, "predicate operand types do not compare");
                        false
                    }
                }
            }
            Predicate::Truthy(expr) => match eval_expr(expr, ctx) {
                Some(Value::Bool(b)) => b,
                Some(Value::Num(n)) => n != 0.0,
                Some(Value::Str(s)) => !s.is_empty(),
                None => {
                    debug!(predicate = ?self, "predicate operand did not resolve");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestContext;

    impl EvalContext for TestContext {
        fn lookup(&self, ident: &str) -> Option<Value> {
            match ident {
                "price" => Some(Value::Num(50_000.0)),
                "rsi_1h" => Some(Value::Num(35.0)),
                "rsi_4h" => Some(Value::Num(60.0)),
                "cvd_value" => Some(Value::Num(-1_500.0)),
                "trend_1h" => Some(Value::Str("BULLISH".to_string())),
                "cvd_confirms" => Some(Value::Bool(true)),
                "cluster.absorption_low" => Some(Value::Bool(false)),
                _ => None,
            }
        }
    }

    fn eval(input: &str) -> bool {
        parse_predicate(input).unwrap().eval(&TestContext)
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("price > 49000"));
        assert!(eval("price <= 50000"));
        assert!(!eval("price == 1"));
        assert!(eval("rsi_1h != 36"));
    }

    #[test]
    fn test_bareword_rhs_is_a_string_literal() {
        assert!(eval("trend_1h == BULLISH"));
        assert!(eval("trend_1h == bullish"));
        assert!(!eval("trend_1h == BEARISH"));
    }

    #[test]
    fn test_quoted_strings() {
        assert!(eval("trend_1h == 'BULLISH'"));
        assert!(eval("trend_1h != \"NEUTRAL\""));
    }

    #[test]
    fn test_builtins() {
        assert!(eval("abs(cvd_value) >= 1500"));
        assert!(eval("min(rsi_1h, rsi_4h) < 40"));
        assert!(eval("max(rsi_1h, rsi_4h) == 60"));
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("cvd_confirms"));
        assert!(!eval("cluster.absorption_low"));
        assert!(eval("price"));
    }

    #[test]
    fn test_bool_against_bareword() {
        assert!(eval("cvd_confirms == true"));
        assert!(!eval("cvd_confirms == false"));
    }

    #[test]
    fn test_unknown_identifier_evaluates_false() {
        // news_score is whitelisted but the test context cannot resolve it.
        assert!(!eval("news_score > 0.5"));
    }

    #[test]
    fn test_type_mismatch_evaluates_false() {
        assert!(!eval("trend_1h > 10"));
    }

    #[test]
    fn test_grammar_errors_are_load_failures() {
        assert!(parse_predicate("").is_err());
        assert!(parse_predicate("price >").is_err());
        assert!(parse_predicate("sqrt(price) > 10").is_err());
        assert!(parse_predicate("abs(price, rsi_1h) > 10").is_err());
        assert!(parse_predicate("min(price) > 10").is_err());
        assert!(parse_predicate("price > 1 extra").is_err());
        assert!(parse_predicate("'unterminated").is_err());
    }

    #[test]
    fn test_negative_numbers() {
        assert!(eval("cvd_value < -1000"));
        assert!(eval("cvd_value > -2000"));
    }
}
