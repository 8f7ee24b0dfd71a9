//! Restricted, side-effect-free expression language for loop exit conditions,
//! branch predicates and router selectors.
//!
//! Expressions can only read the [`Bindings`] handed to them. Any root name
//! outside that set is rejected when the expression is compiled.
//!
//! ```text
//! current_iteration >= 2
//! outputs.review.success && not (last.content contains "retry")
//! len(state.queue) == 0 or content matches "^DONE"
//! ```

use regex::Regex;
use serde_json::{Map, Value};

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::{StepOutput, StepRecord};

/// Root names an expression may reference.
pub const BOUND_NAMES: &[&str] = &[
    "input",
    "outputs",
    "last",
    "content",
    "success",
    "all_success",
    "state",
    "current_iteration",
    "max_iterations",
];

/// Read-only view of run state an expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    /// The run input.
    pub input: &'a Value,
    /// Every output recorded so far, in completion order.
    pub outputs: &'a [StepRecord],
    /// The most recent output in the enclosing scope.
    pub last: Option<&'a StepOutput>,
    pub state: &'a Map<String, Value>,
    /// `(current_iteration, max_iterations)` inside a loop.
    pub iteration: Option<(u32, u32)>,
    /// Outputs of the latest loop pass, used by `all_success`.
    pub pass: Option<&'a [StepRecord]>,
}

impl<'a> Bindings<'a> {
    /// Latest output recorded under `name`.
    pub fn output(&self, name: &str) -> Option<&'a StepOutput> {
        self.outputs
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| &r.output)
    }

    pub fn current_iteration(&self) -> u32 {
        self.iteration.map(|(c, _)| c).unwrap_or(0)
    }

    fn root(&self, name: &str) -> Value {
        match name {
            "input" => self.input.clone(),
            "outputs" => {
                let mut map = Map::new();
                for record in self.outputs {
                    map.insert(record.name.clone(), output_value(&record.output));
                }
                Value::Object(map)
            }
            "last" => self.last.map(output_value).unwrap_or(Value::Null),
            "content" => self.last.map(|o| o.content.clone()).unwrap_or(Value::Null),
            "success" => Value::Bool(self.last.is_some_and(|o| o.success)),
            "all_success" => {
                let records = self.pass.unwrap_or(self.outputs);
                Value::Bool(records.iter().all(|r| r.output.success))
            }
            "state" => Value::Object(self.state.clone()),
            "current_iteration" => Value::from(self.current_iteration()),
            "max_iterations" => Value::from(self.iteration.map(|(_, m)| m).unwrap_or(0)),
            _ => Value::Null,
        }
    }
}

fn output_value(output: &StepOutput) -> Value {
    serde_json::json!({
        "content": output.content,
        "success": output.success,
        "stop_requested": output.stop_requested,
        "error": output.error,
    })
}

/// A compiled expression.
#[derive(Clone)]
pub struct Expr {
    source: String,
    node: Node,
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Expr").field(&self.source).finish()
    }
}

impl Expr {
    /// Parse and bind-check an expression.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(EnsembleError::Expression("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let node = parser.parse_expr(0)?;
        if let Some(tok) = parser.peek() {
            return Err(EnsembleError::Expression(format!(
                "unexpected {:?} in '{}'",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            node,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, bindings: &Bindings<'_>) -> Result<Value> {
        eval(&self.node, bindings)
    }

    pub fn is_true(&self, bindings: &Bindings<'_>) -> Result<bool> {
        self.evaluate(bindings).map(|v| truthy(&v))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EnsembleError::Expression(format!(
                                "unterminated string in '{}'",
                                src
                            )))
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => {}
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot not followed by a digit ends the number.
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    EnsembleError::Expression(format!("bad number '{}'", text))
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    '-' => "-",
                    other => {
                        return Err(EnsembleError::Expression(format!(
                            "unexpected character '{}' in '{}'",
                            other, src
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Matches,
}

impl BinOp {
    fn binding_power(self) -> (u8, u8) {
        match self {
            Self::Or => (1, 2),
            Self::And => (3, 4),
            _ => (5, 6),
        }
    }
}

const PREFIX_BP: u8 = 7;
/// `not` reads like Python: it negates a whole comparison.
const NOT_BP: u8 = 5;

#[derive(Debug, Clone)]
enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Path { root: String, segments: Vec<Segment> },
    Not(Box<Node>),
    Neg(Box<Node>),
    Len(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Matches(Box<Node>, Regex),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            other => Err(EnsembleError::Expression(format!(
                "expected {:?}, found {:?}",
                want, other
            ))),
        }
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match self.peek()? {
            Token::Op("||") => Some(BinOp::Or),
            Token::Op("&&") => Some(BinOp::And),
            Token::Op("==") => Some(BinOp::Eq),
            Token::Op("!=") => Some(BinOp::Ne),
            Token::Op("<") => Some(BinOp::Lt),
            Token::Op("<=") => Some(BinOp::Le),
            Token::Op(">") => Some(BinOp::Gt),
            Token::Op(">=") => Some(BinOp::Ge),
            Token::Ident(word) => match word.as_str() {
                "or" => Some(BinOp::Or),
                "and" => Some(BinOp::And),
                "contains" => Some(BinOp::Contains),
                "matches" => Some(BinOp::Matches),
                _ => None,
            },
            _ => None,
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Node> {
        let mut lhs = self.parse_prefix()?;

        while let Some(op) = self.peek_binop() {
            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;

            if op == BinOp::Matches {
                // Patterns must be literals so they compile once, here.
                let pattern = match self.next() {
                    Some(Token::Str(p)) => p,
                    other => {
                        return Err(EnsembleError::Expression(format!(
                            "'matches' needs a string pattern, found {:?}",
                            other
                        )))
                    }
                };
                let regex = Regex::new(&pattern).map_err(|e| {
                    EnsembleError::Expression(format!("invalid pattern '{}': {}", pattern, e))
                })?;
                lhs = Node::Matches(Box::new(lhs), regex);
                continue;
            }

            let rhs = self.parse_expr(r_bp)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Literal(Value::from(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Op("!")) => Ok(Node::Not(Box::new(self.parse_expr(PREFIX_BP)?))),
            Some(Token::Op("-")) => Ok(Node::Neg(Box::new(self.parse_expr(PREFIX_BP)?))),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                "not" => Ok(Node::Not(Box::new(self.parse_expr(NOT_BP)?))),
                "len" if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let inner = self.parse_expr(0)?;
                    self.expect(Token::RParen)?;
                    Ok(Node::Len(Box::new(inner)))
                }
                _ => self.parse_path(word),
            },
            other => Err(EnsembleError::Expression(format!(
                "unexpected {:?}",
                other
            ))),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Node> {
        if !BOUND_NAMES.contains(&root.as_str()) {
            return Err(EnsembleError::Expression(format!(
                "unbound name '{}' (available: {})",
                root,
                BOUND_NAMES.join(", ")
            )));
        }

        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(field)) => segments.push(Segment::Field(field)),
                        Some(Token::Num(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        other => {
                            return Err(EnsembleError::Expression(format!(
                                "expected field after '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Str(key)) => segments.push(Segment::Field(key)),
                        Some(Token::Num(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        other => {
                            return Err(EnsembleError::Expression(format!(
                                "expected index or key, found {:?}",
                                other
                            )))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }

        Ok(Node::Path { root, segments })
    }
}

fn eval(node: &Node, b: &Bindings<'_>) -> Result<Value> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Path { root, segments } => {
            let (mut value, rest) = match (root.as_str(), segments.first()) {
                ("outputs", Some(Segment::Field(name))) => (
                    b.output(name).map(output_value).unwrap_or(Value::Null),
                    &segments[1..],
                ),
                _ => (b.root(root), &segments[..]),
            };
            for segment in rest {
                value = match (segment, &value) {
                    (Segment::Field(k), Value::Object(map)) => {
                        map.get(k).cloned().unwrap_or(Value::Null)
                    }
                    (Segment::Index(i), Value::Array(items)) => {
                        items.get(*i).cloned().unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
            }
            Ok(value)
        }
        Node::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, b)?))),
        Node::Neg(inner) => match eval(inner, b)?.as_f64() {
            Some(n) => Ok(Value::from(-n)),
            None => Err(EnsembleError::Expression(
                "unary '-' needs a number".into(),
            )),
        },
        Node::Len(inner) => {
            let len = match eval(inner, b)? {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => {
                    return Err(EnsembleError::Expression(format!(
                        "len() of {}",
                        other
                    )))
                }
            };
            Ok(Value::from(len))
        }
        Node::Matches(inner, regex) => {
            let text = text_of(&eval(inner, b)?);
            Ok(Value::Bool(regex.is_match(&text)))
        }
        Node::Binary(BinOp::And, l, r) => {
            Ok(Value::Bool(truthy(&eval(l, b)?) && truthy(&eval(r, b)?)))
        }
        Node::Binary(BinOp::Or, l, r) => {
            Ok(Value::Bool(truthy(&eval(l, b)?) || truthy(&eval(r, b)?)))
        }
        Node::Binary(op, l, r) => {
            let lhs = eval(l, b)?;
            let rhs = eval(r, b)?;
            let result = match op {
                BinOp::Eq => values_equal(&lhs, &rhs),
                BinOp::Ne => !values_equal(&lhs, &rhs),
                BinOp::Lt => compare(&lhs, &rhs).is_some_and(|o| o.is_lt()),
                BinOp::Le => compare(&lhs, &rhs).is_some_and(|o| o.is_le()),
                BinOp::Gt => compare(&lhs, &rhs).is_some_and(|o| o.is_gt()),
                BinOp::Ge => compare(&lhs, &rhs).is_some_and(|o| o.is_ge()),
                BinOp::Contains => contains(&lhs, &rhs),
                BinOp::And | BinOp::Or | BinOp::Matches => false,
            };
            Ok(Value::Bool(result))
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(text_of(needle).as_str()),
        Value::Array(items) => items.iter().any(|i| values_equal(i, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::run::StepPath;
    use serde_json::json;

    fn record(name: &str, output: StepOutput) -> StepRecord {
        StepRecord {
            path: StepPath::root(),
            name: name.into(),
            output,
        }
    }

    fn check(src: &str, bindings: &Bindings<'_>) -> bool {
        Expr::compile(src).unwrap().is_true(bindings).unwrap()
    }

    #[test]
    fn iteration_counter() {
        let input = json!(null);
        let state = Map::new();
        let b = Bindings {
            input: &input,
            outputs: &[],
            last: None,
            state: &state,
            iteration: Some((2, 10)),
            pass: None,
        };
        assert!(check("current_iteration >= 2", &b));
        assert!(!check("current_iteration >= 3", &b));
        assert!(check("max_iterations == 10 and current_iteration < max_iterations", &b));
    }

    #[test]
    fn outputs_and_last() {
        let input = json!({"topic": "rust"});
        let state = Map::new();
        let outputs = vec![
            record("draft", StepOutput::success("first draft")),
            record("review", StepOutput::failure("needs work")),
        ];
        let last = StepOutput::success("DONE: shipped");
        let b = Bindings {
            input: &input,
            outputs: &outputs,
            last: Some(&last),
            state: &state,
            iteration: None,
            pass: None,
        };
        assert!(check("outputs.draft.success", &b));
        assert!(check("!outputs.review.success", &b));
        assert!(check("outputs['draft'].content contains 'draft'", &b));
        assert!(check("content matches '^DONE'", &b));
        assert!(check("input.topic == \"rust\"", &b));
        assert!(check("success && not all_success", &b));
        assert!(!check("outputs.missing.success", &b));
    }

    #[test]
    fn state_and_len() {
        let input = Value::Null;
        let mut state = Map::new();
        state.insert("queue".into(), json!(["a", "b"]));
        state.insert("score".into(), json!(0.75));
        let b = Bindings {
            input: &input,
            outputs: &[],
            last: None,
            state: &state,
            iteration: None,
            pass: None,
        };
        assert!(check("len(state.queue) == 2", &b));
        assert!(check("state.queue contains 'b'", &b));
        assert!(check("state.queue[0] == 'a'", &b));
        assert!(check("state.score > 0.5 || false", &b));
        assert!(check("-1 < state.score", &b));
    }

    #[test]
    fn precedence() {
        let input = Value::Null;
        let state = Map::new();
        let b = Bindings {
            input: &input,
            outputs: &[],
            last: None,
            state: &state,
            iteration: Some((1, 3)),
            pass: None,
        };
        // and binds tighter than or
        assert!(check("true or false and false", &b));
        assert!(!check("(true or false) and false", &b));
        assert!(check("not current_iteration == 2", &b));
    }

    #[test]
    fn rejects_unbound_names() {
        let err = Expr::compile("os.system == 1").unwrap_err();
        assert!(err.to_string().contains("unbound name 'os'"));
        assert!(Expr::compile("iteration >= 2").is_err());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Expr::compile("").is_err());
        assert!(Expr::compile("current_iteration >=").is_err());
        assert!(Expr::compile("content matches last").is_err());
        assert!(Expr::compile("content matches '('").is_err());
        assert!(Expr::compile("current_iteration = 2").is_err());
        assert!(Expr::compile("'open").is_err());
    }
}
