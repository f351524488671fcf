//! Template evaluator — `{{ path (| filter(args))* }}` over the context.
//!
//! The grammar is closed: path access with dot and bracket segments,
//! string/number/bool literals, a fixed filter set, and `and`/`or`
//! conjunctions.  No arithmetic, no control flow, no function calls.
//!
//! A string that is exactly one expression renders to the expression's
//! typed value; mixed content renders to a string.  Structural documents
//! (maps/lists) are rendered leaf by leaf.

use serde_json::{json, Map, Value};

use errors::AelError;

/// Read-only view of the execution state visible to templates.
#[derive(Clone, Copy)]
pub struct TemplateContext<'a> {
    pub inputs: &'a Map<String, Value>,
    pub steps: &'a Map<String, Value>,
    pub config: &'a Map<String, Value>,
    pub execution_id: &'a str,
}

fn template_error(detail: impl Into<String>) -> AelError {
    AelError::template_error(detail)
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Render a value: strings are expanded, maps and lists render their
/// leaves recursively, other primitives pass through.
pub fn render(value: &Value, ctx: &TemplateContext<'_>) -> Result<Value, AelError> {
    match value {
        Value::String(s) => render_str(s, ctx),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| render(v, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a single string.
///
/// A pure template (`"{{ expr }}"` and nothing else) preserves the
/// expression's type; anything else interpolates into a string.
pub fn render_str(s: &str, ctx: &TemplateContext<'_>) -> Result<Value, AelError> {
    let segments = split_segments(s)?;

    if let [Segment::Expr(expr)] = segments.as_slice() {
        return eval_expression(expr, ctx);
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr(expr) => out.push_str(&stringify(&eval_expression(expr, ctx)?)),
        }
    }
    Ok(Value::String(out))
}

/// Resolve a dotted context path (`steps.x.output.field`); used by
/// `from_path` output specs.
pub fn resolve_path(path: &str, ctx: &TemplateContext<'_>) -> Result<Value, AelError> {
    let parsed = Parser::new(path)?.parse_path_only()?;
    resolve_segments(&parsed, ctx)
        .map_err(|miss| template_error(format!("undefined path '{miss}'")))
}

/// Syntax-check every template in a document without resolving variables.
pub fn check_document(value: &Value) -> Result<(), AelError> {
    match value {
        Value::String(s) => {
            for segment in split_segments(s)? {
                if let Segment::Expr(expr) = segment {
                    Parser::new(&expr)?.parse_expression()?;
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_document),
        Value::Object(map) => map.values().try_for_each(check_document),
        _ => Ok(()),
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Segment scanning
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment {
    Text(String),
    Expr(String),
}

fn split_segments(s: &str) -> Result<Vec<Segment>, AelError> {
    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| template_error(format!("unclosed '{{{{' in '{s}'")))?;
        let expr = after[..close].trim();
        if expr.is_empty() {
            return Err(template_error(format!("empty expression in '{s}'")));
        }
        segments.push(Segment::Expr(expr.to_string()));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() || segments.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Expression grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone)]
enum Base {
    Path(Vec<PathSeg>),
    Literal(Value),
}

#[derive(Debug, Clone)]
struct FilterCall {
    name: String,
    args: Vec<Value>,
}

#[derive(Debug, Clone)]
enum TExpr {
    Filtered { base: Base, filters: Vec<FilterCall> },
    And(Box<TExpr>, Box<TExpr>),
    Or(Box<TExpr>, Box<TExpr>),
}

fn eval_expression(src: &str, ctx: &TemplateContext<'_>) -> Result<Value, AelError> {
    let expr = Parser::new(src)?.parse_expression()?;
    eval(&expr, ctx)
}

fn eval(expr: &TExpr, ctx: &TemplateContext<'_>) -> Result<Value, AelError> {
    match expr {
        TExpr::And(l, r) => {
            let left = eval(l, ctx)?;
            if truthy(&left) {
                eval(r, ctx)
            } else {
                Ok(left)
            }
        }
        TExpr::Or(l, r) => {
            let left = eval(l, ctx)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(r, ctx)
            }
        }
        TExpr::Filtered { base, filters } => {
            let resolved = match base {
                Base::Literal(v) => Ok(v.clone()),
                Base::Path(segs) => resolve_segments(segs, ctx),
            };
            let (mut value, remaining) = match resolved {
                Ok(v) => (v, filters.as_slice()),
                Err(miss) => match filters.first() {
                    // An unknown path is only tolerated under `default`.
                    Some(f) if f.name == "default" => {
                        let fallback = f
                            .args
                            .first()
                            .cloned()
                            .ok_or_else(|| template_error("default needs an argument"))?;
                        (fallback, &filters[1..])
                    }
                    _ => {
                        return Err(template_error(format!("undefined variable '{miss}'")));
                    }
                },
            };
            for filter in remaining {
                value = apply_filter(filter, value)?;
            }
            Ok(value)
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolve a path against the context; `Err` carries the dotted form of
/// the missing path for the error message.
fn resolve_segments(segs: &[PathSeg], ctx: &TemplateContext<'_>) -> Result<Value, String> {
    let describe = |upto: usize| -> String {
        let mut out = String::new();
        for seg in &segs[..upto] {
            match seg {
                PathSeg::Key(k) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                PathSeg::Index(i) => out.push_str(&format!("[{i}]")),
            }
        }
        out
    };

    let Some(PathSeg::Key(root)) = segs.first() else {
        return Err(describe(segs.len()));
    };

    let mut current: Value = match root.as_str() {
        "inputs" => Value::Object(ctx.inputs.clone()),
        "steps" => Value::Object(ctx.steps.clone()),
        "config" => Value::Object(ctx.config.clone()),
        "execution_id" => Value::String(ctx.execution_id.to_string()),
        _ => return Err(describe(segs.len())),
    };

    for (i, seg) in segs.iter().enumerate().skip(1) {
        current = match (seg, &current) {
            (PathSeg::Key(k), Value::Object(map)) => match map.get(k) {
                Some(v) => v.clone(),
                None => return Err(describe(i + 1)),
            },
            (PathSeg::Index(idx), Value::Array(items)) => {
                let len = items.len() as i64;
                let resolved = if *idx < 0 { idx + len } else { *idx };
                if resolved < 0 || resolved >= len {
                    return Err(describe(i + 1));
                }
                items[resolved as usize].clone()
            }
            _ => return Err(describe(i + 1)),
        };
    }
    Ok(current)
}

fn apply_filter(filter: &FilterCall, value: Value) -> Result<Value, AelError> {
    let expect_args = |n: usize| -> Result<(), AelError> {
        if filter.args.len() != n {
            return Err(template_error(format!(
                "filter '{}' takes {n} argument(s)",
                filter.name
            )));
        }
        Ok(())
    };

    match filter.name.as_str() {
        "tojson" => {
            expect_args(0)?;
            serde_json::to_string(&value)
                .map(Value::String)
                .map_err(|e| template_error(format!("tojson failed: {e}")))
        }
        "default" => {
            expect_args(1)?;
            Ok(if value.is_null() {
                filter.args[0].clone()
            } else {
                value
            })
        }
        "length" => {
            expect_args(0)?;
            match &value {
                Value::String(s) => Ok(json!(s.chars().count())),
                Value::Array(items) => Ok(json!(items.len())),
                Value::Object(map) => Ok(json!(map.len())),
                _ => Err(template_error("length needs a string, list, or mapping")),
            }
        }
        "join" => {
            expect_args(1)?;
            let Some(sep) = filter.args[0].as_str() else {
                return Err(template_error("join separator must be a string"));
            };
            let Value::Array(items) = &value else {
                return Err(template_error("join needs a list"));
            };
            Ok(Value::String(
                items.iter().map(stringify).collect::<Vec<_>>().join(sep),
            ))
        }
        "upper" | "lower" | "trim" => {
            expect_args(0)?;
            let Value::String(s) = &value else {
                return Err(template_error(format!(
                    "filter '{}' needs a string",
                    filter.name
                )));
            };
            Ok(Value::String(match filter.name.as_str() {
                "upper" => s.to_uppercase(),
                "lower" => s.to_lowercase(),
                _ => s.trim().to_string(),
            }))
        }
        "abs" => {
            expect_args(0)?;
            if let Some(i) = value.as_i64() {
                Ok(json!(i.abs()))
            } else if let Some(f) = value.as_f64() {
                Ok(json!(f.abs()))
            } else {
                Err(template_error("abs needs a number"))
            }
        }
        "round" => {
            let f = value
                .as_f64()
                .ok_or_else(|| template_error("round needs a number"))?;
            match filter.args.as_slice() {
                [] => Ok(json!(f.round() as i64)),
                [digits] => {
                    let d = digits
                        .as_i64()
                        .ok_or_else(|| template_error("round digits must be an integer"))?;
                    let factor = 10f64.powi(d as i32);
                    Ok(json!((f * factor).round() / factor))
                }
                _ => Err(template_error("round takes at most one argument")),
            }
        }
        other => Err(template_error(format!("unknown filter '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Expression parser
// ---------------------------------------------------------------------------

struct Parser<'s> {
    chars: Vec<char>,
    pos: usize,
    src: &'s str,
}

impl<'s> Parser<'s> {
    fn new(src: &'s str) -> Result<Self, AelError> {
        Ok(Self {
            chars: src.chars().collect(),
            pos: 0,
            src,
        })
    }

    fn error(&self, detail: impl Into<String>) -> AelError {
        let detail = detail.into();
        template_error(format!("in '{}': {detail}", self.src))
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), AelError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    fn parse_expression(&mut self) -> Result<TExpr, AelError> {
        let expr = self.parse_or()?;
        if !self.at_end() {
            return Err(self.error("trailing characters"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<TExpr, AelError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = TExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<TExpr, AelError> {
        let mut left = self.parse_filtered()?;
        while self.eat_keyword("and") {
            let right = self.parse_filtered()?;
            left = TExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let end = self.pos + kw.len();
        if end > self.chars.len() {
            return false;
        }
        let slice: String = self.chars[self.pos..end].iter().collect();
        if slice != kw {
            return false;
        }
        // Must be a whole word.
        if let Some(next) = self.chars.get(end) {
            if next.is_alphanumeric() || *next == '_' {
                return false;
            }
        }
        self.pos = end;
        true
    }

    fn parse_filtered(&mut self) -> Result<TExpr, AelError> {
        let base = self.parse_base()?;
        let mut filters = Vec::new();
        while self.eat('|') {
            filters.push(self.parse_filter()?);
        }
        Ok(TExpr::Filtered { base, filters })
    }

    fn parse_base(&mut self) -> Result<Base, AelError> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Base::Literal(self.parse_string_literal()?)),
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(Base::Literal(self.parse_number()?)),
            Some(c) if c.is_alphabetic() || c == '_' => {
                // `true`/`false`/`null` read as literals, not paths.
                if self.eat_keyword("true") {
                    return Ok(Base::Literal(Value::Bool(true)));
                }
                if self.eat_keyword("false") {
                    return Ok(Base::Literal(Value::Bool(false)));
                }
                if self.eat_keyword("null") {
                    return Ok(Base::Literal(Value::Null));
                }
                Ok(Base::Path(self.parse_path()?))
            }
            _ => Err(self.error("expected a path or literal")),
        }
    }

    fn parse_path(&mut self) -> Result<Vec<PathSeg>, AelError> {
        let mut segs = vec![PathSeg::Key(self.parse_ident()?)];
        loop {
            if self.eat('.') {
                segs.push(PathSeg::Key(self.parse_ident()?));
            } else if self.eat('[') {
                self.skip_ws();
                match self.peek() {
                    Some('\'') | Some('"') => {
                        let Value::String(key) = self.parse_string_literal()? else {
                            unreachable!("string literal parses to a string");
                        };
                        segs.push(PathSeg::Key(key));
                    }
                    _ => {
                        let Value::Number(n) = self.parse_number()? else {
                            return Err(self.error("bracket index must be a number or string"));
                        };
                        let idx = n
                            .as_i64()
                            .ok_or_else(|| self.error("bracket index must be an integer"))?;
                        segs.push(PathSeg::Index(idx));
                    }
                }
                self.expect(']')?;
            } else {
                break;
            }
        }
        Ok(segs)
    }

    /// Parse a source that must be exactly one path (for `from_path`).
    fn parse_path_only(&mut self) -> Result<Vec<PathSeg>, AelError> {
        let segs = self.parse_path()?;
        if !self.at_end() {
            return Err(self.error("expected a plain dotted path"));
        }
        Ok(segs)
    }

    fn parse_ident(&mut self) -> Result<String, AelError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_alphanumeric() || self.chars[self.pos] == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected an identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_string_literal(&mut self) -> Result<Value, AelError> {
        let quote = self.peek().ok_or_else(|| self.error("expected a string"))?;
        self.pos += 1;
        let mut out = String::new();
        while let Some(&c) = self.chars.get(self.pos) {
            self.pos += 1;
            if c == quote {
                return Ok(Value::String(out));
            }
            out.push(c);
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_number(&mut self) -> Result<Value, AelError> {
        self.skip_ws();
        let start = self.pos;
        if self.chars.get(self.pos) == Some(&'-') {
            self.pos += 1;
        }
        let mut has_dot = false;
        while let Some(&c) = self.chars.get(self.pos) {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !has_dot {
                has_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if has_dot {
            text.parse::<f64>()
                .map(|f| json!(f))
                .map_err(|_| self.error(format!("invalid number '{text}'")))
        } else {
            text.parse::<i64>()
                .map(|i| json!(i))
                .map_err(|_| self.error(format!("invalid number '{text}'")))
        }
    }

    fn parse_filter(&mut self) -> Result<FilterCall, AelError> {
        let name = self.parse_ident()?;
        let mut args = Vec::new();
        if self.eat('(') {
            if self.peek() != Some(')') {
                loop {
                    args.push(self.parse_filter_arg()?);
                    if !self.eat(',') {
                        break;
                    }
                }
            }
            self.expect(')')?;
        }
        Ok(FilterCall { name, args })
    }

    fn parse_filter_arg(&mut self) -> Result<Value, AelError> {
        match self.peek() {
            Some('\'') | Some('"') => self.parse_string_literal(),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            _ => {
                if self.eat_keyword("true") {
                    Ok(Value::Bool(true))
                } else if self.eat_keyword("false") {
                    Ok(Value::Bool(false))
                } else if self.eat_keyword("null") {
                    Ok(Value::Null)
                } else {
                    Err(self.error("filter arguments must be literals"))
                }
            }
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Map<String, Value>, Map<String, Value>, Map<String, Value>) {
        let inputs = json!({
            "url": "https://example.org",
            "count": 3,
            "tags": ["a", "b", "c"],
            "nothing": null,
        });
        let steps = json!({
            "fetch": {
                "output": {"items": [1, 2, 3], "title": "Hello"},
                "status": "COMPLETED",
                "success": true,
            },
        });
        let (Value::Object(inputs), Value::Object(steps)) = (inputs, steps) else {
            unreachable!();
        };
        (inputs, steps, Map::new())
    }

    fn ctx<'a>(
        inputs: &'a Map<String, Value>,
        steps: &'a Map<String, Value>,
        config: &'a Map<String, Value>,
    ) -> TemplateContext<'a> {
        TemplateContext {
            inputs,
            steps,
            config,
            execution_id: "exec-42",
        }
    }

    #[test]
    fn pure_template_preserves_type() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(render_str("{{ inputs.count }}", &ctx).unwrap(), json!(3));
        assert_eq!(
            render_str("{{ steps.fetch.output.items }}", &ctx).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn mixed_content_interpolates_to_string() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(
            render_str("count={{ inputs.count }}!", &ctx).unwrap(),
            json!("count=3!")
        );
    }

    #[test]
    fn bracket_indexing_and_string_keys() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(render_str("{{ inputs.tags[1] }}", &ctx).unwrap(), json!("b"));
        assert_eq!(render_str("{{ inputs.tags[-1] }}", &ctx).unwrap(), json!("c"));
        assert_eq!(
            render_str("{{ steps['fetch'].output.title }}", &ctx).unwrap(),
            json!("Hello")
        );
    }

    #[test]
    fn execution_id_namespace() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(render_str("{{ execution_id }}", &ctx).unwrap(), json!("exec-42"));
    }

    #[test]
    fn unknown_path_is_template_error() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        let err = render_str("{{ inputs.missing }}", &ctx).unwrap_err();
        assert_eq!(err.code, errors::ErrorCode::TemplateError);
    }

    #[test]
    fn default_rescues_unknown_path_and_null() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(
            render_str("{{ inputs.missing | default(0) }}", &ctx).unwrap(),
            json!(0)
        );
        assert_eq!(
            render_str("{{ inputs.nothing | default('x') }}", &ctx).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn tojson_round_trips_any_json_value() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        for v in [
            json!(null),
            json!(true),
            json!(3.25),
            json!("text"),
            json!([1, {"k": [null, false]}]),
        ] {
            let mut inputs = i.clone();
            inputs.insert("value".to_string(), v.clone());
            let ctx2 = TemplateContext { inputs: &inputs, ..ctx };
            let rendered = render_str("{{ inputs.value | tojson }}", &ctx2).unwrap();
            let text = rendered.as_str().expect("tojson yields text");
            assert_eq!(serde_json::from_str::<Value>(text).unwrap(), v);
        }
    }

    #[test]
    fn filters_chain_left_to_right() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(
            render_str("{{ inputs.tags | join('-') | upper }}", &ctx).unwrap(),
            json!("A-B-C")
        );
        assert_eq!(render_str("{{ inputs.tags | length }}", &ctx).unwrap(), json!(3));
    }

    #[test]
    fn conjunctions_short_circuit_on_truthiness() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(
            render_str("{{ inputs.nothing or inputs.count }}", &ctx).unwrap(),
            json!(3)
        );
        assert_eq!(
            render_str("{{ inputs.url and inputs.count }}", &ctx).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn structural_documents_render_leaves() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        let doc = json!({
            "url": "{{ inputs.url }}",
            "nested": {"n": "{{ inputs.count }}"},
            "list": ["{{ inputs.tags[0] }}", 7],
        });
        let rendered = render(&doc, &ctx).unwrap();
        assert_eq!(
            rendered,
            json!({
                "url": "https://example.org",
                "nested": {"n": 3},
                "list": ["a", 7],
            })
        );
    }

    #[test]
    fn unknown_filter_and_bad_arg_types_error() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert!(render_str("{{ inputs.url | reverse }}", &ctx).is_err());
        assert!(render_str("{{ inputs.count | upper }}", &ctx).is_err());
    }

    #[test]
    fn unclosed_expression_is_a_syntax_error() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert!(render_str("{{ inputs.url", &ctx).is_err());
    }

    #[test]
    fn resolve_path_walks_dotted_paths() {
        let (i, s, c) = fixture();
        let ctx = ctx(&i, &s, &c);
        assert_eq!(
            resolve_path("steps.fetch.output.title", &ctx).unwrap(),
            json!("Hello")
        );
        assert!(resolve_path("steps.ghost.output", &ctx).is_err());
    }

    #[test]
    fn check_document_catches_syntax_without_resolving() {
        assert!(check_document(&json!({"ok": "{{ inputs.whatever }}"})).is_ok());
        assert!(check_document(&json!({"bad": "{{ inputs.x | }}"})).is_err());
    }
}
