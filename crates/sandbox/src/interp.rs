//! The sandboxed interpreter.
//!
//! Evaluation is cooperative: the wall-clock deadline is checked at every
//! statement and loop-iteration boundary, and a fuel counter bounds pure
//! CPU work between checks.  Tool calls are the only suspension points and
//! are clamped to the remaining deadline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use errors::{AelError, ErrorCode};

use crate::ast::{BinOp, BoolOp, CmpOp, Expr, Stmt, Target, UnaryOp};
use crate::parser;
use crate::{PackageProfile, ToolCaller};

/// Evaluation-step budget between deadline checks.
const FUEL: u64 = 1_000_000;

/// Upper bound on values materialized by `range`.
const MAX_RANGE: i64 = 100_000;

// ---------------------------------------------------------------------------
// Configuration and context
// ---------------------------------------------------------------------------

/// Per-execution sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock bound for the whole fragment.
    pub timeout: Duration,
    /// Layer 4: tool calls admitted per code step.
    pub max_tool_calls: u32,
    /// Layer 1: effective import allowlist (profile ∪ additional).
    pub allowed_imports: HashSet<String>,
}

impl SandboxConfig {
    /// Build the effective allowlist from a package profile plus the
    /// workflow's and host's additional imports.
    pub fn for_profile(
        profile: PackageProfile,
        additional: &[String],
        timeout: Duration,
        max_tool_calls: u32,
    ) -> Self {
        let mut allowed: HashSet<String> =
            profile.imports().iter().map(|s| s.to_string()).collect();
        allowed.extend(additional.iter().cloned());
        Self {
            timeout,
            max_tool_calls,
            allowed_imports: allowed,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::for_profile(PackageProfile::Standard, &[], Duration::from_secs(30), 10)
    }
}

/// The constrained view of the world a code step sees.
#[derive(Clone)]
pub struct SandboxContext {
    pub inputs: Value,
    pub steps: Value,
    pub config: Value,
    pub execution_id: String,
    pub tools: Arc<dyn ToolCaller>,
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Parses, gates, and evaluates one code fragment per call.
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Validate a fragment without executing it (layers 1–2).
    pub fn validate(&self, code: &str) -> Result<(), AelError> {
        let stmts = parser::parse(code)?;
        parser::check_imports(&stmts, &self.config.allowed_imports)?;
        parser::check_forbidden_names(&stmts)?;
        Ok(())
    }

    /// Execute a fragment and return its value: the argument of a top-level
    /// `return`, else the binding named `result`, else null.
    pub async fn execute(&self, code: &str, ctx: SandboxContext) -> Result<Value, AelError> {
        let stmts = parser::parse(code)?;
        parser::check_imports(&stmts, &self.config.allowed_imports)?;
        parser::check_forbidden_names(&stmts)?;

        let timeout_seconds = self.config.timeout.as_secs_f64();
        let mut interp = Interp {
            env: HashMap::new(),
            ctx,
            deadline: Instant::now() + self.config.timeout,
            timeout_seconds,
            fuel: FUEL,
            tool_calls: 0,
            max_tool_calls: self.config.max_tool_calls,
        };

        let returned = interp.exec_block(&stmts).await?;
        debug!(tool_calls = interp.tool_calls, "code fragment finished");
        Ok(match returned {
            Some(v) => v,
            None => match interp.env.get("result") {
                Some(Binding::Value(v)) => v.clone(),
                _ => Value::Null,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Interpreter internals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Binding {
    Value(Value),
    Module(String),
    ModuleFn(String, String),
}

/// Intermediate evaluation result.  Most positions demand a plain value;
/// the other variants only exist so `context.tools.call`, modules, and
/// builtins can be recognized at the call site.
enum Eval {
    Val(Value),
    Module(String),
    ModuleFn(String, String),
    Ctx,
    CtxTools,
    ToolsCall,
    Builtin(&'static str),
    Method(Value, String),
}

const BUILTINS: &[&str] = &[
    "len", "str", "int", "float", "bool", "abs", "min", "max", "sum", "sorted", "range",
    "round", "enumerate",
];

struct Interp {
    env: HashMap<String, Binding>,
    ctx: SandboxContext,
    deadline: Instant,
    timeout_seconds: f64,
    fuel: u64,
    tool_calls: u32,
    max_tool_calls: u32,
}

fn runtime_error(detail: impl Into<String>) -> AelError {
    AelError::new(ErrorCode::CodeRuntime).with_detail(detail)
}

impl Interp {
    fn check_deadline(&self) -> Result<(), AelError> {
        if Instant::now() >= self.deadline {
            return Err(AelError::code_timeout(self.timeout_seconds));
        }
        Ok(())
    }

    fn burn(&mut self) -> Result<(), AelError> {
        self.fuel = self.fuel.saturating_sub(1);
        if self.fuel == 0 {
            return Err(AelError::new(ErrorCode::ResourceExhausted)
                .with_message("Code evaluation budget exceeded")
                .with_retryable(false));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Execute a block; `Some(value)` means a `return` unwound to here.
    fn exec_block<'a>(
        &'a mut self,
        stmts: &'a [Stmt],
    ) -> BoxFuture<'a, Result<Option<Value>, AelError>> {
        Box::pin(async move {
            for stmt in stmts {
                if let Some(v) = self.exec_stmt(stmt).await? {
                    return Ok(Some(v));
                }
            }
            Ok(None)
        })
    }

    async fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Option<Value>, AelError> {
        self.check_deadline()?;
        self.burn()?;

        match stmt {
            Stmt::Import { module, alias, .. } => {
                let bound = alias
                    .clone()
                    .unwrap_or_else(|| module.split('.').next().unwrap_or(module).to_string());
                self.env.insert(bound, Binding::Module(module.clone()));
                Ok(None)
            }
            Stmt::FromImport { module, names, .. } => {
                for name in names {
                    // `from datetime import datetime` pulls in the same
                    // namespace, not a function.
                    let binding = if module == "datetime" && name == "datetime" {
                        Binding::Module(module.clone())
                    } else {
                        Binding::ModuleFn(module.clone(), name.clone())
                    };
                    self.env.insert(name.clone(), binding);
                }
                Ok(None)
            }
            Stmt::Assign { target, value, .. } => {
                let value = self.eval_value(value).await?;
                self.assign(target, value).await?;
                Ok(None)
            }
            Stmt::AugAdd { target, value, line } => {
                let rhs = self.eval_value(value).await?;
                let current = self.read_target(target).ok_or_else(|| {
                    runtime_error(format!("line {line}: augmented target is not defined"))
                })?;
                let sum = binary(BinOp::Add, &current, &rhs)?;
                self.assign(target, sum).await?;
                Ok(None)
            }
            Stmt::Return { value, .. } => {
                let v = match value {
                    Some(expr) => self.eval_value(expr).await?,
                    None => Value::Null,
                };
                Ok(Some(v))
            }
            Stmt::If { arms, orelse, .. } => {
                for (cond, body) in arms {
                    let c = self.eval_value(cond).await?;
                    if truthy(&c) {
                        return self.exec_block(body).await;
                    }
                }
                self.exec_block(orelse).await
            }
            Stmt::For { var, iter, body, line } => {
                let iterable = self.eval_value(iter).await?;
                let items = iterate(&iterable).ok_or_else(|| {
                    runtime_error(format!("line {line}: value is not iterable"))
                })?;
                for item in items {
                    self.check_deadline()?;
                    self.burn()?;
                    self.env.insert(var.clone(), Binding::Value(item));
                    if let Some(v) = self.exec_block(body).await? {
                        return Ok(Some(v));
                    }
                }
                Ok(None)
            }
            Stmt::Expr { value, .. } => {
                self.eval_value(value).await?;
                Ok(None)
            }
        }
    }

    /// Current value of an assignment target, if fully resolvable.
    fn read_target(&mut self, target: &Target) -> Option<Value> {
        let root = match self.env.get(&target.name) {
            Some(Binding::Value(v)) => v.clone(),
            _ => return None,
        };
        if target.subs.is_empty() {
            return Some(root);
        }
        // Subscripts in augmented targets must be literal for a simple read.
        let mut current = root;
        for sub in &target.subs {
            let key = match sub {
                Expr::Literal(v) => v.clone(),
                _ => return None,
            };
            current = index_value(&current, &key).ok()?;
        }
        Some(current)
    }

    async fn assign(&mut self, target: &Target, value: Value) -> Result<(), AelError> {
        if target.subs.is_empty() {
            self.env
                .insert(target.name.clone(), Binding::Value(value));
            return Ok(());
        }

        // Evaluate subscript keys before taking the mutable borrow.
        let mut keys = Vec::with_capacity(target.subs.len());
        for sub in &target.subs {
            keys.push(self.eval_value(sub).await?);
        }

        let Some(Binding::Value(root)) = self.env.get_mut(&target.name) else {
            return Err(runtime_error(format!(
                "name '{}' is not defined or not assignable",
                target.name
            )));
        };

        let mut current = root;
        for key in &keys[..keys.len() - 1] {
            current = index_value_mut(current, key)?;
        }
        set_index(current, &keys[keys.len() - 1], value)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    async fn eval_value(&mut self, expr: &Expr) -> Result<Value, AelError> {
        match self.eval(expr).await? {
            Eval::Val(v) => Ok(v),
            Eval::Module(m) => Err(runtime_error(format!("module '{m}' is not a value"))),
            Eval::ModuleFn(m, f) => {
                Err(runtime_error(format!("function '{m}.{f}' is not a value")))
            }
            Eval::Ctx | Eval::CtxTools | Eval::ToolsCall => {
                Err(runtime_error("'context' facets cannot be used as values"))
            }
            Eval::Builtin(name) => Err(runtime_error(format!("builtin '{name}' is not a value"))),
            Eval::Method(_, name) => {
                Err(runtime_error(format!("method '{name}' is not a value")))
            }
        }
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Eval, AelError>> {
        Box::pin(async move {
            self.burn()?;
            match expr {
                Expr::Literal(v) => Ok(Eval::Val(v.clone())),
                Expr::Name(name) => self.eval_name(name),
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval_value(item).await?);
                    }
                    Ok(Eval::Val(Value::Array(out)))
                }
                Expr::Dict(pairs) => {
                    let mut map = Map::with_capacity(pairs.len());
                    for (k, v) in pairs {
                        let key = self.eval_value(k).await?;
                        let Value::String(key) = key else {
                            return Err(runtime_error("dict keys must be strings"));
                        };
                        map.insert(key, self.eval_value(v).await?);
                    }
                    Ok(Eval::Val(Value::Object(map)))
                }
                Expr::Attr { obj, name } => {
                    let base = self.eval(obj).await?;
                    self.eval_attr(base, name)
                }
                Expr::Index { obj, index } => {
                    let base = self.eval_value(obj).await?;
                    let key = self.eval_value(index).await?;
                    Ok(Eval::Val(index_value(&base, &key)?))
                }
                Expr::Call { func, args } => self.eval_call(func, args).await,
                Expr::Unary { op, operand } => {
                    let v = self.eval_value(operand).await?;
                    match op {
                        UnaryOp::Not => Ok(Eval::Val(Value::Bool(!truthy(&v)))),
                        UnaryOp::Neg => {
                            if let Some(i) = v.as_i64() {
                                Ok(Eval::Val(json!(-i)))
                            } else if let Some(f) = v.as_f64() {
                                Ok(Eval::Val(json!(-f)))
                            } else {
                                Err(runtime_error("unary '-' needs a number"))
                            }
                        }
                    }
                }
                Expr::Binary { op, left, right } => {
                    let l = self.eval_value(left).await?;
                    let r = self.eval_value(right).await?;
                    Ok(Eval::Val(binary(*op, &l, &r)?))
                }
                Expr::Compare { op, left, right } => {
                    let l = self.eval_value(left).await?;
                    let r = self.eval_value(right).await?;
                    Ok(Eval::Val(Value::Bool(compare(*op, &l, &r)?)))
                }
                Expr::Bool { op, left, right } => {
                    let l = self.eval_value(left).await?;
                    match (op, truthy(&l)) {
                        (BoolOp::And, false) | (BoolOp::Or, true) => Ok(Eval::Val(l)),
                        _ => Ok(Eval::Val(self.eval_value(right).await?)),
                    }
                }
                Expr::Ternary { cond, then, orelse } => {
                    let c = self.eval_value(cond).await?;
                    if truthy(&c) {
                        Ok(Eval::Val(self.eval_value(then).await?))
                    } else {
                        Ok(Eval::Val(self.eval_value(orelse).await?))
                    }
                }
            }
        })
    }

    fn eval_name(&self, name: &str) -> Result<Eval, AelError> {
        if let Some(binding) = self.env.get(name) {
            return Ok(match binding {
                Binding::Value(v) => Eval::Val(v.clone()),
                Binding::Module(m) => Eval::Module(m.clone()),
                Binding::ModuleFn(m, f) => Eval::ModuleFn(m.clone(), f.clone()),
            });
        }
        if name == "context" {
            return Ok(Eval::Ctx);
        }
        if let Some(&builtin) = BUILTINS.iter().find(|b| **b == name) {
            return Ok(Eval::Builtin(builtin));
        }
        Err(runtime_error(format!("name '{name}' is not defined")))
    }

    fn eval_attr(&self, base: Eval, name: &str) -> Result<Eval, AelError> {
        match base {
            Eval::Ctx => match name {
                "inputs" => Ok(Eval::Val(self.ctx.inputs.clone())),
                "steps" => Ok(Eval::Val(self.ctx.steps.clone())),
                "config" => Ok(Eval::Val(self.ctx.config.clone())),
                "execution_id" => Ok(Eval::Val(Value::String(self.ctx.execution_id.clone()))),
                "tools" => Ok(Eval::CtxTools),
                other => Err(runtime_error(format!("context has no attribute '{other}'"))),
            },
            Eval::CtxTools => match name {
                "call" => Ok(Eval::ToolsCall),
                other => Err(runtime_error(format!(
                    "context.tools has no attribute '{other}'"
                ))),
            },
            Eval::Module(module) => match (module.as_str(), name) {
                ("math", "pi") => Ok(Eval::Val(json!(std::f64::consts::PI))),
                // `datetime.datetime` is the same namespace here.
                ("datetime", "datetime") => Ok(Eval::Module("datetime".to_string())),
                (_, func) => Ok(Eval::ModuleFn(module, func.to_string())),
            },
            Eval::Val(value) => {
                // Object fields read as attributes (step outputs use this);
                // anything else is a bound method resolved at call time.
                if let Value::Object(map) = &value {
                    if let Some(field) = map.get(name) {
                        return Ok(Eval::Val(field.clone()));
                    }
                }
                Ok(Eval::Method(value, name.to_string()))
            }
            Eval::ModuleFn(m, f) => Err(runtime_error(format!(
                "function '{m}.{f}' has no attribute '{name}'"
            ))),
            Eval::ToolsCall | Eval::Builtin(_) | Eval::Method(_, _) => {
                Err(runtime_error(format!("no attribute '{name}'")))
            }
        }
    }

    async fn eval_call(&mut self, func: &Expr, args: &[Expr]) -> Result<Eval, AelError> {
        // Mutating list/dict methods need the receiver as a place, not a copy.
        if let Expr::Attr { obj, name } = func {
            if matches!(name.as_str(), "append" | "extend" | "update") {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_value(arg).await?);
                }
                return self.mutate_in_place(obj, name, values).await.map(Eval::Val);
            }
        }

        let callee = self.eval(func).await?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_value(arg).await?);
        }

        match callee {
            Eval::ToolsCall => self.call_tool(values).await.map(Eval::Val),
            Eval::Builtin(name) => call_builtin(name, values).map(Eval::Val),
            Eval::ModuleFn(module, func) => {
                call_module_fn(&module, &func, values).map(Eval::Val)
            }
            Eval::Module(m) if m == "datetime" => {
                // `datetime.datetime(...)` construction is not supported;
                // only utcnow()/now() via attr resolution.
                Err(runtime_error("datetime construction is not supported"))
            }
            Eval::Method(recv, name) => value_method(&recv, &name, values).map(Eval::Val),
            Eval::Val(_) | Eval::Module(_) | Eval::Ctx | Eval::CtxTools => {
                Err(runtime_error("value is not callable"))
            }
        }
    }

    /// Layers 3, 4, 5, and 7 around one `context.tools.call`.
    async fn call_tool(&mut self, mut args: Vec<Value>) -> Result<Value, AelError> {
        if args.is_empty() || args.len() > 2 {
            return Err(runtime_error("tools.call takes (name, params)"));
        }
        let params = if args.len() == 2 {
            args.pop().expect("len checked")
        } else {
            json!({})
        };
        let name = match args.pop().expect("len checked") {
            Value::String(s) => s,
            _ => return Err(runtime_error("tool name must be a string")),
        };

        // Layer 7: no code step may start another code step.
        if name == "python_exec" {
            return Err(AelError::tool_rejected(
                &name,
                "tool cannot be called from within code blocks",
            ));
        }

        // Layer 4: per-step call budget.
        if self.tool_calls >= self.max_tool_calls {
            return Err(AelError::new(ErrorCode::ResourceExhausted)
                .with_message(format!(
                    "Max tool calls ({}) exceeded",
                    self.max_tool_calls
                ))
                .with_retryable(false));
        }
        self.tool_calls += 1;

        // Layer 5: params must be a JSON object.
        if !params.is_object() {
            return Err(AelError::new(ErrorCode::ParamInvalid)
                .with_message(format!("Invalid parameters for tool '{name}'"))
                .with_detail("params must be a JSON object"));
        }

        // Layer 3: the invoker decides availability in this execution.
        if !self.ctx.tools.is_available(&name).await {
            return Err(AelError::tool_rejected(
                &name,
                "tool is not available in this execution",
            ));
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AelError::code_timeout(self.timeout_seconds));
        }
        match tokio::time::timeout(remaining, self.ctx.tools.call(&name, params)).await {
            Ok(result) => result,
            Err(_) => Err(AelError::code_timeout(self.timeout_seconds)),
        }
    }

    async fn mutate_in_place(
        &mut self,
        obj: &Expr,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, AelError> {
        // The receiver must be a name followed by subscripts.
        let mut subs_rev = Vec::new();
        let mut current = obj;
        let root = loop {
            match current {
                Expr::Name(name) => break name.clone(),
                Expr::Index { obj, index } => {
                    subs_rev.push((**index).clone());
                    current = obj;
                }
                _ => return Err(runtime_error("cannot mutate a temporary value")),
            }
        };
        subs_rev.reverse();

        let mut keys = Vec::with_capacity(subs_rev.len());
        for sub in &subs_rev {
            keys.push(self.eval_value(sub).await?);
        }

        let Some(Binding::Value(root_value)) = self.env.get_mut(&root) else {
            return Err(runtime_error(format!("name '{root}' is not defined")));
        };
        let mut place = root_value;
        for key in &keys {
            place = index_value_mut(place, key)?;
        }

        match (method, place) {
            ("append", Value::Array(items)) => {
                if args.len() != 1 {
                    return Err(runtime_error("append takes one argument"));
                }
                items.push(args.pop().expect("len checked"));
                Ok(Value::Null)
            }
            ("extend", Value::Array(items)) => {
                if args.len() != 1 {
                    return Err(runtime_error("extend takes one argument"));
                }
                match args.pop().expect("len checked") {
                    Value::Array(more) => {
                        items.extend(more);
                        Ok(Value::Null)
                    }
                    _ => Err(runtime_error("extend takes a list")),
                }
            }
            ("update", Value::Object(map)) => {
                if args.len() != 1 {
                    return Err(runtime_error("update takes one argument"));
                }
                match args.pop().expect("len checked") {
                    Value::Object(more) => {
                        for (k, v) in more {
                            map.insert(k, v);
                        }
                        Ok(Value::Null)
                    }
                    _ => Err(runtime_error("update takes a dict")),
                }
            }
            (m, _) => Err(runtime_error(format!("method '{m}' needs a list or dict"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn iterate(v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => Some(map.keys().map(|k| Value::String(k.clone())).collect()),
        Value::String(s) => Some(s.chars().map(|c| Value::String(c.to_string())).collect()),
        _ => None,
    }
}

fn index_value(base: &Value, key: &Value) -> Result<Value, AelError> {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| runtime_error(format!("key '{k}' not found"))),
        (Value::Array(items), Value::Number(n)) => {
            let idx = resolve_index(items.len(), n)?;
            Ok(items[idx].clone())
        }
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = resolve_index(chars.len(), n)?;
            Ok(Value::String(chars[idx].to_string()))
        }
        _ => Err(runtime_error("value does not support indexing")),
    }
}

fn index_value_mut<'v>(base: &'v mut Value, key: &Value) -> Result<&'v mut Value, AelError> {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map
            .get_mut(k)
            .ok_or_else(|| runtime_error(format!("key '{k}' not found"))),
        (Value::Array(items), Value::Number(n)) => {
            let idx = resolve_index(items.len(), n)?;
            Ok(&mut items[idx])
        }
        _ => Err(runtime_error("value does not support indexing")),
    }
}

fn set_index(base: &mut Value, key: &Value, value: Value) -> Result<(), AelError> {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => {
            map.insert(k.clone(), value);
            Ok(())
        }
        (Value::Array(items), Value::Number(n)) => {
            let idx = resolve_index(items.len(), n)?;
            items[idx] = value;
            Ok(())
        }
        _ => Err(runtime_error("value does not support item assignment")),
    }
}

fn resolve_index(len: usize, n: &serde_json::Number) -> Result<usize, AelError> {
    let raw = n
        .as_i64()
        .ok_or_else(|| runtime_error("index must be an integer"))?;
    let idx = if raw < 0 { raw + len as i64 } else { raw };
    if idx < 0 || idx as usize >= len {
        return Err(runtime_error(format!("index {raw} out of range")));
    }
    Ok(idx as usize)
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn both_ints(l: &Value, r: &Value) -> Option<(i64, i64)> {
    Some((l.as_i64()?, r.as_i64()?))
}

fn py_floordiv(a: i64, b: i64) -> Result<i64, AelError> {
    if b == 0 {
        return Err(runtime_error("division by zero"));
    }
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn py_mod(a: i64, b: i64) -> Result<i64, AelError> {
    Ok(a - py_floordiv(a, b)? * b)
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, AelError> {
    // String and list concatenation.
    if op == BinOp::Add {
        if let (Value::String(a), Value::String(b)) = (l, r) {
            return Ok(Value::String(format!("{a}{b}")));
        }
        if let (Value::Array(a), Value::Array(b)) = (l, r) {
            let mut out = a.clone();
            out.extend(b.clone());
            return Ok(Value::Array(out));
        }
    }

    if let Some((a, b)) = both_ints(l, r) {
        return Ok(match op {
            BinOp::Add => json!(a.checked_add(b).ok_or_else(|| runtime_error("integer overflow"))?),
            BinOp::Sub => json!(a.checked_sub(b).ok_or_else(|| runtime_error("integer overflow"))?),
            BinOp::Mul => json!(a.checked_mul(b).ok_or_else(|| runtime_error("integer overflow"))?),
            BinOp::Div => {
                if b == 0 {
                    return Err(runtime_error("division by zero"));
                }
                json!(a as f64 / b as f64)
            }
            BinOp::FloorDiv => json!(py_floordiv(a, b)?),
            BinOp::Mod => json!(py_mod(a, b)?),
        });
    }

    let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) else {
        return Err(runtime_error("operands do not support this operation"));
    };
    Ok(match op {
        BinOp::Add => json!(a + b),
        BinOp::Sub => json!(a - b),
        BinOp::Mul => json!(a * b),
        BinOp::Div => {
            if b == 0.0 {
                return Err(runtime_error("division by zero"));
            }
            json!(a / b)
        }
        BinOp::FloorDiv => json!((a / b).floor()),
        BinOp::Mod => json!(a - (a / b).floor() * b),
    })
}

fn value_eq(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        return a == b;
    }
    l == r
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, AelError> {
    match op {
        CmpOp::Eq => Ok(value_eq(l, r)),
        CmpOp::Ne => Ok(!value_eq(l, r)),
        CmpOp::In | CmpOp::NotIn => {
            let found = match r {
                Value::Array(items) => items.iter().any(|item| value_eq(item, l)),
                Value::Object(map) => match l {
                    Value::String(k) => map.contains_key(k),
                    _ => false,
                },
                Value::String(haystack) => match l {
                    Value::String(needle) => haystack.contains(needle.as_str()),
                    _ => false,
                },
                _ => return Err(runtime_error("'in' needs a list, dict, or string")),
            };
            Ok(if op == CmpOp::In { found } else { !found })
        }
        _ => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) else {
                        return Err(runtime_error("values are not orderable"));
                    };
                    a.partial_cmp(&b)
                        .ok_or_else(|| runtime_error("values are not orderable"))?
                }
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!("handled above"),
            })
        }
    }
}

fn value_to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Builtins, module functions, and value methods
// ---------------------------------------------------------------------------

fn arity(args: &[Value], expected: usize, name: &str) -> Result<(), AelError> {
    if args.len() != expected {
        return Err(runtime_error(format!("{name} takes {expected} argument(s)")));
    }
    Ok(())
}

fn call_builtin(name: &str, mut args: Vec<Value>) -> Result<Value, AelError> {
    match name {
        "len" => {
            arity(&args, 1, "len")?;
            match &args[0] {
                Value::String(s) => Ok(json!(s.chars().count())),
                Value::Array(items) => Ok(json!(items.len())),
                Value::Object(map) => Ok(json!(map.len())),
                _ => Err(runtime_error("len needs a string, list, or dict")),
            }
        }
        "str" => {
            arity(&args, 1, "str")?;
            Ok(Value::String(value_to_display(&args[0])))
        }
        "int" => {
            arity(&args, 1, "int")?;
            match &args[0] {
                Value::Number(n) => {
                    let f = n.as_f64().ok_or_else(|| runtime_error("invalid number"))?;
                    Ok(json!(f.trunc() as i64))
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|i| json!(i))
                    .map_err(|_| runtime_error(format!("cannot convert '{s}' to int"))),
                Value::Bool(b) => Ok(json!(if *b { 1 } else { 0 })),
                _ => Err(runtime_error("int needs a number or string")),
            }
        }
        "float" => {
            arity(&args, 1, "float")?;
            match &args[0] {
                Value::Number(n) => Ok(json!(n.as_f64().unwrap_or(0.0))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|f| json!(f))
                    .map_err(|_| runtime_error(format!("cannot convert '{s}' to float"))),
                _ => Err(runtime_error("float needs a number or string")),
            }
        }
        "bool" => {
            arity(&args, 1, "bool")?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "abs" => {
            arity(&args, 1, "abs")?;
            if let Some(i) = args[0].as_i64() {
                Ok(json!(i.abs()))
            } else if let Some(f) = args[0].as_f64() {
                Ok(json!(f.abs()))
            } else {
                Err(runtime_error("abs needs a number"))
            }
        }
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Err(runtime_error("round takes 1 or 2 arguments"));
            }
            let f = args[0]
                .as_f64()
                .ok_or_else(|| runtime_error("round needs a number"))?;
            if args.len() == 2 {
                let digits = args[1]
                    .as_i64()
                    .ok_or_else(|| runtime_error("round digits must be an integer"))?;
                let factor = 10f64.powi(digits as i32);
                Ok(json!((f * factor).round() / factor))
            } else {
                Ok(json!(f.round() as i64))
            }
        }
        "min" | "max" => {
            let items = if args.len() == 1 {
                match args.pop().expect("len checked") {
                    Value::Array(items) => items,
                    other => vec![other],
                }
            } else {
                args
            };
            if items.is_empty() {
                return Err(runtime_error(format!("{name} of an empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let replace = if name == "min" {
                    compare(CmpOp::Lt, item, &best)?
                } else {
                    compare(CmpOp::Gt, item, &best)?
                };
                if replace {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" => {
            arity(&args, 1, "sum")?;
            let Value::Array(items) = &args[0] else {
                return Err(runtime_error("sum needs a list"));
            };
            let mut total = json!(0);
            for item in items {
                total = binary(BinOp::Add, &total, item)?;
            }
            Ok(total)
        }
        "sorted" => {
            arity(&args, 1, "sorted")?;
            let Value::Array(items) = &args[0] else {
                return Err(runtime_error("sorted needs a list"));
            };
            let mut out = items.clone();
            let mut failed = false;
            out.sort_by(|a, b| {
                let ord = match (a, b) {
                    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                    _ => match (as_f64(a), as_f64(b)) {
                        (Some(x), Some(y)) => x.partial_cmp(&y),
                        _ => None,
                    },
                };
                ord.unwrap_or_else(|| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(runtime_error("sorted needs comparable elements"));
            }
            Ok(Value::Array(out))
        }
        "range" => {
            let (start, stop, step) = match args.len() {
                1 => (0, int_arg(&args[0], "range")?, 1),
                2 => (int_arg(&args[0], "range")?, int_arg(&args[1], "range")?, 1),
                3 => (
                    int_arg(&args[0], "range")?,
                    int_arg(&args[1], "range")?,
                    int_arg(&args[2], "range")?,
                ),
                _ => return Err(runtime_error("range takes 1 to 3 arguments")),
            };
            if step == 0 {
                return Err(runtime_error("range step must not be zero"));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                if out.len() as i64 >= MAX_RANGE {
                    return Err(AelError::new(ErrorCode::ResourceExhausted)
                        .with_message("range is too large")
                        .with_retryable(false));
                }
                out.push(json!(i));
                i += step;
            }
            Ok(Value::Array(out))
        }
        "enumerate" => {
            arity(&args, 1, "enumerate")?;
            let Value::Array(items) = &args[0] else {
                return Err(runtime_error("enumerate needs a list"));
            };
            Ok(Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| json!([i, v]))
                    .collect(),
            ))
        }
        other => Err(runtime_error(format!("builtin '{other}' is not supported"))),
    }
}

fn int_arg(v: &Value, name: &str) -> Result<i64, AelError> {
    v.as_i64()
        .ok_or_else(|| runtime_error(format!("{name} needs integer arguments")))
}

fn str_arg<'a>(args: &'a [Value], idx: usize, name: &str) -> Result<&'a str, AelError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| runtime_error(format!("{name} needs a string argument")))
}

fn call_module_fn(module: &str, func: &str, args: Vec<Value>) -> Result<Value, AelError> {
    match (module, func) {
        ("json", "dumps") => {
            arity(&args, 1, "json.dumps")?;
            serde_json::to_string(&args[0])
                .map(Value::String)
                .map_err(|e| runtime_error(format!("json.dumps failed: {e}")))
        }
        ("json", "loads") => {
            let s = str_arg(&args, 0, "json.loads")?;
            serde_json::from_str(s).map_err(|e| runtime_error(format!("json.loads failed: {e}")))
        }
        ("math", "floor") => Ok(json!(float_arg(&args, 0, "math.floor")?.floor() as i64)),
        ("math", "ceil") => Ok(json!(float_arg(&args, 0, "math.ceil")?.ceil() as i64)),
        ("math", "sqrt") => {
            let f = float_arg(&args, 0, "math.sqrt")?;
            if f < 0.0 {
                return Err(runtime_error("math.sqrt of a negative number"));
            }
            Ok(json!(f.sqrt()))
        }
        ("math", "fabs") => Ok(json!(float_arg(&args, 0, "math.fabs")?.abs())),
        ("math", "pow") => Ok(json!(
            float_arg(&args, 0, "math.pow")?.powf(float_arg(&args, 1, "math.pow")?)
        )),
        ("re", "search") => {
            let pattern = compile_pattern(str_arg(&args, 0, "re.search")?)?;
            let hay = str_arg(&args, 1, "re.search")?;
            Ok(match pattern.find(hay) {
                Some(m) => Value::String(m.as_str().to_string()),
                None => Value::Null,
            })
        }
        ("re", "findall") => {
            let pattern = compile_pattern(str_arg(&args, 0, "re.findall")?)?;
            let hay = str_arg(&args, 1, "re.findall")?;
            Ok(Value::Array(
                pattern
                    .find_iter(hay)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .collect(),
            ))
        }
        ("re", "sub") => {
            let pattern = compile_pattern(str_arg(&args, 0, "re.sub")?)?;
            let repl = str_arg(&args, 1, "re.sub")?;
            let hay = str_arg(&args, 2, "re.sub")?;
            Ok(Value::String(pattern.replace_all(hay, repl).into_owned()))
        }
        ("datetime", "utcnow") | ("datetime", "now") => {
            Ok(Value::String(chrono::Utc::now().to_rfc3339()))
        }
        ("uuid", "uuid4") => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        ("hashlib", "sha256") => {
            let s = str_arg(&args, 0, "hashlib.sha256")?;
            let digest = Sha256::digest(s.as_bytes());
            Ok(Value::String(format!("{digest:x}")))
        }
        (m, f) => Err(runtime_error(format!(
            "function '{m}.{f}' is not supported in the sandbox"
        ))),
    }
}

fn float_arg(args: &[Value], idx: usize, name: &str) -> Result<f64, AelError> {
    args.get(idx)
        .and_then(Value::as_f64)
        .ok_or_else(|| runtime_error(format!("{name} needs a number argument")))
}

fn compile_pattern(pattern: &str) -> Result<regex::Regex, AelError> {
    regex::Regex::new(pattern).map_err(|e| runtime_error(format!("invalid pattern: {e}")))
}

fn value_method(recv: &Value, name: &str, args: Vec<Value>) -> Result<Value, AelError> {
    match (recv, name) {
        (Value::String(s), "upper") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "lower") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "strip") => Ok(Value::String(s.trim().to_string())),
        // Lets hashlib.sha256(x).hexdigest() read naturally: the digest is
        // already hex text.
        (Value::String(s), "hexdigest") => Ok(Value::String(s.clone())),
        (Value::String(s), "split") => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace()
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            } else {
                let sep = str_arg(&args, 0, "split")?;
                s.split(sep).map(|p| Value::String(p.to_string())).collect()
            };
            Ok(Value::Array(parts))
        }
        (Value::String(sep), "join") => {
            let Some(Value::Array(items)) = args.first() else {
                return Err(runtime_error("join needs a list"));
            };
            let parts: Result<Vec<&str>, AelError> = items
                .iter()
                .map(|v| v.as_str().ok_or_else(|| runtime_error("join needs strings")))
                .collect();
            Ok(Value::String(parts?.join(sep)))
        }
        (Value::String(s), "startswith") => {
            Ok(Value::Bool(s.starts_with(str_arg(&args, 0, "startswith")?)))
        }
        (Value::String(s), "endswith") => {
            Ok(Value::Bool(s.ends_with(str_arg(&args, 0, "endswith")?)))
        }
        (Value::String(s), "replace") => {
            let from = str_arg(&args, 0, "replace")?;
            let to = str_arg(&args, 1, "replace")?;
            Ok(Value::String(s.replace(from, to)))
        }
        (Value::Object(map), "get") => {
            let key = str_arg(&args, 0, "get")?;
            Ok(map
                .get(key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Null)))
        }
        (Value::Object(map), "keys") => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        (Value::Object(map), "values") => Ok(Value::Array(map.values().cloned().collect())),
        (Value::Object(map), "items") => Ok(Value::Array(
            map.iter().map(|(k, v)| json!([k, v])).collect(),
        )),
        (_, other) => Err(runtime_error(format!("unknown method '{other}'"))),
    }
}
