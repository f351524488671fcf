//! Abstract syntax tree for the code-step fragment language.

use serde_json::Value;

/// A statement, tagged with its source line for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `import json` / `import urllib.parse as urlparse`
    Import {
        module: String,
        alias: Option<String>,
        line: usize,
    },
    /// `from datetime import datetime, timedelta`
    FromImport {
        module: String,
        names: Vec<String>,
        line: usize,
    },
    /// `x = expr` / `d['k'] = expr`
    Assign {
        target: Target,
        value: Expr,
        line: usize,
    },
    /// `x += expr`
    AugAdd {
        target: Target,
        value: Expr,
        line: usize,
    },
    /// `return` / `return expr`
    Return { value: Option<Expr>, line: usize },
    /// `if`/`elif` arms with an optional `else` block.
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
        line: usize,
    },
    /// `for name in expr:` over lists, dicts (keys), and strings (chars).
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    /// A bare expression evaluated for its effect.
    Expr { value: Expr, line: usize },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Import { line, .. }
            | Stmt::FromImport { line, .. }
            | Stmt::Assign { line, .. }
            | Stmt::AugAdd { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::If { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Expr { line, .. } => *line,
        }
    }
}

/// Assignment target: a name root followed by zero or more subscripts.
/// Attribute assignment is deliberately not representable.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub subs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String/number/bool/null literal.
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attr {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Bool {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `then if cond else orelse`
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// Walk every expression in a statement tree, leaves included.
pub fn walk_exprs<'a>(stmts: &'a [Stmt], visit: &mut dyn FnMut(&'a Expr)) {
    fn walk_expr<'a>(expr: &'a Expr, visit: &mut dyn FnMut(&'a Expr)) {
        visit(expr);
        match expr {
            Expr::Literal(_) | Expr::Name(_) => {}
            Expr::List(items) => items.iter().for_each(|e| walk_expr(e, visit)),
            Expr::Dict(pairs) => pairs.iter().for_each(|(k, v)| {
                walk_expr(k, visit);
                walk_expr(v, visit);
            }),
            Expr::Attr { obj, .. } => walk_expr(obj, visit),
            Expr::Index { obj, index } => {
                walk_expr(obj, visit);
                walk_expr(index, visit);
            }
            Expr::Call { func, args } => {
                walk_expr(func, visit);
                args.iter().for_each(|e| walk_expr(e, visit));
            }
            Expr::Unary { operand, .. } => walk_expr(operand, visit),
            Expr::Binary { left, right, .. }
            | Expr::Compare { left, right, .. }
            | Expr::Bool { left, right, .. } => {
                walk_expr(left, visit);
                walk_expr(right, visit);
            }
            Expr::Ternary { cond, then, orelse } => {
                walk_expr(cond, visit);
                walk_expr(then, visit);
                walk_expr(orelse, visit);
            }
        }
    }

    for stmt in stmts {
        match stmt {
            Stmt::Import { .. } | Stmt::FromImport { .. } => {}
            Stmt::Assign { target, value, .. } | Stmt::AugAdd { target, value, .. } => {
                target.subs.iter().for_each(|e| walk_expr(e, visit));
                walk_expr(value, visit);
            }
            Stmt::Return { value, .. } => {
                if let Some(v) = value {
                    walk_expr(v, visit);
                }
            }
            Stmt::If { arms, orelse, .. } => {
                for (cond, body) in arms {
                    walk_expr(cond, visit);
                    walk_exprs(body, visit);
                }
                walk_exprs(orelse, visit);
            }
            Stmt::For { iter, body, .. } => {
                walk_expr(iter, visit);
                walk_exprs(body, visit);
            }
            Stmt::Expr { value, .. } => walk_expr(value, visit),
        }
    }
}
