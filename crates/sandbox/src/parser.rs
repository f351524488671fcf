//! Recursive-descent parser and the static security gates.

use std::collections::HashSet;

use errors::{AelError, ErrorCode};
use serde_json::{json, Value};

use crate::ast::{BinOp, BoolOp, CmpOp, Expr, Stmt, Target, UnaryOp};
use crate::lexer::{tokenize, Tok, Token};

/// Identifiers that are rejected wherever they appear, even unreferenced
/// through the builtins table.
pub const FORBIDDEN_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
];

/// Parse a code fragment into a statement list.
pub fn parse(source: &str) -> Result<Vec<Stmt>, AelError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let stmts = parser.parse_block_until_eof()?;
    Ok(stmts)
}

/// Layer 1: reject any import outside the effective allowlist.
///
/// A module passes when its full dotted name or its first segment is
/// allowlisted (`urllib.parse` admits `import urllib.parse`).
pub fn check_imports(stmts: &[Stmt], allowed: &HashSet<String>) -> Result<(), AelError> {
    fn is_allowed(module: &str, allowed: &HashSet<String>) -> bool {
        if allowed.contains(module) {
            return true;
        }
        let first = module.split('.').next().unwrap_or(module);
        allowed.contains(first)
    }

    fn walk(stmts: &[Stmt], allowed: &HashSet<String>) -> Result<(), AelError> {
        for stmt in stmts {
            match stmt {
                Stmt::Import { module, line, .. } | Stmt::FromImport { module, line, .. } => {
                    if !is_allowed(module, allowed) {
                        return Err(AelError::new(ErrorCode::CodeSecurity)
                            .with_message(format!("Import '{module}' is not allowed"))
                            .with_detail(format!(
                                "line {line}: module is outside the effective allowlist"
                            )));
                    }
                }
                Stmt::If { arms, orelse, .. } => {
                    for (_, body) in arms {
                        walk(body, allowed)?;
                    }
                    walk(orelse, allowed)?;
                }
                Stmt::For { body, .. } => walk(body, allowed)?,
                _ => {}
            }
        }
        Ok(())
    }

    walk(stmts, allowed)
}

/// Layer 2 (static half): reject direct references to forbidden identifiers.
pub fn check_forbidden_names(stmts: &[Stmt]) -> Result<(), AelError> {
    let mut violation: Option<String> = None;
    crate::ast::walk_exprs(stmts, &mut |expr| {
        if violation.is_some() {
            return;
        }
        if let Expr::Name(name) = expr {
            if FORBIDDEN_NAMES.contains(&name.as_str()) {
                violation = Some(name.clone());
            }
        }
    });
    match violation {
        Some(name) => Err(AelError::new(ErrorCode::CodeSecurity)
            .with_message(format!("Use of '{name}' is not allowed"))),
        None => Ok(()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos].line
    }

    fn bump(&mut self) -> Tok {
        let t = self.tokens[self.pos].tok.clone();
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<(), AelError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, detail: impl Into<String>) -> AelError {
        AelError::new(ErrorCode::CodeSyntax)
            .with_message(format!("Syntax error at line {}", self.line()))
            .with_detail(detail)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block_until_eof(&mut self) -> Result<Vec<Stmt>, AelError> {
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Tok::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    /// Parse an indented block after a `:` + newline.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, AelError> {
        self.expect(&Tok::Newline, "newline after ':'")?;
        self.expect(&Tok::Indent, "an indented block")?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Tok::Dedent | Tok::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        self.eat(&Tok::Dedent);
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, AelError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Import => {
                self.bump();
                let module = self.parse_dotted_name()?;
                let alias = if self.eat(&Tok::As) {
                    Some(self.parse_name()?)
                } else {
                    None
                };
                self.expect(&Tok::Newline, "end of import statement")?;
                Ok(Stmt::Import { module, alias, line })
            }
            Tok::From => {
                self.bump();
                let module = self.parse_dotted_name()?;
                self.expect(&Tok::Import, "'import'")?;
                let mut names = vec![self.parse_name()?];
                while self.eat(&Tok::Comma) {
                    names.push(self.parse_name()?);
                }
                self.expect(&Tok::Newline, "end of import statement")?;
                Ok(Stmt::FromImport { module, names, line })
            }
            Tok::Return => {
                self.bump();
                let value = if matches!(self.peek(), Tok::Newline) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Tok::Newline, "end of return statement")?;
                Ok(Stmt::Return { value, line })
            }
            Tok::If => {
                self.bump();
                let mut arms = Vec::new();
                let cond = self.parse_expr()?;
                self.expect(&Tok::Colon, "':' after condition")?;
                arms.push((cond, self.parse_block()?));

                let mut orelse = Vec::new();
                loop {
                    if self.eat(&Tok::Elif) {
                        let cond = self.parse_expr()?;
                        self.expect(&Tok::Colon, "':' after condition")?;
                        arms.push((cond, self.parse_block()?));
                    } else if self.eat(&Tok::Else) {
                        self.expect(&Tok::Colon, "':' after else")?;
                        orelse = self.parse_block()?;
                        break;
                    } else {
                        break;
                    }
                }
                Ok(Stmt::If { arms, orelse, line })
            }
            Tok::For => {
                self.bump();
                let var = self.parse_name()?;
                self.expect(&Tok::In, "'in'")?;
                let iter = self.parse_expr()?;
                self.expect(&Tok::Colon, "':' after iterable")?;
                let body = self.parse_block()?;
                Ok(Stmt::For { var, iter, body, line })
            }
            _ => self.parse_simple_stmt(line),
        }
    }

    /// Assignment, augmented assignment, or bare expression.
    fn parse_simple_stmt(&mut self, line: usize) -> Result<Stmt, AelError> {
        let expr = self.parse_expr()?;
        let stmt = match self.peek() {
            Tok::Assign => {
                self.bump();
                let target = self.expr_to_target(expr)?;
                let value = self.parse_expr()?;
                Stmt::Assign { target, value, line }
            }
            Tok::PlusAssign => {
                self.bump();
                let target = self.expr_to_target(expr)?;
                let value = self.parse_expr()?;
                Stmt::AugAdd { target, value, line }
            }
            _ => Stmt::Expr { value: expr, line },
        };
        self.expect(&Tok::Newline, "end of statement")?;
        Ok(stmt)
    }

    /// Only a name followed by subscripts can be assigned to.
    fn expr_to_target(&self, expr: Expr) -> Result<Target, AelError> {
        let mut subs = Vec::new();
        let mut current = expr;
        loop {
            match current {
                Expr::Name(name) => {
                    subs.reverse();
                    return Ok(Target { name, subs });
                }
                Expr::Index { obj, index } => {
                    subs.push(*index);
                    current = *obj;
                }
                _ => return Err(self.error("invalid assignment target")),
            }
        }
    }

    fn parse_name(&mut self) -> Result<String, AelError> {
        match self.bump() {
            Tok::Name(n) => Ok(n),
            _ => Err(self.error("expected a name")),
        }
    }

    fn parse_dotted_name(&mut self) -> Result<String, AelError> {
        let mut name = self.parse_name()?;
        while self.eat(&Tok::Dot) {
            name.push('.');
            name.push_str(&self.parse_name()?);
        }
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing, lowest first)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, AelError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, AelError> {
        let then = self.parse_or()?;
        if self.eat(&Tok::If) {
            let cond = self.parse_or()?;
            self.expect(&Tok::Else, "'else' in conditional expression")?;
            let orelse = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                orelse: Box::new(orelse),
            });
        }
        Ok(then)
    }

    fn parse_or(&mut self) -> Result<Expr, AelError> {
        let mut left = self.parse_and()?;
        while self.eat(&Tok::Or) {
            let right = self.parse_and()?;
            left = Expr::Bool {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, AelError> {
        let mut left = self.parse_not()?;
        while self.eat(&Tok::And) {
            let right = self.parse_not()?;
            left = Expr::Bool {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, AelError> {
        if self.eat(&Tok::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, AelError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Tok::Eq => Some(CmpOp::Eq),
            Tok::Ne => Some(CmpOp::Ne),
            Tok::Lt => Some(CmpOp::Lt),
            Tok::Le => Some(CmpOp::Le),
            Tok::Gt => Some(CmpOp::Gt),
            Tok::Ge => Some(CmpOp::Ge),
            Tok::In => Some(CmpOp::In),
            Tok::Not => Some(CmpOp::NotIn),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        if op == CmpOp::NotIn {
            self.bump();
            self.expect(&Tok::In, "'in' after 'not'")?;
        } else {
            self.bump();
        }
        let right = self.parse_additive()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, AelError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, AelError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, AelError> {
        if self.eat(&Tok::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, AelError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.bump();
                    let name = self.parse_name()?;
                    expr = Expr::Attr {
                        obj: Box::new(expr),
                        name,
                    };
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Tok::RParen) {
                        args.push(self.parse_expr()?);
                        while self.eat(&Tok::Comma) {
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, AelError> {
        match self.bump() {
            Tok::Int(v) => Ok(Expr::Literal(json!(v))),
            Tok::Float(v) => Ok(Expr::Literal(json!(v))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::None => Ok(Expr::Literal(Value::Null)),
            Tok::Name(n) => Ok(Expr::Name(n)),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::RBracket) {
                    items.push(self.parse_expr()?);
                    while self.eat(&Tok::Comma) {
                        if matches!(self.peek(), Tok::RBracket) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect(&Tok::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                let mut pairs = Vec::new();
                if !matches!(self.peek(), Tok::RBrace) {
                    loop {
                        let key = self.parse_expr()?;
                        self.expect(&Tok::Colon, "':' in dict literal")?;
                        let value = self.parse_expr()?;
                        pairs.push((key, value));
                        if !self.eat(&Tok::Comma) || matches!(self.peek(), Tok::RBrace) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace, "'}'")?;
                Ok(Expr::Dict(pairs))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_happy_path_fragment() {
        let stmts = parse("return 2 + 3").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Return { value: Some(_), .. }));
    }

    #[test]
    fn parses_context_access_chain() {
        let stmts = parse("return context.steps['a'].output * 2").unwrap();
        let Stmt::Return { value: Some(expr), .. } = &stmts[0] else {
            panic!("expected return");
        };
        assert!(matches!(expr, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parses_if_elif_else_blocks() {
        let src = "if x > 1:\n    y = 1\nelif x > 0:\n    y = 2\nelse:\n    y = 3\n";
        let stmts = parse(src).unwrap();
        let Stmt::If { arms, orelse, .. } = &stmts[0] else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn parses_for_with_aug_assign() {
        let src = "total = 0\nfor n in context.inputs.numbers:\n    total += n\nreturn total\n";
        let stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[1], Stmt::For { .. }));
    }

    #[test]
    fn subscript_assignment_target() {
        let stmts = parse("d['k'] = 1").unwrap();
        let Stmt::Assign { target, .. } = &stmts[0] else {
            panic!("expected assign");
        };
        assert_eq!(target.name, "d");
        assert_eq!(target.subs.len(), 1);
    }

    #[test]
    fn attribute_assignment_is_rejected() {
        let err = parse("context.inputs = {}").unwrap_err();
        assert_eq!(err.code, ErrorCode::CodeSyntax);
    }

    #[test]
    fn import_gate_rejects_os() {
        let stmts = parse("import os\nreturn os.getcwd()").unwrap();
        let allowed: HashSet<String> =
            ["json", "math"].iter().map(|s| s.to_string()).collect();
        let err = check_imports(&stmts, &allowed).unwrap_err();
        assert_eq!(err.code, ErrorCode::CodeSecurity);
    }

    #[test]
    fn import_gate_accepts_dotted_allowlisted_module() {
        let stmts = parse("import urllib.parse").unwrap();
        let allowed: HashSet<String> =
            ["urllib.parse"].iter().map(|s| s.to_string()).collect();
        check_imports(&stmts, &allowed).unwrap();
    }

    #[test]
    fn forbidden_name_gate_catches_eval() {
        let stmts = parse("return eval('1')").unwrap();
        let err = check_forbidden_names(&stmts).unwrap_err();
        assert_eq!(err.code, ErrorCode::CodeSecurity);
    }

    #[test]
    fn not_in_comparison() {
        let stmts = parse("return 'x' not in items").unwrap();
        let Stmt::Return { value: Some(Expr::Compare { op, .. }), .. } = &stmts[0] else {
            panic!("expected comparison");
        };
        assert_eq!(*op, CmpOp::NotIn);
    }
}
