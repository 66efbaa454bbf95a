// File: src/printer.rs
//
// Source-text emitter: walks the reconstructed tree and prints Python.
// Every node variant has exactly one rendering; expression printing is
// precedence-aware so parentheses appear only where the tree requires
// them.

use crate::ast::{BinaryOp, Block, BlockKind, BoolOp, Expr, FunctionExpr, Stmt, UnaryOp};
use crate::code::{CodeFlags, ComprehensionKind, Object};
use crate::version::PythonVersion;

/// Expression precedence levels, loosest binding first.
mod prec {
    pub const OPEN: u8 = 0;
    pub const TERNARY: u8 = 2;
    pub const OR: u8 = 3;
    pub const AND: u8 = 4;
    pub const NOT: u8 = 5;
    pub const COMPARE: u8 = 6;
    pub const BIT_OR: u8 = 7;
    pub const BIT_XOR: u8 = 8;
    pub const BIT_AND: u8 = 9;
    pub const SHIFT: u8 = 10;
    pub const ARITH: u8 = 11;
    pub const TERM: u8 = 12;
    pub const UNARY: u8 = 13;
    pub const POWER: u8 = 14;
    pub const AWAIT: u8 = 15;
    pub const POSTFIX: u8 = 16;
    pub const ATOM: u8 = 17;
}

fn binary_prec(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::BitOr => prec::BIT_OR,
        BinaryOp::BitXor => prec::BIT_XOR,
        BinaryOp::BitAnd => prec::BIT_AND,
        BinaryOp::LShift | BinaryOp::RShift => prec::SHIFT,
        BinaryOp::Add | BinaryOp::Sub => prec::ARITH,
        BinaryOp::Mul | BinaryOp::MatMul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => {
            prec::TERM
        }
        BinaryOp::Pow => prec::POWER,
    }
}

/// Render a module tree as source text.
///
/// A build that saw soft decode errors is prefixed with a warning banner
/// so nobody mistakes the output for a faithful reconstruction.
pub fn print_source(root: &Block, version: PythonVersion, clean_build: bool) -> String {
    let mut printer = Printer::new(version);
    if !clean_build {
        printer.out.push_str("# WARNING: Decompyle incomplete\n");
    }
    printer.write_scope_body(root);
    printer.out
}

struct Printer {
    out: String,
    indent: usize,
    version: PythonVersion,
}

impl Printer {
    fn new(version: PythonVersion) -> Self {
        Self { out: String::new(), indent: 0, version }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// The statements of a scope: docstring, global declarations, body,
    /// or `pass` when there is nothing to print.
    fn write_scope_body(&mut self, block: &Block) {
        let mut printed = false;
        if let Some(doc) = &block.docstring {
            self.line(&docstring_literal(doc));
            printed = true;
        }
        if !block.globals.is_empty() {
            let decl = format!("global {}", block.globals.join(", "));
            self.line(&decl);
            printed = true;
        }
        for stmt in &block.body {
            self.write_stmt(stmt);
            printed = true;
        }
        if !printed && !matches!(block.kind, BlockKind::Main) {
            self.line("pass");
        }
    }

    fn write_body(&mut self, block: &Block) {
        self.indent += 1;
        self.write_scope_body(block);
        self.indent -= 1;
    }

    fn write_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Store { targets, value } => self.write_store(targets, value),
            Stmt::AugAssign { target, op, value } => {
                let line = format!(
                    "{} {}= {}",
                    self.expr(target, prec::OPEN),
                    op.symbol(),
                    self.expr(value, prec::OPEN)
                );
                self.line(&line);
            }
            Stmt::AnnAssign { target, annotation, value } => {
                let mut line = format!(
                    "{}: {}",
                    self.expr(target, prec::OPEN),
                    self.expr(annotation, prec::OPEN)
                );
                if let Some(value) = value {
                    line.push_str(&format!(" = {}", self.expr(value, prec::OPEN)));
                }
                self.line(&line);
            }
            Stmt::Delete(target) => {
                let line = format!("del {}", self.expr(target, prec::OPEN));
                self.line(&line);
            }
            Stmt::Expression(expr) => {
                let line = self.expr(expr, prec::OPEN);
                self.line(&line);
            }
            Stmt::Return(value) => match value {
                Some(value) => {
                    let line = format!("return {}", self.expr(value, prec::OPEN));
                    self.line(&line);
                }
                None => self.line("return"),
            },
            Stmt::Raise(operands) => self.write_raise(operands),
            Stmt::Assert { test, message } => {
                let mut line = format!("assert {}", self.expr(test, prec::TERNARY));
                if let Some(message) = message {
                    line.push_str(&format!(", {}", self.expr(message, prec::TERNARY)));
                }
                self.line(&line);
            }
            Stmt::Import { module, alias } => {
                let line = match alias {
                    Some(alias) => format!("import {} as {}", module, alias),
                    None => format!("import {}", module),
                };
                self.line(&line);
            }
            Stmt::ImportFrom { module, names } => {
                let rendered: Vec<String> = names
                    .iter()
                    .map(|(name, alias)| match alias {
                        Some(alias) => format!("{} as {}", name, alias),
                        None => name.clone(),
                    })
                    .collect();
                let line = format!("from {} import {}", module, rendered.join(", "));
                self.line(&line);
            }
            Stmt::ImportStar { module } => {
                let line = format!("from {} import *", module);
                self.line(&line);
            }
            Stmt::Keyword(kind) => self.line(kind.text()),
            Stmt::Print { dest, values, newline } => {
                let mut parts = Vec::new();
                if let Some(dest) = dest {
                    parts.push(format!(">>{}", self.expr(dest, prec::TERNARY)));
                }
                for value in values {
                    parts.push(self.expr(value, prec::TERNARY));
                }
                let mut line = if parts.is_empty() {
                    "print".to_string()
                } else {
                    format!("print {}", parts.join(", "))
                };
                if !newline {
                    line.push(',');
                }
                self.line(&line);
            }
            Stmt::Exec { body, globals, locals } => {
                let mut line = format!("exec {}", self.expr(body, prec::TERNARY));
                if let Some(globals) = globals {
                    line.push_str(&format!(" in {}", self.expr(globals, prec::TERNARY)));
                    if let Some(locals) = locals {
                        line.push_str(&format!(", {}", self.expr(locals, prec::TERNARY)));
                    }
                }
                self.line(&line);
            }
            Stmt::Block(block) => self.write_block(block),
        }
    }

    fn write_raise(&mut self, operands: &[Expr]) {
        let line = match operands {
            [] => "raise".to_string(),
            [exc] => format!("raise {}", self.expr(exc, prec::TERNARY)),
            [exc, second] if self.version.is_py3() => format!(
                "raise {} from {}",
                self.expr(exc, prec::TERNARY),
                self.expr(second, prec::TERNARY)
            ),
            rest => {
                let parts: Vec<String> =
                    rest.iter().map(|e| self.expr(e, prec::TERNARY)).collect();
                format!("raise {}", parts.join(", "))
            }
        };
        self.line(&line);
    }

    fn write_store(&mut self, targets: &[Expr], value: &Expr) {
        // Function and class definitions print as their statement forms.
        if let [Expr::Name(target)] = targets {
            match value {
                Expr::Function(func) if !func.is_lambda() => {
                    self.write_function_def(func);
                    if *target != func.code.name {
                        let line = format!("{} = {}", target, func.code.name);
                        self.line(&line);
                    }
                    return;
                }
                Expr::Class { name, bases, keywords, body } => {
                    self.write_class_def(name, bases, keywords, body);
                    if target != name {
                        let line = format!("{} = {}", target, name);
                        self.line(&line);
                    }
                    return;
                }
                _ => {}
            }
        }
        let mut line = String::new();
        for target in targets {
            line.push_str(&self.target_expr(target));
            line.push_str(" = ");
        }
        line.push_str(&self.expr(value, prec::OPEN));
        self.line(&line);
    }

    fn write_function_def(&mut self, func: &FunctionExpr) {
        let keyword = if func.code.flags.contains(CodeFlags::COROUTINE) {
            "async def"
        } else {
            "def"
        };
        let header = format!(
            "{} {}({}):",
            keyword,
            func.code.name,
            self.parameter_list(func)
        );
        self.line(&header);
        self.indent += 1;
        self.write_scope_body(&func.body);
        self.indent -= 1;
    }

    fn write_class_def(
        &mut self,
        name: &str,
        bases: &[Expr],
        keywords: &[(String, Expr)],
        body: &Block,
    ) {
        let mut heritage: Vec<String> =
            bases.iter().map(|b| self.expr(b, prec::TERNARY)).collect();
        for (key, value) in keywords {
            heritage.push(format!("{}={}", key, self.expr(value, prec::TERNARY)));
        }
        let header = if heritage.is_empty() {
            format!("class {}:", name)
        } else {
            format!("class {}({}):", name, heritage.join(", "))
        };
        self.line(&header);
        self.write_body(body);
    }

    /// Parameter list with positional-only and keyword-only markers,
    /// defaults, annotations, and star arguments.
    fn parameter_list(&mut self, func: &FunctionExpr) -> String {
        let code = &func.code;
        let argcount = code.argcount as usize;
        let posonly = code.posonlyargcount as usize;
        let kwonly = code.kwonlyargcount as usize;
        let annotation = |printer: &mut Self, name: &str| -> String {
            func.annotations
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, ann)| format!(": {}", printer.expr(ann, prec::TERNARY)))
                .unwrap_or_default()
        };

        let mut params = Vec::new();
        let default_base = argcount.saturating_sub(func.defaults.len());
        for (index, name) in code.varnames.iter().take(argcount).enumerate() {
            let mut param = format!("{}{}", name, annotation(self, name));
            if index >= default_base {
                let default = &func.defaults[index - default_base];
                param.push_str(&format!("={}", self.expr(default, prec::TERNARY)));
            }
            params.push(param);
            if posonly > 0 && index + 1 == posonly {
                params.push("/".to_string());
            }
        }

        let mut star_index = argcount + kwonly;
        if code.flags.contains(CodeFlags::VARARGS) {
            let name = code
                .varnames
                .get(star_index)
                .map(String::as_str)
                .unwrap_or("args");
            params.push(format!("*{}", name));
            star_index += 1;
        } else if kwonly > 0 {
            params.push("*".to_string());
        }

        for name in code.varnames.iter().skip(argcount).take(kwonly) {
            let mut param = format!("{}{}", name, annotation(self, name));
            if let Some((_, default)) = func.kw_defaults.iter().find(|(n, _)| n == name) {
                param.push_str(&format!("={}", self.expr(default, prec::TERNARY)));
            }
            params.push(param);
        }

        if code.flags.contains(CodeFlags::VARKEYWORDS) {
            let name = code
                .varnames
                .get(star_index)
                .map(String::as_str)
                .unwrap_or("kwargs");
            params.push(format!("**{}", name));
        }

        params.join(", ")
    }

    fn write_block(&mut self, block: &Block) {
        match &block.kind {
            BlockKind::If { cond } | BlockKind::Elif { cond } => {
                let keyword = if matches!(block.kind, BlockKind::Elif { .. }) {
                    "elif"
                } else {
                    "if"
                };
                let header = format!("{} {}:", keyword, self.expr(cond, prec::OPEN));
                self.line(&header);
                self.write_body(block);
            }
            BlockKind::Else => self.write_else(block),
            BlockKind::Try => {
                self.line("try:");
                self.write_body(block);
            }
            BlockKind::Except { exc_type, binding } => {
                let header = match (exc_type, binding) {
                    (None, _) => "except:".to_string(),
                    (Some(exc), None) => format!("except {}:", self.expr(exc, prec::TERNARY)),
                    (Some(exc), Some(binding)) => {
                        let bind = self.expr(binding, prec::TERNARY);
                        if self.version.is_py3() {
                            format!("except {} as {}:", self.expr(exc, prec::TERNARY), bind)
                        } else {
                            format!("except {}, {}:", self.expr(exc, prec::TERNARY), bind)
                        }
                    }
                };
                self.line(&header);
                self.write_body(block);
            }
            BlockKind::Finally => {
                self.line("finally:");
                self.write_body(block);
            }
            BlockKind::While { cond } => {
                let header = match cond {
                    Some(cond) => format!("while {}:", self.expr(cond, prec::OPEN)),
                    None => "while True:".to_string(),
                };
                self.line(&header);
                self.write_body(block);
            }
            BlockKind::For { iter, target, is_async } => {
                let keyword = if *is_async { "async for" } else { "for" };
                let target = target
                    .as_ref()
                    .map(|t| self.target_expr(t))
                    .unwrap_or_else(|| "_".to_string());
                let header =
                    format!("{} {} in {}:", keyword, target, self.expr(iter, prec::OPEN));
                self.line(&header);
                self.write_body(block);
            }
            BlockKind::With { ctx, binding } => {
                let header = match binding {
                    Some(binding) => format!(
                        "with {} as {}:",
                        self.expr(ctx, prec::OPEN),
                        self.target_expr(binding)
                    ),
                    None => format!("with {}:", self.expr(ctx, prec::OPEN)),
                };
                self.line(&header);
                self.write_body(block);
            }
            // Structural kinds that normally never survive to printing.
            BlockKind::Main
            | BlockKind::Function
            | BlockKind::Class
            | BlockKind::Container
            | BlockKind::Comprehension => {
                self.write_scope_body(block);
            }
        }
    }

    /// `else:` collapses onto a sole nested if as `elif`.
    fn write_else(&mut self, block: &Block) {
        match block.body.as_slice() {
            [Stmt::Block(inner)] if matches!(inner.kind, BlockKind::If { .. }) => {
                let BlockKind::If { cond } = &inner.kind else {
                    unreachable!("matched above");
                };
                let header = format!("elif {}:", self.expr(cond, prec::OPEN));
                self.line(&header);
                self.write_body(inner);
            }
            [Stmt::Block(inner), Stmt::Block(tail)]
                if matches!(inner.kind, BlockKind::If { .. })
                    && matches!(tail.kind, BlockKind::Else) =>
            {
                let BlockKind::If { cond } = &inner.kind else {
                    unreachable!("matched above");
                };
                let header = format!("elif {}:", self.expr(cond, prec::OPEN));
                self.line(&header);
                self.write_body(inner);
                self.write_else(tail);
            }
            _ => {
                self.line("else:");
                self.write_body(block);
            }
        }
    }

    /// Assignment targets print tuples without parentheses.
    fn target_expr(&mut self, target: &Expr) -> String {
        match target {
            Expr::Tuple(items) if !items.is_empty() => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.expr(i, prec::TERNARY)).collect();
                parts.join(", ")
            }
            other => self.expr(other, prec::OPEN),
        }
    }

    // === Expressions ===

    fn expr(&mut self, expr: &Expr, ctx: u8) -> String {
        let (text, own) = self.expr_prec(expr);
        if own < ctx {
            format!("({})", text)
        } else {
            text
        }
    }

    fn expr_prec(&mut self, expr: &Expr) -> (String, u8) {
        match expr {
            Expr::Const(object) => (self.object_literal(object), prec::ATOM),
            Expr::Name(name) => (name.clone(), prec::ATOM),
            Expr::BuildClass => ("__build_class__".to_string(), prec::ATOM),
            Expr::Null => ("None".to_string(), prec::ATOM),
            Expr::ImportRef { module } => (module.clone(), prec::ATOM),
            Expr::ChainStore { value, .. } => self.expr_prec(value),

            Expr::Tuple(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.expr(i, prec::TERNARY)).collect();
                let text = match parts.len() {
                    0 => "()".to_string(),
                    1 => format!("({},)", parts[0]),
                    _ => format!("({})", parts.join(", ")),
                };
                (text, prec::ATOM)
            }
            Expr::List(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.expr(i, prec::TERNARY)).collect();
                (format!("[{}]", parts.join(", ")), prec::ATOM)
            }
            Expr::Set(items) => {
                if items.is_empty() {
                    ("set()".to_string(), prec::ATOM)
                } else {
                    let parts: Vec<String> =
                        items.iter().map(|i| self.expr(i, prec::TERNARY)).collect();
                    (format!("{{{}}}", parts.join(", ")), prec::ATOM)
                }
            }
            Expr::Map(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(key, value)| match key {
                        Expr::DoubleStarred(inner) => {
                            format!("**{}", self.expr(inner, prec::TERNARY))
                        }
                        key => format!(
                            "{}: {}",
                            self.expr(key, prec::TERNARY),
                            self.expr(value, prec::TERNARY)
                        ),
                    })
                    .collect();
                (format!("{{{}}}", parts.join(", ")), prec::ATOM)
            }
            Expr::ConstMap { keys, values } => {
                let parts: Vec<String> = keys
                    .iter()
                    .zip(values)
                    .map(|(key, value)| {
                        format!(
                            "{}: {}",
                            self.object_literal(key),
                            self.expr(value, prec::TERNARY)
                        )
                    })
                    .collect();
                (format!("{{{}}}", parts.join(", ")), prec::ATOM)
            }
            Expr::Slice { lower, upper, step } => {
                let mut text = String::new();
                if let Some(lower) = lower {
                    text.push_str(&self.expr(lower, prec::TERNARY));
                }
                text.push(':');
                if let Some(upper) = upper {
                    text.push_str(&self.expr(upper, prec::TERNARY));
                }
                if let Some(step) = step {
                    text.push(':');
                    text.push_str(&self.expr(step, prec::TERNARY));
                }
                (text, prec::OPEN)
            }
            Expr::Starred(inner) => {
                (format!("*{}", self.expr(inner, prec::UNARY)), prec::TERNARY)
            }
            Expr::DoubleStarred(inner) => {
                (format!("**{}", self.expr(inner, prec::UNARY)), prec::TERNARY)
            }

            Expr::Binary { op, left, right, .. } => {
                let own = binary_prec(*op);
                // Power is right-associative; everything else leans left.
                let (left_ctx, right_ctx) = if *op == BinaryOp::Pow {
                    (own + 1, own)
                } else {
                    (own, own + 1)
                };
                let text = format!(
                    "{} {} {}",
                    self.expr(left, left_ctx),
                    op.symbol(),
                    self.expr(right, right_ctx)
                );
                (text, own)
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => (
                    format!("not {}", self.expr(operand, prec::NOT)),
                    prec::NOT,
                ),
                UnaryOp::Repr => (
                    format!("`{}`", self.expr(operand, prec::OPEN)),
                    prec::ATOM,
                ),
                op => {
                    let symbol = match op {
                        UnaryOp::Neg => "-",
                        UnaryOp::Pos => "+",
                        _ => "~",
                    };
                    (
                        format!("{}{}", symbol, self.expr(operand, prec::UNARY)),
                        prec::UNARY,
                    )
                }
            },
            Expr::BoolChain { op, values } => {
                let (joiner, own) = match op {
                    BoolOp::And => (" and ", prec::AND),
                    BoolOp::Or => (" or ", prec::OR),
                };
                let parts: Vec<String> =
                    values.iter().map(|v| self.expr(v, own + 1)).collect();
                (parts.join(joiner), own)
            }
            Expr::Compare { first, rest } => {
                let mut text = self.expr(first, prec::COMPARE + 1);
                for (op, operand) in rest {
                    text.push_str(&format!(
                        " {} {}",
                        op.symbol(),
                        self.expr(operand, prec::COMPARE + 1)
                    ));
                }
                (text, prec::COMPARE)
            }
            Expr::Subscript { value, index } => {
                let text = format!(
                    "{}[{}]",
                    self.expr(value, prec::POSTFIX),
                    self.expr(index, prec::OPEN)
                );
                (text, prec::POSTFIX)
            }
            Expr::Attribute { value, attr } => {
                let base = match &**value {
                    // Integer literals need parentheses before a dot.
                    Expr::Const(Object::Int(_)) | Expr::Const(Object::Float(_)) => {
                        format!("({})", self.expr(value, prec::OPEN))
                    }
                    _ => self.expr(value, prec::POSTFIX),
                };
                (format!("{}.{}", base, attr), prec::POSTFIX)
            }
            Expr::Ternary { cond, then, orelse } => {
                let text = format!(
                    "{} if {} else {}",
                    self.expr(then, prec::TERNARY + 1),
                    self.expr(cond, prec::TERNARY + 1),
                    self.expr(orelse, prec::TERNARY)
                );
                (text, prec::TERNARY)
            }
            Expr::Call { func, args, kwargs, star, dstar } => {
                let mut parts: Vec<String> =
                    args.iter().map(|a| self.expr(a, prec::TERNARY)).collect();
                if let Some(star) = star {
                    parts.push(format!("*{}", self.expr(star, prec::TERNARY)));
                }
                for (key, value) in kwargs {
                    parts.push(format!("{}={}", key, self.expr(value, prec::TERNARY)));
                }
                if let Some(dstar) = dstar {
                    parts.push(format!("**{}", self.expr(dstar, prec::TERNARY)));
                }
                let text = format!(
                    "{}({})",
                    self.expr(func, prec::POSTFIX),
                    parts.join(", ")
                );
                (text, prec::POSTFIX)
            }
            Expr::Function(func) => {
                if func.is_lambda() {
                    (self.lambda_text(func), prec::OPEN)
                } else {
                    (func.code.name.clone(), prec::ATOM)
                }
            }
            Expr::Class { name, .. } => (name.clone(), prec::ATOM),
            Expr::Comprehension { kind, element, value, clauses } => {
                let mut text = match kind {
                    ComprehensionKind::Dict => format!(
                        "{}: {}",
                        self.expr(element, prec::TERNARY),
                        self.expr(
                            value.as_deref().unwrap_or(&Expr::Const(Object::None)),
                            prec::TERNARY
                        )
                    ),
                    _ => self.expr(element, prec::TERNARY),
                };
                for clause in clauses {
                    text.push_str(&format!(
                        " for {} in {}",
                        self.target_expr(&clause.target),
                        self.expr(&clause.iter, prec::TERNARY + 1)
                    ));
                    for cond in &clause.conds {
                        text.push_str(&format!(" if {}", self.expr(cond, prec::TERNARY + 1)));
                    }
                }
                let text = match kind {
                    ComprehensionKind::List => format!("[{}]", text),
                    ComprehensionKind::Set | ComprehensionKind::Dict => format!("{{{}}}", text),
                    ComprehensionKind::Generator => format!("({})", text),
                };
                (text, prec::ATOM)
            }
            Expr::FormattedValue { .. } | Expr::JoinedStr(_) => {
                (self.fstring_text(expr), prec::ATOM)
            }
            Expr::Yield(value) => {
                let text = match value {
                    Some(value) => format!("yield {}", self.expr(value, prec::TERNARY)),
                    None => "yield".to_string(),
                };
                (text, prec::OPEN)
            }
            Expr::YieldFrom(value) => (
                format!("yield from {}", self.expr(value, prec::TERNARY)),
                prec::OPEN,
            ),
            Expr::Await(value) => (
                format!("await {}", self.expr(value, prec::AWAIT)),
                prec::AWAIT,
            ),
        }
    }

    fn lambda_text(&mut self, func: &FunctionExpr) -> String {
        let params = self.parameter_list(func);
        let body = func
            .body
            .body
            .iter()
            .rev()
            .find_map(|stmt| match stmt {
                Stmt::Return(Some(value)) => Some(self.expr(value, prec::TERNARY)),
                Stmt::Return(None) => Some("None".to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "None".to_string());
        if params.is_empty() {
            format!("lambda: {}", body)
        } else {
            format!("lambda {}: {}", params, body)
        }
    }

    /// f-string rendering; literal parts get their braces doubled.
    fn fstring_text(&mut self, expr: &Expr) -> String {
        let mut body = String::new();
        let parts: &[Expr] = match expr {
            Expr::JoinedStr(parts) => parts,
            single => std::slice::from_ref(single),
        };
        for part in parts {
            match part {
                Expr::Const(Object::Str(text)) => {
                    body.push_str(&text.replace('{', "{{").replace('}', "}}"));
                }
                Expr::FormattedValue { value, conversion, format_spec } => {
                    body.push('{');
                    body.push_str(&self.expr(value, prec::TERNARY));
                    if let Some(conversion) = conversion {
                        body.push('!');
                        body.push(*conversion);
                    }
                    if let Some(spec) = format_spec {
                        body.push(':');
                        body.push_str(&self.format_spec_text(spec));
                    }
                    body.push('}');
                }
                other => {
                    body.push('{');
                    body.push_str(&self.expr(other, prec::TERNARY));
                    body.push('}');
                }
            }
        }
        format!("f'{}'", escape_str(&body, '\'', false))
    }

    fn format_spec_text(&mut self, spec: &Expr) -> String {
        match spec {
            Expr::Const(Object::Str(text)) => text.clone(),
            Expr::JoinedStr(parts) => parts
                .iter()
                .map(|part| match part {
                    Expr::Const(Object::Str(text)) => text.clone(),
                    other => format!("{{{}}}", self.expr(other, prec::TERNARY)),
                })
                .collect(),
            other => format!("{{{}}}", self.expr(other, prec::TERNARY)),
        }
    }

    // === Constants ===

    fn object_literal(&mut self, object: &Object) -> String {
        match object {
            Object::None => "None".to_string(),
            Object::Ellipsis => "...".to_string(),
            Object::StopIteration => "StopIteration".to_string(),
            Object::Bool(true) => "True".to_string(),
            Object::Bool(false) => "False".to_string(),
            Object::Int(n) => n.to_string(),
            Object::Long { .. } => self.long_literal(object),
            Object::Float(f) => float_literal(*f),
            Object::Complex(real, imag) => {
                if *real == 0.0 {
                    format!("{}j", float_trim(*imag))
                } else {
                    format!("({}+{}j)", float_trim(*real), float_trim(*imag))
                }
            }
            Object::Str(s) => format!("'{}'", escape_str(s, '\'', false)),
            Object::Bytes(bytes) => {
                if self.version.is_py3() {
                    format!("b'{}'", escape_bytes(bytes))
                } else {
                    format!("'{}'", escape_bytes(bytes))
                }
            }
            Object::Tuple(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.object_literal(i)).collect();
                match parts.len() {
                    0 => "()".to_string(),
                    1 => format!("({},)", parts[0]),
                    _ => format!("({})", parts.join(", ")),
                }
            }
            Object::List(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.object_literal(i)).collect();
                format!("[{}]", parts.join(", "))
            }
            Object::Dict(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| {
                        format!("{}: {}", self.object_literal(k), self.object_literal(v))
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Object::Set(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.object_literal(i)).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Object::FrozenSet(items) => {
                let parts: Vec<String> =
                    items.iter().map(|i| self.object_literal(i)).collect();
                format!("frozenset({{{}}})", parts.join(", "))
            }
            Object::Code(code) => format!("<code object {}>", code.name),
        }
    }

    fn long_literal(&mut self, object: &Object) -> String {
        let suffix = if self.version.is_py3() { "" } else { "L" };
        if let Some(value) = object.long_value() {
            return format!("{}{}", value, suffix);
        }
        // Too wide for i128: print the digits as a hex literal.
        if let Object::Long { negative, digits } = object {
            let mut text = String::new();
            if *negative {
                text.push('-');
            }
            text.push_str("0x");
            for digit in digits.iter().rev() {
                text.push_str(&format!("{:04x}", digit));
            }
            text.push_str(suffix);
            return text;
        }
        unreachable!("long_literal only called for longs")
    }
}

fn float_literal(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "1e999".to_string() } else { "-1e999".to_string() };
    }
    if f.is_nan() {
        return "float('nan')".to_string();
    }
    let text = format!("{:?}", f);
    text
}

fn float_trim(f: f64) -> String {
    let text = float_literal(f);
    text.strip_suffix(".0").map(str::to_string).unwrap_or(text)
}

fn escape_str(s: &str, quote: char, raw: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' if !raw => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            b => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

fn docstring_literal(doc: &str) -> String {
    if doc.contains('\n') || doc.contains('\'') {
        format!("'''{}'''", doc.replace("'''", "\\'\\'\\'"))
    } else {
        format!("'{}'", escape_str(doc, '\'', false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CmpOp;

    fn plain(version: PythonVersion) -> Printer {
        Printer::new(version)
    }

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    #[test]
    fn test_binary_precedence() {
        let mut p = plain(PythonVersion::new(3, 8));
        // (a + b) * c keeps its parentheses
        let expr = Expr::Binary {
            op: BinaryOp::Mul,
            left: Box::new(Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(name("a")),
                right: Box::new(name("b")),
                inplace: false,
            }),
            right: Box::new(name("c")),
            inplace: false,
        };
        assert_eq!(p.expr(&expr, prec::OPEN), "(a + b) * c");

        // a + b * c does not
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(name("a")),
            right: Box::new(Expr::Binary {
                op: BinaryOp::Mul,
                left: Box::new(name("b")),
                right: Box::new(name("c")),
                inplace: false,
            }),
            inplace: false,
        };
        assert_eq!(p.expr(&expr, prec::OPEN), "a + b * c");
    }

    #[test]
    fn test_compare_chain() {
        let mut p = plain(PythonVersion::new(3, 8));
        let expr = Expr::Compare {
            first: Box::new(name("a")),
            rest: vec![(CmpOp::Lt, name("b")), (CmpOp::Le, name("c"))],
        };
        assert_eq!(p.expr(&expr, prec::OPEN), "a < b <= c");
    }

    #[test]
    fn test_ternary() {
        let mut p = plain(PythonVersion::new(3, 8));
        let expr = Expr::Ternary {
            cond: Box::new(name("a")),
            then: Box::new(Expr::Const(Object::Int(1))),
            orelse: Box::new(Expr::Const(Object::Int(2))),
        };
        assert_eq!(p.expr(&expr, prec::OPEN), "1 if a else 2");
    }

    #[test]
    fn test_const_map() {
        let mut p = plain(PythonVersion::new(3, 8));
        let expr = Expr::ConstMap {
            keys: vec![Object::Str("x".into()), Object::Str("y".into())],
            values: vec![Expr::Const(Object::Int(1)), Expr::Const(Object::Int(2))],
        };
        assert_eq!(p.expr(&expr, prec::OPEN), "{'x': 1, 'y': 2}");
    }

    #[test]
    fn test_fstring() {
        let mut p = plain(PythonVersion::new(3, 8));
        let expr = Expr::JoinedStr(vec![
            Expr::Const(Object::Str("x = ".into())),
            Expr::FormattedValue {
                value: Box::new(name("x")),
                conversion: Some('r'),
                format_spec: None,
            },
        ]);
        assert_eq!(p.expr(&expr, prec::OPEN), "f'x = {x!r}'");
    }

    #[test]
    fn test_string_escapes() {
        let mut p = plain(PythonVersion::new(3, 8));
        let expr = Expr::Const(Object::Str("it's\n".into()));
        assert_eq!(p.expr(&expr, prec::OPEN), "'it\\'s\\n'");
    }

    #[test]
    fn test_tuple_renderings() {
        let mut p = plain(PythonVersion::new(3, 8));
        assert_eq!(p.expr(&Expr::Tuple(vec![]), prec::OPEN), "()");
        assert_eq!(
            p.expr(&Expr::Tuple(vec![Expr::Const(Object::Int(1))]), prec::OPEN),
            "(1,)"
        );
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(float_literal(2.0), "2.0");
        assert_eq!(float_literal(1.5), "1.5");
    }
}
