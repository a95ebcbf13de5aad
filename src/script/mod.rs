use std::collections::HashSet;

use rustpython_parser::{ast, parse, Mode};

use crate::{Error, Result};

/// Names the compiler knows how to satisfy by injecting capture code.
pub const REGISTERED_VARS: [&str; 5] = ["pid", "tid", "comm", "stack", "peek"];

/// A recorded `peek("<offsets>", "<cast>")` call from a callback script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekCall {
    pub offsets: String,
    pub cast: String,
}

/// What a callback script needs injected: magic variables in first-use
/// order, and peek calls in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Introspection {
    pub vars: Vec<String>,
    pub peeks: Vec<PeekCall>,
}

/// Discover the injectable variables a callback script references.
///
/// The script is parsed as a Python module and walked in evaluation
/// order. A name is free when it is loaded before any binding and is not
/// a builtin; free names must be either already `known` (bound by the
/// probe's define clause) or registered magics; anything else fails.
/// Function and lambda bodies are not walked: they only run when called,
/// at which point the generated callback has bound every magic already.
pub fn introspect(script: &str, known: &HashSet<String>) -> Result<Introspection> {
    let module = parse(script, Mode::Module, "<trace>")
        .map_err(|e| Error::InvalidScript(e.to_string()))?;
    let ast::Mod::Module(module) = module else {
        return Err(Error::InvalidScript("not a module".to_string()));
    };

    let mut walker = Walker {
        bound: HashSet::new(),
        known,
        seen: HashSet::new(),
        result: Introspection::default(),
    };
    for stmt in &module.body {
        walker.stmt(stmt)?;
    }
    Ok(walker.result)
}

struct Walker<'a> {
    bound: HashSet<String>,
    known: &'a HashSet<String>,
    seen: HashSet<String>,
    result: Introspection,
}

impl Walker<'_> {
    fn load_name(&mut self, name: &str) -> Result<()> {
        if self.bound.contains(name) || self.known.contains(name) || is_builtin(name) {
            return Ok(());
        }
        if name == "peek" {
            // Bare references to the peek helper are satisfied without
            // recording a capture; calls are handled in expr().
            return Ok(());
        }
        if REGISTERED_VARS.contains(&name) {
            if self.seen.insert(name.to_string()) {
                self.result.vars.push(name.to_string());
            }
            return Ok(());
        }
        Err(Error::InvalidVar(name.to_string()))
    }

    fn bind_target(&mut self, target: &ast::Expr) -> Result<()> {
        match target {
            ast::Expr::Name(name) => {
                self.bound.insert(name.id.as_str().to_string());
                Ok(())
            }
            ast::Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.bind_target(elt)?;
                }
                Ok(())
            }
            ast::Expr::List(list) => {
                for elt in &list.elts {
                    self.bind_target(elt)?;
                }
                Ok(())
            }
            ast::Expr::Starred(starred) => self.bind_target(&starred.value),
            // Attribute / subscript targets evaluate their base expression.
            other => self.expr(other),
        }
    }

    fn stmts(&mut self, stmts: &[ast::Stmt]) -> Result<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &ast::Stmt) -> Result<()> {
        match stmt {
            ast::Stmt::Expr(s) => self.expr(&s.value),
            ast::Stmt::Assign(s) => {
                self.expr(&s.value)?;
                for target in &s.targets {
                    self.bind_target(target)?;
                }
                Ok(())
            }
            ast::Stmt::AugAssign(s) => {
                self.expr(&s.value)?;
                // An augmented assignment loads its target before storing.
                if let ast::Expr::Name(name) = s.target.as_ref() {
                    self.load_name(name.id.as_str())?;
                }
                self.bind_target(&s.target)
            }
            ast::Stmt::AnnAssign(s) => {
                if let Some(value) = &s.value {
                    self.expr(value)?;
                }
                self.bind_target(&s.target)
            }
            ast::Stmt::If(s) => {
                self.expr(&s.test)?;
                self.stmts(&s.body)?;
                self.stmts(&s.orelse)
            }
            ast::Stmt::While(s) => {
                self.expr(&s.test)?;
                self.stmts(&s.body)?;
                self.stmts(&s.orelse)
            }
            ast::Stmt::For(s) => {
                self.expr(&s.iter)?;
                self.bind_target(&s.target)?;
                self.stmts(&s.body)?;
                self.stmts(&s.orelse)
            }
            ast::Stmt::FunctionDef(s) => {
                self.bound.insert(s.name.as_str().to_string());
                Ok(())
            }
            ast::Stmt::AsyncFunctionDef(s) => {
                self.bound.insert(s.name.as_str().to_string());
                Ok(())
            }
            ast::Stmt::Return(s) => match &s.value {
                Some(value) => self.expr(value),
                None => Ok(()),
            },
            ast::Stmt::Assert(s) => {
                self.expr(&s.test)?;
                match &s.msg {
                    Some(msg) => self.expr(msg),
                    None => Ok(()),
                }
            }
            ast::Stmt::Import(s) => {
                for alias in &s.names {
                    let binding = match &alias.asname {
                        Some(asname) => asname.as_str().to_string(),
                        None => alias
                            .name
                            .as_str()
                            .split('.')
                            .next()
                            .unwrap_or_default()
                            .to_string(),
                    };
                    self.bound.insert(binding);
                }
                Ok(())
            }
            ast::Stmt::ImportFrom(s) => {
                for alias in &s.names {
                    let binding = match &alias.asname {
                        Some(asname) => asname.as_str().to_string(),
                        None => alias.name.as_str().to_string(),
                    };
                    self.bound.insert(binding);
                }
                Ok(())
            }
            ast::Stmt::With(s) => {
                for item in &s.items {
                    self.expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.bind_target(vars)?;
                    }
                }
                self.stmts(&s.body)
            }
            ast::Stmt::Try(s) => {
                self.stmts(&s.body)?;
                for handler in &s.handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    if let Some(type_) = &handler.type_ {
                        self.expr(type_)?;
                    }
                    if let Some(name) = &handler.name {
                        self.bound.insert(name.as_str().to_string());
                    }
                    self.stmts(&handler.body)?;
                }
                self.stmts(&s.orelse)?;
                self.stmts(&s.finalbody)
            }
            ast::Stmt::Raise(s) => {
                for exc in [&s.exc, &s.cause].into_iter().flatten() {
                    self.expr(exc)?;
                }
                Ok(())
            }
            ast::Stmt::Delete(s) => {
                for target in &s.targets {
                    if !matches!(target, ast::Expr::Name(_)) {
                        self.expr(target)?;
                    }
                }
                Ok(())
            }
            ast::Stmt::Global(s) => {
                for name in &s.names {
                    self.bound.insert(name.as_str().to_string());
                }
                Ok(())
            }
            ast::Stmt::Nonlocal(s) => {
                for name in &s.names {
                    self.bound.insert(name.as_str().to_string());
                }
                Ok(())
            }
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => Ok(()),
            _ => Err(Error::InvalidScript(
                "unsupported statement in callback script".to_string(),
            )),
        }
    }

    fn expr(&mut self, expr: &ast::Expr) -> Result<()> {
        match expr {
            ast::Expr::Name(name) => match name.ctx {
                ast::ExprContext::Load => self.load_name(name.id.as_str()),
                _ => Ok(()),
            },
            ast::Expr::Call(call) => self.call(call),
            ast::Expr::Constant(_) => Ok(()),
            ast::Expr::BinOp(e) => {
                self.expr(&e.left)?;
                self.expr(&e.right)
            }
            ast::Expr::UnaryOp(e) => self.expr(&e.operand),
            ast::Expr::BoolOp(e) => {
                for value in &e.values {
                    self.expr(value)?;
                }
                Ok(())
            }
            ast::Expr::Compare(e) => {
                self.expr(&e.left)?;
                for comparator in &e.comparators {
                    self.expr(comparator)?;
                }
                Ok(())
            }
            ast::Expr::IfExp(e) => {
                self.expr(&e.test)?;
                self.expr(&e.body)?;
                self.expr(&e.orelse)
            }
            ast::Expr::NamedExpr(e) => {
                self.expr(&e.value)?;
                self.bind_target(&e.target)
            }
            ast::Expr::Attribute(e) => self.expr(&e.value),
            ast::Expr::Subscript(e) => {
                self.expr(&e.value)?;
                self.expr(&e.slice)
            }
            ast::Expr::Slice(e) => {
                for bound in [&e.lower, &e.upper, &e.step].into_iter().flatten() {
                    self.expr(bound)?;
                }
                Ok(())
            }
            ast::Expr::Starred(e) => self.expr(&e.value),
            ast::Expr::Tuple(e) => {
                for elt in &e.elts {
                    self.expr(elt)?;
                }
                Ok(())
            }
            ast::Expr::List(e) => {
                for elt in &e.elts {
                    self.expr(elt)?;
                }
                Ok(())
            }
            ast::Expr::Set(e) => {
                for elt in &e.elts {
                    self.expr(elt)?;
                }
                Ok(())
            }
            ast::Expr::Dict(e) => {
                for key in e.keys.iter().flatten() {
                    self.expr(key)?;
                }
                for value in &e.values {
                    self.expr(value)?;
                }
                Ok(())
            }
            ast::Expr::JoinedStr(e) => {
                for value in &e.values {
                    self.expr(value)?;
                }
                Ok(())
            }
            ast::Expr::FormattedValue(e) => self.expr(&e.value),
            // Lambda bodies only run when called, like function defs.
            ast::Expr::Lambda(_) => Ok(()),
            ast::Expr::ListComp(e) => self.comprehension(&e.elt, None, &e.generators),
            ast::Expr::SetComp(e) => self.comprehension(&e.elt, None, &e.generators),
            ast::Expr::GeneratorExp(e) => self.comprehension(&e.elt, None, &e.generators),
            ast::Expr::DictComp(e) => {
                self.comprehension(&e.key, Some(&e.value), &e.generators)
            }
            _ => Err(Error::InvalidScript(
                "unsupported expression in callback script".to_string(),
            )),
        }
    }

    fn comprehension(
        &mut self,
        elt: &ast::Expr,
        value: Option<&ast::Expr>,
        generators: &[ast::Comprehension],
    ) -> Result<()> {
        for generator in generators {
            self.expr(&generator.iter)?;
            self.bind_target(&generator.target)?;
            for cond in &generator.ifs {
                self.expr(cond)?;
            }
        }
        self.expr(elt)?;
        if let Some(value) = value {
            self.expr(value)?;
        }
        Ok(())
    }

    fn call(&mut self, call: &ast::ExprCall) -> Result<()> {
        if let ast::Expr::Name(name) = call.func.as_ref() {
            let callee = name.id.as_str();
            if callee == "peek" && !self.bound.contains(callee) && !self.known.contains(callee)
            {
                return self.record_peek(call);
            }
        }
        self.expr(&call.func)?;
        for arg in &call.args {
            self.expr(arg)?;
        }
        for keyword in &call.keywords {
            self.expr(&keyword.value)?;
        }
        Ok(())
    }

    /// `peek(offsets, type)` takes exactly two string literals; the pair is
    /// recorded in call order and becomes a capture define.
    fn record_peek(&mut self, call: &ast::ExprCall) -> Result<()> {
        let literal = |expr: &ast::Expr| -> Option<String> {
            match expr {
                ast::Expr::Constant(c) => match &c.value {
                    ast::Constant::Str(s) => Some(s.clone()),
                    _ => None,
                },
                _ => None,
            }
        };
        if call.args.len() != 2 || !call.keywords.is_empty() {
            return Err(Error::InvalidPeek(
                "peek() takes exactly two string literals".to_string(),
            ));
        }
        let (Some(offsets), Some(cast)) = (literal(&call.args[0]), literal(&call.args[1]))
        else {
            return Err(Error::InvalidPeek(
                "peek() arguments must be string literals".to_string(),
            ));
        };
        self.result.peeks.push(PeekCall { offsets, cast });
        Ok(())
    }
}

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "print"
            | "len"
            | "int"
            | "str"
            | "float"
            | "bool"
            | "bytes"
            | "hex"
            | "oct"
            | "bin"
            | "abs"
            | "min"
            | "max"
            | "sum"
            | "range"
            | "enumerate"
            | "zip"
            | "map"
            | "filter"
            | "sorted"
            | "reversed"
            | "list"
            | "dict"
            | "set"
            | "tuple"
            | "repr"
            | "format"
            | "round"
            | "any"
            | "all"
            | "isinstance"
            | "type"
            | "getattr"
            | "setattr"
            | "hasattr"
            | "ord"
            | "chr"
            | "divmod"
            | "pow"
            | "open"
            | "Exception"
            | "ValueError"
            | "KeyError"
    )
}
