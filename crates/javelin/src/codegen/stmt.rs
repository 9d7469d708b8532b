//! Statement lowering.

use ruff_python_ast::{self as ast, Expr, Stmt};

use crate::classfile::{ExceptionRange, Op};
use crate::error::CompileError;
use crate::runtime;
use crate::scope::ScopeKind;

use super::{Cleanup, FunctionCompiler, Gen, LoopInfo, ScopeAst, compile_method};

impl<'ast> FunctionCompiler<'ast> {
    pub fn compile_stmts(&mut self, g: &mut Gen, stmts: &'ast [Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.compile_stmt(g, stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, g: &mut Gen, stmt: &'ast Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::FunctionDef(def) => {
                self.mark_line(g, def)?;
                for decorator in &def.decorator_list {
                    self.compile_expr(g, &decorator.expression)?;
                }
                self.emit_make_function(
                    g,
                    Some(&def.parameters),
                    def.returns.as_deref(),
                    ScopeAst::Body(&def.body),
                )?;
                for _ in &def.decorator_list {
                    self.invoke(g, &runtime::CALL1)?;
                }
                self.store_name(g, def.name.as_str())
            }
            Stmt::ClassDef(def) => {
                self.mark_line(g, def)?;
                if let Some(arguments) = &def.arguments
                    && !arguments.keywords.is_empty()
                {
                    return Err(self.unsupported(g, "keyword arguments in class definitions", def));
                }
                for decorator in &def.decorator_list {
                    self.compile_expr(g, &decorator.expression)?;
                }
                self.load_java_string(g, def.name.as_str())?;
                match &def.arguments {
                    Some(arguments) => self.emit_value_array(g, &arguments.args)?,
                    None => self.emit_value_array(g, &[])?,
                }
                let child = self.take_child(g);
                compile_method(g, child, ScopeAst::Body(&def.body))?;
                let field = {
                    let class_name = g.class_name();
                    g.class
                        .pool()
                        .fieldref(&class_name, &super::code_field(child), runtime::CODE_DESC)?
                };
                self.code.emit_getstatic(field);
                self.emit_closure_array(g, child)?;
                self.code.emit_aload(0)?;
                self.invoke(g, &runtime::MAKE_CLASS)?;
                for _ in &def.decorator_list {
                    self.invoke(g, &runtime::CALL1)?;
                }
                self.store_name(g, def.name.as_str())
            }
            Stmt::Return(ret) => {
                self.mark_line(g, ret)?;
                if !self.scope(g).kind.is_function_like() {
                    return Err(self.syntax_err(g, "'return' outside function", ret));
                }
                match &ret.value {
                    Some(value) => self.compile_expr(g, value)?,
                    None => self.emit_none(g)?,
                }
                let slot = self.code.acquire_temp();
                self.code.emit_astore(slot)?;
                self.run_cleanups(g, 0)?;
                if self.scope(g).is_generator {
                    self.code.emit_aload(0)?;
                    self.code.emit_iconst(-1)?;
                    self.invoke(g, &runtime::SET_RESUME_POINT)?;
                }
                self.code.emit_aload(slot)?;
                self.code.emit_areturn();
                self.code.free_temp(slot);
                Ok(())
            }
            Stmt::Delete(del) => {
                self.mark_line(g, del)?;
                for target in &del.targets {
                    self.compile_delete_target(g, target)?;
                }
                Ok(())
            }
            Stmt::Assign(assign) => {
                self.mark_line(g, assign)?;
                self.compile_expr(g, &assign.value)?;
                let last = assign.targets.len() - 1;
                for (i, target) in assign.targets.iter().enumerate() {
                    if i < last {
                        self.code.emit(Op::Dup);
                    }
                    self.store_target(g, target)?;
                }
                Ok(())
            }
            Stmt::AugAssign(aug) => self.compile_aug_assign(g, aug),
            Stmt::AnnAssign(ann) => {
                self.mark_line(g, ann)?;
                self.compile_expr(g, &ann.annotation)?;
                self.code.emit(Op::Pop);
                if let Some(value) = &ann.value {
                    self.compile_expr(g, value)?;
                    self.store_target(g, &ann.target)?;
                }
                Ok(())
            }
            Stmt::For(for_stmt) => self.compile_for(g, for_stmt),
            Stmt::While(while_stmt) => self.compile_while(g, while_stmt),
            Stmt::If(if_stmt) => self.compile_if(g, if_stmt),
            Stmt::With(with_stmt) => {
                self.mark_line(g, with_stmt)?;
                self.compile_with(g, &with_stmt.items, &with_stmt.body)
            }
            Stmt::Raise(raise) => {
                self.mark_line(g, raise)?;
                match (&raise.exc, &raise.cause) {
                    (None, _) => {
                        self.code.emit_aload(0)?;
                        self.invoke(g, &runtime::RERAISE)?;
                    }
                    (Some(exc), None) => {
                        self.compile_expr(g, exc)?;
                        self.invoke(g, &runtime::MAKE_EXCEPTION1)?;
                    }
                    (Some(exc), Some(cause)) => {
                        self.compile_expr(g, exc)?;
                        self.compile_expr(g, cause)?;
                        self.invoke(g, &runtime::MAKE_EXCEPTION2)?;
                    }
                }
                self.code.emit_athrow();
                Ok(())
            }
            Stmt::Try(try_stmt) => {
                self.mark_line(g, try_stmt)?;
                self.compile_try(g, try_stmt)
            }
            Stmt::Assert(assert) => {
                self.mark_line(g, assert)?;
                self.compile_expr(g, &assert.test)?;
                self.invoke(g, &runtime::IS_TRUE)?;
                let ok = self.code.new_label();
                self.code.emit_branch(Op::Ifne, ok)?;
                match &assert.msg {
                    Some(msg) => self.compile_expr(g, msg)?,
                    None => self.code.emit(Op::AconstNull),
                }
                self.invoke(g, &runtime::ASSERTION_ERROR)?;
                self.code.emit_athrow();
                self.code.bind(ok)?;
                self.code.set_stack_depth(0);
                Ok(())
            }
            Stmt::Import(import) => {
                self.mark_line(g, import)?;
                for alias in &import.names {
                    self.load_java_string(g, alias.name.as_str())?;
                    self.code.emit_iconst(0)?;
                    self.code.emit_aload(0)?;
                    match &alias.asname {
                        Some(asname) => {
                            self.invoke(g, &runtime::IMPORT_MODULE_AS)?;
                            self.store_name(g, asname.as_str())?;
                        }
                        None => {
                            self.invoke(g, &runtime::IMPORT_MODULE)?;
                            let top = alias.name.split('.').next().unwrap_or(alias.name.as_str());
                            self.store_name(g, top)?;
                        }
                    }
                }
                Ok(())
            }
            Stmt::ImportFrom(import) => {
                self.mark_line(g, import)?;
                let module = import.module.as_ref().map_or("", ast::Identifier::as_str);
                self.load_java_string(g, module)?;
                self.code.emit_iconst(import.level.min(i32::MAX as u32) as i32)?;
                self.code.emit_aload(0)?;
                self.invoke(g, &runtime::IMPORT_MODULE_AS)?;
                if import.names.len() == 1 && import.names[0].name.as_str() == "*" {
                    self.code.emit_aload(0)?;
                    self.invoke(g, &runtime::IMPORT_STAR)?;
                    return Ok(());
                }
                let slot = self.code.acquire_temp();
                self.code.emit_astore(slot)?;
                for alias in &import.names {
                    self.code.emit_aload(slot)?;
                    self.load_java_string(g, alias.name.as_str())?;
                    self.invoke(g, &runtime::IMPORT_FROM)?;
                    let bound = alias.asname.as_ref().map_or(alias.name.as_str(), ast::Identifier::as_str);
                    self.store_name(g, bound)?;
                }
                self.code.free_temp(slot);
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.mark_line(g, expr)?;
                self.compile_expr(g, &expr.value)?;
                if self.scope(g).kind == ScopeKind::Module && g.options.print_results {
                    self.invoke(g, &runtime::PRINT_RESULT)
                } else {
                    self.code.emit(Op::Pop);
                    Ok(())
                }
            }
            Stmt::Break(brk) => {
                self.mark_line(g, brk)?;
                let Some(info) = self.loops.last() else {
                    return Err(self.syntax_err(g, "'break' outside loop", brk));
                };
                let (label, depth) = (info.break_label, info.cleanup_depth);
                self.run_cleanups(g, depth)?;
                self.code.emit_goto(label)
            }
            Stmt::Continue(cont) => {
                self.mark_line(g, cont)?;
                let Some(info) = self.loops.last() else {
                    return Err(self.syntax_err(g, "'continue' not properly in loop", cont));
                };
                let (label, depth) = (info.continue_label, info.cleanup_depth);
                self.run_cleanups(g, depth)?;
                self.code.emit_goto(label)
            }
            Stmt::Global(_) | Stmt::Nonlocal(_) | Stmt::Pass(_) => Ok(()),
            // The resolver rejects these before code generation starts.
            Stmt::Match(m) => Err(self.unsupported(g, "match statements", m)),
            Stmt::TypeAlias(alias) => Err(self.unsupported(g, "type alias statements", alias)),
            Stmt::IpyEscapeCommand(cmd) => Err(self.syntax_err(g, "IPython escape commands are not valid Python", cmd)),
        }
    }

    /// Replays pending cleanups from the top of the stack down to
    /// `to_depth`, used by `return`, `break` and `continue`. Entries stay
    /// on the stack because the protected region continues afterwards;
    /// while one runs, deeper entries are hidden so a `return` inside an
    /// inlined `finally` cannot re-inline it.
    fn run_cleanups(&mut self, g: &mut Gen, to_depth: usize) -> Result<(), CompileError> {
        for i in (to_depth..self.cleanups.len()).rev() {
            let tail = self.cleanups.split_off(i);
            let entry = tail[0];
            match entry {
                Cleanup::Finally { body, range } => {
                    self.ranges[range].suspend(self.code.pos());
                    self.compile_stmts(g, body)?;
                    self.ranges[range].resume(self.code.pos());
                }
                Cleanup::WithExit { exit_index, range } => {
                    self.ranges[range].suspend(self.code.pos());
                    self.emit_with_exit(g, exit_index)?;
                    self.ranges[range].resume(self.code.pos());
                }
            }
            self.cleanups.extend(tail);
        }
        Ok(())
    }

    fn compile_if(&mut self, g: &mut Gen, if_stmt: &'ast ast::StmtIf) -> Result<(), CompileError> {
        self.mark_line(g, if_stmt)?;
        let end = self.code.new_label();
        let mut next = self.code.new_label();
        self.compile_expr(g, &if_stmt.test)?;
        self.invoke(g, &runtime::IS_TRUE)?;
        self.code.emit_branch(Op::Ifeq, next)?;
        self.compile_stmts(g, &if_stmt.body)?;
        self.code.emit_goto(end)?;
        for clause in &if_stmt.elif_else_clauses {
            self.code.bind(next)?;
            self.code.set_stack_depth(0);
            next = self.code.new_label();
            if let Some(test) = &clause.test {
                self.mark_line(g, clause)?;
                self.compile_expr(g, test)?;
                self.invoke(g, &runtime::IS_TRUE)?;
                self.code.emit_branch(Op::Ifeq, next)?;
            }
            self.compile_stmts(g, &clause.body)?;
            self.code.emit_goto(end)?;
        }
        self.code.bind(next)?;
        self.code.bind(end)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    fn compile_while(&mut self, g: &mut Gen, while_stmt: &'ast ast::StmtWhile) -> Result<(), CompileError> {
        self.mark_line(g, while_stmt)?;
        let continue_label = self.code.new_label();
        let break_label = self.code.new_label();
        let exhausted = self.code.new_label();
        self.code.bind(continue_label)?;
        self.compile_expr(g, &while_stmt.test)?;
        self.invoke(g, &runtime::IS_TRUE)?;
        self.code.emit_branch(Op::Ifeq, exhausted)?;
        self.loops.push(LoopInfo {
            continue_label,
            break_label,
            cleanup_depth: self.cleanups.len(),
        });
        self.compile_stmts(g, &while_stmt.body)?;
        self.loops.pop();
        self.code.emit_goto(continue_label)?;
        self.code.bind(exhausted)?;
        self.code.set_stack_depth(0);
        // The else clause runs on normal exhaustion; break jumps past it.
        self.compile_stmts(g, &while_stmt.orelse)?;
        self.code.bind(break_label)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    fn compile_for(&mut self, g: &mut Gen, for_stmt: &'ast ast::StmtFor) -> Result<(), CompileError> {
        if for_stmt.is_async {
            return Err(self.unsupported(g, "async for loops", for_stmt));
        }
        self.mark_line(g, for_stmt)?;
        self.compile_expr(g, &for_stmt.iter)?;
        self.invoke(g, &runtime::ITER)?;
        let iter_slot = self.code.acquire_temp();
        self.code.emit_astore(iter_slot)?;

        let continue_label = self.code.new_label();
        let break_label = self.code.new_label();
        let exhausted = self.code.new_label();
        self.code.bind(continue_label)?;
        self.code.set_stack_depth(0);
        self.code.emit_aload(iter_slot)?;
        self.invoke(g, &runtime::ITER_NEXT)?;
        self.code.emit(Op::Dup);
        self.code.emit_branch(Op::Ifnull, exhausted)?;
        self.store_target(g, &for_stmt.target)?;
        self.loops.push(LoopInfo {
            continue_label,
            break_label,
            cleanup_depth: self.cleanups.len(),
        });
        self.compile_stmts(g, &for_stmt.body)?;
        self.loops.pop();
        self.code.emit_goto(continue_label)?;
        self.code.bind(exhausted)?;
        self.code.set_stack_depth(1);
        self.code.emit(Op::Pop);
        self.code.free_temp(iter_slot);
        self.compile_stmts(g, &for_stmt.orelse)?;
        self.code.bind(break_label)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    fn compile_aug_assign(&mut self, g: &mut Gen, aug: &'ast ast::StmtAugAssign) -> Result<(), CompileError> {
        self.mark_line(g, aug)?;
        let op = runtime::inplace_op(aug.op);
        match aug.target.as_ref() {
            Expr::Name(name) => {
                self.load_name(g, name.id.as_str())?;
                self.compile_expr(g, &aug.value)?;
                self.invoke(g, &op)?;
                self.store_name(g, name.id.as_str())
            }
            Expr::Attribute(attr) => {
                self.compile_expr(g, &attr.value)?;
                self.code.emit(Op::Dup);
                self.load_java_string(g, attr.attr.as_str())?;
                self.invoke(g, &runtime::GETATTR)?;
                self.compile_expr(g, &aug.value)?;
                self.invoke(g, &op)?;
                self.load_java_string(g, attr.attr.as_str())?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SETATTR)
            }
            Expr::Subscript(sub) => {
                self.compile_expr(g, &sub.value)?;
                self.code.emit(Op::Dup);
                self.compile_subscript_key(g, &sub.slice)?;
                self.code.emit(Op::DupX1);
                self.invoke(g, &runtime::GETITEM)?;
                self.compile_expr(g, &aug.value)?;
                self.invoke(g, &op)?;
                self.invoke(g, &runtime::SETITEM)
            }
            other => Err(self.syntax_err(g, "illegal expression for augmented assignment", other)),
        }
    }

    /// Stores the value on top of the stack into an assignment target.
    pub fn store_target(&mut self, g: &mut Gen, target: &'ast Expr) -> Result<(), CompileError> {
        match target {
            Expr::Name(name) => self.store_name(g, name.id.as_str()),
            Expr::Attribute(attr) => {
                self.compile_expr(g, &attr.value)?;
                self.code.emit(Op::Swap);
                self.load_java_string(g, attr.attr.as_str())?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SETATTR)
            }
            Expr::Subscript(sub) => {
                self.compile_expr(g, &sub.value)?;
                self.code.emit(Op::Swap);
                self.compile_subscript_key(g, &sub.slice)?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SETITEM)
            }
            Expr::Tuple(tuple) => self.store_unpack(g, &tuple.elts, target),
            Expr::List(list) => self.store_unpack(g, &list.elts, target),
            Expr::Starred(starred) => {
                Err(self.syntax_err(g, "starred assignment target must be in a list or tuple", starred))
            }
            other => Err(self.syntax_err(g, "illegal assignment target", other)),
        }
    }

    fn store_unpack(&mut self, g: &mut Gen, elts: &'ast [Expr], target: &'ast Expr) -> Result<(), CompileError> {
        let star_pos = elts.iter().position(|e| matches!(e, Expr::Starred(_)));
        if let Some(p) = star_pos
            && elts.iter().skip(p + 1).any(|e| matches!(e, Expr::Starred(_)))
        {
            return Err(self.syntax_err(g, "multiple starred expressions in assignment", target));
        }
        match star_pos {
            None => {
                self.code.emit_iconst(elts.len() as i32)?;
                self.invoke(g, &runtime::UNPACK_SEQUENCE)?;
            }
            Some(p) => {
                self.code.emit_iconst(p as i32)?;
                self.code.emit_iconst((elts.len() - 1 - p) as i32)?;
                self.invoke(g, &runtime::UNPACK_STAR)?;
            }
        }
        let arr = self.code.acquire_temp();
        self.code.emit_astore(arr)?;
        for (i, elt) in elts.iter().enumerate() {
            self.code.emit_aload(arr)?;
            self.code.emit_iconst(i as i32)?;
            self.code.emit(Op::Aaload);
            match elt {
                Expr::Starred(starred) => self.store_target(g, &starred.value)?,
                other => self.store_target(g, other)?,
            }
        }
        self.code.free_temp(arr);
        Ok(())
    }

    fn compile_delete_target(&mut self, g: &mut Gen, target: &'ast Expr) -> Result<(), CompileError> {
        match target {
            Expr::Name(name) => self.delete_name(g, name.id.as_str()),
            Expr::Attribute(attr) => {
                self.compile_expr(g, &attr.value)?;
                self.load_java_string(g, attr.attr.as_str())?;
                self.invoke(g, &runtime::DELATTR)
            }
            Expr::Subscript(sub) => {
                self.compile_expr(g, &sub.value)?;
                self.compile_subscript_key(g, &sub.slice)?;
                self.invoke(g, &runtime::DELITEM)
            }
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.compile_delete_target(g, elt)?;
                }
                Ok(())
            }
            Expr::List(list) => {
                for elt in &list.elts {
                    self.compile_delete_target(g, elt)?;
                }
                Ok(())
            }
            other => Err(self.syntax_err(g, "cannot delete this expression", other)),
        }
    }

    fn compile_try(&mut self, g: &mut Gen, try_stmt: &'ast ast::StmtTry) -> Result<(), CompileError> {
        if try_stmt.is_star {
            return Err(self.unsupported(g, "'except*' handlers", try_stmt));
        }
        if try_stmt.finalbody.is_empty() {
            return self.compile_try_except(g, try_stmt);
        }

        let range = self.ranges.len();
        self.ranges.push(ExceptionRange::new());
        self.ranges[range].begin(self.code.pos());
        self.cleanups.push(Cleanup::Finally {
            body: &try_stmt.finalbody,
            range,
        });
        if try_stmt.handlers.is_empty() {
            self.compile_stmts(g, &try_stmt.body)?;
        } else {
            self.compile_try_except(g, try_stmt)?;
        }
        self.cleanups.pop();
        self.ranges[range].end(self.code.pos());

        // Normal completion runs the finally outside its own protection.
        self.compile_stmts(g, &try_stmt.finalbody)?;
        let done = self.code.new_label();
        self.code.emit_goto(done)?;

        let handler = self.code.new_label();
        self.code.bind(handler)?;
        self.code.set_stack_depth(1);
        let slot = self.code.acquire_pinned();
        self.throwable_slots.push(slot);
        self.code.emit_astore(slot)?;
        self.compile_stmts(g, &try_stmt.finalbody)?;
        self.code.emit_aload(slot)?;
        self.code.emit_athrow();
        self.throwable_slots.retain(|&s| s != slot);
        self.code.free_temp(slot);
        self.code.add_handler(&self.ranges[range], handler, 0);
        self.code.bind(done)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    fn compile_try_except(&mut self, g: &mut Gen, try_stmt: &'ast ast::StmtTry) -> Result<(), CompileError> {
        if try_stmt.handlers.is_empty() {
            return self.compile_stmts(g, &try_stmt.body);
        }
        let range = self.ranges.len();
        self.ranges.push(ExceptionRange::new());
        self.ranges[range].begin(self.code.pos());
        self.compile_stmts(g, &try_stmt.body)?;
        self.ranges[range].end(self.code.pos());
        // No exception: the else clause runs unprotected.
        self.compile_stmts(g, &try_stmt.orelse)?;
        let done = self.code.new_label();
        self.code.emit_goto(done)?;

        let handler = self.code.new_label();
        self.code.bind(handler)?;
        self.code.set_stack_depth(1);
        let raw_slot = self.code.acquire_pinned();
        self.throwable_slots.push(raw_slot);
        self.code.emit_astore(raw_slot)?;
        self.code.emit_aload(raw_slot)?;
        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::SET_EXCEPTION)?;
        let value_slot = self.code.acquire_pinned();
        self.code.emit_astore(value_slot)?;

        for (i, except) in try_stmt.handlers.iter().enumerate() {
            let ast::ExceptHandler::ExceptHandler(h) = except;
            if h.type_.is_none() && i + 1 != try_stmt.handlers.len() {
                return Err(self.syntax_err(g, "default 'except' must be last", h));
            }
            let next = self.code.new_label();
            if let Some(type_) = &h.type_ {
                self.code.emit_aload(value_slot)?;
                self.compile_expr(g, type_)?;
                self.invoke(g, &runtime::MATCH_EXCEPTION)?;
                self.code.emit_branch(Op::Ifeq, next)?;
            }
            if let Some(name) = &h.name {
                self.code.emit_aload(value_slot)?;
                self.store_name(g, name.as_str())?;
            }
            self.compile_stmts(g, &h.body)?;
            if let Some(name) = &h.name {
                // The handler binding does not survive the handler.
                self.delete_name(g, name.as_str())?;
            }
            self.code.emit_goto(done)?;
            self.code.bind(next)?;
            self.code.set_stack_depth(0);
        }
        // No clause matched: the original throwable continues.
        self.code.emit_aload(raw_slot)?;
        self.code.emit_athrow();

        self.throwable_slots.retain(|&s| s != raw_slot);
        self.code.free_temp(raw_slot);
        self.code.free_temp(value_slot);
        self.code.add_handler(&self.ranges[range], handler, 0);
        self.code.bind(done)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    fn compile_with(&mut self, g: &mut Gen, items: &'ast [ast::WithItem], body: &'ast [Stmt]) -> Result<(), CompileError> {
        let Some((item, rest)) = items.split_first() else {
            return self.compile_stmts(g, body);
        };
        let exit_index = self.with_depth;
        self.with_depth += 1;

        self.compile_expr(g, &item.context_expr)?;
        let ctx_slot = self.code.acquire_temp();
        self.code.emit_astore(ctx_slot)?;
        // Park the bound __exit__ in the frame before __enter__ runs, so
        // the handler can reach it without re-evaluating anything.
        self.code.emit_aload(0)?;
        self.code.emit_iconst(i32::from(exit_index))?;
        self.code.emit_aload(ctx_slot)?;
        self.invoke(g, &runtime::GET_EXIT_METHOD)?;
        self.invoke(g, &runtime::SET_EXIT)?;
        self.code.emit_aload(ctx_slot)?;
        self.invoke(g, &runtime::ENTER)?;
        self.code.free_temp(ctx_slot);
        match &item.optional_vars {
            Some(vars) => self.store_target(g, vars)?,
            None => self.code.emit(Op::Pop),
        }

        let range = self.ranges.len();
        self.ranges.push(ExceptionRange::new());
        self.ranges[range].begin(self.code.pos());
        self.cleanups.push(Cleanup::WithExit { exit_index, range });
        if rest.is_empty() {
            self.compile_stmts(g, body)?;
        } else {
            self.compile_with(g, rest, body)?;
        }
        self.cleanups.pop();
        self.ranges[range].end(self.code.pos());

        self.emit_with_exit(g, exit_index)?;
        let done = self.code.new_label();
        self.code.emit_goto(done)?;

        let handler = self.code.new_label();
        self.code.bind(handler)?;
        self.code.set_stack_depth(1);
        let slot = self.code.acquire_pinned();
        self.throwable_slots.push(slot);
        self.code.emit_astore(slot)?;
        self.code.emit_aload(0)?;
        self.code.emit_iconst(i32::from(exit_index))?;
        self.invoke(g, &runtime::GET_EXIT)?;
        self.code.emit_aload(slot)?;
        self.invoke(g, &runtime::CALL_EXIT)?;
        // A truthy __exit__ suppresses; otherwise the throwable continues.
        self.code.emit_branch(Op::Ifne, done)?;
        self.code.emit_aload(slot)?;
        self.code.emit_athrow();
        self.throwable_slots.retain(|&s| s != slot);
        self.code.free_temp(slot);
        self.code.add_handler(&self.ranges[range], handler, 0);
        self.code.bind(done)?;
        self.code.set_stack_depth(0);
        self.with_depth -= 1;
        Ok(())
    }

    /// Normal-path context exit: `exit(None, None, None)`, result ignored.
    pub(super) fn emit_with_exit(&mut self, g: &mut Gen, exit_index: u16) -> Result<(), CompileError> {
        self.code.emit_aload(0)?;
        self.code.emit_iconst(i32::from(exit_index))?;
        self.invoke(g, &runtime::GET_EXIT)?;
        self.emit_none(g)?;
        self.emit_none(g)?;
        self.emit_none(g)?;
        self.invoke(g, &runtime::CALL3)?;
        self.code.emit(Op::Pop);
        Ok(())
    }
}
