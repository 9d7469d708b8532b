//! Expression lowering.

use std::borrow::Cow;

use num_bigint::BigInt;
use ruff_python_ast::{self as ast, ConversionFlag, Expr, InterpolatedStringElement};

use crate::classfile::Op;
use crate::constants::ConstValue;
use crate::error::CompileError;
use crate::runtime;

use super::{CompKind, CompSpec, FunctionCompiler, Gen, ScopeAst};

impl<'ast> FunctionCompiler<'ast> {
    /// Emits `expr`, leaving one `Value` on the stack.
    pub fn compile_expr(&mut self, g: &mut Gen, expr: &'ast Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Name(name) => self.load_name(g, name.id.as_str()),
            Expr::NumberLiteral(lit) => {
                let value = match &lit.value {
                    ast::Number::Int(int) => match int.as_i64() {
                        Some(v) => ConstValue::Int(v),
                        None => {
                            let big: BigInt = int
                                .to_string()
                                .parse()
                                .map_err(|_| CompileError::internal("unparsable integer literal"))?;
                            ConstValue::Big(big)
                        }
                    },
                    ast::Number::Float(f) => ConstValue::Float(*f),
                    ast::Number::Complex { real, imag } => {
                        if *real != 0.0 {
                            self.load_const(g, ConstValue::Float(*real))?;
                            self.load_const(g, ConstValue::Imaginary(*imag))?;
                            return self.invoke(g, &runtime::ADD);
                        }
                        ConstValue::Imaginary(*imag)
                    }
                };
                self.load_const(g, value)
            }
            Expr::StringLiteral(lit) => self.load_const(g, ConstValue::Str(lit.value.to_str().to_string())),
            Expr::BytesLiteral(lit) => {
                let bytes: Cow<'_, [u8]> = Cow::from(&lit.value);
                self.load_const(g, ConstValue::Bytes(bytes.into_owned()))
            }
            Expr::BooleanLiteral(lit) => {
                let field = if lit.value { &runtime::TRUE } else { &runtime::FALSE };
                field.emit_get(g.class.pool(), &mut self.code)
            }
            Expr::NoneLiteral(_) => self.emit_none(g),
            Expr::EllipsisLiteral(_) => runtime::ELLIPSIS.emit_get(g.class.pool(), &mut self.code),
            Expr::FString(fstring) => self.compile_fstring(g, fstring),
            Expr::BoolOp(op) => self.compile_bool_op(g, op),
            Expr::BinOp(op) => {
                self.compile_expr(g, &op.left)?;
                self.compile_expr(g, &op.right)?;
                self.invoke(g, &runtime::binary_op(op.op))
            }
            Expr::UnaryOp(op) => {
                self.compile_expr(g, &op.operand)?;
                self.invoke(g, &runtime::unary_op(op.op))
            }
            Expr::Compare(cmp) => self.compile_compare(g, cmp),
            Expr::Named(named) => {
                self.compile_expr(g, &named.value)?;
                self.code.emit(Op::Dup);
                match named.target.as_ref() {
                    Expr::Name(name) => self.store_name(g, name.id.as_str()),
                    other => Err(self.syntax_err(g, "illegal assignment target", other)),
                }
            }
            Expr::Lambda(lambda) => {
                self.emit_make_function(g, lambda.parameters.as_deref(), None, ScopeAst::Value(&lambda.body))
            }
            Expr::If(ternary) => {
                let orelse = self.code.new_label();
                let end = self.code.new_label();
                self.compile_expr(g, &ternary.test)?;
                self.invoke(g, &runtime::IS_TRUE)?;
                self.code.emit_branch(Op::Ifeq, orelse)?;
                self.compile_expr(g, &ternary.body)?;
                self.code.emit_goto(end)?;
                self.code.bind(orelse)?;
                self.code.set_stack_depth(0);
                self.compile_expr(g, &ternary.orelse)?;
                self.code.bind(end)?;
                self.code.set_stack_depth(1);
                Ok(())
            }
            Expr::Tuple(tuple) => {
                self.check_display(g, &tuple.elts)?;
                self.emit_value_array(g, &tuple.elts)?;
                self.invoke(g, &runtime::NEW_TUPLE)
            }
            Expr::List(list) => {
                self.check_display(g, &list.elts)?;
                self.emit_value_array(g, &list.elts)?;
                self.invoke(g, &runtime::NEW_LIST)
            }
            Expr::Set(set) => {
                self.check_display(g, &set.elts)?;
                self.emit_value_array(g, &set.elts)?;
                self.invoke(g, &runtime::NEW_SET)
            }
            Expr::Dict(dict) => {
                // Pairs flattened into one array; a null key marks a
                // `**mapping` spread for the runtime to merge.
                let value_class = g.class.pool().class(runtime::VALUE)?;
                self.code.emit_iconst(2 * dict.items.len() as i32)?;
                self.code.emit_anewarray(value_class);
                for (i, item) in dict.items.iter().enumerate() {
                    self.code.emit(Op::Dup);
                    self.code.emit_iconst(2 * i as i32)?;
                    match &item.key {
                        Some(key) => self.compile_expr(g, key)?,
                        None => self.code.emit(Op::AconstNull),
                    }
                    self.code.emit(Op::Aastore);
                    self.code.emit(Op::Dup);
                    self.code.emit_iconst(2 * i as i32 + 1)?;
                    self.compile_expr(g, &item.value)?;
                    self.code.emit(Op::Aastore);
                }
                self.invoke(g, &runtime::NEW_DICT)
            }
            Expr::ListComp(comp) => {
                self.compile_comprehension(g, CompKind::List, &comp.generators, None, &comp.elt)
            }
            Expr::SetComp(comp) => {
                self.compile_comprehension(g, CompKind::Set, &comp.generators, None, &comp.elt)
            }
            Expr::DictComp(comp) => {
                self.compile_comprehension(g, CompKind::Dict, &comp.generators, comp.key.as_deref(), &comp.value)
            }
            Expr::Generator(comp) => {
                self.compile_comprehension(g, CompKind::Generator, &comp.generators, None, &comp.elt)
            }
            Expr::Call(call) => self.compile_call(g, call),
            Expr::Attribute(attr) => {
                self.compile_expr(g, &attr.value)?;
                self.load_java_string(g, attr.attr.as_str())?;
                self.invoke(g, &runtime::GETATTR)
            }
            Expr::Subscript(sub) => {
                self.compile_expr(g, &sub.value)?;
                self.compile_subscript_key(g, &sub.slice)?;
                self.invoke(g, &runtime::GETITEM)
            }
            Expr::Slice(slice) => {
                for bound in [&slice.lower, &slice.upper, &slice.step] {
                    match bound {
                        Some(expr) => self.compile_expr(g, expr)?,
                        None => self.emit_none(g)?,
                    }
                }
                self.invoke(g, &runtime::NEW_SLICE)
            }
            Expr::Yield(yield_expr) => {
                match &yield_expr.value {
                    Some(value) => self.compile_expr(g, value)?,
                    None => self.emit_none(g)?,
                }
                self.emit_yield_point(g)
            }
            Expr::Starred(starred) => {
                Err(self.syntax_err(g, "can't use starred expression here", starred))
            }
            Expr::YieldFrom(e) => Err(self.unsupported(g, "'yield from' expressions", e)),
            Expr::Await(e) => Err(self.unsupported(g, "await expressions", e)),
            Expr::TString(e) => Err(self.unsupported(g, "template strings", e)),
            Expr::IpyEscapeCommand(e) => {
                Err(self.syntax_err(g, "IPython escape commands are not valid Python", e))
            }
        }
    }

    /// Subscript keys are slice-aware; everything else reads as a plain
    /// expression.
    pub fn compile_subscript_key(&mut self, g: &mut Gen, key: &'ast Expr) -> Result<(), CompileError> {
        self.compile_expr(g, key)
    }

    fn check_display(&self, g: &Gen, elts: &'ast [Expr]) -> Result<(), CompileError> {
        for elt in elts {
            if let Expr::Starred(starred) = elt {
                return Err(self.unsupported(g, "starred elements in displays", starred));
            }
        }
        Ok(())
    }

    fn compile_bool_op(&mut self, g: &mut Gen, op: &'ast ast::ExprBoolOp) -> Result<(), CompileError> {
        let end = self.code.new_label();
        let short_circuit = match op.op {
            ast::BoolOp::And => Op::Ifeq,
            ast::BoolOp::Or => Op::Ifne,
        };
        let last = op.values.len() - 1;
        for (i, value) in op.values.iter().enumerate() {
            self.compile_expr(g, value)?;
            if i < last {
                self.code.emit(Op::Dup);
                self.invoke(g, &runtime::IS_TRUE)?;
                self.code.emit_branch(short_circuit, end)?;
                self.code.emit(Op::Pop);
            }
        }
        self.code.bind(end)?;
        self.code.set_stack_depth(1);
        Ok(())
    }

    fn compile_compare(&mut self, g: &mut Gen, cmp: &'ast ast::ExprCompare) -> Result<(), CompileError> {
        self.compile_expr(g, &cmp.left)?;
        if cmp.comparators.len() == 1 {
            self.compile_expr(g, &cmp.comparators[0])?;
            return self.invoke(g, &runtime::compare_op(cmp.ops[0]));
        }
        // Chained form: each link keeps its right operand underneath for
        // the next one, bailing out on the first false result.
        let end = self.code.new_label();
        let cleanup = self.code.new_label();
        let last = cmp.comparators.len() - 1;
        for i in 0..last {
            self.compile_expr(g, &cmp.comparators[i])?;
            self.code.emit(Op::DupX1);
            self.invoke(g, &runtime::compare_op(cmp.ops[i]))?;
            self.code.emit(Op::Dup);
            self.invoke(g, &runtime::IS_TRUE)?;
            self.code.emit_branch(Op::Ifeq, cleanup)?;
            self.code.emit(Op::Pop);
        }
        self.compile_expr(g, &cmp.comparators[last])?;
        self.invoke(g, &runtime::compare_op(cmp.ops[last]))?;
        self.code.emit_goto(end)?;
        self.code.bind(cleanup)?;
        self.code.set_stack_depth(2);
        self.code.emit(Op::Swap);
        self.code.emit(Op::Pop);
        self.code.bind(end)?;
        self.code.set_stack_depth(1);
        Ok(())
    }

    fn compile_call(&mut self, g: &mut Gen, call: &'ast ast::ExprCall) -> Result<(), CompileError> {
        for arg in &call.arguments.args {
            if let Expr::Starred(starred) = arg {
                return Err(self.unsupported(g, "argument unpacking in calls", starred));
            }
        }
        for keyword in &call.arguments.keywords {
            if keyword.arg.is_none() {
                return Err(self.unsupported(g, "keyword argument unpacking in calls", keyword));
            }
        }
        self.compile_expr(g, &call.func)?;
        let args = &call.arguments.args;
        let keywords = &call.arguments.keywords;
        if keywords.is_empty() {
            match args.len() {
                0 => return self.invoke(g, &runtime::CALL0),
                n @ 1..=3 => {
                    for arg in args {
                        self.compile_expr(g, arg)?;
                    }
                    let abi = match n {
                        1 => &runtime::CALL1,
                        2 => &runtime::CALL2,
                        _ => &runtime::CALL3,
                    };
                    return self.invoke(g, abi);
                }
                _ => {
                    self.emit_value_array(g, args)?;
                    return self.invoke(g, &runtime::CALL_ARRAY);
                }
            }
        }
        // Keyword calls pass positionals and keyword values in one array,
        // with a parallel array naming the trailing entries.
        let value_class = g.class.pool().class(runtime::VALUE)?;
        self.code.emit_iconst((args.len() + keywords.len()) as i32)?;
        self.code.emit_anewarray(value_class);
        for (i, arg) in args.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(i as i32)?;
            self.compile_expr(g, arg)?;
            self.code.emit(Op::Aastore);
        }
        for (i, keyword) in keywords.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst((args.len() + i) as i32)?;
            self.compile_expr(g, &keyword.value)?;
            self.code.emit(Op::Aastore);
        }
        let string_class = g.class.pool().class(runtime::STRING)?;
        self.code.emit_iconst(keywords.len() as i32)?;
        self.code.emit_anewarray(string_class);
        for (i, keyword) in keywords.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(i as i32)?;
            let arg = keyword
                .arg
                .as_ref()
                .ok_or_else(|| CompileError::internal("unnamed keyword survived the check"))?;
            self.load_java_string(g, arg.as_str())?;
            self.code.emit(Op::Aastore);
        }
        self.invoke(g, &runtime::CALL_KW)
    }

    fn compile_fstring(&mut self, g: &mut Gen, fstring: &'ast ast::ExprFString) -> Result<(), CompileError> {
        enum Piece<'a> {
            Literal(String),
            Interpolation(&'a ast::InterpolatedElement),
        }
        let mut pieces: Vec<Piece<'ast>> = Vec::new();
        for part in &fstring.value {
            match part {
                ast::FStringPart::Literal(lit) => pieces.push(Piece::Literal(lit.value.to_string())),
                ast::FStringPart::FString(fs) => {
                    for element in &fs.elements {
                        match element {
                            InterpolatedStringElement::Literal(lit) => {
                                pieces.push(Piece::Literal(lit.value.to_string()));
                            }
                            InterpolatedStringElement::Interpolation(interp) => {
                                pieces.push(Piece::Interpolation(interp));
                            }
                        }
                    }
                }
            }
        }
        if pieces.iter().all(|p| matches!(p, Piece::Literal(_))) {
            let text: String = pieces
                .into_iter()
                .map(|p| match p {
                    Piece::Literal(s) => s,
                    Piece::Interpolation(_) => String::new(),
                })
                .collect();
            return self.load_const(g, ConstValue::Str(text));
        }

        let value_class = g.class.pool().class(runtime::VALUE)?;
        self.code.emit_iconst(pieces.len() as i32)?;
        self.code.emit_anewarray(value_class);
        for (i, piece) in pieces.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(i as i32)?;
            match piece {
                Piece::Literal(text) => self.load_const(g, ConstValue::Str(text.clone()))?,
                Piece::Interpolation(interp) => self.compile_interpolation(g, interp)?,
            }
            self.code.emit(Op::Aastore);
        }
        self.invoke(g, &runtime::BUILD_STRING)
    }

    fn compile_interpolation(
        &mut self,
        g: &mut Gen,
        interp: &'ast ast::InterpolatedElement,
    ) -> Result<(), CompileError> {
        if interp.debug_text.is_some() {
            return Err(self.unsupported(g, "f-string '=' debug expressions", interp));
        }
        self.compile_expr(g, &interp.expression)?;
        match &interp.format_spec {
            None => self.code.emit(Op::AconstNull),
            Some(spec) => {
                let mut text = String::new();
                for element in &spec.elements {
                    match element {
                        InterpolatedStringElement::Literal(lit) => text.push_str(&lit.value),
                        InterpolatedStringElement::Interpolation(nested) => {
                            return Err(self.unsupported(
                                g,
                                "interpolations inside format specifications",
                                nested,
                            ));
                        }
                    }
                }
                self.load_java_string(g, &text)?;
            }
        }
        let conversion = match interp.conversion {
            ConversionFlag::None => -1,
            ConversionFlag::Str => i32::from(b's'),
            ConversionFlag::Repr => i32::from(b'r'),
            ConversionFlag::Ascii => i32::from(b'a'),
        };
        self.code.emit_iconst(conversion)?;
        self.invoke(g, &runtime::FORMAT_VALUE)
    }

    /// A comprehension compiles as a hidden function taking the outermost
    /// iterator, immediately called with it.
    fn compile_comprehension(
        &mut self,
        g: &mut Gen,
        kind: CompKind,
        generators: &'ast [ast::Comprehension],
        key: Option<&'ast Expr>,
        element: &'ast Expr,
    ) -> Result<(), CompileError> {
        let first = generators
            .first()
            .ok_or_else(|| CompileError::internal("comprehension without generators"))?;
        self.compile_expr(g, &first.iter)?;
        self.invoke(g, &runtime::ITER)?;
        let spec = CompSpec {
            kind,
            generators,
            key,
            element,
        };
        self.emit_make_function(g, None, None, ScopeAst::Comprehension(spec))?;
        self.code.emit(Op::Swap);
        self.invoke(g, &runtime::CALL1)
    }

    /// Body of the hidden comprehension function: nested iteration feeding
    /// an accumulator, or yields when the comprehension is a generator.
    pub(super) fn compile_comprehension_body(&mut self, g: &mut Gen, spec: CompSpec<'ast>) -> Result<(), CompileError> {
        let acc = match spec.kind {
            CompKind::Generator => None,
            CompKind::List | CompKind::Set | CompKind::Dict => {
                let value_class = g.class.pool().class(runtime::VALUE)?;
                self.code.emit_iconst(0)?;
                self.code.emit_anewarray(value_class);
                let ctor = match spec.kind {
                    CompKind::List => &runtime::NEW_LIST,
                    CompKind::Set => &runtime::NEW_SET,
                    _ => &runtime::NEW_DICT,
                };
                self.invoke(g, ctor)?;
                let slot = self.code.acquire_temp();
                self.code.emit_astore(slot)?;
                Some(slot)
            }
        };
        self.emit_comp_loop(g, spec, 0, acc)?;
        if let Some(slot) = acc {
            self.code.emit_aload(slot)?;
            self.code.emit_areturn();
            self.code.free_temp(slot);
        }
        Ok(())
    }

    fn emit_comp_loop(
        &mut self,
        g: &mut Gen,
        spec: CompSpec<'ast>,
        level: usize,
        acc: Option<u16>,
    ) -> Result<(), CompileError> {
        let Some(generator) = spec.generators.get(level) else {
            match spec.kind {
                CompKind::List => {
                    self.code.emit_aload(acc.unwrap_or(0))?;
                    self.compile_expr(g, spec.element)?;
                    self.invoke(g, &runtime::LIST_APPEND)?;
                }
                CompKind::Set => {
                    self.code.emit_aload(acc.unwrap_or(0))?;
                    self.compile_expr(g, spec.element)?;
                    self.invoke(g, &runtime::SET_ADD)?;
                }
                CompKind::Dict => {
                    self.code.emit_aload(acc.unwrap_or(0))?;
                    if let Some(key) = spec.key {
                        self.compile_expr(g, key)?;
                    }
                    self.compile_expr(g, spec.element)?;
                    self.invoke(g, &runtime::DICT_PUT)?;
                }
                CompKind::Generator => {
                    self.compile_expr(g, spec.element)?;
                    self.emit_yield_point(g)?;
                    // The value sent into a generator expression is ignored.
                    self.code.emit(Op::Pop);
                }
            }
            return Ok(());
        };

        if level == 0 {
            // The outermost iterable arrives pre-iterated as parameter `.0`.
            self.load_name(g, ".0")?;
        } else {
            self.compile_expr(g, &generator.iter)?;
            self.invoke(g, &runtime::ITER)?;
        }
        let iter_slot = self.code.acquire_temp();
        self.code.emit_astore(iter_slot)?;
        let start = self.code.new_label();
        let done = self.code.new_label();
        self.code.bind(start)?;
        self.code.set_stack_depth(0);
        self.code.emit_aload(iter_slot)?;
        self.invoke(g, &runtime::ITER_NEXT)?;
        self.code.emit(Op::Dup);
        self.code.emit_branch(Op::Ifnull, done)?;
        self.store_target(g, &generator.target)?;
        for if_clause in &generator.ifs {
            self.compile_expr(g, if_clause)?;
            self.invoke(g, &runtime::IS_TRUE)?;
            self.code.emit_branch(Op::Ifeq, start)?;
        }
        self.emit_comp_loop(g, spec, level + 1, acc)?;
        self.code.emit_goto(start)?;
        self.code.bind(done)?;
        self.code.set_stack_depth(1);
        self.code.emit(Op::Pop);
        self.code.free_temp(iter_slot);
        Ok(())
    }
}
