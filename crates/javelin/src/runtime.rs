//! The generated-code ABI: class names, field references and method
//! signatures of the `javelin.runtime` support library.
//!
//! Every call site the code generator emits goes through one of these
//! tables, so the stack accounting in the code builder and the constant
//! pool entries always agree with the descriptor.

use ruff_python_ast::{CmpOp, Operator, UnaryOp};

use crate::classfile::{CodeBuilder, ConstantPool, Op};
use crate::error::CompileError;

pub const VALUE: &str = "javelin/runtime/Value";
pub const FRAME: &str = "javelin/runtime/Frame";
pub const PY: &str = "javelin/runtime/Py";
pub const CELL: &str = "javelin/runtime/Cell";
pub const CODE: &str = "javelin/runtime/Code";
pub const FUNCTION_TABLE: &str = "javelin/runtime/FunctionTable";
pub const THROWABLE: &str = "java/lang/Throwable";
pub const STRING: &str = "java/lang/String";
pub const OBJECT: &str = "java/lang/Object";

pub const VALUE_DESC: &str = "Ljavelin/runtime/Value;";
pub const CODE_DESC: &str = "Ljavelin/runtime/Code;";
/// Signature shared by every generated code-object method.
pub const BODY_DESC: &str = "(Ljavelin/runtime/Frame;)Ljavelin/runtime/Value;";
/// Signature of the per-class dispatch method.
pub const DISPATCH_DESC: &str = "(ILjavelin/runtime/Frame;)Ljavelin/runtime/Value;";

/// Annotation type descriptors stamped onto every generated class.
pub const ANN_API_VERSION: &str = "Ljavelin/runtime/APIVersion;";
pub const ANN_MTIME: &str = "Ljavelin/runtime/MTime;";
pub const ANN_FILENAME: &str = "Ljavelin/runtime/Filename;";

/// Protocol level the emitted classes expect of the runtime.
pub const API_VERSION: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Static,
    Virtual,
    Special,
}

/// One callable runtime entry point.
#[derive(Debug, Clone, Copy)]
pub struct MethodAbi {
    pub class: &'static str,
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: InvokeKind,
    /// Operand slots consumed by the descriptor arguments, excluding the
    /// receiver.
    pub arg_slots: u16,
    pub ret_slots: u16,
}

impl MethodAbi {
    /// Emits the invoke instruction, interning the method reference.
    pub fn emit(&self, pool: &mut ConstantPool, code: &mut CodeBuilder) -> Result<(), CompileError> {
        let idx = pool.methodref(self.class, self.name, self.desc)?;
        let (op, receiver) = match self.kind {
            InvokeKind::Static => (Op::Invokestatic, 0),
            InvokeKind::Virtual => (Op::Invokevirtual, 1),
            InvokeKind::Special => (Op::Invokespecial, 1),
        };
        code.emit_invoke(op, idx, self.arg_slots + receiver, self.ret_slots);
        Ok(())
    }
}

/// A static field on the runtime, such as the `None` singleton.
#[derive(Debug, Clone, Copy)]
pub struct FieldAbi {
    pub class: &'static str,
    pub name: &'static str,
    pub desc: &'static str,
}

impl FieldAbi {
    pub fn emit_get(&self, pool: &mut ConstantPool, code: &mut CodeBuilder) -> Result<(), CompileError> {
        let idx = pool.fieldref(self.class, self.name, self.desc)?;
        code.emit_getstatic(idx);
        Ok(())
    }
}

const fn value_virtual(name: &'static str, desc: &'static str, arg_slots: u16, ret_slots: u16) -> MethodAbi {
    MethodAbi {
        class: VALUE,
        name,
        desc,
        kind: InvokeKind::Virtual,
        arg_slots,
        ret_slots,
    }
}

const fn frame_virtual(name: &'static str, desc: &'static str, arg_slots: u16, ret_slots: u16) -> MethodAbi {
    MethodAbi {
        class: FRAME,
        name,
        desc,
        kind: InvokeKind::Virtual,
        arg_slots,
        ret_slots,
    }
}

const fn py_static(name: &'static str, desc: &'static str, arg_slots: u16, ret_slots: u16) -> MethodAbi {
    MethodAbi {
        class: PY,
        name,
        desc,
        kind: InvokeKind::Static,
        arg_slots,
        ret_slots,
    }
}

pub const NONE: FieldAbi = FieldAbi { class: PY, name: "None", desc: VALUE_DESC };
pub const TRUE: FieldAbi = FieldAbi { class: PY, name: "True", desc: VALUE_DESC };
pub const FALSE: FieldAbi = FieldAbi { class: PY, name: "False", desc: VALUE_DESC };
pub const ELLIPSIS: FieldAbi = FieldAbi { class: PY, name: "Ellipsis", desc: VALUE_DESC };

// Binary operator protocol on Value.
pub const ADD: MethodAbi = value_virtual("_add", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const SUB: MethodAbi = value_virtual("_sub", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const MUL: MethodAbi = value_virtual("_mul", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const TRUEDIV: MethodAbi = value_virtual("_truediv", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const FLOORDIV: MethodAbi = value_virtual("_floordiv", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const MOD: MethodAbi = value_virtual("_mod", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const POW: MethodAbi = value_virtual("_pow", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const LSHIFT: MethodAbi = value_virtual("_lshift", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const RSHIFT: MethodAbi = value_virtual("_rshift", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const BITOR: MethodAbi = value_virtual("_or", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const BITXOR: MethodAbi = value_virtual("_xor", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const BITAND: MethodAbi = value_virtual("_and", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const MATMUL: MethodAbi = value_virtual("_matmul", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);

// Augmented-assignment protocol.
pub const IADD: MethodAbi = value_virtual("_iadd", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const ISUB: MethodAbi = value_virtual("_isub", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IMUL: MethodAbi = value_virtual("_imul", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const ITRUEDIV: MethodAbi = value_virtual("_itruediv", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IFLOORDIV: MethodAbi = value_virtual("_ifloordiv", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IMOD: MethodAbi = value_virtual("_imod", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IPOW: MethodAbi = value_virtual("_ipow", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const ILSHIFT: MethodAbi = value_virtual("_ilshift", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IRSHIFT: MethodAbi = value_virtual("_irshift", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IBITOR: MethodAbi = value_virtual("_ior", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IBITXOR: MethodAbi = value_virtual("_ixor", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IBITAND: MethodAbi = value_virtual("_iand", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IMATMUL: MethodAbi = value_virtual("_imatmul", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);

// Rich comparisons and membership.
pub const LT: MethodAbi = value_virtual("_lt", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const LE: MethodAbi = value_virtual("_le", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const GT: MethodAbi = value_virtual("_gt", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const GE: MethodAbi = value_virtual("_ge", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const EQ: MethodAbi = value_virtual("_eq", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const NE: MethodAbi = value_virtual("_ne", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IS: MethodAbi = value_virtual("_is", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IS_NOT: MethodAbi = value_virtual("_isnot", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const IN: MethodAbi = value_virtual("_in", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const NOT_IN: MethodAbi = value_virtual("_notin", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);

// Unary protocol.
pub const NEG: MethodAbi = value_virtual("__neg__", "()Ljavelin/runtime/Value;", 0, 1);
pub const POS: MethodAbi = value_virtual("__pos__", "()Ljavelin/runtime/Value;", 0, 1);
pub const INVERT: MethodAbi = value_virtual("__invert__", "()Ljavelin/runtime/Value;", 0, 1);
pub const NOT: MethodAbi = value_virtual("__not__", "()Ljavelin/runtime/Value;", 0, 1);
pub const IS_TRUE: MethodAbi = value_virtual("isTrue", "()Z", 0, 1);

// Attribute, item and call protocol.
pub const GETATTR: MethodAbi = value_virtual("__getattr__", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);
pub const SETATTR: MethodAbi = value_virtual("__setattr__", "(Ljava/lang/String;Ljavelin/runtime/Value;)V", 2, 0);
pub const DELATTR: MethodAbi = value_virtual("__delattr__", "(Ljava/lang/String;)V", 1, 0);
pub const GETITEM: MethodAbi = value_virtual("__getitem__", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const SETITEM: MethodAbi = value_virtual("__setitem__", "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)V", 2, 0);
pub const DELITEM: MethodAbi = value_virtual("__delitem__", "(Ljavelin/runtime/Value;)V", 1, 0);
pub const CALL0: MethodAbi = value_virtual("__call__", "()Ljavelin/runtime/Value;", 0, 1);
pub const CALL1: MethodAbi = value_virtual("__call__", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const CALL2: MethodAbi = value_virtual(
    "__call__",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)Ljavelin/runtime/Value;",
    2,
    1,
);
pub const CALL3: MethodAbi = value_virtual(
    "__call__",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;Ljavelin/runtime/Value;)Ljavelin/runtime/Value;",
    3,
    1,
);
pub const CALL_ARRAY: MethodAbi = value_virtual("__call__", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const CALL_KW: MethodAbi = value_virtual(
    "__call__",
    "([Ljavelin/runtime/Value;[Ljava/lang/String;)Ljavelin/runtime/Value;",
    2,
    1,
);

// Frame accessors.
pub const GET_LOCAL: MethodAbi = frame_virtual("getlocal", "(I)Ljavelin/runtime/Value;", 1, 1);
pub const GET_NAME: MethodAbi = frame_virtual("getname", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);
pub const SET_NAME: MethodAbi = frame_virtual("setname", "(Ljava/lang/String;Ljavelin/runtime/Value;)V", 2, 0);
pub const DEL_NAME: MethodAbi = frame_virtual("delname", "(Ljava/lang/String;)V", 1, 0);
pub const GET_GLOBAL: MethodAbi = frame_virtual("getglobal", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);
pub const SET_GLOBAL: MethodAbi = frame_virtual("setglobal", "(Ljava/lang/String;Ljavelin/runtime/Value;)V", 2, 0);
pub const DEL_GLOBAL: MethodAbi = frame_virtual("delglobal", "(Ljava/lang/String;)V", 1, 0);
pub const GET_DEREF: MethodAbi = frame_virtual("getderef", "(I)Ljavelin/runtime/Value;", 1, 1);
pub const SET_DEREF: MethodAbi = frame_virtual("setderef", "(ILjavelin/runtime/Value;)V", 2, 0);
pub const OUTER: MethodAbi = frame_virtual("outer", "()Ljavelin/runtime/Frame;", 0, 1);
pub const GET_CLOSURE: MethodAbi = frame_virtual("getclosure", "(I)Ljavelin/runtime/Cell;", 1, 1);
pub const SET_LINE: MethodAbi = frame_virtual("setline", "(I)V", 1, 0);
pub const GET_RESUME_POINT: MethodAbi = frame_virtual("getResumePoint", "()I", 0, 1);
pub const SET_RESUME_POINT: MethodAbi = frame_virtual("setResumePoint", "(I)V", 1, 0);
pub const CHECK_THROW: MethodAbi = frame_virtual("checkThrow", "()V", 0, 0);
pub const GENERATOR_INPUT: MethodAbi = frame_virtual("getGeneratorInput", "()Ljavelin/runtime/Value;", 0, 1);
pub const SET_SAVED_LOCALS: MethodAbi = frame_virtual("setSavedLocals", "([Ljava/lang/Object;)V", 1, 0);
pub const GET_SAVED_LOCALS: MethodAbi = frame_virtual("getSavedLocals", "()[Ljava/lang/Object;", 0, 1);
pub const SET_EXIT: MethodAbi = frame_virtual("setExit", "(ILjavelin/runtime/Value;)V", 2, 0);
pub const GET_EXIT: MethodAbi = frame_virtual("getExit", "(I)Ljavelin/runtime/Value;", 1, 1);

// Iteration.
pub const ITER: MethodAbi = py_static("iter", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
/// Returns null when the iterator is exhausted.
pub const ITER_NEXT: MethodAbi = py_static("iterNext", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);

// Exceptions.
pub const SET_EXCEPTION: MethodAbi = py_static(
    "setException",
    "(Ljava/lang/Throwable;Ljavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    2,
    1,
);
pub const MATCH_EXCEPTION: MethodAbi =
    py_static("matchException", "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)Z", 2, 1);
/// Re-raises the exception currently being handled in `frame`.
pub const RERAISE: MethodAbi = py_static("reraise", "(Ljavelin/runtime/Frame;)Ljava/lang/RuntimeException;", 1, 1);
pub const MAKE_EXCEPTION1: MethodAbi =
    py_static("makeException", "(Ljavelin/runtime/Value;)Ljava/lang/RuntimeException;", 1, 1);
pub const MAKE_EXCEPTION2: MethodAbi = py_static(
    "makeException",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)Ljava/lang/RuntimeException;",
    2,
    1,
);
pub const ASSERTION_ERROR: MethodAbi =
    py_static("assertionError", "(Ljavelin/runtime/Value;)Ljava/lang/RuntimeException;", 1, 1);
/// Raised when a local slot reads back null after `del`.
pub const UNBOUND_LOCAL: MethodAbi =
    py_static("unboundLocal", "(Ljava/lang/String;)Ljava/lang/RuntimeException;", 1, 1);

// Functions and classes.
pub const MAKE_FUNCTION: MethodAbi = py_static(
    "makeFunction",
    "(Ljavelin/runtime/Code;[Ljavelin/runtime/Value;Ljavelin/runtime/Value;[Ljavelin/runtime/Cell;Ljavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    5,
    1,
);
pub const MAKE_CLASS: MethodAbi = py_static(
    "makeClass",
    "(Ljava/lang/String;[Ljavelin/runtime/Value;Ljavelin/runtime/Code;[Ljavelin/runtime/Cell;Ljavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    5,
    1,
);
pub const NEW_CODE: MethodAbi = py_static(
    "newCode",
    "(Ljavelin/runtime/FunctionTable;ILjava/lang/String;I[Ljava/lang/String;ZZZIII)Ljavelin/runtime/Code;",
    11,
    1,
);

// Context managers.
pub const GET_EXIT_METHOD: MethodAbi = py_static("getExit", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const ENTER: MethodAbi = py_static("enter", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const CALL_EXIT: MethodAbi =
    py_static("callExit", "(Ljavelin/runtime/Value;Ljava/lang/Throwable;)Z", 2, 1);

// Imports.
/// Returns the top-level package, as `import a.b` binds `a`.
pub const IMPORT_MODULE: MethodAbi = py_static(
    "importModule",
    "(Ljava/lang/String;ILjavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    3,
    1,
);
/// Returns the leaf module, for `import a.b as c` and `from` imports.
pub const IMPORT_MODULE_AS: MethodAbi = py_static(
    "importModuleAs",
    "(Ljava/lang/String;ILjavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    3,
    1,
);
pub const IMPORT_FROM: MethodAbi =
    py_static("importFrom", "(Ljavelin/runtime/Value;Ljava/lang/String;)Ljavelin/runtime/Value;", 2, 1);
pub const IMPORT_STAR: MethodAbi =
    py_static("importStar", "(Ljavelin/runtime/Value;Ljavelin/runtime/Frame;)V", 2, 0);

// Unpacking.
pub const UNPACK_SEQUENCE: MethodAbi =
    py_static("unpackSequence", "(Ljavelin/runtime/Value;I)[Ljavelin/runtime/Value;", 2, 1);
pub const UNPACK_STAR: MethodAbi =
    py_static("unpackStar", "(Ljavelin/runtime/Value;II)[Ljavelin/runtime/Value;", 3, 1);

// Collection display builders.
pub const NEW_LIST: MethodAbi = py_static("newList", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const NEW_TUPLE: MethodAbi = py_static("newTuple", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const NEW_SET: MethodAbi = py_static("newSet", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
/// Alternating key/value pairs; a null key marks a `**mapping` spread.
pub const NEW_DICT: MethodAbi = py_static("newDict", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);
pub const NEW_SLICE: MethodAbi = py_static(
    "newSlice",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;Ljavelin/runtime/Value;)Ljavelin/runtime/Value;",
    3,
    1,
);
pub const LIST_APPEND: MethodAbi = py_static(
    "listAppend",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)V",
    2,
    0,
);
pub const SET_ADD: MethodAbi = py_static("setAdd", "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;)V", 2, 0);
pub const DICT_PUT: MethodAbi = py_static(
    "dictPut",
    "(Ljavelin/runtime/Value;Ljavelin/runtime/Value;Ljavelin/runtime/Value;)V",
    3,
    0,
);

// Literal constructors, used by `<clinit>`.
pub const NEW_INTEGER: MethodAbi = py_static("newInteger", "(J)Ljavelin/runtime/Value;", 2, 1);
pub const NEW_BIG_INTEGER: MethodAbi =
    py_static("newBigInteger", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);
pub const NEW_FLOAT: MethodAbi = py_static("newFloat", "(D)Ljavelin/runtime/Value;", 2, 1);
pub const NEW_IMAGINARY: MethodAbi = py_static("newImaginary", "(D)Ljavelin/runtime/Value;", 2, 1);
pub const NEW_STRING: MethodAbi = py_static("newString", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);
/// Bytes travel as a latin-1 string constant.
pub const NEW_BYTES: MethodAbi = py_static("newBytes", "(Ljava/lang/String;)Ljavelin/runtime/Value;", 1, 1);

// F-strings.
pub const FORMAT_VALUE: MethodAbi = py_static(
    "formatValue",
    "(Ljavelin/runtime/Value;Ljava/lang/String;I)Ljavelin/runtime/Value;",
    3,
    1,
);
pub const BUILD_STRING: MethodAbi =
    py_static("buildString", "([Ljavelin/runtime/Value;)Ljavelin/runtime/Value;", 1, 1);

// Miscellany.
pub const PRINT_RESULT: MethodAbi = py_static("printResult", "(Ljavelin/runtime/Value;)V", 1, 0);
/// Trampoline for bodies that outgrow one JVM method: the precompiled
/// blob travels as a latin-1 string and runs under an interpreter.
pub const RUN_PRECOMPILED: MethodAbi = py_static(
    "runPrecompiled",
    "([Ljava/lang/String;Ljavelin/runtime/Frame;)Ljavelin/runtime/Value;",
    2,
    1,
);

pub const TABLE_INIT: MethodAbi = MethodAbi {
    class: FUNCTION_TABLE,
    name: "<init>",
    desc: "()V",
    kind: InvokeKind::Special,
    arg_slots: 0,
    ret_slots: 0,
};

/// Maps a binary operator to its `Value` protocol method.
pub fn binary_op(op: Operator) -> MethodAbi {
    match op {
        Operator::Add => ADD,
        Operator::Sub => SUB,
        Operator::Mult => MUL,
        Operator::Div => TRUEDIV,
        Operator::FloorDiv => FLOORDIV,
        Operator::Mod => MOD,
        Operator::Pow => POW,
        Operator::LShift => LSHIFT,
        Operator::RShift => RSHIFT,
        Operator::BitOr => BITOR,
        Operator::BitXor => BITXOR,
        Operator::BitAnd => BITAND,
        Operator::MatMult => MATMUL,
    }
}

pub fn inplace_op(op: Operator) -> MethodAbi {
    match op {
        Operator::Add => IADD,
        Operator::Sub => ISUB,
        Operator::Mult => IMUL,
        Operator::Div => ITRUEDIV,
        Operator::FloorDiv => IFLOORDIV,
        Operator::Mod => IMOD,
        Operator::Pow => IPOW,
        Operator::LShift => ILSHIFT,
        Operator::RShift => IRSHIFT,
        Operator::BitOr => IBITOR,
        Operator::BitXor => IBITXOR,
        Operator::BitAnd => IBITAND,
        Operator::MatMult => IMATMUL,
    }
}

pub fn compare_op(op: CmpOp) -> MethodAbi {
    match op {
        CmpOp::Lt => LT,
        CmpOp::LtE => LE,
        CmpOp::Gt => GT,
        CmpOp::GtE => GE,
        CmpOp::Eq => EQ,
        CmpOp::NotEq => NE,
        CmpOp::Is => IS,
        CmpOp::IsNot => IS_NOT,
        CmpOp::In => IN,
        CmpOp::NotIn => NOT_IN,
    }
}

pub fn unary_op(op: UnaryOp) -> MethodAbi {
    match op {
        UnaryOp::USub => NEG,
        UnaryOp::UAdd => POS,
        UnaryOp::Invert => INVERT,
        UnaryOp::Not => NOT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_accounts_for_receiver_and_return() {
        let mut pool = ConstantPool::new();
        let mut code = CodeBuilder::new(1);
        // receiver + argument in, result out.
        code.emit(Op::AconstNull);
        code.emit(Op::AconstNull);
        ADD.emit(&mut pool, &mut code).unwrap();
        code.emit_areturn();
        let method = code.finish().unwrap();
        assert_eq!(method.max_stack, 2);
        assert_eq!(method.code[2], Op::Invokevirtual.byte());
    }

    #[test]
    fn long_arguments_count_two_slots() {
        assert_eq!(NEW_INTEGER.arg_slots, 2);
        assert_eq!(NEW_FLOAT.arg_slots, 2);
        assert_eq!(NEW_CODE.arg_slots, 11);
    }

    #[test]
    fn operator_tables_are_total() {
        assert_eq!(binary_op(Operator::MatMult).name, "_matmul");
        assert_eq!(inplace_op(Operator::Add).name, "_iadd");
        assert_eq!(compare_op(CmpOp::NotIn).name, "_notin");
        assert_eq!(unary_op(UnaryOp::Not).name, "__not__");
    }
}
