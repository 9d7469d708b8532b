//! The JVM opcode subset the code generator emits.
//!
//! Discriminants are the class-file encodings, so serialization is a cast.
//! Stack effects here cover only the operand bytes that follow the opcode
//! deterministically; invokes and field accesses depend on their descriptor
//! and are accounted for by the code builder instead.

/// JVM opcodes used by generated methods. Everything flows through the
/// `Value` reference type, so the arithmetic and typed load/store families
/// are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Op {
    Nop = 0,
    AconstNull = 1,
    #[strum(serialize = "iconst_m1")]
    IconstM1 = 2,
    #[strum(serialize = "iconst_0")]
    Iconst0 = 3,
    #[strum(serialize = "iconst_1")]
    Iconst1 = 4,
    #[strum(serialize = "iconst_2")]
    Iconst2 = 5,
    #[strum(serialize = "iconst_3")]
    Iconst3 = 6,
    #[strum(serialize = "iconst_4")]
    Iconst4 = 7,
    #[strum(serialize = "iconst_5")]
    Iconst5 = 8,
    Bipush = 16,
    Sipush = 17,
    Ldc = 18,
    LdcW = 19,
    Ldc2W = 20,
    Iload = 21,
    Aload = 25,
    #[strum(serialize = "aload_0")]
    Aload0 = 42,
    #[strum(serialize = "aload_1")]
    Aload1 = 43,
    #[strum(serialize = "aload_2")]
    Aload2 = 44,
    #[strum(serialize = "aload_3")]
    Aload3 = 45,
    Aaload = 50,
    Istore = 54,
    Astore = 58,
    #[strum(serialize = "astore_0")]
    Astore0 = 75,
    #[strum(serialize = "astore_1")]
    Astore1 = 76,
    #[strum(serialize = "astore_2")]
    Astore2 = 77,
    #[strum(serialize = "astore_3")]
    Astore3 = 78,
    Aastore = 83,
    Pop = 87,
    Dup = 89,
    DupX1 = 90,
    Swap = 95,
    Ifeq = 153,
    Ifne = 154,
    IfAcmpeq = 165,
    IfAcmpne = 166,
    Goto = 167,
    Tableswitch = 170,
    Areturn = 176,
    Return = 177,
    Getstatic = 178,
    Putstatic = 179,
    Invokevirtual = 182,
    Invokespecial = 183,
    Invokestatic = 184,
    New = 187,
    Anewarray = 189,
    Arraylength = 190,
    Athrow = 191,
    Checkcast = 192,
    Ifnull = 198,
    Ifnonnull = 199,
}

impl Op {
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Net operand-stack change in slots. `None` for opcodes whose effect
    /// depends on a descriptor or on the frame being abandoned.
    pub fn stack_effect(self) -> Option<i32> {
        match self {
            Op::Nop | Op::Swap | Op::Checkcast => Some(0),
            Op::AconstNull
            | Op::IconstM1
            | Op::Iconst0
            | Op::Iconst1
            | Op::Iconst2
            | Op::Iconst3
            | Op::Iconst4
            | Op::Iconst5
            | Op::Bipush
            | Op::Sipush
            | Op::Ldc
            | Op::LdcW
            | Op::Iload
            | Op::Aload
            | Op::Aload0
            | Op::Aload1
            | Op::Aload2
            | Op::Aload3
            | Op::Dup
            | Op::DupX1
            | Op::New => Some(1),
            Op::Ldc2W => Some(2),
            Op::Aaload => Some(-1),
            Op::Istore
            | Op::Astore
            | Op::Astore0
            | Op::Astore1
            | Op::Astore2
            | Op::Astore3
            | Op::Pop
            | Op::Ifeq
            | Op::Ifne
            | Op::Ifnull
            | Op::Ifnonnull
            | Op::Tableswitch => Some(-1),
            Op::IfAcmpeq | Op::IfAcmpne => Some(-2),
            Op::Aastore => Some(-3),
            Op::Goto => Some(0),
            Op::Arraylength => Some(0),
            Op::Anewarray => Some(0),
            // Transfers and descriptor-dependent operations.
            Op::Areturn
            | Op::Return
            | Op::Athrow
            | Op::Getstatic
            | Op::Putstatic
            | Op::Invokevirtual
            | Op::Invokespecial
            | Op::Invokestatic => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_match_the_class_file_spec() {
        assert_eq!(Op::Nop.byte(), 0x00);
        assert_eq!(Op::Ldc.byte(), 0x12);
        assert_eq!(Op::Goto.byte(), 0xa7);
        assert_eq!(Op::Tableswitch.byte(), 0xaa);
        assert_eq!(Op::Invokestatic.byte(), 0xb8);
        assert_eq!(Op::Ifnonnull.byte(), 0xc7);
    }

    #[test]
    fn mnemonics_render_in_lowercase() {
        assert_eq!(Op::AconstNull.to_string(), "aconst_null");
        assert_eq!(Op::IfAcmpne.to_string(), "if_acmpne");
        assert_eq!(Op::Ldc2W.to_string(), "ldc2_w");
    }

    #[test]
    fn fixed_stack_effects() {
        assert_eq!(Op::Dup.stack_effect(), Some(1));
        assert_eq!(Op::Aastore.stack_effect(), Some(-3));
        assert_eq!(Op::Invokevirtual.stack_effect(), None);
    }
}
