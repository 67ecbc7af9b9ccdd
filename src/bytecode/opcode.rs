use crate::{ErrorKind, UmkaError};

/// Opcode numbering is stable and shared with the bytecode file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    PushConst = 0x01,
    Pop = 0x02,
    Store = 0x03,
    Load = 0x04,
    Add = 0x10,
    Sub = 0x11,
    Mul = 0x12,
    Div = 0x13,
    Rem = 0x14,
    Not = 0x17,
    And = 0x18,
    Or = 0x19,
    Eq = 0x1A,
    Neq = 0x1B,
    Gt = 0x1C,
    Lt = 0x1D,
    Gte = 0x1E,
    Lte = 0x1F,
    Jmp = 0x20,
    JmpIfFalse = 0x21,
    JmpIfTrue = 0x22,
    Call = 0x23,
    Return = 0x24,
    BuildArr = 0x30,
    /// Reserved: the `^-^` operator has no agreed semantics yet. Decodes and
    /// re-encodes, fails with a type error when executed.
    Opcot = 0x40,
    CallMethod = 0x50,
    GetField = 0x51,
    SetField = 0x52,
    ToString = 0x60,
    ToInt = 0x61,
    ToDouble = 0x62,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::PushConst => "PUSH_CONST",
            Opcode::Pop => "POP",
            Opcode::Store => "STORE",
            Opcode::Load => "LOAD",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Rem => "REM",
            Opcode::Not => "NOT",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Eq => "EQ",
            Opcode::Neq => "NEQ",
            Opcode::Gt => "GT",
            Opcode::Lt => "LT",
            Opcode::Gte => "GTE",
            Opcode::Lte => "LTE",
            Opcode::Jmp => "JMP",
            Opcode::JmpIfFalse => "JMP_IF_FALSE",
            Opcode::JmpIfTrue => "JMP_IF_TRUE",
            Opcode::Call => "CALL",
            Opcode::Return => "RETURN",
            Opcode::BuildArr => "BUILD_ARR",
            Opcode::Opcot => "OPCOT",
            Opcode::CallMethod => "CALL_METHOD",
            Opcode::GetField => "GET_FIELD",
            Opcode::SetField => "SET_FIELD",
            Opcode::ToString => "TO_STRING",
            Opcode::ToInt => "TO_INT",
            Opcode::ToDouble => "TO_DOUBLE",
        }
    }

    /// Whether the opcode is followed by an i64 operand on the wire.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::PushConst
                | Opcode::Store
                | Opcode::Load
                | Opcode::Jmp
                | Opcode::JmpIfFalse
                | Opcode::JmpIfTrue
                | Opcode::Call
                | Opcode::BuildArr
                | Opcode::CallMethod
                | Opcode::GetField
                | Opcode::SetField
                | Opcode::Opcot
        )
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::JmpIfFalse | Opcode::JmpIfTrue)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = UmkaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let opcode = match value {
            0x01 => Opcode::PushConst,
            0x02 => Opcode::Pop,
            0x03 => Opcode::Store,
            0x04 => Opcode::Load,
            0x10 => Opcode::Add,
            0x11 => Opcode::Sub,
            0x12 => Opcode::Mul,
            0x13 => Opcode::Div,
            0x14 => Opcode::Rem,
            0x17 => Opcode::Not,
            0x18 => Opcode::And,
            0x19 => Opcode::Or,
            0x1A => Opcode::Eq,
            0x1B => Opcode::Neq,
            0x1C => Opcode::Gt,
            0x1D => Opcode::Lt,
            0x1E => Opcode::Gte,
            0x1F => Opcode::Lte,
            0x20 => Opcode::Jmp,
            0x21 => Opcode::JmpIfFalse,
            0x22 => Opcode::JmpIfTrue,
            0x23 => Opcode::Call,
            0x24 => Opcode::Return,
            0x30 => Opcode::BuildArr,
            0x40 => Opcode::Opcot,
            0x50 => Opcode::CallMethod,
            0x51 => Opcode::GetField,
            0x52 => Opcode::SetField,
            0x60 => Opcode::ToString,
            0x61 => Opcode::ToInt,
            0x62 => Opcode::ToDouble,
            other => {
                return Err(UmkaError::new(
                    ErrorKind::Parse,
                    format!("unknown opcode 0x{other:02X}"),
                ))
            }
        };
        Ok(opcode)
    }
}
