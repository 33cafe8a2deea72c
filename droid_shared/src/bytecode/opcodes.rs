//! The opcode table of the target instruction set.
//!
//! Every opcode has a fixed instruction format, which decides how many 16-bit code units it
//! occupies and how many bits each register operand may use.
use super::RegisterKind;

/// Instruction formats, named after the format ids of the instruction set
/// (units, registers, operand kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F32x,
    F30t,
    F31t,
    F31i,
    F31c,
    F35c,
    F3rc,
    F51l,
}

impl Format {
    /// Size in 16-bit code units
    pub fn size(self) -> u32 {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,
            Format::F32x
            | Format::F30t
            | Format::F31t
            | Format::F31i
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F51l => 5,
        }
    }

    /// Bit width of each fixed register operand, in operand order.
    /// Invoke formats are variable and report nothing here.
    pub fn register_bits(self) -> &'static [u8] {
        match self {
            Format::F10x | Format::F10t | Format::F20t | Format::F30t => &[],
            Format::F12x => &[4, 4],
            Format::F11n => &[4],
            Format::F11x | Format::F21t | Format::F21s | Format::F21h | Format::F21c => &[8],
            Format::F31t | Format::F31i | Format::F31c | Format::F51l => &[8],
            Format::F22x => &[8, 16],
            Format::F23x => &[8, 8, 8],
            Format::F22b => &[8, 8],
            Format::F22t | Format::F22s | Format::F22c => &[4, 4],
            Format::F32x => &[16, 16],
            Format::F35c => &[4, 4, 4, 4, 4],
            Format::F3rc => &[],
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident = $value:literal, $name:literal, $format:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            pub fn from_u8(value: u8) -> Option<Opcode> {
                match value {
                    $($value => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            /// The mnemonic used in listings
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $(Opcode::$variant => Format::$format,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", F10x;
    Move = 0x01, "move", F12x;
    MoveFrom16 = 0x02, "move/from16", F22x;
    Move16 = 0x03, "move/16", F32x;
    MoveWide = 0x04, "move-wide", F12x;
    MoveWideFrom16 = 0x05, "move-wide/from16", F22x;
    MoveWide16 = 0x06, "move-wide/16", F32x;
    MoveObject = 0x07, "move-object", F12x;
    MoveObjectFrom16 = 0x08, "move-object/from16", F22x;
    MoveObject16 = 0x09, "move-object/16", F32x;
    MoveResult = 0x0a, "move-result", F11x;
    MoveResultWide = 0x0b, "move-result-wide", F11x;
    MoveResultObject = 0x0c, "move-result-object", F11x;
    MoveException = 0x0d, "move-exception", F11x;
    ReturnVoid = 0x0e, "return-void", F10x;
    Return = 0x0f, "return", F11x;
    ReturnWide = 0x10, "return-wide", F11x;
    ReturnObject = 0x11, "return-object", F11x;
    Const4 = 0x12, "const/4", F11n;
    Const16 = 0x13, "const/16", F21s;
    Const = 0x14, "const", F31i;
    ConstHigh16 = 0x15, "const/high16", F21h;
    ConstWide16 = 0x16, "const-wide/16", F21s;
    ConstWide32 = 0x17, "const-wide/32", F31i;
    ConstWide = 0x18, "const-wide", F51l;
    ConstWideHigh16 = 0x19, "const-wide/high16", F21h;
    ConstString = 0x1a, "const-string", F21c;
    ConstStringJumbo = 0x1b, "const-string/jumbo", F31c;
    ConstClass = 0x1c, "const-class", F21c;
    MonitorEnter = 0x1d, "monitor-enter", F11x;
    MonitorExit = 0x1e, "monitor-exit", F11x;
    CheckCast = 0x1f, "check-cast", F21c;
    InstanceOf = 0x20, "instance-of", F22c;
    ArrayLength = 0x21, "array-length", F12x;
    NewInstance = 0x22, "new-instance", F21c;
    NewArray = 0x23, "new-array", F22c;
    FilledNewArray = 0x24, "filled-new-array", F35c;
    FilledNewArrayRange = 0x25, "filled-new-array/range", F3rc;
    Throw = 0x27, "throw", F11x;
    Goto = 0x28, "goto", F10t;
    Goto16 = 0x29, "goto/16", F20t;
    Goto32 = 0x2a, "goto/32", F30t;
    PackedSwitch = 0x2b, "packed-switch", F31t;
    CmplFloat = 0x2d, "cmpl-float", F23x;
    CmpgFloat = 0x2e, "cmpg-float", F23x;
    CmplDouble = 0x2f, "cmpl-double", F23x;
    CmpgDouble = 0x30, "cmpg-double", F23x;
    CmpLong = 0x31, "cmp-long", F23x;
    IfEq = 0x32, "if-eq", F22t;
    IfNe = 0x33, "if-ne", F22t;
    IfLt = 0x34, "if-lt", F22t;
    IfGe = 0x35, "if-ge", F22t;
    IfGt = 0x36, "if-gt", F22t;
    IfLe = 0x37, "if-le", F22t;
    IfEqz = 0x38, "if-eqz", F21t;
    IfNez = 0x39, "if-nez", F21t;
    IfLtz = 0x3a, "if-ltz", F21t;
    IfGez = 0x3b, "if-gez", F21t;
    IfGtz = 0x3c, "if-gtz", F21t;
    IfLez = 0x3d, "if-lez", F21t;
    Aget = 0x44, "aget", F23x;
    AgetWide = 0x45, "aget-wide", F23x;
    AgetObject = 0x46, "aget-object", F23x;
    AgetBoolean = 0x47, "aget-boolean", F23x;
    AgetByte = 0x48, "aget-byte", F23x;
    AgetChar = 0x49, "aget-char", F23x;
    AgetShort = 0x4a, "aget-short", F23x;
    Aput = 0x4b, "aput", F23x;
    AputWide = 0x4c, "aput-wide", F23x;
    AputObject = 0x4d, "aput-object", F23x;
    AputBoolean = 0x4e, "aput-boolean", F23x;
    AputByte = 0x4f, "aput-byte", F23x;
    AputChar = 0x50, "aput-char", F23x;
    AputShort = 0x51, "aput-short", F23x;
    Iget = 0x52, "iget", F22c;
    IgetWide = 0x53, "iget-wide", F22c;
    IgetObject = 0x54, "iget-object", F22c;
    IgetBoolean = 0x55, "iget-boolean", F22c;
    IgetByte = 0x56, "iget-byte", F22c;
    IgetChar = 0x57, "iget-char", F22c;
    IgetShort = 0x58, "iget-short", F22c;
    Iput = 0x59, "iput", F22c;
    IputWide = 0x5a, "iput-wide", F22c;
    IputObject = 0x5b, "iput-object", F22c;
    IputBoolean = 0x5c, "iput-boolean", F22c;
    IputByte = 0x5d, "iput-byte", F22c;
    IputChar = 0x5e, "iput-char", F22c;
    IputShort = 0x5f, "iput-short", F22c;
    Sget = 0x60, "sget", F21c;
    SgetWide = 0x61, "sget-wide", F21c;
    SgetObject = 0x62, "sget-object", F21c;
    SgetBoolean = 0x63, "sget-boolean", F21c;
    SgetByte = 0x64, "sget-byte", F21c;
    SgetChar = 0x65, "sget-char", F21c;
    SgetShort = 0x66, "sget-short", F21c;
    Sput = 0x67, "sput", F21c;
    SputWide = 0x68, "sput-wide", F21c;
    SputObject = 0x69, "sput-object", F21c;
    SputBoolean = 0x6a, "sput-boolean", F21c;
    SputByte = 0x6b, "sput-byte", F21c;
    SputChar = 0x6c, "sput-char", F21c;
    SputShort = 0x6d, "sput-short", F21c;
    InvokeVirtual = 0x6e, "invoke-virtual", F35c;
    InvokeSuper = 0x6f, "invoke-super", F35c;
    InvokeDirect = 0x70, "invoke-direct", F35c;
    InvokeStatic = 0x71, "invoke-static", F35c;
    InvokeInterface = 0x72, "invoke-interface", F35c;
    InvokeVirtualRange = 0x74, "invoke-virtual/range", F3rc;
    InvokeSuperRange = 0x75, "invoke-super/range", F3rc;
    InvokeDirectRange = 0x76, "invoke-direct/range", F3rc;
    InvokeStaticRange = 0x77, "invoke-static/range", F3rc;
    InvokeInterfaceRange = 0x78, "invoke-interface/range", F3rc;
    NegInt = 0x7b, "neg-int", F12x;
    NotInt = 0x7c, "not-int", F12x;
    NegLong = 0x7d, "neg-long", F12x;
    NotLong = 0x7e, "not-long", F12x;
    NegFloat = 0x7f, "neg-float", F12x;
    NegDouble = 0x80, "neg-double", F12x;
    IntToLong = 0x81, "int-to-long", F12x;
    IntToFloat = 0x82, "int-to-float", F12x;
    IntToDouble = 0x83, "int-to-double", F12x;
    LongToInt = 0x84, "long-to-int", F12x;
    LongToFloat = 0x85, "long-to-float", F12x;
    LongToDouble = 0x86, "long-to-double", F12x;
    FloatToInt = 0x87, "float-to-int", F12x;
    FloatToLong = 0x88, "float-to-long", F12x;
    FloatToDouble = 0x89, "float-to-double", F12x;
    DoubleToInt = 0x8a, "double-to-int", F12x;
    DoubleToLong = 0x8b, "double-to-long", F12x;
    DoubleToFloat = 0x8c, "double-to-float", F12x;
    IntToByte = 0x8d, "int-to-byte", F12x;
    IntToChar = 0x8e, "int-to-char", F12x;
    IntToShort = 0x8f, "int-to-short", F12x;
    AddInt = 0x90, "add-int", F23x;
    SubInt = 0x91, "sub-int", F23x;
    MulInt = 0x92, "mul-int", F23x;
    DivInt = 0x93, "div-int", F23x;
    RemInt = 0x94, "rem-int", F23x;
    AndInt = 0x95, "and-int", F23x;
    OrInt = 0x96, "or-int", F23x;
    XorInt = 0x97, "xor-int", F23x;
    ShlInt = 0x98, "shl-int", F23x;
    ShrInt = 0x99, "shr-int", F23x;
    UshrInt = 0x9a, "ushr-int", F23x;
    AddLong = 0x9b, "add-long", F23x;
    SubLong = 0x9c, "sub-long", F23x;
    MulLong = 0x9d, "mul-long", F23x;
    DivLong = 0x9e, "div-long", F23x;
    RemLong = 0x9f, "rem-long", F23x;
    AndLong = 0xa0, "and-long", F23x;
    OrLong = 0xa1, "or-long", F23x;
    XorLong = 0xa2, "xor-long", F23x;
    ShlLong = 0xa3, "shl-long", F23x;
    ShrLong = 0xa4, "shr-long", F23x;
    UshrLong = 0xa5, "ushr-long", F23x;
    AddFloat = 0xa6, "add-float", F23x;
    SubFloat = 0xa7, "sub-float", F23x;
    MulFloat = 0xa8, "mul-float", F23x;
    DivFloat = 0xa9, "div-float", F23x;
    RemFloat = 0xaa, "rem-float", F23x;
    AddDouble = 0xab, "add-double", F23x;
    SubDouble = 0xac, "sub-double", F23x;
    MulDouble = 0xad, "mul-double", F23x;
    DivDouble = 0xae, "div-double", F23x;
    RemDouble = 0xaf, "rem-double", F23x;
    AddIntLit16 = 0xd0, "add-int/lit16", F22s;
    RsubInt = 0xd1, "rsub-int", F22s;
    MulIntLit16 = 0xd2, "mul-int/lit16", F22s;
    AndIntLit16 = 0xd5, "and-int/lit16", F22s;
    OrIntLit16 = 0xd6, "or-int/lit16", F22s;
    XorIntLit16 = 0xd7, "xor-int/lit16", F22s;
    AddIntLit8 = 0xd8, "add-int/lit8", F22b;
    RsubIntLit8 = 0xd9, "rsub-int/lit8", F22b;
    MulIntLit8 = 0xda, "mul-int/lit8", F22b;
    AndIntLit8 = 0xdd, "and-int/lit8", F22b;
    OrIntLit8 = 0xde, "or-int/lit8", F22b;
    XorIntLit8 = 0xdf, "xor-int/lit8", F22b;
    ShlIntLit8 = 0xe0, "shl-int/lit8", F22b;
    ShrIntLit8 = 0xe1, "shr-int/lit8", F22b;
    UshrIntLit8 = 0xe2, "ushr-int/lit8", F22b;
}

/// Whether an instruction reads or writes a register operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// The canonical kind and access of one register operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterUse {
    pub kind: RegisterKind,
    pub access: Access,
}

const fn reg(kind: RegisterKind, access: Access) -> RegisterUse {
    RegisterUse { kind, access }
}

const DN: RegisterUse = reg(RegisterKind::Normal, Access::Write);
const DW: RegisterUse = reg(RegisterKind::Wide, Access::Write);
const DO: RegisterUse = reg(RegisterKind::Object, Access::Write);
const SN: RegisterUse = reg(RegisterKind::Normal, Access::Read);
const SW: RegisterUse = reg(RegisterKind::Wide, Access::Read);
const SO: RegisterUse = reg(RegisterKind::Object, Access::Read);
const UO: RegisterUse = reg(RegisterKind::Object, Access::ReadWrite);

impl Opcode {
    pub fn size(self) -> u32 {
        self.format().size()
    }

    /// Kind and access of every fixed register operand, in operand order.
    ///
    /// Invokes and `filled-new-array` take a variable register list whose kinds come from the
    /// referenced prototype, so they report an empty slice.
    pub fn register_uses(self) -> &'static [RegisterUse] {
        use Opcode::*;
        match self {
            Nop | ReturnVoid | Goto | Goto16 | Goto32 => &[],
            Move | MoveFrom16 | Move16 => &[DN, SN],
            MoveWide | MoveWideFrom16 | MoveWide16 => &[DW, SW],
            MoveObject | MoveObjectFrom16 | MoveObject16 => &[DO, SO],
            MoveResult => &[DN],
            MoveResultWide => &[DW],
            MoveResultObject | MoveException => &[DO],
            Return => &[SN],
            ReturnWide => &[SW],
            ReturnObject | MonitorEnter | MonitorExit | Throw => &[SO],
            Const4 | Const16 | Const | ConstHigh16 => &[DN],
            ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 => &[DW],
            ConstString | ConstStringJumbo | ConstClass | NewInstance => &[DO],
            CheckCast => &[UO],
            InstanceOf => &[DN, SO],
            ArrayLength => &[DN, SO],
            NewArray => &[DO, SN],
            FilledNewArray | FilledNewArrayRange => &[],
            PackedSwitch => &[SN],
            CmplFloat | CmpgFloat => &[DN, SN, SN],
            CmplDouble | CmpgDouble | CmpLong => &[DN, SW, SW],
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => &[SN, SN],
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => &[SN],
            Aget | AgetBoolean | AgetByte | AgetChar | AgetShort => &[DN, SO, SN],
            AgetWide => &[DW, SO, SN],
            AgetObject => &[DO, SO, SN],
            Aput | AputBoolean | AputByte | AputChar | AputShort => &[SN, SO, SN],
            AputWide => &[SW, SO, SN],
            AputObject => &[SO, SO, SN],
            Iget | IgetBoolean | IgetByte | IgetChar | IgetShort => &[DN, SO],
            IgetWide => &[DW, SO],
            IgetObject => &[DO, SO],
            Iput | IputBoolean | IputByte | IputChar | IputShort => &[SN, SO],
            IputWide => &[SW, SO],
            IputObject => &[SO, SO],
            Sget | SgetBoolean | SgetByte | SgetChar | SgetShort => &[DN],
            SgetWide => &[DW],
            SgetObject => &[DO],
            Sput | SputBoolean | SputByte | SputChar | SputShort => &[SN],
            SputWide => &[SW],
            SputObject => &[SO],
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface
            | InvokeVirtualRange | InvokeSuperRange | InvokeDirectRange | InvokeStaticRange
            | InvokeInterfaceRange => &[],
            NegInt | NotInt | NegFloat | IntToFloat | FloatToInt | IntToByte | IntToChar
            | IntToShort => &[DN, SN],
            NegLong | NotLong | NegDouble | LongToDouble | DoubleToLong => &[DW, SW],
            IntToLong | IntToDouble | FloatToLong | FloatToDouble => &[DW, SN],
            LongToInt | LongToFloat | DoubleToInt | DoubleToFloat => &[DN, SW],
            AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt
            | ShrInt | UshrInt | AddFloat | SubFloat | MulFloat | DivFloat | RemFloat => {
                &[DN, SN, SN]
            }
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong
            | AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => &[DW, SW, SW],
            ShlLong | ShrLong | UshrLong => &[DW, SW, SN],
            AddIntLit16 | RsubInt | MulIntLit16 | AndIntLit16 | OrIntLit16 | XorIntLit16
            | AddIntLit8 | RsubIntLit8 | MulIntLit8 | AndIntLit8 | OrIntLit8 | XorIntLit8
            | ShlIntLit8 | ShrIntLit8 | UshrIntLit8 => &[DN, SN],
        }
    }

    pub fn is_goto(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::Goto16 | Opcode::Goto32)
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(self.format(), Format::F21t | Format::F22t)
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::ReturnVoid | Opcode::Return | Opcode::ReturnWide | Opcode::ReturnObject
        )
    }

    /// Control never falls through to the next instruction
    pub fn ends_flow(self) -> bool {
        self.is_return() || self.is_goto() || self == Opcode::Throw
    }

    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            Opcode::InvokeVirtual
                | Opcode::InvokeSuper
                | Opcode::InvokeDirect
                | Opcode::InvokeStatic
                | Opcode::InvokeInterface
        ) || self.is_invoke_range()
    }

    pub fn is_invoke_range(self) -> bool {
        matches!(
            self,
            Opcode::InvokeVirtualRange
                | Opcode::InvokeSuperRange
                | Opcode::InvokeDirectRange
                | Opcode::InvokeStaticRange
                | Opcode::InvokeInterfaceRange
        )
    }

    /// Invokes that pass an implicit receiver in the first register
    pub fn has_receiver(self) -> bool {
        self.is_invoke() && !matches!(self, Opcode::InvokeStatic | Opcode::InvokeStaticRange)
    }

    /// The `/range` counterpart of a fixed register invoke
    pub fn to_range(self) -> Opcode {
        match self {
            Opcode::InvokeVirtual => Opcode::InvokeVirtualRange,
            Opcode::InvokeSuper => Opcode::InvokeSuperRange,
            Opcode::InvokeDirect => Opcode::InvokeDirectRange,
            Opcode::InvokeStatic => Opcode::InvokeStaticRange,
            Opcode::InvokeInterface => Opcode::InvokeInterfaceRange,
            Opcode::FilledNewArray => Opcode::FilledNewArrayRange,
            other => other,
        }
    }

    /// The move family member for a register kind, widest form
    pub fn move_for(kind: RegisterKind) -> Opcode {
        match kind {
            RegisterKind::Normal => Opcode::Move16,
            RegisterKind::Wide => Opcode::MoveWide16,
            RegisterKind::Object => Opcode::MoveObject16,
        }
    }

    pub fn is_move(self) -> bool {
        matches!(
            self,
            Opcode::Move
                | Opcode::MoveFrom16
                | Opcode::Move16
                | Opcode::MoveWide
                | Opcode::MoveWideFrom16
                | Opcode::MoveWide16
                | Opcode::MoveObject
                | Opcode::MoveObjectFrom16
                | Opcode::MoveObject16
        )
    }

    pub fn is_const(self) -> bool {
        matches!(
            self,
            Opcode::Const4 | Opcode::Const16 | Opcode::Const | Opcode::ConstHigh16
        )
    }

    pub fn is_const_wide(self) -> bool {
        matches!(
            self,
            Opcode::ConstWide16 | Opcode::ConstWide32 | Opcode::ConstWide | Opcode::ConstWideHigh16
        )
    }

    pub fn move_result_for(kind: RegisterKind) -> Opcode {
        match kind {
            RegisterKind::Normal => Opcode::MoveResult,
            RegisterKind::Wide => Opcode::MoveResultWide,
            RegisterKind::Object => Opcode::MoveResultObject,
        }
    }

    pub fn return_for(kind: Option<RegisterKind>) -> Opcode {
        match kind {
            None => Opcode::ReturnVoid,
            Some(RegisterKind::Normal) => Opcode::Return,
            Some(RegisterKind::Wide) => Opcode::ReturnWide,
            Some(RegisterKind::Object) => Opcode::ReturnObject,
        }
    }

    /// The opposite condition of a conditional branch
    pub fn negate(self) -> Option<Opcode> {
        let negated = match self {
            Opcode::IfEq => Opcode::IfNe,
            Opcode::IfNe => Opcode::IfEq,
            Opcode::IfLt => Opcode::IfGe,
            Opcode::IfGe => Opcode::IfLt,
            Opcode::IfGt => Opcode::IfLe,
            Opcode::IfLe => Opcode::IfGt,
            Opcode::IfEqz => Opcode::IfNez,
            Opcode::IfNez => Opcode::IfEqz,
            Opcode::IfLtz => Opcode::IfGez,
            Opcode::IfGez => Opcode::IfLtz,
            Opcode::IfGtz => Opcode::IfLez,
            Opcode::IfLez => Opcode::IfGtz,
            _ => return None,
        };
        Some(negated)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
