// File: src/opcode.rs
//
// Opcode definitions and the version-aware instruction dispatcher.
// Raw bytecode is a stream of numeric opcodes whose meaning moved around
// between releases; the dispatcher maps each number through a per-version
// table to a canonical opcode, decodes its operand, and normalizes jump
// targets to byte offsets so the engine never sees version quirks.
//
// Operand encoding:
// - before 3.6: one opcode byte, plus a little-endian u16 operand for
//   opcodes at or above the have-argument threshold; EXTENDED_ARG
//   supplies the high 16 bits
// - 3.6 and later: fixed two-byte "wordcode" (opcode, operand byte);
//   EXTENDED_ARG shifts accumulated bits left by eight
// - 3.10 and later: jump operands count instruction words, not bytes

use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::fmt;

use crate::code::CodeObject;
use crate::errors::{BytePos, DecompileError, Result};
use crate::version::PythonVersion;

/// Version-independent instruction names.
///
/// One canonical opcode collapses every renumbering of the same action;
/// actions that exist in only one version family (py2 print statements,
/// 3.11 PRECALL) still get their own entry so handlers stay simple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === Stack manipulation ===
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    RotN,
    DupTop,
    DupTopTwo,
    DupTopX,
    Copy,
    Swap,

    // === No-ops and interpreter bookkeeping ===
    Nop,
    StopCode,
    Cache,
    Resume,
    Precall,
    PushNull,
    ExtendedArg,
    MakeCell,
    CopyFreeVars,
    GenStart,

    // === Unary operators ===
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryConvert,
    UnaryInvert,

    // === Binary and in-place operators ===
    BinaryPower,
    BinaryMultiply,
    BinaryMatrixMultiply,
    BinaryDivide,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    BinarySubscr,
    /// 3.11+ unified operator with a numeric sub-opcode operand.
    BinaryOp,
    InplacePower,
    InplaceMultiply,
    InplaceMatrixMultiply,
    InplaceDivide,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,

    // === Comparison ===
    CompareOp,
    IsOp,
    ContainsOp,

    // === Legacy whole-object slicing (py2) ===
    Slice0,
    Slice1,
    Slice2,
    Slice3,
    StoreSlice0,
    StoreSlice1,
    StoreSlice2,
    StoreSlice3,
    DeleteSlice0,
    DeleteSlice1,
    DeleteSlice2,
    DeleteSlice3,
    /// 3.12 two-operand slice load / store.
    BinarySlice,
    StoreSliceOp,

    // === Loads ===
    LoadConst,
    LoadName,
    LoadGlobal,
    LoadFast,
    LoadFastCheck,
    LoadFastAndClear,
    LoadDeref,
    LoadClassDeref,
    LoadClosure,
    LoadAttr,
    LoadMethod,
    LoadSuperAttr,
    LoadLocals,
    LoadBuildClass,
    LoadAssertionError,

    // === Stores and deletes ===
    StoreName,
    StoreFast,
    StoreGlobal,
    StoreDeref,
    StoreAttr,
    StoreSubscr,
    StoreMap,
    StoreAnnotation,
    SetupAnnotations,
    DeleteName,
    DeleteFast,
    DeleteGlobal,
    DeleteDeref,
    DeleteAttr,
    DeleteSubscr,

    // === Container construction ===
    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    BuildConstKeyMap,
    BuildString,
    BuildSlice,
    FormatValue,
    ListAppend,
    SetAdd,
    MapAdd,
    ListExtend,
    SetUpdate,
    DictMerge,
    DictUpdate,
    ListToTuple,
    UnpackSequence,
    UnpackEx,

    // === Calls and function construction ===
    CallFunction,
    CallFunctionVar,
    CallFunctionKw,
    CallFunctionVarKw,
    CallFunctionEx,
    Call,
    CallMethod,
    CallIntrinsic1,
    CallIntrinsic2,
    KwNames,
    MakeFunction,
    MakeClosure,

    // === Jumps ===
    JumpForward,
    JumpAbsolute,
    JumpBackward,
    JumpBackwardNoInterrupt,
    /// Pre-2.7/3.0 conditional jumps that leave the condition on the stack.
    JumpIfFalse,
    JumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    PopJumpBackIfFalse,
    PopJumpBackIfTrue,
    PopJumpBackIfNone,
    PopJumpBackIfNotNone,
    JumpIfNotExcMatch,

    // === Iteration and block management ===
    GetIter,
    GetYieldFromIter,
    ForIter,
    ForLoop,
    SetupLoop,
    SetupExcept,
    SetupFinally,
    SetupWith,
    BeforeWith,
    PopBlock,
    PopExcept,
    EndFinally,
    BeginFinally,
    CallFinally,
    PopFinally,
    WithCleanup,
    WithCleanupStart,
    WithCleanupFinish,
    WithExceptStart,
    BreakLoop,
    ContinueLoop,
    EndFor,
    EndSend,
    Reraise,
    PushExcInfo,
    CheckExcMatch,

    // === Imports ===
    ImportName,
    ImportFrom,
    ImportStar,

    // === Returns, yields, awaits ===
    ReturnValue,
    ReturnConst,
    ReturnGenerator,
    YieldValue,
    YieldFrom,
    GetAwaitable,
    Send,

    // === py2 statements ===
    PrintExpr,
    PrintItem,
    PrintNewline,
    PrintItemTo,
    PrintNewlineTo,
    ExecStmt,
    BuildClass,

    // === Exceptions ===
    RaiseVarargs,

    // === Structural pattern matching (3.10+) ===
    GetLen,
    MatchMapping,
    MatchSequence,
    MatchKeys,
    MatchClass,
}

/// How an opcode's operand is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    None,
    HasName,
    HasConst,
    HasLocal,
    HasFree,
    HasJrel,
    HasJabs,
    HasCompare,
    HasArgUint,
    /// Two sub-fields packed into low/high bytes (pre-3.6 call encodings).
    HasArgPacked,
}

impl Opcode {
    /// Operand class, gated on version where the same canonical opcode
    /// changed encoding (conditional jumps went absolute in 3.1 and
    /// relative again in 3.11; CALL_FUNCTION lost its packed operand in
    /// 3.6).
    pub fn operand_class(self, version: PythonVersion) -> OperandClass {
        use Opcode::*;
        match self {
            LoadConst | ReturnConst | KwNames => OperandClass::HasConst,

            LoadName | StoreName | DeleteName | LoadGlobal | StoreGlobal | DeleteGlobal
            | LoadAttr | StoreAttr | DeleteAttr | ImportName | ImportFrom | LoadMethod
            | LoadSuperAttr => OperandClass::HasName,

            LoadFast | StoreFast | DeleteFast | LoadFastCheck | LoadFastAndClear => {
                OperandClass::HasLocal
            }

            LoadDeref | StoreDeref | DeleteDeref | LoadClosure | LoadClassDeref | MakeCell => {
                OperandClass::HasFree
            }

            JumpForward | ForIter | ForLoop | SetupLoop | SetupExcept | SetupFinally
            | SetupWith | JumpBackward | JumpBackwardNoInterrupt | PopJumpBackIfFalse
            | PopJumpBackIfTrue | PopJumpBackIfNone | PopJumpBackIfNotNone | Send
            | CallFinally => OperandClass::HasJrel,

            JumpAbsolute | ContinueLoop | JumpIfNotExcMatch => OperandClass::HasJabs,

            JumpIfFalse | JumpIfTrue => OperandClass::HasJrel,

            PopJumpIfFalse | PopJumpIfTrue | PopJumpIfNone | PopJumpIfNotNone => {
                if version >= PythonVersion::new(3, 11) {
                    OperandClass::HasJrel
                } else {
                    OperandClass::HasJabs
                }
            }

            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                if version >= PythonVersion::new(3, 11) {
                    OperandClass::HasJrel
                } else {
                    OperandClass::HasJabs
                }
            }

            CompareOp => OperandClass::HasCompare,

            CallFunction | CallFunctionVar | CallFunctionKw | CallFunctionVarKw => {
                if version.uses_wordcode() {
                    OperandClass::HasArgUint
                } else {
                    OperandClass::HasArgPacked
                }
            }

            RaiseVarargs | BuildTuple | BuildList | BuildSet | BuildMap | BuildConstKeyMap
            | BuildString | BuildSlice | FormatValue | ListAppend | SetAdd | MapAdd
            | ListExtend | SetUpdate | DictMerge | DictUpdate | UnpackSequence | UnpackEx
            | MakeFunction | MakeClosure | CallFunctionEx | Call | CallMethod
            | CallIntrinsic1 | CallIntrinsic2 | Precall | BinaryOp | IsOp | ContainsOp
            | Copy | Swap | RotN | DupTopX | Resume | GenStart | Reraise | MatchClass
            | StoreAnnotation | ExtendedArg => OperandClass::HasArgUint,

            _ => OperandClass::None,
        }
    }

    /// Jumps whose operand counts backwards from the following instruction.
    fn jumps_backward(self) -> bool {
        matches!(
            self,
            Opcode::JumpBackward
                | Opcode::JumpBackwardNoInterrupt
                | Opcode::PopJumpBackIfFalse
                | Opcode::PopJumpBackIfTrue
                | Opcode::PopJumpBackIfNone
                | Opcode::PopJumpBackIfNotNone
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

type Table = AHashMap<u8, Opcode>;

fn build(rows: &[(u8, Opcode)], extra: &[(u8, Opcode)]) -> Table {
    let mut table = Table::with_capacity(rows.len() + extra.len());
    for &(num, op) in rows.iter().chain(extra) {
        table.insert(num, op);
    }
    table
}

/// Numbering shared by 1.x and 2.x up to 2.6.
const PY2_BASE: &[(u8, Opcode)] = &[
    (0, Opcode::StopCode),
    (1, Opcode::PopTop),
    (2, Opcode::RotTwo),
    (3, Opcode::RotThree),
    (4, Opcode::DupTop),
    (5, Opcode::RotFour),
    (9, Opcode::Nop),
    (10, Opcode::UnaryPositive),
    (11, Opcode::UnaryNegative),
    (12, Opcode::UnaryNot),
    (13, Opcode::UnaryConvert),
    (15, Opcode::UnaryInvert),
    (18, Opcode::ListAppend),
    (19, Opcode::BinaryPower),
    (20, Opcode::BinaryMultiply),
    (21, Opcode::BinaryDivide),
    (22, Opcode::BinaryModulo),
    (23, Opcode::BinaryAdd),
    (24, Opcode::BinarySubtract),
    (25, Opcode::BinarySubscr),
    (26, Opcode::BinaryFloorDivide),
    (27, Opcode::BinaryTrueDivide),
    (28, Opcode::InplaceFloorDivide),
    (29, Opcode::InplaceTrueDivide),
    (30, Opcode::Slice0),
    (31, Opcode::Slice1),
    (32, Opcode::Slice2),
    (33, Opcode::Slice3),
    (40, Opcode::StoreSlice0),
    (41, Opcode::StoreSlice1),
    (42, Opcode::StoreSlice2),
    (43, Opcode::StoreSlice3),
    (50, Opcode::DeleteSlice0),
    (51, Opcode::DeleteSlice1),
    (52, Opcode::DeleteSlice2),
    (53, Opcode::DeleteSlice3),
    (54, Opcode::StoreMap),
    (55, Opcode::InplaceAdd),
    (56, Opcode::InplaceSubtract),
    (57, Opcode::InplaceMultiply),
    (58, Opcode::InplaceDivide),
    (59, Opcode::InplaceModulo),
    (60, Opcode::StoreSubscr),
    (61, Opcode::DeleteSubscr),
    (62, Opcode::BinaryLshift),
    (63, Opcode::BinaryRshift),
    (64, Opcode::BinaryAnd),
    (65, Opcode::BinaryXor),
    (66, Opcode::BinaryOr),
    (67, Opcode::InplacePower),
    (68, Opcode::GetIter),
    (70, Opcode::PrintExpr),
    (71, Opcode::PrintItem),
    (72, Opcode::PrintNewline),
    (73, Opcode::PrintItemTo),
    (74, Opcode::PrintNewlineTo),
    (75, Opcode::InplaceLshift),
    (76, Opcode::InplaceRshift),
    (77, Opcode::InplaceAnd),
    (78, Opcode::InplaceXor),
    (79, Opcode::InplaceOr),
    (80, Opcode::BreakLoop),
    (81, Opcode::WithCleanup),
    (82, Opcode::LoadLocals),
    (83, Opcode::ReturnValue),
    (84, Opcode::ImportStar),
    (85, Opcode::ExecStmt),
    (86, Opcode::YieldValue),
    (87, Opcode::PopBlock),
    (88, Opcode::EndFinally),
    (89, Opcode::BuildClass),
    (90, Opcode::StoreName),
    (91, Opcode::DeleteName),
    (92, Opcode::UnpackSequence),
    (93, Opcode::ForIter),
    (94, Opcode::ListAppend),
    (95, Opcode::StoreAttr),
    (96, Opcode::DeleteAttr),
    (97, Opcode::StoreGlobal),
    (98, Opcode::DeleteGlobal),
    (99, Opcode::DupTopX),
    (100, Opcode::LoadConst),
    (101, Opcode::LoadName),
    (102, Opcode::BuildTuple),
    (103, Opcode::BuildList),
    (105, Opcode::BuildMap),
    (106, Opcode::LoadAttr),
    (107, Opcode::CompareOp),
    (108, Opcode::ImportName),
    (109, Opcode::ImportFrom),
    (110, Opcode::JumpForward),
    (111, Opcode::JumpIfFalse),
    (112, Opcode::JumpIfTrue),
    (113, Opcode::JumpAbsolute),
    (114, Opcode::ForLoop),
    (116, Opcode::LoadGlobal),
    (119, Opcode::ContinueLoop),
    (120, Opcode::SetupLoop),
    (121, Opcode::SetupExcept),
    (122, Opcode::SetupFinally),
    (124, Opcode::LoadFast),
    (125, Opcode::StoreFast),
    (126, Opcode::DeleteFast),
    (130, Opcode::RaiseVarargs),
    (131, Opcode::CallFunction),
    (132, Opcode::MakeFunction),
    (133, Opcode::BuildSlice),
    (134, Opcode::MakeClosure),
    (135, Opcode::LoadClosure),
    (136, Opcode::LoadDeref),
    (137, Opcode::StoreDeref),
    (140, Opcode::CallFunctionVar),
    (141, Opcode::CallFunctionKw),
    (142, Opcode::CallFunctionVarKw),
    (143, Opcode::ExtendedArg),
];

/// 2.7 reshuffled the conditional jumps and grew set/dict builders.
const PY27_EXTRA: &[(u8, Opcode)] = &[
    (94, Opcode::ListAppend),
    (104, Opcode::BuildSet),
    (111, Opcode::JumpIfFalseOrPop),
    (112, Opcode::JumpIfTrueOrPop),
    (114, Opcode::PopJumpIfFalse),
    (115, Opcode::PopJumpIfTrue),
    (143, Opcode::SetupWith),
    (145, Opcode::ExtendedArg),
    (146, Opcode::SetAdd),
    (147, Opcode::MapAdd),
];

/// Numbering shared by 3.0 through 3.10 where it stayed stable.
const PY3_BASE: &[(u8, Opcode)] = &[
    (1, Opcode::PopTop),
    (2, Opcode::RotTwo),
    (3, Opcode::RotThree),
    (4, Opcode::DupTop),
    (5, Opcode::DupTopTwo),
    (9, Opcode::Nop),
    (10, Opcode::UnaryPositive),
    (11, Opcode::UnaryNegative),
    (12, Opcode::UnaryNot),
    (15, Opcode::UnaryInvert),
    (19, Opcode::BinaryPower),
    (20, Opcode::BinaryMultiply),
    (22, Opcode::BinaryModulo),
    (23, Opcode::BinaryAdd),
    (24, Opcode::BinarySubtract),
    (25, Opcode::BinarySubscr),
    (26, Opcode::BinaryFloorDivide),
    (27, Opcode::BinaryTrueDivide),
    (28, Opcode::InplaceFloorDivide),
    (29, Opcode::InplaceTrueDivide),
    (55, Opcode::InplaceAdd),
    (56, Opcode::InplaceSubtract),
    (57, Opcode::InplaceMultiply),
    (59, Opcode::InplaceModulo),
    (60, Opcode::StoreSubscr),
    (61, Opcode::DeleteSubscr),
    (62, Opcode::BinaryLshift),
    (63, Opcode::BinaryRshift),
    (64, Opcode::BinaryAnd),
    (65, Opcode::BinaryXor),
    (66, Opcode::BinaryOr),
    (67, Opcode::InplacePower),
    (68, Opcode::GetIter),
    (70, Opcode::PrintExpr),
    (71, Opcode::LoadBuildClass),
    (75, Opcode::InplaceLshift),
    (76, Opcode::InplaceRshift),
    (77, Opcode::InplaceAnd),
    (78, Opcode::InplaceXor),
    (79, Opcode::InplaceOr),
    (83, Opcode::ReturnValue),
    (84, Opcode::ImportStar),
    (86, Opcode::YieldValue),
    (89, Opcode::PopExcept),
    (90, Opcode::StoreName),
    (91, Opcode::DeleteName),
    (92, Opcode::UnpackSequence),
    (93, Opcode::ForIter),
    (94, Opcode::UnpackEx),
    (95, Opcode::StoreAttr),
    (96, Opcode::DeleteAttr),
    (97, Opcode::StoreGlobal),
    (98, Opcode::DeleteGlobal),
    (100, Opcode::LoadConst),
    (101, Opcode::LoadName),
    (102, Opcode::BuildTuple),
    (103, Opcode::BuildList),
    (104, Opcode::BuildSet),
    (105, Opcode::BuildMap),
    (106, Opcode::LoadAttr),
    (107, Opcode::CompareOp),
    (108, Opcode::ImportName),
    (109, Opcode::ImportFrom),
    (110, Opcode::JumpForward),
    (111, Opcode::JumpIfFalseOrPop),
    (112, Opcode::JumpIfTrueOrPop),
    (113, Opcode::JumpAbsolute),
    (114, Opcode::PopJumpIfFalse),
    (115, Opcode::PopJumpIfTrue),
    (116, Opcode::LoadGlobal),
    (122, Opcode::SetupFinally),
    (124, Opcode::LoadFast),
    (125, Opcode::StoreFast),
    (126, Opcode::DeleteFast),
    (130, Opcode::RaiseVarargs),
    (131, Opcode::CallFunction),
    (132, Opcode::MakeFunction),
    (133, Opcode::BuildSlice),
    (135, Opcode::LoadClosure),
    (136, Opcode::LoadDeref),
    (137, Opcode::StoreDeref),
    (138, Opcode::DeleteDeref),
    (144, Opcode::ExtendedArg),
    (145, Opcode::ListAppend),
    (146, Opcode::SetAdd),
    (147, Opcode::MapAdd),
];

/// 3.0 - 3.5: loop blocks, packed call operands, py2-style with cleanup.
const PY30_35_EXTRA: &[(u8, Opcode)] = &[
    (16, Opcode::BinaryMatrixMultiply),
    (17, Opcode::InplaceMatrixMultiply),
    (50, Opcode::GetAwaitable),
    (54, Opcode::StoreMap),
    (69, Opcode::GetYieldFromIter),
    (72, Opcode::YieldFrom),
    (81, Opcode::WithCleanupStart),
    (82, Opcode::WithCleanupFinish),
    (87, Opcode::PopBlock),
    (88, Opcode::EndFinally),
    (119, Opcode::ContinueLoop),
    (120, Opcode::SetupLoop),
    (121, Opcode::SetupExcept),
    (80, Opcode::BreakLoop),
    (134, Opcode::MakeClosure),
    (140, Opcode::CallFunctionVar),
    (141, Opcode::CallFunctionKw),
    (142, Opcode::CallFunctionVarKw),
    (143, Opcode::SetupWith),
    (148, Opcode::LoadClassDeref),
];

/// 3.6 - 3.7: wordcode, f-strings, method calls, annotations.
const PY36_37_EXTRA: &[(u8, Opcode)] = &[
    (16, Opcode::BinaryMatrixMultiply),
    (17, Opcode::InplaceMatrixMultiply),
    (50, Opcode::GetAwaitable),
    (69, Opcode::GetYieldFromIter),
    (72, Opcode::YieldFrom),
    (81, Opcode::WithCleanupStart),
    (82, Opcode::WithCleanupFinish),
    (85, Opcode::SetupAnnotations),
    (87, Opcode::PopBlock),
    (88, Opcode::EndFinally),
    (119, Opcode::ContinueLoop),
    (120, Opcode::SetupLoop),
    (121, Opcode::SetupExcept),
    (80, Opcode::BreakLoop),
    (127, Opcode::StoreAnnotation),
    (141, Opcode::CallFunctionKw),
    (142, Opcode::CallFunctionEx),
    (143, Opcode::SetupWith),
    (148, Opcode::LoadClassDeref),
    (155, Opcode::FormatValue),
    (156, Opcode::BuildConstKeyMap),
    (157, Opcode::BuildString),
    (160, Opcode::LoadMethod),
    (161, Opcode::CallMethod),
];

/// 3.8: static try/finally (no SETUP_LOOP family), BEGIN/CALL/POP_FINALLY.
const PY38_EXTRA: &[(u8, Opcode)] = &[
    (6, Opcode::RotFour),
    (16, Opcode::BinaryMatrixMultiply),
    (17, Opcode::InplaceMatrixMultiply),
    (53, Opcode::BeginFinally),
    (69, Opcode::GetYieldFromIter),
    (72, Opcode::YieldFrom),
    (73, Opcode::GetAwaitable),
    (81, Opcode::WithCleanupStart),
    (82, Opcode::WithCleanupFinish),
    (85, Opcode::SetupAnnotations),
    (87, Opcode::PopBlock),
    (88, Opcode::EndFinally),
    (141, Opcode::CallFunctionKw),
    (142, Opcode::CallFunctionEx),
    (143, Opcode::SetupWith),
    (148, Opcode::LoadClassDeref),
    (155, Opcode::FormatValue),
    (156, Opcode::BuildConstKeyMap),
    (157, Opcode::BuildString),
    (160, Opcode::LoadMethod),
    (161, Opcode::CallMethod),
    (162, Opcode::CallFinally),
    (163, Opcode::PopFinally),
];

/// 3.9 - 3.10: RERAISE, IS_OP/CONTAINS_OP, collection extend/merge ops.
const PY39_310_EXTRA: &[(u8, Opcode)] = &[
    (6, Opcode::RotFour),
    (16, Opcode::BinaryMatrixMultiply),
    (17, Opcode::InplaceMatrixMultiply),
    (30, Opcode::GetLen),
    (31, Opcode::MatchMapping),
    (32, Opcode::MatchSequence),
    (33, Opcode::MatchKeys),
    (48, Opcode::Reraise),
    (49, Opcode::WithExceptStart),
    (69, Opcode::GetYieldFromIter),
    (72, Opcode::YieldFrom),
    (73, Opcode::GetAwaitable),
    (74, Opcode::LoadAssertionError),
    (82, Opcode::ListToTuple),
    (85, Opcode::SetupAnnotations),
    (87, Opcode::PopBlock),
    (99, Opcode::RotN),
    (117, Opcode::IsOp),
    (118, Opcode::ContainsOp),
    (121, Opcode::JumpIfNotExcMatch),
    (129, Opcode::GenStart),
    (141, Opcode::CallFunctionKw),
    (142, Opcode::CallFunctionEx),
    (143, Opcode::SetupWith),
    (148, Opcode::LoadClassDeref),
    (152, Opcode::MatchClass),
    (155, Opcode::FormatValue),
    (156, Opcode::BuildConstKeyMap),
    (157, Opcode::BuildString),
    (160, Opcode::LoadMethod),
    (161, Opcode::CallMethod),
    (162, Opcode::ListExtend),
    (163, Opcode::SetUpdate),
    (164, Opcode::DictMerge),
    (165, Opcode::DictUpdate),
];

/// 3.11: adaptive interpreter plumbing and relative-only jumps.
const PY311: &[(u8, Opcode)] = &[
    (0, Opcode::Cache),
    (1, Opcode::PopTop),
    (2, Opcode::PushNull),
    (9, Opcode::Nop),
    (10, Opcode::UnaryPositive),
    (11, Opcode::UnaryNegative),
    (12, Opcode::UnaryNot),
    (15, Opcode::UnaryInvert),
    (25, Opcode::BinarySubscr),
    (30, Opcode::GetLen),
    (31, Opcode::MatchMapping),
    (32, Opcode::MatchSequence),
    (33, Opcode::MatchKeys),
    (35, Opcode::PushExcInfo),
    (36, Opcode::CheckExcMatch),
    (49, Opcode::WithExceptStart),
    (53, Opcode::BeforeWith),
    (60, Opcode::StoreSubscr),
    (61, Opcode::DeleteSubscr),
    (68, Opcode::GetIter),
    (69, Opcode::GetYieldFromIter),
    (70, Opcode::PrintExpr),
    (71, Opcode::LoadBuildClass),
    (74, Opcode::LoadAssertionError),
    (75, Opcode::ReturnGenerator),
    (82, Opcode::ListToTuple),
    (83, Opcode::ReturnValue),
    (84, Opcode::ImportStar),
    (85, Opcode::SetupAnnotations),
    (86, Opcode::YieldValue),
    (89, Opcode::PopExcept),
    (90, Opcode::StoreName),
    (91, Opcode::DeleteName),
    (92, Opcode::UnpackSequence),
    (93, Opcode::ForIter),
    (94, Opcode::UnpackEx),
    (95, Opcode::StoreAttr),
    (96, Opcode::DeleteAttr),
    (97, Opcode::StoreGlobal),
    (98, Opcode::DeleteGlobal),
    (99, Opcode::Swap),
    (100, Opcode::LoadConst),
    (101, Opcode::LoadName),
    (102, Opcode::BuildTuple),
    (103, Opcode::BuildList),
    (104, Opcode::BuildSet),
    (105, Opcode::BuildMap),
    (106, Opcode::LoadAttr),
    (107, Opcode::CompareOp),
    (108, Opcode::ImportName),
    (109, Opcode::ImportFrom),
    (110, Opcode::JumpForward),
    (111, Opcode::JumpIfFalseOrPop),
    (112, Opcode::JumpIfTrueOrPop),
    (114, Opcode::PopJumpIfFalse),
    (115, Opcode::PopJumpIfTrue),
    (116, Opcode::LoadGlobal),
    (117, Opcode::IsOp),
    (118, Opcode::ContainsOp),
    (119, Opcode::Reraise),
    (120, Opcode::Copy),
    (122, Opcode::BinaryOp),
    (123, Opcode::Send),
    (124, Opcode::LoadFast),
    (125, Opcode::StoreFast),
    (126, Opcode::DeleteFast),
    (128, Opcode::PopJumpIfNotNone),
    (129, Opcode::PopJumpIfNone),
    (130, Opcode::RaiseVarargs),
    (131, Opcode::GetAwaitable),
    (132, Opcode::MakeFunction),
    (133, Opcode::BuildSlice),
    (134, Opcode::JumpBackwardNoInterrupt),
    (135, Opcode::MakeCell),
    (136, Opcode::LoadClosure),
    (137, Opcode::LoadDeref),
    (138, Opcode::StoreDeref),
    (139, Opcode::DeleteDeref),
    (140, Opcode::JumpBackward),
    (142, Opcode::CallFunctionEx),
    (144, Opcode::ExtendedArg),
    (145, Opcode::ListAppend),
    (146, Opcode::SetAdd),
    (147, Opcode::MapAdd),
    (148, Opcode::LoadClassDeref),
    (149, Opcode::CopyFreeVars),
    (151, Opcode::Resume),
    (152, Opcode::MatchClass),
    (155, Opcode::FormatValue),
    (156, Opcode::BuildConstKeyMap),
    (157, Opcode::BuildString),
    (160, Opcode::LoadMethod),
    (162, Opcode::ListExtend),
    (163, Opcode::SetUpdate),
    (164, Opcode::DictMerge),
    (165, Opcode::DictUpdate),
    (166, Opcode::Precall),
    (171, Opcode::Call),
    (172, Opcode::KwNames),
    (173, Opcode::PopJumpBackIfNotNone),
    (174, Opcode::PopJumpBackIfNone),
    (175, Opcode::PopJumpBackIfFalse),
    (176, Opcode::PopJumpBackIfTrue),
];

/// 3.12: RETURN_CONST, two-operand slices, intrinsics.
const PY312: &[(u8, Opcode)] = &[
    (0, Opcode::Cache),
    (1, Opcode::PopTop),
    (2, Opcode::PushNull),
    (4, Opcode::EndFor),
    (5, Opcode::EndSend),
    (9, Opcode::Nop),
    (11, Opcode::UnaryNegative),
    (12, Opcode::UnaryNot),
    (15, Opcode::UnaryInvert),
    (25, Opcode::BinarySubscr),
    (26, Opcode::BinarySlice),
    (27, Opcode::StoreSliceOp),
    (30, Opcode::GetLen),
    (31, Opcode::MatchMapping),
    (32, Opcode::MatchSequence),
    (33, Opcode::MatchKeys),
    (35, Opcode::PushExcInfo),
    (36, Opcode::CheckExcMatch),
    (49, Opcode::WithExceptStart),
    (53, Opcode::BeforeWith),
    (60, Opcode::StoreSubscr),
    (61, Opcode::DeleteSubscr),
    (68, Opcode::GetIter),
    (69, Opcode::GetYieldFromIter),
    (71, Opcode::LoadBuildClass),
    (74, Opcode::LoadAssertionError),
    (75, Opcode::ReturnGenerator),
    (83, Opcode::ReturnValue),
    (85, Opcode::SetupAnnotations),
    (87, Opcode::LoadLocals),
    (89, Opcode::PopExcept),
    (90, Opcode::StoreName),
    (91, Opcode::DeleteName),
    (92, Opcode::UnpackSequence),
    (93, Opcode::ForIter),
    (94, Opcode::UnpackEx),
    (95, Opcode::StoreAttr),
    (96, Opcode::DeleteAttr),
    (97, Opcode::StoreGlobal),
    (98, Opcode::DeleteGlobal),
    (99, Opcode::Swap),
    (100, Opcode::LoadConst),
    (101, Opcode::LoadName),
    (102, Opcode::BuildTuple),
    (103, Opcode::BuildList),
    (104, Opcode::BuildSet),
    (105, Opcode::BuildMap),
    (106, Opcode::LoadAttr),
    (107, Opcode::CompareOp),
    (108, Opcode::ImportName),
    (109, Opcode::ImportFrom),
    (110, Opcode::JumpForward),
    (114, Opcode::PopJumpIfFalse),
    (115, Opcode::PopJumpIfTrue),
    (116, Opcode::LoadGlobal),
    (117, Opcode::IsOp),
    (118, Opcode::ContainsOp),
    (119, Opcode::Reraise),
    (120, Opcode::Copy),
    (121, Opcode::ReturnConst),
    (122, Opcode::BinaryOp),
    (123, Opcode::Send),
    (124, Opcode::LoadFast),
    (125, Opcode::StoreFast),
    (126, Opcode::DeleteFast),
    (127, Opcode::LoadFastCheck),
    (128, Opcode::PopJumpIfNotNone),
    (129, Opcode::PopJumpIfNone),
    (130, Opcode::RaiseVarargs),
    (131, Opcode::GetAwaitable),
    (132, Opcode::MakeFunction),
    (133, Opcode::BuildSlice),
    (134, Opcode::JumpBackwardNoInterrupt),
    (135, Opcode::MakeCell),
    (136, Opcode::LoadClosure),
    (137, Opcode::LoadDeref),
    (138, Opcode::StoreDeref),
    (139, Opcode::DeleteDeref),
    (140, Opcode::JumpBackward),
    (141, Opcode::LoadSuperAttr),
    (142, Opcode::CallFunctionEx),
    (143, Opcode::LoadFastAndClear),
    (144, Opcode::ExtendedArg),
    (145, Opcode::ListAppend),
    (146, Opcode::SetAdd),
    (147, Opcode::MapAdd),
    (149, Opcode::CopyFreeVars),
    (150, Opcode::YieldValue),
    (151, Opcode::Resume),
    (152, Opcode::MatchClass),
    (155, Opcode::FormatValue),
    (156, Opcode::BuildConstKeyMap),
    (157, Opcode::BuildString),
    (162, Opcode::ListExtend),
    (163, Opcode::SetUpdate),
    (164, Opcode::DictMerge),
    (165, Opcode::DictUpdate),
    (171, Opcode::Call),
    (172, Opcode::KwNames),
    (173, Opcode::CallIntrinsic1),
    (174, Opcode::CallIntrinsic2),
];

static TABLE_PY2: Lazy<Table> = Lazy::new(|| build(PY2_BASE, &[]));
static TABLE_PY27: Lazy<Table> = Lazy::new(|| build(PY2_BASE, PY27_EXTRA));
static TABLE_PY30_35: Lazy<Table> = Lazy::new(|| build(PY3_BASE, PY30_35_EXTRA));
static TABLE_PY36_37: Lazy<Table> = Lazy::new(|| build(PY3_BASE, PY36_37_EXTRA));
static TABLE_PY38: Lazy<Table> = Lazy::new(|| build(PY3_BASE, PY38_EXTRA));
static TABLE_PY39_310: Lazy<Table> = Lazy::new(|| build(PY3_BASE, PY39_310_EXTRA));
static TABLE_PY311: Lazy<Table> = Lazy::new(|| build(PY311, &[]));
static TABLE_PY312: Lazy<Table> = Lazy::new(|| build(PY312, &[]));

/// The numeric-to-canonical table for a version.
pub fn opcode_table(version: PythonVersion) -> &'static Table {
    let v = version;
    if v >= PythonVersion::new(3, 12) {
        &TABLE_PY312
    } else if v >= PythonVersion::new(3, 11) {
        &TABLE_PY311
    } else if v >= PythonVersion::new(3, 9) {
        &TABLE_PY39_310
    } else if v >= PythonVersion::new(3, 8) {
        &TABLE_PY38
    } else if v >= PythonVersion::new(3, 6) {
        &TABLE_PY36_37
    } else if v >= PythonVersion::new(3, 0) {
        &TABLE_PY30_35
    } else if v >= PythonVersion::new(2, 7) {
        &TABLE_PY27
    } else {
        &TABLE_PY2
    }
}

/// One decoded instruction with a version-normalized jump target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    /// Byte offset of the opcode within the instruction buffer.
    pub offset: usize,
    pub opcode: Opcode,
    pub operand: u32,
    /// Byte offset the instruction jumps to, for the jump classes.
    pub target: Option<usize>,
    /// Byte offset of the following instruction.
    pub next: usize,
}

/// Streaming decoder over one code object's instruction buffer.
///
/// EXTENDED_ARG prefixes are folded into the following instruction's
/// operand and never surfaced.
pub struct Dispatcher<'a> {
    code: &'a [u8],
    pos: usize,
    version: PythonVersion,
    table: &'static Table,
    scope: String,
}

impl<'a> Dispatcher<'a> {
    pub fn new(code: &'a [u8], version: PythonVersion, scope: &str) -> Self {
        Self {
            code,
            pos: 0,
            version,
            table: opcode_table(version),
            scope: scope.to_string(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn err_pos(&self, offset: usize) -> BytePos {
        BytePos::in_scope(offset, self.scope.clone())
    }

    /// Decode the next instruction, or None at end of buffer.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        let mut extended: u32 = 0;
        // Captured before any EXTENDED_ARG prefix so block end markers line
        // up with what the compiler emitted.
        let offset = self.pos;
        loop {
            if self.pos >= self.code.len() {
                if extended != 0 {
                    return Err(DecompileError::truncated(self.pos, "instruction"));
                }
                return Ok(None);
            }
            let raw = self.code[self.pos];
            let opcode = *self
                .table
                .get(&raw)
                .ok_or_else(|| DecompileError::unknown_opcode(raw, self.err_pos(self.pos)))?;

            let (operand, next) = if self.version.uses_wordcode() {
                let arg_byte = *self
                    .code
                    .get(self.pos + 1)
                    .ok_or_else(|| DecompileError::truncated(self.pos + 1, "wordcode operand"))?;
                (extended | u32::from(arg_byte), self.pos + 2)
            } else if opcode.operand_class(self.version) == OperandClass::None {
                (0, self.pos + 1)
            } else {
                if self.pos + 3 > self.code.len() {
                    return Err(DecompileError::truncated(self.pos + 1, "operand"));
                }
                let word =
                    u16::from_le_bytes([self.code[self.pos + 1], self.code[self.pos + 2]]);
                (extended | u32::from(word), self.pos + 3)
            };

            self.pos = next;
            if opcode == Opcode::ExtendedArg {
                extended = if self.version.uses_wordcode() {
                    operand << 8
                } else {
                    operand << 16
                };
                // The prefix belongs to the instruction it extends.
                continue;
            }

            let target = self.jump_target(opcode, operand, next);
            return Ok(Some(Instruction { offset, opcode, operand, target, next }));
        }
    }

    fn jump_target(&self, opcode: Opcode, operand: u32, next: usize) -> Option<usize> {
        let scale = if self.version.word_jumps() { 2 } else { 1 };
        let delta = operand as usize * scale;
        match opcode.operand_class(self.version) {
            OperandClass::HasJrel => {
                if opcode.jumps_backward() {
                    Some(next.saturating_sub(delta))
                } else {
                    Some(next + delta)
                }
            }
            OperandClass::HasJabs => Some(delta),
            _ => None,
        }
    }
}

/// Render one scope's instruction listing, recursing into nested code.
pub fn disassemble(code: &CodeObject, version: PythonVersion) -> Result<String> {
    let mut out = String::new();
    disassemble_into(code, version, &mut out)?;
    Ok(out)
}

fn disassemble_into(code: &CodeObject, version: PythonVersion, out: &mut String) -> Result<()> {
    use std::fmt::Write;

    writeln!(out, "Disassembly of {} ({}):", code.name, code.filename).unwrap();
    let mut dispatcher = Dispatcher::new(&code.code, version, &code.name);
    while let Some(insn) = dispatcher.next_instruction()? {
        match insn.target {
            Some(target) => writeln!(
                out,
                "{:6}  {:<24} {:>6}  (to {})",
                insn.offset,
                insn.opcode.to_string(),
                insn.operand,
                target
            )
            .unwrap(),
            None if insn.opcode.operand_class(version) != OperandClass::None => writeln!(
                out,
                "{:6}  {:<24} {:>6}",
                insn.offset,
                insn.opcode.to_string(),
                insn.operand
            )
            .unwrap(),
            None => writeln!(out, "{:6}  {}", insn.offset, insn.opcode).unwrap(),
        }
    }
    for nested in code.consts.iter().filter_map(|c| c.as_code()) {
        out.push('\n');
        disassemble_into(nested, version, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(code: &[u8], major: u8, minor: u8) -> Vec<Instruction> {
        let mut dispatcher = Dispatcher::new(code, PythonVersion::new(major, minor), "<test>");
        let mut out = Vec::new();
        while let Some(insn) = dispatcher.next_instruction().unwrap() {
            out.push(insn);
        }
        out
    }

    #[test]
    fn test_pre_wordcode_operands() {
        // 2.7: LOAD_CONST 1; RETURN_VALUE
        let insns = decode_all(&[100, 1, 0, 83], 2, 7);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].opcode, Opcode::LoadConst);
        assert_eq!(insns[0].operand, 1);
        assert_eq!(insns[0].next, 3);
        assert_eq!(insns[1].opcode, Opcode::ReturnValue);
    }

    #[test]
    fn test_wordcode_operands() {
        // 3.8: LOAD_CONST 1; RETURN_VALUE
        let insns = decode_all(&[100, 1, 83, 0], 3, 8);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].operand, 1);
        assert_eq!(insns[0].next, 2);
    }

    #[test]
    fn test_extended_arg_folds() {
        // 3.8: EXTENDED_ARG 1; LOAD_CONST 4 -> operand 0x104
        let insns = decode_all(&[144, 1, 100, 4], 3, 8);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].opcode, Opcode::LoadConst);
        assert_eq!(insns[0].operand, 0x104);
        assert_eq!(insns[0].offset, 0);
    }

    #[test]
    fn test_jump_targets_bytes_pre_310() {
        // 3.8: JUMP_FORWARD 4 at offset 0 -> target 6
        let insns = decode_all(&[110, 4], 3, 8);
        assert_eq!(insns[0].target, Some(6));
        // POP_JUMP_IF_FALSE is absolute before 3.11
        let insns = decode_all(&[114, 8], 3, 8);
        assert_eq!(insns[0].target, Some(8));
    }

    #[test]
    fn test_jump_targets_words_310() {
        // 3.10 scales jump operands by two
        let insns = decode_all(&[110, 2], 3, 10);
        assert_eq!(insns[0].target, Some(6));
    }

    #[test]
    fn test_backward_jump_311() {
        // 3.11: JUMP_BACKWARD 2 at offset 4 -> target 2
        let insns = decode_all(&[9, 0, 9, 0, 140, 2], 3, 11);
        assert_eq!(insns[2].target, Some(2));
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut dispatcher = Dispatcher::new(&[200, 0], PythonVersion::new(3, 8), "<test>");
        assert!(dispatcher.next_instruction().is_err());
    }

    #[test]
    fn test_packed_call_class_pre36() {
        assert_eq!(
            Opcode::CallFunction.operand_class(PythonVersion::new(2, 7)),
            OperandClass::HasArgPacked
        );
        assert_eq!(
            Opcode::CallFunction.operand_class(PythonVersion::new(3, 6)),
            OperandClass::HasArgUint
        );
    }
}
