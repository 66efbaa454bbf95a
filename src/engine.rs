// File: src/engine.rs
//
// The bytecode-to-AST reconstruction engine: a stack simulator that walks
// one code object's instruction stream, mirrors the values the interpreter
// would hold on its operand stack as expression nodes, tracks open control
// blocks by their end offsets, and emits statements into the innermost
// block. Nested code objects (function bodies, class bodies, lambdas,
// comprehensions) are decompiled recursively on the same call stack.
//
// Failure policy: malformed input (bad pool index, unknown numeric opcode,
// popping the module block) aborts the scope; everything the engine merely
// does not understand degrades to a placeholder node and marks the build
// dirty so the printer can flag the output as incomplete.

use ahash::AHashMap;
use tracing::{debug, trace, warn};

use crate::ast::{
    BinaryOp, Block, BlockKind, BoolOp, CmpOp, CompClause, Expr, FunctionExpr, KeywordKind, Stmt,
    UnaryOp,
};
use crate::code::{CodeObject, Object};
use crate::errors::{BytePos, DecompileError, ErrorKind, Result};
use crate::opcode::{Dispatcher, Instruction, Opcode};
use crate::version::PythonVersion;

/// Top-level decompiler state whose lifetime equals one module decompile.
///
/// Carries the module context and the flags the original kept as globals.
pub struct Decompiler {
    pub version: PythonVersion,
    /// False once any soft decode error has been recorded.
    pub clean_build: bool,
    pub print_docstring: bool,
    pub print_class_docstring: bool,
}

impl Decompiler {
    pub fn new(version: PythonVersion) -> Self {
        Self {
            version,
            clean_build: true,
            print_docstring: true,
            print_class_docstring: true,
        }
    }

    /// Decompile the root code object into the module-level block.
    pub fn decompile_module(&mut self, code: &CodeObject) -> Result<Block> {
        self.decompile_scope(code, BlockKind::Main)
    }

    fn decompile_scope(&mut self, code: &CodeObject, kind: BlockKind) -> Result<Block> {
        debug!(scope = %code.name, "decompiling scope");
        let is_function = matches!(kind, BlockKind::Function);
        let engine = Engine::new(self, code, kind);
        let mut block = engine.run()?;

        // Function docstrings live in the first constant slot.
        if is_function
            && self.print_docstring
            && block.docstring.is_none()
            && !code.is_lambda()
            && code.comprehension_kind().is_none()
        {
            if let Some(Object::Str(doc)) = code.consts.first() {
                let doc_is_return_value = block.body.iter().any(|stmt| {
                    matches!(stmt, Stmt::Return(Some(Expr::Const(Object::Str(s)))) if s == doc)
                });
                if !doc_is_return_value {
                    block.docstring = Some(doc.clone());
                }
            }
        }
        Ok(block)
    }
}

/// State of one open try construct while its arms are reconstructed.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TryState {
    /// Inside the try body.
    Body,
    /// Try body closed; the next forward jump names the construct's end.
    AwaitEnd,
    /// At a handler boundary, deciding between except and finally.
    Dispatch,
    /// Inside an except or finally arm.
    Handler,
}

#[derive(Debug)]
struct TryFrame {
    /// Offset of the next handler boundary.
    handler: usize,
    /// Offset just past the whole construct, once known.
    end: Option<usize>,
    state: TryState,
}

/// An UNPACK_SEQUENCE / UNPACK_EX in progress: the next `remaining`
/// stores are tuple-element targets, not assignments.
#[derive(Debug)]
struct UnpackFrame {
    remaining: usize,
    targets: Vec<Expr>,
    star_index: Option<usize>,
    /// None when unpacking a loop or binding target that has no RHS.
    value: Option<Expr>,
}

/// A short-circuit jump waiting for its merge point.
#[derive(Debug)]
struct BoolFrame {
    op: BoolOp,
    value: Expr,
    target: usize,
}

struct Engine<'a, 'd> {
    dec: &'d mut Decompiler,
    code: &'a CodeObject,
    version: PythonVersion,
    stack: Vec<Expr>,
    blocks: Vec<Block>,
    /// Saved stack copies for speculative reductions.
    history: Vec<Vec<Expr>>,
    else_pop: bool,
    /// Handler offsets from SETUP_EXCEPT/SETUP_FINALLY awaiting promotion
    /// into open TRY blocks.
    need_try: Vec<usize>,
    try_frames: Vec<TryFrame>,
    /// Backward-jump targets mapped to loop ends (3.8+, where SETUP_LOOP
    /// is gone and loops must be discovered up front).
    loop_heads: AHashMap<usize, usize>,
    /// KW_NAMES sideband for the next CALL.
    kw_names: Vec<String>,
    pending_unpack: Vec<UnpackFrame>,
    pending_bool: Vec<BoolFrame>,
    /// Accumulating `from module import ...` names.
    pending_from: Option<(String, Vec<(String, Option<String>)>)>,
    last_from_name: Option<String>,
    /// Exception-handler prologue pops left to swallow.
    handler_pops: u8,
    /// Old-style conditional jumps leave the condition for a POP_TOP.
    cond_pops: u8,
    variable_annotations: bool,
    in_lambda: bool,
}

impl<'a, 'd> Engine<'a, 'd> {
    fn new(dec: &'d mut Decompiler, code: &'a CodeObject, kind: BlockKind) -> Self {
        let version = dec.version;
        let in_lambda = code.is_lambda();
        let mut root = Block::new(kind, code.code.len());
        root.inited = true;
        let capacity = (code.stacksize as usize).max(4);
        Self {
            dec,
            code,
            version,
            stack: Vec::with_capacity(capacity),
            blocks: vec![root],
            history: Vec::new(),
            else_pop: false,
            need_try: Vec::new(),
            try_frames: Vec::new(),
            loop_heads: AHashMap::new(),
            kw_names: Vec::new(),
            pending_unpack: Vec::new(),
            pending_bool: Vec::new(),
            pending_from: None,
            last_from_name: None,
            handler_pops: 0,
            cond_pops: 0,
            variable_annotations: false,
            in_lambda,
        }
    }

    // === Small primitives ===

    fn pos(&self, offset: usize) -> BytePos {
        BytePos::in_scope(offset, self.code.name.clone())
    }

    fn soft_error(&mut self, offset: usize, what: &str) {
        warn!(scope = %self.code.name, offset, "{}", what);
        self.dec.clean_build = false;
    }

    fn push(&mut self, expr: Expr) {
        self.stack.push(expr);
    }

    fn pop(&mut self, offset: usize) -> Expr {
        match self.stack.pop() {
            Some(expr) => expr,
            None => {
                self.soft_error(offset, "value stack exhausted");
                Expr::unknown()
            }
        }
    }

    fn popn(&mut self, offset: usize, n: usize) -> Vec<Expr> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop(offset));
        }
        out.reverse();
        out
    }

    fn top_matches(&self, expr: &Expr) -> bool {
        self.stack.last() == Some(expr)
    }

    fn cur(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("block stack is never empty")
    }

    fn cur_ref(&self) -> &Block {
        self.blocks.last().expect("block stack is never empty")
    }

    fn emit(&mut self, stmt: Stmt) {
        self.cur().push(stmt);
    }

    fn open_block(&mut self, block: Block) {
        trace!(kind = block.kind.label(), start = block.start, end = block.end, "open block");
        self.blocks.push(block);
    }

    /// Innermost open loop, if any.
    fn innermost_loop(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .rev()
            .find(|b| matches!(b.kind, BlockKind::While { .. } | BlockKind::For { .. }))
    }

    // === Block closing ===

    /// Close blocks whose end offset has been reached. CONTAINER blocks
    /// and finally arms only close explicitly.
    fn close_ended(&mut self, pos: usize) -> Result<()> {
        while self.blocks.len() > 1 {
            let cur = self.cur_ref();
            if cur.is_container() || matches!(cur.kind, BlockKind::Finally) || cur.end > pos {
                break;
            }
            self.close_one()?;
        }
        Ok(())
    }

    /// Pop the current block and append it to its parent, applying the
    /// local recovery passes on the way out.
    fn close_one(&mut self) -> Result<()> {
        let block = self.blocks.pop().expect("block stack is never empty");
        if self.blocks.is_empty() {
            return Err(DecompileError::new(
                ErrorKind::BlockUnderflow,
                "attempted to close the module block".to_string(),
                self.pos(block.end),
            ));
        }
        trace!(kind = block.kind.label(), "close block");
        let block = finish_block(block);

        // Ternary recovery: an empty ELSE right after an empty IF with the
        // branch results still on the stack folds into one expression.
        if matches!(block.kind, BlockKind::Else)
            && block.body.is_empty()
            && self.stack.len() >= 2
            && matches!(
                self.cur_ref().body.last(),
                Some(Stmt::Block(Block { kind: BlockKind::If { .. }, body, .. })) if body.is_empty()
            )
        {
            let orelse = self.stack.pop().expect("checked above");
            let then = self.stack.pop().expect("checked above");
            let Some(Stmt::Block(if_block)) = self.cur().body.pop() else {
                unreachable!("matched above");
            };
            let BlockKind::If { cond } = if_block.kind else {
                unreachable!("matched above");
            };
            self.push(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                orelse: Box::new(orelse),
            });
            return Ok(());
        }

        self.cur().push(Stmt::Block(block));
        Ok(())
    }

    /// Resolve pending and/or frames whose merge point has been reached.
    fn resolve_bool(&mut self, pos: usize) {
        while self
            .pending_bool
            .last()
            .map(|frame| frame.target <= pos)
            .unwrap_or(false)
        {
            let frame = self.pending_bool.pop().expect("checked above");
            let right = self.pop(pos);
            self.push(merge_bool(frame.op, frame.value, right));
        }
    }

    // === Try/except state machine ===

    fn try_boundaries(&mut self, pos: usize) {
        if let Some(frame) = self.try_frames.last_mut() {
            if frame.end.map(|end| pos >= end).unwrap_or(false) {
                self.try_frames.pop();
                return;
            }
            if pos == frame.handler
                && matches!(frame.state, TryState::Body | TryState::AwaitEnd | TryState::Handler)
            {
                frame.state = TryState::Dispatch;
            }
        }
    }

    fn in_dispatch(&self) -> bool {
        matches!(
            self.try_frames.last(),
            Some(TryFrame { state: TryState::Dispatch, .. })
        )
    }

    /// At a handler boundary, a leading op that is not part of the except
    /// prologue means this arm is a finally block.
    fn handler_dispatch(&mut self, insn: &Instruction) {
        if !self.in_dispatch() {
            return;
        }
        match insn.opcode {
            Opcode::DupTop
            | Opcode::PopTop
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::LoadFast
            | Opcode::LoadAttr
            | Opcode::LoadConst
            | Opcode::CompareOp
            | Opcode::CheckExcMatch
            | Opcode::PushExcInfo
            | Opcode::JumpIfNotExcMatch
            | Opcode::PopJumpIfFalse
            | Opcode::EndFinally
            | Opcode::Reraise => {}
            _ => {
                let end = self.parent_end();
                self.open_block(Block::new(BlockKind::Finally, end).starting_at(insn.offset));
                if let Some(frame) = self.try_frames.last_mut() {
                    frame.state = TryState::Handler;
                }
            }
        }
    }

    fn parent_end(&self) -> usize {
        self.cur_ref().end
    }

    /// Open an except arm at the current dispatch point.
    fn open_except(&mut self, start: usize, exc_type: Option<Expr>, arm_end: usize) {
        let block = Block::uninited(BlockKind::Except { exc_type, binding: None }, arm_end)
            .starting_at(start);
        self.open_block(block);
        self.handler_pops = 3;
        if let Some(frame) = self.try_frames.last_mut() {
            frame.handler = arm_end;
            frame.state = TryState::Handler;
        }
    }

    // === Stores ===

    /// Which binding slot, if any, the next store target belongs to.
    fn binding_slot(&self) -> BindingSlot {
        let cur = self.cur_ref();
        match &cur.kind {
            BlockKind::For { .. } if !cur.inited => BindingSlot::ForTarget,
            BlockKind::With { .. } if !cur.inited => BindingSlot::WithBinding,
            BlockKind::Except { .. } if self.handler_pops > 0 => BindingSlot::ExceptBinding,
            _ => BindingSlot::None,
        }
    }

    fn store(&mut self, offset: usize, target: Expr) {
        // Loop and with-statement binding targets come first.
        match self.binding_slot() {
            BindingSlot::ForTarget => {
                let cur = self.cur();
                if let BlockKind::For { target: slot, .. } = &mut cur.kind {
                    *slot = Some(target);
                }
                cur.inited = true;
                return;
            }
            BindingSlot::WithBinding => {
                let cur = self.cur();
                if let BlockKind::With { binding, .. } = &mut cur.kind {
                    *binding = Some(target);
                }
                cur.inited = true;
                return;
            }
            BindingSlot::ExceptBinding => {
                let cur = self.cur();
                if let BlockKind::Except { binding, .. } = &mut cur.kind {
                    *binding = Some(target);
                }
                self.handler_pops = self.handler_pops.saturating_sub(1);
                return;
            }
            BindingSlot::None => {}
        }

        // Tuple-unpacking targets accumulate without touching the stack.
        if let Some(frame) = self.pending_unpack.last_mut() {
            frame.targets.push(target);
            frame.remaining -= 1;
            if frame.remaining == 0 {
                let frame = self.pending_unpack.pop().expect("checked above");
                let mut targets = frame.targets;
                if let Some(star) = frame.star_index {
                    if star < targets.len() {
                        let starred = targets.remove(star);
                        targets.insert(star, Expr::Starred(Box::new(starred)));
                    }
                }
                let tuple = Expr::Tuple(targets);
                match frame.value {
                    Some(value) => self.store_value(offset, tuple, value),
                    None => self.store(offset, tuple),
                }
            }
            return;
        }

        let value = self.pop(offset);
        self.store_value(offset, target, value);
    }

    fn store_value(&mut self, offset: usize, target: Expr, value: Expr) {
        match value {
            Expr::ChainStore { mut targets, value } => {
                targets.push(target);
                if self.top_matches(&value) {
                    self.stack.pop();
                    self.push(Expr::ChainStore { targets, value });
                } else {
                    self.emit(Stmt::Store { targets, value: *value });
                }
            }
            Expr::ImportRef { module } => {
                let alias = match &target {
                    Expr::Name(name) if Some(name.as_str()) == module.split('.').next() => None,
                    Expr::Name(name) => Some(name.clone()),
                    _ => None,
                };
                self.emit(Stmt::Import { module, alias });
            }
            value => {
                // Names produced by IMPORT_FROM accumulate into one
                // from-import statement.
                if let (Some((_, names)), Expr::Name(loaded)) =
                    (self.pending_from.as_mut(), &value)
                {
                    if self.last_from_name.as_deref() == Some(loaded.as_str()) {
                        let alias = match &target {
                            Expr::Name(t) if t == loaded => None,
                            Expr::Name(t) => Some(t.clone()),
                            _ => None,
                        };
                        names.push((loaded.clone(), alias));
                        self.last_from_name = None;
                        return;
                    }
                }

                // A duplicated value starts a chained assignment.
                if self.top_matches(&value) {
                    self.stack.pop();
                    self.push(Expr::ChainStore {
                        targets: vec![target],
                        value: Box::new(value),
                    });
                    return;
                }

                // In-place operators become augmented assignments.
                if let Expr::Binary { op, left, right, inplace: true } = &value {
                    if **left == target {
                        self.emit(Stmt::AugAssign {
                            target,
                            op: *op,
                            value: (**right).clone(),
                        });
                        return;
                    }
                }

                // 3.7+ annotated assignment: a store into __annotations__
                // annotates the immediately preceding plain store. Only
                // recognized after SETUP_ANNOTATIONS armed the scope.
                if self.variable_annotations {
                    if let Expr::Subscript { value: container, index } = &target {
                        if matches!(&**container, Expr::Name(n) if n == "__annotations__") {
                            if let Expr::Const(Object::Str(name)) = &**index {
                                self.annotate(name.clone(), value);
                                return;
                            }
                        }
                    }
                }

                // Docstrings and class-scope compiler bookkeeping.
                if let Expr::Name(name) = &target {
                    if self.blocks.len() == 1 {
                        if name == "__doc__" {
                            if let Expr::Const(Object::Str(doc)) = &value {
                                if self.dec.print_docstring {
                                    self.blocks[0].docstring = Some(doc.clone());
                                    return;
                                }
                            }
                        }
                        if matches!(self.blocks[0].kind, BlockKind::Class)
                            && (name == "__module__" || name == "__qualname__")
                        {
                            return;
                        }
                    }
                }

                self.emit(Stmt::Store { targets: vec![target], value });
            }
        }
    }

    /// Attach an annotation to the matching store, or emit a bare one.
    fn annotate(&mut self, name: String, annotation: Expr) {
        let target = Expr::Name(name);
        if let Some(Stmt::Store { targets, value }) = self.cur().body.last() {
            if targets.len() == 1 && targets[0] == target {
                let value = value.clone();
                self.cur().body.pop();
                self.emit(Stmt::AnnAssign { target, annotation, value: Some(value) });
                return;
            }
        }
        self.emit(Stmt::AnnAssign { target, annotation, value: None });
    }

    // === Operand pool access ===

    fn const_at(&self, index: u32) -> Result<Object> {
        self.code.const_at(index as usize).cloned()
    }

    fn name_at(&self, index: u32) -> Result<String> {
        self.code.name_at(index as usize).map(str::to_string)
    }

    fn varname_at(&self, index: u32) -> Result<String> {
        self.code.varname_at(index as usize).map(str::to_string)
    }

    fn deref_name(&self, index: u32) -> Result<String> {
        let index = index as usize;
        // 3.11 indexes the combined locals-plus space.
        if self.version >= PythonVersion::new(3, 11) {
            let nlocals = self.code.varnames.len();
            if index < nlocals {
                return self.code.varname_at(index).map(str::to_string);
            }
            return self.code.cellname_at(index - nlocals).map(str::to_string);
        }
        self.code.cellname_at(index).map(str::to_string)
    }

    // === Main loop ===

    fn run(mut self) -> Result<Block> {
        if self.version >= PythonVersion::new(3, 8) {
            self.scan_loop_heads()?;
        }

        let mut dispatcher = Dispatcher::new(&self.code.code, self.version, &self.code.name);
        while let Some(insn) = dispatcher.next_instruction()? {
            let curpos = insn.offset;
            trace!(offset = curpos, opcode = ?insn.opcode, operand = insn.operand, "step");

            self.try_boundaries(curpos);
            self.handler_dispatch(&insn);

            // Pending-try promotion: the TRY block starts at the first
            // instruction after its SETUP opener.
            if !self.need_try.is_empty() && insn.opcode != Opcode::SetupExcept {
                for handler in std::mem::take(&mut self.need_try) {
                    self.try_frames.push(TryFrame {
                        handler,
                        end: None,
                        state: TryState::Body,
                    });
                    self.open_block(Block::new(BlockKind::Try, handler).starting_at(curpos));
                }
            }

            // 3.8+ loop heads discovered by the backward-jump prepass.
            if let Some(&loop_end) = self.loop_heads.get(&curpos) {
                let already_open = self
                    .blocks
                    .iter()
                    .any(|b| b.start == curpos && matches!(b.kind, BlockKind::While { .. } | BlockKind::For { .. }));
                if !already_open {
                    self.open_block(
                        Block::uninited(BlockKind::While { cond: None }, loop_end)
                            .starting_at(curpos),
                    );
                }
            }

            self.resolve_bool(curpos);

            // Deferred else-close before any non-branch instruction.
            if self.else_pop && !is_branch(insn.opcode) {
                self.close_ended(curpos)?;
                self.else_pop = false;
            }

            self.dispatch(&insn)?;
            self.close_ended(insn.next)?;
        }

        while self.blocks.len() > 1 {
            self.close_one()?;
        }
        let mut root = self.blocks.pop().expect("root block");
        root = finish_block(root);
        Ok(root)
    }

    /// Find loop heads: targets of backward jumps, with the loop end taken
    /// from the furthest jump back to that head.
    fn scan_loop_heads(&mut self) -> Result<()> {
        let mut dispatcher = Dispatcher::new(&self.code.code, self.version, &self.code.name);
        while let Some(insn) = dispatcher.next_instruction()? {
            if let Some(target) = insn.target {
                if target <= insn.offset
                    && matches!(
                        insn.opcode,
                        Opcode::JumpAbsolute
                            | Opcode::JumpBackward
                            | Opcode::PopJumpBackIfTrue
                            | Opcode::PopJumpBackIfFalse
                            | Opcode::PopJumpBackIfNone
                            | Opcode::PopJumpBackIfNotNone
                    )
                {
                    let entry = self.loop_heads.entry(target).or_insert(insn.next);
                    if *entry < insn.next {
                        *entry = insn.next;
                    }
                }
            }
        }
        Ok(())
    }

    // === Handlers ===

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, insn: &Instruction) -> Result<()> {
        use Opcode::*;
        use crate::ast::BinaryOp;
        let offset = insn.offset;
        let operand = insn.operand;

        match insn.opcode {
            // --- no-ops and interpreter bookkeeping ---
            Nop | StopCode | Cache | Resume | Precall | GenStart | MakeCell | CopyFreeVars
            | PopExcept | WithCleanupFinish | WithExceptStart | BeginFinally
            | PopFinally | ReturnGenerator | GetIter | GetYieldFromIter | EndFor | EndSend => {}

            PushExcInfo => {
                if self.try_frames.is_empty() {
                    self.soft_error(offset, "exception handler without a visible setup");
                }
            }

            PushNull => self.push(Expr::Null),

            // --- loads ---
            LoadConst => {
                let value = self.const_at(operand)?;
                self.push(Expr::Const(value));
            }
            LoadName => {
                let name = self.name_at(operand)?;
                self.push(Expr::Name(name));
            }
            LoadGlobal => {
                let index = if self.version >= PythonVersion::new(3, 11) {
                    if operand & 1 != 0 {
                        self.push(Expr::Null);
                    }
                    operand >> 1
                } else {
                    operand
                };
                let name = self.name_at(index)?;
                self.push(Expr::Name(name));
            }
            LoadFast | LoadFastCheck | LoadFastAndClear => {
                let name = self.varname_at(operand)?;
                self.push(Expr::Name(name));
            }
            LoadDeref | LoadClassDeref | LoadClosure => {
                let name = self.deref_name(operand)?;
                self.push(Expr::Name(name));
            }
            LoadAttr => {
                let index = if self.version >= PythonVersion::new(3, 12) {
                    operand >> 1
                } else {
                    operand
                };
                let attr = self.name_at(index)?;
                let value = self.pop(offset);
                self.push(Expr::Attribute { value: Box::new(value), attr });
            }
            LoadMethod => {
                let attr = self.name_at(operand)?;
                let value = self.pop(offset);
                self.push(Expr::Attribute { value: Box::new(value), attr });
            }
            LoadBuildClass => self.push(Expr::BuildClass),
            LoadLocals => self.push(Expr::Name("__locals__".to_string())),
            LoadAssertionError => self.push(Expr::Name("AssertionError".to_string())),
            LoadSuperAttr => {
                let attr = self.name_at(operand >> 2)?;
                let _self_arg = self.pop(offset);
                let _class_arg = self.pop(offset);
                let _super = self.pop(offset);
                self.push(Expr::Attribute {
                    value: Box::new(Expr::Call {
                        func: Box::new(Expr::Name("super".to_string())),
                        args: Vec::new(),
                        kwargs: Vec::new(),
                        star: None,
                        dstar: None,
                    }),
                    attr,
                });
            }

            // --- stack shuffling ---
            PopTop => self.pop_top(offset),
            DupTop => {
                if self.in_dispatch() {
                    // Handler prologue duplicates the live exception.
                } else if let Some(top) = self.stack.last().cloned() {
                    self.push(top);
                } else {
                    self.soft_error(offset, "DUP_TOP on empty stack");
                }
            }
            DupTopTwo | DupTopX => {
                let n = if insn.opcode == DupTopTwo { 2 } else { operand as usize };
                if self.stack.len() >= n {
                    let base = self.stack.len() - n;
                    let copies: Vec<Expr> = self.stack[base..].to_vec();
                    self.stack.extend(copies);
                } else {
                    self.soft_error(offset, "DUP on short stack");
                }
            }
            RotTwo => self.rotate(offset, 2),
            RotThree => self.rotate(offset, 3),
            RotFour => self.rotate(offset, 4),
            RotN => self.rotate(offset, operand as usize),
            Copy => {
                let n = operand as usize;
                if n >= 1 && self.stack.len() >= n {
                    let item = self.stack[self.stack.len() - n].clone();
                    self.push(item);
                } else {
                    self.soft_error(offset, "COPY out of range");
                }
            }
            Swap => {
                let n = operand as usize;
                let len = self.stack.len();
                if n >= 1 && len >= n {
                    self.stack.swap(len - 1, len - n);
                } else {
                    self.soft_error(offset, "SWAP out of range");
                }
            }

            // --- operators ---
            BinaryAdd => self.binary(offset, BinaryOp::Add, false),
            BinarySubtract => self.binary(offset, BinaryOp::Sub, false),
            BinaryMultiply => self.binary(offset, BinaryOp::Mul, false),
            BinaryMatrixMultiply => self.binary(offset, BinaryOp::MatMul, false),
            BinaryDivide | BinaryTrueDivide => self.binary(offset, BinaryOp::Div, false),
            BinaryFloorDivide => self.binary(offset, BinaryOp::FloorDiv, false),
            BinaryModulo => self.binary(offset, BinaryOp::Mod, false),
            BinaryPower => self.binary(offset, BinaryOp::Pow, false),
            BinaryLshift => self.binary(offset, BinaryOp::LShift, false),
            BinaryRshift => self.binary(offset, BinaryOp::RShift, false),
            BinaryAnd => self.binary(offset, BinaryOp::BitAnd, false),
            BinaryOr => self.binary(offset, BinaryOp::BitOr, false),
            BinaryXor => self.binary(offset, BinaryOp::BitXor, false),
            InplaceAdd => self.binary(offset, BinaryOp::Add, true),
            InplaceSubtract => self.binary(offset, BinaryOp::Sub, true),
            InplaceMultiply => self.binary(offset, BinaryOp::Mul, true),
            InplaceMatrixMultiply => self.binary(offset, BinaryOp::MatMul, true),
            InplaceDivide | InplaceTrueDivide => self.binary(offset, BinaryOp::Div, true),
            InplaceFloorDivide => self.binary(offset, BinaryOp::FloorDiv, true),
            InplaceModulo => self.binary(offset, BinaryOp::Mod, true),
            InplacePower => self.binary(offset, BinaryOp::Pow, true),
            InplaceLshift => self.binary(offset, BinaryOp::LShift, true),
            InplaceRshift => self.binary(offset, BinaryOp::RShift, true),
            InplaceAnd => self.binary(offset, BinaryOp::BitAnd, true),
            InplaceOr => self.binary(offset, BinaryOp::BitOr, true),
            InplaceXor => self.binary(offset, BinaryOp::BitXor, true),
            BinaryOp => match binary_op_index(operand) {
                Some((op, inplace)) => self.binary(offset, op, inplace),
                None => {
                    self.soft_error(offset, "unknown BINARY_OP index");
                    self.pop(offset);
                    self.pop(offset);
                    self.push(Expr::unknown());
                }
            },
            UnaryNegative => self.unary(offset, UnaryOp::Neg),
            UnaryPositive => self.unary(offset, UnaryOp::Pos),
            UnaryNot => self.unary(offset, UnaryOp::Not),
            UnaryInvert => self.unary(offset, UnaryOp::Invert),
            UnaryConvert => self.unary(offset, UnaryOp::Repr),

            CompareOp => {
                let op = if self.version >= PythonVersion::new(3, 12) {
                    CmpOp::from_312(operand)
                } else {
                    CmpOp::from_classic(operand)
                };
                match op {
                    // In a handler prologue the matched exception is not a
                    // simulated value; only the type operand is popped.
                    Some(CmpOp::ExcMatch) if self.in_dispatch() => {
                        let exc_type = self.pop(offset);
                        self.push(Expr::Compare {
                            first: Box::new(Expr::Name("<exception>".to_string())),
                            rest: vec![(CmpOp::ExcMatch, exc_type)],
                        });
                    }
                    Some(op) => self.compare(offset, op),
                    None => {
                        self.soft_error(offset, "unknown COMPARE_OP operand");
                        self.pop(offset);
                        self.pop(offset);
                        self.push(Expr::unknown());
                    }
                }
            }
            IsOp => self.compare(offset, if operand != 0 { CmpOp::IsNot } else { CmpOp::Is }),
            ContainsOp => {
                self.compare(offset, if operand != 0 { CmpOp::NotIn } else { CmpOp::In })
            }

            // --- subscripts and slices ---
            BinarySubscr => {
                let index = self.pop(offset);
                let value = self.pop(offset);
                self.push(Expr::Subscript { value: Box::new(value), index: Box::new(index) });
            }
            BuildSlice => {
                let step = if operand == 3 { slice_bound(self.pop(offset)) } else { None };
                let upper = slice_bound(self.pop(offset));
                let lower = slice_bound(self.pop(offset));
                self.push(Expr::Slice { lower, upper, step });
            }
            BinarySlice => {
                let upper = slice_bound(self.pop(offset));
                let lower = slice_bound(self.pop(offset));
                let value = self.pop(offset);
                self.push(Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(Expr::Slice { lower, upper, step: None }),
                });
            }
            StoreSliceOp => {
                let upper = slice_bound(self.pop(offset));
                let lower = slice_bound(self.pop(offset));
                let value = self.pop(offset);
                let target = Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(Expr::Slice { lower, upper, step: None }),
                };
                self.store(offset, target);
            }
            Slice0 | Slice1 | Slice2 | Slice3 => {
                let subscript = self.legacy_slice(offset, insn.opcode);
                self.push(subscript);
            }
            StoreSlice0 | StoreSlice1 | StoreSlice2 | StoreSlice3 => {
                let opcode = match insn.opcode {
                    StoreSlice0 => Slice0,
                    StoreSlice1 => Slice1,
                    StoreSlice2 => Slice2,
                    _ => Slice3,
                };
                let target = self.legacy_slice(offset, opcode);
                self.store(offset, target);
            }
            DeleteSlice0 | DeleteSlice1 | DeleteSlice2 | DeleteSlice3 => {
                let opcode = match insn.opcode {
                    DeleteSlice0 => Slice0,
                    DeleteSlice1 => Slice1,
                    DeleteSlice2 => Slice2,
                    _ => Slice3,
                };
                let target = self.legacy_slice(offset, opcode);
                self.emit(Stmt::Delete(target));
            }

            // --- container construction ---
            BuildTuple => {
                let items = self.popn(offset, operand as usize);
                self.push(Expr::Tuple(items));
            }
            BuildList => {
                let items = self.popn(offset, operand as usize);
                self.push(Expr::List(items));
            }
            BuildSet => {
                let items = self.popn(offset, operand as usize);
                self.push(Expr::Set(items));
            }
            BuildMap => {
                if self.version >= PythonVersion::new(3, 5) {
                    let mut pairs = Vec::with_capacity(operand as usize);
                    for _ in 0..operand {
                        let value = self.pop(offset);
                        let key = self.pop(offset);
                        pairs.push((key, value));
                    }
                    pairs.reverse();
                    self.push(Expr::Map(pairs));
                } else {
                    // Filled in by subsequent STORE_MAP instructions.
                    self.push(Expr::Map(Vec::new()));
                }
            }
            StoreMap => {
                let key = self.pop(offset);
                let value = self.pop(offset);
                match self.stack.last_mut() {
                    Some(Expr::Map(pairs)) => pairs.push((key, value)),
                    _ => self.soft_error(offset, "STORE_MAP without a map"),
                }
            }
            BuildConstKeyMap => {
                let keys = self.pop(offset);
                let values = self.popn(offset, operand as usize);
                match keys {
                    Expr::Const(Object::Tuple(keys)) => {
                        self.push(Expr::ConstMap { keys, values })
                    }
                    _ => {
                        self.soft_error(offset, "BUILD_CONST_KEY_MAP without key tuple");
                        self.push(Expr::unknown());
                    }
                }
            }
            BuildString => {
                let parts = self.popn(offset, operand as usize);
                self.push(Expr::JoinedStr(parts));
            }
            FormatValue => {
                let format_spec = if operand & 0x04 != 0 {
                    Some(Box::new(self.pop(offset)))
                } else {
                    None
                };
                let value = self.pop(offset);
                let conversion = match operand & 0x03 {
                    1 => Some('s'),
                    2 => Some('r'),
                    3 => Some('a'),
                    _ => None,
                };
                self.push(Expr::FormattedValue {
                    value: Box::new(value),
                    conversion,
                    format_spec,
                });
            }
            ListExtend | SetUpdate => {
                let iterable = self.pop(offset);
                let unpacked = match iterable {
                    Expr::Const(Object::Tuple(items)) => {
                        items.into_iter().map(Expr::Const).collect()
                    }
                    other => vec![Expr::Starred(Box::new(other))],
                };
                match self.stack.last_mut() {
                    Some(Expr::List(items)) | Some(Expr::Set(items)) => items.extend(unpacked),
                    _ => self.soft_error(offset, "extend without a collection"),
                }
            }
            DictUpdate | DictMerge => {
                let mapping = self.pop(offset);
                let additions = match mapping {
                    Expr::Map(pairs) => pairs,
                    other => vec![(Expr::DoubleStarred(Box::new(other)), Expr::Null)],
                };
                match self.stack.last_mut() {
                    Some(Expr::Map(pairs)) => pairs.extend(additions),
                    _ => self.soft_error(offset, "dict update without a map"),
                }
            }
            ListToTuple => {
                let list = self.pop(offset);
                match list {
                    Expr::List(items) => self.push(Expr::Tuple(items)),
                    other => self.push(other),
                }
            }
            ListAppend | SetAdd => {
                let value = self.pop(offset);
                self.emit(Stmt::Expression(value));
            }
            MapAdd => {
                let (key, value) = if self.version >= PythonVersion::new(3, 8) {
                    let value = self.pop(offset);
                    let key = self.pop(offset);
                    (key, value)
                } else {
                    let key = self.pop(offset);
                    let value = self.pop(offset);
                    (key, value)
                };
                self.emit(Stmt::Expression(Expr::Tuple(vec![key, value])));
            }

            // --- unpacking ---
            UnpackSequence => {
                let value = self.unpack_value(offset);
                self.pending_unpack.push(UnpackFrame {
                    remaining: operand as usize,
                    targets: Vec::new(),
                    star_index: None,
                    value,
                });
            }
            UnpackEx => {
                let before = (operand & 0xff) as usize;
                let after = (operand >> 8) as usize;
                let value = self.unpack_value(offset);
                self.pending_unpack.push(UnpackFrame {
                    remaining: before + after + 1,
                    targets: Vec::new(),
                    star_index: Some(before),
                    value,
                });
            }

            // --- stores and deletes ---
            StoreName => {
                let name = self.name_at(operand)?;
                self.store(offset, Expr::Name(name));
            }
            StoreFast => {
                let name = self.varname_at(operand)?;
                self.store(offset, Expr::Name(name));
            }
            StoreGlobal => {
                let name = self.name_at(operand)?;
                if !matches!(self.blocks[0].kind, BlockKind::Main)
                    && !self.blocks[0].globals.contains(&name)
                {
                    self.blocks[0].globals.push(name.clone());
                }
                self.store(offset, Expr::Name(name));
            }
            StoreDeref => {
                let name = self.deref_name(operand)?;
                self.store(offset, Expr::Name(name));
            }
            StoreAttr => {
                let attr = self.name_at(operand)?;
                let value = self.pop(offset);
                self.store(offset, Expr::Attribute { value: Box::new(value), attr });
            }
            StoreSubscr => {
                let index = self.pop(offset);
                let value = self.pop(offset);
                self.store(
                    offset,
                    Expr::Subscript { value: Box::new(value), index: Box::new(index) },
                );
            }
            StoreAnnotation => {
                let name = self.name_at(operand)?;
                let annotation = self.pop(offset);
                self.annotate(name, annotation);
            }
            SetupAnnotations => self.variable_annotations = true,
            DeleteName | DeleteGlobal => {
                let name = self.name_at(operand)?;
                self.emit(Stmt::Delete(Expr::Name(name)));
            }
            DeleteFast => {
                let name = self.varname_at(operand)?;
                self.emit(Stmt::Delete(Expr::Name(name)));
            }
            DeleteDeref => {
                let name = self.deref_name(operand)?;
                self.emit(Stmt::Delete(Expr::Name(name)));
            }
            DeleteAttr => {
                let attr = self.name_at(operand)?;
                let value = self.pop(offset);
                self.emit(Stmt::Delete(Expr::Attribute { value: Box::new(value), attr }));
            }
            DeleteSubscr => {
                let index = self.pop(offset);
                let value = self.pop(offset);
                self.emit(Stmt::Delete(Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                }));
            }

            // --- calls and scope construction ---
            CallFunction => {
                if self.version.uses_wordcode() {
                    self.call(offset, operand as usize, CallShape::Plain)?;
                } else {
                    self.call_packed(offset, operand, false, false)?;
                }
            }
            CallFunctionVar => self.call_packed(offset, operand, true, false)?,
            CallFunctionKw => {
                if self.version.uses_wordcode() {
                    self.call(offset, operand as usize, CallShape::NamesTuple)?;
                } else {
                    self.call_packed(offset, operand, false, true)?;
                }
            }
            CallFunctionVarKw => self.call_packed(offset, operand, true, true)?,
            CallFunctionEx => self.call_ex(offset, operand)?,
            Call => self.call(offset, operand as usize, CallShape::KwNamesSideband)?,
            CallMethod => self.call(offset, operand as usize, CallShape::Plain)?,
            CallIntrinsic1 => self.call_intrinsic(offset, operand),
            CallIntrinsic2 => {
                // Every two-operand intrinsic (PREP_RERAISE_STAR for
                // except*, the PEP 695 generics constructors) pops two and
                // pushes one; none of them has a source form we rebuild.
                let _right = self.pop(offset);
                let _left = self.pop(offset);
                self.soft_error(offset, "two-operand intrinsic is not reconstructed");
                self.push(Expr::unknown());
            }
            KwNames => {
                let names = self.const_at(operand)?;
                self.kw_names = match names {
                    Object::Tuple(items) => items
                        .into_iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
            }
            MakeFunction => self.make_function(offset, operand, false)?,
            MakeClosure => self.make_function(offset, operand, true)?,
            BuildClass => {
                // py2: pop the evaluated body call, bases, and name.
                let body_call = self.pop(offset);
                let bases = self.pop(offset);
                let name = self.pop(offset);
                let class = self.build_legacy_class(offset, name, bases, body_call)?;
                self.push(class);
            }

            // --- imports ---
            ImportName => self.import_name(offset, operand)?,
            ImportFrom => {
                let name = self.name_at(operand)?;
                if self.pending_from.is_none() {
                    if let Some(Expr::ImportRef { module }) = self.stack.last() {
                        self.pending_from = Some((module.clone(), Vec::new()));
                    }
                }
                self.last_from_name = Some(name.clone());
                self.push(Expr::Name(name));
            }
            ImportStar => {
                let popped = self.pop(offset);
                if let Expr::ImportRef { module } = popped {
                    self.emit(Stmt::ImportStar { module });
                } else {
                    self.soft_error(offset, "IMPORT_STAR without module");
                }
                self.pending_from = None;
            }

            // --- control flow ---
            JumpForward => self.jump_to(offset, insn.target.unwrap_or(insn.next), insn.next)?,
            JumpAbsolute => self.jump_to(offset, insn.target.unwrap_or(insn.next), insn.next)?,
            JumpBackward | JumpBackwardNoInterrupt => {
                self.jump_to(offset, insn.target.unwrap_or(0), insn.next)?
            }
            PopJumpIfFalse | JumpIfFalse => {
                if insn.opcode == JumpIfFalse {
                    self.cond_pops = 1;
                }
                let cond = self.pop(offset);
                self.cond_jump(offset, cond, insn.target.unwrap_or(insn.next));
            }
            PopJumpIfTrue | JumpIfTrue => {
                if insn.opcode == JumpIfTrue {
                    self.cond_pops = 1;
                }
                let cond = self.pop(offset);
                let cond = negate(cond);
                self.cond_jump(offset, cond, insn.target.unwrap_or(insn.next));
            }
            PopJumpIfNone | PopJumpIfNotNone => {
                let value = self.pop(offset);
                let op = if insn.opcode == PopJumpIfNone { CmpOp::IsNot } else { CmpOp::Is };
                // The branch is taken to skip the block, so the block runs
                // on the opposite of the jump condition.
                let cond = Expr::Compare {
                    first: Box::new(value),
                    rest: vec![(op, Expr::none())],
                };
                self.cond_jump(offset, cond, insn.target.unwrap_or(insn.next));
            }
            JumpIfFalseOrPop => {
                let value = self.pop(offset);
                self.pending_bool.push(BoolFrame {
                    op: BoolOp::And,
                    value,
                    target: insn.target.unwrap_or(insn.next),
                });
            }
            JumpIfTrueOrPop => {
                let value = self.pop(offset);
                self.pending_bool.push(BoolFrame {
                    op: BoolOp::Or,
                    value,
                    target: insn.target.unwrap_or(insn.next),
                });
            }
            PopJumpBackIfTrue | PopJumpBackIfFalse | PopJumpBackIfNone | PopJumpBackIfNotNone => {
                let cond = self.pop(offset);
                let at_loop_end = self
                    .innermost_loop()
                    .map(|l| l.end == insn.next)
                    .unwrap_or(false);
                if !at_loop_end {
                    // A mid-loop backward test reads as a conditional
                    // continue.
                    let cond = if insn.opcode == PopJumpBackIfFalse { negate(cond) } else { cond };
                    let mut synthetic = Block::new(BlockKind::If { cond }, insn.next);
                    synthetic.push(Stmt::Keyword(KeywordKind::Continue));
                    self.emit(Stmt::Block(synthetic));
                }
            }
            JumpIfNotExcMatch => {
                let exc_type = self.pop(offset);
                self.open_except(offset, Some(exc_type), insn.target.unwrap_or(insn.next));
            }

            ForIter => self.for_iter(offset, insn.target.unwrap_or(insn.next)),
            ForLoop => {
                self.soft_error(offset, "ancient FOR_LOOP is not reconstructed");
            }
            SetupLoop => {
                let target = insn.target.unwrap_or(insn.next);
                self.open_block(
                    Block::uninited(BlockKind::While { cond: None }, target).starting_at(offset),
                );
            }
            BreakLoop => self.emit(Stmt::Keyword(KeywordKind::Break)),
            ContinueLoop => self.emit(Stmt::Keyword(KeywordKind::Continue)),

            SetupExcept | SetupFinally => {
                self.need_try.push(insn.target.unwrap_or(insn.next));
            }
            PopBlock => self.pop_block(),
            EndFinally => self.end_finally(offset)?,
            Reraise => {
                if self.in_dispatch() {
                    self.try_frames.pop();
                }
            }
            CheckExcMatch => {
                let exc_type = self.pop(offset);
                self.push(Expr::Compare {
                    first: Box::new(Expr::Name("<exception>".to_string())),
                    rest: vec![(CmpOp::ExcMatch, exc_type)],
                });
            }
            WithCleanup | WithCleanupStart => {
                if matches!(self.stack.last(), Some(Expr::Const(Object::None))) {
                    self.stack.pop();
                }
            }

            SetupWith => {
                let ctx = self.pop(offset);
                let target = insn.target.unwrap_or(insn.next);
                self.open_block(
                    Block::uninited(BlockKind::With { ctx, binding: None }, target)
                        .starting_at(offset),
                );
            }
            BeforeWith => {
                let ctx = self.pop(offset);
                let end = self.parent_end();
                self.open_block(
                    Block::uninited(BlockKind::With { ctx, binding: None }, end)
                        .starting_at(offset),
                );
            }

            RaiseVarargs => self.raise_varargs(offset, operand),

            // --- returns, yields, awaits ---
            ReturnValue => {
                let value = self.pop(offset);
                self.emit_return(offset, value, insn.next);
            }
            ReturnConst => {
                let value = Expr::Const(self.const_at(operand)?);
                self.emit_return(offset, value, insn.next);
            }
            YieldValue => {
                if matches!(self.stack.last(), Some(Expr::Await(_))) {
                    // Part of the 3.11 SEND loop around an await.
                    return Ok(());
                }
                let value = self.pop(offset);
                let value = if value.is_none_const() { None } else { Some(Box::new(value)) };
                if self.version < PythonVersion::new(2, 5) {
                    self.emit(Stmt::Expression(Expr::Yield(value)));
                } else {
                    self.push(Expr::Yield(value));
                }
            }
            YieldFrom => {
                let sent = self.pop(offset);
                if !sent.is_none_const() {
                    self.soft_error(offset, "YIELD_FROM with non-None sent value");
                }
                let source = self.pop(offset);
                if matches!(source, Expr::Await(_)) {
                    self.push(source);
                } else {
                    self.push(Expr::YieldFrom(Box::new(source)));
                }
            }
            GetAwaitable => {
                let value = self.pop(offset);
                self.push(Expr::Await(Box::new(value)));
            }
            Send => {
                if matches!(self.stack.last(), Some(Expr::Const(Object::None))) {
                    self.stack.pop();
                }
            }

            // --- py2 statements ---
            PrintExpr => {
                let value = self.pop(offset);
                self.emit(Stmt::Expression(value));
            }
            PrintItem => {
                let value = self.pop(offset);
                self.print_item(None, Some(value));
            }
            PrintNewline => self.print_newline(None),
            PrintItemTo => {
                let dest = self.pop(offset);
                let value = self.pop(offset);
                self.print_item(Some(dest), Some(value));
            }
            PrintNewlineTo => {
                let dest = self.pop(offset);
                self.print_newline(Some(dest));
            }
            ExecStmt => {
                let locals = self.pop(offset);
                let globals = self.pop(offset);
                let body = self.pop(offset);
                let globals = exec_operand(globals, &body);
                let locals = exec_operand(locals, &body);
                self.emit(Stmt::Exec { body, globals, locals });
            }

            // --- unsupported idioms degrade softly ---
            GetLen | MatchMapping | MatchSequence | MatchKeys | MatchClass => {
                self.soft_error(offset, "structural pattern matching is not reconstructed");
            }
            CallFinally => {}

            ExtendedArg => unreachable!("folded by the dispatcher"),
        }
        Ok(())
    }

    // === Handler helpers ===

    fn rotate(&mut self, offset: usize, n: usize) {
        if n < 2 {
            return;
        }
        if self.stack.len() < n {
            self.soft_error(offset, "ROT on short stack");
            return;
        }
        let top = self.stack.pop().expect("checked above");
        let at = self.stack.len() + 1 - n;
        self.stack.insert(at, top);
    }

    fn binary(&mut self, offset: usize, op: BinaryOp, inplace: bool) {
        let right = self.pop(offset);
        let left = self.pop(offset);
        self.push(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            inplace,
        });
    }

    fn unary(&mut self, offset: usize, op: UnaryOp) {
        let operand = self.pop(offset);
        self.push(Expr::Unary { op, operand: Box::new(operand) });
    }

    fn compare(&mut self, offset: usize, op: CmpOp) {
        let right = self.pop(offset);
        let left = self.pop(offset);
        self.push(Expr::Compare { first: Box::new(left), rest: vec![(op, right)] });
    }

    fn legacy_slice(&mut self, offset: usize, opcode: Opcode) -> Expr {
        let (lower, upper) = match opcode {
            Opcode::Slice0 => (None, None),
            Opcode::Slice1 => {
                let lower = self.pop(offset);
                (Some(Box::new(lower)), None)
            }
            Opcode::Slice2 => {
                let upper = self.pop(offset);
                (None, Some(Box::new(upper)))
            }
            _ => {
                let upper = self.pop(offset);
                let lower = self.pop(offset);
                (Some(Box::new(lower)), Some(Box::new(upper)))
            }
        };
        let value = self.pop(offset);
        Expr::Subscript {
            value: Box::new(value),
            index: Box::new(Expr::Slice { lower, upper, step: None }),
        }
    }

    fn unpack_value(&mut self, offset: usize) -> Option<Expr> {
        let cur = self.cur_ref();
        let binding_target = matches!(cur.kind, BlockKind::For { .. } | BlockKind::With { .. })
            && !cur.inited
            || matches!(cur.kind, BlockKind::Except { .. }) && self.handler_pops > 0
            || !self.pending_unpack.is_empty();
        if binding_target {
            None
        } else {
            Some(self.pop(offset))
        }
    }

    fn pop_top(&mut self, offset: usize) {
        if self.handler_pops > 0 {
            self.handler_pops -= 1;
            return;
        }
        if self.cond_pops > 0 {
            self.cond_pops -= 1;
            return;
        }
        if self.in_dispatch() {
            // A bare except arm begins by discarding the exception triple.
            let start = offset;
            let arm_end = self
                .try_frames
                .last()
                .and_then(|f| f.end)
                .unwrap_or_else(|| self.parent_end());
            self.open_except(start, None, arm_end);
            self.handler_pops = 2;
            return;
        }
        if matches!(self.cur_ref().kind, BlockKind::With { .. }) && !self.cur_ref().inited {
            self.cur().inited = true;
            return;
        }
        let value = self.pop(offset);
        match value {
            Expr::Null => {}
            Expr::Const(Object::None) => {}
            Expr::ImportRef { module } => {
                if let Some((_, names)) = self.pending_from.take() {
                    self.emit(Stmt::ImportFrom { module, names });
                } else {
                    self.emit(Stmt::Import { module, alias: None });
                }
            }
            value => self.emit(Stmt::Expression(value)),
        }
    }

    fn cond_jump(&mut self, offset: usize, cond: Expr, target: usize) {
        // Except-arm dispatch: the condition is the exception match.
        if self.in_dispatch() {
            if let Expr::Compare { rest, .. } = &cond {
                if rest.len() == 1 && rest[0].0 == CmpOp::ExcMatch {
                    let exc_type = rest[0].1.clone();
                    self.open_except(offset, Some(exc_type), target);
                    return;
                }
            }
        }
        // A while-loop condition lands in the freshly opened loop block.
        {
            let cur = self.cur_ref();
            if matches!(cur.kind, BlockKind::While { cond: None }) && !cur.inited && cur.body.is_empty()
            {
                let cur = self.cur();
                cur.kind = BlockKind::While { cond: Some(cond) };
                cur.inited = true;
                if target <= cur.end {
                    cur.end = target;
                }
                return;
            }
        }
        self.open_block(Block::new(BlockKind::If { cond }, target).starting_at(offset));
    }

    fn for_iter(&mut self, offset: usize, target: usize) {
        let cur = self.cur_ref();
        if matches!(cur.kind, BlockKind::While { cond: None }) && !cur.inited && cur.body.is_empty()
        {
            // A loop head opened speculatively turns out to be a for loop.
            let iter = self.pop(offset);
            let cur = self.cur();
            cur.kind = BlockKind::For { iter, target: None, is_async: false };
            cur.end = target;
            return;
        }
        let iter = self.pop(offset);
        self.open_block(
            Block::uninited(BlockKind::For { iter, target: None, is_async: false }, target)
                .starting_at(offset),
        );
    }

    fn pop_block(&mut self) {
        match self.cur_ref().kind {
            BlockKind::Try => {
                if self.close_one().is_err() {
                    return;
                }
                if let Some(frame) = self.try_frames.last_mut() {
                    if frame.state == TryState::Body {
                        frame.state = TryState::AwaitEnd;
                    }
                }
            }
            BlockKind::With { .. } => {
                let _ = self.close_one();
            }
            // Loop blocks close on their own end offsets.
            _ => {}
        }
    }

    fn end_finally(&mut self, _offset: usize) -> Result<()> {
        if matches!(self.cur_ref().kind, BlockKind::Finally) {
            self.close_one()?;
            self.try_frames.pop();
        } else if self.in_dispatch() {
            self.try_frames.pop();
        }
        if matches!(self.stack.last(), Some(Expr::Const(Object::None))) {
            self.stack.pop();
        }
        Ok(())
    }

    fn jump_to(&mut self, offset: usize, target: usize, next: usize) -> Result<()> {
        // The jump after a closed try body names the construct's end.
        if let Some(frame) = self.try_frames.last_mut() {
            if frame.state == TryState::AwaitEnd {
                frame.end = Some(target);
                return Ok(());
            }
        }

        if target <= offset {
            // Backward: loop back-edge or continue.
            if let Some(loop_block) = self.innermost_loop() {
                if next != loop_block.end {
                    self.emit(Stmt::Keyword(KeywordKind::Continue));
                }
                return Ok(());
            }
            self.soft_error(offset, "backward jump outside any loop");
            return Ok(());
        }

        let cur = self.cur_ref();
        match &cur.kind {
            BlockKind::Except { .. } | BlockKind::Finally if next == cur.end || target >= cur.end => {
                // Handler exit; the arm closes at its own boundary.
                return Ok(());
            }
            BlockKind::If { .. } | BlockKind::Elif { .. } if next == cur.end && target > cur.end => {
                // End of an if body skipping over an else branch.
                let loop_exit = self
                    .innermost_loop()
                    .map(|l| target >= l.end)
                    .unwrap_or(false);
                if loop_exit {
                    self.emit(Stmt::Keyword(KeywordKind::Break));
                    return Ok(());
                }
                self.close_one()?;
                self.open_block(Block::new(BlockKind::Else, target).starting_at(offset));
                if self.version < PythonVersion::new(2, 7) {
                    self.cond_pops = 1;
                }
                self.else_pop = true;
                return Ok(());
            }
            _ => {}
        }

        // A forward jump past the innermost loop's end is a break.
        if let Some(loop_block) = self.innermost_loop() {
            if target >= loop_block.end && next != loop_block.end {
                self.emit(Stmt::Keyword(KeywordKind::Break));
                return Ok(());
            }
        }
        Ok(())
    }

    fn raise_varargs(&mut self, offset: usize, operand: u32) {
        let exprs = self.popn(offset, operand as usize);

        // Assert recovery: a raise of AssertionError guarded by an
        // inverted jump is an assert statement.
        if let Some(first) = exprs.first() {
            let is_assertion = matches!(first, Expr::Name(n) if n == "AssertionError")
                || matches!(
                    first,
                    Expr::Call { func, .. } if matches!(&**func, Expr::Name(n) if n == "AssertionError")
                );
            if is_assertion {
                if let BlockKind::If { cond } = &self.cur_ref().kind {
                    if self.cur_ref().body.is_empty() {
                        let test = strip_not(cond.clone());
                        let message = match first {
                            Expr::Call { args, .. } => args.first().cloned(),
                            _ => exprs.get(1).cloned(),
                        };
                        self.blocks.pop();
                        self.emit(Stmt::Assert { test, message });
                        return;
                    }
                }
            }
        }
        self.emit(Stmt::Raise(exprs));
    }

    fn emit_return(&mut self, _offset: usize, value: Expr, next: usize) {
        if matches!(self.blocks[0].kind, BlockKind::Class) {
            return;
        }
        if self.code.comprehension_kind().is_some() {
            return;
        }
        // The compiler's implicit trailing `return None` is not source.
        let implicit = value.is_none_const()
            && next >= self.code.code.len()
            && self.blocks.len() == 1
            && !self.in_lambda;
        if implicit {
            return;
        }
        let value = if value.is_none_const() && !self.in_lambda {
            None
        } else {
            Some(value)
        };
        self.emit(Stmt::Return(value));
    }

    fn print_item(&mut self, dest: Option<Expr>, value: Option<Expr>) {
        if let Some(Stmt::Print { values, newline, dest: prev_dest }) = self.cur().body.last_mut() {
            if !*newline && (dest.is_none() || *prev_dest == dest) {
                if let Some(value) = value {
                    values.push(value);
                }
                return;
            }
        }
        self.emit(Stmt::Print {
            dest,
            values: value.into_iter().collect(),
            newline: false,
        });
    }

    fn print_newline(&mut self, dest: Option<Expr>) {
        if let Some(Stmt::Print { newline, dest: prev_dest, .. }) = self.cur().body.last_mut() {
            if !*newline && (dest.is_none() || *prev_dest == dest) {
                *newline = true;
                return;
            }
        }
        self.emit(Stmt::Print { dest, values: Vec::new(), newline: true });
    }

    // === Imports ===

    fn import_name(&mut self, offset: usize, operand: u32) -> Result<()> {
        let name = self.name_at(operand)?;
        let mut fromlist = Expr::none();
        let mut level = 0i64;
        if self.version >= PythonVersion::new(2, 5) {
            fromlist = self.pop(offset);
            if let Expr::Const(Object::Int(n)) = self.pop(offset) {
                level = n.max(0);
            }
        } else if self.version >= PythonVersion::new(2, 0) {
            fromlist = self.pop(offset);
        }
        let module = format!("{}{}", ".".repeat(level as usize), name);
        if let Expr::Const(Object::Tuple(items)) = &fromlist {
            if !items.is_empty() && items[0].as_str() != Some("*") {
                self.pending_from = Some((module.clone(), Vec::new()));
            }
        }
        self.push(Expr::ImportRef { module });
        Ok(())
    }

    // === Calls ===

    /// py2-era packed call operand: positional count in the low byte,
    /// keyword count in the high byte, star/double-star on top.
    fn call_packed(&mut self, offset: usize, operand: u32, star: bool, dstar: bool) -> Result<()> {
        let dstar_arg = if dstar { Some(Box::new(self.pop(offset))) } else { None };
        let star_arg = if star { Some(Box::new(self.pop(offset))) } else { None };
        let kw_count = (operand >> 8) as usize;
        let pos_count = (operand & 0xff) as usize;
        let mut kwargs = Vec::with_capacity(kw_count);
        for _ in 0..kw_count {
            let value = self.pop(offset);
            let key = self.pop(offset);
            let key = match key {
                Expr::Const(Object::Str(k)) => k,
                _ => {
                    self.soft_error(offset, "non-string keyword name");
                    "<unknown>".to_string()
                }
            };
            kwargs.push((key, value));
        }
        kwargs.reverse();

        if star_arg.is_none() && dstar_arg.is_none() {
            if let Some(class) = self.try_class_reduce(offset, pos_count, &kwargs)? {
                self.push(class);
                return Ok(());
            }
        }

        let args = self.popn(offset, pos_count);
        let func = self.pop(offset);
        let call = self.build_call(offset, func, args, kwargs, star_arg, dstar_arg)?;
        self.push(call);
        Ok(())
    }

    fn call(&mut self, offset: usize, argc: usize, shape: CallShape) -> Result<()> {
        let kwargs;
        let pos_count;
        match shape {
            CallShape::Plain => {
                kwargs = Vec::new();
                pos_count = argc;
            }
            CallShape::NamesTuple => {
                let names = self.pop(offset);
                let names: Vec<String> = match names {
                    Expr::Const(Object::Tuple(items)) => items
                        .into_iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect(),
                    _ => {
                        self.soft_error(offset, "CALL_FUNCTION_KW without name tuple");
                        Vec::new()
                    }
                };
                let values = self.popn(offset, names.len().min(argc));
                kwargs = names.into_iter().zip(values).collect();
                pos_count = argc.saturating_sub(kwargs.len());
            }
            CallShape::KwNamesSideband => {
                let names = std::mem::take(&mut self.kw_names);
                let values = self.popn(offset, names.len().min(argc));
                kwargs = names.into_iter().zip(values).collect();
                pos_count = argc.saturating_sub(kwargs.len());
            }
        }

        if let Some(class) = self.try_class_reduce(offset, pos_count, &kwargs)? {
            self.push(class);
            return Ok(());
        }

        let args = self.popn(offset, pos_count);
        let func = self.pop(offset);
        if matches!(self.stack.last(), Some(Expr::Null)) {
            self.stack.pop();
        }
        let call = self.build_call(offset, func, args, kwargs, None, None)?;
        self.push(call);
        Ok(())
    }

    fn call_ex(&mut self, offset: usize, operand: u32) -> Result<()> {
        let kwargs_value = if operand & 1 != 0 { Some(self.pop(offset)) } else { None };
        let args_value = self.pop(offset);
        let func = self.pop(offset);
        if matches!(self.stack.last(), Some(Expr::Null)) {
            self.stack.pop();
        }

        let (args, star) = match args_value {
            Expr::Tuple(items) | Expr::List(items) => {
                // A trailing Starred element keeps its star in print form.
                (items, None)
            }
            other => (Vec::new(), Some(Box::new(other))),
        };
        let (kwargs, dstar) = match kwargs_value {
            Some(Expr::Map(pairs)) => {
                let mut kwargs = Vec::new();
                let mut rest = Vec::new();
                for (key, value) in pairs {
                    match key {
                        Expr::Const(Object::Str(k)) => kwargs.push((k, value)),
                        other => rest.push((other, value)),
                    }
                }
                let dstar = if rest.is_empty() {
                    None
                } else {
                    Some(Box::new(Expr::Map(rest)))
                };
                (kwargs, dstar)
            }
            Some(Expr::ConstMap { keys, values }) => {
                let kwargs = keys
                    .into_iter()
                    .zip(values)
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                    .collect();
                (kwargs, None)
            }
            Some(other) => (Vec::new(), Some(Box::new(other))),
            None => (Vec::new(), None),
        };

        let call = self.build_call(offset, func, args, kwargs, star, dstar)?;
        self.push(call);
        Ok(())
    }

    fn call_intrinsic(&mut self, offset: usize, operand: u32) {
        match operand {
            // INTRINSIC_IMPORT_STAR
            2 => {
                let popped = self.pop(offset);
                if let Expr::ImportRef { module } = popped {
                    self.emit(Stmt::ImportStar { module });
                    self.push(Expr::none());
                } else {
                    self.push(Expr::none());
                }
                self.pending_from = None;
            }
            // INTRINSIC_UNARY_POSITIVE
            5 => self.unary(offset, UnaryOp::Pos),
            // INTRINSIC_LIST_TO_TUPLE
            6 => {
                let list = self.pop(offset);
                match list {
                    Expr::List(items) => self.push(Expr::Tuple(items)),
                    other => self.push(other),
                }
            }
            1 => {
                let value = self.pop(offset);
                self.emit(Stmt::Expression(value));
                self.push(Expr::none());
            }
            _ => {}
        }
    }

    /// Speculatively match the class-builder call shape. The stack is
    /// snapshotted first and restored untouched when the shape does not
    /// match.
    fn try_class_reduce(
        &mut self,
        offset: usize,
        pos_count: usize,
        kwargs: &[(String, Expr)],
    ) -> Result<Option<Expr>> {
        if pos_count < 2 || self.stack.len() < pos_count + 1 {
            return Ok(None);
        }
        self.history.push(self.stack.clone());

        let mut args = self.popn(offset, pos_count);
        let func = self.pop(offset);
        let null_below = matches!(self.stack.last(), Some(Expr::Null));
        if null_below {
            self.stack.pop();
        }

        let matched = matches!(func, Expr::BuildClass)
            && matches!(args.first(), Some(Expr::Function(_)))
            && matches!(args.get(1), Some(Expr::Const(Object::Str(_))));
        if !matched {
            self.stack = self.history.pop().expect("snapshot pushed above");
            return Ok(None);
        }
        self.history.pop();

        let bases = args.split_off(2);
        let Some(Expr::Const(Object::Str(name))) = args.pop() else {
            unreachable!("matched above");
        };
        let Some(Expr::Function(body_fn)) = args.pop() else {
            unreachable!("matched above");
        };
        let body = self.dec.decompile_scope(&body_fn.code, BlockKind::Class)?;
        Ok(Some(Expr::Class {
            name,
            bases,
            keywords: kwargs.to_vec(),
            body: Box::new(body),
        }))
    }

    fn build_legacy_class(
        &mut self,
        offset: usize,
        name: Expr,
        bases: Expr,
        body_call: Expr,
    ) -> Result<Expr> {
        let name = match name {
            Expr::Const(Object::Str(name)) => name,
            _ => {
                self.soft_error(offset, "class name is not a string");
                "<unknown>".to_string()
            }
        };
        let bases = match bases {
            Expr::Tuple(items) => items,
            other => vec![other],
        };
        let code = match &body_call {
            Expr::Call { func, .. } => func.as_function().map(|f| f.code.clone()),
            Expr::Function(f) => Some(f.code.clone()),
            _ => None,
        };
        let body = match code {
            Some(code) => self.dec.decompile_scope(&code, BlockKind::Class)?,
            None => {
                self.soft_error(offset, "class body is not a code object");
                Block::new(BlockKind::Class, 0)
            }
        };
        Ok(Expr::Class { name, bases, keywords: Vec::new(), body: Box::new(body) })
    }

    /// Assemble a Call node, rewriting comprehension invocations and
    /// hoisting decorated function definitions out of the argument list.
    fn build_call(
        &mut self,
        offset: usize,
        func: Expr,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        star: Option<Box<Expr>>,
        dstar: Option<Box<Expr>>,
    ) -> Result<Expr> {
        // Calling a synthesized comprehension scope with its iterable.
        if let Expr::Function(comp_fn) = &func {
            if comp_fn.code.comprehension_kind().is_some() && args.len() == 1 {
                let iterable = args.into_iter().next().expect("len checked");
                if let Some(comp) = extract_comprehension(comp_fn, iterable) {
                    return Ok(comp);
                }
                self.soft_error(offset, "unrecognized comprehension body");
                return Ok(Expr::unknown());
            }
        }

        // A named function passed as an argument is a decorator target:
        // define it first, then pass the name.
        let args = args
            .into_iter()
            .map(|arg| match arg {
                Expr::Function(f)
                    if !f.is_lambda() && f.code.comprehension_kind().is_none() =>
                {
                    let name = f.code.name.clone();
                    self.emit(Stmt::Store {
                        targets: vec![Expr::Name(name.clone())],
                        value: Expr::Function(f),
                    });
                    Expr::Name(name)
                }
                other => other,
            })
            .collect();

        Ok(Expr::Call { func: Box::new(func), args, kwargs, star, dstar })
    }

    // === Function construction ===

    fn make_function(&mut self, offset: usize, operand: u32, closure: bool) -> Result<()> {
        let v = self.version;
        let mut defaults = Vec::new();
        let mut kw_defaults = Vec::new();
        let mut annotations = Vec::new();

        let code_expr;
        if v >= PythonVersion::new(3, 11) {
            code_expr = self.pop(offset);
            let flags = operand;
            if flags & 0x08 != 0 {
                let _closure = self.pop(offset);
            }
            if flags & 0x04 != 0 {
                annotations = string_keyed_pairs(self.pop(offset));
            }
            if flags & 0x02 != 0 {
                kw_defaults = string_keyed_pairs(self.pop(offset));
            }
            if flags & 0x01 != 0 {
                defaults = unpack_sequence_expr(self.pop(offset));
            }
        } else if v.uses_wordcode() {
            let _qualname = self.pop(offset);
            code_expr = self.pop(offset);
            let flags = operand;
            if flags & 0x08 != 0 {
                let _closure = self.pop(offset);
            }
            if flags & 0x04 != 0 {
                annotations = string_keyed_pairs(self.pop(offset));
            }
            if flags & 0x02 != 0 {
                kw_defaults = string_keyed_pairs(self.pop(offset));
            }
            if flags & 0x01 != 0 {
                defaults = unpack_sequence_expr(self.pop(offset));
            }
        } else if v.is_py3() {
            if v >= PythonVersion::new(3, 3) {
                let _qualname = self.pop(offset);
            }
            code_expr = self.pop(offset);
            if closure {
                let _closure = self.pop(offset);
            }
            let annot_count = ((operand >> 16) & 0x7fff) as usize;
            if annot_count > 0 {
                let names = self.pop(offset);
                let values = self.popn(offset, annot_count - 1);
                if let Expr::Const(Object::Tuple(names)) = names {
                    annotations = names
                        .iter()
                        .filter_map(|n| n.as_str().map(str::to_string))
                        .zip(values)
                        .collect();
                }
            }
            let kw_count = ((operand >> 8) & 0xff) as usize;
            for _ in 0..kw_count {
                let value = self.pop(offset);
                let key = self.pop(offset);
                if let Expr::Const(Object::Str(key)) = key {
                    kw_defaults.push((key, value));
                }
            }
            kw_defaults.reverse();
            defaults = self.popn(offset, (operand & 0xff) as usize);
        } else {
            code_expr = self.pop(offset);
            defaults = self.popn(offset, operand as usize);
            if closure {
                let _closure = self.pop(offset);
            }
        }

        let code = match code_expr {
            Expr::Const(Object::Code(code)) => code,
            _ => {
                self.soft_error(offset, "MAKE_FUNCTION without code constant");
                self.push(Expr::unknown());
                return Ok(());
            }
        };

        let body = self.dec.decompile_scope(&code, BlockKind::Function)?;
        self.push(Expr::Function(FunctionExpr {
            code,
            body: Box::new(body),
            defaults,
            kw_defaults,
            annotations,
        }));
        Ok(())
    }

}

/// String-keyed pairs out of whichever shape the compiler used: a
/// flattened tuple (3.10+ annotations), a const-key map, or a dict
/// display (keyword defaults).
fn string_keyed_pairs(value: Expr) -> Vec<(String, Expr)> {
    match value {
        Expr::Tuple(items) => {
            let mut out = Vec::new();
            let mut iter = items.into_iter();
            while let (Some(name), Some(ann)) = (iter.next(), iter.next()) {
                if let Expr::Const(Object::Str(name)) = name {
                    out.push((name, ann));
                }
            }
            out
        }
        Expr::ConstMap { keys, values } => keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
            .collect(),
        Expr::Map(pairs) => pairs
            .into_iter()
            .filter_map(|(k, v)| match k {
                Expr::Const(Object::Str(k)) => Some((k, v)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Call-argument layout variants across versions.
enum CallShape {
    Plain,
    NamesTuple,
    KwNamesSideband,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingSlot {
    None,
    ForTarget,
    WithBinding,
    ExceptBinding,
}

/// The 3.11 unified BINARY_OP sub-opcode table; indices 13 and up are the
/// in-place forms in the same order.
fn binary_op_index(operand: u32) -> Option<(BinaryOp, bool)> {
    const OPS: [BinaryOp; 13] = [
        BinaryOp::Add,
        BinaryOp::BitAnd,
        BinaryOp::FloorDiv,
        BinaryOp::LShift,
        BinaryOp::MatMul,
        BinaryOp::Mul,
        BinaryOp::Mod,
        BinaryOp::BitOr,
        BinaryOp::Pow,
        BinaryOp::RShift,
        BinaryOp::Sub,
        BinaryOp::Div,
        BinaryOp::BitXor,
    ];
    let index = operand as usize;
    if index < OPS.len() {
        Some((OPS[index], false))
    } else if index < OPS.len() * 2 {
        Some((OPS[index - OPS.len()], true))
    } else {
        None
    }
}

fn is_branch(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::JumpBackward
            | Opcode::JumpBackwardNoInterrupt
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone
            | Opcode::PopJumpBackIfFalse
            | Opcode::PopJumpBackIfTrue
            | Opcode::PopJumpBackIfNone
            | Opcode::PopJumpBackIfNotNone
            | Opcode::PopBlock
    )
}

/// Local tidy-ups applied when a block closes.
fn finish_block(mut block: Block) -> Block {
    // `if a: if b: X` with nothing else collapses to `if a and b: X`.
    if let BlockKind::If { cond } = &block.kind {
        if block.body.len() == 1 {
            if let Some(Stmt::Block(inner)) = block.body.first() {
                if let BlockKind::If { cond: inner_cond } = &inner.kind {
                    let merged = merge_bool(BoolOp::And, cond.clone(), inner_cond.clone());
                    let Some(Stmt::Block(inner)) = block.body.pop() else {
                        unreachable!("matched above");
                    };
                    block.kind = BlockKind::If { cond: merged };
                    block.body = inner.body;
                    block.docstring = block.docstring.or(inner.docstring);
                    return block;
                }
                // 3.11 while loops: the duplicated head test wraps the
                // loop body in an if.
                if matches!(inner.kind, BlockKind::While { cond: None }) {
                    let head_cond = cond.clone();
                    let Some(Stmt::Block(inner)) = block.body.pop() else {
                        unreachable!("matched above");
                    };
                    block.kind = BlockKind::While { cond: Some(head_cond) };
                    block.body = inner.body;
                    return block;
                }
            }
        }
    }
    block
}

/// Fold short-circuit values, merging adjacent comparisons into chains.
fn merge_bool(op: BoolOp, left: Expr, right: Expr) -> Expr {
    if op == BoolOp::And {
        if let (
            Expr::Compare { first, rest },
            Expr::Compare { first: right_first, rest: right_rest },
        ) = (&left, &right)
        {
            if rest.last().map(|(_, operand)| operand) == Some(right_first.as_ref()) {
                let mut chain = rest.clone();
                chain.extend(right_rest.clone());
                return Expr::Compare { first: first.clone(), rest: chain };
            }
        }
    }
    match right {
        Expr::BoolChain { op: right_op, mut values } if right_op == op => {
            values.insert(0, left);
            Expr::BoolChain { op, values }
        }
        right => Expr::BoolChain { op, values: vec![left, right] },
    }
}

fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Unary { op: UnaryOp::Not, operand } => *operand,
        Expr::Compare { first, mut rest } if rest.len() == 1 => {
            let negated = match rest[0].0 {
                CmpOp::Is => Some(CmpOp::IsNot),
                CmpOp::IsNot => Some(CmpOp::Is),
                CmpOp::In => Some(CmpOp::NotIn),
                CmpOp::NotIn => Some(CmpOp::In),
                CmpOp::Eq => Some(CmpOp::Ne),
                CmpOp::Ne => Some(CmpOp::Eq),
                _ => None,
            };
            match negated {
                Some(op) => {
                    rest[0].0 = op;
                    Expr::Compare { first, rest }
                }
                None => Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(Expr::Compare { first, rest }),
                },
            }
        }
        expr => Expr::Unary { op: UnaryOp::Not, operand: Box::new(expr) },
    }
}

fn strip_not(expr: Expr) -> Expr {
    match expr {
        Expr::Unary { op: UnaryOp::Not, operand } => *operand,
        other => negate(other),
    }
}

fn slice_bound(expr: Expr) -> Option<Box<Expr>> {
    if expr.is_none_const() {
        None
    } else {
        Some(Box::new(expr))
    }
}

fn exec_operand(expr: Expr, body: &Expr) -> Option<Expr> {
    if expr.is_none_const() || expr == *body {
        None
    } else {
        Some(expr)
    }
}

fn unpack_sequence_expr(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::Tuple(items) | Expr::List(items) => items,
        Expr::Const(Object::Tuple(items)) => items.into_iter().map(Expr::Const).collect(),
        other => vec![other],
    }
}

/// Rebuild a comprehension expression from a synthesized scope's body.
fn extract_comprehension(func: &FunctionExpr, iterable: Expr) -> Option<Expr> {
    let kind = func.code.comprehension_kind()?;
    let mut clauses: Vec<CompClause> = Vec::new();
    let mut element = None;
    let mut value = None;

    fn walk(
        stmts: &[Stmt],
        clauses: &mut Vec<CompClause>,
        element: &mut Option<Expr>,
        value: &mut Option<Expr>,
        is_dict: bool,
    ) {
        for stmt in stmts {
            match stmt {
                Stmt::Block(block) => match &block.kind {
                    BlockKind::For { iter, target, .. } => {
                        clauses.push(CompClause {
                            target: target.clone().unwrap_or(Expr::unknown()),
                            iter: iter.clone(),
                            conds: Vec::new(),
                        });
                        walk(&block.body, clauses, element, value, is_dict);
                    }
                    BlockKind::If { cond } => {
                        if let Some(clause) = clauses.last_mut() {
                            clause.conds.push(cond.clone());
                        }
                        walk(&block.body, clauses, element, value, is_dict);
                    }
                    BlockKind::While { cond: Some(cond) } => {
                        if let Some(clause) = clauses.last_mut() {
                            clause.conds.push(cond.clone());
                        }
                        walk(&block.body, clauses, element, value, is_dict);
                    }
                    _ => walk(&block.body, clauses, element, value, is_dict),
                },
                Stmt::Expression(Expr::Tuple(pair)) if is_dict && pair.len() == 2 => {
                    *element = Some(pair[0].clone());
                    *value = Some(pair[1].clone());
                }
                Stmt::Expression(Expr::Yield(Some(expr))) => {
                    *element = Some((**expr).clone());
                }
                Stmt::Expression(expr) => {
                    *element = Some(expr.clone());
                }
                _ => {}
            }
        }
    }

    let is_dict = matches!(kind, crate::code::ComprehensionKind::Dict);
    walk(&func.body.body, &mut clauses, &mut element, &mut value, is_dict);

    if clauses.is_empty() {
        return None;
    }
    // The synthesized scope iterates its hidden `.0` argument.
    if let Some(first) = clauses.first_mut() {
        if matches!(&first.iter, Expr::Name(n) if n == ".0") {
            first.iter = iterable;
        }
    }
    let element = element?;
    Some(Expr::Comprehension {
        kind,
        element: Box::new(element),
        value: value.map(Box::new),
        clauses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_bool_flattens() {
        let a = Expr::Name("a".into());
        let b = Expr::Name("b".into());
        let c = Expr::Name("c".into());
        let inner = merge_bool(BoolOp::And, b.clone(), c.clone());
        let outer = merge_bool(BoolOp::And, a.clone(), inner);
        assert_eq!(
            outer,
            Expr::BoolChain { op: BoolOp::And, values: vec![a, b, c] }
        );
    }

    #[test]
    fn test_merge_bool_chains_comparisons() {
        let left = Expr::Compare {
            first: Box::new(Expr::Name("a".into())),
            rest: vec![(CmpOp::Lt, Expr::Name("b".into()))],
        };
        let right = Expr::Compare {
            first: Box::new(Expr::Name("b".into())),
            rest: vec![(CmpOp::Lt, Expr::Name("c".into()))],
        };
        let merged = merge_bool(BoolOp::And, left, right);
        assert_eq!(
            merged,
            Expr::Compare {
                first: Box::new(Expr::Name("a".into())),
                rest: vec![
                    (CmpOp::Lt, Expr::Name("b".into())),
                    (CmpOp::Lt, Expr::Name("c".into())),
                ],
            }
        );
    }

    #[test]
    fn test_negate_inverts_comparisons() {
        let eq = Expr::Compare {
            first: Box::new(Expr::Name("x".into())),
            rest: vec![(CmpOp::Eq, Expr::Name("y".into()))],
        };
        let ne = negate(eq.clone());
        assert_eq!(
            ne,
            Expr::Compare {
                first: Box::new(Expr::Name("x".into())),
                rest: vec![(CmpOp::Ne, Expr::Name("y".into()))],
            }
        );
        assert_eq!(negate(ne), eq);
    }

    #[test]
    fn test_negate_unwraps_not() {
        let x = Expr::Name("x".into());
        let not_x = Expr::Unary { op: UnaryOp::Not, operand: Box::new(x.clone()) };
        assert_eq!(negate(not_x), x);
    }
}
