//! Single-method bytecode assembly.
//!
//! [`CodeBuilder`] accumulates instructions for one JVM method while
//! tracking operand-stack depth, local-slot usage, forward-branch patches,
//! exception ranges and the line-number table. [`CodeBuilder::finish`]
//! consumes the builder and yields the finished [`MethodCode`], failing if
//! any label was left unresolved or the body outgrew the 16-bit code limit.

use smallvec::SmallVec;

use crate::classfile::op::Op;
use crate::error::CompileError;

/// Opaque handle to a jump target within one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum PatchKind {
    /// 16-bit signed offset relative to the opcode address.
    Branch16 { opcode_at: u32 },
    /// 32-bit signed tableswitch entry relative to the switch opcode.
    Switch32 { opcode_at: u32 },
}

#[derive(Debug, Default)]
struct LabelState {
    pos: Option<u32>,
    patches: SmallVec<[(u32, PatchKind); 2]>,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    in_use: bool,
    /// Pinned slots survive until explicitly freed and are never handed
    /// out again in between, even across handler re-entry.
    pinned: bool,
}

/// A protected bytecode span that may be suspended and resumed, as
/// `try` bodies are around `yield` points and inlined `finally` copies.
#[derive(Debug, Default)]
pub struct ExceptionRange {
    spans: SmallVec<[(u32, u32); 2]>,
    open: Option<u32>,
}

impl ExceptionRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, pc: u32) {
        debug_assert!(self.open.is_none(), "exception range already open");
        self.open = Some(pc);
    }

    /// Closes the current span without ending the range. Empty spans are
    /// dropped rather than recorded.
    pub fn suspend(&mut self, pc: u32) {
        if let Some(start) = self.open.take()
            && start < pc
        {
            self.spans.push((start, pc));
        }
    }

    pub fn resume(&mut self, pc: u32) {
        debug_assert!(self.open.is_none(), "exception range already open");
        self.open = Some(pc);
    }

    pub fn end(&mut self, pc: u32) {
        self.suspend(pc);
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

/// One row of the method's exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler: Label,
    /// Constant-pool class index, or 0 for a catch-all.
    pub catch_type: u16,
}

/// Finished bytecode for one method.
#[derive(Debug, Clone)]
pub struct MethodCode {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Resolved `(start_pc, end_pc, handler_pc, catch_type)` rows.
    pub exceptions: Vec<(u16, u16, u16, u16)>,
    /// `(start_pc, line)` pairs in pc order.
    pub line_numbers: Vec<(u16, u16)>,
}

/// Builder for one method body.
#[derive(Debug)]
pub struct CodeBuilder {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    exception_entries: Vec<ExceptionEntry>,
    /// First JVM local slot available for temporaries; lower slots hold
    /// the frame reference, parameters and named locals.
    first_temp: u16,
    temps: Vec<SlotState>,
    cur_stack: i32,
    max_stack: i32,
    line_numbers: Vec<(u32, u32)>,
    last_line: u32,
}

impl CodeBuilder {
    pub fn new(n_named_slots: u16) -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            exception_entries: Vec::new(),
            first_temp: n_named_slots,
            temps: Vec::new(),
            cur_stack: 0,
            max_stack: 0,
            line_numbers: Vec::new(),
            last_line: 0,
        }
    }

    /// Current bytecode position.
    pub fn pos(&self) -> u32 {
        self.code.len() as u32
    }

    fn adjust_stack(&mut self, op: Op, delta: i32) {
        self.cur_stack += delta;
        debug_assert!(self.cur_stack >= 0, "operand stack underflow after {op} at pc {}", self.pos());
        self.max_stack = self.max_stack.max(self.cur_stack);
    }

    /// Resets the tracked depth where control re-enters with a known stack,
    /// e.g. exception handlers start with exactly the thrown reference.
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.cur_stack = depth;
        self.max_stack = self.max_stack.max(depth);
    }

    pub fn stack_depth(&self) -> i32 {
        self.cur_stack
    }

    /// Emits an opcode with a fixed stack effect and no operands.
    pub fn emit(&mut self, op: Op) {
        let effect = op.stack_effect().unwrap_or(0);
        self.code.push(op.byte());
        self.adjust_stack(op, effect);
    }

    pub fn emit_areturn(&mut self) {
        self.code.push(Op::Areturn.byte());
        self.adjust_stack(Op::Areturn, -1);
    }

    pub fn emit_return(&mut self) {
        self.code.push(Op::Return.byte());
    }

    pub fn emit_athrow(&mut self) {
        self.code.push(Op::Athrow.byte());
        self.adjust_stack(Op::Athrow, -1);
    }

    /// Pushes a small integer via the shortest encoding.
    pub fn emit_iconst(&mut self, value: i32) -> Result<(), CompileError> {
        match value {
            -1 => self.emit(Op::IconstM1),
            0 => self.emit(Op::Iconst0),
            1 => self.emit(Op::Iconst1),
            2 => self.emit(Op::Iconst2),
            3 => self.emit(Op::Iconst3),
            4 => self.emit(Op::Iconst4),
            5 => self.emit(Op::Iconst5),
            -128..=127 => {
                self.code.push(Op::Bipush.byte());
                self.code.push(value as i8 as u8);
                self.adjust_stack(Op::Bipush, 1);
            }
            -32768..=32767 => {
                self.code.push(Op::Sipush.byte());
                self.code.extend_from_slice(&(value as i16).to_be_bytes());
                self.adjust_stack(Op::Sipush, 1);
            }
            _ => return Err(CompileError::internal("iconst operand out of 16-bit range")),
        }
        Ok(())
    }

    /// Loads a one-slot constant-pool entry, widening past index 255.
    pub fn emit_ldc(&mut self, pool_idx: u16) {
        if pool_idx <= 0xFF {
            self.code.push(Op::Ldc.byte());
            self.code.push(pool_idx as u8);
        } else {
            self.code.push(Op::LdcW.byte());
            self.code.extend_from_slice(&pool_idx.to_be_bytes());
        }
        self.adjust_stack(Op::Ldc, 1);
    }

    /// Loads a `long` or `double` entry; the tracked depth still moves by
    /// two slots as the JVM counts category-2 values.
    pub fn emit_ldc2(&mut self, pool_idx: u16) {
        self.code.push(Op::Ldc2W.byte());
        self.code.extend_from_slice(&pool_idx.to_be_bytes());
        self.adjust_stack(Op::Ldc2W, 2);
    }

    pub fn emit_aload(&mut self, slot: u16) -> Result<(), CompileError> {
        match slot {
            0 => self.emit(Op::Aload0),
            1 => self.emit(Op::Aload1),
            2 => self.emit(Op::Aload2),
            3 => self.emit(Op::Aload3),
            4..=255 => {
                self.code.push(Op::Aload.byte());
                self.code.push(slot as u8);
                self.adjust_stack(Op::Aload, 1);
            }
            _ => return Err(CompileError::capacity("method needs more than 255 local slots")),
        }
        Ok(())
    }

    pub fn emit_astore(&mut self, slot: u16) -> Result<(), CompileError> {
        match slot {
            0 => self.emit(Op::Astore0),
            1 => self.emit(Op::Astore1),
            2 => self.emit(Op::Astore2),
            3 => self.emit(Op::Astore3),
            4..=255 => {
                self.code.push(Op::Astore.byte());
                self.code.push(slot as u8);
                self.adjust_stack(Op::Astore, -1);
            }
            _ => return Err(CompileError::capacity("method needs more than 255 local slots")),
        }
        Ok(())
    }

    pub fn emit_iload(&mut self, slot: u16) -> Result<(), CompileError> {
        if slot > 255 {
            return Err(CompileError::capacity("method needs more than 255 local slots"));
        }
        self.code.push(Op::Iload.byte());
        self.code.push(slot as u8);
        self.adjust_stack(Op::Iload, 1);
        Ok(())
    }

    pub fn emit_istore(&mut self, slot: u16) -> Result<(), CompileError> {
        if slot > 255 {
            return Err(CompileError::capacity("method needs more than 255 local slots"));
        }
        self.code.push(Op::Istore.byte());
        self.code.push(slot as u8);
        self.adjust_stack(Op::Istore, -1);
        Ok(())
    }

    /// Emits an invoke. `arg_slots` counts the descriptor's argument slots
    /// plus the receiver for instance calls; `ret_slots` is 0 or 1 (2 for
    /// `long` returns).
    pub fn emit_invoke(&mut self, op: Op, pool_idx: u16, arg_slots: u16, ret_slots: u16) {
        debug_assert!(matches!(op, Op::Invokevirtual | Op::Invokespecial | Op::Invokestatic));
        self.code.push(op.byte());
        self.code.extend_from_slice(&pool_idx.to_be_bytes());
        self.adjust_stack(op, i32::from(ret_slots) - i32::from(arg_slots));
    }

    pub fn emit_getstatic(&mut self, pool_idx: u16) {
        self.code.push(Op::Getstatic.byte());
        self.code.extend_from_slice(&pool_idx.to_be_bytes());
        self.adjust_stack(Op::Getstatic, 1);
    }

    pub fn emit_putstatic(&mut self, pool_idx: u16) {
        self.code.push(Op::Putstatic.byte());
        self.code.extend_from_slice(&pool_idx.to_be_bytes());
        self.adjust_stack(Op::Putstatic, -1);
    }

    pub fn emit_new(&mut self, class_idx: u16) {
        self.code.push(Op::New.byte());
        self.code.extend_from_slice(&class_idx.to_be_bytes());
        self.adjust_stack(Op::New, 1);
    }

    pub fn emit_anewarray(&mut self, class_idx: u16) {
        self.code.push(Op::Anewarray.byte());
        self.code.extend_from_slice(&class_idx.to_be_bytes());
    }

    pub fn emit_checkcast(&mut self, class_idx: u16) {
        self.code.push(Op::Checkcast.byte());
        self.code.extend_from_slice(&class_idx.to_be_bytes());
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current position and patches pending jumps.
    pub fn bind(&mut self, label: Label) -> Result<(), CompileError> {
        let pos = self.pos();
        let state = &mut self.labels[label.0];
        debug_assert!(state.pos.is_none(), "label bound twice");
        state.pos = Some(pos);
        let patches = std::mem::take(&mut state.patches);
        for (operand_at, kind) in patches {
            self.apply_patch(operand_at, kind, pos)?;
        }
        Ok(())
    }

    fn apply_patch(&mut self, operand_at: u32, kind: PatchKind, target: u32) -> Result<(), CompileError> {
        match kind {
            PatchKind::Branch16 { opcode_at } => {
                let offset = i64::from(target) - i64::from(opcode_at);
                let offset = i16::try_from(offset)
                    .map_err(|_| CompileError::capacity("branch offset exceeds 16 bits"))?;
                let at = operand_at as usize;
                self.code[at..at + 2].copy_from_slice(&offset.to_be_bytes());
            }
            PatchKind::Switch32 { opcode_at } => {
                let offset = i64::from(target) - i64::from(opcode_at);
                let at = operand_at as usize;
                self.code[at..at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            }
        }
        Ok(())
    }

    /// Emits a branch opcode targeting `label`, patching later if the label
    /// is still unbound.
    pub fn emit_branch(&mut self, op: Op, label: Label) -> Result<(), CompileError> {
        let opcode_at = self.pos();
        let effect = op.stack_effect().unwrap_or(0);
        self.code.push(op.byte());
        let operand_at = self.pos();
        self.code.extend_from_slice(&[0, 0]);
        self.adjust_stack(op, effect);
        match self.labels[label.0].pos {
            Some(target) => self.apply_patch(operand_at, PatchKind::Branch16 { opcode_at }, target)?,
            None => self.labels[label.0]
                .patches
                .push((operand_at, PatchKind::Branch16 { opcode_at })),
        }
        Ok(())
    }

    pub fn emit_goto(&mut self, label: Label) -> Result<(), CompileError> {
        self.emit_branch(Op::Goto, label)
    }

    /// Emits a `tableswitch` over `low..low + targets.len()`, falling back
    /// to `default` outside the range. Pops the selector.
    pub fn emit_tableswitch(&mut self, low: i32, targets: &[Label], default: Label) -> Result<(), CompileError> {
        let opcode_at = self.pos();
        self.code.push(Op::Tableswitch.byte());
        while self.pos() % 4 != 0 {
            self.code.push(0);
        }
        let high = low + targets.len() as i32 - 1;
        self.switch_operand(opcode_at, default)?;
        self.code.extend_from_slice(&low.to_be_bytes());
        self.code.extend_from_slice(&high.to_be_bytes());
        for &target in targets {
            self.switch_operand(opcode_at, target)?;
        }
        self.adjust_stack(Op::Tableswitch, -1);
        Ok(())
    }

    fn switch_operand(&mut self, opcode_at: u32, label: Label) -> Result<(), CompileError> {
        let operand_at = self.pos();
        self.code.extend_from_slice(&[0, 0, 0, 0]);
        match self.labels[label.0].pos {
            Some(target) => self.apply_patch(operand_at, PatchKind::Switch32 { opcode_at }, target)?,
            None => self.labels[label.0]
                .patches
                .push((operand_at, PatchKind::Switch32 { opcode_at })),
        }
        Ok(())
    }

    /// Acquires a temporary local slot, reusing freed ones.
    pub fn acquire_temp(&mut self) -> u16 {
        for (i, slot) in self.temps.iter_mut().enumerate() {
            if !slot.in_use && !slot.pinned {
                slot.in_use = true;
                return self.first_temp + i as u16;
            }
        }
        self.temps.push(SlotState { in_use: true, pinned: false });
        self.first_temp + (self.temps.len() - 1) as u16
    }

    /// Acquires a slot that stays reserved across arbitrary control flow,
    /// for values exception handlers must still see.
    pub fn acquire_pinned(&mut self) -> u16 {
        let slot = self.acquire_temp();
        self.temps[(slot - self.first_temp) as usize].pinned = true;
        slot
    }

    pub fn free_temp(&mut self, slot: u16) {
        let idx = (slot - self.first_temp) as usize;
        debug_assert!(self.temps[idx].in_use, "slot {slot} freed twice");
        self.temps[idx].in_use = false;
        self.temps[idx].pinned = false;
    }

    /// Temporary slots currently holding live values, for generator
    /// snapshots around yield points.
    pub fn live_temps(&self) -> Vec<u16> {
        self.temps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, _)| self.first_temp + i as u16)
            .collect()
    }

    /// Records every closed span of `range` as an exception-table row.
    pub fn add_handler(&mut self, range: &ExceptionRange, handler: Label, catch_type: u16) {
        debug_assert!(!range.is_open(), "flushing an open exception range");
        for &(start, end) in &range.spans {
            self.exception_entries.push(ExceptionEntry {
                start_pc: start,
                end_pc: end,
                handler,
                catch_type,
            });
        }
    }

    /// Records a line-number table row when the line changes.
    pub fn set_line(&mut self, line: u32) {
        if line != self.last_line {
            self.last_line = line;
            self.line_numbers.push((self.pos(), line));
        }
    }

    pub fn max_locals(&self) -> u16 {
        self.first_temp + self.temps.len() as u16
    }

    /// Finalizes the method body.
    pub fn finish(self) -> Result<MethodCode, CompileError> {
        for state in &self.labels {
            if !state.patches.is_empty() {
                return Err(CompileError::internal("jump to an unbound label"));
            }
        }
        if self.code.len() > 0xFFFF {
            return Err(CompileError::capacity("method body exceeds 65535 bytes"));
        }
        let resolve = |label: Label| -> Result<u16, CompileError> {
            let pos = self.labels[label.0]
                .pos
                .ok_or_else(|| CompileError::internal("exception handler label never bound"))?;
            Ok(pos as u16)
        };
        let mut exceptions = Vec::with_capacity(self.exception_entries.len());
        for entry in &self.exception_entries {
            exceptions.push((
                entry.start_pc as u16,
                entry.end_pc as u16,
                resolve(entry.handler)?,
                entry.catch_type,
            ));
        }
        let max_stack = u16::try_from(self.max_stack)
            .map_err(|_| CompileError::internal("negative maximum stack depth"))?;
        Ok(MethodCode {
            code: self.code,
            max_stack,
            max_locals: self.first_temp + self.temps.len() as u16,
            exceptions,
            line_numbers: self
                .line_numbers
                .into_iter()
                .map(|(pc, line)| (pc as u16, line.min(0xFFFF) as u16))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn forward_branch_is_patched() {
        let mut b = CodeBuilder::new(1);
        let end = b.new_label();
        b.emit(Op::AconstNull);
        b.emit_branch(Op::Ifnull, end).unwrap();
        b.emit(Op::Nop);
        b.bind(end).unwrap();
        b.emit_return();
        let method = b.finish().unwrap();
        // ifnull at pc 1 jumps to pc 5: offset 4.
        assert_eq!(method.code, vec![
            Op::AconstNull.byte(),
            Op::Ifnull.byte(), 0, 4,
            Op::Nop.byte(),
            Op::Return.byte(),
        ]);
    }

    #[test]
    fn backward_branch_is_negative() {
        let mut b = CodeBuilder::new(1);
        let top = b.new_label();
        b.bind(top).unwrap();
        b.emit(Op::Nop);
        b.emit_goto(top).unwrap();
        b.emit_return();
        let method = b.finish().unwrap();
        assert_eq!(method.code[1], Op::Goto.byte());
        assert_eq!(&method.code[2..4], &(-1i16).to_be_bytes());
    }

    #[test]
    fn tableswitch_pads_and_offsets_from_opcode() {
        let mut b = CodeBuilder::new(1);
        let case0 = b.new_label();
        let default = b.new_label();
        b.emit(Op::Iconst0);
        b.emit_tableswitch(0, &[case0], default).unwrap();
        b.bind(case0).unwrap();
        b.bind(default).unwrap();
        b.emit_return();
        let method = b.finish().unwrap();
        // Opcode at pc 1, then padding to pc 4.
        assert_eq!(method.code[1], Op::Tableswitch.byte());
        assert_eq!(&method.code[2..4], &[0, 0]);
        let target = method.code.len() as i32 - 1 - 1;
        // default, low, high, case offsets follow.
        assert_eq!(&method.code[4..8], &target.to_be_bytes());
        assert_eq!(&method.code[8..12], &0i32.to_be_bytes());
        assert_eq!(&method.code[12..16], &0i32.to_be_bytes());
        assert_eq!(&method.code[16..20], &target.to_be_bytes());
    }

    #[test]
    fn stack_depth_tracks_maximum() {
        let mut b = CodeBuilder::new(1);
        b.emit(Op::AconstNull);
        b.emit(Op::Dup);
        b.emit(Op::Dup);
        b.emit(Op::Pop);
        b.emit(Op::Pop);
        b.emit(Op::Pop);
        b.emit_return();
        let method = b.finish().unwrap();
        assert_eq!(method.max_stack, 3);
    }

    #[test]
    fn temp_slots_reuse_but_pinned_do_not() {
        let mut b = CodeBuilder::new(3);
        let a = b.acquire_temp();
        assert_eq!(a, 3);
        b.free_temp(a);
        let again = b.acquire_temp();
        assert_eq!(again, 3);

        let pinned = b.acquire_pinned();
        assert_eq!(pinned, 4);
        b.free_temp(again);
        // The pinned slot is skipped even though lower-numbered slots free up.
        let c = b.acquire_temp();
        assert_eq!(c, 3);
        assert_eq!(b.live_temps(), vec![3, 4]);
        assert_eq!(b.max_locals(), 5);
    }

    #[test]
    fn suspended_ranges_produce_multiple_rows() {
        let mut b = CodeBuilder::new(1);
        let handler = b.new_label();
        let mut range = ExceptionRange::new();
        range.begin(b.pos());
        b.emit(Op::Nop);
        b.emit(Op::Nop);
        range.suspend(b.pos());
        b.emit(Op::Nop);
        range.resume(b.pos());
        b.emit(Op::Nop);
        range.end(b.pos());
        b.add_handler(&range, handler, 0);
        b.bind(handler).unwrap();
        b.set_stack_depth(1);
        b.emit_athrow();
        let method = b.finish().unwrap();
        assert_eq!(method.exceptions, vec![(0, 2, 4, 0), (3, 4, 4, 0)]);
    }

    #[test]
    fn empty_suspended_span_is_dropped() {
        let mut range = ExceptionRange::new();
        range.begin(4);
        range.suspend(4);
        assert!(range.spans.is_empty());
    }

    #[test]
    fn iconst_picks_shortest_encoding() {
        let mut b = CodeBuilder::new(1);
        b.emit_iconst(-1).unwrap();
        b.emit_iconst(100).unwrap();
        b.emit_iconst(1000).unwrap();
        let code = b.code;
        assert_eq!(code[0], Op::IconstM1.byte());
        assert_eq!(&code[1..3], &[Op::Bipush.byte(), 100]);
        assert_eq!(code[3], Op::Sipush.byte());
        assert_eq!(&code[4..6], &1000i16.to_be_bytes());
    }

    #[test]
    fn line_table_dedupes_consecutive_lines() {
        let mut b = CodeBuilder::new(1);
        b.set_line(1);
        b.emit(Op::Nop);
        b.set_line(1);
        b.emit(Op::Nop);
        b.set_line(2);
        b.emit_return();
        let method = b.finish().unwrap();
        assert_eq!(method.line_numbers, vec![(0, 1), (2, 2)]);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "underflow after pop"))]
    fn stack_underflow_names_the_opcode() {
        let mut b = CodeBuilder::new(1);
        b.emit(Op::Pop);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "label bound twice"))]
    fn rebinding_a_label_is_a_defect() {
        let mut b = CodeBuilder::new(1);
        let l = b.new_label();
        b.bind(l).unwrap();
        b.emit(Op::Nop);
        let _ = b.bind(l);
        b.emit_return();
    }

    #[test]
    fn unbound_referenced_label_fails_finish() {
        let mut b = CodeBuilder::new(1);
        let nowhere = b.new_label();
        b.emit_goto(nowhere).unwrap();
        b.emit_return();
        assert!(b.finish().is_err());
    }
}
