//! Intel 8080 Instruction Set
//!
//! All 256 opcodes, dispatched from a single match. Instructions are grouped
//! by family:
//!
//! - **Data Movement**: MOV, MVI, LXI, LDA/STA, LHLD/SHLD, LDAX/STAX, XCHG
//! - **Arithmetic**: ADD/ADC/SUB/SBB, ADI/ACI/SUI/SBI, INR/DCR, INX/DCX,
//!   DAD, DAA
//! - **Logic**: ANA/XRA/ORA/CMP and immediate forms, CMA, rotates, STC/CMC
//! - **Control Flow**: JMP/Jcc, CALL/Ccc, RET/Rcc, RST, PCHL
//! - **Stack and Machine**: PUSH/POP, XTHL, SPHL, IN/OUT, EI/DI, HLT, NOP
//!
//! Every handler returns its cycle cost; conditional calls and returns
//! report the taken/not-taken split (17/11 and 11/5). The flag work happens
//! in the [`Registers`](crate::registers::Registers) primitives.
//!
//! # Undocumented opcodes
//!
//! The VT100 firmware never executes them, but unmodified ROMs elsewhere
//! do, so the silicon aliases are preserved: 0x08/0x10/0x18/0x20/0x28/0x30/
//! 0x38 behave as NOP, 0xCB as JMP, 0xD9 as RET, and 0xDD/0xED/0xFD as
//! CALL.

use crate::cpu::Cpu;

/// Register field decoding, in 8080 order: B C D E H L M A. `M` is the
/// byte addressed by HL.
fn read_reg(cpu: &mut Cpu, code: u8) -> u8 {
    match code & 0x07 {
        0 => cpu.regs.b,
        1 => cpu.regs.c,
        2 => cpu.regs.d,
        3 => cpu.regs.e,
        4 => cpu.regs.h,
        5 => cpu.regs.l,
        6 => cpu.read_byte(cpu.regs.hl()),
        _ => cpu.regs.a,
    }
}

fn write_reg(cpu: &mut Cpu, code: u8, value: u8) {
    match code & 0x07 {
        0 => cpu.regs.b = value,
        1 => cpu.regs.c = value,
        2 => cpu.regs.d = value,
        3 => cpu.regs.e = value,
        4 => cpu.regs.h = value,
        5 => cpu.regs.l = value,
        6 => cpu.write_byte(cpu.regs.hl(), value),
        _ => cpu.regs.a = value,
    }
}

/// Register-pair decoding for LXI/INX/DCX/DAD: B D H SP.
fn read_pair_reg(cpu: &Cpu, code: u8) -> u16 {
    match code & 0x03 {
        0 => cpu.regs.bc(),
        1 => cpu.regs.de(),
        2 => cpu.regs.hl(),
        _ => cpu.regs.sp,
    }
}

fn write_pair_reg(cpu: &mut Cpu, code: u8, value: u16) {
    match code & 0x03 {
        0 => cpu.regs.set_bc(value),
        1 => cpu.regs.set_de(value),
        2 => cpu.regs.set_hl(value),
        _ => cpu.regs.sp = value,
    }
}

/// Condition decoding for Jcc/Ccc/Rcc: NZ Z NC C PO PE P M.
fn condition(cpu: &Cpu, code: u8) -> bool {
    match code & 0x07 {
        0 => !cpu.regs.get_zf(),
        1 => cpu.regs.get_zf(),
        2 => !cpu.regs.get_cf(),
        3 => cpu.regs.get_cf(),
        4 => !cpu.regs.get_pf(),
        5 => cpu.regs.get_pf(),
        6 => !cpu.regs.get_sf(),
        _ => cpu.regs.get_sf(),
    }
}

// ==================== FAMILY HELPERS ====================

/// MOV dst,src (0x40–0x7F except HLT). 5 cycles, 7 when M is involved.
fn mov(cpu: &mut Cpu, opcode: u8) -> u64 {
    let value = read_reg(cpu, opcode);
    write_reg(cpu, opcode >> 3, value);
    if opcode & 0x07 == 6 || (opcode >> 3) & 0x07 == 6 {
        7
    } else {
        5
    }
}

/// ADD/ADC/SUB/SBB/ANA/XRA/ORA/CMP src (0x80–0xBF). 4 cycles, 7 for M.
fn alu(cpu: &mut Cpu, opcode: u8) -> u64 {
    let src = read_reg(cpu, opcode);
    alu_op(cpu, (opcode >> 3) & 0x07, src);
    if opcode & 0x07 == 6 {
        7
    } else {
        4
    }
}

/// ADI/ACI/SUI/SBI/ANI/XRI/ORI/CPI d8. 7 cycles.
fn alu_imm(cpu: &mut Cpu, opcode: u8) -> u64 {
    let src = cpu.fetch_byte();
    alu_op(cpu, (opcode >> 3) & 0x07, src);
    7
}

fn alu_op(cpu: &mut Cpu, op: u8, src: u8) {
    match op {
        0 => cpu.regs.a = cpu.regs.add_byte(src),
        1 => cpu.regs.a = cpu.regs.add_byte_carry(src),
        2 => cpu.regs.a = cpu.regs.sub_byte(src),
        3 => cpu.regs.a = cpu.regs.sub_byte_borrow(src),
        4 => cpu.regs.a = cpu.regs.and_byte(src),
        5 => cpu.regs.a = cpu.regs.xor_byte(src),
        6 => cpu.regs.a = cpu.regs.or_byte(src),
        _ => {
            // CMP: subtract and discard, keeping the flags.
            cpu.regs.sub_byte(src);
        }
    }
}

/// INR r/M. 5 cycles, 10 for M. CF rides through.
fn inr(cpu: &mut Cpu, code: u8) -> u64 {
    let value = read_reg(cpu, code);
    let result = cpu.regs.inc_byte(value);
    write_reg(cpu, code, result);
    if code & 0x07 == 6 {
        10
    } else {
        5
    }
}

/// DCR r/M. 5 cycles, 10 for M. CF rides through.
fn dcr(cpu: &mut Cpu, code: u8) -> u64 {
    let value = read_reg(cpu, code);
    let result = cpu.regs.dec_byte(value);
    write_reg(cpu, code, result);
    if code & 0x07 == 6 {
        10
    } else {
        5
    }
}

/// DAD rp: HL += rp, touching only CF. 10 cycles.
fn dad(cpu: &mut Cpu, code: u8) -> u64 {
    let sum = u32::from(cpu.regs.hl()) + u32::from(read_pair_reg(cpu, code));
    cpu.regs.set_hl((sum & 0xFFFF) as u16);
    cpu.regs.update_cf(sum > 0xFFFF);
    10
}

/// JMP a16 (and conditional variants fetch the operand either way).
fn jmp(cpu: &mut Cpu) -> u64 {
    let addr = cpu.fetch_pair();
    cpu.regs.pc = addr;
    10
}

fn jmp_cond(cpu: &mut Cpu, code: u8) -> u64 {
    let addr = cpu.fetch_pair();
    if condition(cpu, code) {
        cpu.regs.pc = addr;
    }
    10
}

/// CALL a16: operands first, then the return address goes on the stack.
fn call(cpu: &mut Cpu) -> u64 {
    let addr = cpu.fetch_pair();
    let ret = cpu.regs.pc;
    cpu.push_word(ret);
    cpu.regs.pc = addr;
    17
}

fn call_cond(cpu: &mut Cpu, code: u8) -> u64 {
    let addr = cpu.fetch_pair();
    if condition(cpu, code) {
        let ret = cpu.regs.pc;
        cpu.push_word(ret);
        cpu.regs.pc = addr;
        17
    } else {
        11
    }
}

fn ret(cpu: &mut Cpu) -> u64 {
    cpu.regs.pc = cpu.pop_word();
    10
}

fn ret_cond(cpu: &mut Cpu, code: u8) -> u64 {
    if condition(cpu, code) {
        cpu.regs.pc = cpu.pop_word();
        11
    } else {
        5
    }
}

/// RST n: one-byte call to `n * 8`. Interrupt acknowledgment reuses this.
fn rst(cpu: &mut Cpu, n: u8) -> u64 {
    let ret = cpu.regs.pc;
    cpu.push_word(ret);
    cpu.regs.pc = u16::from(n) << 3;
    11
}

// ==================== DISPATCH ====================

/// Executes one opcode (already fetched) and returns its cycle cost.
pub(crate) fn execute(cpu: &mut Cpu, opcode: u8) -> u64 {
    match opcode {
        // ---- 0x00–0x3F: moves, immediates, pair arithmetic, rotates ----
        0x00 => 4, // NOP
        0x01 | 0x11 | 0x21 | 0x31 => {
            // LXI rp,d16
            let value = cpu.fetch_pair();
            write_pair_reg(cpu, opcode >> 4, value);
            10
        }
        0x02 => {
            // STAX B
            cpu.write_byte(cpu.regs.bc(), cpu.regs.a);
            7
        }
        0x12 => {
            // STAX D
            cpu.write_byte(cpu.regs.de(), cpu.regs.a);
            7
        }
        0x0A => {
            // LDAX B
            cpu.regs.a = cpu.read_byte(cpu.regs.bc());
            7
        }
        0x1A => {
            // LDAX D
            cpu.regs.a = cpu.read_byte(cpu.regs.de());
            7
        }
        0x03 | 0x13 | 0x23 | 0x33 => {
            // INX rp
            let value = read_pair_reg(cpu, opcode >> 4).wrapping_add(1);
            write_pair_reg(cpu, opcode >> 4, value);
            5
        }
        0x0B | 0x1B | 0x2B | 0x3B => {
            // DCX rp
            let value = read_pair_reg(cpu, opcode >> 4).wrapping_sub(1);
            write_pair_reg(cpu, opcode >> 4, value);
            5
        }
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => inr(cpu, opcode >> 3),
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => dcr(cpu, opcode >> 3),
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
            // MVI r/M,d8
            let value = cpu.fetch_byte();
            write_reg(cpu, opcode >> 3, value);
            if opcode == 0x36 {
                10
            } else {
                7
            }
        }
        0x07 => {
            cpu.regs.rlc();
            4
        }
        0x0F => {
            cpu.regs.rrc();
            4
        }
        0x17 => {
            cpu.regs.ral();
            4
        }
        0x1F => {
            cpu.regs.rar();
            4
        }
        0x09 | 0x19 | 0x29 | 0x39 => dad(cpu, opcode >> 4),
        0x22 => {
            // SHLD a16
            let addr = cpu.fetch_pair();
            let hl = cpu.regs.hl();
            cpu.write_pair(addr, hl);
            16
        }
        0x2A => {
            // LHLD a16
            let addr = cpu.fetch_pair();
            let value = cpu.read_pair(addr);
            cpu.regs.set_hl(value);
            16
        }
        0x27 => {
            cpu.regs.daa();
            4
        }
        0x2F => {
            // CMA (no flags)
            cpu.regs.a = !cpu.regs.a;
            4
        }
        0x32 => {
            // STA a16
            let addr = cpu.fetch_pair();
            cpu.write_byte(addr, cpu.regs.a);
            13
        }
        0x3A => {
            // LDA a16
            let addr = cpu.fetch_pair();
            cpu.regs.a = cpu.read_byte(addr);
            13
        }
        0x37 => {
            // STC
            cpu.regs.update_cf(true);
            4
        }
        0x3F => {
            // CMC
            let cf = cpu.regs.get_cf();
            cpu.regs.update_cf(!cf);
            4
        }
        // Undocumented: aliased to NOP on real silicon.
        0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => 4,

        // ---- 0x40–0x7F: MOV matrix (0x76 is HLT) ----
        0x76 => {
            cpu.halt();
            7
        }
        0x40..=0x7F => mov(cpu, opcode),

        // ---- 0x80–0xBF: register/memory ALU ----
        0x80..=0xBF => alu(cpu, opcode),

        // ---- 0xC0–0xFF: control flow, stack, IO ----
        0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => ret_cond(cpu, opcode >> 3),
        0xC1 | 0xD1 | 0xE1 => {
            // POP rp
            let value = cpu.pop_word();
            write_pair_reg(cpu, opcode >> 4, value);
            10
        }
        0xF1 => {
            // POP PSW
            let value = cpu.pop_word();
            cpu.regs.set_psw(value);
            10
        }
        0xC5 | 0xD5 | 0xE5 => {
            // PUSH rp
            let value = read_pair_reg(cpu, opcode >> 4);
            cpu.push_word(value);
            11
        }
        0xF5 => {
            // PUSH PSW
            let value = cpu.regs.get_psw();
            cpu.push_word(value);
            11
        }
        0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => jmp_cond(cpu, opcode >> 3),
        0xC3 => jmp(cpu),
        0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => call_cond(cpu, opcode >> 3),
        0xCD => call(cpu),
        0xC9 => ret(cpu),
        0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => alu_imm(cpu, opcode),
        0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => rst(cpu, (opcode >> 3) & 0x07),
        0xD3 => {
            // OUT d8
            let port = cpu.fetch_byte();
            cpu.output(port, cpu.regs.a);
            10
        }
        0xDB => {
            // IN d8
            let port = cpu.fetch_byte();
            cpu.regs.a = cpu.input(port);
            10
        }
        0xE3 => {
            // XTHL
            let sp = cpu.regs.sp;
            let value = cpu.read_pair(sp);
            let hl = cpu.regs.hl();
            cpu.write_pair(sp, hl);
            cpu.regs.set_hl(value);
            18
        }
        0xE9 => {
            // PCHL
            cpu.regs.pc = cpu.regs.hl();
            5
        }
        0xEB => {
            // XCHG
            let de = cpu.regs.de();
            let hl = cpu.regs.hl();
            cpu.regs.set_de(hl);
            cpu.regs.set_hl(de);
            4
        }
        0xF3 => {
            // DI
            cpu.set_if(false);
            4
        }
        0xFB => {
            // EI: enable, then take any pending interrupt at this boundary.
            cpu.set_if(true);
            cpu.check_intr();
            4
        }
        0xF9 => {
            // SPHL
            cpu.regs.sp = cpu.regs.hl();
            5
        }
        // Undocumented aliases.
        0xCB => jmp(cpu),
        0xD9 => ret(cpu),
        0xDD | 0xED | 0xFD => call(cpu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::intflag;
    use crate::cpu::testutil::{load, step, test_cpu, test_cpu_with_buses};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_add_with_aux_carry() {
        // ADD B with A=0x2E, B=0x74: A=0xA2, CF=0, AF=1, ZF=0, SF=1, PF=0.
        let mut cpu = test_cpu();
        cpu.regs.a = 0x2E;
        cpu.regs.b = 0x74;
        load(&mut cpu, 0x0100, &[0x80]);
        assert_eq!(step(&mut cpu), 4);
        assert_eq!(cpu.regs.a, 0xA2);
        assert!(!cpu.regs.get_cf());
        assert!(cpu.regs.get_af());
        assert!(!cpu.regs.get_zf());
        assert!(cpu.regs.get_sf());
        assert!(!cpu.regs.get_pf());
    }

    #[test]
    fn test_daa_after_decimal_add() {
        // ADD B then DAA: 0x15 + 0x27 = 0x3C, adjusted to 0x42.
        let mut cpu = test_cpu();
        cpu.regs.a = 0x15;
        cpu.regs.b = 0x27;
        load(&mut cpu, 0x0100, &[0x80, 0x27]);
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x3C);
        assert!(!cpu.regs.get_af());
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x42);
        assert!(!cpu.regs.get_cf());
    }

    #[test]
    fn test_call_and_ret() {
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        load(&mut cpu, 0x0100, &[0xCD, 0x34, 0x12]); // CALL 0x1234
        cpu.write_byte(0x1234, 0xC9); // RET

        assert_eq!(step(&mut cpu), 17);
        assert_eq!(cpu.regs.pc, 0x1234);
        assert_eq!(cpu.regs.sp, 0x1FFE);
        assert_eq!(cpu.read_byte(0x1FFE), 0x03); // return address low
        assert_eq!(cpu.read_byte(0x1FFF), 0x01); // return address high

        assert_eq!(step(&mut cpu), 10);
        assert_eq!(cpu.regs.pc, 0x0103);
        assert_eq!(cpu.regs.sp, 0x2000);
    }

    #[test]
    fn test_ei_wakes_halt_into_interrupt() {
        // EI at 0x004F, HLT at 0x0050; level 1 arrives while halted.
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        load(&mut cpu, 0x004F, &[0xFB, 0x76]);
        step(&mut cpu); // EI
        assert!(cpu.regs.intr_enabled);
        step(&mut cpu); // HLT backs PC onto itself
        assert_eq!(cpu.regs.pc, 0x0050);
        assert_ne!(cpu.intr_line().flags() & intflag::HALT, 0);
        assert!(cpu.time().is_running(), "IF set: HLT must not stop the scheduler");

        cpu.request_intr(1);
        assert!(cpu.check_intr());
        assert_eq!(cpu.intr_line().flags(), 0, "level and HALT bits cleared");
        assert!(!cpu.regs.intr_enabled);
        assert_eq!(cpu.regs.pc, 0x0008);
        assert_eq!(cpu.pop_word(), 0x0050);
    }

    #[test]
    fn test_hlt_with_interrupts_disabled_stops_time() {
        let mut cpu = test_cpu();
        load(&mut cpu, 0x0050, &[0x76]);
        assert!(cpu.time().is_running());
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0050, "PC stays on the HLT byte");
        assert!(!cpu.time().is_running());
    }

    #[test]
    fn test_representative_cycle_costs() {
        let cases: &[(&[u8], u64)] = &[
            (&[0x00], 4),             // NOP
            (&[0x01, 0x34, 0x12], 10), // LXI B
            (&[0x09], 10),            // DAD B
            (&[0x3A, 0x00, 0x20], 13), // LDA
            (&[0x32, 0x00, 0x20], 13), // STA
            (&[0x22, 0x00, 0x20], 16), // SHLD
            (&[0x2A, 0x00, 0x20], 16), // LHLD
            (&[0xC3, 0x00, 0x02], 10), // JMP
            (&[0xCD, 0x00, 0x02], 17), // CALL
            (&[0xD3, 0x42], 10),      // OUT
            (&[0xDB, 0x42], 10),      // IN
            (&[0xE3], 18),            // XTHL
            (&[0xFB], 4),             // EI
            (&[0xF3], 4),             // DI
            (&[0x41], 5),             // MOV B,C
            (&[0x46], 7),             // MOV B,M
            (&[0x70], 7),             // MOV M,B
            (&[0x80], 4),             // ADD B
            (&[0x86], 7),             // ADD M
            (&[0xC6, 0x01], 7),       // ADI
            (&[0x04], 5),             // INR B
            (&[0x34], 10),            // INR M
            (&[0x36, 0x55], 10),      // MVI M
            (&[0xC5], 11),            // PUSH B
            (&[0xC1], 10),            // POP B
            (&[0xC7], 11),            // RST 0
            (&[0xE9], 5),             // PCHL
            (&[0xF9], 5),             // SPHL
            (&[0xEB], 4),             // XCHG
        ];
        for (bytes, want) in cases {
            let mut cpu = test_cpu();
            cpu.regs.sp = 0x3000;
            load(&mut cpu, 0x0100, bytes);
            assert_eq!(step(&mut cpu), *want, "opcode {:#04x}", bytes[0]);
        }
    }

    #[test]
    fn test_conditional_timing_split() {
        // RNZ: 11 taken, 5 not. CNZ: 17 taken, 11 not.
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        cpu.push_word(0x0500);
        cpu.regs.a = cpu.regs.or_byte(1); // ZF clear
        load(&mut cpu, 0x0100, &[0xC0]);
        assert_eq!(step(&mut cpu), 11);
        assert_eq!(cpu.regs.pc, 0x0500);

        let mut cpu = test_cpu();
        cpu.regs.a = cpu.regs.xor_byte(cpu.regs.a); // ZF set
        load(&mut cpu, 0x0100, &[0xC0]);
        assert_eq!(step(&mut cpu), 5);
        assert_eq!(cpu.regs.pc, 0x0101);

        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        cpu.regs.a = cpu.regs.or_byte(1);
        load(&mut cpu, 0x0100, &[0xC4, 0x00, 0x05]);
        assert_eq!(step(&mut cpu), 17);
        assert_eq!(cpu.regs.pc, 0x0500);

        let mut cpu = test_cpu();
        cpu.regs.a = cpu.regs.xor_byte(cpu.regs.a);
        load(&mut cpu, 0x0100, &[0xC4, 0x00, 0x05]);
        assert_eq!(step(&mut cpu), 11);
        // Operands were consumed even though the call was not taken.
        assert_eq!(cpu.regs.pc, 0x0103);
    }

    #[test]
    fn test_undocumented_aliases() {
        // 0x08 is a NOP.
        let mut cpu = test_cpu();
        load(&mut cpu, 0x0100, &[0x08]);
        assert_eq!(step(&mut cpu), 4);
        assert_eq!(cpu.regs.pc, 0x0101);

        // 0xCB jumps.
        let mut cpu = test_cpu();
        load(&mut cpu, 0x0100, &[0xCB, 0x00, 0x04]);
        assert_eq!(step(&mut cpu), 10);
        assert_eq!(cpu.regs.pc, 0x0400);

        // 0xD9 returns.
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        cpu.push_word(0x0777);
        load(&mut cpu, 0x0100, &[0xD9]);
        assert_eq!(step(&mut cpu), 10);
        assert_eq!(cpu.regs.pc, 0x0777);

        // 0xDD/0xED/0xFD call.
        for opcode in [0xDD, 0xED, 0xFD] {
            let mut cpu = test_cpu();
            cpu.regs.sp = 0x2000;
            load(&mut cpu, 0x0100, &[opcode, 0x00, 0x04]);
            assert_eq!(step(&mut cpu), 17);
            assert_eq!(cpu.regs.pc, 0x0400);
            assert_eq!(cpu.pop_word(), 0x0103);
        }
    }

    #[test]
    fn test_mov_matrix_and_memory_forms() {
        let mut cpu = test_cpu();
        cpu.regs.set_hl(0x2345);
        cpu.regs.b = 0x99;
        load(&mut cpu, 0x0100, &[0x70, 0x4E]); // MOV M,B ; MOV C,M
        step(&mut cpu);
        assert_eq!(cpu.read_byte(0x2345), 0x99);
        step(&mut cpu);
        assert_eq!(cpu.regs.c, 0x99);
    }

    #[test]
    fn test_ldax_stax_and_immediate_loads() {
        let mut cpu = test_cpu();
        load(
            &mut cpu,
            0x0100,
            &[
                0x01, 0x00, 0x30, // LXI B,0x3000
                0x3E, 0xA7, // MVI A,0xA7
                0x02, // STAX B
                0x3E, 0x00, // MVI A,0
                0x0A, // LDAX B
            ],
        );
        for _ in 0..5 {
            step(&mut cpu);
        }
        assert_eq!(cpu.regs.a, 0xA7);
        assert_eq!(cpu.read_byte(0x3000), 0xA7);
    }

    #[test]
    fn test_xthl_swaps_with_stack_top() {
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        cpu.push_word(0xABCD);
        cpu.regs.set_hl(0x1234);
        load(&mut cpu, 0x0100, &[0xE3]);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl(), 0xABCD);
        assert_eq!(cpu.read_pair(cpu.regs.sp), 0x1234);
        assert_eq!(cpu.regs.sp, 0x1FFE, "SP itself is untouched");
    }

    #[test]
    fn test_dad_sets_only_carry() {
        let mut cpu = test_cpu();
        cpu.regs.set_hl(0xFFFF);
        cpu.regs.set_bc(0x0001);
        cpu.regs.a = cpu.regs.or_byte(0x80); // SF set, CF clear
        load(&mut cpu, 0x0100, &[0x09]);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl(), 0x0000);
        assert!(cpu.regs.get_cf());
        assert!(cpu.regs.get_sf(), "DAD must not disturb SF");
        assert!(!cpu.regs.get_zf(), "DAD must not disturb ZF");
    }

    #[test]
    fn test_push_pop_psw() {
        let mut cpu = test_cpu();
        cpu.regs.sp = 0x2000;
        cpu.regs.a = 0x5A;
        cpu.regs.update_cf(true);
        load(&mut cpu, 0x0100, &[0xF5, 0xAF, 0xF1]); // PUSH PSW; XRA A; POP PSW
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x00);
        assert!(!cpu.regs.get_cf());
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x5A);
        assert!(cpu.regs.get_cf());
    }

    #[test]
    fn test_in_out_reach_port_listeners() {
        let (mut cpu, _mem, io) = test_cpu_with_buses();
        let latch = Rc::new(RefCell::new(0u8));
        let wr = Rc::clone(&latch);
        let rd = Rc::clone(&latch);
        io.borrow_mut()
            .add_listener(
                0x42,
                Some(Box::new(move |_| *rd.borrow() ^ 0xFF)),
                Some(Box::new(move |_, v| *wr.borrow_mut() = v)),
            )
            .unwrap();

        cpu.regs.a = 0x3C;
        load(&mut cpu, 0x0100, &[0xD3, 0x42, 0xDB, 0x42]); // OUT 0x42; IN 0x42
        step(&mut cpu);
        assert_eq!(*latch.borrow(), 0x3C);
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0xC3);
    }

    #[test]
    fn test_rst_vectors() {
        for n in 0..8u8 {
            let mut cpu = test_cpu();
            cpu.regs.sp = 0x2000;
            load(&mut cpu, 0x0100, &[0xC7 | (n << 3)]);
            assert_eq!(step(&mut cpu), 11);
            assert_eq!(cpu.regs.pc, u16::from(n) << 3);
            assert_eq!(cpu.pop_word(), 0x0101);
        }
    }

    #[test]
    fn test_inx_dcx_wrap() {
        let mut cpu = test_cpu();
        cpu.regs.set_de(0xFFFF);
        load(&mut cpu, 0x0100, &[0x13]); // INX D
        step(&mut cpu);
        assert_eq!(cpu.regs.de(), 0x0000);

        let mut cpu = test_cpu();
        cpu.regs.sp = 0x0000;
        load(&mut cpu, 0x0100, &[0x3B]); // DCX SP
        step(&mut cpu);
        assert_eq!(cpu.regs.sp, 0xFFFF);
    }

    #[test]
    fn test_shld_lhld() {
        let mut cpu = test_cpu();
        cpu.regs.set_hl(0xBEEF);
        load(&mut cpu, 0x0100, &[0x22, 0x00, 0x40]); // SHLD 0x4000
        step(&mut cpu);
        assert_eq!(cpu.read_byte(0x4000), 0xEF);
        assert_eq!(cpu.read_byte(0x4001), 0xBE);

        cpu.regs.set_hl(0);
        load(&mut cpu, 0x0200, &[0x2A, 0x00, 0x40]); // LHLD 0x4000
        step(&mut cpu);
        assert_eq!(cpu.regs.hl(), 0xBEEF);
    }

    #[test]
    fn test_all_conditions_decode() {
        // Condition codes in opcode order: NZ Z NC C PO PE P M.
        let mut cpu = test_cpu();
        cpu.regs.a = cpu.regs.xor_byte(cpu.regs.a); // ZF=1 PF=1 SF=0 CF=0
        assert!(!condition(&cpu, 0)); // NZ
        assert!(condition(&cpu, 1)); // Z
        assert!(condition(&cpu, 2)); // NC
        assert!(!condition(&cpu, 3)); // C
        assert!(!condition(&cpu, 4)); // PO
        assert!(condition(&cpu, 5)); // PE
        assert!(condition(&cpu, 6)); // P
        assert!(!condition(&cpu, 7)); // M

        cpu.regs.a = 0x80;
        cpu.regs.a = cpu.regs.or_byte(0); // SF=1 ZF=0 PF=0 (one bit)
        cpu.regs.update_cf(true);
        assert!(condition(&cpu, 0));
        assert!(!condition(&cpu, 1));
        assert!(!condition(&cpu, 2));
        assert!(condition(&cpu, 3));
        assert!(condition(&cpu, 4));
        assert!(!condition(&cpu, 5));
        assert!(!condition(&cpu, 6));
        assert!(condition(&cpu, 7));
    }

    #[test]
    fn test_cmp_discards_result() {
        let mut cpu = test_cpu();
        cpu.regs.a = 0x10;
        cpu.regs.b = 0x20;
        load(&mut cpu, 0x0100, &[0xB8]); // CMP B
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x10);
        assert!(cpu.regs.get_cf(), "borrow sets CF");
        assert!(!cpu.regs.get_zf());
    }

    #[test]
    fn test_rotate_instructions_preserve_other_flags() {
        let mut cpu = test_cpu();
        cpu.regs.a = cpu.regs.xor_byte(cpu.regs.a); // ZF=1
        cpu.regs.a = 0x81;
        load(&mut cpu, 0x0100, &[0x07]); // RLC
        step(&mut cpu);
        assert_eq!(cpu.regs.a, 0x03);
        assert!(cpu.regs.get_cf());
        assert!(cpu.regs.get_zf(), "rotates leave ZF alone");
    }
}
