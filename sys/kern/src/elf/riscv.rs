// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RISC-V relocation backend.

use byteorder::{ByteOrder, LittleEndian};

use super::{elf_r_type, Elf, Elf32Rela, Elf32Sym, ElfError};

pub const R_RISCV_NONE: u8 = 0;
pub const R_RISCV_32: u8 = 1;
pub const R_RISCV_RELATIVE: u8 = 3;
pub const R_RISCV_JUMP_SLOT: u8 = 5;

/// Applies one relocation into the loaded image. `addr` is the resolved
/// symbol address (zero for relocations that do not take one).
pub(super) fn arch_relocate(
    elf: &Elf,
    rela: &Elf32Rela,
    _sym: &Elf32Sym,
    addr: u32,
) -> Result<(), ElfError> {
    let target = elf.map_vaddr(rela.offset.get() as usize);
    if target == 0 {
        return Err(ElfError::InvalidParam);
    }
    // Safety: map_vaddr only returns addresses inside segments this
    // loader owns; relocation slots are four bytes by the ELF32 ABI.
    let slot = unsafe {
        core::slice::from_raw_parts_mut(target as *mut u8, 4)
    };

    match elf_r_type(rela.info.get()) {
        R_RISCV_NONE => {}
        R_RISCV_32 => {
            let value = addr.wrapping_add(rela.addend.get() as u32);
            LittleEndian::write_u32(slot, value);
        }
        R_RISCV_RELATIVE => {
            let value = (elf.load_bias as u32)
                .wrapping_add(rela.addend.get() as u32);
            LittleEndian::write_u32(slot, value);
        }
        R_RISCV_JUMP_SLOT => {
            LittleEndian::write_u32(slot, addr);
        }
        _ => return Err(ElfError::InvalidParam),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::SegMap;
    use zerocopy::byteorder::little_endian::{I32, U32};

    fn rela(offset: u32, rtype: u8, addend: i32) -> Elf32Rela {
        Elf32Rela {
            offset: U32::new(offset),
            info: U32::new(rtype as u32),
            addend: I32::new(addend),
        }
    }

    fn null_sym() -> Elf32Sym {
        Elf32Sym {
            name: U32::new(0),
            value: U32::new(0),
            size: U32::new(0),
            info: 0,
            other: 0,
            shndx: zerocopy::byteorder::little_endian::U16::new(0),
        }
    }

    fn elf_over(buf: &mut [u8], vaddr: usize) -> Elf {
        let base = buf.as_mut_ptr() as usize;
        let mut elf = Elf::new(None);
        elf.maps.push(SegMap {
            vaddr,
            addr: base,
            size: buf.len(),
        });
        elf.load_bias = base.wrapping_sub(vaddr);
        elf
    }

    #[test]
    fn abs32_adds_addend() {
        let mut seg = [0u8; 16];
        let elf = elf_over(&mut seg, 0x2000);
        arch_relocate(&elf, &rela(0x2004, R_RISCV_32, 8), &null_sym(), 0x500)
            .unwrap();
        assert_eq!(LittleEndian::read_u32(&seg[4..8]), 0x508);
    }

    #[test]
    fn jump_slot_writes_address_verbatim() {
        let mut seg = [0u8; 16];
        let elf = elf_over(&mut seg, 0x2000);
        arch_relocate(
            &elf,
            &rela(0x2008, R_RISCV_JUMP_SLOT, 99),
            &null_sym(),
            0xABCD,
        )
        .unwrap();
        assert_eq!(LittleEndian::read_u32(&seg[8..12]), 0xABCD);
    }

    #[test]
    fn relative_uses_load_bias() {
        let mut seg = [0u8; 16];
        let elf = elf_over(&mut seg, 0x2000);
        let bias = elf.load_bias as u32;
        arch_relocate(&elf, &rela(0x200C, R_RISCV_RELATIVE, 0x20), &null_sym(), 0)
            .unwrap();
        assert_eq!(
            LittleEndian::read_u32(&seg[12..16]),
            bias.wrapping_add(0x20)
        );
    }

    #[test]
    fn none_is_a_noop_and_unknown_rejects() {
        let mut seg = [0xFFu8; 8];
        let elf = elf_over(&mut seg, 0x2000);
        arch_relocate(&elf, &rela(0x2000, R_RISCV_NONE, 0), &null_sym(), 1)
            .unwrap();
        assert_eq!(seg, [0xFFu8; 8]);
        assert_eq!(
            arch_relocate(&elf, &rela(0x2000, 77, 0), &null_sym(), 1)
                .unwrap_err(),
            ElfError::InvalidParam
        );
    }

    #[test]
    fn unmapped_target_is_invalid() {
        let mut seg = [0u8; 8];
        let elf = elf_over(&mut seg, 0x2000);
        assert_eq!(
            arch_relocate(&elf, &rela(0x9999, R_RISCV_32, 0), &null_sym(), 1)
                .unwrap_err(),
            ElfError::InvalidParam
        );
    }
}
