// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Xtensa relocation backend.
//!
//! Xtensa images are loaded section-mirrored, so address translation here
//! goes through the section table rather than the segment maps: both the
//! relocation target and RELATIVE values are section-relative.

use byteorder::{ByteOrder, LittleEndian};

use super::{elf_r_type, Elf, Elf32Rela, Elf32Sym, ElfError, SEC_COUNT};

pub const R_XTENSA_RTLD: u8 = 2;
pub const R_XTENSA_GLOB_DAT: u8 = 3;
pub const R_XTENSA_JMP_SLOT: u8 = 4;
pub const R_XTENSA_RELATIVE: u8 = 5;

/// Translates an image virtual address through the section table; zero
/// when no section covers it.
fn map_sym(elf: &Elf, sym: usize) -> usize {
    for i in 0..SEC_COUNT {
        let sec = &elf.sec[i];
        if sym >= sec.v_addr && sym < sec.v_addr + sec.size {
            return sym - sec.v_addr + sec.addr;
        }
    }
    0
}

/// Applies one relocation into the loaded image.
pub(super) fn arch_relocate(
    elf: &Elf,
    rela: &Elf32Rela,
    _sym: &Elf32Sym,
    addr: u32,
) -> Result<(), ElfError> {
    let target = map_sym(elf, rela.offset.get() as usize);
    if target == 0 {
        return Err(ElfError::InvalidParam);
    }
    // Safety: map_sym only returns addresses inside the mirrored
    // sections this loader owns; slots are four bytes.
    let slot = unsafe {
        core::slice::from_raw_parts_mut(target as *mut u8, 4)
    };

    match elf_r_type(rela.info.get()) {
        R_XTENSA_RELATIVE => {
            let value =
                map_sym(elf, LittleEndian::read_u32(slot) as usize);
            LittleEndian::write_u32(slot, value as u32);
        }
        R_XTENSA_RTLD => {}
        R_XTENSA_GLOB_DAT | R_XTENSA_JMP_SLOT => {
            LittleEndian::write_u32(slot, addr);
        }
        _ => return Err(ElfError::InvalidParam),
    }
    Ok(())
}
