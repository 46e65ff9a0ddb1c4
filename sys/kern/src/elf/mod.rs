// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ELF applet loader.
//!
//! Loads 32-bit little-endian ELF images into job-owned memory, applies
//! RELA relocations through an architecture backend, and runs the
//! applet's `.preinit_array`/`.init_array`, entry point, and
//! `.fini_array` inside an exit scope the libc shim can unwind to.
//!
//! Segment memory comes from the owning job's heap when a segment fits a
//! region, falling back to the platform allocator for the large ones;
//! every allocation is tracked so a failed load releases exactly what it
//! took.

pub mod riscv;
pub mod symbol;
pub mod xtensa;

use std::ffi::CString;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arrayvec::ArrayVec;
use zerocopy::byteorder::little_endian::{I32, U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::config::{ELF_MAX_SEGMENTS, ELF_MAX_TRACKED_ALLOCS};
use crate::ctx::{self, JobCtx};
use crate::libc::{self, ExitFrame, ExitSignal};
use crate::mem;
use crate::port;
use crate::vfs;
use abi::OpenFlags;

// Segment and section constants, as far as this loader consumes them.
pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 1;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u32 = 1;
pub const SHF_ALLOC: u32 = 2;
pub const SHF_EXECINSTR: u32 = 4;

pub const STT_OBJECT: u8 = 1;
pub const STT_SECTION: u8 = 3;
pub const STT_COMMON: u8 = 5;

pub const fn elf_r_sym(info: u32) -> u32 {
    info >> 8
}

pub const fn elf_r_type(info: u32) -> u8 {
    info as u8
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub ident: [u8; 16],
    pub etype: U16,
    pub machine: U16,
    pub version: U32,
    pub entry: U32,
    pub phoff: U32,
    pub shoff: U32,
    pub flags: U32,
    pub ehsize: U16,
    pub phentsize: U16,
    pub phnum: U16,
    pub shentsize: U16,
    pub shnum: U16,
    pub shstrndx: U16,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Phdr {
    pub ptype: U32,
    pub offset: U32,
    pub vaddr: U32,
    pub paddr: U32,
    pub filesz: U32,
    pub memsz: U32,
    pub flags: U32,
    pub align: U32,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Shdr {
    pub name: U32,
    pub stype: U32,
    pub flags: U32,
    pub addr: U32,
    pub offset: U32,
    pub size: U32,
    pub link: U32,
    pub info: U32,
    pub addralign: U32,
    pub entsize: U32,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub struct Elf32Sym {
    pub name: U32,
    pub value: U32,
    pub size: U32,
    pub info: u8,
    pub other: u8,
    pub shndx: U16,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
pub struct Elf32Rela {
    pub offset: U32,
    pub info: U32,
    pub addend: I32,
}

const EHDR_SIZE: usize = core::mem::size_of::<Elf32Ehdr>();
const PHDR_SIZE: usize = core::mem::size_of::<Elf32Phdr>();
const SHDR_SIZE: usize = core::mem::size_of::<Elf32Shdr>();
const SYM_SIZE: usize = core::mem::size_of::<Elf32Sym>();
const RELA_SIZE: usize = core::mem::size_of::<Elf32Rela>();

static_assertions::const_assert_eq!(EHDR_SIZE, 52);
static_assertions::const_assert_eq!(PHDR_SIZE, 32);
static_assertions::const_assert_eq!(SHDR_SIZE, 40);
static_assertions::const_assert_eq!(SYM_SIZE, 16);
static_assertions::const_assert_eq!(RELA_SIZE, 12);

/// Loader errors, mapped onto the errno-style result ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElfError {
    InvalidParam,
    NotSupported,
    NoMemory,
    NoSys,
    Canceled,
    Io,
    NotFound,
}

impl ElfError {
    pub fn errno(self) -> i32 {
        match self {
            ElfError::InvalidParam => abi::EINVAL,
            ElfError::NotSupported => abi::ENOTSUP,
            ElfError::NoMemory => abi::ENOMEM,
            ElfError::NoSys => abi::ENOSYS,
            ElfError::Canceled => abi::ECANCELED,
            ElfError::Io => abi::EIO,
            ElfError::NotFound => abi::ENOENT,
        }
    }
}

/// Applet entry point signature.
pub type AppletEntry = unsafe extern "C-unwind" fn(i32, *mut *mut u8) -> i32;

/// Init/fini hook signature.
pub type AppletHook = unsafe extern "C-unwind" fn();

#[derive(Copy, Clone, Debug)]
pub(crate) struct SegMap {
    pub vaddr: usize,
    pub addr: usize,
    pub size: usize,
}

#[derive(Copy, Clone, Debug)]
struct TrackedAlloc {
    ptr: *mut u8,
    from_platform: bool,
}

/// Table of applet hook slots living in mapped applet memory.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct HookTable {
    pub addr: usize,
    pub count: usize,
}

/// Section info kept for the section-mirror load path and the Xtensa
/// relocator.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SecInfo {
    pub v_addr: usize,
    pub offset: usize,
    pub addr: usize,
    pub size: usize,
}

pub(crate) const SEC_TEXT: usize = 0;
pub(crate) const SEC_BSS: usize = 1;
pub(crate) const SEC_DATA: usize = 2;
pub(crate) const SEC_RODATA: usize = 3;
pub(crate) const SEC_DRLRO: usize = 4;
pub(crate) const SEC_COUNT: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Loaded { segments: u32, bytes: usize },
    RelocFailed(u8),
    Started,
    Finished(i32),
}

ringbuf::ringbuf!(ELF_TRACE, Trace, 32, Trace::None);

/// One loaded applet image.
pub struct Elf {
    pub(crate) svaddr: usize,
    pub(crate) load_bias: usize,
    pub(crate) sec: [SecInfo; SEC_COUNT],
    pub(crate) maps: ArrayVec<SegMap, ELF_MAX_SEGMENTS>,
    allocs: ArrayVec<TrackedAlloc, ELF_MAX_TRACKED_ALLOCS>,
    pub(crate) preinit: HookTable,
    pub(crate) init: HookTable,
    pub(crate) fini: HookTable,
    pub(crate) entry: Option<AppletEntry>,
    ctx: Option<Arc<JobCtx>>,
}

fn range_ok(offset: u32, size: u32, len: usize) -> bool {
    (offset as u64) + (size as u64) <= len as u64
}

fn read_at<T: FromBytes>(buf: &[u8], offset: usize) -> Option<T> {
    let slice = buf.get(offset..)?;
    T::read_from_prefix(slice).ok().map(|(v, _)| v)
}

/// NUL-terminated string at `offset`, bounded by `limit` bytes.
fn cstr_at(buf: &[u8], offset: usize, limit: usize) -> Option<&str> {
    let slice = buf.get(offset..)?;
    let slice = &slice[..slice.len().min(limit)];
    let end = slice.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&slice[..end]).ok()
}

fn validate_ehdr(buf: &[u8]) -> Result<Elf32Ehdr, ElfError> {
    if buf.len() < EHDR_SIZE {
        return Err(ElfError::InvalidParam);
    }
    let ehdr: Elf32Ehdr =
        read_at(buf, 0).ok_or(ElfError::InvalidParam)?;

    if ehdr.ident[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(ElfError::InvalidParam);
    }
    if ehdr.ident[4] != 1 {
        // 64-bit applets are not a thing on these targets.
        return Err(ElfError::NotSupported);
    }
    if ehdr.ident[5] != 1 {
        return Err(ElfError::NotSupported);
    }
    if (ehdr.ehsize.get() as usize) < EHDR_SIZE {
        return Err(ElfError::InvalidParam);
    }

    if ehdr.phnum.get() > 0 {
        if ehdr.phentsize.get() as usize != PHDR_SIZE {
            return Err(ElfError::InvalidParam);
        }
        let table = ehdr.phnum.get() as u64 * PHDR_SIZE as u64;
        if ehdr.phoff.get() as u64 + table > buf.len() as u64 {
            return Err(ElfError::InvalidParam);
        }
    }

    if ehdr.shnum.get() > 0 {
        if ehdr.shentsize.get() as usize != SHDR_SIZE {
            return Err(ElfError::InvalidParam);
        }
        let table = ehdr.shnum.get() as u64 * SHDR_SIZE as u64;
        if ehdr.shoff.get() as u64 + table > buf.len() as u64 {
            return Err(ElfError::InvalidParam);
        }
        if ehdr.shstrndx.get() >= ehdr.shnum.get() {
            return Err(ElfError::InvalidParam);
        }
    }

    Ok(ehdr)
}

fn shdr_at(
    buf: &[u8],
    ehdr: &Elf32Ehdr,
    index: usize,
) -> Option<Elf32Shdr> {
    if index >= ehdr.shnum.get() as usize {
        return None;
    }
    read_at(buf, ehdr.shoff.get() as usize + index * SHDR_SIZE)
}

impl Elf {
    pub fn new(jctx: Option<Arc<JobCtx>>) -> Self {
        Self {
            svaddr: 0,
            load_bias: 0,
            sec: [SecInfo::default(); SEC_COUNT],
            maps: ArrayVec::new(),
            allocs: ArrayVec::new(),
            preinit: HookTable::default(),
            init: HookTable::default(),
            fini: HookTable::default(),
            entry: None,
            ctx: jctx,
        }
    }

    fn cancelled(&self) -> bool {
        self.ctx
            .as_ref()
            .map(|c| ctx::is_cancelled(c))
            .unwrap_or(false)
    }

    /// Maps an applet virtual address to its loaded host address. An
    /// exact in-range hit wins; a one-past-the-end boundary address (as
    /// toolchains emit for `_end`-style symbols) is accepted only when
    /// nothing else matches. Zero means unmapped.
    pub fn map_vaddr(&self, vaddr: usize) -> usize {
        let mut end_match = 0;
        for map in &self.maps {
            let start = map.vaddr;
            let end = start + map.size;
            if vaddr >= start && vaddr < end {
                return map.addr + (vaddr - start);
            }
            if vaddr == end {
                end_match = map.addr + map.size;
            }
        }
        end_match
    }

    /// Allocates and tracks one segment's backing memory: job heap first,
    /// platform allocator for segments a region cannot hold.
    fn alloc_segment(
        &mut self,
        size: usize,
        _exec: bool,
    ) -> Result<*mut u8, ElfError> {
        let mut from_platform = false;
        let mut ptr = mem::job_try_alloc(self.ctx.as_ref(), size);
        if ptr.is_null() {
            ptr = port::platform_alloc(size);
            from_platform = true;
        }
        if ptr.is_null() {
            return Err(ElfError::NoMemory);
        }
        if self
            .allocs
            .try_push(TrackedAlloc { ptr, from_platform })
            .is_err()
        {
            self.free_one(TrackedAlloc { ptr, from_platform });
            return Err(ElfError::NoMemory);
        }
        Ok(ptr)
    }

    fn free_one(&self, alloc: TrackedAlloc) {
        if alloc.from_platform {
            // Safety: recorded as a platform allocation at alloc time.
            unsafe { port::platform_free(alloc.ptr) };
        } else {
            mem::job_free(self.ctx.as_ref(), alloc.ptr);
        }
    }

    fn track_map(
        &mut self,
        vaddr: usize,
        addr: usize,
        size: usize,
    ) -> Result<(), ElfError> {
        if addr == 0 || size == 0 {
            return Err(ElfError::InvalidParam);
        }
        self.maps
            .try_push(SegMap { vaddr, addr, size })
            .map_err(|_| ElfError::NoMemory)
    }

    /// Releases every tracked allocation and resets the load state.
    fn cleanup_loaded(&mut self) {
        let allocs = std::mem::take(&mut self.allocs);
        for alloc in allocs {
            self.free_one(alloc);
        }
        self.maps.clear();
        self.sec = [SecInfo::default(); SEC_COUNT];
        self.svaddr = 0;
        self.load_bias = 0;
        self.preinit = HookTable::default();
        self.init = HookTable::default();
        self.fini = HookTable::default();
        self.entry = None;
    }

    /// Program-header based image load: one host segment per `PT_LOAD`,
    /// anchored at the lowest virtual address.
    fn load_phdr_image(&mut self, buf: &[u8]) -> Result<(), ElfError> {
        let ehdr: Elf32Ehdr =
            read_at(buf, 0).ok_or(ElfError::InvalidParam)?;
        if ehdr.phnum.get() == 0 {
            return Err(ElfError::NotSupported);
        }

        let mut lowest_vaddr = usize::MAX;
        let mut lowest_addr = 0usize;
        let mut loaded = 0u32;
        let mut total = 0usize;

        for i in 0..ehdr.phnum.get() as usize {
            let phdr: Elf32Phdr = read_at(
                buf,
                ehdr.phoff.get() as usize + i * PHDR_SIZE,
            )
            .ok_or(ElfError::InvalidParam)?;
            if phdr.ptype.get() != PT_LOAD {
                continue;
            }

            let filesz = phdr.filesz.get() as usize;
            let memsz = phdr.memsz.get() as usize;
            let vaddr = phdr.vaddr.get() as usize;
            if memsz < filesz {
                return Err(ElfError::InvalidParam);
            }
            if !range_ok(phdr.offset.get(), phdr.filesz.get(), buf.len())
            {
                return Err(ElfError::InvalidParam);
            }

            let exec = phdr.flags.get() & PF_X != 0;
            let segment = self.alloc_segment(memsz.max(1), exec)?;
            // Safety: segment spans at least memsz bytes, freshly owned.
            unsafe {
                core::ptr::write_bytes(segment, 0, memsz);
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(phdr.offset.get() as usize),
                    segment,
                    filesz,
                );
            }
            self.track_map(vaddr, segment as usize, memsz)?;

            if vaddr < lowest_vaddr {
                lowest_vaddr = vaddr;
                lowest_addr = segment as usize;
            }
            loaded += 1;
            total += memsz;

            port::cache_flush(segment, memsz);
            port::cache_invalidate(segment, memsz);
        }

        if loaded == 0 || lowest_vaddr == usize::MAX {
            return Err(ElfError::NotSupported);
        }

        self.svaddr = lowest_vaddr;
        self.load_bias = lowest_addr.wrapping_sub(lowest_vaddr);
        port::cache_barrier();
        ringbuf::ringbuf_entry!(
            ELF_TRACE,
            Trace::Loaded {
                segments: loaded,
                bytes: total,
            }
        );

        let entry = self.map_vaddr(ehdr.entry.get() as usize);
        if entry == 0 {
            return Err(ElfError::InvalidParam);
        }
        // Safety: the entry address points into a mapped, loaded
        // segment; calling it is the applet contract.
        self.entry =
            Some(unsafe { core::mem::transmute::<usize, AppletEntry>(entry) });
        Ok(())
    }

    /// Section-mirror fallback for toolchains whose program headers are
    /// unusable: text in one allocation, data/rodata/relro/bss packed in
    /// a second, with the section table doubling as the relocation map.
    #[allow(dead_code)]
    fn load_section_image(&mut self, buf: &[u8]) -> Result<(), ElfError> {
        let ehdr: Elf32Ehdr =
            read_at(buf, 0).ok_or(ElfError::InvalidParam)?;
        let shstr =
            shdr_at(buf, &ehdr, ehdr.shstrndx.get() as usize)
                .ok_or(ElfError::InvalidParam)?;

        for i in 0..ehdr.shnum.get() as usize {
            let shdr =
                shdr_at(buf, &ehdr, i).ok_or(ElfError::InvalidParam)?;
            let name = cstr_at(
                buf,
                shstr.offset.get() as usize + shdr.name.get() as usize,
                shstr.size.get() as usize,
            )
            .unwrap_or("");
            let info = SecInfo {
                v_addr: shdr.addr.get() as usize,
                offset: shdr.offset.get() as usize,
                addr: 0,
                size: shdr.size.get() as usize,
            };
            let progbits = shdr.stype.get() == SHT_PROGBITS
                && shdr.flags.get() & SHF_ALLOC != 0;
            match name {
                ".text" if progbits => {
                    self.sec[SEC_TEXT] = SecInfo {
                        size: align4(info.size),
                        ..info
                    }
                }
                ".data" if progbits => self.sec[SEC_DATA] = info,
                ".rodata" if progbits => self.sec[SEC_RODATA] = info,
                ".data.rel.ro" if progbits => {
                    self.sec[SEC_DRLRO] = info
                }
                ".bss" if shdr.stype.get() == SHT_NOBITS => {
                    self.sec[SEC_BSS] = info
                }
                _ => {}
            }
        }

        if self.sec[SEC_TEXT].size == 0 {
            return Err(ElfError::InvalidParam);
        }

        let text_size = self.sec[SEC_TEXT].size;
        let text_offset = self.sec[SEC_TEXT].offset;
        if text_offset > buf.len() {
            return Err(ElfError::InvalidParam);
        }
        let text = self.alloc_segment(text_size, true)?;
        self.sec[SEC_TEXT].addr = text as usize;
        // Safety: allocation covers text_size; the source length is
        // clamped to what the buffer actually holds past the offset.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(text_offset),
                text,
                text_size.min(buf.len() - text_offset),
            );
        }
        self.track_map(
            self.sec[SEC_TEXT].v_addr,
            text as usize,
            text_size,
        )?;

        let data_total = align4(self.sec[SEC_DATA].size)
            + align4(self.sec[SEC_RODATA].size)
            + align4(self.sec[SEC_DRLRO].size)
            + align4(self.sec[SEC_BSS].size);
        if data_total > 0 {
            let base = self.alloc_segment(data_total, false)?;
            let mut cursor = base;
            for idx in [SEC_DATA, SEC_RODATA, SEC_DRLRO] {
                let size = self.sec[idx].size;
                if size == 0 {
                    continue;
                }
                if !range_ok(
                    self.sec[idx].offset as u32,
                    size as u32,
                    buf.len(),
                ) {
                    return Err(ElfError::InvalidParam);
                }
                self.sec[idx].addr = cursor as usize;
                // Safety: cursor stays within the data_total allocation
                // by construction of the sum above; the source range was
                // just checked.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        buf.as_ptr().add(self.sec[idx].offset),
                        cursor,
                        size,
                    );
                    cursor = cursor.add(align4(size));
                }
                self.track_map(
                    self.sec[idx].v_addr,
                    self.sec[idx].addr,
                    size,
                )?;
            }
            let bss = self.sec[SEC_BSS].size;
            if bss != 0 {
                self.sec[SEC_BSS].addr = cursor as usize;
                // Safety: the tail of the same allocation.
                unsafe { core::ptr::write_bytes(cursor, 0, bss) };
                self.track_map(
                    self.sec[SEC_BSS].v_addr,
                    cursor as usize,
                    bss,
                )?;
            }
        }

        self.load_bias = (self.sec[SEC_TEXT].addr)
            .wrapping_sub(self.sec[SEC_TEXT].v_addr);
        let entry = self.map_vaddr(ehdr.entry.get() as usize);
        if entry == 0 {
            return Err(ElfError::InvalidParam);
        }
        // Safety: as in load_phdr_image.
        self.entry =
            Some(unsafe { core::mem::transmute::<usize, AppletEntry>(entry) });
        Ok(())
    }

    /// Contiguous-image fallback: every `PT_LOAD` copied into one
    /// allocation spanning the whole virtual range.
    #[allow(dead_code)]
    fn load_segment_image(&mut self, buf: &[u8]) -> Result<(), ElfError> {
        let ehdr: Elf32Ehdr =
            read_at(buf, 0).ok_or(ElfError::InvalidParam)?;
        let mut vaddr_s = 0usize;
        let mut vaddr_e = 0usize;
        let mut first = true;

        for i in 0..ehdr.phnum.get() as usize {
            let phdr: Elf32Phdr = read_at(
                buf,
                ehdr.phoff.get() as usize + i * PHDR_SIZE,
            )
            .ok_or(ElfError::InvalidParam)?;
            if phdr.ptype.get() != PT_LOAD {
                continue;
            }
            let vaddr = phdr.vaddr.get() as usize;
            let memsz = phdr.memsz.get() as usize;
            if (phdr.memsz.get()) < phdr.filesz.get() {
                return Err(ElfError::InvalidParam);
            }
            if first {
                vaddr_s = vaddr;
                vaddr_e = vaddr + memsz;
                first = false;
            } else {
                if vaddr < vaddr_e {
                    return Err(ElfError::InvalidParam);
                }
                vaddr_e = vaddr + memsz;
            }
            if vaddr_e < vaddr {
                return Err(ElfError::InvalidParam);
            }
        }

        let size = vaddr_e.wrapping_sub(vaddr_s);
        if first || size == 0 {
            return Err(ElfError::InvalidParam);
        }

        let segment = self.alloc_segment(size, true)?;
        // Safety: allocation spans `size` bytes.
        unsafe { core::ptr::write_bytes(segment, 0, size) };

        for i in 0..ehdr.phnum.get() as usize {
            let phdr: Elf32Phdr = read_at(
                buf,
                ehdr.phoff.get() as usize + i * PHDR_SIZE,
            )
            .ok_or(ElfError::InvalidParam)?;
            if phdr.ptype.get() != PT_LOAD {
                continue;
            }
            if !range_ok(phdr.offset.get(), phdr.filesz.get(), buf.len())
            {
                return Err(ElfError::InvalidParam);
            }
            // Safety: destination offset bounded by the span computed
            // above; source bounded by range_ok.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(phdr.offset.get() as usize),
                    segment.add(phdr.vaddr.get() as usize - vaddr_s),
                    phdr.filesz.get() as usize,
                );
            }
        }

        self.svaddr = vaddr_s;
        // The section-table view covers the whole image so RELATIVE
        // relocations resolve in segment mode too.
        self.sec[SEC_TEXT] = SecInfo {
            v_addr: vaddr_s,
            offset: 0,
            addr: segment as usize,
            size,
        };
        self.track_map(vaddr_s, segment as usize, size)?;
        self.load_bias = (segment as usize).wrapping_sub(vaddr_s);

        let entry = self.map_vaddr(ehdr.entry.get() as usize);
        if entry == 0 {
            return Err(ElfError::InvalidParam);
        }
        // Safety: as in load_phdr_image.
        self.entry =
            Some(unsafe { core::mem::transmute::<usize, AppletEntry>(entry) });
        Ok(())
    }

    fn capture_hook_tables(&mut self, buf: &[u8], ehdr: &Elf32Ehdr) {
        let Some(shstr) =
            shdr_at(buf, ehdr, ehdr.shstrndx.get() as usize)
        else {
            return;
        };
        for i in 0..ehdr.shnum.get() as usize {
            let Some(shdr) = shdr_at(buf, ehdr, i) else {
                continue;
            };
            if shdr.stype.get() != SHT_PROGBITS
                || shdr.flags.get() & SHF_ALLOC == 0
                || shdr.size.get() == 0
            {
                continue;
            }
            let name = cstr_at(
                buf,
                shstr.offset.get() as usize + shdr.name.get() as usize,
                shstr.size.get() as usize,
            )
            .unwrap_or("");
            let table = HookTable {
                addr: self.map_vaddr(shdr.addr.get() as usize),
                count: shdr.size.get() as usize
                    / core::mem::size_of::<usize>(),
            };
            match name {
                ".preinit_array" => self.preinit = table,
                ".init_array" => self.init = table,
                ".fini_array" => self.fini = table,
                _ => {}
            }
        }
    }

    /// Validates, loads, and relocates `buf`. On failure every tracked
    /// allocation has been released.
    pub fn relocate(&mut self, buf: &[u8]) -> Result<(), ElfError> {
        match self.relocate_inner(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cleanup_loaded();
                Err(e)
            }
        }
    }

    fn relocate_inner(&mut self, buf: &[u8]) -> Result<(), ElfError> {
        let ehdr = validate_ehdr(buf)?;

        if ehdr.shnum.get() > 0 {
            let shstr =
                shdr_at(buf, &ehdr, ehdr.shstrndx.get() as usize)
                    .ok_or(ElfError::InvalidParam)?;
            if !range_ok(shstr.offset.get(), shstr.size.get(), buf.len())
            {
                return Err(ElfError::InvalidParam);
            }
        }

        // Prefer the program-header path; fall back per target flavor.
        match self.load_phdr_image(buf) {
            Ok(()) => {}
            Err(ElfError::NotSupported) => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "xtensa")] {
                        self.load_section_image(buf)?;
                    } else {
                        self.load_segment_image(buf)?;
                    }
                }
            }
            Err(e) => return Err(e),
        }

        if self.cancelled() {
            return Err(ElfError::Canceled);
        }

        if ehdr.shnum.get() > 0 {
            self.capture_hook_tables(buf, &ehdr);
            self.apply_rela_sections(buf, &ehdr)?;
        }

        for map in &self.maps {
            port::cache_flush(map.addr as *const u8, map.size);
            port::cache_invalidate(map.addr as *const u8, map.size);
        }
        port::cache_barrier();
        Ok(())
    }

    fn apply_rela_sections(
        &mut self,
        buf: &[u8],
        ehdr: &Elf32Ehdr,
    ) -> Result<(), ElfError> {
        for i in 0..ehdr.shnum.get() as usize {
            let shdr =
                shdr_at(buf, ehdr, i).ok_or(ElfError::InvalidParam)?;
            if shdr.stype.get() != SHT_RELA {
                continue;
            }

            let symtab_hdr =
                shdr_at(buf, ehdr, shdr.link.get() as usize)
                    .ok_or(ElfError::InvalidParam)?;
            let strtab_hdr =
                shdr_at(buf, ehdr, symtab_hdr.link.get() as usize)
                    .ok_or(ElfError::InvalidParam)?;

            if !range_ok(shdr.offset.get(), shdr.size.get(), buf.len())
                || !range_ok(
                    symtab_hdr.offset.get(),
                    symtab_hdr.size.get(),
                    buf.len(),
                )
                || !range_ok(
                    strtab_hdr.offset.get(),
                    strtab_hdr.size.get(),
                    buf.len(),
                )
            {
                return Err(ElfError::InvalidParam);
            }

            let nr_reloc = shdr.size.get() as usize / RELA_SIZE;
            let sym_count = symtab_hdr.size.get() as usize / SYM_SIZE;

            for r in 0..nr_reloc {
                if r & 0x3f == 0 && self.cancelled() {
                    return Err(ElfError::Canceled);
                }

                let rela: Elf32Rela = read_at(
                    buf,
                    shdr.offset.get() as usize + r * RELA_SIZE,
                )
                .ok_or(ElfError::InvalidParam)?;

                let sym_index = elf_r_sym(rela.info.get()) as usize;
                if sym_index >= sym_count {
                    return Err(ElfError::InvalidParam);
                }
                let sym: Elf32Sym = read_at(
                    buf,
                    symtab_hdr.offset.get() as usize
                        + sym_index * SYM_SIZE,
                )
                .ok_or(ElfError::InvalidParam)?;

                let sym_type = sym.info & 0xf;
                let reloc_type = elf_r_type(rela.info.get());
                let sym_name = cstr_at(
                    buf,
                    strtab_hdr.offset.get() as usize
                        + sym.name.get() as usize,
                    strtab_hdr.size.get() as usize,
                )
                .unwrap_or("");

                let mut addr = 0usize;
                if reloc_type == 0 || reloc_type == 2 {
                    // NONE / RTLD flavors: nothing to resolve.
                } else if matches!(
                    sym_type,
                    STT_COMMON | STT_OBJECT | STT_SECTION
                ) && !sym_name.is_empty()
                {
                    addr = symbol::find_sym(sym_name);
                    if addr == 0 {
                        ringbuf::ringbuf_entry!(
                            ELF_TRACE,
                            Trace::RelocFailed(reloc_type)
                        );
                        return Err(ElfError::NoSys);
                    }
                } else {
                    if !sym_name.is_empty() {
                        addr = symbol::find_sym(sym_name);
                    }
                    if addr == 0 && sym.value.get() != 0 {
                        addr =
                            self.map_vaddr(sym.value.get() as usize);
                    }
                    if addr == 0 && !sym_name.is_empty() {
                        ringbuf::ringbuf_entry!(
                            ELF_TRACE,
                            Trace::RelocFailed(reloc_type)
                        );
                        return Err(ElfError::NoSys);
                    }
                }

                arch_relocate(self, &rela, &sym, addr as u32)?;
            }
        }
        Ok(())
    }

    /// Runs the applet: pushes an exit frame, fires the preinit/init
    /// hooks, calls the entry point, then runs the fini hooks in
    /// reverse. An `exit()` inside the applet unwinds to this scope and
    /// yields its status.
    pub fn request(&mut self, args: &[&str]) -> Result<i32, ElfError> {
        let entry = self.entry.ok_or(ElfError::InvalidParam)?;
        if self.cancelled() {
            return Err(ElfError::Canceled);
        }
        ringbuf::ringbuf_entry!(ELF_TRACE, Trace::Started);

        let frame = mem::job_alloc(
            self.ctx.as_ref(),
            core::mem::size_of::<ExitFrame>(),
        ) as *mut ExitFrame;
        if frame.is_null() {
            return Err(ElfError::NoMemory);
        }
        // Safety: freshly allocated frame, zeroed before push; popped
        // and freed below on every path.
        unsafe {
            core::ptr::write_bytes(frame as *mut u8, 0, core::mem::size_of::<ExitFrame>());
            libc::exit_frame_push(frame);
        }

        let mut arg_storage: Vec<CString> = Vec::new();
        for arg in args {
            match CString::new(*arg) {
                Ok(s) => arg_storage.push(s),
                Err(_) => {
                    // Frame bookkeeping must unwind before reporting.
                    unsafe {
                        libc::exit_frame_pop(frame);
                    }
                    mem::job_free(self.ctx.as_ref(), frame as *mut u8);
                    return Err(ElfError::InvalidParam);
                }
            }
        }
        let mut argv: Vec<*mut u8> = arg_storage
            .iter()
            .map(|s| s.as_ptr() as *mut u8)
            .collect();
        argv.push(core::ptr::null_mut());
        let argc = args.len() as i32;

        let preinit = self.preinit;
        let init = self.init;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            // Safety: hook tables point into loaded applet memory (or
            // test-owned tables); slots are code addresses by the ELF
            // contract.
            unsafe {
                run_hooks_forward(preinit);
                run_hooks_forward(init);
                entry(argc, argv.as_mut_ptr())
            }
        }));
        let rc = match outcome {
            Ok(rc) => rc,
            Err(payload) => match payload.downcast_ref::<ExitSignal>() {
                Some(signal) => signal.code,
                None => resume_unwind(payload),
            },
        };

        // Safety: as for the init tables.
        unsafe { run_hooks_reverse(self.fini) };

        // Safety: frame is the one pushed above.
        unsafe { libc::exit_frame_pop(frame) };
        mem::job_free(self.ctx.as_ref(), frame as *mut u8);
        ringbuf::ringbuf_entry!(ELF_TRACE, Trace::Finished(rc));
        Ok(rc)
    }

    pub fn deinit(&mut self) {
        self.cleanup_loaded();
    }
}

impl Drop for Elf {
    fn drop(&mut self) {
        self.cleanup_loaded();
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

unsafe fn run_hooks_forward(table: HookTable) {
    if table.addr == 0 {
        return;
    }
    for i in 0..table.count {
        let slot = (table.addr as *const usize).add(i).read();
        if slot != 0 {
            let hook: AppletHook = core::mem::transmute(slot);
            hook();
        }
    }
}

unsafe fn run_hooks_reverse(table: HookTable) {
    if table.addr == 0 {
        return;
    }
    for i in (0..table.count).rev() {
        let slot = (table.addr as *const usize).add(i).read();
        if slot != 0 {
            let hook: AppletHook = core::mem::transmute(slot);
            hook();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "xtensa")] {
        use xtensa::arch_relocate;
    } else {
        use riscv::arch_relocate;
    }
}

/// Loads and runs an ELF image from memory in the current job context.
/// Returns the applet's exit status.
pub fn run_buffer(buf: &[u8], args: &[&str]) -> Result<i32, ElfError> {
    let jctx = ctx::current();
    let mut elf = Elf::new(jctx);
    elf.relocate(buf)?;
    let rc = elf.request(args);
    elf.deinit();
    rc
}

/// Reads an ELF image from the VFS and runs it in the current job
/// context. The read buffer is transient kernel memory, not job heap:
/// image sizes routinely exceed a region's payload limit.
pub fn run_file(path: &str, args: &[&str]) -> Result<i32, ElfError> {
    let job = ctx::current_job_id();
    let fd = vfs::open(job, path, OpenFlags::empty())
        .map_err(|_| ElfError::NotFound)?;

    let mut image = Vec::new();
    let mut tmp = [0u8; 256];
    loop {
        match vfs::read(job, fd, &mut tmp) {
            Ok(0) => break,
            Ok(n) => image.extend_from_slice(&tmp[..n]),
            Err(_) => {
                let _ = vfs::close(job, fd);
                return Err(ElfError::Io);
            }
        }
    }
    let _ = vfs::close(job, fd);

    if image.is_empty() {
        return Err(ElfError::InvalidParam);
    }
    run_buffer(&image, args)
}


#[cfg(test)]
mod tests {
    use super::testimg::Image;
    use super::*;
    use crate::port::Spinlock;
    use abi::JobId;
    use byteorder::{ByteOrder, LittleEndian};

    // Matches the layout math in Image::build.
    fn tail_offset(phdrs: usize, shdrs: usize) -> u32 {
        52 + phdrs as u32 * 32 + shdrs as u32 * 40
    }

    fn one_segment_image() -> (Vec<u8>, u32) {
        let mut img = Image::new();
        img.tail_offset = tail_offset(1, 0);
        let seg = img.blob(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        img.phdrs.push([
            PT_LOAD, seg, 0x1000, 0x1000, 8, 16, PF_X, 4,
        ]);
        img.entry = 0x1004;
        (img.build(), 0x1000)
    }

    #[test]
    fn rejects_garbage_and_wrong_class() {
        let mut elf = Elf::new(None);
        assert_eq!(
            elf.relocate(&[0u8; 64]).unwrap_err(),
            ElfError::InvalidParam
        );
        assert!(elf.allocs.is_empty());

        let (mut image, _) = one_segment_image();
        image[4] = 2; // ELFCLASS64
        assert_eq!(
            elf.relocate(&image).unwrap_err(),
            ElfError::NotSupported
        );
        assert!(elf.allocs.is_empty());

        let (mut image, _) = one_segment_image();
        image[5] = 2; // big-endian
        assert_eq!(
            elf.relocate(&image).unwrap_err(),
            ElfError::NotSupported
        );

        // Truncated buffer fails the header scan, not the allocator.
        let (image, _) = one_segment_image();
        assert_eq!(
            elf.relocate(&image[..40]).unwrap_err(),
            ElfError::InvalidParam
        );
        assert!(elf.allocs.is_empty());
    }

    #[test]
    fn phdr_load_maps_zero_fills_and_anchors_bias() {
        let (image, vaddr) = one_segment_image();
        let mut elf = Elf::new(None);
        elf.relocate(&image).unwrap();

        assert_eq!(elf.maps.len(), 1);
        let map = elf.maps[0];
        assert_eq!(map.vaddr, vaddr as usize);
        assert_eq!(map.size, 16);
        assert_eq!(elf.load_bias, map.addr.wrapping_sub(map.vaddr));

        // File bytes copied, memsz tail zero-filled.
        let seg = unsafe {
            core::slice::from_raw_parts(map.addr as *const u8, 16)
        };
        assert_eq!(&seg[..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(&seg[8..], &[0u8; 8]);

        // Entry resolved through the map.
        assert_eq!(elf.entry.map(|e| e as usize), Some(map.addr + 4));
        elf.deinit();
        assert!(elf.allocs.is_empty());
    }

    #[test]
    fn map_vaddr_prefers_exact_match_and_accepts_end_boundary() {
        let (image, vaddr) = one_segment_image();
        let mut elf = Elf::new(None);
        elf.relocate(&image).unwrap();
        let base = elf.maps[0].addr;
        let vaddr = vaddr as usize;

        assert_eq!(elf.map_vaddr(vaddr), base);
        assert_eq!(elf.map_vaddr(vaddr + 15), base + 15);
        // One past the end resolves (boundary symbols)...
        assert_eq!(elf.map_vaddr(vaddr + 16), base + 16);
        // ...but beyond that is unmapped.
        assert_eq!(elf.map_vaddr(vaddr + 17), 0);
        assert_eq!(elf.map_vaddr(0), 0);
        elf.deinit();
    }

    #[test]
    fn memsz_smaller_than_filesz_is_invalid() {
        let mut img = Image::new();
        img.tail_offset = tail_offset(1, 0);
        let seg = img.blob(&[0u8; 8]);
        img.phdrs.push([PT_LOAD, seg, 0x1000, 0x1000, 8, 4, 0, 4]);
        img.entry = 0x1000;
        let mut elf = Elf::new(None);
        assert_eq!(
            elf.relocate(&img.build()).unwrap_err(),
            ElfError::InvalidParam
        );
        assert!(elf.allocs.is_empty());
    }

    /// Builds an image with one segment plus a full RELA group
    /// (.rela/.symtab/.strtab) containing the given entries.
    fn rela_image(
        syms: &[(&str, u32, u8)],
        relas: &[(u32, u32, i32)],
    ) -> Vec<u8> {
        let mut img = Image::new();
        img.tail_offset = tail_offset(1, 4);

        let seg = img.blob(&[0u8; 32]);
        img.phdrs
            .push([PT_LOAD, seg, 0x1000, 0x1000, 32, 32, PF_X, 4]);
        img.entry = 0x1000;

        // String table: leading NUL, then the symbol names.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in syms {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // Symbol table: null symbol plus the requested ones.
        let mut symtab = vec![0u8; 16];
        for ((_, value, stype), name_off) in
            syms.iter().zip(&name_offsets)
        {
            testimg::put_u32(&mut symtab, *name_off);
            testimg::put_u32(&mut symtab, *value);
            testimg::put_u32(&mut symtab, 0);
            symtab.push(*stype);
            symtab.push(0);
            testimg::put_u16(&mut symtab, 0);
        }

        let mut rela = Vec::new();
        for (offset, info, addend) in relas {
            testimg::put_u32(&mut rela, *offset);
            testimg::put_u32(&mut rela, *info);
            rela.extend_from_slice(&addend.to_le_bytes());
        }

        let strtab_len = strtab.len() as u32;
        let symtab_len = symtab.len() as u32;
        let rela_len = rela.len() as u32;
        let strtab_off = img.blob(&strtab);
        let symtab_off = img.blob(&symtab);
        let rela_off = img.blob(&rela);

        // Sections: null, .rela (link=2), .symtab (link=3), .strtab.
        img.shdrs.push([0; 10]);
        img.shdrs.push([
            0, SHT_RELA, 0, 0, rela_off, rela_len, 2, 0, 4, 12,
        ]);
        img.shdrs.push([
            0, 2, 0, 0, symtab_off, symtab_len, 3, 0, 4, 16,
        ]);
        img.shdrs
            .push([0, 3, 0, 0, strtab_off, strtab_len, 0, 0, 1, 0]);
        img.build()
    }

    #[test]
    fn riscv_abs32_resolves_through_symbol_registry() {
        symbol::register_symbol("elf_test_abs32", 0x4000);
        // sym index 1, R_RISCV_32 (1), at vaddr 0x1008, addend 4.
        let image = rela_image(
            &[("elf_test_abs32", 0, 2)],
            &[(0x1008, (1 << 8) | 1, 4)],
        );
        let mut elf = Elf::new(None);
        elf.relocate(&image).unwrap();

        let addr = elf.map_vaddr(0x1008);
        let slot = unsafe {
            core::slice::from_raw_parts(addr as *const u8, 4)
        };
        assert_eq!(LittleEndian::read_u32(slot), 0x4004);
        elf.deinit();
    }

    #[test]
    fn riscv_relative_writes_bias_plus_addend() {
        // sym 1 unused by RELATIVE; use the null-ish entry.
        let image = rela_image(
            &[("unused_sym_name", 0, 2)],
            &[(0x100C, 3, 0x10)],
        );
        let mut elf = Elf::new(None);
        elf.relocate(&image).unwrap();

        let addr = elf.map_vaddr(0x100C);
        let slot = unsafe {
            core::slice::from_raw_parts(addr as *const u8, 4)
        };
        let expected = (elf.load_bias as u32).wrapping_add(0x10);
        assert_eq!(LittleEndian::read_u32(slot), expected);
        elf.deinit();
    }

    #[test]
    fn unresolved_symbol_fails_with_nosys_and_no_leaks() {
        let image = rela_image(
            &[("definitely_not_registered_xyz", 0, 2)],
            &[(0x1008, (1 << 8) | 1, 0)],
        );
        let mut elf = Elf::new(None);
        assert_eq!(elf.relocate(&image).unwrap_err(), ElfError::NoSys);
        assert!(elf.allocs.is_empty());
        assert!(elf.maps.is_empty());
        assert!(elf.entry.is_none());
    }

    #[test]
    fn cancelled_ctx_aborts_relocation() {
        let jctx = ctx::create(JobId(0xE1F0), JobId::INVALID);
        ctx::mark_cancelled(&jctx);
        let (image, _) = one_segment_image();
        let mut elf = Elf::new(Some(jctx));
        assert_eq!(
            elf.relocate(&image).unwrap_err(),
            ElfError::Canceled
        );
        assert!(elf.allocs.is_empty());
    }

    // --- request() semantics ------------------------------------------------

    // The sequence log is shared, so the request tests run one at a
    // time.
    static REQUEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    static SEQUENCE: Spinlock<Vec<&'static str>> =
        Spinlock::new(Vec::new());

    unsafe extern "C-unwind" fn hook_init() {
        SEQUENCE.lock().push("init");
    }

    unsafe extern "C-unwind" fn hook_preinit() {
        SEQUENCE.lock().push("preinit");
    }

    unsafe extern "C-unwind" fn hook_fini() {
        SEQUENCE.lock().push("fini");
    }

    unsafe extern "C-unwind" fn entry_counts_args(
        argc: i32,
        argv: *mut *mut u8,
    ) -> i32 {
        SEQUENCE.lock().push("entry");
        // argv[argc] is the NULL terminator.
        assert!(!argv.is_null());
        assert!((*argv.add(argc as usize)).is_null());
        argc
    }

    unsafe extern "C-unwind" fn entry_calls_exit(
        _argc: i32,
        _argv: *mut *mut u8,
    ) -> i32 {
        SEQUENCE.lock().push("entry");
        crate::libc::exit(42)
    }

    fn with_run_ctx<R>(f: impl FnOnce() -> R) -> R {
        let jctx = ctx::create(JobId(0xE1F1), JobId::INVALID);
        ctx::set_current(Some(jctx));
        let r = f();
        ctx::set_current(None);
        r
    }

    fn hook_table(slots: &[usize]) -> HookTable {
        HookTable {
            addr: slots.as_ptr() as usize,
            count: slots.len(),
        }
    }

    #[test]
    fn request_runs_init_entry_fini_in_order() {
        let _guard =
            REQUEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_run_ctx(|| {
            SEQUENCE.lock().clear();
            let preinit = [hook_preinit as usize];
            let init = [hook_init as usize];
            let fini = [hook_fini as usize];

            let mut elf = Elf::new(ctx::current());
            elf.entry = Some(entry_counts_args);
            elf.preinit = hook_table(&preinit);
            elf.init = hook_table(&init);
            elf.fini = hook_table(&fini);

            let rc = elf.request(&["init", "-x"]).unwrap();
            assert_eq!(rc, 2);
            assert_eq!(
                *SEQUENCE.lock(),
                vec!["preinit", "init", "entry", "fini"]
            );
        });
    }

    #[test]
    fn request_catches_applet_exit_and_still_runs_fini() {
        let _guard =
            REQUEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_run_ctx(|| {
            SEQUENCE.lock().clear();
            let fini = [hook_fini as usize];

            let mut elf = Elf::new(ctx::current());
            elf.entry = Some(entry_calls_exit);
            elf.fini = hook_table(&fini);

            let rc = elf.request(&["app"]).unwrap();
            assert_eq!(rc, 42);
            assert_eq!(*SEQUENCE.lock(), vec!["entry", "fini"]);
        });
    }

    #[test]
    fn fini_hooks_run_in_reverse_order() {
        let _guard =
            REQUEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_run_ctx(|| {
            SEQUENCE.lock().clear();
            unsafe extern "C-unwind" fn fini_a() {
                SEQUENCE.lock().push("a");
            }
            unsafe extern "C-unwind" fn fini_b() {
                SEQUENCE.lock().push("b");
            }
            let fini = [fini_a as usize, fini_b as usize];

            let mut elf = Elf::new(ctx::current());
            elf.entry = Some(entry_counts_args);
            elf.fini = hook_table(&fini);
            elf.request(&[]).unwrap();
            assert_eq!(*SEQUENCE.lock(), vec!["entry", "b", "a"]);
        });
    }

    #[test]
    fn request_without_entry_is_invalid() {
        let mut elf = Elf::new(None);
        assert_eq!(
            elf.request(&[]).unwrap_err(),
            ElfError::InvalidParam
        );
    }
}
