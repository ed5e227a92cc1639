//! Firmware file formats
use std::str;
use std::{borrow::Cow, path::Path};

use object::{
    Endianness, Object, ObjectSection, elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader,
    read::elf::ProgramHeader,
};

use crate::constants::ERASED_BYTE;
use crate::error::{Error, Result};
use crate::image::{Image, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

pub fn read_image_from_file<P: AsRef<Path>>(path: P) -> Result<Image> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    read_image(format, &raw)
}

pub fn read_image(format: FirmwareFormat, raw: &[u8]) -> Result<Image> {
    match format {
        FirmwareFormat::PlainHex => read_hex(raw),
        FirmwareFormat::IntelHex => {
            let text = str::from_utf8(raw)
                .map_err(|e| Error::UnsupportedFile(format!("record file is not text: {}", e)))?;
            Image::from_text(text)
        }
        FirmwareFormat::ELF => objcopy_image(raw),
        FirmwareFormat::Binary => image_from_raw(raw.to_vec()),
    }
}

/// Saves `image` as record text, `record_len` data bytes per line.
pub fn write_image_to_file<P: AsRef<Path>>(path: P, image: &Image, record_len: usize) -> Result<()> {
    let text = image.to_text_with(record_len)?;
    std::fs::write(path.as_ref(), text)?;
    log::info!(
        "Wrote {} bytes to {}",
        image.total_allocated_bytes(),
        path.as_ref().display()
    );
    Ok(())
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90", "eep"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "bin" {
        return FirmwareFormat::Binary;
    }

    let is_text = |c: u8| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r';
    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':')
        && raw.iter().all(|&c| is_text(c) || c == b':')
    {
        FirmwareFormat::IntelHex
    } else if !raw.is_empty() && raw.iter().all(|&c| is_text(c)) {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Hex digits without record framing, loaded at address 0.
pub fn read_hex(data: &[u8]) -> Result<Image> {
    let digits: Vec<u8> = data
        .iter()
        .copied()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let raw = hex::decode(digits)
        .map_err(|e| Error::UnsupportedFile(format!("invalid plain hex: {}", e)))?;
    image_from_raw(raw)
}

fn image_from_raw(raw: Vec<u8>) -> Result<Image> {
    if raw.is_empty() {
        return Err(Error::UnsupportedFile("empty firmware".into()));
    }
    if raw.len() > u16::MAX as usize + 1 {
        return Err(Error::AddressOutOfRange {
            address: raw.len() as u32 - 1,
            limit: u16::MAX as u32,
        });
    }
    Image::from_bytes(0, raw)
}

fn elf_error(err: object::Error) -> Error {
    Error::UnsupportedFile(err.to_string())
}

/// Simulates `objcopy -O ihex`: every loadable segment lands at its
/// physical address, gaps stay unallocated.
pub fn objcopy_image(elf_data: &[u8]) -> Result<Image> {
    let file_kind = object::FileKind::parse(elf_data).map_err(elf_error)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => {
            return Err(Error::UnsupportedFile(
                "cannot read file as ELF32 format".into(),
            ));
        }
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data).map_err(elf_error)?;
    let binary = object::read::elf::ElfFile::<FileHeader32<Endianness>>::parse(elf_data)
        .map_err(elf_error)?;

    let mut sections = vec![];

    let endian = elf_header.endian().map_err(elf_error)?;

    for segment in elf_header
        .program_headers(endian, elf_data)
        .map_err(elf_error)?
    {
        // Get the physical address of the segment. The data will be programmed to that location.
        let p_paddr: u64 = segment.p_paddr(endian).into();
        let p_vaddr: u64 = segment.p_vaddr(endian).into();

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| Error::UnsupportedFile("Failed to access data for an ELF segment.".into()))?;
        if segment_data.is_empty() || segment.p_type(endian) != PT_LOAD {
            continue;
        }
        // EEPROM, fuse and lock sections live far above the flash
        if p_paddr + segment_data.len() as u64 > u16::MAX as u64 + 1 {
            log::warn!(
                "Skipping loadable segment outside flash, physical address: {:#010x}",
                p_paddr
            );
            continue;
        }
        log::info!(
            "Found loadable segment, physical address: {:#06x}, virtual address: {:#010x}, size: {:#x}",
            p_paddr,
            p_vaddr,
            segment_data.len()
        );
        let (segment_offset, segment_filesize) = segment.file_range(endian);
        for section in binary.sections() {
            let Some((section_offset, section_filesize)) = section.file_range() else {
                continue;
            };
            if section_filesize != 0
                && segment_offset <= section_offset
                && segment_offset + segment_filesize >= section_offset + section_filesize
            {
                log::debug!(
                    "Matching section: {:?} offset: 0x{:x} size: 0x{:x}",
                    section.name().unwrap_or("?"),
                    section_offset,
                    section_filesize
                );
            }
        }
        sections.push((p_paddr as u32, Cow::Borrowed(segment_data)));
    }

    if sections.is_empty() {
        return Err(Error::UnsupportedFile("empty ELF file".into()));
    }
    log::debug!("found {} sections", sections.len());
    merge_sections(sections)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Image> {
    sections.sort(); // order by start address

    let (Some(first), Some(end_address)) = (
        sections.first().map(|(addr, _)| *addr),
        sections
            .iter()
            .map(|(addr, data)| addr + data.len() as u32)
            .max(),
    ) else {
        return Err(Error::UnsupportedFile("no sections".into()));
    };

    let total_size = (end_address - first) as usize;
    let mut bytes = vec![ERASED_BYTE; total_size];
    let mut tags = vec![Tag::Unallocated; total_size];
    for (addr, sect) in sections {
        let sect_start = (addr - first) as usize;
        let sect_end = sect_start + sect.len();
        if tags[sect_start..sect_end].contains(&Tag::Allocated) {
            log::warn!("section at {:#06x} overlaps an earlier one", addr);
        }
        bytes[sect_start..sect_end].copy_from_slice(&sect);
        tags[sect_start..sect_end].fill(Tag::Allocated);
    }
    Image::from_map(first as u16, bytes, tags)
}
