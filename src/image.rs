//! Sparse memory images and their textual record format.
//!
//! An [`Image`] is a dense byte array covering `[min_address, max_address]`
//! with a parallel tag per byte. Only `Allocated` bytes carry data; the rest
//! hold the erased value `0xff` and must not be trusted.
//!
//! The text form is one record per line, `:BBAAAATTDD..CC`, where all fields
//! including the checksum sum to zero modulo 256.

use crate::constants::{DEFAULT_RECORD_LEN, ERASED_BYTE};
use crate::error::{Error, Result};

/// Allocation state of one image byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Unallocated,
    Allocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Data,
    EndOfFile,
}

impl RecordType {
    pub fn code(self) -> u8 {
        match self {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
        }
    }
}

/// One line of the text format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub address: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl Record {
    /// Fails if `data` does not fit the one-byte length field.
    pub fn data(address: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > u8::MAX as usize {
            return Err(Error::InvalidImage(format!(
                "record of {} bytes at 0x{:04x}",
                data.len(),
                address
            )));
        }
        let mut record = Record {
            address,
            record_type: RecordType::Data,
            data,
            checksum: 0,
        };
        record.checksum = record.field_sum().wrapping_neg();
        Ok(record)
    }

    pub fn end_of_file() -> Self {
        Record {
            address: 0,
            record_type: RecordType::EndOfFile,
            data: vec![],
            checksum: 0xff,
        }
    }

    pub fn byte_count(&self) -> u8 {
        self.data.len() as u8
    }

    // sum of every field except the checksum
    fn field_sum(&self) -> u8 {
        let [hi, lo] = self.address.to_be_bytes();
        self.data.iter().fold(
            self.byte_count()
                .wrapping_add(hi)
                .wrapping_add(lo)
                .wrapping_add(self.record_type.code()),
            |acc, &b| acc.wrapping_add(b),
        )
    }

    /// Zero for every well-formed record.
    pub fn sum(&self) -> u8 {
        self.field_sum().wrapping_add(self.checksum)
    }

    /// Parses one line. `line_no` is only used for error reporting.
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let parse_err = |reason: String| Error::Parse {
            line: line_no,
            reason,
        };
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| parse_err("missing ':' start code".into()))?;
        // byte count + address + record type + checksum
        if body.len() < 2 + 4 + 2 + 2 {
            return Err(parse_err(format!(
                "line too short for minimum content ({} characters)",
                line.len()
            )));
        }
        let raw = hex::decode(body).map_err(|e| parse_err(format!("invalid hex field: {}", e)))?;

        let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(Error::Checksum { line: line_no, sum });
        }

        let byte_count = raw[0] as usize;
        if raw.len() != byte_count + 5 {
            return Err(parse_err(format!(
                "byte count {} does not match record length ({} data bytes)",
                byte_count,
                raw.len() - 5
            )));
        }
        let address = u16::from_be_bytes([raw[1], raw[2]]);
        let structural = |reason: String| Error::Structural {
            line: line_no,
            reason,
        };
        let record_type = match raw[3] {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            other => return Err(structural(format!("unsupported record type {:02X}", other))),
        };
        if record_type == RecordType::EndOfFile {
            if byte_count != 0 {
                return Err(structural(format!(
                    "EOF record must have byte count 0 (found {})",
                    byte_count
                )));
            }
            if address != 0 {
                return Err(structural(format!(
                    "EOF record must have address 0000 (found {:04X})",
                    address
                )));
            }
        }
        Ok(Record {
            address,
            record_type,
            data: raw[4..4 + byte_count].to_vec(),
            checksum: raw[4 + byte_count],
        })
    }

    pub fn to_line(&self) -> Result<String> {
        let record = match self.record_type {
            RecordType::Data => ihex::Record::Data {
                offset: self.address,
                value: self.data.clone(),
            },
            RecordType::EndOfFile => ihex::Record::EndOfFile,
        };
        record.to_record_string().map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("cannot serialize record: {:?}", e),
            ))
        })
    }
}

/// Sparse, tagged memory image. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    min_address: u16,
    bytes: Vec<u8>,
    tags: Vec<Tag>,
}

impl Image {
    /// Builds an image from a raw buffer and its tags, starting at `min_address`.
    ///
    /// Unallocated bytes are replaced by the filler value.
    ///
    /// Empty buffers, a tag count that differs from the byte count, or a
    /// range past `0xffff` are rejected.
    pub fn from_map(min_address: u16, mut bytes: Vec<u8>, tags: Vec<Tag>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidImage("no bytes".into()));
        }
        if bytes.len() != tags.len() {
            return Err(Error::InvalidImage(format!(
                "{} bytes but {} tags",
                bytes.len(),
                tags.len()
            )));
        }
        let last = min_address as u32 + bytes.len() as u32 - 1;
        if last > u16::MAX as u32 {
            return Err(Error::AddressOutOfRange {
                address: last,
                limit: u16::MAX as u32,
            });
        }
        for (byte, tag) in bytes.iter_mut().zip(&tags) {
            if *tag == Tag::Unallocated {
                *byte = ERASED_BYTE;
            }
        }
        log::debug!(
            "image from map: {} bytes at 0x{:04x}",
            bytes.len(),
            min_address
        );
        Ok(Image {
            min_address,
            bytes,
            tags,
        })
    }

    /// Every byte allocated.
    pub fn from_bytes(min_address: u16, bytes: Vec<u8>) -> Result<Self> {
        let tags = vec![Tag::Allocated; bytes.len()];
        Self::from_map(min_address, bytes, tags)
    }

    /// Lays out data records. Later records overwrite earlier ones.
    pub fn from_records(records: &[Record]) -> Result<Self> {
        let data: Vec<&Record> = records
            .iter()
            .filter(|r| r.record_type == RecordType::Data && !r.data.is_empty())
            .collect();
        let min = data.iter().map(|r| r.address as u32).min();
        let max = data
            .iter()
            .map(|r| r.address as u32 + r.data.len() as u32 - 1)
            .max();
        let (Some(min), Some(max)) = (min, max) else {
            return Err(Error::Structural {
                line: records.len(),
                reason: "no data records".into(),
            });
        };
        if max > u16::MAX as u32 {
            return Err(Error::AddressOutOfRange {
                address: max,
                limit: u16::MAX as u32,
            });
        }

        let span = (max - min + 1) as usize;
        let mut bytes = vec![ERASED_BYTE; span];
        let mut tags = vec![Tag::Unallocated; span];
        for record in data {
            let start = (record.address as u32 - min) as usize;
            for (offset, &value) in record.data.iter().enumerate() {
                if tags[start + offset] == Tag::Allocated {
                    log::warn!(
                        "record at 0x{:04x} overwrites byte 0x{:04x}",
                        record.address,
                        start + offset + min as usize
                    );
                }
                bytes[start + offset] = value;
                tags[start + offset] = Tag::Allocated;
            }
        }
        Self::from_map(min as u16, bytes, tags)
    }

    /// Parses the record text. Lines starting with `#` are comments.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut records = vec![];
        let mut eof_line = None;
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim_end();
            if line.starts_with('#') {
                continue;
            }
            if let Some(eof) = eof_line {
                return Err(Error::Structural {
                    line: line_no,
                    reason: format!("additional content after EOF record on line {}", eof),
                });
            }
            let record = Record::parse(line, line_no)?;
            match record.record_type {
                RecordType::EndOfFile => eof_line = Some(line_no),
                RecordType::Data => records.push(record),
            }
        }
        if eof_line.is_none() {
            log::debug!("record text has no EOF record");
        }
        let image = Self::from_records(&records)?;
        log::debug!(
            "parsed {} records: {} bytes in 0x{:04x}..=0x{:04x}",
            records.len(),
            image.total_allocated_bytes(),
            image.min_address(),
            image.max_address()
        );
        Ok(image)
    }

    pub fn min_address(&self) -> u16 {
        self.min_address
    }

    pub fn max_address(&self) -> u16 {
        (self.min_address as usize + self.bytes.len() - 1) as u16
    }

    /// Number of addresses covered, allocated or not.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_allocated_bytes(&self) -> usize {
        self.tags.iter().filter(|&&t| t == Tag::Allocated).count()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn index(&self, address: u16) -> Option<usize> {
        let idx = address.checked_sub(self.min_address)? as usize;
        (idx < self.bytes.len()).then_some(idx)
    }

    /// Value at `address`, if allocated.
    pub fn get(&self, address: u16) -> Option<u8> {
        let idx = self.index(address)?;
        (self.tags[idx] == Tag::Allocated).then(|| self.bytes[idx])
    }

    /// Value at `address`, or the erased filler for anything unallocated.
    pub fn byte_or_filler(&self, address: u32) -> u8 {
        u16::try_from(address)
            .ok()
            .and_then(|a| self.get(a))
            .unwrap_or(ERASED_BYTE)
    }

    /// Allocated `(address, value)` pairs in address order.
    pub fn allocated(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.bytes
            .iter()
            .zip(&self.tags)
            .enumerate()
            .filter(|(_, (_, tag))| **tag == Tag::Allocated)
            .map(|(idx, (&value, _))| (self.min_address + idx as u16, value))
    }

    /// Maximal allocated runs, each cut to at most `max_len` bytes.
    pub fn runs(&self, max_len: usize) -> Vec<(u16, &[u8])> {
        let max_len = max_len.max(1);
        let mut runs = vec![];
        let mut start: Option<usize> = None;
        for (idx, tag) in self.tags.iter().enumerate() {
            match (*tag, start) {
                (Tag::Allocated, None) => start = Some(idx),
                (Tag::Allocated, Some(s)) if idx - s == max_len => {
                    runs.push((self.min_address + s as u16, &self.bytes[s..idx]));
                    start = Some(idx);
                }
                (Tag::Unallocated, Some(s)) => {
                    runs.push((self.min_address + s as u16, &self.bytes[s..idx]));
                    start = None;
                }
                _ => (),
            }
        }
        if let Some(s) = start {
            runs.push((self.min_address + s as u16, &self.bytes[s..]));
        }
        runs
    }

    pub fn records(&self, max_len: usize) -> Result<Vec<Record>> {
        let max_len = max_len.clamp(1, u8::MAX as usize);
        self.runs(max_len)
            .into_iter()
            .map(|(address, data)| Record::data(address, data.to_vec()))
            .collect()
    }

    /// Serializes with the default record length, EOF record included.
    pub fn to_text(&self) -> Result<String> {
        self.to_text_with(DEFAULT_RECORD_LEN)
    }

    pub fn to_text_with(&self, max_len: usize) -> Result<String> {
        let records = self.records(max_len)?;
        log::debug!("created {} records", records.len());
        let mut text = String::new();
        for record in records.iter().chain(Some(&Record::end_of_file())) {
            text.push_str(&record.to_line()?);
            text.push('\n');
        }
        Ok(text)
    }

    /// Classic hexdump of the covered range, offsets relative to `min_address`.
    pub fn hexdump(&self) -> Result<String> {
        let mut out = Vec::new();
        hxdmp::hexdump(&self.bytes, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = ":10010000214601360121470136007EFE09D2190140";

    #[test]
    fn parses_canonical_record() {
        let record = Record::parse(CANONICAL, 1).unwrap();
        assert_eq!(record.address, 0x0100);
        assert_eq!(record.byte_count(), 16);
        assert_eq!(record.checksum, 0x40);
        assert_eq!(record.sum(), 0);

        let image = Image::from_text(CANONICAL).unwrap();
        assert_eq!(image.min_address(), 0x0100);
        assert_eq!(image.max_address(), 0x010f);
        assert_eq!(image.total_allocated_bytes(), 16);
        assert_eq!(image.get(0x0100), Some(0x21));
        assert_eq!(image.get(0x010f), Some(0x01));
    }

    #[test]
    fn record_to_line_matches_source() {
        let record = Record::parse(CANONICAL, 1).unwrap();
        assert_eq!(Record::data(0x0100, record.data.clone()).unwrap(), record);
        assert!(matches!(
            Record::data(0, vec![0; 256]),
            Err(Error::InvalidImage(_))
        ));
        assert_eq!(record.to_line().unwrap(), CANONICAL);
        assert_eq!(Record::end_of_file().to_line().unwrap(), ":00000001FF");
    }

    #[test]
    fn any_flipped_byte_fails_checksum() {
        let raw = hex::decode(&CANONICAL[1..]).unwrap();
        for idx in 0..raw.len() {
            let mut bad = raw.clone();
            bad[idx] ^= 0x01;
            let line = format!(":{}", hex::encode_upper(&bad));
            match Record::parse(&line, 3) {
                Err(Error::Checksum { line: 3, .. }) => (),
                other => panic!("byte {}: expected checksum error, got {:?}", idx, other),
            }
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            Record::parse("10010000", 1),
            Err(Error::Parse { line: 1, .. })
        ));
        assert!(matches!(
            Record::parse(":0000", 2),
            Err(Error::Parse { line: 2, .. })
        ));
        assert!(matches!(
            Record::parse(":0G000001FF", 1),
            Err(Error::Parse { .. })
        ));
        // sums to zero but byte count says two data bytes
        assert!(matches!(
            Record::parse(":02000000FE", 1),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_and_bad_eof_records() {
        // extended linear address
        assert!(matches!(
            Record::parse(":020000040800F2", 1),
            Err(Error::Structural { .. })
        ));
        // EOF with a non-zero address
        assert!(matches!(
            Record::parse(":00010001FE", 1),
            Err(Error::Structural { .. })
        ));
    }

    #[test]
    fn content_after_eof_is_structural() {
        let text = format!(
            "{}\n:0400200001020304D2\n:00000001FF\n:01004000556A\n",
            CANONICAL
        );
        match Image::from_text(&text) {
            Err(Error::Structural { line: 4, .. }) => (),
            other => panic!("unexpected {:?}", other),
        }

        let text = format!("{}\n:00000001FF\n:00000001FF\n", CANONICAL);
        assert!(matches!(
            Image::from_text(&text),
            Err(Error::Structural { line: 3, .. })
        ));
    }

    #[test]
    fn comments_are_skipped() {
        let text = format!("# firmware\n{}\n:00000001FF\n# trailing note\n", CANONICAL);
        let image = Image::from_text(&text).unwrap();
        assert_eq!(image.total_allocated_bytes(), 16);
    }

    #[test]
    fn gaps_are_unallocated() {
        let text = ":020000001122CB\n:02000400AABB95\n:00000001FF\n";
        let image = Image::from_text(text).unwrap();
        assert_eq!(image.len(), 6);
        assert_eq!(image.total_allocated_bytes(), 4);
        assert_eq!(image.get(0x0002), None);
        assert_eq!(image.bytes()[2], 0xff);
        assert_eq!(image.tags()[3], Tag::Unallocated);
        assert_eq!(
            image.allocated().collect::<Vec<_>>(),
            [(0, 0x11), (1, 0x22), (4, 0xaa), (5, 0xbb)]
        );
        assert_eq!(image.to_text().unwrap(), text);
    }

    #[test]
    fn long_runs_are_split() {
        let image = Image::from_bytes(0x0200, (0..40).collect()).unwrap();
        let records = image.records(16).unwrap();
        assert_eq!(
            records.iter().map(|r| (r.address, r.data.len())).collect::<Vec<_>>(),
            [(0x0200, 16), (0x0210, 16), (0x0220, 8)]
        );
        assert!(records.iter().all(|r| r.sum() == 0));

        let text = image.to_text().unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(Image::from_text(&text).unwrap(), image);

        let wide = image.to_text_with(32).unwrap();
        assert_eq!(wide.lines().count(), 3);
        assert_eq!(Image::from_text(&wide).unwrap(), image);
    }

    #[test]
    fn overlapping_records_last_wins() {
        let first = Record::data(0x10, vec![1, 2, 3, 4]).unwrap();
        let second = Record::data(0x12, vec![9]).unwrap();
        let text = format!("{}\n{}\n", first.to_line().unwrap(), second.to_line().unwrap());
        let image = Image::from_text(&text).unwrap();
        assert_eq!(image.bytes(), [1, 2, 9, 4]);
    }

    #[test]
    fn no_data_records() {
        assert!(matches!(
            Image::from_text(":00000001FF\n"),
            Err(Error::Structural { .. })
        ));
    }

    #[test]
    fn from_map_fills_unallocated() {
        let image = Image::from_map(
            0x40,
            vec![1, 2, 3],
            vec![Tag::Allocated, Tag::Unallocated, Tag::Allocated],
        )
        .unwrap();
        assert_eq!(image.bytes(), [1, 0xff, 3]);
        assert_eq!(image.byte_or_filler(0x41), 0xff);
        assert_eq!(image.byte_or_filler(0x42), 3);
        assert_eq!(image.byte_or_filler(0x10000), 0xff);
    }

    #[test]
    fn from_map_rejects_bad_buffers() {
        assert!(matches!(
            Image::from_map(0, vec![0; 4], vec![Tag::Allocated; 3]),
            Err(Error::InvalidImage(_))
        ));
        assert!(matches!(
            Image::from_map(0, vec![], vec![]),
            Err(Error::InvalidImage(_))
        ));
        assert!(matches!(
            Image::from_bytes(0xfff0, vec![0; 17]),
            Err(Error::AddressOutOfRange { address: 0x10000, limit: 0xffff })
        ));
        assert!(Image::from_bytes(0xfff0, vec![0; 16]).is_ok());
    }
}
