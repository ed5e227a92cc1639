//! Part definitions, with part-specific or family-wide memory layout
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Fuses;

/// Part family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    /// Boot section reserved by the bootloader, unless a variant overrides it.
    #[serde(default, deserialize_with = "parse_size")]
    pub boot_size: u32,
    pub variants: Vec<Part>,
}

/// Represents a part the bootloader runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    pub page_size: u8,

    #[serde(deserialize_with = "parse_size")]
    pub flash_size: u32,
    #[serde(default, deserialize_with = "parse_optional_size")]
    boot_size: Option<u32>,
    #[serde(default, deserialize_with = "parse_eeprom_size")]
    pub eeprom_size: u16,

    #[serde(default, deserialize_with = "parse_fuses")]
    fuses: Option<[u8; 4]>,
}

impl ::std::fmt::Display for Part {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}({})", self.name, hex::encode(self.signature))
    }
}

pub struct PartDB {
    families: Vec<Family>,
}

impl PartDB {
    pub fn load() -> Result<Self> {
        Ok(PartDB {
            families: vec![serde_yaml::from_str(include_str!(
                "../devices/avr.yaml"
            ))?],
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = Part> + '_ {
        self.families
            .iter()
            .flat_map(|family| family.variants.iter().map(|part| family.patch(part)))
    }

    pub fn find_by_signature(&self, signature: [u8; 3]) -> Result<Part> {
        let part = self
            .parts()
            .find(|p| p.signature == signature)
            .ok_or_else(|| Error::UnknownPart(hex::encode(signature)))?;
        log::debug!("Found part: {}", part);
        Ok(part)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Part> {
        self.parts()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownPart(name.to_string()))
    }
}

impl Family {
    fn patch(&self, part: &Part) -> Part {
        let mut part = part.clone();
        if part.boot_size.is_none() {
            part.boot_size = Some(self.boot_size);
        }
        part
    }
}

impl Part {
    pub fn boot_size(&self) -> u32 {
        self.boot_size.unwrap_or(0)
    }

    /// Flash below the boot section, saturated to the 16-bit address space.
    pub fn available_flash(&self) -> u16 {
        let available = self.flash_size.saturating_sub(self.boot_size());
        u16::try_from(available).unwrap_or(u16::MAX)
    }

    /// Factory fuse values, all zero when the part lists none.
    pub fn fuses(&self) -> Fuses {
        self.fuses.map(Fuses::from).unwrap_or_default()
    }
}

/// Size written as plain digits, `0x` hex, or with a `K`/`KB`/`KiB` suffix.
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Number(u32),
    Text(String),
}

fn parse_size_text(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let err = |_| format!("error while parsing {:?}", s);
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).map_err(err);
    }
    let kilo = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"));
    match kilo {
        Some(digits) => digits
            .trim()
            .parse::<u32>()
            .map_err(err)?
            .checked_mul(1024)
            .ok_or_else(|| format!("{:?} is too large", s)),
        // parse pure digits here
        None => s.parse().map_err(err),
    }
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::Text(s) => parse_size_text(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_optional_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_size(deserializer).map(Some)
}

fn parse_eeprom_size<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let size = parse_size(deserializer)?;
    u16::try_from(size)
        .map_err(|_| serde::de::Error::custom(format!("EEPROM size {} exceeds 64K", size)))
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_signature_text(&s).map_err(serde::de::Error::custom)
}

/// Parses `1E 95 0F`, `1e950f` or `0x1E950F` into a signature.
pub fn parse_signature_text(s: &str) -> std::result::Result<[u8; 3], String> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let raw = hex::decode(&digits).map_err(|e| format!("invalid signature {:?}: {}", s, e))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| format!("signature must be 3 bytes, got {}", raw.len()))
}

fn parse_fuses<'de, D>(deserializer: D) -> std::result::Result<Option<[u8; 4]>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<String> = Deserialize::deserialize(deserializer)?;
    let mut fuses = [0u8; 4];
    if values.len() != fuses.len() {
        return Err(serde::de::Error::custom(format!(
            "expected 4 fuse bytes (low, high, extended, lock), got {}",
            values.len()
        )));
    }
    for (slot, value) in fuses.iter_mut().zip(&values) {
        let digits = value
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        *slot = u8::from_str_radix(digits, 16).map_err(|_| {
            serde::de::Error::custom(format!("invalid fuse byte {:?}", value))
        })?;
    }
    Ok(Some(fuses))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_database_loads() {
        let db = PartDB::load().unwrap();
        let part = db.find_by_signature([0x1e, 0x95, 0x0f]).unwrap();
        assert_eq!(part.name, "ATmega328P");
        assert_eq!(part.page_size, 128);
        assert_eq!(part.flash_size, 32 * 1024);
        assert_eq!(part.boot_size(), 2 * 1024);
        assert_eq!(part.available_flash(), 30 * 1024);
        assert_eq!(part.eeprom_size, 1024);
        assert_eq!(
            part.fuses(),
            Fuses {
                low: 0xff,
                high: 0xda,
                extended: 0xfd,
                lock: 0xff
            }
        );
        assert_eq!(part.to_string(), "ATmega328P(1e950f)");
    }

    #[test]
    fn variant_overrides_family_boot_size() {
        let db = PartDB::load().unwrap();
        let part = db.find_by_name("atmega32u4").unwrap();
        assert_eq!(part.boot_size(), 4 * 1024);
        assert_eq!(part.available_flash(), 28 * 1024);
    }

    #[test]
    fn every_part_has_an_even_page_size() {
        let db = PartDB::load().unwrap();
        assert!(db.parts().count() > 0);
        for part in db.parts() {
            assert!(part.page_size > 0 && part.page_size % 2 == 0, "{}", part);
            assert!(part.available_flash() > 0, "{}", part);
        }
    }

    #[test]
    fn unknown_part_is_reported() {
        let db = PartDB::load().unwrap();
        assert!(matches!(
            db.find_by_signature([0x12, 0x34, 0x56]),
            Err(Error::UnknownPart(s)) if s == "123456"
        ));
        assert!(matches!(db.find_by_name("ATtiny13"), Err(Error::UnknownPart(_))));
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size_text("32K"), Ok(32768));
        assert_eq!(parse_size_text("2KiB"), Ok(2048));
        assert_eq!(parse_size_text("1KB"), Ok(1024));
        assert_eq!(parse_size_text("0x800"), Ok(2048));
        assert_eq!(parse_size_text("512"), Ok(512));
        assert!(parse_size_text("lots").is_err());
    }

    #[test]
    fn signature_spellings() {
        let expected = Ok([0x1e, 0x95, 0x0f]);
        assert_eq!(parse_signature_text("1E 95 0F"), expected);
        assert_eq!(parse_signature_text("1e950f"), expected);
        assert_eq!(parse_signature_text("0x1E950F"), expected);
        assert_eq!(parse_signature_text("1e:95:0f"), expected);
        assert!(parse_signature_text("1e95").is_err());
        assert!(parse_signature_text("zz950f").is_err());
    }

    #[test]
    fn malformed_part_entry_is_a_config_error() {
        let yaml = "
name: test
description: broken
variants:
  - name: bad
    signature: \"1E 95\"
    page_size: 128
    flash_size: 32K
";
        let err: Error = serde_yaml::from_str::<Family>(yaml).unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
