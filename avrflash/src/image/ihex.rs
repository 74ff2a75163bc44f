//! Intel HEX images and flash planning.
//!
//! An Intel HEX file is a sequence of text records:
//!
//! ```text
//! :10 0000 00 0C9434000C9446000C9446000C944600 6A
//!  ^^ ^^^^ ^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^
//!  |  |    |  data (count bytes)               checksum
//!  |  |    record type (00 data, 01 end of file, ...)
//!  |  16-bit load address
//!  byte count
//! ```
//!
//! [`parse`] turns the text into a [`FlashPlan`]: data records are merged
//! into contiguous [`MemoryRange`]s, and every range is cut into
//! [`Page`]s no larger than the device page size. Nothing is written to a
//! device here; the plan is fully computed (and validated against the
//! bootloader region) before a flash session starts.

use std::fmt;

use ::ihex::{ReaderError, Record};
use log::{debug, warn};

use crate::error::{Error, Result};

/// One contiguous span of image data, in the order it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRange {
    /// Byte address of the first byte.
    pub start: u32,
    /// Range contents.
    pub data: Vec<u8>,
}

impl MemoryRange {
    /// Create a range starting at `start`.
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    /// Address one past the last byte.
    pub fn end(&self) -> u32 {
        self.start + self.data.len() as u32
    }

    /// Cut the range into pages of at most `page_size` bytes.
    pub fn into_pages(self, page_size: usize) -> impl Iterator<Item = Page> {
        let start = self.start;
        let data = self.data;
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            if offset >= data.len() {
                return None;
            }
            let len = page_size.min(data.len() - offset);
            let page = Page {
                address: start + offset as u32,
                data: data[offset..offset + len].to_vec(),
            };
            offset += len;
            Some(page)
        })
    }
}

/// Data for one program-page command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Page {
    /// Byte address of the first byte.
    pub address: u32,
    /// Page contents; never longer than the page size the plan was built with.
    pub data: Vec<u8>,
}

impl Page {
    /// Word address for the load-address command, if it fits in 16 bits.
    pub fn word_address(&self) -> Option<u16> {
        u16::try_from(self.address / 2).ok()
    }

    /// Number of bytes in the page.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the page carries no data.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }
}

/// Ordered pages to write in one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashPlan {
    pages: Vec<Page>,
}

impl FlashPlan {
    /// Build a plan from already chunked pages.
    pub fn new(pages: Vec<Page>) -> Self {
        Self { pages }
    }

    /// Pages in write order.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages
            .len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.pages
            .is_empty()
    }

    /// Sum of all page lengths.
    pub fn total_bytes(&self) -> usize {
        self.pages
            .iter()
            .map(Page::len)
            .sum()
    }

    /// Lowest start and highest end (exclusive) address covered.
    pub fn span(&self) -> Option<(u32, u32)> {
        let start = self
            .pages
            .iter()
            .map(|p| p.address)
            .min()?;
        let end = self
            .pages
            .iter()
            .map(|p| p.address + p.len() as u32)
            .max()?;
        Some((start, end))
    }
}

impl fmt::Display for FlashPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span() {
            Some((start, end)) => write!(
                f,
                "{} bytes in {} page(s), 0x{start:04X}..0x{end:04X}",
                self.total_bytes(),
                self.len()
            ),
            None => write!(f, "empty image"),
        }
    }
}

fn parse_error(line: usize, err: &ReaderError) -> Error {
    Error::ImageParse {
        line,
        reason: err.to_string(),
    }
}

/// Parse Intel HEX text into a flash plan.
///
/// Lines that do not start with `:` are ignored, and an end-of-file record
/// stops parsing. Every record's byte count and checksum are verified. Only
/// data records contribute bytes. Consecutive records whose addresses follow
/// on from each other form one range; a gap starts a new one. Ranges are cut
/// into pages of at most `page_size` bytes.
///
/// # Errors
///
/// - [`Error::BootloaderRegion`] if any data byte lands at or above
///   `bootloader_start`. No partial plan is returned.
/// - [`Error::ImageParse`] for malformed records (bad hex digits, byte count
///   mismatch, checksum mismatch, unsupported record type).
/// - [`Error::Config`] if `page_size` is zero.
pub fn parse(hex: &str, page_size: usize, bootloader_start: u32) -> Result<FlashPlan> {
    if page_size == 0 {
        return Err(Error::Config("page size must be non-zero".into()));
    }

    let mut pages = Vec::new();
    let mut current: Option<MemoryRange> = None;

    for (index, raw) in hex.lines().enumerate() {
        let line = index + 1;
        let record = raw.trim();
        if !record.starts_with(':') {
            continue;
        }

        let (offset, value) = match Record::from_record_string(record)
            .map_err(|e| parse_error(line, &e))?
        {
            Record::Data { offset, value } => (offset, value),
            Record::EndOfFile => {
                debug!("End of file record on line {line}");
                break;
            },
            Record::ExtendedSegmentAddress(base) | Record::ExtendedLinearAddress(base) => {
                if base != 0 {
                    warn!(
                        "Ignoring extended address 0x{base:04X} on line {line}; \
                         only 16-bit addresses are supported"
                    );
                }
                continue;
            },
            other => {
                debug!("Skipping {other:?} on line {line}");
                continue;
            },
        };

        let address = u32::from(offset);
        if address >= bootloader_start {
            return Err(Error::BootloaderRegion {
                line,
                address,
                boundary: bootloader_start,
            });
        }
        if address + value.len() as u32 > bootloader_start {
            return Err(Error::BootloaderRegion {
                line,
                address: bootloader_start,
                boundary: bootloader_start,
            });
        }
        if value.is_empty() {
            continue;
        }

        match current {
            Some(ref mut range) if range.end() == address => {
                range
                    .data
                    .extend_from_slice(&value);
            },
            _ => {
                if let Some(range) = current.take() {
                    pages.extend(range.into_pages(page_size));
                }
                current = Some(MemoryRange::new(address, value));
            },
        }
    }

    if let Some(range) = current {
        pages.extend(range.into_pages(page_size));
    }

    Ok(FlashPlan::new(pages))
}

/// Format one record line with a valid checksum.
#[cfg(test)]
pub(crate) fn format_record(address: u16, kind: u8, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, kind];
    bytes.extend_from_slice(data);
    let checksum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg();
    bytes.push(checksum);

    let mut line = String::from(":");
    for b in bytes {
        line.push_str(&format!("{b:02X}"));
    }
    line
}

/// Data records of `chunk` bytes each covering `len` bytes from `start`.
#[cfg(test)]
pub(crate) fn image_text(start: u16, len: usize, chunk: usize) -> String {
    let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
    let mut text = String::new();
    for (i, part) in data.chunks(chunk).enumerate() {
        text.push_str(&format_record(start + (i * chunk) as u16, 0, part));
        text.push('\n');
    }
    text.push_str(":00000001FF\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT: u32 = 0x7800;

    fn parse_default(hex: &str) -> Result<FlashPlan> {
        parse(hex, 128, BOOT)
    }

    #[test]
    fn test_format_record_matches_known_line() {
        assert_eq!(format_record(0, 1, &[]), ":00000001FF");
        assert_eq!(
            format_record(0x0010, 0, &[0x0C, 0x94, 0x46, 0x00]),
            ":040010000C94460006"
        );
    }

    #[test]
    fn test_bare_eof_yields_empty_plan() {
        let plan = parse_default(":00000001FF").unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.span(), None);
    }

    #[test]
    fn test_empty_and_comment_only_input() {
        assert!(parse_default("").unwrap().is_empty());
        assert!(parse_default("# built by avr-gcc\n\n; nothing here\n").unwrap().is_empty());
    }

    #[test]
    fn test_contiguous_records_merge() {
        let hex = format!(
            "{}\n{}\n:00000001FF\n",
            format_record(0x0000, 0, &[0xAA; 16]),
            format_record(0x0010, 0, &[0xBB; 16])
        );
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.pages()[0].address, 0);
        assert_eq!(plan.pages()[0].len(), 32);
        assert_eq!(&plan.pages()[0].data[..16], &[0xAA; 16]);
        assert_eq!(&plan.pages()[0].data[16..], &[0xBB; 16]);
    }

    #[test]
    fn test_gap_starts_new_range() {
        let hex = format!(
            "{}\n{}\n:00000001FF\n",
            format_record(0x0000, 0, &[0xAA; 16]),
            format_record(0x0100, 0, &[0xBB; 16])
        );
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.pages()[0].address, 0x0000);
        assert_eq!(plan.pages()[0].len(), 16);
        assert_eq!(plan.pages()[1].address, 0x0100);
        assert_eq!(plan.pages()[1].len(), 16);
    }

    #[test]
    fn test_range_is_chunked_into_pages() {
        let plan = parse_default(&image_text(0, 300, 16)).unwrap();
        let layout: Vec<(u32, usize)> = plan
            .pages()
            .iter()
            .map(|p| (p.address, p.len()))
            .collect();
        assert_eq!(layout, vec![(0, 128), (128, 128), (256, 44)]);
        assert_eq!(plan.total_bytes(), 300);
        assert_eq!(plan.span(), Some((0, 300)));
        assert_eq!(plan.pages()[2].data[0], 0); // byte 256 wraps to 0
    }

    #[test]
    fn test_record_in_bootloader_region_is_rejected() {
        let hex = format!(
            "{}\n{}\n",
            format_record(0x0000, 0, &[0x00; 16]),
            format_record(0x7800, 0, &[0xFF; 16])
        );
        let err = parse_default(&hex).unwrap_err();
        assert!(
            matches!(
                err,
                Error::BootloaderRegion {
                    line: 2,
                    address: 0x7800,
                    boundary: 0x7800
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn test_record_straddling_boundary_is_rejected() {
        let hex = format_record(0x77F8, 0, &[0x00; 16]);
        let err = parse_default(&hex).unwrap_err();
        assert!(matches!(err, Error::BootloaderRegion { address: 0x7800, .. }), "{err}");
    }

    #[test]
    fn test_record_ending_at_boundary_is_accepted() {
        let hex = format_record(0x77F0, 0, &[0x00; 16]);
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.span(), Some((0x77F0, 0x7800)));
    }

    #[test]
    fn test_records_after_eof_are_ignored() {
        let hex = format!(
            "{}\n:00000001FF\n{}\n",
            format_record(0x0000, 0, &[0x11; 4]),
            format_record(0x7F00, 0, &[0x22; 4])
        );
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.total_bytes(), 4);
    }

    #[test]
    fn test_non_data_records_are_skipped() {
        let hex = format!(
            "{}\n{}\n{}\n",
            format_record(0x0000, 4, &[0x00, 0x00]),
            format_record(0x0000, 0, &[0x11; 4]),
            format_record(0x0000, 3, &[0x00, 0x00, 0x00, 0x00])
        );
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.total_bytes(), 4);
    }

    #[test]
    fn test_checksum_mismatch() {
        let good = format_record(0x0000, 0, &[0x11; 4]);
        assert_eq!(good, ":0400000011111111B8");
        assert_eq!(parse_default(&good).unwrap().total_bytes(), 4);

        let hex = format!("{}\n:0400000011111111C1\n", format_record(0x0100, 0, &[0; 2]));
        let err = parse_default(&hex).unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_truncated_record() {
        // Declares 16 bytes, carries 4
        let err = parse_default(":1000000011111111BC").unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 1, .. }), "{err}");

        let err = parse_default(":0000").unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 1, .. }), "{err}");
    }

    #[test]
    fn test_invalid_hex_digits() {
        let err = parse_default(":04000000ZZ111111C1").unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 1, .. }), "{err}");

        let err = parse_default(":0400000011111111B").unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 1, .. }), "{err}");
    }

    #[test]
    fn test_parse_error_keeps_no_partial_plan() {
        let hex = format!(
            "{}\n{}\n:0400000011111111C1\n",
            format_record(0x0000, 0, &[0xAA; 16]),
            format_record(0x0010, 0, &[0xBB; 16])
        );
        let err = parse_default(&hex).unwrap_err();
        assert!(matches!(err, Error::ImageParse { line: 3, .. }), "{err}");
    }

    #[test]
    fn test_extended_address_records_are_skipped() {
        let hex = format!(
            "{}\n{}\n{}\n:00000001FF\n",
            format_record(0x0000, 2, &[0x00, 0x00]),
            format_record(0x0000, 4, &[0x00, 0x01]),
            format_record(0x0000, 0, &[0x11; 4])
        );
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.total_bytes(), 4);
        assert_eq!(plan.pages()[0].address, 0);
    }

    #[test]
    fn test_whitespace_and_crlf_are_tolerated() {
        let hex = format!("  {}\r\n:00000001FF\r\n", format_record(0x0000, 0, &[0x42; 8]));
        let plan = parse_default(&hex).unwrap();
        assert_eq!(plan.total_bytes(), 8);
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        assert!(matches!(
            parse(":00000001FF", 0, BOOT),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_page_word_address() {
        let page = Page {
            address: 0x0100,
            data: vec![0; 2],
        };
        assert_eq!(page.word_address(), Some(0x0080));
        let far = Page {
            address: 0x2_0000,
            data: vec![0; 2],
        };
        assert_eq!(far.word_address(), None);
    }

    #[test]
    fn test_plan_display() {
        let plan = parse_default(&image_text(0, 300, 16)).unwrap();
        assert_eq!(plan.to_string(), "300 bytes in 3 page(s), 0x0000..0x012C");
        assert_eq!(FlashPlan::default().to_string(), "empty image");
    }
}
