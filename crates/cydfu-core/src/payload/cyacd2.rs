//! cyacd2 image parsing.
//!
//! Line-oriented text format:
//!
//! ```text
//! 017856341202000312345678       header: 12 hex-encoded bytes
//! @APPINFO:0x10000000,0x8000     application start address and length
//! :00001000<row data hex>        one line per flash row, address little-endian
//! ```
//!
//! Rows are read lazily; the file stays open until the image is dropped.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::row_checksum;

/// Required file extension.
pub const IMAGE_EXTENSION: &str = "cyacd2";

const APPINFO_TAG: &str = "@APPINFO:";
const ROW_MARKER: char = ':';

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Not a recognized image file: {0}")]
    Validation(String),

    #[error("Line {line}: {reason}")]
    Format { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageError {
    fn format(line: usize, reason: impl Into<String>) -> Self {
        ImageError::Format {
            line,
            reason: reason.into(),
        }
    }
}

/// First line of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub file_version: u8,
    pub silicon_id: u32,
    pub silicon_revision: u8,
    pub checksum_type: u8,
    pub app_id: u8,
    pub product_id: u32,
}

impl Header {
    pub const SIZE: usize = 12;

    /// Parse the hex-encoded header line.
    pub fn parse(line: &str) -> Result<Self, ImageError> {
        let bytes = hex::decode(line.trim())
            .map_err(|e| ImageError::format(1, format!("header is not hex: {e}")))?;
        if bytes.len() != Self::SIZE {
            return Err(ImageError::format(
                1,
                format!("header is {} bytes, expected {}", bytes.len(), Self::SIZE),
            ));
        }

        Ok(Self {
            file_version: bytes[0],
            silicon_id: LittleEndian::read_u32(&bytes[1..5]),
            silicon_revision: bytes[5],
            checksum_type: bytes[6],
            app_id: bytes[7],
            product_id: LittleEndian::read_u32(&bytes[8..12]),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File version:     {}", self.file_version)?;
        writeln!(f, "Silicon ID:       0x{:08X}", self.silicon_id)?;
        writeln!(f, "Silicon revision: 0x{:02X}", self.silicon_revision)?;
        writeln!(f, "Checksum type:    {}", self.checksum_type)?;
        writeln!(f, "App ID:           {}", self.app_id)?;
        write!(f, "Product ID:       0x{:08X}", self.product_id)
    }
}

/// Flash span of the application, from the `@APPINFO` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppDescriptor {
    pub start_address: u32,
    pub length: u32,
}

impl AppDescriptor {
    pub fn parse(line: &str) -> Result<Self, ImageError> {
        let rest = line
            .trim()
            .strip_prefix(APPINFO_TAG)
            .ok_or_else(|| ImageError::format(2, format!("expected {APPINFO_TAG} tag")))?;

        let (start, length) = rest
            .split_once(',')
            .ok_or_else(|| ImageError::format(2, "expected <start>,<length>"))?;

        Ok(Self {
            start_address: parse_u32_field(start, "start address")?,
            length: parse_u32_field(length, "length")?,
        })
    }
}

fn parse_u32_field(text: &str, what: &str) -> Result<u32, ImageError> {
    parse_int_literal(text)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ImageError::format(2, format!("invalid {what} {:?}", text.trim())))
}

/// Parse an unsigned integer literal with an optional `0x`, `0o` or `0b`
/// prefix (decimal otherwise). Single underscores between digits are allowed.
pub fn parse_int_literal(text: &str) -> Option<u64> {
    let text = text.trim();
    let prefix = text.get(..2).map(str::to_ascii_lowercase);
    let (digits, radix) = match prefix.as_deref() {
        Some("0x") => (&text[2..], 16),
        Some("0o") => (&text[2..], 8),
        Some("0b") => (&text[2..], 2),
        _ => {
            // Decimal literals may not carry leading zeros unless they are all zeros.
            if text.starts_with('0') && !text.trim_start_matches('0').is_empty() {
                return None;
            }
            (text, 10)
        }
    };

    // One underscore may separate the prefix from the digits.
    let digits = if radix == 10 {
        digits
    } else {
        digits.strip_prefix('_').unwrap_or(digits)
    };
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__")
    {
        return None;
    }
    let cleaned: String = digits.chars().filter(|&c| c != '_').collect();
    if !cleaned.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(&cleaned, radix).ok()
}

/// One flash row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Row {
    /// Parse a `:`-prefixed row line.
    pub fn parse(line: &str, line_no: usize) -> Result<Self, ImageError> {
        let hex_part = line
            .strip_prefix(ROW_MARKER)
            .ok_or_else(|| ImageError::format(line_no, "row does not start with ':'"))?;
        let mut bytes = hex::decode(hex_part.trim())
            .map_err(|e| ImageError::format(line_no, format!("row is not hex: {e}")))?;
        if bytes.len() < 4 {
            return Err(ImageError::format(
                line_no,
                format!("row is {} bytes, too short for an address", bytes.len()),
            ));
        }

        let address = LittleEndian::read_u32(&bytes[..4]);
        bytes.drain(..4);
        Ok(Self {
            address,
            data: bytes,
        })
    }

    /// CRC-32C of the row data, as programData expects it.
    pub fn checksum(&self) -> u32 {
        row_checksum(&self.data)
    }
}

/// An opened cyacd2 image. Owns its reader.
#[derive(Debug)]
pub struct Cyacd2Image<R: BufRead> {
    reader: R,
    header: Header,
    app: AppDescriptor,
    /// Lines consumed so far.
    line_no: usize,
    /// Set after the end of input or the first bad row.
    exhausted: bool,
    /// Row lines in the image, when the reader could be scanned ahead.
    row_count: Option<usize>,
}

impl Cyacd2Image<BufReader<File>> {
    /// Open an image file. The name must end in `.cyacd2`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == IMAGE_EXTENSION);
        if !has_extension {
            return Err(ImageError::Validation(format!(
                "{} does not have the .{IMAGE_EXTENSION} extension",
                path.display()
            )));
        }

        let file = File::open(path)?;
        debug!(path = %path.display(), "Opened image");
        Self::from_seekable(BufReader::new(file))
    }
}

impl<R: BufRead + Seek> Cyacd2Image<R> {
    /// Count the row lines, rewind, then read as [`from_reader`](Self::from_reader).
    ///
    /// The count is what [`row_count`](Self::row_count) reports; every line
    /// after the first two is counted, so a malformed line still counts.
    pub fn from_seekable(mut reader: R) -> Result<Self, ImageError> {
        let lines = count_lines(&mut reader)?;
        reader.rewind()?;

        let mut image = Self::from_reader(reader)?;
        image.row_count = Some(lines.saturating_sub(2));
        debug!(rows = lines.saturating_sub(2), "Counted rows");
        Ok(image)
    }
}

impl<R: BufRead> Cyacd2Image<R> {
    /// Read the header and application lines from `reader`.
    pub fn from_reader(mut reader: R) -> Result<Self, ImageError> {
        let header_line = read_line(&mut reader)?
            .ok_or_else(|| ImageError::format(1, "missing header line"))?;
        let header = Header::parse(&header_line)?;

        let app_line = read_line(&mut reader)?
            .ok_or_else(|| ImageError::format(2, "missing @APPINFO line"))?;
        let app = AppDescriptor::parse(&app_line)?;

        info!(
            file_version = header.file_version,
            silicon_id = %format!("0x{:08X}", header.silicon_id),
            silicon_revision = header.silicon_revision,
            checksum_type = header.checksum_type,
            app_id = header.app_id,
            product_id = %format!("0x{:08X}", header.product_id),
            "Image header"
        );
        info!(
            start = %format!("0x{:08X}", app.start_address),
            length = %format!("0x{:X}", app.length),
            "Application"
        );

        Ok(Self {
            reader,
            header,
            app,
            line_no: 2,
            exhausted: false,
            row_count: None,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn app_descriptor(&self) -> &AppDescriptor {
        &self.app
    }

    /// Total rows in the image, if known.
    pub fn row_count(&self) -> Option<usize> {
        self.row_count
    }

    /// Remaining rows, read on demand. Forward-only; reopen to restart.
    pub fn rows(&mut self) -> Rows<'_, R> {
        Rows { image: self }
    }

    /// Release the underlying reader.
    pub fn close(self) {
        debug!(lines = self.line_no, "Closing image");
    }

    fn next_row(&mut self) -> Option<Result<Row, ImageError>> {
        if self.exhausted {
            return None;
        }
        let line = match read_line(&mut self.reader) {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.exhausted = true;
                return None;
            }
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };
        self.line_no += 1;

        let row = Row::parse(&line, self.line_no);
        if row.is_err() {
            self.exhausted = true;
        }
        Some(row)
    }
}

/// Lazy row iterator. Fused after the first error.
pub struct Rows<'a, R: BufRead> {
    image: &'a mut Cyacd2Image<R>,
}

impl<R: BufRead> Iterator for Rows<'_, R> {
    type Item = Result<Row, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.image.next_row()
    }
}

impl<R: BufRead> std::iter::FusedIterator for Rows<'_, R> {}

fn count_lines<R: BufRead>(reader: &mut R) -> Result<usize, ImageError> {
    let mut buf = Vec::new();
    let mut lines = 0;
    while reader.read_until(b'\n', &mut buf)? != 0 {
        lines += 1;
        buf.clear();
    }
    Ok(lines)
}

/// Next line without its terminator, or `None` at end of input.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, ImageError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    const IMAGE: &str = "\
017856341202000312345678
@APPINFO:0x1000,0x200
:000010000A0B0C
:00011000DEADBEEF
";

    fn image(text: &str) -> Cyacd2Image<Cursor<Vec<u8>>> {
        Cyacd2Image::from_reader(Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn test_header_fields() {
        let header = Header::parse("017856341202000312345678").unwrap();
        assert_eq!(header.file_version, 1);
        assert_eq!(header.silicon_id, 0x1234_5678);
        assert_eq!(header.silicon_revision, 2);
        assert_eq!(header.checksum_type, 0);
        assert_eq!(header.app_id, 3);
        assert_eq!(header.product_id, 0x7856_3412);
    }

    #[test]
    fn test_header_wrong_length() {
        assert!(matches!(
            Header::parse("0178563412"),
            Err(ImageError::Format { line: 1, .. })
        ));
        assert!(matches!(
            Header::parse("zz7856341202000312345678"),
            Err(ImageError::Format { line: 1, .. })
        ));
    }

    #[test]
    fn test_appinfo() {
        let app = AppDescriptor::parse("@APPINFO:0x1000,0x200").unwrap();
        assert_eq!(app.start_address, 0x1000);
        assert_eq!(app.length, 0x200);

        let app = AppDescriptor::parse("@APPINFO:4096,0b1000000000").unwrap();
        assert_eq!(app.start_address, 0x1000);
        assert_eq!(app.length, 0x200);
    }

    #[test]
    fn test_appinfo_rejects_bad_input() {
        for line in [
            "@APPINFO:bad",
            "@APPINFO:0x1000",
            "@APPINFO:0x1000,zz",
            "@APPINFO:0x100000000,0x10",
            "APPINFO:0x1000,0x200",
            "@EIV:0x1000,0x200",
        ] {
            assert!(
                matches!(
                    AppDescriptor::parse(line),
                    Err(ImageError::Format { line: 2, .. })
                ),
                "{line}"
            );
        }
    }

    #[test]
    fn test_int_literals() {
        assert_eq!(parse_int_literal("0x10050000"), Some(0x1005_0000));
        assert_eq!(parse_int_literal("0XfF"), Some(0xFF));
        assert_eq!(parse_int_literal("0o17"), Some(0o17));
        assert_eq!(parse_int_literal("0b101"), Some(5));
        assert_eq!(parse_int_literal(" 65536 "), Some(65536));
        assert_eq!(parse_int_literal("0"), Some(0));
        assert_eq!(parse_int_literal("000"), Some(0));
        assert_eq!(parse_int_literal("1_000"), Some(1000));
        assert_eq!(parse_int_literal("0x_ff"), Some(0xFF));

        assert_eq!(parse_int_literal(""), None);
        assert_eq!(parse_int_literal("0x"), None);
        assert_eq!(parse_int_literal("010"), None);
        assert_eq!(parse_int_literal("-1"), None);
        assert_eq!(parse_int_literal("1__0"), None);
        assert_eq!(parse_int_literal("0b2"), None);
    }

    #[test]
    fn test_row_parse() {
        let row = Row::parse(":000010000A0B0C", 3).unwrap();
        assert_eq!(row.address, 0x0010_0000);
        assert_eq!(row.data, vec![0x0A, 0x0B, 0x0C]);
        assert_eq!(row.checksum(), row_checksum(&[0x0A, 0x0B, 0x0C]));

        let empty = Row::parse(":00100000", 3).unwrap();
        assert!(empty.data.is_empty());
    }

    #[test]
    fn test_rows_stream_lazily() {
        let mut img = image(IMAGE);
        assert_eq!(img.header().app_id, 3);
        assert_eq!(img.app_descriptor().length, 0x200);

        let rows: Vec<Row> = img.rows().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].address, 0x0010_0100);
        assert_eq!(rows[1].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        // Forward-only.
        assert!(img.rows().next().is_none());
        assert_eq!(img.row_count(), None);
    }

    #[test]
    fn test_from_seekable_counts_rows() {
        let text = IMAGE.replace('\n', "\r\n");
        let mut img = Cyacd2Image::from_seekable(Cursor::new(text.into_bytes())).unwrap();
        assert_eq!(img.row_count(), Some(2));
        assert_eq!(img.header().app_id, 3);
        assert_eq!(img.rows().count(), 2);

        let header_only = "017856341202000312345678\n@APPINFO:0x1000,0x200";
        let img = Cyacd2Image::from_seekable(Cursor::new(header_only)).unwrap();
        assert_eq!(img.row_count(), Some(0));

        // A bad line still counts; it fails when reached.
        let bad = format!("{IMAGE}zz\n");
        let mut img = Cyacd2Image::from_seekable(Cursor::new(bad)).unwrap();
        assert_eq!(img.row_count(), Some(3));
        assert!(img.rows().nth(2).unwrap().is_err());
    }

    #[test]
    fn test_crlf_lines() {
        let mut img = image(&IMAGE.replace('\n', "\r\n"));
        assert_eq!(img.rows().count(), 2);
    }

    #[test]
    fn test_bad_row_stops_iteration() {
        let mut img = image(
            "017856341202000312345678\n@APPINFO:0x1000,0x200\n:000010000A\nnot a row\n:00001000FF\n",
        );
        let mut rows = img.rows();
        assert!(rows.next().unwrap().is_ok());
        match rows.next() {
            Some(Err(ImageError::Format { line, .. })) => assert_eq!(line, 4),
            other => panic!("expected format error, got {other:?}"),
        }
        assert!(rows.next().is_none());
    }

    #[test]
    fn test_row_too_short() {
        assert!(matches!(
            Row::parse(":0010", 7),
            Err(ImageError::Format { line: 7, .. })
        ));
        assert!(matches!(
            Row::parse(":0010000", 7),
            Err(ImageError::Format { line: 7, .. })
        ));
    }

    #[test]
    fn test_missing_lines() {
        assert!(matches!(
            Cyacd2Image::from_reader(Cursor::new(Vec::new())),
            Err(ImageError::Format { line: 1, .. })
        ));
        assert!(matches!(
            Cyacd2Image::from_reader(Cursor::new(b"017856341202000312345678\n".to_vec())),
            Err(ImageError::Format { line: 2, .. })
        ));
    }

    #[test]
    fn test_open_requires_extension() {
        let mut file = tempfile::Builder::new().suffix(".hex").tempfile().unwrap();
        file.write_all(IMAGE.as_bytes()).unwrap();
        assert!(matches!(
            Cyacd2Image::open(file.path()),
            Err(ImageError::Validation(_))
        ));
    }

    #[test]
    fn test_open_and_close() {
        let mut file = tempfile::Builder::new()
            .suffix(".cyacd2")
            .tempfile()
            .unwrap();
        file.write_all(IMAGE.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut img = Cyacd2Image::open(file.path()).unwrap();
        assert_eq!(img.header().product_id, 0x7856_3412);
        assert_eq!(img.row_count(), Some(2));
        let first = img.rows().next().unwrap().unwrap();
        assert_eq!(first.address, 0x0010_0000);
        // Early termination; the rest of the file is never read.
        img.close();
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Cyacd2Image::open(dir.path().join("absent.cyacd2")),
            Err(ImageError::Io(_))
        ));
    }
}
