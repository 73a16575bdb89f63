//! Document parsing into ordered content blocks.
//!
//! Reads the text layer of PDF, DOCX, PPTX, XLSX, Markdown and plain-text
//! files and splits it into [`ContentBlock`]s. Paragraphs laid out as columns
//! become tables, short formula-like lines become equations, everything else
//! is text. Spreadsheets map one sheet to one table.
//!
//! The block list is also written to disk as a JSON "content list" so a parse
//! can be inspected after the fact.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum sheets read from a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Longest paragraph still considered for equation detection.
const MAX_EQUATION_CHARS: usize = 160;

/// How the document's content is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMethod {
    /// Text layer when present; documents that would need OCR are rejected.
    #[default]
    Auto,
    /// Text layer only.
    Txt,
    /// Optical character recognition.
    Ocr,
}

impl FromStr for ParseMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ParseMethod::Auto),
            "txt" => Ok(ParseMethod::Txt),
            "ocr" => Ok(ParseMethod::Ocr),
            other => Err(format!(
                "unknown parse method '{}': use auto, txt or ocr",
                other
            )),
        }
    }
}

/// Source formats recognized by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    PlainText,
}

impl DocFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocFormat::Pdf),
            "docx" => Some(DocFormat::Docx),
            "pptx" => Some(DocFormat::Pptx),
            "xlsx" => Some(DocFormat::Xlsx),
            "md" | "markdown" | "txt" => Some(DocFormat::PlainText),
            _ => None,
        }
    }
}

/// Parse failure. The ingestion pipeline records it on the document's status.
#[derive(Debug)]
pub enum ParseError {
    UnsupportedFormat(String),
    /// OCR was requested, or a PDF without a text layer was parsed in auto mode.
    OcrUnavailable,
    EmptyTextLayer,
    /// The document parsed but held no text, table or equation.
    NoContent,
    Pdf(String),
    Ooxml(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnsupportedFormat(p) => write!(f, "unsupported document format: {}", p),
            ParseError::OcrUnavailable => write!(
                f,
                "document needs OCR, which this build does not provide; use a PDF with a text layer"
            ),
            ParseError::EmptyTextLayer => write!(f, "PDF text layer is empty"),
            ParseError::NoContent => write!(f, "document has no extractable content"),
            ParseError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ParseError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

/// One unit of parsed content, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Table {
        table_body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table_caption: Option<String>,
    },
    Equation {
        text: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub blocks: Vec<ContentBlock>,
}

impl ParsedDocument {
    /// Concatenated block text, paragraphs separated by blank lines.
    pub fn full_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } | ContentBlock::Equation { text } => text.as_str(),
                ContentBlock::Table { table_body, .. } => table_body.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Parse `bytes` as `format`.
///
/// Fails for `ParseMethod::Ocr` whatever the format, and when the document
/// yields no content blocks.
pub fn parse_bytes(
    bytes: &[u8],
    format: DocFormat,
    method: ParseMethod,
) -> Result<ParsedDocument, ParseError> {
    if method == ParseMethod::Ocr {
        return Err(ParseError::OcrUnavailable);
    }
    let blocks = match format {
        DocFormat::Pdf => split_blocks(&extract_pdf(bytes, method)?),
        DocFormat::Docx => split_blocks(&extract_ooxml_text(bytes, |n| {
            n == "word/document.xml"
        })?),
        DocFormat::Pptx => split_blocks(&extract_ooxml_text(bytes, |n| {
            n.starts_with("ppt/slides/slide") && n.ends_with(".xml")
        })?),
        DocFormat::Xlsx => extract_xlsx_tables(bytes)?,
        DocFormat::PlainText => split_blocks(&String::from_utf8_lossy(bytes)),
    };
    if blocks.is_empty() {
        return Err(ParseError::NoContent);
    }
    Ok(ParsedDocument { blocks })
}

fn extract_pdf(bytes: &[u8], method: ParseMethod) -> Result<String, ParseError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
    if text.trim().is_empty() {
        return Err(match method {
            ParseMethod::Auto => ParseError::OcrUnavailable,
            _ => ParseError::EmptyTextLayer,
        });
    }
    Ok(text)
}

/// Split plain text into blocks on blank lines and classify each paragraph.
pub fn split_blocks(text: &str) -> Vec<ContentBlock> {
    let normalized = text.replace("\r\n", "\n").replace('\u{c}', "\n\n");
    let mut blocks: Vec<ContentBlock> = Vec::new();

    for para in normalized.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if looks_like_table(trimmed) {
            // A short "Table N ..." paragraph right before the table is its caption
            let table_caption = match blocks.last() {
                Some(ContentBlock::Text { text }) if is_table_caption(text) => {
                    let caption = text.clone();
                    blocks.pop();
                    Some(caption)
                }
                _ => None,
            };
            blocks.push(ContentBlock::Table {
                table_body: trimmed.to_string(),
                table_caption,
            });
        } else if looks_like_equation(trimmed) {
            blocks.push(ContentBlock::Equation {
                text: trimmed.to_string(),
            });
        } else {
            blocks.push(ContentBlock::Text {
                text: trimmed.to_string(),
            });
        }
    }

    blocks
}

fn is_table_caption(text: &str) -> bool {
    text.len() < 200 && text.lines().count() == 1 && text.to_lowercase().starts_with("table")
}

fn cell_count(line: &str) -> usize {
    let count = |sep: &str| {
        line.split(sep)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .count()
    };
    if line.contains('|') {
        count("|")
    } else if line.contains('\t') {
        count("\t")
    } else {
        count("  ")
    }
}

/// At least two lines, and two thirds of them split into two or more cells.
fn looks_like_table(para: &str) -> bool {
    let lines: Vec<&str> = para.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return false;
    }
    let columnar = lines.iter().filter(|l| cell_count(l) >= 2).count();
    columnar >= 2 && columnar * 3 >= lines.len() * 2
}

fn looks_like_equation(para: &str) -> bool {
    if para.chars().count() > MAX_EQUATION_CHARS || para.lines().count() > 3 {
        return false;
    }
    let has_relation = para.contains('=')
        || para
            .chars()
            .any(|c| matches!(c, '∑' | '∫' | '√' | '≤' | '≥' | '≈' | '∝'));
    if !has_relation {
        return false;
    }
    let long_words = para
        .split_whitespace()
        .filter(|w| w.len() >= 4 && w.chars().all(|c| c.is_alphabetic()))
        .count();
    long_words <= 2
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ParseError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ParseError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ParseError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ParseError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParseError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Trailing number of an entry like `ppt/slides/slide12.xml`, for ordering.
fn entry_number(name: &str) -> u32 {
    let stem = name.trim_end_matches(".xml");
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u32::MAX)
}

fn sorted_entries<F>(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, keep: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| keep(*n))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|n| (entry_number(n), n.clone()));
    names
}

/// Text of every matching entry; `<*:p>` ends a paragraph, `<*:t>` holds text.
fn extract_ooxml_text<F>(bytes: &[u8], keep: F) -> Result<String, ParseError>
where
    F: Fn(&str) -> bool,
{
    let mut archive = open_zip(bytes)?;
    let names = sorted_entries(&archive, keep);
    if names.is_empty() {
        return Err(ParseError::Ooxml("no document parts found".to_string()));
    }

    let mut out = String::new();
    for name in names {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        out.push_str(&paragraph_text(&xml)?);
        out.push_str("\n\n");
    }
    Ok(out)
}

fn paragraph_text(xml: &[u8]) -> Result<String, ParseError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ParseError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx_tables(bytes: &[u8]) -> Result<Vec<ContentBlock>, ParseError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let sheets = sorted_entries(&archive, |n| {
        n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml")
    });

    let mut blocks = Vec::new();
    for (idx, name) in sheets.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let body = sheet_rows(&xml, &shared_strings)?;
        if body.trim().is_empty() {
            continue;
        }
        blocks.push(ContentBlock::Table {
            table_body: body,
            table_caption: Some(format!("Sheet {}", idx + 1)),
        });
    }
    Ok(blocks)
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ParseError> {
    use quick_xml::events::Event;

    let mut strings: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ParseError::Ooxml(e.to_string()))?;
                if let Some(last) = strings.last_mut() {
                    last.push_str(&text);
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_text = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Render a worksheet as `a | b | c` lines, one per row.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ParseError> {
    use quick_xml::events::Event;

    let mut rows: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te
                    .unescape()
                    .map_err(|e| ParseError::Ooxml(e.to_string()))?;
                let raw = raw.trim();
                let value = if shared {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned())
                } else {
                    Some(raw.to_string())
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    current.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !current.is_empty() {
                        rows.push(current.join(" | "));
                        current.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        rows.push(current.join(" | "));
    }
    Ok(rows.join("\n"))
}

/// Write the parsed blocks to `<output_dir>/<stem>/<stem>_content_list.json`.
pub fn write_content_list(
    doc: &ParsedDocument,
    source: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let dir = output_dir.join(&stem);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output dir: {}", dir.display()))?;
    let path = dir.join(format!("{}_content_list.json", stem));
    let json = serde_json::to_string_pretty(&doc.blocks)?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write content list: {}", path.display()))?;
    Ok(path)
}
