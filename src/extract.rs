//! File-to-text conversion.
//!
//! Produces markdown-flavoured UTF-8 text from a source file. Plain-text
//! formats are read as-is, CSV becomes a markdown table, HTML is reduced to
//! headings, paragraphs and list items, and the binary formats (PDF, DOCX,
//! PPTX, XLSX) go through their dedicated extractors. ZIP archives convert
//! every supported entry and concatenate the results under per-entry
//! headings.
//!
//! Formats listed in [`FAST_FORMATS`] are cheap enough to convert inline;
//! everything else runs in the conversion pool.

use scraper::{ElementRef, Html, Selector};
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::extensions::extension_of;

/// Converted inline by the orchestrator, never through the pool.
pub const FAST_FORMATS: [&str; 7] = [".txt", ".md", ".json", ".csv", ".html", ".htm", ".xml"];
/// Size-checked before conversion.
pub const ARCHIVE_EXTENSIONS: [&str; 5] = [".zip", ".tar", ".gz", ".bz2", ".xz"];
pub const MAX_ARCHIVE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Read as UTF-8 text with no transformation.
const PLAIN_TEXT_FORMATS: [&str; 12] = [
    ".txt", ".md", ".markdown", ".json", ".xml", ".rst", ".log", ".yaml", ".yml", ".toml", ".ini",
    ".cfg",
];

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("{0}")]
    Unsupported(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("HTML extraction failed: {0}")]
    Html(String),
    #[error("archive extraction failed: {0}")]
    Archive(String),
}

impl ExtractError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ExtractError::Unsupported(_))
    }
}

pub fn is_fast_format(extension: &str) -> bool {
    FAST_FORMATS.contains(&extension)
}

pub fn is_archive(extension: &str) -> bool {
    ARCHIVE_EXTENSIONS.contains(&extension)
}

/// Convert the file at `path` to text, dispatching on its extension.
pub fn convert_path(path: &Path) -> Result<String, ExtractError> {
    let Some(extension) = extension_of(path) else {
        return Err(ExtractError::Unsupported(format!(
            "file has no extension: {}",
            path.display()
        )));
    };

    match extension.as_str() {
        ".zip" => {
            let bytes = std::fs::read(path)?;
            convert_zip(&bytes)
        }
        ".tar" | ".gz" | ".bz2" | ".xz" => Err(ExtractError::Unsupported(format!(
            "archive format '{}' is not supported",
            extension
        ))),
        _ => {
            let bytes = std::fs::read(path)?;
            extract_bytes(&bytes, &extension)
        }
    }
}

/// Convert in-memory content whose format is given by `extension`.
pub fn extract_bytes(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    match extension {
        ext if PLAIN_TEXT_FORMATS.contains(&ext) => Ok(decode_text(bytes)),
        ".csv" => Ok(csv_to_markdown(&decode_text(bytes))),
        ".html" | ".htm" => html_to_markdown(&decode_text(bytes)),
        ".pdf" => extract_pdf(bytes),
        ".docx" => extract_docx(bytes),
        ".pptx" => extract_pptx(bytes),
        ".xlsx" => extract_xlsx(bytes),
        other => Err(ExtractError::Unsupported(format!(
            "no converter for '{}' files",
            other
        ))),
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// ============ CSV ============

fn csv_to_markdown(text: &str) -> String {
    let rows: Vec<Vec<String>> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(split_csv_line)
        .collect();
    let Some(header) = rows.first() else {
        return String::new();
    };
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);

    let mut out = String::new();
    let render = |out: &mut String, row: &[String]| {
        out.push('|');
        for i in 0..width {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let _ = write!(out, " {} |", cell.replace('|', "\\|"));
        }
        out.push('\n');
    };

    render(&mut out, header);
    out.push('|');
    for _ in 0..width {
        out.push_str(" --- |");
    }
    out.push('\n');
    for row in &rows[1..] {
        render(&mut out, row);
    }
    out
}

/// Split one CSV record, honouring double-quoted fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

// ============ HTML ============

fn html_to_markdown(html: &str) -> Result<String, ExtractError> {
    let document = Html::parse_document(html);
    let block_selector = selector("h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, th")?;
    let title_selector = selector("title")?;
    let body_selector = selector("body")?;

    let mut out = String::with_capacity(html.len() / 2);

    if let Some(title) = document.select(&title_selector).next() {
        let title = collapse_whitespace(&element_text(title));
        if !title.is_empty() {
            let _ = writeln!(out, "# {}\n", title);
        }
    }

    for element in document.select(&block_selector) {
        let tag = element.value().name();
        let text = if tag == "pre" {
            element_text(element).trim_end().to_string()
        } else {
            collapse_whitespace(&element_text(element))
        };
        if text.is_empty() {
            continue;
        }
        let _ = match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = tag[1..].parse::<usize>().unwrap_or(1);
                writeln!(out, "{} {}\n", "#".repeat(level), text)
            }
            "li" => writeln!(out, "- {}", text),
            "pre" => writeln!(out, "```\n{}\n```\n", text),
            "blockquote" => writeln!(out, "> {}\n", text),
            _ => writeln!(out, "{}\n", text),
        };
    }

    if out.trim().is_empty() {
        if let Some(body) = document.select(&body_selector).next() {
            out = collapse_whitespace(&element_text(body));
        }
    }
    Ok(out)
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Html(format!("invalid selector '{}': {}", css, e)))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ ZIP archives ============

fn convert_zip(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Archive(e.to_string()))?;

    let mut out = String::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some(extension) = extension_of(Path::new(&name)) else {
            continue;
        };
        if is_archive(&extension) {
            continue;
        }

        let mut content = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut content)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        if content.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Archive(format!(
                "ZIP entry {} exceeds size limit ({} bytes)",
                name, MAX_XML_ENTRY_BYTES
            )));
        }

        match extract_bytes(&content, &extension) {
            Ok(text) if !text.trim().is_empty() => {
                let _ = write!(out, "## {}\n\n{}\n\n", name, text.trim_end());
            }
            Ok(_) | Err(ExtractError::Unsupported(_)) => {}
            Err(e) => {
                tracing::debug!("Skipping archive entry {}: {}", name, e);
            }
        }
    }
    Ok(out)
}

// ============ PDF / OOXML ============

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if !archive.file_names().any(|n| n == "word/document.xml") {
        return Err(ExtractError::Ooxml(
            "word/document.xml not found".to_string(),
        ));
    }
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    extract_text_runs(&doc_xml, b"p")
}

/// Collect `<*:t>` text runs, breaking lines at the end of each `block`
/// element (`w:p` paragraphs, `a:p` in slides).
fn extract_text_runs(xml: &[u8], block: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == block && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let slide_names = numbered_entries(&archive, "ppt/slides/slide");
    let mut out = String::new();
    for (idx, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_text_runs(&xml, b"p")?;
        if text.trim().is_empty() {
            continue;
        }
        let _ = write!(out, "<!-- Slide {} -->\n{}\n", idx + 1, text.trim_end());
    }
    Ok(out)
}

/// Entries named `{prefix}{n}.xml`, in numeric order.
fn numbered_entries(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let sheet_names = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut out = String::new();
    for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let rows = extract_xlsx_sheet_rows(&sheet_xml, &shared_strings)?;
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## Sheet{}\n", idx + 1);
        for row in rows {
            let _ = writeln!(out, "| {} |", row.join(" | "));
        }
        out.push('\n');
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    current = Some(String::new());
                } else if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        if let Some(s) = current.as_mut() {
                            s.push_str(te.unescape().unwrap_or_default().as_ref());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    strings.extend(current.take());
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values grouped by `<row>`; shared-string cells are resolved, other
/// cells keep their literal value.
fn extract_xlsx_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    let value = if cell_is_shared_str {
                        s.parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                    } else {
                        Some(s.to_string())
                    };
                    if let Some(value) = value {
                        row.push(value);
                        cell_count += 1;
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared_str = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows)
}
