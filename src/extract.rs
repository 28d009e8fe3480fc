//! Text extraction for downloaded source files.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use crate::drive::DOCX_MIME;

const PDF_MIME: &str = "application/pdf";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no extractable text")]
    Empty,

    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns file bytes into plain text.
pub trait Extractor: Send + Sync {
    /// Whether files of this MIME type are worth downloading at all.
    fn supports(&self, mime_type: &str) -> bool;

    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractError>;
}

/// PDF, DOCX (including exported native docs) and plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Docx,
    Text,
}

impl DocumentExtractor {
    pub fn new() -> Self {
        Self
    }

    fn format_for(mime_type: &str) -> Option<Format> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            PDF_MIME => Some(Format::Pdf),
            DOCX_MIME => Some(Format::Docx),
            "application/json" | "application/xml" => Some(Format::Text),
            m if m.starts_with("text/") => Some(Format::Text),
            _ => None,
        }
    }

    /// Generic MIME types are resolved from the content itself.
    fn sniff(bytes: &[u8]) -> Option<Format> {
        match infer::get(bytes) {
            // a bare zip is most likely an office document
            Some(kind) if kind.mime_type() == "application/zip" => Some(Format::Docx),
            Some(kind) => Self::format_for(kind.mime_type()),
            None if std::str::from_utf8(bytes).is_ok() => Some(Format::Text),
            None => None,
        }
    }
}

impl Extractor for DocumentExtractor {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type == OCTET_STREAM || Self::format_for(mime_type).is_some()
    }

    fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
        let format = if mime_type == OCTET_STREAM {
            Self::sniff(bytes)
        } else {
            Self::format_for(mime_type)
        }
        .ok_or_else(|| ExtractError::UnsupportedFormat(mime_type.to_string()))?;

        let text = match format {
            Format::Pdf => extract_pdf_text(bytes)?,
            Format::Docx => extract_docx_text(bytes)?,
            Format::Text => String::from_utf8_lossy(bytes).into_owned(),
        };

        if text.trim().is_empty() {
            return Err(ExtractError::Empty);
        }
        Ok(text)
    }
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed files
    std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Failed("PDF parser panicked".to_string()))?
        .map_err(|e| ExtractError::Failed(format!("PDF extraction failed: {e}")))
}

/// Paragraph text of `word/document.xml`, one paragraph per line.
fn extract_docx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Failed(format!("invalid DOCX archive: {e}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Failed(format!("missing document body: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::Failed(format!("failed to read document body: {e}")))?;

    let mut reader = Reader::from_str(&xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let text = e
                    .unescape()
                    .map_err(|e| ExtractError::Failed(format!("invalid DOCX text: {e}")))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Failed(format!("invalid DOCX XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}
