//! Plain-text extraction for the document formats we ingest.

use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::{info, warn};

/// Below this many characters a PDF most likely holds scanned images only.
const SCANNED_PDF_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("File is not valid UTF-8 text")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Failed to read PDF: {0}")]
    Pdf(String),

    #[error("Failed to read DOCX: {0}")]
    Docx(String),

    #[error("Unsupported file format: {0}")]
    Unsupported(String),
}

/// Extracts the text of a document whose lower-cased extension is `file_type`.
///
/// PDF pages are joined by the extractor's own page breaks; DOCX paragraphs
/// become lines.
pub fn extract_text(file_type: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
    match file_type {
        "txt" | "md" => Ok(String::from_utf8(bytes)?),
        "pdf" => extract_pdf(&bytes),
        "docx" => extract_docx(&bytes),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let length = text.trim().chars().count();
    if length < SCANNED_PDF_THRESHOLD {
        warn!(chars = length, "PDF yielded almost no text; it may be a scan");
    } else {
        info!(chars = length, "Extracted text from PDF");
    }
    Ok(text)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Docx(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(e.to_string()))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    Ok(docx_xml_to_text(&xml))
}

/// Pulls run text out of a WordprocessingML body, one line per paragraph.
pub fn docx_xml_to_text(xml: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        if in_text {
            current.push_str(&unescape(&rest[..open]));
        }
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = &rest[open + 1..open + close];
        let closing = tag.starts_with('/');
        let empty = tag.ends_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();

        match name {
            "w:t" => in_text = !closing && !empty,
            "w:tab" => current.push('\t'),
            "w:br" | "w:cr" => current.push('\n'),
            "w:p" if closing || empty => paragraphs.push(std::mem::take(&mut current)),
            _ => {}
        }
        rest = &rest[open + close + 1..];
    }

    paragraphs.join("\n")
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
