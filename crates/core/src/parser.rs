use std::fmt;
use std::sync::Arc;

use html2text::from_read;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::naive_merge;
use crate::error::{KbError, Result};
use crate::file_type::{extension, file_stem, FileType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Presentation,
    Picture,
    Audio,
    Email,
    Naive,
}

impl ParserKind {
    /// Picks the parser for an upload; `default` applies to plain documents.
    pub fn for_file(file_type: FileType, filename: &str, default: ParserKind) -> Self {
        match file_type {
            FileType::Visual => return ParserKind::Picture,
            FileType::Aural => return ParserKind::Audio,
            _ => {}
        }
        match extension(filename).as_str() {
            "ppt" | "pptx" | "pages" => ParserKind::Presentation,
            "eml" => ParserKind::Email,
            _ => default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Presentation => "presentation",
            ParserKind::Picture => "picture",
            ParserKind::Audio => "audio",
            ParserKind::Email => "email",
            ParserKind::Naive => "naive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "presentation" => Some(ParserKind::Presentation),
            "picture" => Some(ParserKind::Picture),
            "audio" => Some(ParserKind::Audio),
            "email" => Some(ParserKind::Email),
            "naive" => Some(ParserKind::Naive),
            _ => None,
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    pub chunk_token_num: usize,
    pub delimiter: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            chunk_token_num: 4096,
            delimiter: "\n!?;。；！？".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    pub text: String,
    pub image: Option<Vec<u8>>,
}

impl ParsedChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(text: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            text: text.into(),
            image: Some(image),
        }
    }
}

pub trait ChunkParser: Send + Sync {
    fn chunk(&self, name: &str, bytes: &[u8], config: &ParserConfig) -> Result<Vec<ParsedChunk>>;
}

/// One parser per [`ParserKind`]; the pipeline resolves a kind once per job.
#[derive(Clone)]
pub struct ParserSet {
    presentation: Arc<dyn ChunkParser>,
    picture: Arc<dyn ChunkParser>,
    audio: Arc<dyn ChunkParser>,
    email: Arc<dyn ChunkParser>,
    naive: Arc<dyn ChunkParser>,
}

impl ParserSet {
    pub fn builtin() -> Self {
        Self {
            presentation: Arc::new(PresentationParser),
            picture: Arc::new(PictureParser),
            audio: Arc::new(AudioParser),
            email: Arc::new(EmailParser),
            naive: Arc::new(NaiveParser),
        }
    }

    pub fn with_parser(mut self, kind: ParserKind, parser: Arc<dyn ChunkParser>) -> Self {
        match kind {
            ParserKind::Presentation => self.presentation = parser,
            ParserKind::Picture => self.picture = parser,
            ParserKind::Audio => self.audio = parser,
            ParserKind::Email => self.email = parser,
            ParserKind::Naive => self.naive = parser,
        }
        self
    }

    pub fn get(&self, kind: ParserKind) -> &dyn ChunkParser {
        match kind {
            ParserKind::Presentation => self.presentation.as_ref(),
            ParserKind::Picture => self.picture.as_ref(),
            ParserKind::Audio => self.audio.as_ref(),
            ParserKind::Email => self.email.as_ref(),
            ParserKind::Naive => self.naive.as_ref(),
        }
    }
}

impl Default for ParserSet {
    fn default() -> Self {
        Self::builtin()
    }
}

const OFFICE_EXTS: &[&str] = &[
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "pages", "key", "rtf",
];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

// Office formats are read only when they arrive as plain text. Containers need
// an extractor registered through `ParserSet::with_parser`.
fn reject_office_binary(name: &str, bytes: &[u8]) -> Result<()> {
    let ext = extension(name);
    if !OFFICE_EXTS.contains(&ext.as_str()) {
        return Ok(());
    }
    let binary = bytes.starts_with(ZIP_MAGIC)
        || bytes.starts_with(OLE_MAGIC)
        || bytes.starts_with(b"{\\rtf")
        || bytes.contains(&0)
        || std::str::from_utf8(bytes).is_err();
    if binary {
        return Err(KbError::UnsupportedInput(format!(
            "{name}: binary .{ext} content needs a dedicated extractor"
        )));
    }
    Ok(())
}

pub struct NaiveParser;

impl ChunkParser for NaiveParser {
    fn chunk(&self, name: &str, bytes: &[u8], config: &ParserConfig) -> Result<Vec<ParsedChunk>> {
        reject_office_binary(name, bytes)?;
        let text = match extension(name).as_str() {
            "pdf" => pdf_extract::extract_text_from_mem(bytes).map_err(|e| KbError::Parser {
                parser: "naive",
                name: name.to_string(),
                reason: e.to_string(),
            })?,
            "html" | "htm" => from_read(bytes, 80),
            _ => String::from_utf8_lossy(bytes).into_owned(),
        };
        let sections = naive_merge(&text, config.chunk_token_num, &config.delimiter)?;
        debug!(name, chars = text.len(), sections = sections.len(), "naive parse");
        Ok(sections.into_iter().map(ParsedChunk::text).collect())
    }
}

/// Slides arrive as extracted text with form-feed page breaks; one chunk per slide.
pub struct PresentationParser;

impl ChunkParser for PresentationParser {
    fn chunk(&self, name: &str, bytes: &[u8], _config: &ParserConfig) -> Result<Vec<ParsedChunk>> {
        reject_office_binary(name, bytes)?;
        let text = String::from_utf8_lossy(bytes);
        Ok(text
            .split('\u{c}')
            .map(str::trim)
            .filter(|slide| !slide.is_empty())
            .map(ParsedChunk::text)
            .collect())
    }
}

pub struct PictureParser;

impl ChunkParser for PictureParser {
    fn chunk(&self, name: &str, bytes: &[u8], _config: &ParserConfig) -> Result<Vec<ParsedChunk>> {
        if bytes.is_empty() {
            return Err(KbError::Parser {
                parser: "picture",
                name: name.to_string(),
                reason: "empty image".to_string(),
            });
        }
        let caption = file_stem(name).replace(|c: char| c == '_' || c == '-', " ");
        Ok(vec![ParsedChunk::with_image(caption, bytes.to_vec())])
    }
}

pub struct AudioParser;

impl ChunkParser for AudioParser {
    fn chunk(&self, name: &str, _bytes: &[u8], _config: &ParserConfig) -> Result<Vec<ParsedChunk>> {
        Err(KbError::UnsupportedInput(format!(
            "{name}: audio requires a speech-to-text parser"
        )))
    }
}

const EMAIL_HEADERS: &[&str] = &["from", "to", "cc", "date", "subject"];

pub struct EmailParser;

impl ChunkParser for EmailParser {
    fn chunk(&self, _name: &str, bytes: &[u8], config: &ParserConfig) -> Result<Vec<ParsedChunk>> {
        let raw = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        let (head, body) = raw.split_once("\n\n").unwrap_or((raw.as_str(), ""));
        let mut header_lines = Vec::new();
        for line in head.lines() {
            if let Some((key, value)) = line.split_once(':') {
                if EMAIL_HEADERS.contains(&key.trim().to_lowercase().as_str()) {
                    header_lines.push(format!("{}: {}", key.trim(), value.trim()));
                }
            }
        }
        let mut chunks = Vec::new();
        if !header_lines.is_empty() {
            chunks.push(ParsedChunk::text(header_lines.join("\n")));
        }
        for section in naive_merge(body, config.chunk_token_num, &config.delimiter)? {
            chunks.push(ParsedChunk::text(section));
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_parser_once_from_file_type() {
        let kind = |name: &str| {
            ParserKind::for_file(FileType::from_filename(name), name, ParserKind::Naive)
        };
        assert_eq!(kind("deck.pptx"), ParserKind::Presentation);
        assert_eq!(kind("photo.png"), ParserKind::Picture);
        assert_eq!(kind("memo.eml"), ParserKind::Email);
        assert_eq!(kind("voice.mp3"), ParserKind::Audio);
        assert_eq!(kind("notes.txt"), ParserKind::Naive);
    }

    #[test]
    fn presentation_splits_on_page_breaks() {
        let chunks = PresentationParser
            .chunk("deck.pptx", b"Intro\x0c\x0cAgenda\x0cWrap up", &ParserConfig::default())
            .unwrap();
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Intro", "Agenda", "Wrap up"]);
    }

    #[test]
    fn email_keeps_known_headers() {
        let raw = b"From: a@example.com\r\nX-Trace: 1\r\nSubject: Budget\r\n\r\nPlease review the numbers.";
        let chunks = EmailParser.chunk("memo.eml", raw, &ParserConfig::default()).unwrap();
        assert_eq!(chunks[0].text, "From: a@example.com\nSubject: Budget");
        assert_eq!(chunks[1].text, "Please review the numbers.");
    }

    #[test]
    fn picture_carries_image_payload() {
        let chunks = PictureParser
            .chunk("site_plan-v2.png", &[1, 2, 3], &ParserConfig::default())
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "site plan v2");
        assert_eq!(chunks[0].image.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn audio_is_unsupported_without_transcriber() {
        let err = AudioParser
            .chunk("talk.mp3", b"ID3", &ParserConfig::default())
            .unwrap_err();
        assert!(matches!(err, KbError::UnsupportedInput(_)));
    }

    #[test]
    fn office_containers_are_rejected() {
        let docx = b"PK\x03\x04\x14\x00\x06\x00word/document.xml";
        let err = NaiveParser
            .chunk("report.docx", docx, &ParserConfig::default())
            .unwrap_err();
        assert!(matches!(err, KbError::UnsupportedInput(_)));

        let xls = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
        assert!(NaiveParser
            .chunk("budget.xls", &xls, &ParserConfig::default())
            .is_err());
        assert!(NaiveParser
            .chunk("memo.rtf", b"{\\rtf1\\ansi Hello}", &ParserConfig::default())
            .is_err());
        assert!(PresentationParser
            .chunk("deck.pptx", docx, &ParserConfig::default())
            .is_err());
    }

    #[test]
    fn office_text_exports_are_read() {
        let chunks = NaiveParser
            .chunk("minutes.doc", b"Minutes of the planning meeting.", &ParserConfig::default())
            .unwrap();
        assert_eq!(chunks[0].text, "Minutes of the planning meeting.");
    }

    #[test]
    fn naive_renders_html() {
        let chunks = NaiveParser
            .chunk("page.html", b"<p>Hello <b>there</b></p>", &ParserConfig::default())
            .unwrap();
        assert!(chunks[0].text.contains("Hello"));
        assert!(!chunks[0].text.contains("<p>"));
    }
}
