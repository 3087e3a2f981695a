use serde::{Deserialize, Serialize};

const PDF_EXTS: &[&str] = &["pdf"];
const DOC_EXTS: &[&str] = &[
    "doc", "docx", "ppt", "pptx", "pages", "key", "yml", "yaml", "xml", "htm", "html", "json",
    "csv", "tsv", "txt", "ini", "xls", "xlsx", "rtf", "md", "markdown", "eml", "py", "js", "ts",
    "java", "c", "cpp", "h", "go", "rs", "sh", "sql", "toml", "log",
];
const AURAL_EXTS: &[&str] = &[
    "wav", "flac", "ape", "alac", "wv", "mp3", "aac", "ogg", "vorbis", "opus",
];
const VISUAL_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "tif", "tiff", "gif", "bmp", "webp", "avif", "svg", "ico", "mp4", "mov",
    "avi", "mpg", "mpeg",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Doc,
    Visual,
    Aural,
    Other,
}

impl FileType {
    pub fn from_filename(name: &str) -> Self {
        let ext = extension(name);
        let ext = ext.as_str();
        if PDF_EXTS.contains(&ext) {
            FileType::Pdf
        } else if DOC_EXTS.contains(&ext) {
            FileType::Doc
        } else if AURAL_EXTS.contains(&ext) {
            FileType::Aural
        } else if VISUAL_EXTS.contains(&ext) {
            FileType::Visual
        } else {
            FileType::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Doc => "doc",
            FileType::Visual => "visual",
            FileType::Aural => "aural",
            FileType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pdf" => Some(FileType::Pdf),
            "doc" => Some(FileType::Doc),
            "visual" => Some(FileType::Visual),
            "aural" => Some(FileType::Aural),
            "other" => Some(FileType::Other),
            _ => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        *self != FileType::Other
    }
}

pub fn extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

pub fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}
