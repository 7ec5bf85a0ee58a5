//! Text extraction for uploaded files.
//!
//! Takes raw bytes plus a content type and returns plain UTF-8 text ready
//! for chunking. Plain text, Markdown, CSV, HTML and JSON are decoded in
//! process; PDF goes through `pdf-extract`; DOCX, PPTX and XLSX are read
//! as ZIP archives with `quick-xml`. PDF and OOXML extraction is CPU-bound
//! and should run on a blocking thread.

use std::io::Read;
use thiserror::Error;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_HTML: &str = "text/html";
pub const MIME_JSON: &str = "application/json";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// HTML elements whose content is dropped entirely.
const HTML_SKIPPED: &[&str] = &["script", "style", "nav", "header", "footer", "aside"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("file is not valid UTF-8 text")]
    InvalidUtf8,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("Office document extraction failed: {0}")]
    Ooxml(String),
}

/// Content types accepted for upload.
pub fn is_supported(content_type: &str) -> bool {
    matches!(
        content_type,
        MIME_TEXT
            | MIME_MARKDOWN
            | MIME_CSV
            | MIME_HTML
            | MIME_JSON
            | MIME_PDF
            | MIME_DOCX
            | MIME_PPTX
            | MIME_XLSX
    )
}

/// Guess a content type from a filename extension.
pub fn content_type_for(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    Some(match ext.as_str() {
        "txt" | "text" | "log" => MIME_TEXT,
        "md" | "markdown" => MIME_MARKDOWN,
        "csv" => MIME_CSV,
        "html" | "htm" => MIME_HTML,
        "json" => MIME_JSON,
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        _ => return None,
    })
}

/// Whether extraction for this type should be moved off the async runtime.
pub fn is_cpu_heavy(content_type: &str) -> bool {
    matches!(content_type, MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX)
}

pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_TEXT | MIME_MARKDOWN | MIME_JSON => decode_utf8(bytes),
        MIME_CSV => Ok(extract_csv(&decode_utf8(bytes)?)),
        MIME_HTML => Ok(extract_html(&decode_utf8(bytes)?)),
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::InvalidUtf8)?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

// ============ CSV ============

/// Rows joined with `" | "`, one row per line. Blank rows are skipped.
fn extract_csv(text: &str) -> String {
    parse_csv(text)
        .into_iter()
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .map(|row| row.join(" | "))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, embedded
/// newlines inside quotes.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => row.push(std::mem::take(&mut field)),
            ('\r', false) => {}
            ('\n', false) => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            (c, _) => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

// ============ HTML ============

/// Visible text of an HTML page, one trimmed line per text run. Markup,
/// comments and non-content elements are removed.
fn extract_html(html: &str) -> String {
    let mut text = String::new();
    let mut rest = html;
    let mut skip_until: Option<String> = None;

    while let Some(lt) = rest.find('<') {
        if skip_until.is_none() {
            text.push_str(&rest[..lt]);
        }
        rest = &rest[lt..];

        if rest.starts_with("<!--") {
            rest = match rest.find("-->") {
                Some(end) => &rest[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(gt) = rest.find('>') else {
            rest = "";
            break;
        };
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match &skip_until {
            Some(skipped) if closing && *skipped == name => skip_until = None,
            Some(_) => {}
            None if !closing && !tag.ends_with('/') && HTML_SKIPPED.contains(&name.as_str()) => {
                skip_until = Some(name);
            }
            None => text.push('\n'),
        }
    }
    if skip_until.is_none() {
        text.push_str(rest);
    }

    decode_entities(&text)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
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

/// Entries named `{prefix}{n}.xml`, sorted by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<t>` element (any namespace), grouped into blocks that
/// end at each `block_tag` close. Empty blocks are dropped.
fn collect_text_blocks(xml: &[u8], block_tag: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_text = false,
            Ok(Event::End(e)) if e.local_name().as_ref() == block_tag => {
                let block = current.trim();
                if !block.is_empty() {
                    blocks.push(block.to_string());
                }
                current.clear();
            }
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        blocks.push(tail.to_string());
    }
    Ok(blocks)
}

/// Paragraphs of `word/document.xml`, separated by blank lines.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    Ok(collect_text_blocks(&xml, b"p")?.join("\n\n"))
}

/// One section per slide, paragraphs on separate lines.
fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let paragraphs = collect_text_blocks(&xml, b"p")?;
        if !paragraphs.is_empty() {
            slides.push(paragraphs.join("\n"));
        }
    }
    Ok(slides.join("\n\n"))
}

/// One `## Sheet: N` section per worksheet, cells joined with `" | "`.
fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
        collect_text_blocks(&xml, b"si")?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for (idx, name) in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
        .enumerate()
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let rows = extract_sheet_rows(&xml, &shared_strings)?;
        if !rows.is_empty() {
            sheets.push(format!("## Sheet: {}\n{}", idx + 1, rows.join("\n")));
        }
    }
    Ok(sheets.join("\n\n"))
}

fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Option<Vec<u8>> = None;
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| a.value.into_owned());
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let raw = raw.trim();
                let value = if cell_type.as_deref() == Some(b"s") {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned())
                } else {
                    Some(raw.to_string())
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type = None,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(extract_text(b"hello\nworld", MIME_TEXT).unwrap(), "hello\nworld");
    }

    #[test]
    fn invalid_utf8_rejected() {
        let err = extract_text(&[0xff, 0xfe, 0x00], MIME_TEXT).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidUtf8));
    }

    #[test]
    fn csv_rows_pipe_joined() {
        let csv = "name,city\n\"Smith, J\",Paris\n,\n\"say \"\"hi\"\"\",Lyon\n";
        assert_eq!(
            extract_text(csv.as_bytes(), MIME_CSV).unwrap(),
            "name | city\nSmith, J | Paris\nsay \"hi\" | Lyon"
        );
    }

    #[test]
    fn html_strips_markup_and_chrome() {
        let html = "<html><head><style>p{}</style><script>var x = 1;</script></head>\
                    <body><nav>Menu</nav><h1>Title</h1><!-- note --><p>Fish &amp; chips</p>\
                    <footer>Copyright</footer></body></html>";
        assert_eq!(extract_text(html.as_bytes(), MIME_HTML).unwrap(), "Title\nFish & chips");
    }

    #[test]
    fn content_type_inferred_from_extension() {
        assert_eq!(content_type_for("notes.MD"), Some(MIME_MARKDOWN));
        assert_eq!(content_type_for("report.pdf"), Some(MIME_PDF));
        assert_eq!(content_type_for("archive.tar.gz"), None);
        assert_eq!(content_type_for("README"), None);
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_separated() {
        let doc = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space="preserve"> line</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        assert_eq!(extract_text(&bytes, MIME_DOCX).unwrap(), "First line\n\nSecond");
    }

    #[test]
    fn xlsx_rows_use_shared_strings() {
        let shared = r#"<sst><si><t>Region</t></si><si><t>North</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>Total</v></c></row>
            <row><c t="s"><v>1</v></c><c><v>42</v></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        assert_eq!(
            extract_text(&bytes, MIME_XLSX).unwrap(),
            "## Sheet: 1\nRegion | Total\nNorth | 42"
        );
    }
}
