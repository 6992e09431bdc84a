//! DOCX codec.
//!
//! Text units are `w:p` paragraphs of `word/document.xml`, numbered in
//! document order. Integration streams the XML through unchanged except for
//! corrected paragraphs, whose runs are replaced by a single run carrying
//! the corrected text and the first run's properties.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read, Write};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::write::SimpleFileOptions;

use crate::ai::Suggestion;

use super::{apply_suggestions, group_by_unit, CodecError, DocumentCodec, DocumentFormat, TextUnit};

const DOCUMENT_PART: &str = "word/document.xml";

pub struct DocxCodec;

impl DocxCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DocxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentCodec for DocxCodec {
    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Docx)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<TextUnit>, CodecError> {
        let xml = read_document_xml(bytes)?;
        Ok(scan_paragraphs(&xml)?.units)
    }

    fn integrate(&self, original: &[u8], suggestions: &[Suggestion]) -> Result<Vec<u8>, CodecError> {
        let xml = read_document_xml(original)?;
        let scan = scan_paragraphs(&xml)?;

        let mut replacements = BTreeMap::new();
        for (index, list) in group_by_unit(suggestions) {
            let Some(unit) = scan.units.get(index) else {
                continue;
            };
            if scan.has_nested.contains(&index) {
                log::debug!("Skipping paragraph {} with nested paragraphs", index);
                continue;
            }
            let corrected = apply_suggestions(&unit.text, &list);
            if corrected != unit.text {
                replacements.insert(index, corrected);
            }
        }

        if replacements.is_empty() {
            return Ok(original.to_vec());
        }

        let rewritten = rewrite_document_xml(&xml, &replacements)?;
        repack(original, rewritten.as_bytes())
    }
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>, CodecError> {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| CodecError::Archive(format!("Failed to open DOCX: {}", e)))
}

fn read_document_xml(bytes: &[u8]) -> Result<String, CodecError> {
    let mut archive = open_archive(bytes)?;
    let mut part = archive
        .by_name(DOCUMENT_PART)
        .map_err(|_| CodecError::MissingPart(DOCUMENT_PART.to_string()))?;

    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|_| CodecError::Encoding)?;
    Ok(xml)
}

struct ParagraphScan {
    units: Vec<TextUnit>,
    /// Paragraphs that contain other paragraphs (text boxes and the like).
    has_nested: HashSet<usize>,
}

fn push_reference(target: &mut String, name: &str) {
    if let Some(c) = name
        .strip_prefix('#')
        .and_then(|n| match n.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => n.parse().ok(),
        })
        .and_then(char::from_u32)
    {
        target.push(c);
    } else if let Some(s) = quick_xml::escape::resolve_predefined_entity(name) {
        target.push_str(s);
    }
}

fn scan_paragraphs(xml: &str) -> Result<ParagraphScan, CodecError> {
    let mut reader = Reader::from_str(xml);

    let mut units: Vec<TextUnit> = Vec::new();
    let mut has_nested = HashSet::new();
    let mut open: Vec<usize> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"p" => {
                    if let Some(&parent) = open.last() {
                        has_nested.insert(parent);
                    }
                    let index = units.len();
                    units.push(TextUnit {
                        index,
                        text: String::new(),
                    });
                    open.push(index);
                }
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"p" {
                    if let Some(&parent) = open.last() {
                        has_nested.insert(parent);
                    }
                    let index = units.len();
                    units.push(TextUnit {
                        index,
                        text: String::new(),
                    });
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"p" => {
                    open.pop();
                }
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Some(&current) = open.last() {
                        let decoded = e.decode().unwrap_or_default();
                        units[current].text.push_str(&decoded);
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text {
                    if let Some(&current) = open.last() {
                        let name = e.decode().unwrap_or_default();
                        push_reference(&mut units[current].text, &name);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CodecError::Xml(format!(
                    "error at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(ParagraphScan { units, has_nested })
}

/// Where the rewriter is inside a corrected paragraph.
enum ChildMode {
    /// Paragraph properties are copied through.
    Copy,
    /// Original runs and other content are dropped.
    Skip,
}

struct Rewrite {
    prefix: String,
    text: String,
    depth: usize,
    mode: ChildMode,
    child_is_run: bool,
    /// Events of the first `w:rPr` seen, replayed on the new run.
    run_props: Vec<Event<'static>>,
    capturing_props: bool,
    props_done: bool,
}

impl Rewrite {
    fn new(start: &BytesStart<'_>, text: String) -> Self {
        let prefix = start
            .name()
            .prefix()
            .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned())
            .unwrap_or_default();
        Self {
            prefix,
            text,
            depth: 0,
            mode: ChildMode::Skip,
            child_is_run: false,
            run_props: Vec::new(),
            capturing_props: false,
            props_done: false,
        }
    }

    /// True for the first run property block directly inside a dropped run.
    fn wants_run_props(&self, depth: usize, local: &[u8]) -> bool {
        depth == 1 && self.child_is_run && !self.props_done && local == b"rPr"
    }

    fn qualified(&self, local: &str) -> String {
        if self.prefix.is_empty() {
            local.to_string()
        } else {
            format!("{}:{}", self.prefix, local)
        }
    }

    fn write_run<W: Write>(&self, writer: &mut Writer<W>) -> Result<(), CodecError> {
        let run = self.qualified("r");
        let text_tag = self.qualified("t");

        writer.write_event(Event::Start(BytesStart::new(run.as_str())))?;
        for event in &self.run_props {
            writer.write_event(event.borrow())?;
        }
        let mut t = BytesStart::new(text_tag.as_str());
        t.push_attribute(("xml:space", "preserve"));
        writer.write_event(Event::Start(t))?;
        writer.write_event(Event::Text(BytesText::new(&self.text)))?;
        writer.write_event(Event::End(BytesEnd::new(text_tag.as_str())))?;
        writer.write_event(Event::End(BytesEnd::new(run.as_str())))?;
        Ok(())
    }
}

fn rewrite_document_xml(
    xml: &str,
    replacements: &BTreeMap<usize, String>,
) -> Result<String, CodecError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));

    let mut next_index = 0usize;
    let mut active: Option<Rewrite> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CodecError::Xml(e.to_string()))?;

        if let Event::Eof = event {
            break;
        }

        if let Some(rw) = active.as_mut() {
            match &event {
                Event::Start(e) => {
                    if rw.depth == 0 {
                        rw.mode = if e.local_name().as_ref() == b"pPr" {
                            ChildMode::Copy
                        } else {
                            ChildMode::Skip
                        };
                        rw.child_is_run = e.local_name().as_ref() == b"r";
                    }
                    if rw.wants_run_props(rw.depth, e.local_name().as_ref()) {
                        rw.capturing_props = true;
                    }
                    rw.depth += 1;
                }
                Event::End(e) => {
                    if rw.depth == 0 {
                        // Closing tag of the paragraph itself.
                        rw.write_run(&mut writer)?;
                        writer.write_event(event.borrow())?;
                        active = None;
                        continue;
                    }
                    rw.depth -= 1;
                    if rw.capturing_props && rw.depth == 1 && e.local_name().as_ref() == b"rPr" {
                        rw.run_props.push(event.clone().into_owned());
                        rw.capturing_props = false;
                        rw.props_done = true;
                        continue;
                    }
                }
                Event::Empty(e) => {
                    if rw.depth == 0 {
                        rw.mode = if e.local_name().as_ref() == b"pPr" {
                            ChildMode::Copy
                        } else {
                            ChildMode::Skip
                        };
                        rw.child_is_run = false;
                    }
                    if rw.wants_run_props(rw.depth, e.local_name().as_ref()) {
                        rw.run_props.push(event.clone().into_owned());
                        rw.props_done = true;
                        continue;
                    }
                }
                _ => {}
            }

            if rw.capturing_props {
                rw.run_props.push(event.into_owned());
                continue;
            }
            let copy = rw.depth > 0 || matches!(event, Event::End(_) | Event::Empty(_));
            if copy && matches!(rw.mode, ChildMode::Copy) {
                writer.write_event(event)?;
            }
            continue;
        }

        match &event {
            Event::Start(e) if e.local_name().as_ref() == b"p" => {
                let index = next_index;
                next_index += 1;
                writer.write_event(event.borrow())?;
                if let Some(text) = replacements.get(&index) {
                    active = Some(Rewrite::new(e, text.clone()));
                }
            }
            Event::Empty(e) if e.local_name().as_ref() == b"p" => {
                let index = next_index;
                next_index += 1;
                match replacements.get(&index) {
                    Some(text) => {
                        let rw = Rewrite::new(e, text.clone());
                        writer.write_event(Event::Start(e.clone()))?;
                        rw.write_run(&mut writer)?;
                        writer.write_event(Event::End(e.to_end()))?;
                    }
                    None => writer.write_event(event.borrow())?,
                }
            }
            _ => writer.write_event(event)?,
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|_| CodecError::Encoding)
}

/// Copies every archive entry, swapping in the rewritten document part.
fn repack(original: &[u8], document_xml: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut archive = open_archive(original)?;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| CodecError::Archive(e.to_string()))?;
        let name = entry.name().to_string();

        if entry.is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|e| CodecError::Archive(e.to_string()))?;
            continue;
        }

        writer
            .start_file(name.as_str(), options)
            .map_err(|e| CodecError::Archive(e.to_string()))?;
        if name == DOCUMENT_PART {
            writer.write_all(document_xml)?;
        } else {
            std::io::copy(&mut entry, &mut writer)?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|e| CodecError::Archive(e.to_string()))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ai::SuggestionCategory;

    const BODY_OPEN: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>"#;
    const BODY_CLOSE: &str = "<w:sectPr/></w:body></w:document>";

    /// Builds a minimal DOCX archive around the given `w:body` content.
    pub(crate) fn build_docx(body: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("[Content_Types].xml", options).unwrap();
        writer
            .write_all(br#"<?xml version="1.0"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#)
            .unwrap();
        writer.start_file(DOCUMENT_PART, options).unwrap();
        writer
            .write_all(format!("{}{}{}", BODY_OPEN, body, BODY_CLOSE).as_bytes())
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn fix(unit_index: usize, offset: usize, original: &str, replacement: &str) -> Suggestion {
        Suggestion {
            unit_index,
            offset,
            original: original.to_string(),
            replacement: replacement.to_string(),
            category: SuggestionCategory::Spelling,
            explanation: String::new(),
        }
    }

    #[test]
    fn test_parse_paragraphs() {
        let docx = build_docx(
            r#"<w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p><w:p/><w:p><w:r><w:t>Fish &amp; chips</w:t></w:r></w:p>"#,
        );
        let units = DocxCodec::new().parse(&docx).unwrap();
        let texts: Vec<&str> = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello world", "", "Fish & chips"]);
        assert_eq!(units[2].index, 2);
    }

    #[test]
    fn test_parse_resolves_character_and_entity_references() {
        let docx = build_docx(
            r#"<w:p><w:r><w:t>caf&#233; &lt;b&gt; &#x2014; a&quot;b</w:t></w:r></w:p>"#,
        );
        let units = DocxCodec::new().parse(&docx).unwrap();
        assert_eq!(units[0].text, "caf\u{e9} <b> \u{2014} a\"b");
    }

    #[test]
    fn test_parse_rejects_non_zip() {
        assert!(matches!(
            DocxCodec::new().parse(b"plain text"),
            Err(CodecError::Archive(_))
        ));
    }

    #[test]
    fn test_parse_requires_document_part() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(
            DocxCodec::new().parse(&bytes),
            Err(CodecError::MissingPart(_))
        ));
    }

    #[test]
    fn test_integrate_rewrites_only_corrected_paragraphs() {
        let docx = build_docx(
            r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:rPr><w:b/></w:rPr><w:t>Teh </w:t></w:r><w:r><w:t>title</w:t></w:r></w:p><w:p><w:r><w:t>Untouched text</w:t></w:r></w:p>"#,
        );
        let codec = DocxCodec::new();
        let out = codec.integrate(&docx, &[fix(0, 0, "Teh", "The")]).unwrap();

        let units = codec.parse(&out).unwrap();
        assert_eq!(units[0].text, "The title");
        assert_eq!(units[1].text, "Untouched text");

        let xml = read_document_xml(&out).unwrap();
        assert!(xml.contains(r#"<w:jc w:val="center"/>"#));
        assert!(xml.contains("<w:r><w:rPr><w:b/></w:rPr><w:t xml:space=\"preserve\">The title</w:t></w:r>"));
        assert!(xml.contains("<w:p><w:r><w:t>Untouched text</w:t></w:r></w:p>"));
    }

    #[test]
    fn test_integrate_escapes_replacement_text() {
        let docx = build_docx(r#"<w:p><w:r><w:t>salt and pepper</w:t></w:r></w:p>"#);
        let codec = DocxCodec::new();
        let out = codec.integrate(&docx, &[fix(0, 5, "and", "&")]).unwrap();
        assert_eq!(codec.parse(&out).unwrap()[0].text, "salt & pepper");
    }

    #[test]
    fn test_integrate_without_changes_returns_original() {
        let docx = build_docx(r#"<w:p><w:r><w:t>clean</w:t></w:r></w:p>"#);
        let out = DocxCodec::new()
            .integrate(&docx, &[fix(0, 0, "dirty", "clean")])
            .unwrap();
        assert_eq!(out, docx);
    }

    #[test]
    fn test_integrate_keeps_other_parts() {
        let docx = build_docx(r#"<w:p><w:r><w:t>teh</w:t></w:r></w:p>"#);
        let out = DocxCodec::new()
            .integrate(&docx, &[fix(0, 0, "teh", "the")])
            .unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(out.as_slice())).unwrap();
        assert!(archive.by_name("[Content_Types].xml").is_ok());
    }
}
