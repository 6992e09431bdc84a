use crate::ai::Suggestion;

use super::{apply_suggestions, group_by_unit, CodecError, DocumentCodec, DocumentFormat, TextUnit};

/// Plain text and Markdown. Each line is one unit; line endings are kept.
pub struct TextCodec;

impl TextCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(bytes: &[u8]) -> Result<&str, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Encoding)?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Splits into (line body, has trailing CR) pairs.
fn lines(text: &str) -> impl Iterator<Item = (&str, bool)> {
    text.split('\n').map(|line| match line.strip_suffix('\r') {
        Some(body) => (body, true),
        None => (line, false),
    })
}

impl DocumentCodec for TextCodec {
    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Text)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<TextUnit>, CodecError> {
        let text = decode(bytes)?;
        Ok(lines(text)
            .enumerate()
            .map(|(index, (body, _))| TextUnit {
                index,
                text: body.to_string(),
            })
            .collect())
    }

    fn integrate(&self, original: &[u8], suggestions: &[Suggestion]) -> Result<Vec<u8>, CodecError> {
        let text = decode(original)?;
        let grouped = group_by_unit(suggestions);

        let mut out = String::with_capacity(text.len());
        for (index, (body, cr)) in lines(text).enumerate() {
            if index > 0 {
                out.push('\n');
            }
            match grouped.get(&index) {
                Some(list) => out.push_str(&apply_suggestions(body, list)),
                None => out.push_str(body),
            }
            if cr {
                out.push('\r');
            }
        }
        Ok(out.into_bytes())
    }
}
