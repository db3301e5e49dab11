/*
 * guerrilla - SMTP mail receiving daemon
 * Copyright (C) 2024 The guerrilla developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use mail_parser::{MessageParser, MimeHeaders};

/// Error while decoding or dumping message content.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// The bytes could not be parsed as a message.
    #[error("message could not be parsed")]
    Unparsable,
    /// `save_parts` was called before `parse_content`.
    #[error("content has not been parsed")]
    NotParsed,
    /// Filesystem error while dumping parts.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Attachment file name, or a generated placeholder.
    pub name: String,
    /// Declared content type.
    pub content_type: String,
    /// Decoded bytes.
    pub data: Vec<u8>,
}

/// The decoded MIME content of a message.
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// First text/plain body, transfer-decoding applied.
    pub text: Option<String>,
    /// First text/html body, transfer-decoding applied.
    pub html: Option<String>,
    /// Decoded attachments.
    pub attachments: Vec<Attachment>,
}

impl Content {
    /// Decode the MIME structure of a raw message.
    ///
    /// # Errors
    ///
    /// * [`ContentError::Unparsable`]
    pub fn parse(data: &[u8]) -> Result<Self, ContentError> {
        let message = MessageParser::default()
            .parse(data)
            .ok_or(ContentError::Unparsable)?;

        let attachments = message
            .attachments()
            .enumerate()
            .map(|(i, part)| Attachment {
                name: part
                    .attachment_name()
                    .map_or_else(|| format!("part-{i}"), |name| name.to_owned()),
                content_type: part.content_type().map_or_else(
                    || "application/octet-stream".to_owned(),
                    |ct| {
                        ct.subtype()
                            .map_or_else(|| ct.ctype().to_owned(), |sub| format!("{}/{sub}", ct.ctype()))
                    },
                ),
                data: part.contents().to_vec(),
            })
            .collect();

        Ok(Self {
            text: message.body_text(0).map(|t| t.into_owned()),
            html: message.body_html(0).map(|t| t.into_owned()),
            attachments,
        })
    }

    /// Write every decoded part below `dir`, named after `queued_id`.
    /// Returns the written paths.
    ///
    /// # Errors
    ///
    /// * filesystem errors creating the directory or writing a part
    pub async fn save_parts(
        &self,
        dir: &std::path::Path,
        queued_id: &str,
    ) -> Result<Vec<std::path::PathBuf>, ContentError> {
        tokio::fs::create_dir_all(dir).await?;

        let mut paths = Vec::new();
        if let Some(text) = &self.text {
            let path = dir.join(format!("{queued_id}.txt"));
            tokio::fs::write(&path, text).await?;
            paths.push(path);
        }
        if let Some(html) = &self.html {
            let path = dir.join(format!("{queued_id}.html"));
            tokio::fs::write(&path, html).await?;
            paths.push(path);
        }
        for (i, attachment) in self.attachments.iter().enumerate() {
            let path = dir.join(format!("{queued_id}-{i}-{}", sanitize(&attachment.name)));
            tokio::fs::write(&path, &attachment.data).await?;
            paths.push(path);
        }
        Ok(paths)
    }
}

// File names come from the wire; keep only a safe subset.
fn sanitize(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "unnamed".to_owned()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::Content;

    const SIMPLE: &[u8] =
        b"From: a@b.example\r\nSubject: hi\r\nContent-Type: text/plain\r\n\r\nHello there\r\n";

    #[test]
    fn parses_a_plain_message() {
        let content = Content::parse(SIMPLE).unwrap();
        assert!(content.text.as_deref().unwrap().starts_with("Hello there"));
        assert!(content.attachments.is_empty());
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(super::sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(super::sanitize(""), "unnamed");
    }

    #[tokio::test]
    async fn save_parts_writes_the_text_body() {
        let dir = std::env::temp_dir().join(format!("guerrilla-content-{}", std::process::id()));
        let content = Content::parse(SIMPLE).unwrap();
        let paths = content.save_parts(&dir, "deadbeef").await.unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("deadbeef.txt"));
        let written = tokio::fs::read_to_string(&paths[0]).await.unwrap();
        assert!(written.starts_with("Hello there"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
