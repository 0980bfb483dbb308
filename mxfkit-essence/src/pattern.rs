//! File-name patterns.
//!
//! Source material is named with a small pattern language, parsed once at
//! the boundary into a typed [`FilePattern`]:
//!
//! - `name.ext`: a single file
//! - `!name.ext`: a single file flagged as external essence (referenced,
//!   not inlined, by the body writer)
//! - `name%04d.ext@10-25`: a numbered sequence from 10 to 25
//! - `name%04d.ext@10/16`: the same sequence given as start and count
//! - patterns joined with `&` attach sub-streams to the master

use mxfkit_core::{EssenceError, Result};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Role of a file within a body stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// The master stream of a body stream.
    Master,
    /// A sub-stream slaved to the master.
    SubStream,
}

/// One file, or one numbered run of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSequence {
    /// Name template, possibly containing one `%d` / `%0Nd` field.
    pub template: String,
    /// True when the essence is to be referenced rather than inlined.
    pub external: bool,
    /// First number substituted into the template.
    pub start: u32,
    /// Number of files, or `None` for a single un-numbered file.
    pub count: Option<u32>,
}

impl FileSequence {
    /// A single plain file.
    pub fn single(name: impl Into<String>) -> Self {
        FileSequence {
            template: name.into(),
            external: false,
            start: 0,
            count: None,
        }
    }

    /// Number of files in this sequence.
    pub fn len(&self) -> u32 {
        self.count.unwrap_or(1)
    }

    /// True if the sequence holds no files.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the `index`-th file (0-based), or `None` past the end.
    pub fn path_at(&self, index: u32) -> Option<PathBuf> {
        if index >= self.len() {
            return None;
        }
        match self.count {
            None => Some(PathBuf::from(&self.template)),
            Some(_) => Some(PathBuf::from(expand_template(
                &self.template,
                self.start + index,
            ))),
        }
    }
}

/// A parsed file pattern: one master sequence plus its sub-streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePattern {
    /// The master stream's files.
    pub master: FileSequence,
    /// Files for each attached sub-stream.
    pub sub_streams: Vec<FileSequence>,
}

impl FilePattern {
    /// Parse the pattern language.
    pub fn parse(pattern: &str) -> Result<FilePattern> {
        if pattern.is_empty() {
            return Err(EssenceError::BadPattern("empty pattern".into()).into());
        }

        let mut parts = pattern.split('&');
        let master = parse_sequence(parts.next().unwrap())?;
        let sub_streams = parts.map(parse_sequence).collect::<Result<Vec<_>>>()?;

        Ok(FilePattern {
            master,
            sub_streams,
        })
    }

    /// Iterate the sequences with their roles, master first.
    pub fn sequences(&self) -> impl Iterator<Item = (&FileSequence, FileRole)> {
        std::iter::once((&self.master, FileRole::Master)).chain(
            self.sub_streams
                .iter()
                .map(|s| (s, FileRole::SubStream)),
        )
    }
}

fn parse_sequence(text: &str) -> Result<FileSequence> {
    let text = text.trim();
    if text.is_empty() {
        return Err(EssenceError::BadPattern("empty sequence".into()).into());
    }

    let (external, text) = match text.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let Some((template, range)) = text.split_once('@') else {
        if has_number_field(text) {
            return Err(
                EssenceError::BadPattern(format!("'{}' has a number field but no @range", text))
                    .into(),
            );
        }
        return Ok(FileSequence {
            template: text.to_string(),
            external,
            start: 0,
            count: None,
        });
    };

    if !has_number_field(template) {
        return Err(EssenceError::BadPattern(format!(
            "'{}' has an @range but no %d number field",
            template
        ))
        .into());
    }

    let bad = |msg: &str| EssenceError::BadPattern(format!("'{}': {}", range, msg));

    let (start, count) = if let Some((start, count)) = range.split_once('/') {
        let start: u32 = start.parse().map_err(|_| bad("bad start number"))?;
        let count: u32 = count.parse().map_err(|_| bad("bad item count"))?;
        (start, count)
    } else if let Some((start, end)) = range.split_once('-') {
        let start: u32 = start.parse().map_err(|_| bad("bad start number"))?;
        let end: u32 = end.parse().map_err(|_| bad("bad end number"))?;
        if end < start {
            return Err(bad("end before start").into());
        }
        (start, end - start + 1)
    } else {
        return Err(bad("expected start-end or start/count").into());
    };

    Ok(FileSequence {
        template: template.to_string(),
        external,
        start,
        count: Some(count),
    })
}

/// Does the template contain a `%d` / `%0Nd` number field?
fn has_number_field(template: &str) -> bool {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'd' {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Substitute `number` into the template's `%d` / `%0Nd` field.
fn expand_template(template: &str, number: u32) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len() + 8);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'd' {
                let width: usize = template[i + 1..j].parse().unwrap_or(0);
                let _ = write!(out, "{:0width$}", number, width = width);
                i = j + 1;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file() {
        let pattern = FilePattern::parse("video.m2v").unwrap();
        assert_eq!(pattern.master, FileSequence::single("video.m2v"));
        assert!(pattern.sub_streams.is_empty());
        assert_eq!(
            pattern.master.path_at(0),
            Some(PathBuf::from("video.m2v"))
        );
        assert!(pattern.master.path_at(1).is_none());
    }

    #[test]
    fn test_external_flag() {
        let pattern = FilePattern::parse("!audio.wav").unwrap();
        assert!(pattern.master.external);
        assert_eq!(pattern.master.template, "audio.wav");
    }

    #[test]
    fn test_numbered_range() {
        let pattern = FilePattern::parse("reel%04d.m2v@7-9").unwrap();
        let master = &pattern.master;
        assert_eq!(master.len(), 3);
        assert_eq!(master.path_at(0), Some(PathBuf::from("reel0007.m2v")));
        assert_eq!(master.path_at(2), Some(PathBuf::from("reel0009.m2v")));
        assert!(master.path_at(3).is_none());
    }

    #[test]
    fn test_numbered_count() {
        let pattern = FilePattern::parse("reel%d.m2v@3/2").unwrap();
        assert_eq!(pattern.master.path_at(0), Some(PathBuf::from("reel3.m2v")));
        assert_eq!(pattern.master.path_at(1), Some(PathBuf::from("reel4.m2v")));
        assert!(pattern.master.path_at(2).is_none());
    }

    #[test]
    fn test_sub_streams() {
        let pattern = FilePattern::parse("video.m2v&audio1.wav&!audio2.wav").unwrap();
        assert_eq!(pattern.sub_streams.len(), 2);
        assert!(pattern.sub_streams[1].external);

        let roles: Vec<FileRole> = pattern.sequences().map(|(_, role)| role).collect();
        assert_eq!(
            roles,
            vec![FileRole::Master, FileRole::SubStream, FileRole::SubStream]
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(FilePattern::parse("").is_err());
        assert!(FilePattern::parse("reel%04d.m2v").is_err()); // field, no range
        assert!(FilePattern::parse("reel.m2v@1-5").is_err()); // range, no field
        assert!(FilePattern::parse("reel%d.m2v@9-3").is_err()); // end before start
        assert!(FilePattern::parse("reel%d.m2v@x-3").is_err());
    }
}
