//! File sets.
//!
//! A [`FileSet`] walks one [`FileSequence`], opening each file in turn. An
//! optional new-file hook may rewrite the next filename before it is
//! opened (used to redirect sequences at run time). The set owns every
//! handle it produces until the consuming source takes it over.

use crate::parser::{ParserRegistry, ReadSeek};
use crate::pattern::FileSequence;
use crate::source::SequentialSource;
use crate::wrapping::{select_wrapping, WrapType};
use mxfkit_core::ul::UL;
use mxfkit_core::{EssenceError, Result};
use std::fs::File;
use std::path::PathBuf;

/// Hook invoked with the next path before it is opened; may rewrite it.
pub type NewFileHook = Box<dyn FnMut(PathBuf) -> PathBuf>;

/// Iterator over the files of one sequence.
pub struct FileSet {
    sequence: FileSequence,
    /// Index of the next file to open.
    next_index: u32,
    new_file_hook: Option<NewFileHook>,
}

impl FileSet {
    /// Create a file set over a sequence.
    pub fn new(sequence: FileSequence) -> Self {
        FileSet {
            sequence,
            next_index: 0,
            new_file_hook: None,
        }
    }

    /// Install a hook that may rewrite each filename before opening.
    pub fn set_new_file_hook(&mut self, hook: NewFileHook) {
        self.new_file_hook = Some(hook);
    }

    /// The sequence this set walks.
    pub fn sequence(&self) -> &FileSequence {
        &self.sequence
    }

    /// True once every file has been opened.
    pub fn is_last_file(&self) -> bool {
        self.next_index >= self.sequence.len()
    }

    /// Open the next file in the sequence, or `None` when exhausted.
    pub fn next_file(&mut self) -> Result<Option<(PathBuf, Box<dyn ReadSeek>)>> {
        let Some(mut path) = self.sequence.path_at(self.next_index) else {
            return Ok(None);
        };
        self.next_index += 1;

        if let Some(hook) = self.new_file_hook.as_mut() {
            path = hook(path);
        }

        let file = File::open(&path)?;
        Ok(Some((path, Box::new(file))))
    }

    /// Identify the essence in the first file and build a sequential source
    /// over the whole set.
    ///
    /// `requested_ul` / `requested_type` choose among the wrapping options
    /// the parser advertises (see [`select_wrapping`]).
    pub fn into_source(
        mut self,
        registry: &ParserRegistry,
        requested_ul: Option<&UL>,
        requested_type: WrapType,
    ) -> Result<SequentialSource> {
        let Some((path, mut file)) = self.next_file()? else {
            return Err(EssenceError::BadPattern("file set is empty".into()).into());
        };
        let path_str = path.display().to_string();

        let (mut parser, descriptors) = registry.identify(file.as_mut(), &path_str)?;
        let descriptor = &descriptors[0];
        let options = parser.identify_wrapping_options(file.as_mut(), descriptor);
        let Some(wrapping) = select_wrapping(&options, requested_ul, requested_type) else {
            return Err(EssenceError::UnsupportedWrapping {
                wrapping: format!("{:?}", requested_type),
                parser: parser.name(),
            }
            .into());
        };
        let wrapping = wrapping.clone();
        let stream = descriptor.id;

        SequentialSource::new(parser, file, self, stream, wrapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::FilePattern;
    use std::io::Write;

    #[test]
    fn test_walks_sequence_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in 3..6 {
            let path = dir.path().join(format!("part{:02}.bin", i));
            std::fs::File::create(path)
                .unwrap()
                .write_all(&[i as u8])
                .unwrap();
        }

        let pattern = format!("{}/part%02d.bin@3-5", dir.path().display());
        let parsed = FilePattern::parse(&pattern).unwrap();
        let mut set = FileSet::new(parsed.master);

        let mut seen = Vec::new();
        while let Some((path, _file)) = set.next_file().unwrap() {
            seen.push(path.file_name().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(seen, vec!["part03.bin", "part04.bin", "part05.bin"]);
        assert!(set.is_last_file());
    }

    #[test]
    fn test_new_file_hook_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("actual.bin");
        std::fs::File::create(&real).unwrap();

        let mut set = FileSet::new(FileSequence::single(
            dir.path().join("missing.bin").display().to_string(),
        ));
        let real_clone = real.clone();
        set.set_new_file_hook(Box::new(move |_| real_clone.clone()));

        let (path, _file) = set.next_file().unwrap().unwrap();
        assert_eq!(path, real);
    }

    #[test]
    fn test_missing_file_errors() {
        let mut set = FileSet::new(FileSequence::single("/nonexistent/file.bin"));
        assert!(set.next_file().is_err());
    }
}
