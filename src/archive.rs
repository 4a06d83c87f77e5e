//! Archive layer
//!
//! Converts between [FileTree]s and their on-disk forms: EPUB (zip) containers
//! and unpacked directories. Written containers start with the `mimetype` entry,
//! stored without compression, as OCF requires.

use std::{
    fs::{self, File},
    io::{self, BufReader, Read, Seek, Write},
    path::{Component, Path},
};

use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::FileOptions};

use crate::{error::DistributorError, types::FileTree};

const MIMETYPE: &str = "mimetype";

impl FileTree {
    /// Reads every file entry of a zip container
    pub fn from_epub_reader<R: Read + Seek>(reader: R) -> Result<Self, DistributorError> {
        let mut archive = ZipArchive::new(reader)?;
        let mut tree = FileTree::new();

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }

            let name = file.name().to_string();
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)?;
            tree.insert(&name, buffer);
        }

        Ok(tree)
    }

    /// Reads an EPUB file from disk
    pub fn read_epub<P: AsRef<Path>>(path: P) -> Result<Self, DistributorError> {
        let file = File::open(path)?;
        Self::from_epub_reader(BufReader::new(file))
    }

    /// Writes the tree as a zip container and returns the inner writer
    ///
    /// `mimetype` is written first and stored, every other entry is deflated.
    pub fn write_epub_to<W: Write + Seek>(&self, writer: W) -> Result<W, DistributorError> {
        let mut zip = ZipWriter::new(writer);
        let stored = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
        let deflated = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

        if let Some(mimetype) = self.get(MIMETYPE) {
            zip.start_file(MIMETYPE.to_string(), stored)?;
            zip.write_all(mimetype)?;
        }

        for (path, content) in self.iter().filter(|(path, _)| *path != MIMETYPE) {
            zip.start_file(path.to_string(), deflated)?;
            zip.write_all(content)?;
        }

        Ok(zip.finish()?)
    }

    /// Writes the tree as an EPUB file, creating missing parent directories
    pub fn write_epub<P: AsRef<Path>>(&self, path: P) -> Result<(), DistributorError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        self.write_epub_to(file)?;
        Ok(())
    }

    /// Reads an unpacked book, in file name order
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, DistributorError> {
        let dir = dir.as_ref();
        let mut tree = FileTree::new();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative_path = entry.path().strip_prefix(dir).map_err(|_| {
                DistributorError::ResourceNotFound {
                    resource: entry.path().to_string_lossy().to_string(),
                }
            })?;
            let target_path = relative_path.to_string_lossy().replace('\\', "/");

            tree.insert(&target_path, fs::read(entry.path())?);
        }

        Ok(tree)
    }

    /// Writes every file of the tree below `dir`
    ///
    /// Paths that would escape `dir` are refused before anything is written.
    pub fn write_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), DistributorError> {
        let dir = dir.as_ref();

        if let Some(path) = self.paths().find(|path| !is_enclosed(path)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path \"{}\" escapes the output directory", path),
            )
            .into());
        }

        for (path, content) in self.iter() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }

        Ok(())
    }
}

fn is_enclosed(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use zip::{CompressionMethod, ZipArchive};

    use crate::{error::DistributorError, types::FileTree};

    fn book() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("META-INF/container.xml", b"<container/>".to_vec());
        tree.insert("OEBPS/Text/cap_01.xhtml", "<p>Capítulo ▲</p>".as_bytes().to_vec());
        tree.insert("OEBPS/content.opf", b"<package/>".to_vec());
        tree.insert("mimetype", b"application/epub+zip".to_vec());
        tree
    }

    /// `mimetype` comes first and is stored even when it is not first in the tree
    #[test]
    fn test_write_epub_mimetype_first() {
        let cursor = book().write_epub_to(Cursor::new(Vec::new())).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(cursor.into_inner())).unwrap();

        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        drop(first);

        let chapter = archive.by_name("OEBPS/Text/cap_01.xhtml").unwrap();
        assert_eq!(chapter.compression(), CompressionMethod::Deflated);
    }

    #[test]
    fn test_epub_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out/book/book.epub");

        let tree = book();
        tree.write_epub(&path).unwrap();

        let read = FileTree::read_epub(&path).unwrap();
        assert_eq!(read, tree);
        assert_eq!(read.paths().next(), Some("mimetype"));
    }

    #[test]
    fn test_dir_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();

        let tree = book();
        tree.write_dir(temp_dir.path()).unwrap();

        let read = FileTree::from_dir(temp_dir.path()).unwrap();
        assert_eq!(read, tree);
        assert_eq!(
            read.paths().collect::<Vec<_>>(),
            vec![
                "META-INF/container.xml",
                "OEBPS/Text/cap_01.xhtml",
                "OEBPS/content.opf",
                "mimetype",
            ]
        );
    }

    #[test]
    fn test_write_dir_refuses_escaping_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("book");

        let mut tree = book();
        tree.insert("OEBPS/../../evil.txt", b"x".to_vec());

        let result = tree.write_dir(&target);
        assert!(matches!(result, Err(DistributorError::IOError { .. })));
        assert!(!target.exists());
    }

    #[test]
    fn test_read_invalid_epub() {
        let result = FileTree::from_epub_reader(Cursor::new(b"not a zip".to_vec()));
        assert!(matches!(result, Err(DistributorError::ArchiveError { .. })));
    }
}
