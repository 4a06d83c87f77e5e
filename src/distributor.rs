//! Distributor
//!
//! Produces one marked and verified copy of a book per distribution platform.
//!
//! For every [PlatformProfile] the distributor clones the book, writes the
//! metadata into its package document, takes that edited tree as the baseline,
//! places the platform markers and verifies the result against the baseline.
//! Variants are independent: they run in parallel, each on its own copy of the
//! tree and with its own random source, and a failure only discards its variant.
//!
//! ## Usage
//!
//! ```rust, ignore
//! use epub_distributor::{config::DistributionConfig, distributor::Distributor, types::FileTree};
//!
//! let config = DistributionConfig::load("distribution.toml")?;
//! let record = config.extractor().extract(fields)?;
//! let book = FileTree::read_epub("book.epub")?;
//!
//! let distributor = Distributor::from_config(&config)?;
//! for variant in distributor.run(&book, &record) {
//!     match variant {
//!         Ok(variant) => println!("{}", variant.persist("output", &book_id(&record))?.display()),
//!         Err(error) => eprintln!("{}", error),
//!     }
//! }
//! ```

#[cfg(feature = "archive")]
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use crate::{
    config::DistributionConfig,
    error::{DistributorError, VariantError},
    integrity::verify,
    package::PackageDocument,
    types::{FileTree, IntegrityReport, MarkerPlacement, MetadataRecord, PlatformProfile},
    utils::{DecodeBytes, XmlReader},
    watermark::mark,
};

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// A marked and verified copy of a book for one platform
#[derive(Debug, Clone)]
pub struct PlatformVariant {
    /// Identifier of the target platform
    pub platform: String,

    /// The edited and marked book
    pub tree: FileTree,

    pub placements: Vec<MarkerPlacement>,

    /// Verification of `tree` against the edited, unmarked book
    pub report: IntegrityReport,
}

#[cfg(feature = "archive")]
impl PlatformVariant {
    /// Writes the variant to `<out_dir>/<book_id>/<platform>/<book_id>.epub`
    ///
    /// A variant whose report holds unexpected deltas is never written.
    ///
    /// # Return
    /// - `Ok(PathBuf)`: Path of the written EPUB file
    /// - `Err(DistributorError::IntegrityViolation)`: The report is not clean
    pub fn persist<P: AsRef<Path>>(
        &self,
        out_dir: P,
        book_id: &str,
    ) -> Result<PathBuf, DistributorError> {
        self.report.clone().into_result(&self.platform)?;

        let path = out_dir
            .as_ref()
            .join(book_id)
            .join(&self.platform)
            .join(format!("{}.epub", book_id));
        self.tree.write_epub(&path)?;

        info!("variant '{}' written to {}", self.platform, path.display());
        Ok(path)
    }
}

/// Runs the per-platform pipeline over a list of profiles
#[derive(Debug, Clone)]
pub struct Distributor {
    profiles: Vec<PlatformProfile>,
}

impl Distributor {
    pub fn new(profiles: Vec<PlatformProfile>) -> Self {
        Self { profiles }
    }

    /// Builds a distributor for every platform of the configuration
    pub fn from_config(config: &DistributionConfig) -> Result<Self, DistributorError> {
        Ok(Self::new(config.profiles()?))
    }

    pub fn profiles(&self) -> &[PlatformProfile] {
        &self.profiles
    }

    /// Produces every platform variant, with markers placed from OS entropy
    ///
    /// Results are returned in profile order.
    pub fn run(
        &self,
        tree: &FileTree,
        record: &MetadataRecord,
    ) -> Vec<Result<PlatformVariant, VariantError>> {
        self.run_with(tree, record, |_| StdRng::from_entropy())
    }

    /// Produces every platform variant reproducibly
    ///
    /// Each variant gets its own generator, seeded from `seed`, so the same seed
    /// always yields the same placements whatever the thread scheduling.
    pub fn run_seeded(
        &self,
        tree: &FileTree,
        record: &MetadataRecord,
        seed: u64,
    ) -> Vec<Result<PlatformVariant, VariantError>> {
        let mut master = StdRng::seed_from_u64(seed);
        let seeds = self
            .profiles
            .iter()
            .map(|_| master.r#gen::<u64>())
            .collect::<Vec<_>>();

        self.run_with(tree, record, |index| StdRng::seed_from_u64(seeds[index]))
    }

    fn run_with<F>(
        &self,
        tree: &FileTree,
        record: &MetadataRecord,
        make_rng: F,
    ) -> Vec<Result<PlatformVariant, VariantError>>
    where
        F: Fn(usize) -> StdRng + Sync,
    {
        self.profiles
            .par_iter()
            .enumerate()
            .map(|(index, profile)| {
                let mut rng = make_rng(index);
                let result = prepare_variant(tree, record, profile, &mut rng);

                match &result {
                    Ok(variant) => info!(
                        "variant '{}' ready with {} marker(s)",
                        variant.platform,
                        variant.placements.len()
                    ),
                    Err(error) => info!("variant '{}' failed: {}", profile.id, error),
                }

                result.map_err(|source| VariantError {
                    platform: profile.id.clone(),
                    source,
                })
            })
            .collect()
    }
}

/// Produces the variant of a single platform
///
/// # Return
/// - `Ok(PlatformVariant)`: The marked tree, whose report is clean
/// - `Err(DistributorError)`: Any failure of editing, marking or verification
pub fn prepare_variant<R>(
    tree: &FileTree,
    record: &MetadataRecord,
    profile: &PlatformProfile,
    rng: &mut R,
) -> Result<PlatformVariant, DistributorError>
where
    R: Rng + ?Sized,
{
    let mut edited = tree.clone();
    edit_package(&mut edited, record)?;

    let mut marked = edited.clone();
    let placements = mark(&mut marked, profile, rng)?;
    let report = verify(&edited, &marked, &placements).into_result(&profile.id)?;

    Ok(PlatformVariant {
        platform: profile.id.clone(),
        tree: marked,
        placements,
        report,
    })
}

/// Writes the metadata record into the package document of the tree
pub fn edit_package(tree: &mut FileTree, record: &MetadataRecord) -> Result<(), DistributorError> {
    let package_path = locate_package(tree)?;
    let content = tree
        .get(&package_path)
        .ok_or_else(|| DistributorError::ResourceNotFound {
            resource: package_path.clone(),
        })?;

    let package = PackageDocument::from_bytes(content)
        .and_then(|document| document.apply_metadata(record))
        .map_err(|error| match error {
            DistributorError::MalformedPackage { reason, .. } => {
                DistributorError::MalformedPackage {
                    path: Some(package_path.clone()),
                    reason,
                }
            }
            error => error,
        })?;
    tree.replace(&package_path, package.to_bytes()?)
}

/// Finds the path of the package document
///
/// The path is read from the `rootfile` of `META-INF/container.xml`. Without a
/// usable container the first `.opf` file of the tree is used.
pub fn locate_package(tree: &FileTree) -> Result<String, DistributorError> {
    if let Some(path) = rootfile_path(tree) {
        if tree.contains(&path) {
            return Ok(path);
        }
        warn!("rootfile '{}' is missing from the book", path);
    }

    let fallback = tree
        .paths()
        .find(|path| path.to_ascii_lowercase().ends_with(".opf"))
        .ok_or_else(|| DistributorError::ResourceNotFound {
            resource: CONTAINER_PATH.to_string(),
        })?;

    warn!("no usable container, falling back to '{}'", fallback);
    Ok(fallback.to_string())
}

fn rootfile_path(tree: &FileTree) -> Option<String> {
    let container = tree.get(CONTAINER_PATH)?.decode().ok()?;
    let nodes = XmlReader::parse(&container).ok()?;

    nodes
        .iter()
        .filter_map(|node| node.as_element())
        .flat_map(|root| root.find_elements_by_name("rootfile"))
        .find_map(|rootfile| rootfile.get_attr("full-path"))
        .map(|path| path.trim_start_matches('/').to_string())
}

/// Identifier of a book in output paths
///
/// The ISBN when known, otherwise the title reduced to alphanumeric words
/// joined by underscores.
pub fn book_id(record: &MetadataRecord) -> String {
    if let Some(isbn) = record.isbn() {
        return isbn.to_string();
    }

    let id = record
        .title()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if id.is_empty() { "book".to_string() } else { id }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use crate::{
        distributor::{Distributor, book_id, edit_package, locate_package, prepare_variant},
        error::DistributorError,
        package::PackageDocument,
        types::{
            FileStatus, FileTree, InsertionPolicy, MetadataField, MetadataRecord,
            PlatformProfile, SelectionPolicy,
        },
        utils::DC_NAMESPACE,
    };

    const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

    const PACKAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Old</dc:title>
    <dc:language>pt-BR</dc:language>
  </metadata>
  <manifest/>
  <spine/>
</package>
"#;

    fn book(chapters: usize) -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("mimetype", b"application/epub+zip".to_vec());
        tree.insert("META-INF/container.xml", CONTAINER.as_bytes().to_vec());
        tree.insert("OEBPS/content.opf", PACKAGE.as_bytes().to_vec());
        for number in 1..=chapters {
            let chapter = format!(
                "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body>\n<p>Chapter {}</p>\n</body></html>",
                number
            );
            tree.insert(&format!("OEBPS/Text/cap_{:02}.xhtml", number), chapter.into_bytes());
        }
        tree
    }

    fn profile(id: &str, symbol: &str, count: usize) -> PlatformProfile {
        PlatformProfile {
            id: id.to_string(),
            symbol: symbol.to_string(),
            selection: SelectionPolicy::new(r"cap_\d+\.xhtml$", &[], count).unwrap(),
            policy: InsertionPolicy::BodyEnd {
                template: "<p>{mark}</p>\n".to_string(),
            },
        }
    }

    fn record() -> MetadataRecord {
        MetadataRecord::new("New Title")
            .unwrap()
            .with(MetadataField::Author, "A. Author")
            .with(MetadataField::Isbn, "9786558823230")
    }

    #[test]
    fn test_prepare_variant() {
        let tree = book(10);
        let variant = prepare_variant(
            &tree,
            &record(),
            &profile("amazon", "▲", 3),
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();

        assert_eq!(variant.platform, "amazon");
        assert_eq!(variant.placements.len(), 3);
        assert!(variant.report.is_clean());
        assert_eq!(variant.report.count(FileStatus::ExpectedDelta), 3);
        assert_eq!(variant.report.count(FileStatus::Unchanged), 10);

        let package = PackageDocument::from_bytes(variant.tree.get("OEBPS/content.opf").unwrap())
            .unwrap();
        assert_eq!(package.metadata_values(DC_NAMESPACE, "title"), vec!["New Title"]);
        assert_eq!(package.metadata_values(DC_NAMESPACE, "creator"), vec!["A. Author"]);

        // the source tree is never touched
        assert_eq!(tree, book(10));
    }

    /// A failing profile is reported on its own and the others still succeed
    #[test]
    fn test_run_isolates_failures() {
        let distributor = Distributor::new(vec![
            profile("amazon", "▲", 3),
            profile("apple", "▼", 20),
            profile("google", "●", 2),
        ]);

        let results = distributor.run(&book(5), &record());
        assert_eq!(results.len(), 3);

        let amazon = results[0].as_ref().unwrap();
        assert_eq!(amazon.platform, "amazon");
        assert_eq!(amazon.placements.len(), 3);

        let apple = results[1].as_ref().unwrap_err();
        assert_eq!(apple.platform, "apple");
        assert_eq!(
            apple.source,
            DistributorError::InsufficientEligibleFiles {
                pattern: r"cap_\d+\.xhtml$".to_string(),
                eligible: 5,
                required: 20,
            }
        );

        let google = results[2].as_ref().unwrap();
        assert_eq!(google.placements.len(), 2);
        assert!(google.placements.iter().all(|p| p.symbol == "●"));
    }

    #[test]
    fn test_run_seeded_is_reproducible() {
        let distributor = Distributor::new(vec![profile("amazon", "▲", 3), profile("apple", "▼", 3)]);
        let tree = book(10);

        let paths = |seed| {
            distributor
                .run_seeded(&tree, &record(), seed)
                .into_iter()
                .map(|variant| {
                    variant
                        .unwrap()
                        .placements
                        .into_iter()
                        .map(|p| p.path)
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(paths(11), paths(11));
    }

    #[test]
    fn test_missing_metadata_block_aborts_variant() {
        let mut tree = book(5);
        tree.insert(
            "OEBPS/content.opf",
            b"<package xmlns=\"http://www.idpf.org/2007/opf\"><manifest/></package>".to_vec(),
        );

        let results = Distributor::new(vec![profile("binpar", "◆", 3)]).run(&tree, &record());
        let error = results[0].as_ref().unwrap_err();
        assert_eq!(
            error.source,
            DistributorError::MalformedPackage {
                path: Some("OEBPS/content.opf".to_string()),
                reason: "no <metadata> element in the OPF namespace".to_string(),
            }
        );
        assert_eq!(error.source.path(), Some("OEBPS/content.opf"));
    }

    /// A package document that is not UTF-8 is refused instead of rewritten
    #[test]
    fn test_edit_package_refuses_latin1() {
        let mut tree = book(1);
        let (head, tail) = PACKAGE.split_once("<dc:language>").unwrap();
        let latin1 = [
            head.as_bytes(),
            b"<dc:rights>\xa9 Editora</dc:rights>\n    <dc:language>".as_slice(),
            tail.as_bytes(),
        ]
        .concat();
        tree.insert("OEBPS/content.opf", latin1.clone());

        let result = edit_package(&mut tree, &record());
        assert!(matches!(result, Err(DistributorError::Utf8DecodeError { .. })));
        assert_eq!(tree.get("OEBPS/content.opf"), Some(latin1.as_slice()));
    }

    #[test]
    fn test_locate_package() {
        assert_eq!(locate_package(&book(1)).unwrap(), "OEBPS/content.opf");

        let mut tree = FileTree::new();
        tree.insert("mimetype", b"application/epub+zip".to_vec());
        tree.insert("book/package.OPF", PACKAGE.as_bytes().to_vec());
        assert_eq!(locate_package(&tree).unwrap(), "book/package.OPF");

        let mut tree = FileTree::new();
        tree.insert("mimetype", b"application/epub+zip".to_vec());
        assert_eq!(
            locate_package(&tree).unwrap_err(),
            DistributorError::ResourceNotFound {
                resource: "META-INF/container.xml".to_string()
            }
        );
    }

    #[test]
    fn test_book_id() {
        assert_eq!(book_id(&record()), "9786558823230");

        let record = MetadataRecord::new("Terapia & Mente: uma abordagem").unwrap();
        assert_eq!(book_id(&record), "Terapia_Mente_uma_abordagem");
    }

    #[cfg(feature = "archive")]
    #[test]
    fn test_persist_clean_variant_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let record = record();
        let results = Distributor::new(vec![profile("amazon", "▲", 3)]).run(&book(4), &record);
        let mut variant = results.into_iter().next().unwrap().unwrap();

        let path = variant.persist(temp_dir.path(), &book_id(&record)).unwrap();
        assert_eq!(
            path,
            temp_dir
                .path()
                .join("9786558823230/amazon/9786558823230.epub")
        );
        assert_eq!(FileTree::read_epub(&path).unwrap(), variant.tree);

        variant.report.files[0].status = FileStatus::UnexpectedDelta;
        let result = variant.persist(temp_dir.path().join("dirty"), "id");
        assert!(matches!(
            result,
            Err(DistributorError::IntegrityViolation { .. })
        ));
        assert!(!temp_dir.path().join("dirty").exists());
    }
}
