//! Configuration
//!
//! Loads the distribution settings from TOML: the file selection shared by all
//! platforms, the extractor's field aliases and the list of target platforms.
//!
//! ```toml
//! [selection]
//! pattern = 'cap_\d+\.xhtml$'
//! exclude = ['parte_\d+\.xhtml$']
//! count = 3
//!
//! [selection.policy]
//! kind = "body-end"
//!
//! [extractor.aliases]
//! titulo = "title"
//!
//! [[platform]]
//! id = "amazon"
//! symbol = "▲"
//! ```

use std::{collections::HashSet, fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, de::Error as _};

use crate::{
    error::DistributorError,
    metadata::{FormField, MetadataExtractor},
    types::{InsertionPolicy, PlatformProfile, SelectionPolicy},
};

/// Settings of a distribution run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DistributionConfig {
    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Target platforms, in the order variants are reported
    #[serde(rename = "platform", default)]
    pub platforms: Vec<PlatformConfig>,
}

/// File selection shared by all platforms
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SelectionConfig {
    /// Regex matched against the relative path of each file
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Regexes of paths that are never marked
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Number of markers per platform
    #[serde(default = "default_count")]
    pub count: usize,

    #[serde(default)]
    pub policy: InsertionPolicy,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            exclude: default_exclude(),
            count: default_count(),
            policy: InsertionPolicy::default(),
        }
    }
}

fn default_pattern() -> String {
    r"cap_\d+\.xhtml$".to_string()
}

/// Part and section opener pages
fn default_exclude() -> Vec<String> {
    vec![r"parte_\d+\.xhtml$".to_string(), r"secao_\d+\.xhtml$".to_string()]
}

fn default_count() -> usize {
    3
}

/// Field aliases and classification roots of the metadata extractor
///
/// Both tables default to the fields of the publisher's registration form. A
/// table given in the configuration replaces its default; the extractor's
/// built-in English aliases always apply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExtractorConfig {
    /// Form field name to meaning, added to the built-in aliases
    #[serde(default = "default_aliases")]
    pub aliases: IndexMap<String, FormField>,

    /// Leading classification code to root category
    #[serde(default = "default_classification_roots")]
    pub classification_roots: IndexMap<String, String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            aliases: default_aliases(),
            classification_roots: default_classification_roots(),
        }
    }
}

fn default_aliases() -> IndexMap<String, FormField> {
    [
        ("titulo", FormField::Title),
        ("subtitulomkt", FormField::Subtitle),
        ("autores", FormField::Author),
        ("ISBNEletr", FormField::Isbn),
        ("classificacaoSite", FormField::Classification),
        ("Subárea", FormField::Subject),
        ("Sinopse", FormField::Description),
        ("selo", FormField::Publisher),
    ]
    .into_iter()
    .map(|(name, field)| (name.to_string(), field))
    .collect()
}

fn default_classification_roots() -> IndexMap<String, String> {
    IndexMap::from([("33".to_string(), "Psicologia".to_string())])
}

/// A target platform, optionally overriding the shared selection
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlatformConfig {
    pub id: String,
    pub symbol: String,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub exclude: Option<Vec<String>>,

    #[serde(default)]
    pub count: Option<usize>,

    #[serde(default)]
    pub policy: Option<InsertionPolicy>,
}

impl PlatformConfig {
    pub fn new(id: &str, symbol: &str) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            pattern: None,
            exclude: None,
            count: None,
            policy: None,
        }
    }
}

impl Default for DistributionConfig {
    /// The five retail platforms with their usual symbols, marking three
    /// `cap_N.xhtml` chapters each
    fn default() -> Self {
        Self {
            selection: SelectionConfig::default(),
            extractor: ExtractorConfig::default(),
            platforms: vec![
                PlatformConfig::new("amazon", "▲"),
                PlatformConfig::new("apple", "▼"),
                PlatformConfig::new("binpar", "◆"),
                PlatformConfig::new("google", "●"),
                PlatformConfig::new("vitalsource", "■"),
            ],
        }
    }
}

impl DistributionConfig {
    /// Parses a configuration from TOML text
    ///
    /// # Return
    /// - `Ok(DistributionConfig)`: The parsed configuration
    /// - `Err(DistributorError::ConfigError)`: The text is not valid TOML, does not
    ///   match the expected structure, or repeats a platform id
    pub fn from_toml_str(content: &str) -> Result<Self, DistributorError> {
        let config: Self = toml::from_str(content)?;

        let mut ids = HashSet::new();
        for platform in &config.platforms {
            if platform.id.trim().is_empty() || platform.symbol.is_empty() {
                return Err(toml::de::Error::custom("platform id and symbol must not be empty").into());
            }

            if !ids.insert(platform.id.as_str()) {
                return Err(toml::de::Error::custom(format!(
                    "duplicate platform id \"{}\"",
                    platform.id
                ))
                .into());
            }
        }

        Ok(config)
    }

    /// Reads and parses a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DistributorError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Builds one profile per platform, applying per-platform overrides
    ///
    /// # Return
    /// - `Ok(Vec<PlatformProfile>)`: The profiles, in configuration order
    /// - `Err(DistributorError::InvalidPattern)`: A selection pattern does not compile
    pub fn profiles(&self) -> Result<Vec<PlatformProfile>, DistributorError> {
        self.platforms
            .iter()
            .map(|platform| {
                let pattern = platform.pattern.as_ref().unwrap_or(&self.selection.pattern);
                let exclude = platform.exclude.as_ref().unwrap_or(&self.selection.exclude);
                let count = platform.count.unwrap_or(self.selection.count);
                let policy = platform
                    .policy
                    .clone()
                    .unwrap_or_else(|| self.selection.policy.clone());

                Ok(PlatformProfile {
                    id: platform.id.clone(),
                    symbol: platform.symbol.clone(),
                    selection: SelectionPolicy::new(pattern, exclude, count)?,
                    policy,
                })
            })
            .collect()
    }

    /// Builds the metadata extractor with the configured aliases
    pub fn extractor(&self) -> MetadataExtractor {
        let extractor = self
            .extractor
            .aliases
            .iter()
            .fold(MetadataExtractor::new(), |extractor, (name, field)| {
                extractor.with_alias(name, *field)
            });

        self.extractor
            .classification_roots
            .iter()
            .fold(extractor, |extractor, (code, root)| {
                extractor.with_classification_root(code, root)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::{
        config::DistributionConfig,
        error::DistributorError,
        form::harvest_form_fields,
        types::{InsertionPolicy, MetadataField},
    };

    const CONFIG: &str = r#"
[selection]
pattern = 'cap_\d+\.xhtml$'
exclude = ['parte_\d+\.xhtml$', 'secao_\d+\.xhtml$']
count = 3

[selection.policy]
kind = "body-end"
template = '<p style="text-align: center;">{mark}</p>'

[extractor.aliases]
titulo = "title"
sinopse = "description"
classificacaoSite = "classification"

[extractor.classification-roots]
"33" = "Psicologia"

[[platform]]
id = "amazon"
symbol = "▲"

[[platform]]
id = "apple"
symbol = "▼"
count = 2
exclude = []

[platform.policy]
kind = "inline-text"
min-depth = 2
"#;

    #[test]
    fn test_parse_config() {
        let config = DistributionConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.platforms.len(), 2);
        assert_eq!(config.selection.count, 3);
        assert_eq!(config.selection.exclude.len(), 2);

        let profiles = config.profiles().unwrap();
        assert_eq!(profiles[0].id, "amazon");
        assert_eq!(profiles[0].symbol, "▲");
        assert_eq!(profiles[0].selection.count, 3);
        assert_eq!(
            profiles[0].policy,
            InsertionPolicy::BodyEnd {
                template: "<p style=\"text-align: center;\">{mark}</p>".to_string()
            }
        );
        assert!(profiles[0].selection.is_eligible("OEBPS/Text/cap_01.xhtml"));
        assert!(!profiles[0].selection.is_eligible("OEBPS/Text/parte_01.xhtml"));

        assert_eq!(profiles[1].selection.count, 2);
        assert_eq!(profiles[1].policy, InsertionPolicy::InlineText { min_depth: 2 });
        assert!(profiles[1].selection.exclude.is_empty());
    }

    #[test]
    fn test_extractor_from_config() {
        let config = DistributionConfig::from_toml_str(CONFIG).unwrap();
        let fields = [
            ("titulo", "Livro"),
            ("classificacaoSite", "33.01 - Terapia"),
            ("Sinopse", "Resumo"),
        ];

        let record = config.extractor().extract(fields).unwrap();
        assert_eq!(record.title(), "Livro");
        assert_eq!(
            record.get(MetadataField::Subject),
            Some("Psicologia > Terapia")
        );
        assert_eq!(record.get(MetadataField::Description), Some("Resumo"));
    }

    #[test]
    fn test_default_config() {
        let config = DistributionConfig::from_toml_str("").unwrap();
        assert!(config.platforms.is_empty());
        assert_eq!(config.selection.pattern, r"cap_\d+\.xhtml$");
        assert_eq!(config.selection.count, 3);
        assert_eq!(config.selection.policy, InsertionPolicy::default());
        assert_eq!(config.extractor.classification_roots["33"], "Psicologia");

        let profiles = DistributionConfig::default().profiles().unwrap();
        let symbols = profiles.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>();
        assert_eq!(symbols, vec!["▲", "▼", "◆", "●", "■"]);

        let selection = &profiles[0].selection;
        assert!(selection.is_eligible("OEBPS/Text/cap_001.xhtml"));
        assert!(!selection.is_eligible("OEBPS/Text/parte_01.xhtml"));
        assert!(!selection.is_eligible("OEBPS/Text/secao_01.xhtml"));
        assert!(!selection.is_eligible("OEBPS/Text/capa.xhtml"));
    }

    /// The registration form extracts with no configuration at all
    #[test]
    fn test_default_extractor_reads_registration_form() {
        let form = r#"<form>
<input type="text" name="titulo" value="Mente Ansiosa">
<input type="text" name="subtitulomkt" value="Guia Prático">
<input type="text" name="autores" value="Beltrana Souza">
<input type="text" name="ISBNEletr" value="978-85-0000-000-1">
<input type="text" name="classificacaoSite" value="33.01.09 - Terapia Cognitiva">
<input type="checkbox" name="selo[]" value="4" checked> Sinopsys
<table><tr><td>Sinopse:</td><td><p>Um guia.</p></td></tr></table>
</form>"#;

        let config = DistributionConfig::default();
        let record = config.extractor().extract(harvest_form_fields(form)).unwrap();

        assert_eq!(record.title(), "Mente Ansiosa: guia prático");
        assert_eq!(record.get(MetadataField::Author), Some("Beltrana Souza"));
        assert_eq!(record.isbn(), Some("9788500000001"));
        assert_eq!(
            record.get(MetadataField::Subject),
            Some("Psicologia > Terapia Cognitiva")
        );
        assert_eq!(record.get(MetadataField::Description), Some("Um guia."));
        assert_eq!(record.get(MetadataField::Publisher), Some("Sinopsys"));
    }

    #[test]
    fn test_invalid_config() {
        let result = DistributionConfig::from_toml_str("[selection]\ncount = \"three\"\n");
        assert!(matches!(result, Err(DistributorError::ConfigError { .. })));

        let result = DistributionConfig::from_toml_str(
            "[selection.policy]\nkind = \"everywhere\"\n",
        );
        assert!(matches!(result, Err(DistributorError::ConfigError { .. })));

        let result = DistributionConfig::from_toml_str(
            "[[platform]]\nid = \"a\"\nsymbol = \"x\"\n[[platform]]\nid = \"a\"\nsymbol = \"y\"\n",
        );
        assert!(matches!(result, Err(DistributorError::ConfigError { .. })));
    }

    #[test]
    fn test_invalid_pattern() {
        let config = DistributionConfig::from_toml_str(
            "[[platform]]\nid = \"a\"\nsymbol = \"x\"\npattern = \"cap_(\"\n",
        )
        .unwrap();

        let error = config.profiles().unwrap_err();
        assert!(matches!(
            error,
            DistributorError::InvalidPattern { ref pattern, .. } if pattern == "cap_("
        ));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = DistributionConfig::load(file.path()).unwrap();
        assert_eq!(config.platforms[1].id, "apple");

        let missing = DistributionConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(DistributorError::IOError { .. })));
    }
}
