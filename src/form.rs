//! Form Harvester
//!
//! Collects the fields of a decoded registration form (HTML) into a flat mapping
//! of field name to raw text. Values are not entity-decoded here, that is left to
//! the [MetadataExtractor](crate::metadata::MetadataExtractor).

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::utils::NormalizeWhitespace;

static INPUT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("valid input tag regex"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)\s([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#,
    )
    .expect("valid attribute regex")
});

static LABEL_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<]*").expect("valid label text regex"));

static TABLE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<td\b[^>]*>(.*?)</td>\s*<td\b[^>]*>(.*?)</td>").expect("valid table row regex")
});

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid markup regex"));

/// Harvests the fields of a decoded registration form
///
/// Three kinds of fields are recognized:
/// - `<input name="X" value="V">`, in any attribute order, gives `X = V`
/// - a checked box of a group `name="X[]"` gives `X = <label text following the box>`
/// - a table row `<td>Label</td><td>Value</td>` gives `Label = Value`, with the
///   inner markup stripped and a trailing colon removed from the label
///
/// The first non-empty occurrence of a field name wins.
pub fn harvest_form_fields(html: &str) -> IndexMap<String, String> {
    let mut fields = IndexMap::new();

    for tag in INPUT_TAG.find_iter(html) {
        let attributes = parse_attributes(tag.as_str());
        let Some(name) = attributes.get("name") else {
            continue;
        };

        let is_checkbox = attributes
            .get("type")
            .is_some_and(|kind| kind.eq_ignore_ascii_case("checkbox"));
        if is_checkbox || name.ends_with("[]") {
            if !attributes.contains_key("checked") {
                continue;
            }

            let name = name.trim_end_matches("[]");
            let label = LABEL_TEXT
                .find(&html[tag.end()..])
                .map(|text| text.as_str().normalize_whitespace())
                .unwrap_or_default();
            insert_field(&mut fields, name, label);
        } else if let Some(value) = attributes.get("value") {
            insert_field(&mut fields, name, value.trim().to_string());
        }
    }

    for row in TABLE_ROW.captures_iter(html) {
        let label = strip_markup(&row[1]);
        let label = label.trim_end_matches(':').trim_end();
        if label.is_empty() {
            continue;
        }

        insert_field(&mut fields, label, strip_markup(&row[2]));
    }

    fields
}

fn parse_attributes(tag: &str) -> IndexMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .map(|captures| {
            let value = captures
                .get(2)
                .or_else(|| captures.get(3))
                .or_else(|| captures.get(4))
                .map(|value| value.as_str())
                .unwrap_or_default();
            (captures[1].to_lowercase(), value.to_string())
        })
        .collect()
}

fn strip_markup(fragment: &str) -> String {
    let text: &str = &MARKUP.replace_all(fragment, " ");
    text.normalize_whitespace()
}

fn insert_field(fields: &mut IndexMap<String, String>, name: &str, value: String) {
    if name.is_empty() || value.is_empty() {
        return;
    }

    fields.entry(name.to_string()).or_insert(value);
}

#[cfg(test)]
mod tests {
    use crate::{
        form::harvest_form_fields,
        metadata::{FormField, MetadataExtractor},
        types::MetadataField,
    };

    const FORM: &str = r#"<html><body><form>
<input type="text" name="titulo" value="Terapia &amp; Mente" />
<input value="Uma Abordagem Prática" name="subtitulomkt" type="text">
<input type='text' name='autores' value='Fulano de Tal'>
<input type="text" name="ISBNEletr" value="978-65-5882-323-0">
<input type="text" name="classificacaoSite" value="33.01.09 - Terapia Cognitiva">
<input type="checkbox" name="selo[]" value="1"> Selo Um
<input type="checkbox" name="selo[]" value="2" checked> Editora   Dois
<input type="checkbox" name="selo[]" value="3" checked> Selo Três
<input type="hidden" name="empty" value="">
<table>
  <tr><td><b>Sinopse:</b></td><td><p>Um livro</p>
  <p>sobre terapia.</p></td></tr>
  <tr><td>Subárea</td><td>Psicologia &gt; Clínica</td></tr>
</table>
</form></body></html>"#;

    #[test]
    fn test_harvest_inputs() {
        let fields = harvest_form_fields(FORM);

        assert_eq!(fields.get("titulo").unwrap(), "Terapia &amp; Mente");
        assert_eq!(fields.get("subtitulomkt").unwrap(), "Uma Abordagem Prática");
        assert_eq!(fields.get("autores").unwrap(), "Fulano de Tal");
        assert_eq!(fields.get("ISBNEletr").unwrap(), "978-65-5882-323-0");
        assert!(!fields.contains_key("empty"));
    }

    /// Only the first checked box of a group is kept
    #[test]
    fn test_harvest_checked_box() {
        let fields = harvest_form_fields(FORM);
        assert_eq!(fields.get("selo").unwrap(), "Editora Dois");
    }

    /// `checked` must be an attribute of the box, not text inside another attribute
    #[test]
    fn test_harvest_checked_attribute() {
        let form = concat!(
            r#"<input type="checkbox" name="selo[]" title="not checked" value="1"> Selo Um"#,
            r#"<input type="checkbox" name="selo[]" checked="checked" value="2"> Selo Dois"#,
        );

        let fields = harvest_form_fields(form);
        assert_eq!(fields.get("selo").unwrap(), "Selo Dois");
    }

    #[test]
    fn test_harvest_table_rows() {
        let fields = harvest_form_fields(FORM);
        assert_eq!(fields.get("Sinopse").unwrap(), "Um livro sobre terapia.");
        assert_eq!(fields.get("Subárea").unwrap(), "Psicologia &gt; Clínica");
    }

    /// A harvested form can be fed to the extractor through aliases
    #[test]
    fn test_harvest_then_extract() {
        let extractor = MetadataExtractor::new()
            .with_alias("titulo", FormField::Title)
            .with_alias("subtitulomkt", FormField::Subtitle)
            .with_alias("autores", FormField::Author)
            .with_alias("isbneletr", FormField::Isbn)
            .with_alias("sinopse", FormField::Description)
            .with_alias("subárea", FormField::Subject)
            .with_alias("selo", FormField::Publisher);

        let record = extractor.extract(harvest_form_fields(FORM)).unwrap();
        assert_eq!(record.title(), "Terapia & Mente: uma abordagem prática");
        assert_eq!(record.isbn(), Some("9786558823230"));
        assert_eq!(
            record.get(MetadataField::Subject),
            Some("Psicologia > Clínica")
        );
        assert_eq!(
            record.get(MetadataField::Description),
            Some("Um livro sobre terapia.")
        );
        assert_eq!(record.get(MetadataField::Publisher), Some("Editora Dois"));
    }
}
