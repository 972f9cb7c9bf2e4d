//! CSS-selector based record extraction for scraped pages.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use wayfinder_core::error::AppError;
use wayfinder_core::parser::{RawRecord, RecordParser};

/// Where a field's value comes from inside one record element.
#[derive(Debug)]
struct FieldSelector {
    name: String,
    /// `None` selects the record element itself.
    selector: Option<Selector>,
    /// Read this attribute instead of the text content.
    attr: Option<String>,
}

/// Splits an HTML page into records with one CSS selector, then reads each
/// field with a selector relative to the record element.
///
/// A field selector may end in `@attr` to read an attribute
/// (`a.website@href`); a bare `@attr` reads it from the record element.
#[derive(Debug)]
pub struct HtmlRecordParser {
    record: Selector,
    fields: Vec<FieldSelector>,
}

fn parse_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ConfigError(format!("invalid CSS selector {css:?}: {e}")))
}

impl HtmlRecordParser {
    pub fn new(record_selector: &str, fields: &BTreeMap<String, String>) -> Result<Self, AppError> {
        let record = parse_selector(record_selector)?;
        let fields = fields
            .iter()
            .map(|(name, spec)| {
                let (css, attr) = match spec.rsplit_once('@') {
                    Some((css, attr)) => (css.trim(), Some(attr.trim().to_string())),
                    None => (spec.trim(), None),
                };
                Ok(FieldSelector {
                    name: name.clone(),
                    selector: if css.is_empty() { None } else { Some(parse_selector(css)?) },
                    attr,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;
        Ok(Self { record, fields })
    }

    fn read(&self, element: ElementRef<'_>, field: &FieldSelector) -> Option<String> {
        let target = match &field.selector {
            Some(selector) => element.select(selector).next()?,
            None => element,
        };
        let value = match &field.attr {
            Some(attr) => target.value().attr(attr)?.to_string(),
            None => target.text().collect::<Vec<_>>().join(" "),
        };
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        let value = value
            .strip_prefix("mailto:")
            .or_else(|| value.strip_prefix("tel:"))
            .unwrap_or(&value)
            .to_string();
        (!value.is_empty()).then_some(value)
    }
}

impl RecordParser for HtmlRecordParser {
    fn parse(&self, body: &str) -> Result<Vec<Result<RawRecord, AppError>>, AppError> {
        let document = Html::parse_document(body);
        Ok(document
            .select(&self.record)
            .enumerate()
            .map(|(i, element)| {
                let mut record = RawRecord::default();
                for field in &self.fields {
                    if let Some(value) = self.read(element, field) {
                        record.insert(field.name.clone(), value);
                    }
                }
                if record.as_map().is_empty() {
                    Err(AppError::ParseError(format!("html record {i} has no matching fields")))
                } else {
                    Ok(record)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="centre" data-abn="12 345 678 901">
            <h2>headspace Logan</h2>
            <p class="about">Free mental health support for
               young people aged 12 to 25.</p>
            <a class="phone" href="tel:0732903600">07 3290 3600</a>
            <a class="email" href="mailto:logan@headspace.org.au">Email us</a>
            <span class="suburb">Logan Central</span>
          </div>
          <div class="centre">
            <h2>headspace Cairns</h2>
          </div>
          <div class="centre"></div>
        </body></html>
    "#;

    fn fields() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), "h2".to_string()),
            ("description".to_string(), "p.about".to_string()),
            ("phone".to_string(), "a.phone".to_string()),
            ("email".to_string(), "a.email@href".to_string()),
            ("suburb".to_string(), ".suburb".to_string()),
            ("abn".to_string(), "@data-abn".to_string()),
        ])
    }

    #[test]
    fn test_extracts_fields_per_record() {
        let parser = HtmlRecordParser::new("div.centre", &fields()).unwrap();
        let records = parser.parse(PAGE).unwrap();
        assert_eq!(records.len(), 3);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.field(&["name"]).as_deref(), Some("headspace Logan"));
        assert_eq!(
            first.field(&["description"]).as_deref(),
            Some("Free mental health support for young people aged 12 to 25.")
        );
        assert_eq!(first.field(&["email"]).as_deref(), Some("logan@headspace.org.au"));
        assert_eq!(first.field(&["phone"]).as_deref(), Some("07 3290 3600"));
        assert_eq!(first.field(&["abn"]).as_deref(), Some("12 345 678 901"));

        let second = records[1].as_ref().unwrap();
        assert_eq!(second.field(&["name"]).as_deref(), Some("headspace Cairns"));
        assert!(second.field(&["phone"]).is_none());

        assert!(matches!(records[2], Err(AppError::ParseError(_))));
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let err = HtmlRecordParser::new("div[", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
