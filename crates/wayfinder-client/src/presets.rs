//! Built-in source definitions and the adapter factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use wayfinder_core::adapter::{GenericAdapter, SourceAdapter, builtin_parser};
use wayfinder_core::config::{
    Dataset, Field, FieldMapping, ParserKind, SourceConfig, SourceKind, SourceMetadataConfig,
};
use wayfinder_core::error::AppError;
use wayfinder_core::models::{Category, OrganizationType, VerificationStatus};
use wayfinder_core::parser::RecordParser;
use wayfinder_core::rate_limiter::RateLimit;
use wayfinder_core::traits::Fetcher;

use crate::fetcher::{DEFAULT_USER_AGENT, ReqwestFetcher};
use crate::html::HtmlRecordParser;
use crate::robots::RobotsFetcher;

fn dataset(key: &str, name: &str, url: &str) -> Dataset {
    Dataset {
        key: key.to_string(),
        name: name.to_string(),
        url: url.to_string(),
        description: None,
    }
}

/// Queensland open-data CSV extracts.
pub fn qld_open_data() -> SourceConfig {
    let mut config = SourceConfig::new("qld-open-data", "https://data.qld.gov.au/api/3")
        .with_rate_limit(RateLimit::new(100, std::time::Duration::from_secs(60)))
        .with_dataset(dataset(
            "youth_justice_centres",
            "Youth Justice Centre Locations",
            "https://www.families.qld.gov.au/_media/documents/open-data/youth-justice-centre-locations.csv",
        ));
    config.kind = SourceKind::File;
    config.defaults.verification_status = VerificationStatus::Verified;
    config.defaults.organization_name = Some("Department of Youth Justice".into());
    config.defaults.organization_type = Some(OrganizationType::Government);
    config.defaults.category = Some(Category::YouthJustice);
    config.metadata = SourceMetadataConfig {
        coverage: Some("Queensland".into()),
        update_frequency: Some("quarterly".into()),
        licensing: Some("CC-BY 4.0".into()),
        data_quality: Some("government".into()),
        estimated_records: Some(50),
    };
    config
}

/// Ask Izzy / Infoxchange service directory (JSON API).
pub fn ask_izzy() -> SourceConfig {
    let mut config = SourceConfig::new(
        "ask-izzy",
        "https://api.infoxchange.org/service-directory/v1/services?area=QLD&target_age_min=10&target_age_max=25",
    )
    .with_parser(ParserKind::Json {
        records_pointer: "/services".into(),
    })
    .with_rate_limit(RateLimit::new(60, std::time::Duration::from_secs(60)));
    config.kind = SourceKind::Api;
    config.fields = FieldMapping::default()
        .with(Field::Categories, &["service_types", "categories"])
        .with(Field::Organization, &["organisation_name", "organisation", "provider"]);
    config.relevance_keywords = vec!["youth".into(), "young".into(), "adolescent".into(), "teen".into()];
    config.metadata = SourceMetadataConfig {
        coverage: Some("Australia".into()),
        update_frequency: Some("daily".into()),
        licensing: Some("Infoxchange API terms".into()),
        data_quality: Some("verified_ngo".into()),
        estimated_records: Some(370_000),
    };
    config
}

/// headspace centre pages (scraped HTML).
pub fn headspace() -> SourceConfig {
    let centres = [
        ("brisbane", "headspace Brisbane"),
        ("cairns", "headspace Cairns"),
        ("gold-coast", "headspace Gold Coast"),
        ("ipswich", "headspace Ipswich"),
        ("logan", "headspace Logan"),
        ("mount-isa", "headspace Mount Isa"),
        ("toowoomba", "headspace Toowoomba"),
        ("townsville", "headspace Townsville"),
    ];
    let mut config = SourceConfig::new("headspace", "https://headspace.org.au").with_parser(
        ParserKind::Html {
            record_selector: "main".into(),
            fields: BTreeMap::from([
                ("name".to_string(), "h1".to_string()),
                ("description".to_string(), "p".to_string()),
                ("phone".to_string(), "a[href^='tel:']@href".to_string()),
                ("email".to_string(), "a[href^='mailto:']@href".to_string()),
                ("address".to_string(), "address".to_string()),
            ]),
        },
    );
    for (slug, name) in centres {
        config = config.with_dataset(dataset(
            slug,
            name,
            &format!("https://headspace.org.au/headspace-centres/{slug}/"),
        ));
    }
    config.kind = SourceKind::Scraper;
    config.respect_robots_txt = true;
    config.rate_limit = RateLimit::new(10, std::time::Duration::from_secs(60));
    config.defaults.organization_name = Some("headspace National Youth Mental Health Foundation".into());
    config.defaults.organization_type = Some(OrganizationType::Healthcare);
    config.defaults.category = Some(Category::MentalHealth);
    config.metadata = SourceMetadataConfig {
        coverage: Some("Queensland".into()),
        update_frequency: Some("monthly".into()),
        licensing: None,
        data_quality: Some("scraped".into()),
        estimated_records: Some(centres.len() as u64),
    };
    config
}

/// Every built-in source.
pub fn builtin_sources() -> Vec<SourceConfig> {
    vec![qld_open_data(), ask_izzy(), headspace()]
}

/// Builds network-backed adapters from source definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterFactory {
    allow_private_urls: bool,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable SSRF protection (local or intranet sources).
    pub fn allow_private_urls(mut self) -> Self {
        self.allow_private_urls = true;
        self
    }

    pub fn build(&self, config: SourceConfig) -> Result<Arc<dyn SourceAdapter>, AppError> {
        let mut fetcher = ReqwestFetcher::for_source(&config)?;
        if self.allow_private_urls {
            fetcher = fetcher.allow_private_urls();
        }
        let parser = parser_for(&config.parser)?;

        if config.respect_robots_txt {
            let agent = config.user_agent.clone().unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
            tracing::debug!(source = %config.name, "robots.txt enforcement enabled");
            adapter(config, RobotsFetcher::new(fetcher, agent), parser)
        } else {
            adapter(config, fetcher, parser)
        }
    }

    pub fn build_all(&self, configs: Vec<SourceConfig>) -> Result<Vec<Arc<dyn SourceAdapter>>, AppError> {
        configs.into_iter().map(|c| self.build(c)).collect()
    }
}

fn adapter<F: Fetcher + 'static>(
    config: SourceConfig,
    fetcher: F,
    parser: Arc<dyn RecordParser>,
) -> Result<Arc<dyn SourceAdapter>, AppError> {
    Ok(Arc::new(GenericAdapter::new(config, fetcher, parser)?))
}

/// The parser for a strategy, including HTML which core leaves to us.
pub fn parser_for(kind: &ParserKind) -> Result<Arc<dyn RecordParser>, AppError> {
    match kind {
        ParserKind::Html {
            record_selector,
            fields,
        } => Ok(Arc::new(HtmlRecordParser::new(record_selector, fields)?)),
        other => builtin_parser(other)
            .ok_or_else(|| AppError::ConfigError(format!("no parser for {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sources_validate() {
        let sources = builtin_sources();
        assert_eq!(sources.len(), 3);
        for source in &sources {
            source.validate().unwrap();
        }
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["qld-open-data", "ask-izzy", "headspace"]);
    }

    #[test]
    fn test_headspace_is_scraped_politely() {
        let config = headspace();
        assert!(config.respect_robots_txt);
        assert!(matches!(config.parser, ParserKind::Html { .. }));
        assert_eq!(config.datasets_for(&["logan".to_string()]).len(), 1);
    }

    #[test]
    fn test_factory_builds_every_preset() {
        let adapters = AdapterFactory::new().build_all(builtin_sources()).unwrap();
        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["qld-open-data", "ask-izzy", "headspace"]);
    }

    #[test]
    fn test_factory_rejects_bad_selector() {
        let config = SourceConfig::new("broken", "https://example.org").with_parser(ParserKind::Html {
            record_selector: "div[".into(),
            fields: BTreeMap::new(),
        });
        assert!(matches!(
            AdapterFactory::new().build(config),
            Err(AppError::ConfigError(_))
        ));
    }
}
