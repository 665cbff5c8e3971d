use reporting::ServiceConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
}

fn default_upload_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct ReportingConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Clients persist across restarts when set.
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub reporting: Option<ReportingConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn reporting_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            reporting:
                store_path: /var/lib/reportingd/clients.json
                service:
                    respect_partition_key: false
                    policy:
                        max_report_count: 50
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);

        let reporting = config.reporting.expect("reporting config");
        assert_eq!(
            reporting.store_path.as_deref(),
            Some(std::path::Path::new("/var/lib/reportingd/clients.json"))
        );
        assert_eq!(reporting.upload_timeout_secs, 30);
        assert!(!reporting.service.respect_partition_key);
        assert_eq!(reporting.service.policy.max_report_count, 50);
        assert_eq!(reporting.service.policy.max_report_attempts, 5);
    }

    #[test]
    fn reporting_section_is_optional() {
        let tmp = write_tmp_file("metrics:\n    statsd_host: 127.0.0.1\n    statsd_port: 8125\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.reporting.is_none());
    }
}
