use std::collections::BTreeMap;

use async_trait::async_trait;
use url::Url;

use crate::config::{FirmwareEntry, SettingsConfig};
use crate::model::{DeviceSnapshot, FirmwareDescriptor, FirmwareIdentification};
use crate::ports::{FirmwareLookup, SettingsProvider};

/// Static firmware catalog loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct FirmwareCatalog {
    entries: Vec<FirmwareEntry>,
}

impl FirmwareCatalog {
    pub fn new(entries: Vec<FirmwareEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `model` (case-insensitive) at exactly `version`.
    pub fn find(&self, model: &str, version: &str) -> Option<FirmwareDescriptor> {
        self.entries
            .iter()
            .find(|e| e.model.eq_ignore_ascii_case(model) && e.version == version)
            .map(|e| FirmwareDescriptor {
                identification: FirmwareIdentification {
                    version: e.version.clone(),
                    model: Some(e.model.clone()),
                    platform: e.platform.clone(),
                },
                secure_url: e.url.clone(),
            })
    }
}

#[async_trait]
impl FirmwareLookup for FirmwareCatalog {
    async fn resolve(
        &self,
        model: &str,
        version: &str,
    ) -> anyhow::Result<Option<FirmwareDescriptor>> {
        Ok(self.find(model, version))
    }
}

/// Settings backed by the `[settings]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    base_url: Option<Url>,
    site_base_urls: BTreeMap<String, Url>,
}

impl StaticSettings {
    pub fn from_config(cfg: &SettingsConfig) -> anyhow::Result<Self> {
        let base_url = cfg
            .firmware_base_url
            .as_deref()
            .map(parse_base)
            .transpose()?;
        let mut site_base_urls = BTreeMap::new();
        for (site, raw) in &cfg.site_base_urls {
            site_base_urls.insert(site.clone(), parse_base(raw)?);
        }
        Ok(Self {
            base_url,
            site_base_urls,
        })
    }

    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url: Some(base_url),
            site_base_urls: BTreeMap::new(),
        }
    }
}

// Url::join drops the last segment unless the base ends with '/'.
fn parse_base(raw: &str) -> anyhow::Result<Url> {
    let mut s = raw.trim().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    Url::parse(&s).map_err(|e| anyhow::anyhow!("invalid firmware base url {raw:?}: {e}"))
}

impl SettingsProvider for StaticSettings {
    fn firmware_base_url(&self, device: &DeviceSnapshot) -> Option<Url> {
        device
            .site_id
            .as_deref()
            .and_then(|site| self.site_base_urls.get(site))
            .or(self.base_url.as_ref())
            .cloned()
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DownloadUrlError {
    #[error("firmware url {0:?} is relative and no firmware base url is configured")]
    MissingBase(String),
    #[error("invalid firmware url {url:?}: {reason}")]
    Invalid { url: String, reason: String },
}

/// Resolve the URL a device should download `firmware` from.
pub fn download_url(
    settings: &dyn SettingsProvider,
    device: &DeviceSnapshot,
    firmware: &FirmwareDescriptor,
) -> Result<Url, DownloadUrlError> {
    match Url::parse(&firmware.secure_url) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = settings
                .firmware_base_url(device)
                .ok_or_else(|| DownloadUrlError::MissingBase(firmware.secure_url.clone()))?;
            base.join(firmware.secure_url.trim_start_matches('/'))
                .map_err(|e| DownloadUrlError::Invalid {
                    url: firmware.secure_url.clone(),
                    reason: e.to_string(),
                })
        }
        Err(e) => Err(DownloadUrlError::Invalid {
            url: firmware.secure_url.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, DeviceFamily};

    fn device(site: Option<&str>) -> DeviceSnapshot {
        let mut d = Device::new("dev-1", "ER-X", DeviceFamily::EdgeOs);
        d.site_id = site.map(str::to_string);
        d.snapshot()
    }

    fn settings() -> StaticSettings {
        let mut sites = BTreeMap::new();
        sites.insert("branch".to_string(), "http://10.0.0.1:8080/fw".to_string());
        StaticSettings::from_config(&SettingsConfig {
            firmware_base_url: Some("https://fleet.example.net/firmwares".into()),
            site_base_urls: sites,
        })
        .unwrap()
    }

    #[test]
    fn relative_urls_join_the_site_base() {
        let fw = FirmwareDescriptor::new("2.1.0", "er-x/2.1.0.tar");
        let url = download_url(&settings(), &device(Some("branch")), &fw).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/fw/er-x/2.1.0.tar");
        let url = download_url(&settings(), &device(None), &fw).unwrap();
        assert_eq!(url.as_str(), "https://fleet.example.net/firmwares/er-x/2.1.0.tar");
    }

    #[test]
    fn absolute_urls_pass_through() {
        let fw = FirmwareDescriptor::new("2.1.0", "https://cdn.example.com/a.bin?sig=abc");
        let url = download_url(&StaticSettings::default(), &device(None), &fw).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/a.bin?sig=abc");
    }

    #[test]
    fn relative_url_without_base_is_an_error() {
        let fw = FirmwareDescriptor::new("2.1.0", "er-x/2.1.0.tar");
        let err = download_url(&StaticSettings::default(), &device(None), &fw).unwrap_err();
        assert_eq!(err, DownloadUrlError::MissingBase("er-x/2.1.0.tar".into()));
    }

    #[tokio::test]
    async fn catalog_matches_model_case_insensitively() {
        let catalog = FirmwareCatalog::new(vec![FirmwareEntry {
            model: "ER-X".into(),
            version: "2.1.0".into(),
            url: "er-x/2.1.0.tar".into(),
            platform: Some("e50".into()),
        }]);
        let fw = catalog.resolve("er-x", "2.1.0").await.unwrap().unwrap();
        assert_eq!(fw.version(), "2.1.0");
        assert_eq!(fw.identification.platform.as_deref(), Some("e50"));
        assert!(catalog.resolve("ER-X", "2.0.9").await.unwrap().is_none());
    }
}
