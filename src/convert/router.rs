//! Format routing
//!
//! Maps an uploaded file name onto the backend that renders it. The mapping is
//! a closed allow-list keyed by extension; file content is never inspected.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::BackendConfig;
use crate::error::{ConvertError, Result};

use super::invoker::Invocation;

/// Output extension every backend produces
pub const OUTPUT_EXTENSION: &str = "pdf";

/// The three families of external renderers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendClass {
    /// Legacy binary word-processor documents
    #[serde(rename = "hwp")]
    NativeBinary,
    /// XML-based word-processor documents
    #[serde(rename = "hwpx")]
    XmlFormat,
    /// Everything a general office suite can open
    #[serde(rename = "office")]
    GenericOffice,
}

impl BackendClass {
    pub const ALL: [BackendClass; 3] = [
        BackendClass::NativeBinary,
        BackendClass::XmlFormat,
        BackendClass::GenericOffice,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendClass::NativeBinary => "hwp",
            BackendClass::XmlFormat => "hwpx",
            BackendClass::GenericOffice => "office",
        }
    }

    /// Lower-case extensions accepted by this class. The three sets are disjoint.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            BackendClass::NativeBinary => &["hwp"],
            BackendClass::XmlFormat => &["hwpx"],
            BackendClass::GenericOffice => &[
                "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "txt",
                "html",
            ],
        }
    }

    /// Classify a file name by its extension
    pub fn classify(file_name: &str) -> Result<BackendClass> {
        let ext = extension(file_name).ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("File has no extension: {}", file_name))
        })?;

        BackendClass::ALL
            .into_iter()
            .find(|class| class.extensions().contains(&ext.as_str()))
            .ok_or_else(|| {
                ConvertError::UnsupportedFormat(format!(
                    "File type not allowed: .{}. Allowed: {}",
                    ext,
                    allowed_extensions().join(", ")
                ))
            })
    }
}

impl fmt::Display for BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of one enabled backend
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub class: BackendClass,
    pub invocation: Invocation,
    /// Wall-clock budget for a single conversion
    pub timeout: Duration,
}

impl BackendDescriptor {
    pub fn extensions(&self) -> &'static [&'static str] {
        self.class.extensions()
    }

    /// Name of the artifact produced for `input_name`
    pub fn output_name(&self, input_name: &str) -> String {
        format!("{}.{}", file_stem(input_name), OUTPUT_EXTENSION)
    }
}

/// Immutable routing table built once at start-up
#[derive(Debug, Clone)]
pub struct BackendTable {
    descriptors: Vec<BackendDescriptor>,
}

impl BackendTable {
    pub fn from_config(backends: &[BackendConfig]) -> Self {
        let descriptors = BackendClass::ALL
            .into_iter()
            .filter_map(|class| {
                backends
                    .iter()
                    .find(|b| b.class == class && b.enabled)
                    .map(|b| BackendDescriptor {
                        class,
                        invocation: b.invocation.clone(),
                        timeout: b.timeout,
                    })
            })
            .collect();

        Self { descriptors }
    }

    /// Enabled classes, in routing order
    pub fn enabled(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.descriptors.iter()
    }

    pub fn get(&self, class: BackendClass) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| d.class == class)
    }

    /// Resolve the backend for `file_name`.
    ///
    /// `accept` narrows the classes a particular endpoint will convert.
    pub fn route(&self, file_name: &str, accept: Option<&[BackendClass]>) -> Result<&BackendDescriptor> {
        let class = BackendClass::classify(file_name)?;

        if let Some(accept) = accept {
            if !accept.contains(&class) {
                let allowed: Vec<&str> = accept
                    .iter()
                    .flat_map(|c| c.extensions().iter().copied())
                    .collect();
                return Err(ConvertError::UnsupportedFormat(format!(
                    "Only {} files are supported on this endpoint",
                    allowed.join(", ")
                )));
            }
        }

        self.get(class).ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("The {} converter is disabled", class))
        })
    }
}

/// Lower-cased extension of the last path component, if any
pub fn extension(file_name: &str) -> Option<String> {
    let base = base_name(file_name);
    let (_, ext) = base.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File name without directory components or extension
pub fn file_stem(file_name: &str) -> &str {
    let base = base_name(file_name);
    match base.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => base,
    }
}

fn base_name(file_name: &str) -> &str {
    file_name.rsplit(&['/', '\\'][..]).next().unwrap_or(file_name)
}

fn allowed_extensions() -> Vec<&'static str> {
    BackendClass::ALL
        .iter()
        .flat_map(|c| c.extensions().iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::Config;

    #[test]
    fn test_extension_sets_are_disjoint() {
        let mut seen = HashSet::new();
        for class in BackendClass::ALL {
            for ext in class.extensions() {
                assert!(seen.insert(*ext), "{} listed twice", ext);
            }
        }
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(BackendClass::classify("report.hwp").unwrap(), BackendClass::NativeBinary);
        assert_eq!(BackendClass::classify("REPORT.HWP").unwrap(), BackendClass::NativeBinary);
        assert_eq!(BackendClass::classify("notes.HwPx").unwrap(), BackendClass::XmlFormat);
        assert_eq!(BackendClass::classify("sheet.XLSX").unwrap(), BackendClass::GenericOffice);
        assert_eq!(BackendClass::classify("page.HTML").unwrap(), BackendClass::GenericOffice);
    }

    #[test]
    fn test_classify_is_deterministic() {
        for class in BackendClass::ALL {
            for ext in class.extensions() {
                let name = format!("file.{}", ext);
                let first = BackendClass::classify(&name).unwrap();
                let second = BackendClass::classify(&name).unwrap();
                assert_eq!(first, class);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_unsupported_names() {
        for name in ["archive.zip", "README", "trailing.", "photo.png", "dir.hwp/file"] {
            assert!(
                matches!(BackendClass::classify(name), Err(ConvertError::UnsupportedFormat(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_stem_and_output_name() {
        assert_eq!(file_stem("report.hwp"), "report");
        assert_eq!(file_stem("my.report.HWP"), "my.report");
        assert_eq!(file_stem("C:\\docs\\plan.docx"), "plan");
        assert_eq!(file_stem("noext"), "noext");

        let table = BackendTable::from_config(&Config::default().backends);
        let hwp = table.route("Report.HWP", None).unwrap();
        assert_eq!(hwp.output_name("Report.HWP"), "Report.pdf");
    }

    #[test]
    fn test_endpoint_restriction() {
        let table = BackendTable::from_config(&Config::default().backends);
        let only_xml = [BackendClass::XmlFormat];

        assert_eq!(
            table.route("notes.hwpx", Some(&only_xml)).unwrap().class,
            BackendClass::XmlFormat
        );
        assert!(matches!(
            table.route("report.hwp", Some(&only_xml)),
            Err(ConvertError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_disabled_class_is_unsupported() {
        let mut office = crate::config::BackendConfig::default_for(BackendClass::GenericOffice);
        office.enabled = false;
        let config = Config::default().with_backend(office);
        let table = BackendTable::from_config(&config.backends);

        assert_eq!(table.enabled().count(), 2);
        assert!(matches!(
            table.route("sheet.xlsx", None),
            Err(ConvertError::UnsupportedFormat(msg)) if msg.contains("disabled")
        ));
    }
}
