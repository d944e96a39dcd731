//! Version information reported by the health route.

/// Crate version from Cargo.toml
pub const DREADNOUGHT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub dreadnought: &'static str,
    /// Script engine the workers run, if the embedder names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            dreadnought: DREADNOUGHT_VERSION,
            engine: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.dreadnought, DREADNOUGHT_VERSION);
        assert!(info.engine.is_none());
    }

    #[test]
    fn serializes_engine_only_when_set() {
        let info = VersionInfo {
            dreadnought: "0.1.0",
            engine: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "dreadnought": "0.1.0"
        }
        "#);

        let info = VersionInfo {
            dreadnought: "0.1.0",
            engine: None,
        }
        .with_engine("native");
        insta::assert_json_snapshot!(info, @r#"
        {
          "dreadnought": "0.1.0",
          "engine": "native"
        }
        "#);
    }
}
