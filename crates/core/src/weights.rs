//! Model weight locations supplied when loading the engine

use serde::{Deserialize, Serialize};

/// Paths to the three artifacts the engine loader needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightPaths {
    #[serde(default)]
    pub lm_weights_path: String,
    #[serde(default)]
    pub codec_weights_path: String,
    #[serde(default)]
    pub tokenizer_path: String,
}

impl WeightPaths {
    pub fn new(
        lm_weights_path: impl Into<String>,
        codec_weights_path: impl Into<String>,
        tokenizer_path: impl Into<String>,
    ) -> Self {
        Self {
            lm_weights_path: lm_weights_path.into(),
            codec_weights_path: codec_weights_path.into(),
            tokenizer_path: tokenizer_path.into(),
        }
    }

    /// Copy with every path passed through [`clean_path`]
    pub fn cleaned(&self) -> Self {
        Self {
            lm_weights_path: clean_path(&self.lm_weights_path),
            codec_weights_path: clean_path(&self.codec_weights_path),
            tokenizer_path: clean_path(&self.tokenizer_path),
        }
    }

    /// JSON names of the paths that are empty
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.lm_weights_path.is_empty() {
            missing.push("lmWeightsPath");
        }
        if self.codec_weights_path.is_empty() {
            missing.push("codecWeightsPath");
        }
        if self.tokenizer_path.is_empty() {
            missing.push("tokenizerPath");
        }
        missing
    }
}

/// Strip whitespace and surrounding quotes from a user-entered path
pub fn clean_path(path: &str) -> String {
    path.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("  \"/models/lm.safetensors\" "), "/models/lm.safetensors");
        assert_eq!(clean_path("'/a b/c'"), "/a b/c");
        assert_eq!(clean_path("plain"), "plain");
    }

    #[test]
    fn test_missing_paths() {
        let paths = WeightPaths::new("lm", "  ", "tok").cleaned();
        assert_eq!(paths.missing(), vec!["codecWeightsPath"]);
        assert!(WeightPaths::new("a", "b", "c").missing().is_empty());
    }
}
