use std::sync::LazyLock;

use regex::Regex;

/// Provider names: lowercase alphanumeric segments joined by `-`, `_` or `.`.
/// Examples: "openai", "anthropic", "azure-openai", "together.ai"
pub static PROVIDER_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[-_.][a-z0-9]+)*$").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        for ok in ["openai", "azure-openai", "together.ai", "x_1"] {
            assert!(PROVIDER_NAME_REGEX.is_match(ok), "{ok}");
        }
        for bad in ["", "OpenAI", "a--b", "-a", "a b", "../etc"] {
            assert!(!PROVIDER_NAME_REGEX.is_match(bad), "{bad}");
        }
    }
}
