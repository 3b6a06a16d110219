//! Symbol name resolution from master to local naming.

use crate::models::ReplicationConfig;

/// Remove the configured prefix/suffix when present on both ends.
pub fn strip_affixes<'a>(symbol: &'a str, prefix: &str, suffix: &str) -> &'a str {
    let mut clean = symbol;
    if !prefix.is_empty() {
        clean = clean.strip_prefix(prefix).unwrap_or(clean);
    }
    if !suffix.is_empty() {
        clean = clean.strip_suffix(suffix).unwrap_or(clean);
    }
    if clean.is_empty() {
        symbol
    } else {
        clean
    }
}

/// Resolves wire symbols to symbols tradable on this terminal.
pub struct SymbolResolver<'a> {
    config: &'a ReplicationConfig,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(config: &'a ReplicationConfig) -> Self {
        Self { config }
    }

    /// Wire symbol with configured affixes removed; filters match against this.
    pub fn clean<'s>(&self, symbol: &'s str) -> &'s str {
        strip_affixes(symbol, &self.config.symbol_prefix, &self.config.symbol_suffix)
    }

    /// Local symbol: explicit mapping of the clean name, else the clean name itself.
    pub fn resolve(&self, symbol: &str) -> String {
        let clean = self.clean(symbol);
        self.config
            .symbol_mappings
            .iter()
            .find(|m| m.source_symbol.eq_ignore_ascii_case(clean) || m.source_symbol == symbol)
            .map(|m| m.target_symbol.clone())
            .unwrap_or_else(|| clean.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymbolMapping;

    #[test]
    fn test_strip_affixes() {
        assert_eq!(strip_affixes("pro.EURUSD.m", "pro.", ".m"), "EURUSD");
        assert_eq!(strip_affixes("EURUSD.m", "pro.", ".m"), "EURUSD");
        assert_eq!(strip_affixes("EURUSD", "", ""), "EURUSD");
        assert_eq!(strip_affixes(".m", "", ".m"), ".m"); // never strips to empty
    }

    #[test]
    fn test_resolve_mapping_then_identity() {
        let config = ReplicationConfig {
            symbol_suffix: ".m".to_string(),
            symbol_mappings: vec![SymbolMapping {
                source_symbol: "XAUUSD".to_string(),
                target_symbol: "GOLD".to_string(),
            }],
            ..ReplicationConfig::new("M1")
        };
        let resolver = SymbolResolver::new(&config);

        assert_eq!(resolver.resolve("XAUUSD.m"), "GOLD");
        assert_eq!(resolver.resolve("XAUUSD"), "GOLD");
        assert_eq!(resolver.resolve("EURUSD.m"), "EURUSD");
        assert_eq!(resolver.resolve("USDJPY"), "USDJPY");
    }
}
