// volchain-node/src/config.rs
use serde::{Deserialize, Serialize};
use std::path::Path;
use volchain_core::{
    ChainConfig, DigIdMode, LedgerRules, DEFAULT_MAX_BLOCK_BYTES, DEFAULT_MAX_MEMO_BYTES, DEFAULT_MAX_MEMPOOL_BYTES,
    DEFAULT_MAX_TX_PER_BLOCK, DEFAULT_VALIDATOR,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: String,
    pub chain: ChainSection,
    pub ledger: LedgerSection,
    pub producer: ProducerConfig,
    pub barrier: BarrierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub validator: String,
    pub max_tx_per_block: usize,
    pub max_block_bytes: usize,
    pub max_mempool_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    pub max_memo_bytes: usize,
    pub dig_id_mode: DigIdMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub interval_ms: u64,
    pub batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierConfig {
    pub poll_ms: u64,
    pub timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./volchain".into(),
            chain: ChainSection {
                validator: DEFAULT_VALIDATOR.into(),
                max_tx_per_block: DEFAULT_MAX_TX_PER_BLOCK,
                max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
                max_mempool_bytes: DEFAULT_MAX_MEMPOOL_BYTES,
            },
            ledger: LedgerSection {
                max_memo_bytes: DEFAULT_MAX_MEMO_BYTES,
                dig_id_mode: DigIdMode::Shadow,
            },
            producer: ProducerConfig {
                interval_ms: 1000,
                batch: 200,
            },
            barrier: BarrierConfig {
                poll_ms: 50,
                timeout_ms: 12_000,
            },
        }
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", key, value),
    }
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `VOLCHAIN_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_pairs(std::env::vars());
    }

    pub fn apply_env_pairs<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "VOLCHAIN_DIR" => self.data_dir = value.to_string(),
                "VOLCHAIN_MAX_TX_PER_BLOCK" => parse_into(key, value, &mut self.chain.max_tx_per_block),
                "VOLCHAIN_MAX_BLOCK_BYTES" => parse_into(key, value, &mut self.chain.max_block_bytes),
                "VOLCHAIN_MAX_MEMPOOL_BYTES" => parse_into(key, value, &mut self.chain.max_mempool_bytes),
                "VOLCHAIN_MAX_MEMO_BYTES" => parse_into(key, value, &mut self.ledger.max_memo_bytes),
                "VOLCHAIN_DIGID_MODE" => parse_into(key, value, &mut self.ledger.dig_id_mode),
                "VOLCHAIN_PRODUCER_INTERVAL_MS" => parse_into(key, value, &mut self.producer.interval_ms),
                "VOLCHAIN_PRODUCER_BATCH" => parse_into(key, value, &mut self.producer.batch),
                "VOLCHAIN_BARRIER_POLL_MS" => parse_into(key, value, &mut self.barrier.poll_ms),
                "VOLCHAIN_BARRIER_TIMEOUT_MS" => parse_into(key, value, &mut self.barrier.timeout_ms),
                _ => {}
            }
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            validator: self.chain.validator.clone(),
            max_tx_per_block: self.chain.max_tx_per_block,
            max_block_bytes: self.chain.max_block_bytes,
            max_mempool_bytes: self.chain.max_mempool_bytes,
            rules: LedgerRules {
                max_memo_bytes: self.ledger.max_memo_bytes,
                dig_id_mode: self.ledger.dig_id_mode,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_chain_defaults() {
        let config = NodeConfig::default().chain_config();
        let expected = ChainConfig::default();
        assert_eq!(config.max_tx_per_block, expected.max_tx_per_block);
        assert_eq!(config.max_block_bytes, 256 * 1024);
        assert_eq!(config.rules, expected.rules);
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NodeConfig::default();
        config.ledger.dig_id_mode = DigIdMode::Enforce;
        config.to_file(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("dig_id_mode = \"enforce\""));
        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.ledger.dig_id_mode, DigIdMode::Enforce);
        assert_eq!(loaded.producer.batch, 200);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NodeConfig::default();
        config.apply_env_pairs([
            ("VOLCHAIN_DIR", "/tmp/vc"),
            ("VOLCHAIN_MAX_TX_PER_BLOCK", "7"),
            ("VOLCHAIN_DIGID_MODE", "ENFORCE"),
            ("VOLCHAIN_BARRIER_TIMEOUT_MS", "not-a-number"),
            ("UNRELATED", "1"),
        ]);
        assert_eq!(config.data_dir, "/tmp/vc");
        assert_eq!(config.chain.max_tx_per_block, 7);
        assert_eq!(config.ledger.dig_id_mode, DigIdMode::Enforce);
        assert_eq!(config.barrier.timeout_ms, 12_000);
    }
}
