//! Built-in kernel manifest: the default shapes and latencies the model
//! expander assumes for each stage family.

use tessera_types::{MetaMap, MetaValue};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KernelDefaults {
    pub rows: u64,
    pub cols: u64,
    pub latency: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct KernelManifestEntry {
    pub name: &'static str,
    pub default: KernelDefaults,
    pub metadata: MetaMap,
}

fn meta(pairs: &[(&str, MetaValue)]) -> MetaMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

/// The manifest is a fixed table; callers index it by name.
pub fn kernel_manifest() -> Vec<KernelManifestEntry> {
    vec![
        KernelManifestEntry {
            name: "token_prep",
            default: KernelDefaults {
                rows: 256,
                cols: 1024,
                latency: 64,
                bytes: 512 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("token_prep"))]),
        },
        KernelManifestEntry {
            name: "attention",
            default: KernelDefaults {
                rows: 256,
                cols: 256,
                latency: 128,
                bytes: 2 * 1024 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("attention_head"))]),
        },
        KernelManifestEntry {
            name: "gemm",
            default: KernelDefaults {
                rows: 256,
                cols: 256,
                latency: 96,
                bytes: 2 * 1024 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("gemm"))]),
        },
        KernelManifestEntry {
            name: "softmax",
            default: KernelDefaults {
                rows: 256,
                cols: 256,
                latency: 24,
                bytes: 128 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("softmax"))]),
        },
        KernelManifestEntry {
            name: "layernorm",
            default: KernelDefaults {
                rows: 256,
                cols: 1024,
                latency: 24,
                bytes: 512 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("layernorm"))]),
        },
        KernelManifestEntry {
            name: "residual",
            default: KernelDefaults {
                rows: 256,
                cols: 1024,
                latency: 16,
                bytes: 512 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("residual"))]),
        },
        KernelManifestEntry {
            name: "elementwise",
            default: KernelDefaults {
                rows: 256,
                cols: 1024,
                latency: 16,
                bytes: 512 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("elementwise"))]),
        },
        KernelManifestEntry {
            name: "moe_gating",
            default: KernelDefaults {
                rows: 256,
                cols: 8,
                latency: 32,
                bytes: 4 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("moe_gating_scores"))]),
        },
        KernelManifestEntry {
            name: "rram_linear",
            default: KernelDefaults {
                rows: 128,
                cols: 128,
                latency: 56,
                bytes: 32 * 1024,
            },
            metadata: meta(&[("op", MetaValue::from("rram_linear"))]),
        },
        KernelManifestEntry {
            name: "transfer_hd",
            default: KernelDefaults {
                rows: 0,
                cols: 0,
                latency: 0,
                bytes: 4 * 1024 * 1024,
            },
            metadata: meta(&[("direction", MetaValue::from("host_to_digital"))]),
        },
        KernelManifestEntry {
            name: "transfer_dh",
            default: KernelDefaults {
                rows: 0,
                cols: 0,
                latency: 0,
                bytes: 4 * 1024 * 1024,
            },
            metadata: meta(&[("direction", MetaValue::from("digital_to_host"))]),
        },
        KernelManifestEntry {
            name: "transfer_dr",
            default: KernelDefaults {
                rows: 0,
                cols: 0,
                latency: 0,
                bytes: 16 * 1024 * 1024,
            },
            metadata: meta(&[("direction", MetaValue::from("digital_to_rram"))]),
        },
        KernelManifestEntry {
            name: "transfer_rd",
            default: KernelDefaults {
                rows: 0,
                cols: 0,
                latency: 0,
                bytes: 16 * 1024 * 1024,
            },
            metadata: meta(&[("direction", MetaValue::from("rram_to_digital"))]),
        },
    ]
}

pub fn kernel_entry(name: &str) -> Option<KernelManifestEntry> {
    kernel_manifest().into_iter().find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::MetaMapExt;

    #[test]
    fn manifest_has_thirteen_entries() {
        assert_eq!(kernel_manifest().len(), 13);
    }

    #[test]
    fn token_prep_defaults() {
        let entry = kernel_entry("token_prep").unwrap();
        assert_eq!(entry.default.rows, 256);
        assert_eq!(entry.default.latency, 64);
        assert_eq!(entry.metadata.str_of("op"), Some("token_prep"));
    }

    #[test]
    fn transfer_dr_defaults() {
        let entry = kernel_entry("transfer_dr").unwrap();
        assert_eq!(entry.default.bytes, 16 * 1024 * 1024);
        assert_eq!(entry.metadata.str_of("direction"), Some("digital_to_rram"));
    }
}
