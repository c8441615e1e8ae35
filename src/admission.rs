//! Concurrency ceiling for in-flight tasks.
//!
//! The ceiling is resolved once at startup from the declared capability tier,
//! optionally cross-checked against a probed tier, and then stays fixed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

const FALLBACK_CEILING: usize = 1;

/// Source of an independently detected capability tier.
pub trait CapabilityProbe {
    /// `None` means detection failed.
    fn detect(&self) -> Option<String>;
}

/// Queries `nvidia-smi` for the first GPU name and classifies it.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    command: PathBuf,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            command: PathBuf::from("nvidia-smi"),
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProbe for NvidiaSmiProbe {
    fn detect(&self) -> Option<String> {
        let output = match Command::new(&self.command)
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                tracing::info!(error = %err, "could not query GPU, capability detection skipped");
                return None;
            }
        };
        if !output.status.success() {
            tracing::info!(status = %output.status, "GPU query failed");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let name = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
        let tier = classify_gpu_name(name);
        tracing::info!(gpu = name, tier = ?tier, "GPU detected");
        tier.map(str::to_string)
    }
}

/// Coarse tier for a GPU marketing name; `None` when the name is not recognised.
pub fn classify_gpu_name(name: &str) -> Option<&'static str> {
    let name = name.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| name.contains(needle));

    if has(&["a100", "h100", "quadro", "tesla", "rtx a"]) {
        return Some("professional");
    }
    if has(&["intel", "hd graphics", "uhd graphics", "iris"]) {
        return Some("integrated");
    }
    if has(&["nvidia", "geforce", "rtx", "gtx"]) {
        if name.contains("rtx") {
            if has(&["4090", "4080", "3090"]) {
                return Some("high_end");
            }
            if has(&["4070", "4060", "3070", "3060"]) {
                return Some("midrange");
            }
            return Some("entry");
        }
        if name.contains("gtx") {
            if has(&["1650", "1660"]) {
                return Some("entry");
            }
            return Some("midrange");
        }
    }
    if has(&["amd", "radeon"]) && name.contains("rx") {
        if has(&["7900", "7800"]) {
            return Some("high_end");
        }
        if has(&["7700", "7600"]) {
            return Some("midrange");
        }
        return Some("entry");
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ceiling {
    pub max_in_flight: usize,
    pub declared_tier: String,
    pub detected_tier: Option<String>,
}

/// Resolves the process-lifetime ceiling. The declared tier always wins; a
/// disagreeing detection is only logged.
pub fn resolve_ceiling(
    declared_tier: &str,
    table: &BTreeMap<String, usize>,
    probe: Option<&dyn CapabilityProbe>,
) -> Ceiling {
    let declared_max = match table.get(declared_tier) {
        Some(max) => *max,
        None => {
            tracing::warn!(
                tier = declared_tier,
                fallback = FALLBACK_CEILING,
                "declared tier has no ceiling entry"
            );
            FALLBACK_CEILING
        }
    };
    let detected_tier = probe.and_then(|probe| probe.detect());

    let max_in_flight = match detected_tier.as_deref() {
        None => {
            tracing::info!(
                tier = declared_tier,
                max_in_flight = declared_max,
                "using declared capability tier"
            );
            declared_max
        }
        Some(detected) if detected != declared_tier => {
            tracing::info!(
                declared = declared_tier,
                detected,
                max_in_flight = declared_max,
                "detected tier differs from declared tier, keeping declared"
            );
            declared_max
        }
        Some(detected) => {
            let max = table.get(detected).copied().unwrap_or(declared_max);
            tracing::info!(tier = detected, max_in_flight = max, "detected tier matches declared");
            max
        }
    };
    if max_in_flight == 0 {
        tracing::warn!("concurrency ceiling is zero, no task will be admitted");
    }

    Ceiling {
        max_in_flight,
        declared_tier: declared_tier.to_string(),
        detected_tier,
    }
}

pub fn available_slots(ceiling: usize, in_flight: usize) -> usize {
    ceiling.saturating_sub(in_flight)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<&'static str>);

    impl CapabilityProbe for FixedProbe {
        fn detect(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn table() -> BTreeMap<String, usize> {
        [("integrated", 1), ("entry", 2), ("midrange", 4), ("high_end", 6)]
            .iter()
            .map(|(tier, max)| (tier.to_string(), *max))
            .collect()
    }

    #[test]
    fn declared_tier_without_probe() {
        let ceiling = resolve_ceiling("midrange", &table(), None);
        assert_eq!(ceiling.max_in_flight, 4);
        assert_eq!(ceiling.detected_tier, None);
    }

    #[test]
    fn failed_detection_uses_declared() {
        let probe = FixedProbe(None);
        let ceiling = resolve_ceiling("entry", &table(), Some(&probe));
        assert_eq!(ceiling.max_in_flight, 2);
    }

    #[test]
    fn disagreement_keeps_declared_tier() {
        let probe = FixedProbe(Some("high_end"));
        let ceiling = resolve_ceiling("entry", &table(), Some(&probe));
        assert_eq!(ceiling.max_in_flight, 2);
        assert_eq!(ceiling.detected_tier.as_deref(), Some("high_end"));
    }

    #[test]
    fn agreement_uses_detected_value() {
        let probe = FixedProbe(Some("high_end"));
        let ceiling = resolve_ceiling("high_end", &table(), Some(&probe));
        assert_eq!(ceiling.max_in_flight, 6);
    }

    #[test]
    fn unknown_declared_tier_falls_back_to_one() {
        let ceiling = resolve_ceiling("quantum", &table(), None);
        assert_eq!(ceiling.max_in_flight, 1);
    }

    #[test]
    fn slots_never_negative() {
        assert_eq!(available_slots(2, 0), 2);
        assert_eq!(available_slots(2, 1), 1);
        assert_eq!(available_slots(2, 2), 0);
        assert_eq!(available_slots(2, 5), 0);
    }

    #[test]
    fn gpu_names_map_to_tiers() {
        assert_eq!(classify_gpu_name("NVIDIA GeForce RTX 4090"), Some("high_end"));
        assert_eq!(classify_gpu_name("NVIDIA GeForce RTX 3060 Laptop GPU"), Some("midrange"));
        assert_eq!(classify_gpu_name("NVIDIA GeForce RTX 3050"), Some("entry"));
        assert_eq!(classify_gpu_name("NVIDIA GeForce GTX 1660 SUPER"), Some("entry"));
        assert_eq!(classify_gpu_name("NVIDIA GeForce GTX 1080 Ti"), Some("midrange"));
        assert_eq!(classify_gpu_name("NVIDIA A100-SXM4-40GB"), Some("professional"));
        assert_eq!(classify_gpu_name("NVIDIA RTX A4000"), Some("professional"));
        assert_eq!(classify_gpu_name("Intel(R) Iris(R) Xe Graphics"), Some("integrated"));
        assert_eq!(classify_gpu_name("AMD Radeon RX 7900 XTX"), Some("high_end"));
        assert_eq!(classify_gpu_name("Matrox G200"), None);
    }
}
