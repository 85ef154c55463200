//! Kubernetes resource quantity parsing and formatting.
//!
//! CPU is normalised to millicores, memory to bytes. Parsing accepts the
//! quantity forms the metrics API and pod specs actually emit ("100m", "2",
//! "500n", "128Mi", "1G", plain bytes).

pub const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Parse a CPU quantity string (e.g. "100m", "1", "500n") to millicores.
pub fn parse_cpu(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    if let Some(val) = quantity.strip_suffix('n') {
        // Nanocores to millicores
        val.parse::<u64>().ok().map(|n| n / 1_000_000)
    } else if let Some(val) = quantity.strip_suffix('u') {
        // Microcores to millicores
        val.parse::<u64>().ok().map(|u| u / 1_000)
    } else if let Some(val) = quantity.strip_suffix('m') {
        val.parse::<u64>().ok()
    } else {
        // Whole cores to millicores
        quantity.parse::<f64>().ok().map(|c| (c * 1000.0) as u64)
    }
}

/// Parse a memory quantity string (e.g. "128Mi", "1Gi", "256000Ki") to bytes.
pub fn parse_memory(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    if let Some(val) = quantity.strip_suffix("Ki") {
        val.parse::<u64>().ok().map(|k| k * 1024)
    } else if let Some(val) = quantity.strip_suffix("Mi") {
        val.parse::<u64>().ok().map(|m| m * MIB)
    } else if let Some(val) = quantity.strip_suffix("Gi") {
        val.parse::<u64>().ok().map(|g| g * GIB)
    } else if let Some(val) = quantity.strip_suffix("Ti") {
        val.parse::<u64>().ok().map(|t| t * 1024 * GIB)
    } else if let Some(val) = quantity.strip_suffix('K').or_else(|| quantity.strip_suffix('k')) {
        val.parse::<u64>().ok().map(|k| k * 1000)
    } else if let Some(val) = quantity.strip_suffix('M') {
        val.parse::<u64>().ok().map(|m| m * 1_000_000)
    } else if let Some(val) = quantity.strip_suffix('G') {
        val.parse::<u64>().ok().map(|g| g * 1_000_000_000)
    } else {
        quantity.parse::<u64>().ok()
    }
}

/// Format millicores as a Kubernetes CPU quantity string.
pub fn format_cpu(millicores: u64) -> String {
    if millicores >= 1000 && millicores % 1000 == 0 {
        format!("{}", millicores / 1000)
    } else {
        format!("{millicores}m")
    }
}

/// Format bytes as a Kubernetes memory quantity string.
///
/// Values are expected to be MiB-aligned (the calculator rounds up to 1 MiB);
/// anything else falls back to Ki.
pub fn format_memory(bytes: u64) -> String {
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else {
        format!("{}Ki", bytes.div_ceil(1024))
    }
}

/// Round bytes up to the nearest 1 MiB to avoid churn on tiny deltas.
pub fn ceil_to_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB) * MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("100m"), Some(100));
        assert_eq!(parse_cpu("1"), Some(1000));
        assert_eq!(parse_cpu("0.5"), Some(500));
        assert_eq!(parse_cpu("2.5"), Some(2500));
        assert_eq!(parse_cpu("500000000n"), Some(500));
        assert_eq!(parse_cpu("500000u"), Some(500));
        assert_eq!(parse_cpu(""), None);
        assert_eq!(parse_cpu("abc"), None);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("128Mi"), Some(128 * MIB));
        assert_eq!(parse_memory("1Gi"), Some(GIB));
        assert_eq!(parse_memory("256Ki"), Some(256 * 1024));
        assert_eq!(parse_memory("500M"), Some(500_000_000));
        assert_eq!(parse_memory("1G"), Some(1_000_000_000));
        assert_eq!(parse_memory("1000000"), Some(1_000_000));
        assert_eq!(parse_memory("x"), None);
    }

    #[test]
    fn test_format_cpu() {
        assert_eq!(format_cpu(250), "250m");
        assert_eq!(format_cpu(1000), "1");
        assert_eq!(format_cpu(1500), "1500m");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(128 * MIB), "128Mi");
        assert_eq!(format_memory(2 * GIB), "2Gi");
        assert_eq!(format_memory(1536 * MIB), "1536Mi");
    }

    #[test]
    fn test_ceil_to_mib() {
        assert_eq!(ceil_to_mib(1), MIB);
        assert_eq!(ceil_to_mib(MIB), MIB);
        assert_eq!(ceil_to_mib(MIB + 1), 2 * MIB);
    }
}
