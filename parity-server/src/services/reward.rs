/// Per-unit prices for the resources a runner reports.
const CPU_SECOND_PRICE: f64 = 1e-5;
const MEMORY_GB_HOUR_PRICE: f64 = 5e-5;
const STORAGE_GB_PRICE: f64 = 1e-4;
const NETWORK_GB_PRICE: f64 = 1e-4;
const MEGACYCLE_PRICE: f64 = 1e-6;

/// Margin applied on top of raw resource cost.
const MARGIN: f64 = 1.2;

/// The smallest reward ever paid out for a verified result.
const MINIMUM_REWARD: f64 = 0.0001;

/// The resource usage reported with a task result.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceMetrics {
    pub cpu_seconds: f64,
    pub estimated_cycles: i64,
    pub memory_gb_hours: f64,
    pub storage_gb: f64,
    pub network_data_gb: f64,
}

/// Map resource usage to a reward amount. Pure and deterministic.
pub fn calculate(metrics: &ResourceMetrics) -> f64 {
    let ResourceMetrics { cpu_seconds, estimated_cycles, memory_gb_hours, storage_gb, network_data_gb } = metrics;
    let cost = cpu_seconds * CPU_SECOND_PRICE
        + memory_gb_hours * MEMORY_GB_HOUR_PRICE
        + storage_gb * STORAGE_GB_PRICE
        + network_data_gb * NETWORK_GB_PRICE
        + (*estimated_cycles as f64 / 1e6) * MEGACYCLE_PRICE;
    (cost * MARGIN).max(MINIMUM_REWARD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn small_workloads_hit_the_floor() {
        let metrics = ResourceMetrics { cpu_seconds: 1.0, memory_gb_hours: 0.01, ..Default::default() };
        // 1.2 * (1e-5 + 5e-7) is far below the floor.
        assert_eq!(calculate(&metrics), MINIMUM_REWARD);
    }

    #[test]
    fn zero_usage_still_pays_the_floor() {
        assert_eq!(calculate(&ResourceMetrics::default()), MINIMUM_REWARD);
    }

    #[rstest]
    #[case::cpu(ResourceMetrics { cpu_seconds: 100_000.0, ..Default::default() }, 1.2)]
    #[case::memory(ResourceMetrics { memory_gb_hours: 20_000.0, ..Default::default() }, 1.2)]
    #[case::storage(ResourceMetrics { storage_gb: 10_000.0, ..Default::default() }, 1.2)]
    #[case::network(ResourceMetrics { network_data_gb: 10_000.0, ..Default::default() }, 1.2)]
    #[case::cycles(ResourceMetrics { estimated_cycles: 1_000_000_000_000, ..Default::default() }, 1.2)]
    fn per_resource_pricing(#[case] metrics: ResourceMetrics, #[case] expected: f64) {
        let reward = calculate(&metrics);
        assert!((reward - expected).abs() < 1e-9, "got {reward}, want {expected}");
    }

    #[test]
    fn margin_applies_over_summed_cost() {
        let metrics = ResourceMetrics {
            cpu_seconds: 100_000.0,
            memory_gb_hours: 20_000.0,
            ..Default::default()
        };
        let reward = calculate(&metrics);
        assert!((reward - 2.4).abs() < 1e-9, "got {reward}");
    }
}
