//! Type-partitioned vehicle-beacon assignment.
//!
//! Matching is constrained by the physical rule that a beacon identifies
//! at most one vehicle: within each construction subtype, vehicles and
//! whitelisted beacons of that subtype are matched by minimum-cost
//! assignment on |vehicle depth − beacon distance|, and when more
//! vehicles than beacons of a type are present the surplus vehicles stay
//! unregistered.

use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;

use crate::beacon::domain::scanner::BeaconReading;
use crate::beacon::history::BeaconHistoryTable;
use crate::beacon::whitelist::Whitelist;
use crate::config::MultiTargetConfig;
use crate::detection::domain::vehicle_detector::VehicleClass;
use crate::shared::assignment::{min_cost_assignment, INFEASIBLE};

/// One construction vehicle entering the matching round.
#[derive(Clone, Debug)]
pub struct VehicleObservation {
    pub track_id: u64,
    pub class: VehicleClass,
    /// Smoothed camera depth in metres, when available.
    pub depth_m: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct MatchedBeacon {
    pub mac: String,
    pub distance_m: f64,
    pub cost: f64,
}

#[derive(Clone, Debug)]
pub struct BeaconMatch {
    pub track_id: u64,
    pub matched: Option<MatchedBeacon>,
}

pub struct BeaconMatcher {
    enabled: bool,
    match_cost_threshold: f64,
    time_stability_weight: f64,
    stability_window: Duration,
    history: BeaconHistoryTable,
}

impl BeaconMatcher {
    pub fn new(config: &MultiTargetConfig) -> Self {
        Self {
            enabled: config.enabled,
            match_cost_threshold: config.match_cost_threshold,
            time_stability_weight: config.time_stability_weight,
            stability_window: Duration::from_secs_f64(config.stability_window.max(0.0)),
            history: BeaconHistoryTable::new(),
        }
    }

    /// Feeds one scanner snapshot into the stability history. Call once
    /// per frame before matching.
    pub fn observe(&mut self, readings: &[BeaconReading]) {
        self.history.observe(readings);
    }

    /// Matches unlocked construction vehicles against the whitelisted
    /// readings of their subtype. Every input vehicle appears exactly
    /// once in the result, matched or not.
    pub fn match_vehicles(
        &self,
        vehicles: &[VehicleObservation],
        readings: &[BeaconReading],
        whitelist: &Whitelist,
    ) -> Vec<BeaconMatch> {
        let mut results: Vec<BeaconMatch> = vehicles
            .iter()
            .map(|v| BeaconMatch {
                track_id: v.track_id,
                matched: None,
            })
            .collect();
        if vehicles.is_empty() || readings.is_empty() {
            return results;
        }

        // Only whitelisted beacons with a recognised machine type take
        // part; everything else is radio noise at the gate.
        let mut beacons_by_class: BTreeMap<VehicleClass, Vec<&BeaconReading>> = BTreeMap::new();
        for reading in readings {
            if let Some(class) = whitelist.machine_class(&reading.mac) {
                beacons_by_class.entry(class).or_default().push(reading);
            }
        }

        let mut vehicles_by_class: BTreeMap<VehicleClass, Vec<usize>> = BTreeMap::new();
        for (i, vehicle) in vehicles.iter().enumerate() {
            vehicles_by_class.entry(vehicle.class).or_default().push(i);
        }

        if !self.enabled {
            self.match_independently(vehicles, &vehicles_by_class, &beacons_by_class, &mut results);
            return results;
        }

        for (class, vehicle_indices) in &vehicles_by_class {
            let Some(class_beacons) = beacons_by_class.get(class) else {
                debug!(
                    "no {} beacons visible; {} vehicle(s) stay unregistered",
                    class.label(),
                    vehicle_indices.len()
                );
                continue;
            };

            let costs: Vec<Vec<f64>> = vehicle_indices
                .iter()
                .map(|&vi| {
                    class_beacons
                        .iter()
                        .map(|b| self.pair_cost(vehicles[vi].depth_m, b))
                        .collect()
                })
                .collect();

            for (row, col) in min_cost_assignment(&costs, self.match_cost_threshold) {
                let vi = vehicle_indices[row];
                let beacon = class_beacons[col];
                results[vi].matched = Some(MatchedBeacon {
                    mac: beacon.mac.clone(),
                    distance_m: beacon.distance_m,
                    cost: costs[row][col],
                });
            }
        }
        results
    }

    /// Single-target fallback when multi-target matching is disabled:
    /// each vehicle independently takes its cheapest in-type beacon.
    fn match_independently(
        &self,
        vehicles: &[VehicleObservation],
        vehicles_by_class: &BTreeMap<VehicleClass, Vec<usize>>,
        beacons_by_class: &BTreeMap<VehicleClass, Vec<&BeaconReading>>,
        results: &mut [BeaconMatch],
    ) {
        for (class, vehicle_indices) in vehicles_by_class {
            let Some(class_beacons) = beacons_by_class.get(class) else {
                continue;
            };
            for &vi in vehicle_indices {
                let best = class_beacons
                    .iter()
                    .map(|b| (self.pair_cost(vehicles[vi].depth_m, b), *b))
                    .filter(|(cost, _)| *cost <= self.match_cost_threshold)
                    .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((cost, beacon)) = best {
                    results[vi].matched = Some(MatchedBeacon {
                        mac: beacon.mac.clone(),
                        distance_m: beacon.distance_m,
                        cost,
                    });
                }
            }
        }
    }

    /// Distance residual plus the stability penalty. Without camera
    /// depth the residual is unknowable and matching degrades to a
    /// stability-only cost.
    fn pair_cost(&self, depth_m: Option<f64>, beacon: &BeaconReading) -> f64 {
        let stability = self.history.stability_penalty(&beacon.mac, self.stability_window)
            * self.time_stability_weight
            * self.stability_window.as_secs_f64();
        match depth_m {
            Some(depth) if beacon.distance_m > 0.0 => {
                (depth - beacon.distance_m).abs() + stability
            }
            Some(_) => INFEASIBLE,
            None => stability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::whitelist::WhitelistEntry;
    use std::time::Instant;

    const MAC_1: &str = "AA:BB:CC:DD:EE:01";
    const MAC_2: &str = "AA:BB:CC:DD:EE:02";

    fn matcher() -> BeaconMatcher {
        BeaconMatcher::new(&MultiTargetConfig::default())
    }

    fn reading(mac: &str, distance_m: f64) -> BeaconReading {
        BeaconReading {
            mac: mac.into(),
            rssi: -65.0,
            distance_m,
            observed_at: Instant::now(),
        }
    }

    fn whitelist(entries: &[(&str, &str)]) -> Whitelist {
        Whitelist::from_entries(
            entries
                .iter()
                .enumerate()
                .map(|(i, (mac, machine_type))| WhitelistEntry {
                    id: i as i64 + 1,
                    beacon_number: i as i64 + 1,
                    mac_address: (*mac).into(),
                    machine_type: (*machine_type).into(),
                    environment_code: "ENV".into(),
                    registration_date: "2025-01-01".into(),
                    equipment_owner: None,
                })
                .collect(),
        )
    }

    fn excavator(track_id: u64, depth_m: f64) -> VehicleObservation {
        VehicleObservation {
            track_id,
            class: VehicleClass::Excavator,
            depth_m: Some(depth_m),
        }
    }

    #[test]
    fn test_two_excavators_one_beacon() {
        // The spec's seed scenario: the nearer vehicle takes the single
        // beacon, the surplus vehicle stays unmatched.
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "excavator")]);
        let vehicles = [excavator(1, 5.10), excavator(2, 9.80)];
        let readings = [reading(MAC_1, 5.05)];

        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].matched.as_ref().unwrap().mac, MAC_1);
        assert!(matches[1].matched.is_none());
    }

    #[test]
    fn test_type_partition_prevents_cross_matching() {
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "loader")]);
        // An excavator at exactly the loader beacon's distance must not
        // claim it.
        let vehicles = [excavator(1, 5.0)];
        let readings = [reading(MAC_1, 5.0)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert!(matches[0].matched.is_none());
    }

    #[test]
    fn test_non_whitelisted_beacons_ignored() {
        let m = matcher();
        let wl = whitelist(&[]);
        let vehicles = [excavator(1, 5.0)];
        let readings = [reading(MAC_1, 5.0)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert!(matches[0].matched.is_none());
    }

    #[test]
    fn test_cost_gate_rejects_distant_pairs() {
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "excavator")]);
        // Residual 7 m exceeds the 5.0 default threshold.
        let vehicles = [excavator(1, 2.0)];
        let readings = [reading(MAC_1, 9.0)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert!(matches[0].matched.is_none());
    }

    #[test]
    fn test_optimal_pairing_of_two_vehicles_two_beacons() {
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "excavator"), (MAC_2, "excavator")]);
        let vehicles = [excavator(1, 5.0), excavator(2, 8.0)];
        let readings = [reading(MAC_2, 8.1), reading(MAC_1, 5.2)];

        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert_eq!(matches[0].matched.as_ref().unwrap().mac, MAC_1);
        assert_eq!(matches[1].matched.as_ref().unwrap().mac, MAC_2);
    }

    #[test]
    fn test_vehicle_without_depth_can_still_match_alone() {
        // Depth missing: matching degrades to RSSI-derived stability
        // cost only.
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "excavator")]);
        let vehicles = [VehicleObservation {
            track_id: 1,
            class: VehicleClass::Excavator,
            depth_m: None,
        }];
        let readings = [reading(MAC_1, 5.0)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert!(matches[0].matched.is_some());
    }

    #[test]
    fn test_empty_inputs() {
        let m = matcher();
        let wl = whitelist(&[(MAC_1, "excavator")]);
        assert!(m.match_vehicles(&[], &[reading(MAC_1, 5.0)], &wl).is_empty());
        let matches = m.match_vehicles(&[excavator(1, 5.0)], &[], &wl);
        assert!(matches[0].matched.is_none());
    }

    #[test]
    fn test_single_target_fallback_when_disabled() {
        let m = BeaconMatcher::new(&MultiTargetConfig {
            enabled: false,
            ..MultiTargetConfig::default()
        });
        let wl = whitelist(&[(MAC_1, "excavator")]);
        // Both vehicles independently pick the same beacon in fallback
        // mode; the assignment constraint only holds when enabled.
        let vehicles = [excavator(1, 5.0), excavator(2, 5.2)];
        let readings = [reading(MAC_1, 5.1)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert!(matches[0].matched.is_some());
        assert!(matches[1].matched.is_some());
    }

    #[test]
    fn test_flickering_beacon_costs_more() {
        let mut m = matcher();
        // Build an unstable history for MAC_1.
        for d in [2.0, 9.0, 2.5, 8.5] {
            m.observe(&[reading(MAC_1, d)]);
        }
        let wl = whitelist(&[(MAC_1, "excavator"), (MAC_2, "excavator")]);
        let vehicles = [excavator(1, 5.0)];
        // Identical residuals; the stable beacon must win.
        let readings = [reading(MAC_1, 5.0), reading(MAC_2, 5.0)];
        let matches = m.match_vehicles(&vehicles, &readings, &wl);
        assert_eq!(matches[0].matched.as_ref().unwrap().mac, MAC_2);
    }
}
