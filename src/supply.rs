use std::collections::{BTreeMap, HashMap};

use ndarray::prelude::*;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::path_states::DepArrMode;
use crate::trace::TraceContext;
use crate::PathfinderError;


/// Named numeric attributes of a link or trip.
pub type Attributes = HashMap<String, f64>;

/// Weight coefficients by attribute name.  Ordered so that cost tallies sum the
/// terms in a reproducible order.
pub type NamedWeights = BTreeMap<String, f64>;


/// A (trip, sequence, stop) key, used for the bump-wait capacity map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TripStop {
    pub trip_id: i32,
    pub seq: i32,
    pub stop_id: i32,
}

/// One scheduled visit of a trip to a stop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TripStopTime {
    pub trip_id: i32,
    pub seq: i32,
    pub stop_id: i32,
    pub arrive_time: f64,
    pub depart_time: f64,
}

#[derive(Clone, Debug, Default)]
pub struct TripInfo {
    pub supply_mode_num: i32,
    pub route_id: i32,
    pub attrs: Attributes,
}

/// Key into the weight table: who is traveling and what kind of link they are on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserClassMode {
    pub user_class: String,
    pub demand_mode_type: DepArrMode,
    pub demand_mode: String,
}

impl UserClassMode {
    pub fn new(user_class: &str, demand_mode_type: DepArrMode, demand_mode: &str)
               -> UserClassMode {
        return UserClassMode {
            user_class: String::from(user_class),
            demand_mode_type,
            demand_mode: String::from(demand_mode),
        };
    }
}


/// The immutable transit supply: id maps, schedules, access/egress and transfer
/// links, trip attributes, and the weight table.  Built once by the host and
/// shared read-only by every search.
pub struct Supply {
    trip_num_to_str: HashMap<i32, String>,
    stop_num_to_str: HashMap<i32, String>,
    route_num_to_str: HashMap<i32, String>,
    mode_num_to_str: HashMap<i32, String>,
    transfer_supply_mode: i32,
    // TAZ -> supply mode -> stop -> attributes.  BTreeMaps because iteration
    // order is observable through sampling, and must be reproducible.
    taz_access_links: HashMap<i32, BTreeMap<i32, BTreeMap<i32, Attributes>>>,
    // transfer links as a directed graph over stop ids; edges_directed serves
    // both the forward (inbound) and reverse (outbound) relaxations
    transfer_links: DiGraphMap<i32, Attributes>,
    trip_info: HashMap<i32, TripInfo>,
    weight_lookup: BTreeMap<UserClassMode, BTreeMap<i32, NamedWeights>>,
    trip_stop_times: HashMap<i32, Vec<TripStopTime>>,
    stop_trip_times: HashMap<i32, Vec<TripStopTime>>,
}

impl Supply {
    pub fn new() -> Supply {
        return Supply {
            trip_num_to_str: HashMap::new(),
            stop_num_to_str: HashMap::new(),
            route_num_to_str: HashMap::new(),
            mode_num_to_str: HashMap::new(),
            transfer_supply_mode: -1,
            taz_access_links: HashMap::new(),
            transfer_links: DiGraphMap::new(),
            trip_info: HashMap::new(),
            weight_lookup: BTreeMap::new(),
            trip_stop_times: HashMap::new(),
            stop_trip_times: HashMap::new(),
        };
    }

    pub fn add_trip_id(&mut self, num: i32, name: &str) {
        self.trip_num_to_str.insert(num, String::from(name));
    }

    pub fn add_stop_id(&mut self, num: i32, name: &str) {
        self.stop_num_to_str.insert(num, String::from(name));
    }

    pub fn add_route_id(&mut self, num: i32, name: &str) {
        self.route_num_to_str.insert(num, String::from(name));
    }

    /// The supply mode named "transfer" is singled out for transfer costs.
    pub fn add_supply_mode(&mut self, num: i32, name: &str) {
        if name == "transfer" {
            self.transfer_supply_mode = num;
        }
        self.mode_num_to_str.insert(num, String::from(name));
    }

    pub fn add_access_link(&mut self, taz: i32, supply_mode: i32, stop_id: i32,
                           attrs: Attributes) {
        self.taz_access_links
            .entry(taz)
            .or_insert_with(BTreeMap::new)
            .entry(supply_mode)
            .or_insert_with(BTreeMap::new)
            .insert(stop_id, attrs);
    }

    pub fn add_transfer_link(&mut self, from_stop: i32, to_stop: i32, attrs: Attributes) {
        self.transfer_links.add_edge(from_stop, to_stop, attrs);
    }

    pub fn add_trip_info(&mut self, trip_id: i32, supply_mode_num: i32, route_id: i32,
                         attrs: Attributes) {
        self.trip_info.insert(trip_id, TripInfo { supply_mode_num, route_id, attrs });
    }

    pub fn add_weight(&mut self, user_class: &str, demand_mode_type: DepArrMode,
                      demand_mode: &str, supply_mode: i32, weight_name: &str, value: f64) {
        let ucm = UserClassMode::new(user_class, demand_mode_type, demand_mode);
        self.weight_lookup
            .entry(ucm)
            .or_insert_with(BTreeMap::new)
            .entry(supply_mode)
            .or_insert_with(BTreeMap::new)
            .insert(String::from(weight_name), value);
    }

    /// Load the schedule from two parallel arrays: an [N x 3] integer matrix of
    /// (trip, sequence, stop) and an [N x 2] real matrix of (arrive, depart)
    /// minutes.  Each trip's sequence must start at 1 and increase by 1.
    pub fn set_stop_times(&mut self, index: ArrayView2<i32>, times: ArrayView2<f64>)
                          -> Result<(), PathfinderError> {
        if index.ncols() != 3 {
            return Err(PathfinderError::BadArrayShape {
                name: "stop time index columns", expected: 3, got: index.ncols() });
        }
        if times.ncols() != 2 {
            return Err(PathfinderError::BadArrayShape {
                name: "stop time value columns", expected: 2, got: times.ncols() });
        }
        if index.nrows() != times.nrows() {
            return Err(PathfinderError::BadArrayShape {
                name: "stop time rows", expected: index.nrows(), got: times.nrows() });
        }

        self.trip_stop_times.clear();
        self.stop_trip_times.clear();
        for ii in 0..index.nrows() {
            let stt = TripStopTime {
                trip_id: index[[ii, 0]],
                seq: index[[ii, 1]],
                stop_id: index[[ii, 2]],
                arrive_time: times[[ii, 0]],
                depart_time: times[[ii, 1]],
            };
            let trip_times = self.trip_stop_times.entry(stt.trip_id).
                or_insert_with(Vec::new);
            let expected = trip_times.len() as i32 + 1;
            if stt.seq != expected {
                return Err(PathfinderError::BadStopSequence {
                    trip_id: stt.trip_id, row: ii, expected, got: stt.seq });
            }
            trip_times.push(stt);
            self.stop_trip_times.entry(stt.stop_id).or_insert_with(Vec::new).push(stt);
        }
        Ok(())
    }

    pub fn transfer_supply_mode(&self) -> i32 {
        return self.transfer_supply_mode;
    }

    pub fn trip_name(&self, trip_id: i32) -> String {
        match self.trip_num_to_str.get(&trip_id) {
            Some(name) => name.clone(),
            None => format!("{}", trip_id),
        }
    }

    pub fn stop_name(&self, stop_id: i32) -> String {
        match self.stop_num_to_str.get(&stop_id) {
            Some(name) => name.clone(),
            None => format!("{}", stop_id),
        }
    }

    pub fn mode_name(&self, mode_num: i32) -> String {
        match self.mode_num_to_str.get(&mode_num) {
            Some(name) => name.clone(),
            None => format!("{}", mode_num),
        }
    }

    pub fn weights(&self, ucm: &UserClassMode) -> Option<&BTreeMap<i32, NamedWeights>> {
        self.weight_lookup.get(ucm)
    }

    pub fn access_links(&self, taz: i32) -> Option<&BTreeMap<i32, BTreeMap<i32, Attributes>>> {
        self.taz_access_links.get(&taz)
    }

    pub fn access_link_attrs(&self, taz: i32, supply_mode: i32, stop_id: i32)
                             -> Option<&Attributes> {
        self.taz_access_links.get(&taz)
            .and_then(|by_mode| by_mode.get(&supply_mode))
            .and_then(|by_stop| by_stop.get(&stop_id))
    }

    /// Transfer neighbors of a stop: stops we can transfer *from* when outbound
    /// (searching backwards) and *to* when inbound.
    pub fn transfer_neighbors(&self, stop_id: i32, outbound: bool) -> Vec<(i32, &Attributes)> {
        if !self.transfer_links.contains_node(stop_id) {
            return vec![];
        }
        let dir = if outbound { Direction::Incoming } else { Direction::Outgoing };
        self.transfer_links.neighbors_directed(stop_id, dir)
            .filter_map(|neighbor| {
                let (from, to) = if outbound { (neighbor, stop_id) } else { (stop_id, neighbor) };
                self.transfer_links.edge_weight(from, to).map(|attrs| (neighbor, attrs))
            })
            .collect()
    }

    pub fn transfer_attrs(&self, from_stop: i32, to_stop: i32) -> Option<&Attributes> {
        self.transfer_links.edge_weight(from_stop, to_stop)
    }

    pub fn trip_info(&self, trip_id: i32) -> Option<&TripInfo> {
        self.trip_info.get(&trip_id)
    }

    pub fn stop_times_for_trip(&self, trip_id: i32) -> Option<&Vec<TripStopTime>> {
        self.trip_stop_times.get(&trip_id)
    }

    /// Trips usable at a stop near the given timepoint.  Outbound searches run
    /// backwards, so this returns trips arriving within (timepoint - window,
    /// timepoint]; inbound returns trips departing within [timepoint,
    /// timepoint + window).
    pub fn trips_within_time(&self, stop_id: i32, outbound: bool, timepoint: f64,
                             time_window: f64) -> Vec<TripStopTime> {
        let visits = match self.stop_trip_times.get(&stop_id) {
            Some(visits) => visits,
            None => return vec![],
        };
        visits.iter()
            .filter(|stt| {
                if outbound {
                    stt.arrive_time <= timepoint && stt.arrive_time > timepoint - time_window
                } else {
                    stt.depart_time >= timepoint && stt.depart_time < timepoint + time_window
                }
            })
            .cloned()
            .collect()
    }

    /// The scheduled departure of a trip from a stop, optionally pinned to a
    /// sequence number (pass a negative sequence to match any visit).
    pub fn scheduled_departure(&self, trip_id: i32, stop_id: i32, sequence: i32) -> Option<f64> {
        let stop_times = self.trip_stop_times.get(&trip_id)?;
        for stt in stop_times {
            if stt.stop_id != stop_id {
                continue;
            }
            if sequence < 0 || sequence == stt.seq {
                return Some(stt.depart_time);
            }
        }
        None
    }

    /// Generalized link cost: the weighted sum of the named attributes.  A
    /// weight naming a missing attribute is reported and its term skipped.
    pub fn tally_link_cost(&self, supply_mode_num: i32, weights: &NamedWeights,
                           attributes: &Attributes, trace: &mut TraceContext) -> f64 {
        let mut cost = 0.0;
        if trace.enabled() {
            trace.note(&format!("Link cost for {:<15}{:>15} x attribute",
                                self.mode_name(supply_mode_num), "weight"));
        }
        for (weight_name, weight_value) in weights {
            match attributes.get(weight_name) {
                Some(attr_value) => {
                    cost += weight_value * attr_value;
                    if trace.enabled() {
                        trace.note(&format!("{:>26}:  + {:>13.4} x {}",
                                            weight_name, weight_value, attr_value));
                    }
                }
                None => {
                    log::warn!("no attribute called {} for supply mode {}",
                               weight_name, self.mode_name(supply_mode_num));
                    if trace.enabled() {
                        trace.note(&format!(" => NO ATTRIBUTE CALLED {}", weight_name));
                    }
                }
            }
        }
        if trace.enabled() {
            trace.note(&format!("{:>26}:  = {:>13.4}", "final cost", cost));
        }
        return cost;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, f64)]) -> Attributes {
        pairs.iter().map(|(kk, vv)| (String::from(*kk), *vv)).collect()
    }

    #[test]
    fn test_stop_times_indexing() {
        let mut supply = Supply::new();
        let index = array![[7, 1, 10], [7, 2, 11], [7, 3, 12], [8, 1, 11]];
        let times = array![[480.0, 480.5], [490.0, 491.0], [500.0, 500.0], [495.0, 495.0]];
        supply.set_stop_times(index.view(), times.view()).unwrap();

        assert_eq!(supply.stop_times_for_trip(7).unwrap().len(), 3);
        assert_eq!(supply.scheduled_departure(7, 11, 2), Some(491.0));
        assert_eq!(supply.scheduled_departure(7, 11, -1), Some(491.0));
        assert_eq!(supply.scheduled_departure(7, 99, -1), None);

        // outbound: arrivals in (timepoint - window, timepoint]
        let trips = supply.trips_within_time(11, true, 495.0, 10.0);
        assert_eq!(trips.len(), 2);
        // inbound: departures in [timepoint, timepoint + window)
        let trips = supply.trips_within_time(11, false, 492.0, 10.0);
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].trip_id, 8);
    }

    #[test]
    fn test_stop_times_sequence_gap_rejected() {
        let mut supply = Supply::new();
        let index = array![[7, 1, 10], [7, 3, 12]];
        let times = array![[480.0, 480.0], [500.0, 500.0]];
        assert!(supply.set_stop_times(index.view(), times.view()).is_err());
    }

    #[test]
    fn test_transfer_neighbors_directionality() {
        let mut supply = Supply::new();
        supply.add_transfer_link(1, 2, attrs(&[("time_min", 4.0)]));
        supply.add_transfer_link(3, 2, attrs(&[("time_min", 6.0)]));

        // outbound relaxation of stop 2 reaches the stops transferring into it
        let mut from_stops: Vec<i32> = supply.transfer_neighbors(2, true)
            .iter().map(|(ss, _)| *ss).collect();
        from_stops.sort();
        assert_eq!(from_stops, vec![1, 3]);

        // inbound relaxation walks forwards
        let to_stops: Vec<i32> = supply.transfer_neighbors(1, false)
            .iter().map(|(ss, _)| *ss).collect();
        assert_eq!(to_stops, vec![2]);
        assert!(supply.transfer_neighbors(99, true).is_empty());
    }

    #[test]
    fn test_tally_skips_missing_and_allows_negative() {
        let supply = Supply::new();
        let mut trace = TraceContext::disabled(&supply);
        let mut weights = NamedWeights::new();
        weights.insert(String::from("time_min"), 2.0);
        weights.insert(String::from("reliability"), -0.5);
        weights.insert(String::from("not_there"), 100.0);

        let link_attrs = attrs(&[("time_min", 10.0), ("reliability", 4.0)]);
        let cost = supply.tally_link_cost(1, &weights, &link_attrs, &mut trace);
        // negative weights are legal, missing attributes drop their term
        assert!((cost - 18.0).abs() < 1e-9);
    }
}
