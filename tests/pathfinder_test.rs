use std::path::Path;

use ndarray::prelude::*;

use rust_transit_pathfinder::{
    Attributes, DepArrMode, PathFinder, PathSpecification, SearchParams, Supply,
};


fn time_attrs(time_min: f64) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(String::from("time_min"), time_min);
    attrs
}

fn add_base_weights(supply: &mut Supply) {
    supply.add_weight("all", DepArrMode::Access, "walk", 1, "time_min", 1.0);
    supply.add_weight("all", DepArrMode::Egress, "walk", 1, "time_min", 1.0);
    supply.add_weight("all", DepArrMode::Transit, "bus", 2, "in_vehicle_time_min", 1.0);
    supply.add_weight("all", DepArrMode::Transit, "bus", 2, "wait_time_min", 1.0);
    supply.add_weight("all", DepArrMode::Transfer, "transfer", 3, "time_min", 1.0);
}

fn add_id_maps(supply: &mut Supply, num_stops: i32) {
    for num in 1..=num_stops {
        supply.add_stop_id(num, &format!("s{}", num));
    }
    supply.add_supply_mode(1, "walk");
    supply.add_supply_mode(2, "bus");
    supply.add_supply_mode(3, "transfer");
}

/// Two TAZs with one direct trip between two stops:
/// A(100) -3min-> s1 -(trip 11: dep 08:00, arr 08:05)-> s2 -2min-> B(200).
fn direct_trip_supply() -> Supply {
    let mut supply = Supply::new();
    add_id_maps(&mut supply, 2);
    supply.add_trip_id(11, "blue_1");
    supply.add_route_id(1, "blue");
    supply.add_trip_info(11, 2, 1, Attributes::new());

    let index = array![[11, 1, 1], [11, 2, 2]];
    let times = array![[480.0, 480.0], [485.0, 485.0]];
    supply.set_stop_times(index.view(), times.view()).unwrap();

    supply.add_access_link(100, 1, 1, time_attrs(3.0));
    supply.add_access_link(200, 1, 2, time_attrs(2.0));
    add_base_weights(&mut supply);
    supply
}

/// The transfer network: the only way from A to B is trip 11, a 4 minute walk
/// from s2 to s3, then trip 12.
/// A(100) -3-> s1 -(11: 08:20 -> 08:30)-> s2 ~4~> s3 -(12: 08:40 -> 08:46)-> s4 -1-> B(200).
fn transfer_supply() -> Supply {
    let mut supply = Supply::new();
    add_id_maps(&mut supply, 4);
    supply.add_trip_id(11, "blue_1");
    supply.add_trip_id(12, "green_1");
    supply.add_route_id(1, "blue");
    supply.add_route_id(2, "green");
    supply.add_trip_info(11, 2, 1, Attributes::new());
    supply.add_trip_info(12, 2, 2, Attributes::new());

    let index = array![[11, 1, 1], [11, 2, 2], [12, 1, 3], [12, 2, 4]];
    let times = array![[500.0, 500.0], [510.0, 510.0], [520.0, 520.0], [526.0, 526.0]];
    supply.set_stop_times(index.view(), times.view()).unwrap();

    supply.add_access_link(100, 1, 1, time_attrs(3.0));
    supply.add_access_link(200, 1, 4, time_attrs(1.0));
    supply.add_transfer_link(2, 3, time_attrs(4.0));
    add_base_weights(&mut supply);
    supply
}

/// Two parallel trips from s1 to s2 whose reconciled path costs are 10 and 12:
/// trip 11 rides 4 minutes, trip 12 rides 6.
fn two_alternative_supply() -> Supply {
    let mut supply = Supply::new();
    add_id_maps(&mut supply, 2);
    supply.add_trip_id(11, "fast_1");
    supply.add_trip_id(12, "slow_1");
    supply.add_route_id(1, "fast");
    supply.add_route_id(2, "slow");
    supply.add_trip_info(11, 2, 1, Attributes::new());
    supply.add_trip_info(12, 2, 2, Attributes::new());

    let index = array![[11, 1, 1], [11, 2, 2], [12, 1, 1], [12, 2, 2]];
    let times = array![[480.0, 480.0], [484.0, 484.0], [480.0, 480.0], [486.0, 486.0]];
    supply.set_stop_times(index.view(), times.view()).unwrap();

    supply.add_access_link(100, 1, 1, time_attrs(2.0));
    supply.add_access_link(200, 1, 2, time_attrs(4.0));
    add_base_weights(&mut supply);
    supply
}

fn base_spec(hyperpath: bool, outbound: bool, preferred_time: f64) -> PathSpecification {
    PathSpecification {
        iteration: 1,
        passenger_id: 1,
        path_id: 1,
        hyperpath,
        user_class: String::from("all"),
        access_mode: String::from("walk"),
        transit_mode: String::from("bus"),
        egress_mode: String::from("walk"),
        origin_taz_id: 100,
        destination_taz_id: 200,
        outbound,
        preferred_time,
        trace: false,
    }
}

fn modes_of(result: &rust_transit_pathfinder::FoundPath) -> Vec<i32> {
    (0..result.path_int.nrows()).map(|ii| result.path_int[[ii, 1]]).collect()
}


#[test]
fn test_deterministic_direct_trip() {
    let finder = PathFinder::new(SearchParams::default(), direct_trip_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(false, true, 490.0)).unwrap();

    assert!(result.path_found());
    assert_eq!(result.path_int.nrows(), 3);
    assert_eq!(modes_of(&result), vec![DepArrMode::Access.to_int(),
                                       DepArrMode::Transit.to_int(),
                                       DepArrMode::Egress.to_int()]);
    // stop column: TAZ, board stop, alight stop
    assert_eq!(result.path_int[[0, 0]], 100);
    assert_eq!(result.path_int[[1, 0]], 1);
    assert_eq!(result.path_int[[2, 0]], 2);
    assert_eq!(result.path_int[[1, 2]], 11);

    // total link time is 3 + 5 + 2 and the cost is the sum of those times
    let link_times: Vec<f64> = (0..3).map(|ii| result.path_real[[ii, 2]]).collect();
    assert_eq!(link_times, vec![3.0, 5.0, 2.0]);
    assert!((result.total_cost - 10.0).abs() < 1e-6);

    // the access link is pinned to the vehicle departure
    assert_eq!(result.path_real[[0, 1]], 477.0);
    assert_eq!(result.path_real[[0, 4]], 480.0);
}

#[test]
fn test_deterministic_transfer() {
    let finder = PathFinder::new(SearchParams::default(), transfer_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(false, true, 530.0)).unwrap();

    assert!(result.path_found());
    assert_eq!(modes_of(&result), vec![DepArrMode::Access.to_int(),
                                       DepArrMode::Transit.to_int(),
                                       DepArrMode::Transfer.to_int(),
                                       DepArrMode::Transit.to_int(),
                                       DepArrMode::Egress.to_int()]);
    // the transfer walks from s2 to s3 between the two trips
    assert_eq!(result.path_int[[2, 0]], 2);
    assert_eq!(result.path_int[[2, 3]], 3);
    assert_eq!(result.path_int[[1, 2]], 11);
    assert_eq!(result.path_int[[3, 2]], 12);

    // access 3 + trip 10 + transfer 4 + (wait 6 + ride 6) + egress 1
    assert!((result.total_cost - 30.0).abs() < 1e-6);
}

// a bump-wait entry on the boarding stop disqualifies the boarding when the
// passenger cannot arrive before the bump time
#[test]
fn test_deterministic_bump_wait_dropout() {
    let params = SearchParams { time_window: 5.0, ..SearchParams::default() };

    // sanity: without the bump entry the path exists
    let finder = PathFinder::new(params.clone(), direct_trip_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(false, true, 490.0)).unwrap();
    assert!(result.path_found());

    // bumped long before we could get in line: the path must fail
    let mut finder = PathFinder::new(params.clone(), direct_trip_supply(), Path::new("."));
    let bump_index = array![[11, 1, 1]];
    let bump_times = array![470.0];
    finder.set_bump_wait(bump_index.view(), bump_times.view()).unwrap();
    let result = finder.find_path(&base_spec(false, true, 490.0)).unwrap();
    assert!(!result.path_found());

    // bumped just before boarding: the label absorbs the buffer but the trip
    // still works, and reconciliation restores the pure travel time
    let mut finder = PathFinder::new(params, direct_trip_supply(), Path::new("."));
    let bump_index = array![[11, 1, 1]];
    let bump_times = array![478.0];
    finder.set_bump_wait(bump_index.view(), bump_times.view()).unwrap();
    let result = finder.find_path(&base_spec(false, true, 490.0)).unwrap();
    assert!(result.path_found());
    assert!((result.total_cost - 10.0).abs() < 1e-6);
}

// reversing the search direction with the computed terminal time yields the
// same stops and trips
#[test]
fn test_outbound_inbound_reversal() {
    let finder = PathFinder::new(SearchParams::default(), direct_trip_supply(), Path::new("."));
    let outbound = finder.find_path(&base_spec(false, true, 490.0)).unwrap();
    assert!(outbound.path_found());
    // the outbound origin departure drives the inbound preferred time
    let origin_departure = outbound.path_real[[0, 1]];
    assert_eq!(origin_departure, 477.0);

    let inbound = finder.find_path(&base_spec(false, false, origin_departure)).unwrap();
    assert!(inbound.path_found());

    // same trip, same node chain, traversed in the opposite order
    assert_eq!(inbound.path_int.nrows(), outbound.path_int.nrows());
    assert_eq!(inbound.path_int[[1, 2]], outbound.path_int[[1, 2]]);
    let node_chain = |result: &rust_transit_pathfinder::FoundPath| -> Vec<i32> {
        let rows = result.path_int.nrows();
        let mut chain: Vec<i32> = (0..rows).map(|ii| result.path_int[[ii, 0]]).collect();
        chain.push(result.path_int[[rows - 1, 3]]);
        chain
    };
    let outbound_chain = node_chain(&outbound);
    let mut inbound_chain = node_chain(&inbound);
    inbound_chain.reverse();
    assert_eq!(outbound_chain, vec![100, 1, 2, 200]);
    assert_eq!(inbound_chain, outbound_chain);
    assert!((inbound.total_cost - outbound.total_cost).abs() < 1e-6);
}

// with a zero time window, a trip arriving strictly before the envelope time
// no longer qualifies
#[test]
fn test_zero_time_window_excludes_trips() {
    let params = SearchParams { time_window: 0.0, ..SearchParams::default() };
    let finder = PathFinder::new(params, direct_trip_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(false, true, 490.0)).unwrap();
    assert!(!result.path_found());
}

#[test]
fn test_missing_weights_is_user_error() {
    let finder = PathFinder::new(SearchParams::default(), direct_trip_supply(), Path::new("."));
    let mut spec = base_spec(false, true, 490.0);
    spec.user_class = String::from("nobody");
    assert!(finder.find_path(&spec).is_err());
}

#[test]
fn test_missing_access_coverage_is_user_error() {
    let finder = PathFinder::new(SearchParams::default(), direct_trip_supply(), Path::new("."));
    let mut spec = base_spec(false, true, 490.0);
    spec.destination_taz_id = 999;
    assert!(finder.find_path(&spec).is_err());
}

#[test]
fn test_hyperpath_finds_both_alternatives() {
    let params = SearchParams {
        stoch_dispersion: 0.5,
        stoch_pathset_size: 50,
        ..SearchParams::default()
    };
    let finder = PathFinder::new(params, two_alternative_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(true, true, 500.0)).unwrap();

    assert!(result.path_found());
    // whichever trip was drawn, the reconciled cost is one of the two
    // alternative costs
    let cost = result.total_cost;
    assert!((cost - 10.0).abs() < 1e-6 || (cost - 12.0).abs() < 1e-6);
    assert!(result.path_info.probability > 0.0);
    assert!(result.perf.label_iterations > 0);
}

// with costs 10 and 12 at dispersion 0.5, the cheaper path should be chosen
// with probability e^-5 / (e^-5 + e^-6), about 0.7311
#[test]
fn test_stochastic_choice_converges() {
    let params = SearchParams {
        stoch_dispersion: 0.5,
        stoch_pathset_size: 30,
        ..SearchParams::default()
    };
    let finder = PathFinder::new(params, two_alternative_supply(), Path::new("."));

    let num_draws = 400;
    let mut cheap_count = 0;
    for path_id in 0..num_draws {
        let mut spec = base_spec(true, true, 500.0);
        spec.path_id = path_id;
        let result = finder.find_path(&spec).unwrap();
        assert!(result.path_found());
        if (result.total_cost - 10.0).abs() < 1e-6 {
            cheap_count += 1;
        }
    }
    let frequency = cheap_count as f64 / num_draws as f64;
    let expected = 1.0 / (1.0 + (-1.0_f64).exp());
    assert!((frequency - expected).abs() < 0.08,
            "frequency {} too far from {}", frequency, expected);
}

#[test]
fn test_find_path_is_reproducible_per_path_id() {
    let params = SearchParams {
        stoch_dispersion: 0.5,
        stoch_pathset_size: 30,
        ..SearchParams::default()
    };
    let finder = PathFinder::new(params, two_alternative_supply(), Path::new("."));
    let mut spec = base_spec(true, true, 500.0);
    spec.path_id = 42;
    let first = finder.find_path(&spec).unwrap();
    let second = finder.find_path(&spec).unwrap();
    assert_eq!(first.path_int, second.path_int);
    assert_eq!(first.total_cost, second.total_cost);
}

#[test]
fn test_process_count_cap_of_one() {
    let params = SearchParams {
        stoch_dispersion: 0.5,
        stoch_pathset_size: 20,
        stoch_max_stop_process_count: 1,
        ..SearchParams::default()
    };
    let finder = PathFinder::new(params, two_alternative_supply(), Path::new("."));
    let result = finder.find_path(&base_spec(true, true, 500.0)).unwrap();
    assert!(result.path_found());
    assert_eq!(result.perf.max_process_count, 1);
}

// trace mode writes its artifacts but must not change computed outputs
#[test]
fn test_trace_outputs_do_not_change_results() {
    let trace_dir = tempfile::tempdir().unwrap();
    let finder_plain = PathFinder::new(SearchParams::default(), transfer_supply(),
                                       Path::new("."));
    let finder_traced = PathFinder::new(SearchParams::default(), transfer_supply(),
                                        trace_dir.path());

    let spec = base_spec(false, true, 530.0);
    let mut traced_spec = spec.clone();
    traced_spec.trace = true;

    let plain = finder_plain.find_path(&spec).unwrap();
    let traced = finder_traced.find_path(&traced_spec).unwrap();

    assert_eq!(plain.path_int, traced.path_int);
    assert!((plain.total_cost - traced.total_cost).abs() < 1e-12);

    assert!(trace_dir.path().join("pathfinder_trace_1.log").exists());
    assert!(trace_dir.path().join("pathfinder_labels_1.csv").exists());
}

// a stochastic traced run also writes the sampled pathset file
#[test]
fn test_trace_writes_pathset() {
    let trace_dir = tempfile::tempdir().unwrap();
    let params = SearchParams {
        stoch_dispersion: 0.5,
        stoch_pathset_size: 20,
        ..SearchParams::default()
    };
    let finder = PathFinder::new(params, two_alternative_supply(), trace_dir.path());
    let mut spec = base_spec(true, true, 500.0);
    spec.trace = true;
    let result = finder.find_path(&spec).unwrap();
    assert!(result.path_found());

    let pathset = std::fs::read_to_string(trace_dir.path().join("pathset.txt")).unwrap();
    assert!(!pathset.is_empty());
    // each line carries iteration, passenger, path id, cost, probability, and
    // the compact stop/trip lists
    let first_line = pathset.lines().next().unwrap();
    let fields: Vec<&str> = first_line.split_whitespace().collect();
    assert!(fields.len() >= 8);
    assert_eq!(fields[0], "1");
}
